//! Observer protocol for pool state transitions.

use tokio::sync::mpsc;

use crate::address::Address;
use crate::error::ConnectionErrorCode;
use crate::manager::ConnectionPoolManager;

/// Observes pool state transitions.
///
/// Each callback fires at most once per logical transition: a pool reports
/// `on_pool_down` before any subsequent `on_pool_up` for the same address,
/// and `on_pool_critical_error` is terminal for an address until it is
/// removed and re-added. Callbacks are invoked with no internal lock held,
/// so re-entrant manager calls (for example `remove` from inside
/// `on_pool_down`) are safe.
pub trait ConnectionPoolListener: Send + Sync {
    /// A pool gained its first live connection (or regained one after being
    /// down).
    fn on_pool_up(&self, _address: &Address) {}

    /// A pool lost its last live connection, or was removed while up.
    fn on_pool_down(&self, _address: &Address) {}

    /// A pool hit a fatal connection failure and stopped reconnecting.
    fn on_pool_critical_error(
        &self,
        _address: &Address,
        _code: ConnectionErrorCode,
        _message: &str,
    ) {
    }

    /// The manager finished closing all pools.
    fn on_close(&self, _manager: &ConnectionPoolManager) {}
}

/// A pool state transition as a value, for listeners that prefer message
/// passing over callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    /// A pool came up.
    Up(Address),
    /// A pool went down.
    Down(Address),
    /// A pool hit a fatal connection failure.
    CriticalError {
        /// The affected address.
        address: Address,
        /// Failure classification.
        code: ConnectionErrorCode,
        /// Human-readable detail.
        message: String,
    },
    /// The manager closed.
    Closed,
}

/// A listener that forwards every transition as a [`PoolEvent`] on an
/// unbounded channel.
#[derive(Debug)]
pub struct ChannelListener {
    events: mpsc::UnboundedSender<PoolEvent>,
}

impl ChannelListener {
    /// Create a listener and the receiving half of its event channel.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PoolEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        (Self { events }, receiver)
    }
}

impl ConnectionPoolListener for ChannelListener {
    fn on_pool_up(&self, address: &Address) {
        let _ = self.events.send(PoolEvent::Up(address.clone()));
    }

    fn on_pool_down(&self, address: &Address) {
        let _ = self.events.send(PoolEvent::Down(address.clone()));
    }

    fn on_pool_critical_error(
        &self,
        address: &Address,
        code: ConnectionErrorCode,
        message: &str,
    ) {
        let _ = self.events.send(PoolEvent::CriticalError {
            address: address.clone(),
            code,
            message: message.to_string(),
        });
    }

    fn on_close(&self, _manager: &ConnectionPoolManager) {
        let _ = self.events.send(PoolEvent::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_listener_forwards_events() {
        let (listener, mut events) = ChannelListener::new();
        let address = Address::new("127.0.0.1", 9042);

        listener.on_pool_up(&address);
        listener.on_pool_down(&address);
        listener.on_pool_critical_error(&address, ConnectionErrorCode::Auth, "denied");

        assert_eq!(events.recv().await, Some(PoolEvent::Up(address.clone())));
        assert_eq!(events.recv().await, Some(PoolEvent::Down(address.clone())));
        assert_eq!(
            events.recv().await,
            Some(PoolEvent::CriticalError {
                address,
                code: ConnectionErrorCode::Auth,
                message: "denied".to_string(),
            })
        );
    }
}
