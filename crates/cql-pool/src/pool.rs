//! Per-address connection pool with reconnection.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::address::Address;
use crate::connection::PooledConnection;
use crate::connector::Connector;
use crate::error::ConnectError;
use crate::manager::ConnectionPoolManager;
use crate::settings::PoolSettings;

/// Terminal per-address outcome observed by the initializer during
/// bootstrap.
#[derive(Debug)]
pub(crate) enum BootstrapOutcome {
    /// At least one connection came up.
    Up,
    /// Every initial attempt failed retryably; the pool stays and keeps
    /// reconnecting.
    Down,
    /// A fatal failure; the pool will not reconnect.
    Critical(ConnectError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PoolPhase {
    /// Initial fill in progress, nothing has come up yet.
    Connecting,
    /// Normal operation; may be temporarily down to zero connections while
    /// reconnection is scheduled.
    Ready,
    /// A fatal failure stopped reconnection. Terminal until the address is
    /// removed and re-added.
    Critical,
    /// Closed. Terminal.
    Closed,
}

/// Last edge-triggered up/down event reported for this pool. Down fires
/// once per up-to-down transition (including a bootstrap that never came
/// up); repeated failed reconnects while already down stay silent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LastEvent {
    None,
    Up,
    Down,
}

struct PoolInner {
    phase: PoolPhase,
    connections: Vec<Arc<PooledConnection>>,
    pending_connects: usize,
    reconnect_scheduled: bool,
    last_event: LastEvent,
    bootstrap: Option<oneshot::Sender<BootstrapOutcome>>,
}

impl PoolInner {
    fn live(&self) -> usize {
        self.connections
            .iter()
            .filter(|connection| !connection.is_closed())
            .count()
    }
}

/// Owns the connections to exactly one address.
///
/// The pool spawns one connector per missing connection, admits successes,
/// schedules at most one reconnection timer at a time for retryable
/// failures, and transitions to a terminal critical state on fatal
/// failures. All listener events are reported through the owning manager.
pub struct ConnectionPool {
    address: Address,
    settings: Arc<PoolSettings>,
    manager: Weak<ConnectionPoolManager>,
    cancel: CancellationToken,
    inner: Mutex<PoolInner>,
}

impl ConnectionPool {
    /// Create the pool and begin filling it to the configured target.
    pub(crate) fn spawn(
        address: Address,
        settings: Arc<PoolSettings>,
        manager: Weak<ConnectionPoolManager>,
        bootstrap: Option<oneshot::Sender<BootstrapOutcome>>,
    ) -> Arc<Self> {
        let pool = Arc::new(Self {
            address,
            settings,
            manager,
            cancel: CancellationToken::new(),
            inner: Mutex::new(PoolInner {
                phase: PoolPhase::Connecting,
                connections: Vec::new(),
                pending_connects: 0,
                reconnect_scheduled: false,
                last_event: LastEvent::None,
                bootstrap,
            }),
        });
        tracing::debug!(address = %pool.address, "connection pool created");
        pool.ensure_capacity();
        pool
    }

    /// The address this pool serves.
    #[must_use]
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// The live connection with the fewest in-flight requests, if any.
    #[must_use]
    pub fn find_least_busy(&self) -> Option<Arc<PooledConnection>> {
        let inner = self.inner.lock();
        inner
            .connections
            .iter()
            .filter(|connection| !connection.is_closed())
            .min_by_key(|connection| connection.in_flight())
            .cloned()
    }

    /// Flush buffered writes on every connection.
    pub(crate) fn flush(&self) {
        let connections: Vec<_> = self.inner.lock().connections.clone();
        for connection in connections {
            connection.flush();
        }
    }

    /// Close every connection and cancel pending reconnection and
    /// in-flight connectors. Fires a final down event if the pool was up.
    pub(crate) fn close(&self) {
        let (was_up, connections, bootstrap) = {
            let mut inner = self.inner.lock();
            if inner.phase == PoolPhase::Closed {
                return;
            }
            let was_up = inner.last_event == LastEvent::Up;
            inner.phase = PoolPhase::Closed;
            if was_up {
                inner.last_event = LastEvent::Down;
            }
            (
                was_up,
                std::mem::take(&mut inner.connections),
                inner.bootstrap.take(),
            )
        };

        self.cancel.cancel();
        for connection in connections {
            connection.close();
        }
        if let Some(bootstrap) = bootstrap {
            let _ = bootstrap.send(BootstrapOutcome::Down);
        }
        tracing::debug!(address = %self.address, "connection pool closed");
        if was_up {
            self.notify_down();
        }
    }

    /// Compare the live connection count to the target and spawn a
    /// connector per missing connection.
    fn ensure_capacity(self: &Arc<Self>) {
        let spawn_count = {
            let mut inner = self.inner.lock();
            if !matches!(inner.phase, PoolPhase::Connecting | PoolPhase::Ready) {
                return;
            }
            let occupied = inner.live() + inner.pending_connects;
            let deficit = self
                .settings
                .connections_per_host
                .saturating_sub(occupied);
            inner.pending_connects += deficit;
            deficit
        };

        for _ in 0..spawn_count {
            let pool = Arc::clone(self);
            let cancel = self.cancel.clone();
            let connector = Connector::new(
                self.address.clone(),
                Arc::new(self.settings.connection.clone()),
            );
            tokio::spawn(async move {
                tokio::select! {
                    // Cancelled connectors are stale: their result must be
                    // discarded, not attributed to a newer pool.
                    _ = cancel.cancelled() => {}
                    result = connector.connect() => match result {
                        Ok(connection) => pool.on_connector_success(connection),
                        Err(error) => pool.on_connector_failure(error),
                    },
                }
            });
        }
    }

    fn on_connector_success(self: &Arc<Self>, connection: PooledConnection) {
        let connection = Arc::new(connection);
        let (admitted, notify_up, bootstrap) = {
            let mut inner = self.inner.lock();
            inner.pending_connects = inner.pending_connects.saturating_sub(1);
            if !matches!(inner.phase, PoolPhase::Connecting | PoolPhase::Ready) {
                (false, false, None)
            } else {
                inner.connections.push(Arc::clone(&connection));
                inner.phase = PoolPhase::Ready;
                let notify_up = inner.last_event != LastEvent::Up;
                if notify_up {
                    inner.last_event = LastEvent::Up;
                }
                (true, notify_up, inner.bootstrap.take())
            }
        };

        if !admitted {
            connection.close();
            return;
        }

        tracing::debug!(address = %self.address, "connection admitted to pool");
        self.watch_connection(connection);
        if notify_up {
            self.notify_up();
        }
        if let Some(bootstrap) = bootstrap {
            let _ = bootstrap.send(BootstrapOutcome::Up);
        }
    }

    fn on_connector_failure(self: &Arc<Self>, error: ConnectError) {
        let code = error.code();
        let message = error.to_string();

        let (went_critical, notify_down, schedule, bootstrap) = {
            let mut inner = self.inner.lock();
            inner.pending_connects = inner.pending_connects.saturating_sub(1);
            if !matches!(inner.phase, PoolPhase::Connecting | PoolPhase::Ready) {
                return;
            }
            if error.is_fatal() {
                inner.phase = PoolPhase::Critical;
                inner.reconnect_scheduled = false;
                (true, false, false, inner.bootstrap.take())
            } else {
                let (notify_down, bootstrap) = self.evaluate_down(&mut inner);
                let schedule = self.should_schedule(&mut inner);
                (false, notify_down, schedule, bootstrap)
            }
        };

        if went_critical {
            tracing::warn!(address = %self.address, error = %message, "fatal connection error, pool stopped");
            self.notify_critical(code, &message);
            if let Some(sender) = bootstrap {
                let _ = sender.send(BootstrapOutcome::Critical(error));
            }
            return;
        }

        tracing::debug!(address = %self.address, error = %message, "connection attempt failed");
        if let Some(sender) = bootstrap {
            let _ = sender.send(BootstrapOutcome::Down);
        }
        if notify_down {
            self.notify_down();
        }
        if schedule {
            self.schedule_reconnect();
        }
    }

    /// Spawn a task that reports the connection back to the pool once its
    /// I/O task ends.
    fn watch_connection(self: &Arc<Self>, connection: Arc<PooledConnection>) {
        let pool = Arc::clone(self);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                () = connection.closed() => pool.on_connection_closed(&connection),
            }
        });
    }

    fn on_connection_closed(self: &Arc<Self>, connection: &Arc<PooledConnection>) {
        let (notify_down, schedule, bootstrap) = {
            let mut inner = self.inner.lock();
            if !matches!(inner.phase, PoolPhase::Connecting | PoolPhase::Ready) {
                return;
            }
            inner
                .connections
                .retain(|candidate| !Arc::ptr_eq(candidate, connection));
            let (notify_down, bootstrap) = self.evaluate_down(&mut inner);
            let schedule = self.should_schedule(&mut inner);
            (notify_down, schedule, bootstrap)
        };

        tracing::debug!(address = %self.address, "lost connection");
        if let Some(sender) = bootstrap {
            let _ = sender.send(BootstrapOutcome::Down);
        }
        if notify_down {
            self.notify_down();
        }
        if schedule {
            self.schedule_reconnect();
        }
    }

    /// Detect the up-to-down edge: the pool is down once no connection is
    /// live and no connector is still in flight.
    fn evaluate_down(
        &self,
        inner: &mut PoolInner,
    ) -> (bool, Option<oneshot::Sender<BootstrapOutcome>>) {
        if inner.live() > 0 || inner.pending_connects > 0 {
            return (false, None);
        }
        let notify = inner.last_event != LastEvent::Down;
        if notify {
            inner.last_event = LastEvent::Down;
        }
        (notify, inner.bootstrap.take())
    }

    /// At most one reconnection timer may be pending per pool.
    fn should_schedule(&self, inner: &mut PoolInner) -> bool {
        let deficit =
            inner.live() + inner.pending_connects < self.settings.connections_per_host;
        if deficit && !inner.reconnect_scheduled {
            inner.reconnect_scheduled = true;
            true
        } else {
            false
        }
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        let wait = self.settings.reconnect_wait;
        tracing::debug!(address = %self.address, ?wait, "reconnect scheduled");
        let pool = Arc::clone(self);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                () = tokio::time::sleep(wait) => {}
            }
            pool.inner.lock().reconnect_scheduled = false;
            pool.ensure_capacity();
        });
    }

    fn notify_up(&self) {
        if let Some(manager) = self.manager.upgrade() {
            manager.notify_pool_up(&self.address);
        }
    }

    fn notify_down(&self) {
        if let Some(manager) = self.manager.upgrade() {
            manager.notify_pool_down(&self.address);
        }
    }

    fn notify_critical(&self, code: crate::error::ConnectionErrorCode, message: &str) {
        if let Some(manager) = self.manager.upgrade() {
            manager.notify_pool_critical_error(&self.address, code, message);
        }
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ConnectionPool")
            .field("address", &self.address)
            .field("phase", &inner.phase)
            .field("connections", &inner.connections.len())
            .field("pending_connects", &inner.pending_connects)
            .finish()
    }
}
