//! Owner of all per-address pools.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::address::Address;
use crate::connection::PooledConnection;
use crate::error::ConnectionErrorCode;
use crate::listener::ConnectionPoolListener;
use crate::pool::{BootstrapOutcome, ConnectionPool};
use crate::settings::PoolSettings;

/// Owns the address-to-pool map for a connected topology.
///
/// Built only through the
/// [`ConnectionPoolManagerInitializer`](crate::ConnectionPoolManagerInitializer),
/// which guarantees the manager starts from a consistent, fully negotiated
/// view of its initial address set. After handoff the manager runs
/// autonomously: pools self-heal via reconnection and the manager forwards
/// topology changes and listener events.
pub struct ConnectionPoolManager {
    settings: Arc<PoolSettings>,
    pools: Mutex<HashMap<Address, Arc<ConnectionPool>>>,
    listener: Mutex<Option<Arc<dyn ConnectionPoolListener>>>,
    closed: AtomicBool,
}

impl ConnectionPoolManager {
    pub(crate) fn new(
        settings: PoolSettings,
        listener: Option<Arc<dyn ConnectionPoolListener>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            settings: Arc::new(settings),
            pools: Mutex::new(HashMap::new()),
            listener: Mutex::new(listener),
            closed: AtomicBool::new(false),
        })
    }

    /// The pool settings this manager was built with.
    #[must_use]
    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// The live connection to `address` with the fewest in-flight requests.
    ///
    /// Returns `None` if the address is unknown, removed, or currently has
    /// no ready connection. The returned handle is a non-owning,
    /// time-bounded view; do not cache it across suspension points.
    #[must_use]
    pub fn find_least_busy(&self, address: &Address) -> Option<Arc<PooledConnection>> {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        let pool = self.pools.lock().get(address).cloned()?;
        pool.find_least_busy()
    }

    /// Begin pooling connections to a new address.
    ///
    /// No-op if the address is already pooled or the manager is closed.
    /// Up/down/critical events for the new pool fire asynchronously as it
    /// resolves.
    pub fn add(self: &Arc<Self>, address: Address) {
        self.add_pool(address, None);
    }

    pub(crate) fn add_pool(
        self: &Arc<Self>,
        address: Address,
        bootstrap: Option<oneshot::Sender<BootstrapOutcome>>,
    ) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        let mut pools = self.pools.lock();
        if pools.contains_key(&address) {
            return false;
        }
        let pool = ConnectionPool::spawn(
            address.clone(),
            Arc::clone(&self.settings),
            Arc::downgrade(self),
            bootstrap,
        );
        pools.insert(address, pool);
        true
    }

    /// Stop pooling an address and close its connections.
    ///
    /// The address disappears from the lookup map synchronously: a
    /// `find_least_busy` immediately after `remove` returns `None` even
    /// while the close I/O is still completing. No-op if the address is
    /// unknown.
    pub fn remove(&self, address: &Address) {
        let pool = self.pools.lock().remove(address);
        if let Some(pool) = pool {
            tracing::debug!(%address, "removing pool");
            pool.close();
        }
    }

    /// Drop a pool that failed bootstrap without reporting further events.
    pub(crate) fn discard(&self, address: &Address) {
        let pool = self.pools.lock().remove(address);
        if let Some(pool) = pool {
            pool.close();
        }
    }

    /// Flush buffered writes on every pooled connection.
    ///
    /// Purely a performance hint: it batches buffered request writes to the
    /// socket layer.
    pub fn flush(&self) {
        let pools: Vec<_> = self.pools.lock().values().cloned().collect();
        for pool in pools {
            pool.flush();
        }
    }

    /// Number of addresses currently pooled.
    #[must_use]
    pub fn pool_count(&self) -> usize {
        self.pools.lock().len()
    }

    /// Addresses currently pooled, in no particular order.
    #[must_use]
    pub fn addresses(&self) -> Vec<Address> {
        self.pools.lock().keys().cloned().collect()
    }

    /// Close every pool and release the listener.
    ///
    /// Idempotent: only the first call closes pools and fires the
    /// listener's close notification.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!(pools = self.pool_count(), "closing connection pool manager");

        let pools: Vec<_> = {
            let mut map = self.pools.lock();
            map.drain().map(|(_, pool)| pool).collect()
        };
        for pool in pools {
            pool.close();
        }

        let listener = self.listener.lock().take();
        if let Some(listener) = listener {
            listener.on_close(self);
        }
    }

    /// The currently installed listener, if any.
    #[must_use]
    pub fn listener(&self) -> Option<Arc<dyn ConnectionPoolListener>> {
        self.listener.lock().clone()
    }

    /// Replace (or clear) the installed listener.
    pub fn set_listener(&self, listener: Option<Arc<dyn ConnectionPoolListener>>) {
        *self.listener.lock() = listener;
    }

    // Event dispatch from pools. The listener is invoked with no internal
    // lock held, so listeners may re-enter the manager.

    pub(crate) fn notify_pool_up(&self, address: &Address) {
        tracing::info!(%address, "pool up");
        if let Some(listener) = self.listener() {
            listener.on_pool_up(address);
        }
    }

    pub(crate) fn notify_pool_down(&self, address: &Address) {
        tracing::info!(%address, "pool down");
        if let Some(listener) = self.listener() {
            listener.on_pool_down(address);
        }
    }

    pub(crate) fn notify_pool_critical_error(
        &self,
        address: &Address,
        code: ConnectionErrorCode,
        message: &str,
    ) {
        tracing::warn!(%address, ?code, message, "pool critical error");
        if let Some(listener) = self.listener() {
            listener.on_pool_critical_error(address, code, message);
        }
    }
}

impl std::fmt::Debug for ConnectionPoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPoolManager")
            .field("pools", &self.pool_count())
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}
