//! Bootstrap orchestration for the pool manager.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::oneshot;

use crate::address::Address;
use crate::error::{AllAddressesFailed, ConnectFailure};
use crate::listener::ConnectionPoolListener;
use crate::manager::ConnectionPoolManager;
use crate::pool::BootstrapOutcome;
use crate::proto::ProtocolVersion;
use crate::settings::PoolSettings;

/// Bootstraps a [`ConnectionPoolManager`] by connecting to every address
/// concurrently and waiting for each to reach a terminal outcome.
///
/// This is a partial-failure-tolerant join: a fatal failure on one address
/// never aborts the others, and the initializer always waits for every
/// address to resolve. Addresses that fail fatally are absent from the
/// resulting manager and recorded in the failure list; addresses that fail
/// retryably keep their (down) pool, which continues reconnecting.
///
/// Configuration is frozen when [`initialize`](Self::initialize) consumes
/// the builder.
///
/// # Example
///
/// ```rust,ignore
/// let initialized = ConnectionPoolManagerInitializer::new(ProtocolVersion::V4)
///     .with_settings(settings)
///     .with_keyspace("store")
///     .with_listener(listener)
///     .initialize(addresses)
///     .await;
///
/// let manager = initialized.into_manager()?;
/// ```
pub struct ConnectionPoolManagerInitializer {
    protocol_version: ProtocolVersion,
    settings: Option<PoolSettings>,
    keyspace: Option<String>,
    listener: Option<Arc<dyn ConnectionPoolListener>>,
}

impl ConnectionPoolManagerInitializer {
    /// Create an initializer requesting the given protocol version.
    #[must_use]
    pub fn new(protocol_version: ProtocolVersion) -> Self {
        Self {
            protocol_version,
            settings: None,
            keyspace: None,
            listener: None,
        }
    }

    /// Override the default pool settings.
    ///
    /// The protocol version passed to [`new`](Self::new) takes precedence
    /// over the one embedded in the settings.
    #[must_use]
    pub fn with_settings(mut self, settings: PoolSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Select a keyspace on every connection after its handshake.
    #[must_use]
    pub fn with_keyspace(mut self, keyspace: impl Into<String>) -> Self {
        self.keyspace = Some(keyspace.into());
        self
    }

    /// Install a listener; it observes events from bootstrap onward.
    #[must_use]
    pub fn with_listener(mut self, listener: Arc<dyn ConnectionPoolListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Connect to every address concurrently and wait until each reaches a
    /// terminal outcome.
    ///
    /// An empty address list completes immediately with an empty manager.
    /// Duplicate addresses are pooled once.
    pub async fn initialize(self, addresses: Vec<Address>) -> InitializedManager {
        let mut settings = self.settings.unwrap_or_default();
        settings.connection.protocol_version = self.protocol_version;
        if let Some(keyspace) = self.keyspace {
            settings.connection.keyspace = Some(keyspace);
        }

        tracing::info!(
            addresses = addresses.len(),
            version = %settings.connection.protocol_version,
            "initializing connection pools"
        );
        let manager = ConnectionPoolManager::new(settings, self.listener);

        let mut seen = HashSet::new();
        let mut waits = Vec::with_capacity(addresses.len());
        for address in addresses {
            if !seen.insert(address.clone()) {
                continue;
            }
            let (outcome_tx, outcome_rx) = oneshot::channel();
            if manager.add_pool(address.clone(), Some(outcome_tx)) {
                waits.push((address, outcome_rx));
            }
        }

        let mut failures = Vec::new();
        for (address, outcome_rx) in waits {
            match outcome_rx.await {
                Ok(BootstrapOutcome::Up | BootstrapOutcome::Down) | Err(_) => {}
                Ok(BootstrapOutcome::Critical(error)) => {
                    manager.discard(&address);
                    failures.push(ConnectFailure { address, error });
                }
            }
        }

        tracing::info!(
            pooled = manager.pool_count(),
            failed = failures.len(),
            "connection pool bootstrap complete"
        );
        InitializedManager { manager, failures }
    }
}

/// The result of [`ConnectionPoolManagerInitializer::initialize`].
///
/// Ownership of the pooled connections has moved to the manager; the
/// failure list remains queryable for diagnostics after handoff.
#[derive(Debug)]
pub struct InitializedManager {
    manager: Arc<ConnectionPoolManager>,
    failures: Vec<ConnectFailure>,
}

impl InitializedManager {
    /// The bootstrapped manager.
    #[must_use]
    pub fn manager(&self) -> Arc<ConnectionPoolManager> {
        Arc::clone(&self.manager)
    }

    /// Per-address fatal failures recorded during bootstrap.
    #[must_use]
    pub fn failures(&self) -> &[ConnectFailure] {
        &self.failures
    }

    /// Take the manager, or the aggregate error if every address failed.
    pub fn into_manager(self) -> Result<Arc<ConnectionPoolManager>, AllAddressesFailed> {
        if self.manager.pool_count() == 0 && !self.failures.is_empty() {
            Err(AllAddressesFailed {
                failures: self.failures,
            })
        } else {
            Ok(self.manager)
        }
    }
}
