//! Pool and connection configuration.

use std::sync::Arc;
use std::time::Duration;

use crate::auth::AuthProvider;
use crate::proto::ProtocolVersion;
use crate::tls::TlsSettings;

/// Configuration for a single connection attempt.
///
/// Shared by reference across all connectors; never mutated after the
/// manager is built.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Timeout covering the whole connect attempt, handshake included.
    pub connect_timeout: Duration,

    /// Protocol version requested during STARTUP.
    pub protocol_version: ProtocolVersion,

    /// TLS configuration; `None` for plaintext connections.
    pub tls: Option<TlsSettings>,

    /// Credentials provider; required if the server demands authentication.
    pub auth_provider: Option<Arc<dyn AuthProvider>>,

    /// Keyspace to select once the connection is ready.
    pub keyspace: Option<String>,

    /// Whether to set `TCP_NODELAY` on the socket.
    pub tcp_nodelay: bool,

    /// Maximum concurrent in-flight requests per connection. Writes past
    /// this cap are refused rather than queued. Values beyond the stream-id
    /// space are clamped; see
    /// [`effective_max_in_flight`](Self::effective_max_in_flight).
    pub max_in_flight: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            protocol_version: ProtocolVersion::default(),
            tls: None,
            auth_provider: None,
            keyspace: None,
            tcp_nodelay: true,
            max_in_flight: 1024,
        }
    }
}

impl ConnectionSettings {
    /// Create settings with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the connect timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the requested protocol version.
    #[must_use]
    pub fn protocol_version(mut self, version: ProtocolVersion) -> Self {
        self.protocol_version = version;
        self
    }

    /// Enable TLS.
    #[must_use]
    pub fn tls(mut self, tls: TlsSettings) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Install an authentication provider.
    #[must_use]
    pub fn auth_provider(mut self, provider: Arc<dyn AuthProvider>) -> Self {
        self.auth_provider = Some(provider);
        self
    }

    /// Select a keyspace after the handshake.
    #[must_use]
    pub fn keyspace(mut self, keyspace: impl Into<String>) -> Self {
        self.keyspace = Some(keyspace.into());
        self
    }

    /// The in-flight cap actually enforced on each connection.
    ///
    /// A connection can never have more requests outstanding than there are
    /// stream ids, so [`max_in_flight`](Self::max_in_flight) is clamped to
    /// [`MAX_STREAMS`](crate::proto::MAX_STREAMS).
    #[must_use]
    pub fn effective_max_in_flight(&self) -> usize {
        self.max_in_flight.min(crate::proto::MAX_STREAMS)
    }
}

/// Pool-level policy wrapping [`ConnectionSettings`].
///
/// Immutable after the manager is built.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Settings for each connection attempt.
    pub connection: ConnectionSettings,

    /// Target number of live connections per address.
    pub connections_per_host: usize,

    /// Wait between reconnection attempts. Zero means retry immediately.
    pub reconnect_wait: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            connection: ConnectionSettings::default(),
            connections_per_host: 1,
            reconnect_wait: Duration::from_secs(2),
        }
    }
}

impl PoolSettings {
    /// Create settings with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the connection settings.
    #[must_use]
    pub fn connection(mut self, connection: ConnectionSettings) -> Self {
        self.connection = connection;
        self
    }

    /// Set the target number of connections per address.
    #[must_use]
    pub fn connections_per_host(mut self, count: usize) -> Self {
        self.connections_per_host = count;
        self
    }

    /// Set the reconnection wait time.
    #[must_use]
    pub fn reconnect_wait(mut self, wait: Duration) -> Self {
        self.reconnect_wait = wait;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = PoolSettings::default();
        assert_eq!(settings.connections_per_host, 1);
        assert_eq!(settings.reconnect_wait, Duration::from_secs(2));
        assert_eq!(settings.connection.connect_timeout, Duration::from_secs(5));
        assert_eq!(settings.connection.protocol_version, ProtocolVersion::V4);
        assert!(settings.connection.tls.is_none());
        assert!(settings.connection.auth_provider.is_none());
        assert!(settings.connection.keyspace.is_none());
    }

    #[test]
    fn test_in_flight_cap_bounded_by_stream_ids() {
        let mut settings = ConnectionSettings::new();
        settings.max_in_flight = usize::MAX;
        assert_eq!(
            settings.effective_max_in_flight(),
            crate::proto::MAX_STREAMS
        );

        settings.max_in_flight = 8;
        assert_eq!(settings.effective_max_in_flight(), 8);
    }

    #[test]
    fn test_builder_fluent() {
        let settings = PoolSettings::new()
            .connections_per_host(4)
            .reconnect_wait(Duration::ZERO)
            .connection(
                ConnectionSettings::new()
                    .connect_timeout(Duration::from_millis(200))
                    .keyspace("foo"),
            );

        assert_eq!(settings.connections_per_host, 4);
        assert_eq!(settings.reconnect_wait, Duration::ZERO);
        assert_eq!(
            settings.connection.connect_timeout,
            Duration::from_millis(200)
        );
        assert_eq!(settings.connection.keyspace.as_deref(), Some("foo"));
    }
}
