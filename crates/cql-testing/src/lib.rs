//! Mock cluster infrastructure for connection pool testing.
//!
//! A [`MockCluster`] runs one lightweight in-process server per node, each
//! speaking just enough of the wire protocol to exercise the pool's
//! handshake phases: version negotiation, password authentication, and
//! keyspace selection. Nodes can be started and stopped individually to
//! simulate churn; a stopped node drops its listener and every open
//! connection at once.
//!
//! ## Example
//!
//! ```rust,ignore
//! let mut cluster = MockCluster::builder()
//!     .nodes(3)
//!     .keyspace("foo")
//!     .build()?;
//! cluster.start_all()?;
//!
//! // drive the pool against cluster.addresses() ...
//!
//! cluster.stop(0); // simulate a node going away
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use rcgen::{CertificateParams, KeyPair, SanType};
use rustls::pki_types::PrivatePkcs8KeyDer;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use cql_pool::Address;
use cql_pool::proto::{ErrorCode, Frame, FrameCodec, Message, ResultKind};

/// Behavior shared by every node in a cluster.
#[derive(Debug, Clone)]
struct ClusterConfig {
    max_protocol_version: u8,
    credentials: Option<(String, String)>,
    keyspaces: Vec<String>,
    respond_startup: bool,
}

/// Builder for a [`MockCluster`].
#[derive(Debug, Clone)]
pub struct ClusterBuilder {
    nodes: usize,
    tls: bool,
    config: ClusterConfig,
}

impl ClusterBuilder {
    /// Set the number of nodes (default: 3).
    #[must_use]
    pub fn nodes(mut self, nodes: usize) -> Self {
        self.nodes = nodes;
        self
    }

    /// Set the highest protocol version the nodes accept (default: 4).
    #[must_use]
    pub fn max_protocol_version(mut self, version: u8) -> Self {
        self.config.max_protocol_version = version;
        self
    }

    /// Require password authentication with the given credentials.
    #[must_use]
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.config.credentials = Some((username.into(), password.into()));
        self
    }

    /// Register a keyspace that `USE` requests may select.
    #[must_use]
    pub fn keyspace(mut self, keyspace: impl Into<String>) -> Self {
        self.config.keyspaces.push(keyspace.into());
        self
    }

    /// When disabled, nodes accept connections but never answer STARTUP.
    /// Used to exercise connect timeouts.
    #[must_use]
    pub fn respond_startup(mut self, respond: bool) -> Self {
        self.config.respond_startup = respond;
        self
    }

    /// Serve TLS on every node with a freshly generated self-signed
    /// certificate. Clients can trust it via
    /// [`MockCluster::certificate_pem`].
    #[must_use]
    pub fn tls(mut self) -> Self {
        self.tls = true;
        self
    }

    /// Allocate node addresses and build the cluster. Nodes are not
    /// started yet.
    pub fn build(self) -> io::Result<MockCluster> {
        let tls = if self.tls {
            Some(TlsContext::generate()?)
        } else {
            None
        };
        let config = Arc::new(self.config);
        let mut nodes = Vec::with_capacity(self.nodes);
        for _ in 0..self.nodes {
            // Bind to an ephemeral port to reserve a stable address for the
            // node's lifetime, then release it until start().
            let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
            let addr = listener.local_addr()?;
            drop(listener);
            nodes.push(MockNode {
                addr,
                shutdown: None,
            });
        }
        Ok(MockCluster { config, nodes, tls })
    }
}

impl Default for ClusterBuilder {
    fn default() -> Self {
        Self {
            nodes: 3,
            tls: false,
            config: ClusterConfig {
                max_protocol_version: 4,
                credentials: None,
                keyspaces: Vec::new(),
                respond_startup: true,
            },
        }
    }
}

struct MockNode {
    addr: SocketAddr,
    shutdown: Option<CancellationToken>,
}

/// Server-side TLS material shared by every node in a cluster.
struct TlsContext {
    acceptor: TlsAcceptor,
    cert_pem: String,
}

impl TlsContext {
    /// Generate a self-signed certificate valid for the loopback address
    /// and wrap it in an acceptor.
    fn generate() -> io::Result<Self> {
        let mut params = CertificateParams::default();
        params
            .subject_alt_names
            .push(SanType::IpAddress(std::net::IpAddr::V4(
                std::net::Ipv4Addr::LOCALHOST,
            )));
        params.subject_alt_names.push(SanType::DnsName(
            "localhost".to_string().try_into().map_err(io::Error::other)?,
        ));

        let key_pair = KeyPair::generate().map_err(io::Error::other)?;
        let cert = params.self_signed(&key_pair).map_err(io::Error::other)?;

        let key = PrivatePkcs8KeyDer::from(key_pair.serialize_der());
        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert.der().clone()], key.into())
            .map_err(io::Error::other)?;

        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(config)),
            cert_pem: cert.pem(),
        })
    }
}

/// A cluster of in-process mock nodes with stable addresses.
pub struct MockCluster {
    config: Arc<ClusterConfig>,
    nodes: Vec<MockNode>,
    tls: Option<TlsContext>,
}

impl MockCluster {
    /// Start building a cluster.
    #[must_use]
    pub fn builder() -> ClusterBuilder {
        ClusterBuilder::default()
    }

    /// Build a plain cluster with `nodes` nodes.
    pub fn new(nodes: usize) -> io::Result<Self> {
        Self::builder().nodes(nodes).build()
    }

    /// The addresses of all nodes, started or not.
    #[must_use]
    pub fn addresses(&self) -> Vec<Address> {
        self.nodes.iter().map(|node| node.addr.into()).collect()
    }

    /// The address of one node.
    #[must_use]
    pub fn address(&self, index: usize) -> Address {
        self.nodes[index].addr.into()
    }

    /// The PEM-encoded certificate the nodes serve, if TLS is enabled.
    #[must_use]
    pub fn certificate_pem(&self) -> Option<&str> {
        self.tls.as_ref().map(|tls| tls.cert_pem.as_str())
    }

    /// Start one node. No-op if it is already running.
    pub fn start(&mut self, index: usize) -> io::Result<()> {
        let node = &mut self.nodes[index];
        if node.shutdown.is_some() {
            return Ok(());
        }
        let listener = bind_reuse(node.addr)?;
        let shutdown = CancellationToken::new();
        tokio::spawn(run_node(
            listener,
            Arc::clone(&self.config),
            self.tls.as_ref().map(|tls| tls.acceptor.clone()),
            shutdown.clone(),
        ));
        tracing::debug!(addr = %node.addr, "mock node started");
        node.shutdown = Some(shutdown);
        Ok(())
    }

    /// Start every node.
    pub fn start_all(&mut self) -> io::Result<()> {
        for index in 0..self.nodes.len() {
            self.start(index)?;
        }
        Ok(())
    }

    /// Stop one node, dropping its listener and every open connection.
    /// No-op if it is not running.
    pub fn stop(&mut self, index: usize) {
        if let Some(shutdown) = self.nodes[index].shutdown.take() {
            tracing::debug!(addr = %self.nodes[index].addr, "mock node stopped");
            shutdown.cancel();
        }
    }

    /// Stop every node.
    pub fn stop_all(&mut self) {
        for index in 0..self.nodes.len() {
            self.stop(index);
        }
    }
}

impl Drop for MockCluster {
    fn drop(&mut self) {
        self.stop_all();
    }
}

// A stopped node leaves connections in TIME_WAIT on its port; SO_REUSEADDR
// lets a restart rebind the same address.
fn bind_reuse(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(64)
}

async fn run_node(
    listener: TcpListener,
    config: Arc<ClusterConfig>,
    acceptor: Option<TlsAcceptor>,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => return,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, _)) => {
                tokio::spawn(handle_stream(
                    stream,
                    Arc::clone(&config),
                    acceptor.clone(),
                    shutdown.clone(),
                ));
            }
            Err(error) => {
                tracing::debug!(%error, "mock node accept failed");
            }
        }
    }
}

async fn handle_stream(
    stream: TcpStream,
    config: Arc<ClusterConfig>,
    acceptor: Option<TlsAcceptor>,
    shutdown: CancellationToken,
) {
    let Some(acceptor) = acceptor else {
        return serve_connection(stream, config, shutdown).await;
    };
    let accepted = tokio::select! {
        _ = shutdown.cancelled() => return,
        accepted = acceptor.accept(stream) => accepted,
    };
    match accepted {
        Ok(stream) => serve_connection(stream, config, shutdown).await,
        // A plaintext client against a TLS node fails the handshake; drop
        // the connection.
        Err(error) => tracing::debug!(%error, "mock node TLS accept failed"),
    }
}

async fn serve_connection<S>(stream: S, config: Arc<ClusterConfig>, shutdown: CancellationToken)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(stream, FrameCodec::new());
    let mut authenticated = config.credentials.is_none();

    loop {
        let incoming = tokio::select! {
            _ = shutdown.cancelled() => return,
            incoming = framed.next() => incoming,
        };
        let frame = match incoming {
            Some(Ok(frame)) => frame,
            // Garbage on the wire (for example a TLS ClientHello against a
            // plaintext node) tears the connection down.
            Some(Err(_)) | None => return,
        };
        let Some(reply) = handle_frame(&frame, &config, &mut authenticated) else {
            continue;
        };
        if framed.send(reply).await.is_err() {
            return;
        }
    }
}

fn handle_frame(frame: &Frame, config: &ClusterConfig, authenticated: &mut bool) -> Option<Frame> {
    let version = frame.version.value();
    if version == 0 || version > config.max_protocol_version {
        return Some(reply(
            frame,
            Message::Error {
                code: ErrorCode::Protocol,
                message: format!("Invalid or unsupported protocol version: {version}"),
            },
        ));
    }

    let message = match &frame.message {
        Message::Startup => {
            if !config.respond_startup {
                return None;
            }
            if *authenticated {
                Message::Ready
            } else {
                Message::Authenticate("PasswordAuthenticator".to_string())
            }
        }
        Message::AuthResponse(token) => match &config.credentials {
            Some(expected) if parse_plain_token(token).as_ref() == Some(expected) => {
                *authenticated = true;
                Message::AuthSuccess
            }
            _ => Message::Error {
                code: ErrorCode::BadCredentials,
                message: "Bad credentials".to_string(),
            },
        },
        Message::Query(query) if !*authenticated => {
            let _ = query;
            Message::Error {
                code: ErrorCode::Server,
                message: "Not authenticated".to_string(),
            }
        }
        Message::Query(query) => match query.strip_prefix("USE ") {
            Some(keyspace) => {
                let keyspace = keyspace.trim().trim_matches('"');
                if config.keyspaces.iter().any(|known| known == keyspace) {
                    Message::Result(ResultKind::SetKeyspace(keyspace.to_string()))
                } else {
                    Message::Error {
                        code: ErrorCode::Invalid,
                        message: format!("Keyspace '{keyspace}' does not exist"),
                    }
                }
            }
            None => Message::Result(ResultKind::Void),
        },
        _ => Message::Error {
            code: ErrorCode::Server,
            message: "Unexpected message".to_string(),
        },
    };
    Some(reply(frame, message))
}

fn reply(request: &Frame, message: Message) -> Frame {
    Frame {
        version: request.version,
        stream: request.stream,
        message,
    }
}

fn parse_plain_token(token: &Bytes) -> Option<(String, String)> {
    let mut parts = token.split(|byte| *byte == 0);
    // SASL PLAIN: authzid \0 authcid \0 password
    let _authzid = parts.next()?;
    let username = String::from_utf8(parts.next()?.to_vec()).ok()?;
    let password = String::from_utf8(parts.next()?.to_vec()).ok()?;
    Some((username, password))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cql_pool::ProtocolVersion;

    fn frame(message: Message) -> Frame {
        Frame {
            version: ProtocolVersion::V4,
            stream: 1,
            message,
        }
    }

    #[test]
    fn test_startup_ready_without_auth() {
        let config = ClusterBuilder::default().config;
        let mut authenticated = config.credentials.is_none();
        let reply = handle_frame(&frame(Message::Startup), &config, &mut authenticated).unwrap();
        assert_eq!(reply.message, Message::Ready);
    }

    #[test]
    fn test_unsupported_version_rejected() {
        let config = ClusterBuilder::default().config;
        let mut authenticated = true;
        let request = Frame {
            version: ProtocolVersion::new(0x7F),
            stream: 0,
            message: Message::Startup,
        };
        let reply = handle_frame(&request, &config, &mut authenticated).unwrap();
        assert!(matches!(
            reply.message,
            Message::Error {
                code: ErrorCode::Protocol,
                ..
            }
        ));
    }

    #[test]
    fn test_auth_flow() {
        let config = ClusterBuilder::default()
            .credentials("cassandra", "cassandra")
            .config;
        let mut authenticated = config.credentials.is_none();

        let reply = handle_frame(&frame(Message::Startup), &config, &mut authenticated).unwrap();
        assert_eq!(
            reply.message,
            Message::Authenticate("PasswordAuthenticator".to_string())
        );

        let token = Bytes::from_static(b"\0cassandra\0cassandra");
        let reply =
            handle_frame(&frame(Message::AuthResponse(token)), &config, &mut authenticated)
                .unwrap();
        assert_eq!(reply.message, Message::AuthSuccess);
        assert!(authenticated);

        let bad = Bytes::from_static(b"\0invalid\0invalid");
        let mut fresh = false;
        let reply = handle_frame(&frame(Message::AuthResponse(bad)), &config, &mut fresh).unwrap();
        assert!(matches!(
            reply.message,
            Message::Error {
                code: ErrorCode::BadCredentials,
                ..
            }
        ));
    }

    #[test]
    fn test_tls_context_generates_pem_certificate() {
        let context = TlsContext::generate().unwrap();
        assert!(context.cert_pem.contains("BEGIN CERTIFICATE"));
    }

    #[test]
    fn test_keyspace_selection() {
        let config = ClusterBuilder::default().keyspace("foo").config;
        let mut authenticated = true;

        let reply = handle_frame(
            &frame(Message::Query("USE foo".to_string())),
            &config,
            &mut authenticated,
        )
        .unwrap();
        assert_eq!(
            reply.message,
            Message::Result(ResultKind::SetKeyspace("foo".to_string()))
        );

        let reply = handle_frame(
            &frame(Message::Query("USE missing".to_string())),
            &config,
            &mut authenticated,
        )
        .unwrap();
        assert!(matches!(
            reply.message,
            Message::Error {
                code: ErrorCode::Invalid,
                ..
            }
        ));
    }
}
