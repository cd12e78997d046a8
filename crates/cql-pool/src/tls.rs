//! TLS capability for pooled connections.
//!
//! The pool treats TLS as "attempt a handshake, yield success or a
//! classified failure": handshake failures that stem from certificate
//! verification are distinguished from all other handshake failures, since
//! listeners report them under different critical-error codes.

use std::fmt;
use std::io;
use std::sync::Arc;

use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;

use crate::error::ConnectError;

/// TLS configuration shared by all connectors.
#[derive(Clone)]
pub struct TlsSettings {
    config: Arc<rustls::ClientConfig>,
}

impl TlsSettings {
    /// Create settings from a prepared rustls client configuration.
    #[must_use]
    pub fn new(config: Arc<rustls::ClientConfig>) -> Self {
        Self { config }
    }

    /// Create settings trusting the Mozilla webpki root set.
    #[must_use]
    pub fn with_webpki_roots() -> Self {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Self::new(Arc::new(config))
    }

    /// Create settings trusting only the CA certificates in the given PEM
    /// bundle.
    pub fn with_pem_roots(pem: &[u8]) -> io::Result<Self> {
        let mut roots = rustls::RootCertStore::empty();
        let mut reader = io::BufReader::new(pem);
        for cert in rustls_pemfile::certs(&mut reader) {
            let cert = cert?;
            roots
                .add(cert)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        }
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Ok(Self::new(Arc::new(config)))
    }

    /// Attempt the TLS handshake over a connected TCP stream.
    pub(crate) async fn handshake(
        &self,
        host: &str,
        stream: TcpStream,
    ) -> Result<TlsStream<TcpStream>, ConnectError> {
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| ConnectError::SslHandshake(format!("invalid server name '{host}'")))?;
        let connector = TlsConnector::from(self.config.clone());
        connector
            .connect(server_name, stream)
            .await
            .map_err(classify_tls_error)
    }
}

impl fmt::Debug for TlsSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsSettings").finish_non_exhaustive()
    }
}

/// Split TLS failures into verification errors and everything else.
pub(crate) fn classify_tls_error(error: io::Error) -> ConnectError {
    let verify_failure = error
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>())
        .is_some_and(|tls| matches!(tls, rustls::Error::InvalidCertificate(_)));

    if verify_failure {
        ConnectError::SslVerify(error.to_string())
    } else {
        ConnectError::SslHandshake(error.to_string())
    }
}
