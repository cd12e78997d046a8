//! One-shot connect-and-handshake state machine.

use std::io;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use crate::address::Address;
use crate::connection::{PooledConnection, Transport};
use crate::error::{CodecError, ConnectError};
use crate::proto::{ErrorCode, Frame, FrameCodec, Message};
use crate::settings::ConnectionSettings;

/// Drives a single connection attempt through connect, optional TLS,
/// protocol-version negotiation, optional authentication, and optional
/// keyspace selection.
///
/// A connector produces exactly one terminal result and is not reused. It
/// never retries internally; retry policy lives in the owning pool. The
/// classification of failures as fatal or retryable happens here, because
/// only the connector knows which handshake phase failed.
#[derive(Debug)]
pub struct Connector {
    address: Address,
    settings: Arc<ConnectionSettings>,
}

impl Connector {
    /// Create a connector for one attempt against `address`.
    #[must_use]
    pub fn new(address: Address, settings: Arc<ConnectionSettings>) -> Self {
        Self { address, settings }
    }

    /// Run the attempt to completion.
    ///
    /// The configured connect timeout covers the whole attempt, handshake
    /// phases included.
    pub async fn connect(self) -> Result<PooledConnection, ConnectError> {
        let timeout = self.settings.connect_timeout;
        match tokio::time::timeout(timeout, self.handshake()).await {
            Ok(result) => result,
            Err(_) => Err(ConnectError::Timeout { timeout }),
        }
    }

    async fn handshake(&self) -> Result<PooledConnection, ConnectError> {
        let version = self.settings.protocol_version;
        tracing::debug!(address = %self.address, %version, "connecting");

        let stream = TcpStream::connect((self.address.host(), self.address.port()))
            .await
            .map_err(ConnectError::Connect)?;
        if self.settings.tcp_nodelay {
            stream.set_nodelay(true).map_err(ConnectError::Connect)?;
        }

        let transport = match &self.settings.tls {
            Some(tls) => {
                let tls_stream = tls.handshake(self.address.host(), stream).await?;
                Transport::Tls(Box::new(tls_stream))
            }
            None => Transport::Plain(stream),
        };
        let mut framed = Framed::new(transport, FrameCodec::new());

        self.send(&mut framed, Message::Startup).await?;
        match self.recv(&mut framed).await? {
            Message::Ready => {}
            Message::Authenticate(authenticator) => {
                self.authenticate(&mut framed, &authenticator).await?;
            }
            Message::Error {
                code: ErrorCode::Protocol,
                message,
            } => return Err(ConnectError::InvalidProtocol { version, message }),
            Message::Error {
                code: ErrorCode::BadCredentials,
                message,
            } => return Err(ConnectError::Auth(message)),
            Message::Error { message, .. } => {
                return Err(ConnectError::Connect(io::Error::other(message)));
            }
            other => return Err(ConnectError::UnexpectedMessage(other.opcode())),
        }

        if let Some(keyspace) = &self.settings.keyspace {
            self.send(&mut framed, Message::Query(format!("USE {keyspace}")))
                .await?;
            match self.recv(&mut framed).await? {
                Message::Result(_) => {}
                Message::Error { message, .. } => {
                    return Err(ConnectError::Keyspace {
                        keyspace: keyspace.clone(),
                        message,
                    });
                }
                other => return Err(ConnectError::UnexpectedMessage(other.opcode())),
            }
        }

        tracing::debug!(address = %self.address, %version, "connection ready");
        Ok(PooledConnection::spawn(
            self.address.clone(),
            self.settings.keyspace.clone(),
            framed,
            version,
            self.settings.effective_max_in_flight(),
        ))
    }

    async fn authenticate(
        &self,
        framed: &mut Framed<Transport, FrameCodec>,
        authenticator: &str,
    ) -> Result<(), ConnectError> {
        let Some(provider) = &self.settings.auth_provider else {
            return Err(ConnectError::Auth(format!(
                "server requires authentication ({authenticator}) but no credentials are configured"
            )));
        };

        let token = provider.credentials().sasl_token();
        self.send(framed, Message::AuthResponse(token)).await?;
        match self.recv(framed).await? {
            Message::AuthSuccess | Message::Ready => Ok(()),
            Message::Error { message, .. } => Err(ConnectError::Auth(message)),
            other => Err(ConnectError::UnexpectedMessage(other.opcode())),
        }
    }

    async fn send(
        &self,
        framed: &mut Framed<Transport, FrameCodec>,
        message: Message,
    ) -> Result<(), ConnectError> {
        let frame = Frame {
            version: self.settings.protocol_version,
            stream: 0,
            message,
        };
        framed.send(frame).await.map_err(codec_to_connect)
    }

    async fn recv(
        &self,
        framed: &mut Framed<Transport, FrameCodec>,
    ) -> Result<Message, ConnectError> {
        match framed.next().await {
            Some(Ok(frame)) => Ok(frame.message),
            Some(Err(error)) => Err(codec_to_connect(error)),
            None => Err(ConnectError::Closed),
        }
    }
}

fn codec_to_connect(error: CodecError) -> ConnectError {
    match error {
        CodecError::Io(io_error) => ConnectError::Connect(io_error),
        other => ConnectError::Connect(io::Error::other(other)),
    }
}
