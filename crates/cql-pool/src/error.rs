//! Error types for the pool subsystem.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::address::Address;
use crate::proto::{ErrorCode, ProtocolVersion};

/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, Error)]
pub enum CodecError {
    /// IO error during read/write operations.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Frame body exceeds the maximum allowed length.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge {
        /// Actual body size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// Frame body ended before a field was fully read.
    #[error("truncated frame body")]
    Truncated,

    /// A string field exceeds the range of its length prefix.
    #[error("string field too long: {0} bytes")]
    StringTooLong(usize),

    /// Unknown opcode in the frame header.
    #[error("invalid opcode: {0:#04x}")]
    InvalidOpcode(u8),

    /// Unknown result kind in a RESULT body.
    #[error("invalid result kind: {0}")]
    InvalidResultKind(u32),

    /// A string field was not valid UTF-8.
    #[error("invalid UTF-8 in string field")]
    InvalidUtf8,
}

/// A classified connection attempt failure.
///
/// The connector classifies every failure as either retryable (the pool
/// schedules a reconnection) or fatal for the address (retrying with the
/// same settings cannot succeed; the pool surfaces a critical error and
/// stops reconnecting).
#[derive(Debug, Error)]
pub enum ConnectError {
    /// TCP connect or handshake IO failed. Retryable.
    #[error("connect failed: {0}")]
    Connect(#[source] io::Error),

    /// The connect attempt (including the handshake) timed out. Retryable.
    #[error("connect timed out after {timeout:?}")]
    Timeout {
        /// The configured connect timeout.
        timeout: Duration,
    },

    /// The peer closed the connection mid-handshake. Retryable.
    #[error("connection closed during handshake")]
    Closed,

    /// The peer sent a message that does not belong in the handshake.
    /// Retryable.
    #[error("unexpected opcode {0:#04x} during handshake")]
    UnexpectedMessage(u8),

    /// The requested protocol version was rejected by the server. Fatal:
    /// reconnecting with the same version cannot succeed.
    #[error("protocol version {version} not supported by server: {message}")]
    InvalidProtocol {
        /// The version the client requested.
        version: ProtocolVersion,
        /// Server-provided detail.
        message: String,
    },

    /// The TLS handshake failed to complete. Fatal.
    #[error("TLS handshake failed: {0}")]
    SslHandshake(String),

    /// TLS peer certificate verification failed. Fatal.
    #[error("TLS certificate verification failed: {0}")]
    SslVerify(String),

    /// Authentication was rejected by the server. Fatal.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The keyspace-use request was rejected. Fatal.
    #[error("keyspace '{keyspace}' rejected: {message}")]
    Keyspace {
        /// The keyspace that was requested.
        keyspace: String,
        /// Server-provided detail.
        message: String,
    },
}

impl ConnectError {
    /// Whether this failure is fatal for the address.
    ///
    /// Fatal failures are surfaced as critical errors and are never retried
    /// by the pool's reconnection logic.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::InvalidProtocol { .. }
                | Self::SslHandshake(_)
                | Self::SslVerify(_)
                | Self::Auth(_)
                | Self::Keyspace { .. }
        )
    }

    /// Whether the pool may retry this failure via reconnection.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !self.is_fatal()
    }

    /// The coarse classification code reported to listeners.
    #[must_use]
    pub fn code(&self) -> ConnectionErrorCode {
        match self {
            Self::Connect(_) | Self::Timeout { .. } | Self::Closed | Self::UnexpectedMessage(_) => {
                ConnectionErrorCode::Connect
            }
            Self::InvalidProtocol { .. } => ConnectionErrorCode::InvalidProtocol,
            Self::SslHandshake(_) => ConnectionErrorCode::SslHandshake,
            Self::SslVerify(_) => ConnectionErrorCode::SslVerify,
            Self::Auth(_) => ConnectionErrorCode::Auth,
            Self::Keyspace { .. } => ConnectionErrorCode::Keyspace,
        }
    }
}

/// Coarse connection error classification, as reported to
/// [`ConnectionPoolListener`](crate::ConnectionPoolListener) callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionErrorCode {
    /// Generic connect/timeout failure (retryable).
    Connect,
    /// Requested protocol version rejected.
    InvalidProtocol,
    /// TLS handshake failed to complete.
    SslHandshake,
    /// TLS certificate verification failed.
    SslVerify,
    /// Authentication rejected.
    Auth,
    /// Keyspace-use request rejected.
    Keyspace,
}

/// Errors observed by request issuers on a pooled connection.
#[derive(Debug, Error)]
pub enum RequestError {
    /// The connection closed before the response arrived, or the write was
    /// not accepted.
    #[error("connection closed")]
    ConnectionClosed,

    /// The server returned an error response.
    #[error("server error {code:?}: {message}")]
    Server {
        /// Server error classification.
        code: ErrorCode,
        /// Server-provided detail.
        message: String,
    },

    /// The server returned a response that is not a result or an error.
    #[error("unexpected response")]
    Unexpected,
}

/// A per-address bootstrap failure recorded by the initializer.
#[derive(Debug)]
pub struct ConnectFailure {
    /// The address that failed.
    pub address: Address,
    /// The classified failure.
    pub error: ConnectError,
}

/// Every contact point failed to connect during bootstrap.
#[derive(Debug, Error)]
#[error("all {} contact points failed to connect", .failures.len())]
pub struct AllAddressesFailed {
    /// The per-address failures.
    pub failures: Vec<ConnectFailure>,
}
