//! Authentication capabilities.
//!
//! The pool only cares about the pass/fail outcome of authentication; the
//! credential material itself is supplied by an [`AuthProvider`] installed
//! in the connection settings.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

/// A username/password pair.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// User name.
    pub username: String,
    /// Password.
    pub password: String,
}

impl Credentials {
    /// Create credentials from a username and password.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Encode as a SASL PLAIN token (`\0username\0password`).
    #[must_use]
    pub fn sasl_token(&self) -> Bytes {
        let mut token = BytesMut::with_capacity(self.username.len() + self.password.len() + 2);
        token.put_u8(0);
        token.extend_from_slice(self.username.as_bytes());
        token.put_u8(0);
        token.extend_from_slice(self.password.as_bytes());
        token.freeze()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Supplies credentials for the authentication phase of the handshake.
pub trait AuthProvider: Send + Sync + fmt::Debug {
    /// The credentials to present to the server.
    fn credentials(&self) -> Credentials;
}

/// An [`AuthProvider`] holding a fixed username/password pair.
#[derive(Clone)]
pub struct PlainTextAuthProvider {
    credentials: Credentials,
}

impl PlainTextAuthProvider {
    /// Create a provider from a username and password.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            credentials: Credentials::new(username, password),
        }
    }
}

impl AuthProvider for PlainTextAuthProvider {
    fn credentials(&self) -> Credentials {
        self.credentials.clone()
    }
}

impl fmt::Debug for PlainTextAuthProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlainTextAuthProvider")
            .field("username", &self.credentials.username)
            .finish()
    }
}
