//! # cql-pool
//!
//! Connection pool management for CQL wire-protocol clients.
//!
//! For a fixed set of server addresses this crate maintains a bounded set of
//! live, authenticated, protocol-negotiated connections per address and
//! exposes a least-busy "pick a connection" operation to request-issuing
//! code. Pools self-heal across transient failures (disconnects, timeouts,
//! membership changes) without blocking the caller.
//!
//! ## Architecture
//!
//! - [`Connector`]: one-shot handshake state machine for a single connection
//!   attempt (TCP connect, optional TLS, protocol negotiation, optional
//!   authentication, optional keyspace selection). Classifies failures as
//!   retryable or fatal.
//! - [`ConnectionPool`]: owns the connections for one address, reconnects on
//!   failure, and reports up/down/critical transitions.
//! - [`ConnectionPoolManager`]: owns the address-to-pool map and supports
//!   runtime topology changes via `add`/`remove`.
//! - [`ConnectionPoolManagerInitializer`]: bootstraps the manager by
//!   connecting to every address concurrently and aggregating per-address
//!   outcomes.
//!
//! ## Example
//!
//! ```rust,ignore
//! use cql_pool::{Address, ConnectionPoolManagerInitializer, ProtocolVersion};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let addresses = vec![
//!         Address::new("10.0.0.1", 9042),
//!         Address::new("10.0.0.2", 9042),
//!     ];
//!
//!     let initialized = ConnectionPoolManagerInitializer::new(ProtocolVersion::V4)
//!         .with_keyspace("store")
//!         .initialize(addresses)
//!         .await;
//!
//!     let manager = initialized.into_manager()?;
//!     if let Some(connection) = manager.find_least_busy(&Address::new("10.0.0.1", 9042)) {
//!         connection.execute("SELECT * FROM store.items").await?;
//!     }
//!
//!     manager.close();
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod address;
pub mod auth;
pub mod connection;
pub mod connector;
pub mod error;
pub mod initializer;
pub mod listener;
pub mod manager;
pub mod pool;
pub mod proto;
pub mod settings;
pub mod tls;

// Core types
pub use address::Address;
pub use connection::{PooledConnection, Request};
pub use connector::Connector;
pub use initializer::{ConnectionPoolManagerInitializer, InitializedManager};
pub use manager::ConnectionPoolManager;
pub use pool::ConnectionPool;

// Observer protocol
pub use listener::{ChannelListener, ConnectionPoolListener, PoolEvent};

// Configuration
pub use auth::{AuthProvider, Credentials, PlainTextAuthProvider};
pub use settings::{ConnectionSettings, PoolSettings};
pub use tls::TlsSettings;

// Error types
pub use error::{
    AllAddressesFailed, ConnectError, ConnectFailure, ConnectionErrorCode, RequestError,
};

// Wire-level types
pub use proto::ProtocolVersion;
