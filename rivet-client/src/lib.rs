//! # rivet-client
//!
//! Client library for rivet.
//!
//! This crate provides:
//! - A bounded connection pool with connection aging and retried connects
//! - Single-connection RPC calls, including the tracing upgrade handshake
//! - A retry policy that bounds attempts, elapsed time and backoff
//! - TCP, Unix socket and in-memory transports

pub mod connection;
pub mod endpoint;
pub mod error;
pub mod pool;
pub mod retry;
pub mod stream;

pub use connection::{Connection, Connector, SocketConnector};
pub use endpoint::Endpoint;
pub use error::{ClientError, TransportError};
pub use pool::{ConnectionPool, PoolConfig, PooledConnection};
pub use retry::{Attempt, RetryPolicy};
pub use stream::ClientStream;
