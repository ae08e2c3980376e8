//! Client error types.

use rivet_protocol::{ApplicationException, ProtocolError, Struct};
use std::io;
use thiserror::Error;

/// Transport-level failures surfaced by the pool.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("timed out waiting for a connection slot")]
    PoolExhausted,

    #[error("giving up after multiple attempts to connect ({attempts} attempts)")]
    ConnectFailed { attempts: u32 },

    #[error("timed out interacting with socket")]
    TimedOut,

    #[error("connection closed")]
    Closed,

    #[error("{0}")]
    Unknown(String),
}

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("application exception: {0}")]
    Application(#[from] ApplicationException),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A declared exception returned in a REPLY result struct.
    #[error("declared exception in field {field_id}")]
    Declared { field_id: i16, payload: Struct },

    #[error(transparent)]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl ClientError {
    /// Wraps a caller-defined error.
    pub fn other<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        ClientError::Other(err.into())
    }

    /// Returns whether the connection that produced this error must not be
    /// reused.
    pub fn poisons_connection(&self) -> bool {
        matches!(
            self,
            ClientError::Transport(_)
                | ClientError::Protocol(_)
                | ClientError::Application(_)
                | ClientError::Io(_)
        )
    }

    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Transport(_) => true,
            ClientError::Io(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_messages() {
        assert_eq!(
            TransportError::PoolExhausted.to_string(),
            "timed out waiting for a connection slot"
        );
        assert!(TransportError::ConnectFailed { attempts: 3 }
            .to_string()
            .starts_with("giving up after multiple attempts to connect"));
        assert_eq!(
            TransportError::TimedOut.to_string(),
            "timed out interacting with socket"
        );
    }

    #[test]
    fn test_poisons_connection() {
        assert!(ClientError::from(TransportError::Closed).poisons_connection());
        assert!(ClientError::from(ProtocolError::InvalidUtf8).poisons_connection());
        assert!(ClientError::from(ApplicationException::internal("boom")).poisons_connection());
        assert!(!ClientError::Declared {
            field_id: 1,
            payload: Struct::new()
        }
        .poisons_connection());
        assert!(!ClientError::other("caller").poisons_connection());
    }

    #[test]
    fn test_is_retryable() {
        assert!(ClientError::from(TransportError::PoolExhausted).is_retryable());
        assert!(ClientError::from(TransportError::ConnectFailed { attempts: 3 }).is_retryable());
        assert!(ClientError::from(TransportError::TimedOut).is_retryable());
        assert!(!ClientError::from(ApplicationException::internal("x")).is_retryable());
    }
}
