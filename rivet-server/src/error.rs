//! Server error types.

use crate::config::ConfigError;
use rivet_protocol::ProtocolError;
use std::io;
use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The peer closed the connection between messages.
    #[error("transport closed")]
    TransportClosed,

    #[error("invalid service definition: {0}")]
    InvalidService(String),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("server shutting down")]
    ShuttingDown,
}

impl ServerError {
    /// Returns whether this error ends a connection without being worth
    /// reporting: an orderly close or a peer reset.
    pub fn is_disconnect(&self) -> bool {
        match self {
            ServerError::TransportClosed => true,
            ServerError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_disconnect() {
        assert!(ServerError::TransportClosed.is_disconnect());
        assert!(ServerError::from(io::Error::from(io::ErrorKind::ConnectionReset)).is_disconnect());
        assert!(!ServerError::from(io::Error::from(io::ErrorKind::PermissionDenied)).is_disconnect());
        assert!(!ServerError::from(ProtocolError::InvalidUtf8).is_disconnect());
    }
}
