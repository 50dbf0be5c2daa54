//! Error types for the mesh node

use crate::network::address::Address;
use crate::network::peer::PeerId;
use thiserror::Error;

/// Frame-level protocol violations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame of {len} bytes exceeds the limit of {max} bytes")]
    TooLarge { len: usize, max: usize },
    #[error("negative frame length {0}")]
    NegativeLength(i32),
}

/// Errors surfaced by the mesh node
#[derive(Error, Debug)]
pub enum MeshError {
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Connection to {address} failed after {attempts} attempts: {source}")]
    Connection {
        address: Address,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },
    #[error("Protocol error: {0}")]
    Protocol(#[from] FrameError),
    #[error("Can't call {command} when node is {state}")]
    InvalidOperation { command: String, state: String },
    #[error("No peer with ID {0} was found")]
    PeerNotFound(PeerId),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MeshError {
    /// True for errors raised by frame validation
    pub fn is_protocol(&self) -> bool {
        matches!(self, MeshError::Protocol(_))
    }
}

/// Result alias used throughout the crate
pub type MeshResult<T> = Result<T, MeshError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_error_display() {
        let err = MeshError::from(FrameError::TooLarge { len: 1001, max: 1000 });
        let msg = err.to_string();
        assert!(msg.contains("Protocol error"));
        assert!(msg.contains("1001"));
        assert!(err.is_protocol());
    }

    #[test]
    fn test_invalid_operation_display() {
        let err = MeshError::InvalidOperation {
            command: "Stop".into(),
            state: "Stopped".into(),
        };
        assert_eq!(err.to_string(), "Can't call Stop when node is Stopped");
        assert!(!err.is_protocol());
    }

    #[test]
    fn test_connection_error_keeps_cause() {
        let address: Address = "127.0.0.1:9200".parse().unwrap();
        let err = MeshError::Connection {
            address,
            attempts: 3,
            source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
        };
        assert!(err.to_string().contains("127.0.0.1:9200"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let err: MeshError = io.into();
        assert!(matches!(err, MeshError::Io(_)));
    }
}
