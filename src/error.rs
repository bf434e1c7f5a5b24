//! Top-level node errors

use crate::network::protocol::ProtocolError;
use crate::security::CryptoError;
use crate::storage::StorageError;
use crate::transfer::TransferError;

/// Errors surfaced by the node and its daemon entry points
#[derive(Debug)]
pub enum NodeError {
    /// Failed to start the node
    StartFailed(String),
    /// Wire protocol violation
    Protocol(ProtocolError),
    /// Cryptographic failure (handshake, AEAD, replay)
    Crypto(CryptoError),
    /// Transport-level socket error
    Transport(String),
    /// Storage failure (database, chunk files)
    Storage(StorageError),
    /// Transfer engine failure
    Transfer(TransferError),
    /// Request rejected by policy (capacity, bandwidth)
    Policy(String),
    /// Configuration problem
    Config(String),
    /// Node is not running
    NotRunning,
}

impl std::fmt::Display for NodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeError::StartFailed(e) => write!(f, "failed to start node: {}", e),
            NodeError::Protocol(e) => write!(f, "protocol error: {}", e),
            NodeError::Crypto(e) => write!(f, "crypto error: {}", e),
            NodeError::Transport(e) => write!(f, "transport error: {}", e),
            NodeError::Storage(e) => write!(f, "storage error: {}", e),
            NodeError::Transfer(e) => write!(f, "transfer error: {}", e),
            NodeError::Policy(e) => write!(f, "rejected by policy: {}", e),
            NodeError::Config(e) => write!(f, "configuration error: {}", e),
            NodeError::NotRunning => write!(f, "node is not running"),
        }
    }
}

impl std::error::Error for NodeError {}

impl From<ProtocolError> for NodeError {
    fn from(e: ProtocolError) -> Self {
        NodeError::Protocol(e)
    }
}

impl From<CryptoError> for NodeError {
    fn from(e: CryptoError) -> Self {
        NodeError::Crypto(e)
    }
}

impl From<StorageError> for NodeError {
    fn from(e: StorageError) -> Self {
        NodeError::Storage(e)
    }
}

impl From<TransferError> for NodeError {
    fn from(e: TransferError) -> Self {
        NodeError::Transfer(e)
    }
}

impl From<std::io::Error> for NodeError {
    fn from(e: std::io::Error) -> Self {
        NodeError::Transport(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_formats() {
        let err = NodeError::NotRunning;
        assert_eq!(err.to_string(), "node is not running");

        let err = NodeError::Policy("too many concurrent transfers".to_string());
        assert_eq!(err.to_string(), "rejected by policy: too many concurrent transfers");

        let err = NodeError::StartFailed("port in use".to_string());
        assert_eq!(err.to_string(), "failed to start node: port in use");
    }

    #[test]
    fn test_is_error_trait() {
        let err: Box<dyn std::error::Error> = Box::new(NodeError::NotRunning);
        assert!(!err.to_string().is_empty());
    }

    #[test]
    fn test_from_io_error() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err = NodeError::from(io);
        assert!(matches!(err, NodeError::Transport(_)));
    }
}
