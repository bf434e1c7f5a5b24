//! Transfer engine: windowed chunk transfers with congestion control,
//! bandwidth limiting, and progress tracking.

pub mod bandwidth;
pub mod bitfield;
pub mod flow;
pub mod manager;
pub mod monitor;
pub mod session;

pub use bandwidth::{BandwidthLimiter, Priority};
pub use bitfield::ChunkBitfield;
pub use flow::FlowController;
pub use manager::TransferManager;
pub use monitor::{PerformanceMonitor, SessionStats};
pub use session::{TransferSession, TransferState};

/// Errors from the transfer engine. Logical errors reject a single
/// operation and leave the session running; state errors reject the call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    /// Chunk index is outside the file's chunk count.
    IndexOutOfRange(u32),
    /// Chunk arrived without having been requested.
    NotRequested(u32),
    /// Chunk size does not match the expected size for its index.
    SizeMismatch { expected: u32, got: u32 },
    /// Chunk bytes do not hash to the stored chunk hash.
    HashMismatch(u32),
    /// Operation not permitted in the session's current state.
    InvalidState(String),
    /// No session with the given id.
    SessionNotFound(String),
    /// The engine is at its concurrent transfer capacity.
    CapacityReached,
}

impl std::fmt::Display for TransferError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferError::IndexOutOfRange(i) => write!(f, "chunk index {} out of range", i),
            TransferError::NotRequested(i) => write!(f, "chunk {} was not requested", i),
            TransferError::SizeMismatch { expected, got } => {
                write!(f, "chunk size mismatch: expected {}, got {}", expected, got)
            }
            TransferError::HashMismatch(i) => write!(f, "chunk {} hash verification failed", i),
            TransferError::InvalidState(e) => write!(f, "invalid state: {}", e),
            TransferError::SessionNotFound(id) => write!(f, "session not found: {}", id),
            TransferError::CapacityReached => write!(f, "too many concurrent transfers"),
        }
    }
}

impl std::error::Error for TransferError {}
