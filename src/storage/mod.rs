//! Chunk store: file metadata, chunking and verification, the SQLite file
//! index, and persistent resume state.

pub mod chunker;
pub mod file_index;
pub mod layout;
pub mod metadata;
pub mod resume;

pub use chunker::Chunker;
pub use file_index::FileIndex;
pub use layout::StorageLayout;
pub use metadata::FileMetadata;
pub use resume::{ResumeInfo, ResumeStore};

/// Errors from the storage layer.
#[derive(Debug)]
pub enum StorageError {
    /// SQLite failure.
    Database(String),
    /// Filesystem failure.
    Io(String),
    /// Requested file or chunk does not exist.
    NotFound(String),
    /// Caller supplied inconsistent arguments.
    InvalidInput(String),
    /// BLOB encode/decode failure.
    Serialization(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::Database(e) => write!(f, "database error: {}", e),
            StorageError::Io(e) => write!(f, "io error: {}", e),
            StorageError::NotFound(e) => write!(f, "not found: {}", e),
            StorageError::InvalidInput(e) => write!(f, "invalid input: {}", e),
            StorageError::Serialization(e) => write!(f, "serialization error: {}", e),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        StorageError::Database(e.to_string())
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::Io(e.to_string())
    }
}

impl From<postcard::Error> for StorageError {
    fn from(e: postcard::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}
