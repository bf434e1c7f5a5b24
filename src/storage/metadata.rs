//! File metadata: the immutable description of a shared file.
//!
//! Created once when a file is shared (or learned from a peer) and never
//! modified afterwards. Invariants:
//!
//! - `chunk_count == ceil(file_size / chunk_size)`
//! - `chunk_hashes.len() == chunk_count`
//! - the last chunk's size is `file_size % chunk_size` unless the remainder
//!   is zero, in which case it is a full `chunk_size`

use serde::{Deserialize, Serialize};

/// Default chunk size: 64 KiB.
pub const DEFAULT_CHUNK_SIZE: u32 = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMetadata {
    /// Stable identifier used in wire messages (hex of the file hash).
    pub file_id: String,
    /// Hex BLAKE3 of the whole file.
    pub file_hash: String,
    pub filename: String,
    /// Absolute path on the owning node; never sent to peers.
    pub file_path: String,
    pub file_size: u64,
    pub chunk_size: u32,
    pub chunk_count: u32,
    /// Hex BLAKE3 of each chunk, in order.
    pub chunk_hashes: Vec<String>,
    pub file_type: String,
    pub description: String,
    pub tags: Vec<String>,
    /// Seconds since the epoch.
    pub created_at: u64,
    pub modified_at: u64,
}

/// `ceil(file_size / chunk_size)`; zero for an empty file.
pub fn expected_chunk_count(file_size: u64, chunk_size: u32) -> u32 {
    if chunk_size == 0 {
        return 0;
    }
    file_size.div_ceil(u64::from(chunk_size)) as u32
}

impl FileMetadata {
    /// Size in bytes of the chunk at `index`. The terminal chunk carries the
    /// remainder when the file size is not a chunk multiple.
    pub fn chunk_size_at(&self, index: u32) -> u32 {
        if index + 1 == self.chunk_count {
            let remainder = (self.file_size % u64::from(self.chunk_size)) as u32;
            if remainder != 0 {
                return remainder;
            }
        }
        self.chunk_size
    }

    /// Check the structural invariants.
    pub fn is_consistent(&self) -> bool {
        self.chunk_count == expected_chunk_count(self.file_size, self.chunk_size)
            && self.chunk_hashes.len() == self.chunk_count as usize
    }

    pub fn total_chunks(&self) -> u32 {
        self.chunk_count
    }
}
