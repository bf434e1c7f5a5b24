//! One transfer session: the windowed request/receive state machine.
//!
//! Chunks are tracked in two bit vectors (requested, received). The request
//! window scans forward from a cursor, skipping chunks already requested or
//! received. Incoming chunks are validated in order: index range, was it
//! requested, exact size for its index, and BLAKE3 hash when the metadata
//! carries one. A failed validation leaves the chunk available for retry;
//! the session keeps running.

use std::time::{Duration, Instant};

use crate::storage::chunker::verify_chunk;
use crate::storage::metadata::FileMetadata;

use super::bitfield::ChunkBitfield;
use super::TransferError;

/// Default timeout before a requested chunk is considered lost.
pub const DEFAULT_CHUNK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Inactive,
    Requesting,
    Transferring,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TransferState {
    /// Terminal states are never left.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferState::Completed | TransferState::Failed | TransferState::Cancelled
        )
    }
}

#[derive(Debug)]
pub struct TransferSession {
    session_id: String,
    file_id: String,
    peer_id: u32,
    state: TransferState,
    metadata: Option<FileMetadata>,
    requested_chunks: ChunkBitfield,
    received_chunks: ChunkBitfield,
    request_times: Vec<Option<Instant>>,
    next_chunk_cursor: u32,
    bytes_transferred: u64,
    start_time: Option<Instant>,
    chunk_timeout: Duration,
}

impl TransferSession {
    pub fn new(session_id: &str, file_id: &str, peer_id: u32) -> Self {
        Self {
            session_id: session_id.to_string(),
            file_id: file_id.to_string(),
            peer_id,
            state: TransferState::Inactive,
            metadata: None,
            requested_chunks: ChunkBitfield::new(0),
            received_chunks: ChunkBitfield::new(0),
            request_times: Vec::new(),
            next_chunk_cursor: 0,
            bytes_transferred: 0,
            start_time: None,
            chunk_timeout: DEFAULT_CHUNK_TIMEOUT,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn file_id(&self) -> &str {
        &self.file_id
    }

    pub fn peer_id(&self) -> u32 {
        self.peer_id
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn set_state(&mut self, state: TransferState) {
        self.state = state;
    }

    pub fn metadata(&self) -> Option<&FileMetadata> {
        self.metadata.as_ref()
    }

    pub fn set_chunk_timeout(&mut self, timeout: Duration) {
        self.chunk_timeout = timeout;
    }

    /// Begin transferring under the given metadata. Resets all tracking
    /// state and sizes the bit vectors to the file's chunk count.
    pub fn start_transfer(&mut self, metadata: FileMetadata) {
        let chunk_count = metadata.chunk_count;
        self.requested_chunks = ChunkBitfield::new(chunk_count);
        self.received_chunks = ChunkBitfield::new(chunk_count);
        self.request_times = vec![None; chunk_count as usize];
        self.next_chunk_cursor = 0;
        self.bytes_transferred = 0;
        self.start_time = Some(Instant::now());
        self.metadata = Some(metadata);
        self.state = TransferState::Requesting;
    }

    /// Pre-mark chunks already on disk from a previous run. They count as
    /// both requested and received so the window skips them.
    pub fn mark_resumed_chunks(&mut self, completed: impl IntoIterator<Item = u32>) {
        let Some(metadata) = self.metadata.clone() else {
            return;
        };
        for index in completed {
            if index < metadata.chunk_count && !self.received_chunks.test(index) {
                self.requested_chunks.set(index);
                self.received_chunks.set(index);
                self.bytes_transferred += u64::from(metadata.chunk_size_at(index));
            }
        }
        if self.received_chunks.all_set() && !self.received_chunks.is_empty() {
            self.state = TransferState::Completed;
        }
    }

    /// Mark up to `window_size` chunks as requested, scanning forward from
    /// the cursor and skipping chunks already requested or received. Returns
    /// the indices to request. Moves `Requesting -> Transferring` on the
    /// first outbound request.
    pub fn request_next_chunks(&mut self, window_size: u32) -> Result<Vec<u32>, TransferError> {
        if self.state != TransferState::Requesting && self.state != TransferState::Transferring {
            return Err(TransferError::InvalidState(format!(
                "cannot request chunks in state {:?}",
                self.state
            )));
        }
        let Some(metadata) = &self.metadata else {
            return Err(TransferError::InvalidState("no metadata".to_string()));
        };

        let chunk_count = metadata.chunk_count;
        let mut requested = Vec::new();
        while (requested.len() as u32) < window_size && self.next_chunk_cursor < chunk_count {
            let index = self.next_chunk_cursor;
            if !self.requested_chunks.test(index) && !self.received_chunks.test(index) {
                self.requested_chunks.set(index);
                self.request_times[index as usize] = Some(Instant::now());
                requested.push(index);
            }
            self.next_chunk_cursor += 1;
        }

        if self.state == TransferState::Requesting && !requested.is_empty() {
            self.state = TransferState::Transferring;
        }
        Ok(requested)
    }

    /// Validate and record an incoming chunk. On success the chunk is
    /// counted and, when the last chunk lands, the session completes.
    pub fn handle_chunk_received(
        &mut self,
        chunk_index: u32,
        data: &[u8],
    ) -> Result<(), TransferError> {
        let Some(metadata) = &self.metadata else {
            return Err(TransferError::InvalidState("no metadata".to_string()));
        };

        if chunk_index >= metadata.chunk_count {
            return Err(TransferError::IndexOutOfRange(chunk_index));
        }
        if !self.requested_chunks.test(chunk_index) {
            return Err(TransferError::NotRequested(chunk_index));
        }

        let expected_size = metadata.chunk_size_at(chunk_index);
        if data.len() != expected_size as usize {
            return Err(TransferError::SizeMismatch {
                expected: expected_size,
                got: data.len() as u32,
            });
        }

        if let Some(expected_hash) = metadata.chunk_hashes.get(chunk_index as usize) {
            if !expected_hash.is_empty() && !verify_chunk(data, expected_hash) {
                return Err(TransferError::HashMismatch(chunk_index));
            }
        }

        if !self.received_chunks.test(chunk_index) {
            self.received_chunks.set(chunk_index);
            self.bytes_transferred += data.len() as u64;
        }

        if self.received_chunks.all_set() {
            self.state = TransferState::Completed;
        }
        Ok(())
    }

    pub fn is_chunk_requested(&self, chunk_index: u32) -> bool {
        self.requested_chunks.test(chunk_index)
    }

    pub fn is_chunk_received(&self, chunk_index: u32) -> bool {
        self.received_chunks.test(chunk_index)
    }

    pub fn is_complete(&self) -> bool {
        self.state == TransferState::Completed
            || (!self.received_chunks.is_empty() && self.received_chunks.all_set())
    }

    pub fn progress_percentage(&self) -> f64 {
        let Some(metadata) = &self.metadata else {
            return 0.0;
        };
        if metadata.chunk_count == 0 {
            return 0.0;
        }
        (f64::from(self.received_chunks.count()) / f64::from(metadata.chunk_count)) * 100.0
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }

    pub fn received_count(&self) -> u32 {
        self.received_chunks.count()
    }

    /// Requested-but-unreceived chunks whose request is older than the
    /// chunk timeout.
    pub fn get_timed_out_chunks(&self) -> Vec<u32> {
        let Some(metadata) = &self.metadata else {
            return Vec::new();
        };
        let now = Instant::now();
        (0..metadata.chunk_count)
            .filter(|&index| {
                self.requested_chunks.test(index)
                    && !self.received_chunks.test(index)
                    && self.request_times[index as usize]
                        .map(|t| now.duration_since(t) > self.chunk_timeout)
                        .unwrap_or(false)
            })
            .collect()
    }

    /// Reset the request timestamp for a resend. The requested bit stays
    /// set so the window does not double-count the chunk.
    pub fn retry_chunk(&mut self, chunk_index: u32) -> Result<(), TransferError> {
        let Some(metadata) = &self.metadata else {
            return Err(TransferError::InvalidState("no metadata".to_string()));
        };
        if chunk_index >= metadata.chunk_count {
            return Err(TransferError::IndexOutOfRange(chunk_index));
        }
        self.request_times[chunk_index as usize] = Some(Instant::now());
        Ok(())
    }

    /// Invariant check: everything received was requested.
    pub fn received_subset_of_requested(&self) -> bool {
        self.received_chunks.is_subset_of(&self.requested_chunks)
    }
}
