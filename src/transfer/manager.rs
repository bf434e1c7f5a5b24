//! Transfer session registry.
//!
//! Owns all active sessions, enforces the concurrent-transfer capacity, and
//! routes chunk events to the right session. Terminal sessions are kept
//! until the next prune pass so late stats queries still resolve.

use rand::RngCore;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use super::session::{TransferSession, TransferState};
use super::TransferError;

/// Default cap on concurrently active transfers.
pub const DEFAULT_MAX_CONCURRENT: u32 = 10;

#[derive(Debug, Default)]
pub struct TransferManager {
    sessions: HashMap<String, TransferSession>,
    max_concurrent: u32,
    total_bytes_transferred: u64,
}

fn generate_session_id() -> String {
    let mut bytes = [0u8; 8];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

impl TransferManager {
    pub fn new() -> Self {
        Self {
            sessions: HashMap::new(),
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            total_bytes_transferred: 0,
        }
    }

    pub fn set_max_concurrent_transfers(&mut self, max: u32) {
        self.max_concurrent = max;
    }

    /// Sessions still doing work (not in a terminal state).
    pub fn active_count(&self) -> usize {
        self.sessions
            .values()
            .filter(|s| !s.state().is_terminal())
            .count()
    }

    fn can_start_new_transfer(&self) -> bool {
        (self.active_count() as u32) < self.max_concurrent
    }

    /// Create a download session, or fail when the engine is at capacity.
    pub fn start_download(
        &mut self,
        file_id: &str,
        peer_id: u32,
    ) -> Result<String, TransferError> {
        if !self.can_start_new_transfer() {
            warn!(file_id, "download rejected: transfer capacity reached");
            return Err(TransferError::CapacityReached);
        }

        let session_id = generate_session_id();
        let session = TransferSession::new(&session_id, file_id, peer_id);
        info!(session = %session_id, file_id, peer = peer_id, "download session created");
        self.sessions.insert(session_id.clone(), session);
        Ok(session_id)
    }

    /// Create an upload session, symmetric to downloads.
    pub fn start_upload(&mut self, file_id: &str, peer_id: u32) -> Result<String, TransferError> {
        if !self.can_start_new_transfer() {
            warn!(file_id, "upload rejected: transfer capacity reached");
            return Err(TransferError::CapacityReached);
        }

        let session_id = generate_session_id();
        let session = TransferSession::new(&session_id, file_id, peer_id);
        info!(session = %session_id, file_id, peer = peer_id, "upload session created");
        self.sessions.insert(session_id.clone(), session);
        Ok(session_id)
    }

    pub fn has_session(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn session(&self, session_id: &str) -> Option<&TransferSession> {
        self.sessions.get(session_id)
    }

    pub fn session_mut(&mut self, session_id: &str) -> Option<&mut TransferSession> {
        self.sessions.get_mut(session_id)
    }

    /// Find the active download session for a file, if any.
    pub fn session_for_file(&mut self, file_id: &str) -> Option<&mut TransferSession> {
        self.sessions
            .values_mut()
            .find(|s| s.file_id() == file_id && !s.state().is_terminal())
    }

    pub fn all_sessions(&self) -> impl Iterator<Item = &TransferSession> {
        self.sessions.values()
    }

    pub fn pause_transfer(&mut self, session_id: &str) -> Result<(), TransferError> {
        let session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| TransferError::SessionNotFound(session_id.to_string()))?;

        match session.state() {
            TransferState::Transferring | TransferState::Requesting => {
                session.set_state(TransferState::Paused);
                Ok(())
            }
            state => Err(TransferError::InvalidState(format!(
                "cannot pause in state {:?}",
                state
            ))),
        }
    }

    pub fn resume_transfer(&mut self, session_id: &str) -> Result<(), TransferError> {
        let session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| TransferError::SessionNotFound(session_id.to_string()))?;

        match session.state() {
            TransferState::Paused => {
                session.set_state(TransferState::Transferring);
                Ok(())
            }
            state => Err(TransferError::InvalidState(format!(
                "cannot resume in state {:?}",
                state
            ))),
        }
    }

    /// Cancel a session. It transitions to `Cancelled` and is dropped from
    /// the active map.
    pub fn cancel_transfer(&mut self, session_id: &str) -> Result<(), TransferError> {
        let mut session = self
            .sessions
            .remove(session_id)
            .ok_or_else(|| TransferError::SessionNotFound(session_id.to_string()))?;
        session.set_state(TransferState::Cancelled);
        info!(session = session_id, "transfer cancelled");
        Ok(())
    }

    /// Route a received chunk to its session.
    pub fn handle_chunk_received(
        &mut self,
        session_id: &str,
        chunk_index: u32,
        data: &[u8],
    ) -> Result<(), TransferError> {
        let session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| TransferError::SessionNotFound(session_id.to_string()))?;

        session.handle_chunk_received(chunk_index, data)?;
        self.total_bytes_transferred += data.len() as u64;

        if session.is_complete() {
            debug!(session = session_id, "transfer complete");
        }
        Ok(())
    }

    pub fn total_bytes_transferred(&self) -> u64 {
        self.total_bytes_transferred
    }

    /// Drop terminal sessions. Returns the ids that were removed.
    pub fn prune_terminal(&mut self) -> Vec<String> {
        let terminal: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.state().is_terminal())
            .map(|(id, _)| id.clone())
            .collect();
        for id in &terminal {
            self.sessions.remove(id);
        }
        terminal
    }
}
