//! Node events for the embedding application.

use std::net::IpAddr;
use std::path::PathBuf;

/// Notifications emitted by a running node.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// A peer appeared on the local network.
    PeerDiscovered {
        peer_id: u32,
        ip: IpAddr,
        tcp_port: u16,
    },
    /// A discovered peer expired.
    PeerLost { peer_id: u32 },
    /// A connection completed the secure handshake.
    PeerAuthenticated {
        peer_id: u32,
        fingerprint: String,
    },
    /// An authenticated connection closed.
    PeerDisconnected { peer_id: u32 },
    /// A remote peer announced a file.
    FileAnnounced {
        file_id: String,
        filename: String,
        file_size: u64,
        peer_id: u32,
    },
    /// A download made progress.
    TransferProgress {
        session_id: String,
        file_id: String,
        percent: f64,
        bytes_transferred: u64,
    },
    /// A download finished and verified; the file is in the downloads
    /// directory.
    TransferCompleted {
        session_id: String,
        file_id: String,
        path: PathBuf,
    },
    /// A transfer gave up.
    TransferFailed {
        session_id: String,
        file_id: String,
        reason: String,
    },
}
