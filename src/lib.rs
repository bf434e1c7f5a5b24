//! HyperShare: decentralized peer-to-peer file distribution.
//!
//! Peers on the same network discover one another over UDP multicast,
//! authenticate with Ed25519 identities via an X25519 handshake, and exchange
//! large files as BLAKE3-verified chunks over encrypted TCP sessions.
//!
//! The crate is assembled bottom-up:
//!
//! - [`security`] - identity keys, the authenticated handshake, session keys,
//!   and the encrypted message wrapper with replay protection
//! - [`network`] - the framed wire protocol, connection engine, UDP
//!   discovery, and the multi-hop peer router
//! - [`storage`] - chunking, content-addressed verification, the file index,
//!   and resumable-transfer state
//! - [`transfer`] - windowed chunk transfers with congestion control,
//!   bandwidth limiting, and progress tracking
//! - [`node`] - wires everything into a running daemon

pub mod config;
pub mod error;
pub mod events;
pub mod ipc;
pub mod network;
pub mod node;
pub mod security;
pub mod storage;
pub mod transfer;

pub use config::Config;
pub use error::NodeError;
pub use events::NodeEvent;
pub use node::Node;
