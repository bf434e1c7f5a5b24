//! Networking: the framed wire protocol, connection engine, UDP multicast
//! discovery, and the multi-hop peer router.

pub mod connection;
pub mod discovery;
pub mod manager;
pub mod messages;
pub mod protocol;
pub mod router;
pub mod wire;

pub use connection::{Connection, ConnectionEvent, ConnectionState};
pub use discovery::{Discovery, DiscoveryEvent};
pub use manager::ConnectionManager;
pub use messages::Message;
pub use protocol::{MessageHeader, MessageType, ProtocolError};
pub use router::PeerRouter;
