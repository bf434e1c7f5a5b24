//! Typed message payloads and the tagged message union.
//!
//! Each wire message type has a canonical payload codec; the [`Message`]
//! enum maps numeric type codes to payloads for dispatch. Round-trip
//! serialization is lossless for every variant.

use crate::security::handshake::{SecureHandshakeAckMessage, SecureHandshakeMessage};
use crate::security::handshake::KeyRotationMessage;
use crate::security::secure_message::SecureMessage;
use crate::storage::metadata::FileMetadata;

use super::protocol::{flags, frame_message, MessageType, ProtocolError};
use super::wire::{WireError, WirePayload, WireReader, WireWriter};

/// Fixed-point scale for reliability/availability scores on the wire.
const SCORE_SCALE: f64 = 1_000_000.0;

fn put_bool(w: &mut WireWriter, value: bool) {
    w.put_u8(u8::from(value));
}

fn get_bool(r: &mut WireReader<'_>, field: &'static str) -> Result<bool, WireError> {
    Ok(r.get_u8(field)? != 0)
}

fn put_string_seq(w: &mut WireWriter, items: &[String]) {
    w.put_u32(items.len() as u32);
    for item in items {
        w.put_string(item);
    }
}

fn get_string_seq(r: &mut WireReader<'_>, field: &'static str) -> Result<Vec<String>, WireError> {
    let count = r.get_u32(field)? as usize;
    let mut items = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        items.push(r.get_string(field)?);
    }
    Ok(items)
}

/// Encode a score in `[0, 1]` as parts-per-million.
pub fn score_to_wire(score: f64) -> u32 {
    (score.clamp(0.0, 1.0) * SCORE_SCALE) as u32
}

/// Decode a parts-per-million score.
pub fn score_from_wire(fp: u32) -> f64 {
    (f64::from(fp) / SCORE_SCALE).clamp(0.0, 1.0)
}

/// Legacy plaintext peer-info exchange (0x01/0x02).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeMessage {
    pub peer_id: u32,
    pub listen_port: u16,
    pub peer_name: String,
    pub capabilities: u32,
}

impl WirePayload for HandshakeMessage {
    fn encode(&self, w: &mut WireWriter) {
        w.put_u32(self.peer_id);
        w.put_u16(self.listen_port);
        w.put_string(&self.peer_name);
        w.put_u32(self.capabilities);
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            peer_id: r.get_u32("peer_id")?,
            listen_port: r.get_u16("listen_port")?,
            peer_name: r.get_string("peer_name")?,
            capabilities: r.get_u32("capabilities")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatMessage {
    pub timestamp: u64,
    pub active_connections: u32,
    pub available_files: u32,
}

impl WirePayload for HeartbeatMessage {
    fn encode(&self, w: &mut WireWriter) {
        w.put_u64(self.timestamp);
        w.put_u32(self.active_connections);
        w.put_u32(self.available_files);
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            timestamp: r.get_u64("timestamp")?,
            active_connections: r.get_u32("active_connections")?,
            available_files: r.get_u32("available_files")?,
        })
    }
}

/// Multicast peer announcement and unicast query response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAnnounceMessage {
    pub peer_id: u32,
    /// Advisory only: receivers use the datagram's observed source address.
    pub ip_address: String,
    pub port: u16,
    pub last_seen: u64,
}

impl WirePayload for PeerAnnounceMessage {
    fn encode(&self, w: &mut WireWriter) {
        w.put_u32(self.peer_id);
        w.put_string(&self.ip_address);
        w.put_u16(self.port);
        w.put_u64(self.last_seen);
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            peer_id: r.get_u32("peer_id")?,
            ip_address: r.get_string("ip_address")?,
            port: r.get_u16("port")?,
            last_seen: r.get_u64("last_seen")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAnnounceMessage {
    pub file_id: String,
    pub filename: String,
    pub file_size: u64,
    pub file_hash: String,
    pub tags: Vec<String>,
}

impl WirePayload for FileAnnounceMessage {
    fn encode(&self, w: &mut WireWriter) {
        w.put_string(&self.file_id);
        w.put_string(&self.filename);
        w.put_u64(self.file_size);
        w.put_string(&self.file_hash);
        put_string_seq(w, &self.tags);
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            file_id: r.get_string("file_id")?,
            filename: r.get_string("filename")?,
            file_size: r.get_u64("file_size")?,
            file_hash: r.get_string("file_hash")?,
            tags: get_string_seq(r, "tags")?,
        })
    }
}

/// Request for file metadata ahead of a chunk transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRequestMessage {
    pub file_id: String,
    pub start_offset: u64,
    pub length: u64,
    pub preferred_chunk_size: u32,
}

impl WirePayload for FileRequestMessage {
    fn encode(&self, w: &mut WireWriter) {
        w.put_string(&self.file_id);
        w.put_u64(self.start_offset);
        w.put_u64(self.length);
        w.put_u32(self.preferred_chunk_size);
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            file_id: r.get_string("file_id")?,
            start_offset: r.get_u64("start_offset")?,
            length: r.get_u64("length")?,
            preferred_chunk_size: r.get_u32("preferred_chunk_size")?,
        })
    }
}

fn encode_metadata(w: &mut WireWriter, m: &FileMetadata) {
    w.put_string(&m.file_id);
    w.put_string(&m.file_hash);
    w.put_string(&m.filename);
    w.put_u64(m.file_size);
    w.put_u32(m.chunk_size);
    w.put_u32(m.chunk_count);
    put_string_seq(w, &m.chunk_hashes);
    w.put_string(&m.file_type);
    w.put_string(&m.description);
    put_string_seq(w, &m.tags);
    w.put_u64(m.created_at);
    w.put_u64(m.modified_at);
}

fn decode_metadata(r: &mut WireReader<'_>) -> Result<FileMetadata, WireError> {
    Ok(FileMetadata {
        file_id: r.get_string("file_id")?,
        file_hash: r.get_string("file_hash")?,
        filename: r.get_string("filename")?,
        // The holder's local path never travels on the wire.
        file_path: String::new(),
        file_size: r.get_u64("file_size")?,
        chunk_size: r.get_u32("chunk_size")?,
        chunk_count: r.get_u32("chunk_count")?,
        chunk_hashes: get_string_seq(r, "chunk_hashes")?,
        file_type: r.get_string("file_type")?,
        description: r.get_string("description")?,
        tags: get_string_seq(r, "tags")?,
        created_at: r.get_u64("created_at")?,
        modified_at: r.get_u64("modified_at")?,
    })
}

/// Response to a [`FileRequestMessage`]; carries metadata when accepted.
#[derive(Debug, Clone, PartialEq)]
pub struct FileResponseMessage {
    pub file_id: String,
    pub accepted: bool,
    pub error_message: String,
    pub metadata: Option<FileMetadata>,
}

impl WirePayload for FileResponseMessage {
    fn encode(&self, w: &mut WireWriter) {
        w.put_string(&self.file_id);
        put_bool(w, self.accepted);
        w.put_string(&self.error_message);
        if let Some(metadata) = &self.metadata {
            encode_metadata(w, metadata);
        }
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        let file_id = r.get_string("file_id")?;
        let accepted = get_bool(r, "accepted")?;
        let error_message = r.get_string("error_message")?;
        let metadata = if accepted {
            Some(decode_metadata(r)?)
        } else {
            None
        };
        Ok(Self {
            file_id,
            accepted,
            error_message,
            metadata,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRequestMessage {
    pub file_id: String,
    pub chunk_index: u64,
    pub chunk_size: u32,
}

impl WirePayload for ChunkRequestMessage {
    fn encode(&self, w: &mut WireWriter) {
        w.put_string(&self.file_id);
        w.put_u64(self.chunk_index);
        w.put_u32(self.chunk_size);
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            file_id: r.get_string("file_id")?,
            chunk_index: r.get_u64("chunk_index")?,
            chunk_size: r.get_u32("chunk_size")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkDataMessage {
    pub file_id: String,
    pub chunk_index: u64,
    pub data: Vec<u8>,
    pub chunk_hash: String,
}

impl WirePayload for ChunkDataMessage {
    fn encode(&self, w: &mut WireWriter) {
        w.put_string(&self.file_id);
        w.put_u64(self.chunk_index);
        w.put_var_bytes(&self.data);
        w.put_string(&self.chunk_hash);
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            file_id: r.get_string("file_id")?,
            chunk_index: r.get_u64("chunk_index")?,
            data: r.get_var_bytes("data")?,
            chunk_hash: r.get_string("chunk_hash")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkAckMessage {
    pub file_id: String,
    pub chunk_index: u64,
    pub success: bool,
    pub error_message: String,
}

impl WirePayload for ChunkAckMessage {
    fn encode(&self, w: &mut WireWriter) {
        w.put_string(&self.file_id);
        w.put_u64(self.chunk_index);
        put_bool(w, self.success);
        w.put_string(&self.error_message);
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            file_id: r.get_string("file_id")?,
            chunk_index: r.get_u64("chunk_index")?,
            success: get_bool(r, "success")?,
            error_message: r.get_string("error_message")?,
        })
    }
}

/// One peer advertised inside a route update.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingPeerInfo {
    pub peer_id: u32,
    pub ip_address: String,
    pub port: u16,
    /// Milliseconds since the epoch.
    pub last_seen_ms: u64,
    pub hop_count: u8,
    pub next_hop_peer_id: u32,
    /// In `[0, 1]`.
    pub reliability_score: f64,
    /// Bytes per second.
    pub bandwidth_estimate: u64,
}

impl WirePayload for RoutingPeerInfo {
    fn encode(&self, w: &mut WireWriter) {
        w.put_u32(self.peer_id);
        w.put_string(&self.ip_address);
        w.put_u16(self.port);
        w.put_u64(self.last_seen_ms);
        w.put_u8(self.hop_count);
        w.put_u32(self.next_hop_peer_id);
        w.put_u32(score_to_wire(self.reliability_score));
        w.put_u64(self.bandwidth_estimate);
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            peer_id: r.get_u32("peer_id")?,
            ip_address: r.get_string("ip_address")?,
            port: r.get_u16("port")?,
            last_seen_ms: r.get_u64("last_seen_ms")?,
            hop_count: r.get_u8("hop_count")?,
            next_hop_peer_id: r.get_u32("next_hop_peer_id")?,
            reliability_score: score_from_wire(r.get_u32("reliability_score")?),
            bandwidth_estimate: r.get_u64("bandwidth_estimate")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RouteUpdateMessage {
    pub source_peer_id: u32,
    pub sequence_number: u64,
    pub hop_count: u8,
    pub peer_updates: Vec<RoutingPeerInfo>,
}

impl WirePayload for RouteUpdateMessage {
    fn encode(&self, w: &mut WireWriter) {
        w.put_u32(self.source_peer_id);
        w.put_u64(self.sequence_number);
        w.put_u8(self.hop_count);
        w.put_u32(self.peer_updates.len() as u32);
        for peer in &self.peer_updates {
            peer.encode(w);
        }
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        let source_peer_id = r.get_u32("source_peer_id")?;
        let sequence_number = r.get_u64("sequence_number")?;
        let hop_count = r.get_u8("hop_count")?;
        let count = r.get_u32("peer_count")? as usize;
        let mut peer_updates = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            peer_updates.push(RoutingPeerInfo::decode(r)?);
        }
        Ok(Self {
            source_peer_id,
            sequence_number,
            hop_count,
            peer_updates,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologySyncMessage {
    pub requesting_peer_id: u32,
    pub last_known_sequence: u64,
    pub known_peers: Vec<u32>,
}

impl WirePayload for TopologySyncMessage {
    fn encode(&self, w: &mut WireWriter) {
        w.put_u32(self.requesting_peer_id);
        w.put_u64(self.last_known_sequence);
        w.put_u32(self.known_peers.len() as u32);
        for peer_id in &self.known_peers {
            w.put_u32(*peer_id);
        }
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        let requesting_peer_id = r.get_u32("requesting_peer_id")?;
        let last_known_sequence = r.get_u64("last_known_sequence")?;
        let count = r.get_u32("peer_count")? as usize;
        let mut known_peers = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            known_peers.push(r.get_u32("peer_id")?);
        }
        Ok(Self {
            requesting_peer_id,
            last_known_sequence,
            known_peers,
        })
    }
}

/// Flooded file search query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileQueryMessage {
    pub file_id: String,
    pub query_hash: String,
    pub source_peer_id: u32,
    pub query_id: u32,
    pub hop_count: u8,
    pub search_terms: Vec<String>,
}

impl WirePayload for FileQueryMessage {
    fn encode(&self, w: &mut WireWriter) {
        w.put_string(&self.file_id);
        w.put_string(&self.query_hash);
        w.put_u32(self.source_peer_id);
        w.put_u32(self.query_id);
        w.put_u8(self.hop_count);
        put_string_seq(w, &self.search_terms);
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            file_id: r.get_string("file_id")?,
            query_hash: r.get_string("query_hash")?,
            source_peer_id: r.get_u32("source_peer_id")?,
            query_id: r.get_u32("query_id")?,
            hop_count: r.get_u8("hop_count")?,
            search_terms: get_string_seq(r, "search_terms")?,
        })
    }
}

/// One known location of a file, as carried in query responses.
#[derive(Debug, Clone, PartialEq)]
pub struct FileLocationInfo {
    pub file_id: String,
    pub peer_id: u32,
    pub file_hash: String,
    pub file_size: u64,
    /// Milliseconds since the epoch.
    pub announced_at_ms: u64,
    /// In `[0, 1]`.
    pub availability_score: f64,
}

impl WirePayload for FileLocationInfo {
    fn encode(&self, w: &mut WireWriter) {
        w.put_string(&self.file_id);
        w.put_u32(self.peer_id);
        w.put_string(&self.file_hash);
        w.put_u64(self.file_size);
        w.put_u64(self.announced_at_ms);
        w.put_u32(score_to_wire(self.availability_score));
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            file_id: r.get_string("file_id")?,
            peer_id: r.get_u32("peer_id")?,
            file_hash: r.get_string("file_hash")?,
            file_size: r.get_u64("file_size")?,
            announced_at_ms: r.get_u64("announced_at_ms")?,
            availability_score: score_from_wire(r.get_u32("availability_score")?),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FileQueryResponseMessage {
    pub query_id: u32,
    pub responding_peer_id: u32,
    pub file_locations: Vec<FileLocationInfo>,
}

impl WirePayload for FileQueryResponseMessage {
    fn encode(&self, w: &mut WireWriter) {
        w.put_u32(self.query_id);
        w.put_u32(self.responding_peer_id);
        w.put_u32(self.file_locations.len() as u32);
        for location in &self.file_locations {
            location.encode(w);
        }
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        let query_id = r.get_u32("query_id")?;
        let responding_peer_id = r.get_u32("responding_peer_id")?;
        let count = r.get_u32("location_count")? as usize;
        let mut file_locations = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            file_locations.push(FileLocationInfo::decode(r)?);
        }
        Ok(Self {
            query_id,
            responding_peer_id,
            file_locations,
        })
    }
}

/// Protocol-level error codes carried in [`ErrorMessage`].
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    None = 0,
    ProtocolVersion = 1,
    InvalidMessage = 2,
    AuthenticationFailed = 3,
    FileNotFound = 4,
    ChunkNotAvailable = 5,
    TransferFailed = 6,
    PeerUnavailable = 7,
    RateLimited = 8,
    InternalError = 99,
}

impl ErrorCode {
    pub fn from_u32(code: u32) -> Self {
        match code {
            0 => Self::None,
            1 => Self::ProtocolVersion,
            2 => Self::InvalidMessage,
            3 => Self::AuthenticationFailed,
            4 => Self::FileNotFound,
            5 => Self::ChunkNotAvailable,
            6 => Self::TransferFailed,
            7 => Self::PeerUnavailable,
            8 => Self::RateLimited,
            _ => Self::InternalError,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorMessage {
    pub error_code: u32,
    pub error_message: String,
    pub request_id: u64,
}

impl ErrorMessage {
    pub fn new(code: ErrorCode, message: impl Into<String>, request_id: u64) -> Self {
        Self {
            error_code: code as u32,
            error_message: message.into(),
            request_id,
        }
    }

    pub fn code(&self) -> ErrorCode {
        ErrorCode::from_u32(self.error_code)
    }
}

impl WirePayload for ErrorMessage {
    fn encode(&self, w: &mut WireWriter) {
        w.put_u32(self.error_code);
        w.put_string(&self.error_message);
        w.put_u64(self.request_id);
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            error_code: r.get_u32("error_code")?,
            error_message: r.get_string("error_message")?,
            request_id: r.get_u64("request_id")?,
        })
    }
}

/// Tagged union of every message in the registry.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Handshake(HandshakeMessage),
    HandshakeAck(HandshakeMessage),
    Heartbeat(HeartbeatMessage),
    Disconnect,
    SecureHandshake(SecureHandshakeMessage),
    SecureHandshakeAck(SecureHandshakeAckMessage),
    Encrypted(SecureMessage),
    KeyRotation(KeyRotationMessage),
    PeerAnnounce(PeerAnnounceMessage),
    PeerQuery,
    PeerResponse(PeerAnnounceMessage),
    FileAnnounce(FileAnnounceMessage),
    FileRequest(FileRequestMessage),
    FileResponse(FileResponseMessage),
    ChunkRequest(ChunkRequestMessage),
    ChunkData(ChunkDataMessage),
    ChunkAck(ChunkAckMessage),
    RouteUpdate(RouteUpdateMessage),
    TopologySync(TopologySyncMessage),
    FileQuery(FileQueryMessage),
    FileQueryResponse(FileQueryResponseMessage),
    Error(ErrorMessage),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Handshake(_) => MessageType::Handshake,
            Message::HandshakeAck(_) => MessageType::HandshakeAck,
            Message::Heartbeat(_) => MessageType::Heartbeat,
            Message::Disconnect => MessageType::Disconnect,
            Message::SecureHandshake(_) => MessageType::SecureHandshake,
            Message::SecureHandshakeAck(_) => MessageType::SecureHandshakeAck,
            Message::Encrypted(_) => MessageType::EncryptedMessage,
            Message::KeyRotation(_) => MessageType::KeyRotation,
            Message::PeerAnnounce(_) => MessageType::PeerAnnounce,
            Message::PeerQuery => MessageType::PeerQuery,
            Message::PeerResponse(_) => MessageType::PeerResponse,
            Message::FileAnnounce(_) => MessageType::FileAnnounce,
            Message::FileRequest(_) => MessageType::FileRequest,
            Message::FileResponse(_) => MessageType::FileResponse,
            Message::ChunkRequest(_) => MessageType::ChunkRequest,
            Message::ChunkData(_) => MessageType::ChunkData,
            Message::ChunkAck(_) => MessageType::ChunkAck,
            Message::RouteUpdate(_) => MessageType::RouteUpdate,
            Message::TopologySync(_) => MessageType::TopologySync,
            Message::FileQuery(_) => MessageType::FileQuery,
            Message::FileQueryResponse(_) => MessageType::FileQueryResponse,
            Message::Error(_) => MessageType::Error,
        }
    }

    pub fn encode_payload(&self) -> Vec<u8> {
        match self {
            Message::Handshake(m) | Message::HandshakeAck(m) => m.to_bytes(),
            Message::Heartbeat(m) => m.to_bytes(),
            Message::Disconnect | Message::PeerQuery => Vec::new(),
            Message::SecureHandshake(m) => m.to_bytes(),
            Message::SecureHandshakeAck(m) => m.to_bytes(),
            Message::Encrypted(m) => m.to_bytes(),
            Message::KeyRotation(m) => m.to_bytes(),
            Message::PeerAnnounce(m) | Message::PeerResponse(m) => m.to_bytes(),
            Message::FileAnnounce(m) => m.to_bytes(),
            Message::FileRequest(m) => m.to_bytes(),
            Message::FileResponse(m) => m.to_bytes(),
            Message::ChunkRequest(m) => m.to_bytes(),
            Message::ChunkData(m) => m.to_bytes(),
            Message::ChunkAck(m) => m.to_bytes(),
            Message::RouteUpdate(m) => m.to_bytes(),
            Message::TopologySync(m) => m.to_bytes(),
            Message::FileQuery(m) => m.to_bytes(),
            Message::FileQueryResponse(m) => m.to_bytes(),
            Message::Error(m) => m.to_bytes(),
        }
    }

    /// Decode a payload for a known message type.
    pub fn decode(msg_type: MessageType, payload: &[u8]) -> Result<Self, ProtocolError> {
        let message = match msg_type {
            MessageType::Handshake => Message::Handshake(HandshakeMessage::from_bytes(payload)?),
            MessageType::HandshakeAck => {
                Message::HandshakeAck(HandshakeMessage::from_bytes(payload)?)
            }
            MessageType::Heartbeat => Message::Heartbeat(HeartbeatMessage::from_bytes(payload)?),
            MessageType::Disconnect => Message::Disconnect,
            MessageType::SecureHandshake => {
                Message::SecureHandshake(SecureHandshakeMessage::from_bytes(payload)?)
            }
            MessageType::SecureHandshakeAck => {
                Message::SecureHandshakeAck(SecureHandshakeAckMessage::from_bytes(payload)?)
            }
            MessageType::EncryptedMessage => {
                Message::Encrypted(SecureMessage::from_bytes(payload)?)
            }
            MessageType::KeyRotation => {
                Message::KeyRotation(KeyRotationMessage::from_bytes(payload)?)
            }
            MessageType::PeerAnnounce => {
                Message::PeerAnnounce(PeerAnnounceMessage::from_bytes(payload)?)
            }
            MessageType::PeerQuery => Message::PeerQuery,
            MessageType::PeerResponse => {
                Message::PeerResponse(PeerAnnounceMessage::from_bytes(payload)?)
            }
            MessageType::FileAnnounce => {
                Message::FileAnnounce(FileAnnounceMessage::from_bytes(payload)?)
            }
            MessageType::FileRequest => {
                Message::FileRequest(FileRequestMessage::from_bytes(payload)?)
            }
            MessageType::FileResponse => {
                Message::FileResponse(FileResponseMessage::from_bytes(payload)?)
            }
            MessageType::ChunkRequest => {
                Message::ChunkRequest(ChunkRequestMessage::from_bytes(payload)?)
            }
            MessageType::ChunkData => Message::ChunkData(ChunkDataMessage::from_bytes(payload)?),
            MessageType::ChunkAck => Message::ChunkAck(ChunkAckMessage::from_bytes(payload)?),
            MessageType::RouteUpdate => {
                Message::RouteUpdate(RouteUpdateMessage::from_bytes(payload)?)
            }
            MessageType::TopologySync => {
                Message::TopologySync(TopologySyncMessage::from_bytes(payload)?)
            }
            MessageType::FileQuery => Message::FileQuery(FileQueryMessage::from_bytes(payload)?),
            MessageType::FileQueryResponse => {
                Message::FileQueryResponse(FileQueryResponseMessage::from_bytes(payload)?)
            }
            MessageType::Error => Message::Error(ErrorMessage::from_bytes(payload)?),
        };
        Ok(message)
    }

    /// Serialize into a complete frame: header (with CRC) plus payload. The
    /// `ENCRYPTED` header flag is set for wrapped payloads.
    pub fn to_frame(&self) -> Vec<u8> {
        let payload = self.encode_payload();
        let frame_flags = match self {
            Message::Encrypted(_) => flags::ENCRYPTED,
            _ => flags::NONE,
        };
        frame_message(self.message_type(), frame_flags, &payload)
    }
}
