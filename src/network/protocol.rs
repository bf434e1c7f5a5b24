//! Framed message protocol.
//!
//! Every message on the wire is a fixed 32-byte header followed by the
//! payload. Header fields are big-endian: magic `0x48595045` ("HYPE"),
//! version, type, flags, message id, payload size, nanosecond timestamp, and
//! a CRC32 over the payload bytes. A header is valid iff the magic and
//! version match and the payload size is within the 10 MiB limit.

use rand::RngCore;
use std::time::{SystemTime, UNIX_EPOCH};

use super::wire::WireError;

/// Protocol magic number ("HYPE").
pub const PROTOCOL_MAGIC: u32 = 0x4859_5045;
/// Current protocol version.
pub const PROTOCOL_VERSION: u16 = 1;
/// Serialized header size in bytes.
pub const MESSAGE_HEADER_SIZE: usize = 32;
/// Maximum accepted payload size (10 MiB).
pub const MAX_PAYLOAD_SIZE: u32 = 10 * 1024 * 1024;

/// Stable numeric message type registry.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Handshake = 0x01,
    HandshakeAck = 0x02,
    Heartbeat = 0x03,
    Disconnect = 0x04,
    SecureHandshake = 0x05,
    SecureHandshakeAck = 0x06,
    EncryptedMessage = 0x07,
    KeyRotation = 0x08,

    PeerAnnounce = 0x10,
    PeerQuery = 0x11,
    PeerResponse = 0x12,

    FileAnnounce = 0x20,
    FileRequest = 0x21,
    FileResponse = 0x22,
    ChunkRequest = 0x23,
    ChunkData = 0x24,
    ChunkAck = 0x25,

    RouteUpdate = 0x30,
    TopologySync = 0x31,
    FileQuery = 0x32,
    FileQueryResponse = 0x33,

    Error = 0xFF,
}

impl MessageType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::Handshake),
            0x02 => Some(Self::HandshakeAck),
            0x03 => Some(Self::Heartbeat),
            0x04 => Some(Self::Disconnect),
            0x05 => Some(Self::SecureHandshake),
            0x06 => Some(Self::SecureHandshakeAck),
            0x07 => Some(Self::EncryptedMessage),
            0x08 => Some(Self::KeyRotation),
            0x10 => Some(Self::PeerAnnounce),
            0x11 => Some(Self::PeerQuery),
            0x12 => Some(Self::PeerResponse),
            0x20 => Some(Self::FileAnnounce),
            0x21 => Some(Self::FileRequest),
            0x22 => Some(Self::FileResponse),
            0x23 => Some(Self::ChunkRequest),
            0x24 => Some(Self::ChunkData),
            0x25 => Some(Self::ChunkAck),
            0x30 => Some(Self::RouteUpdate),
            0x31 => Some(Self::TopologySync),
            0x32 => Some(Self::FileQuery),
            0x33 => Some(Self::FileQueryResponse),
            0xFF => Some(Self::Error),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Header flag bits. Only `ENCRYPTED` is meaningful in protocol v1.
pub mod flags {
    pub const NONE: u8 = 0x00;
    pub const COMPRESSED: u8 = 0x01;
    pub const ENCRYPTED: u8 = 0x02;
    pub const FRAGMENTED: u8 = 0x04;
    pub const PRIORITY: u8 = 0x08;
}

/// Wire protocol violations. All of these are fatal for the connection that
/// produced them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Header magic did not match.
    BadMagic(u32),
    /// Protocol version not supported.
    UnsupportedVersion(u16),
    /// Type byte not in the registry.
    UnknownType(u8),
    /// Payload size field exceeds the 10 MiB limit.
    PayloadTooLarge(u32),
    /// CRC32 over the payload did not match the header checksum.
    ChecksumMismatch,
    /// Header or payload bytes could not be decoded.
    Malformed(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::BadMagic(m) => write!(f, "bad magic: {:#010x}", m),
            ProtocolError::UnsupportedVersion(v) => write!(f, "unsupported version: {}", v),
            ProtocolError::UnknownType(t) => write!(f, "unknown message type: {:#04x}", t),
            ProtocolError::PayloadTooLarge(n) => {
                write!(f, "payload size {} exceeds limit {}", n, MAX_PAYLOAD_SIZE)
            }
            ProtocolError::ChecksumMismatch => write!(f, "payload checksum mismatch"),
            ProtocolError::Malformed(e) => write!(f, "malformed message: {}", e),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<WireError> for ProtocolError {
    fn from(e: WireError) -> Self {
        ProtocolError::Malformed(e.to_string())
    }
}

/// CRC32 (IEEE, reflected polynomial `0xEDB88320`) over a byte slice.
pub fn crc32(data: &[u8]) -> u32 {
    const POLYNOMIAL: u32 = 0xEDB8_8320;
    let mut crc: u32 = 0xFFFF_FFFF;
    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ POLYNOMIAL;
            } else {
                crc >>= 1;
            }
        }
    }
    !crc
}

/// Fixed 32-byte message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub magic: u32,
    pub version: u16,
    pub msg_type: MessageType,
    pub flags: u8,
    pub message_id: u64,
    pub payload_size: u32,
    pub timestamp_ns: u64,
    pub checksum: u32,
}

fn generate_message_id() -> u64 {
    let mut rng = rand::rngs::OsRng;
    rng.next_u64()
}

fn timestamp_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}

impl MessageHeader {
    /// Create a header for a payload of the given size. The checksum is zero
    /// until [`calculate_checksum`](Self::calculate_checksum) is called.
    pub fn new(msg_type: MessageType, payload_size: u32) -> Self {
        Self {
            magic: PROTOCOL_MAGIC,
            version: PROTOCOL_VERSION,
            msg_type,
            flags: flags::NONE,
            message_id: generate_message_id(),
            payload_size,
            timestamp_ns: timestamp_ns(),
            checksum: 0,
        }
    }

    /// `true` iff magic and version match and the payload size is acceptable.
    pub fn is_valid(&self) -> bool {
        self.magic == PROTOCOL_MAGIC
            && self.version == PROTOCOL_VERSION
            && self.payload_size <= MAX_PAYLOAD_SIZE
    }

    pub fn calculate_checksum(&mut self, payload: &[u8]) {
        self.checksum = crc32(payload);
    }

    pub fn verify_checksum(&self, payload: &[u8]) -> bool {
        crc32(payload) == self.checksum
    }

    pub fn encode(&self) -> [u8; MESSAGE_HEADER_SIZE] {
        let mut buf = [0u8; MESSAGE_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.magic.to_be_bytes());
        buf[4..6].copy_from_slice(&self.version.to_be_bytes());
        buf[6] = self.msg_type.as_byte();
        buf[7] = self.flags;
        buf[8..16].copy_from_slice(&self.message_id.to_be_bytes());
        buf[16..20].copy_from_slice(&self.payload_size.to_be_bytes());
        buf[20..28].copy_from_slice(&self.timestamp_ns.to_be_bytes());
        buf[28..32].copy_from_slice(&self.checksum.to_be_bytes());
        buf
    }

    /// Decode and validate a header from exactly 32 bytes.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < MESSAGE_HEADER_SIZE {
            return Err(ProtocolError::Malformed(format!(
                "header needs {} bytes, got {}",
                MESSAGE_HEADER_SIZE,
                data.len()
            )));
        }

        let magic = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        if magic != PROTOCOL_MAGIC {
            return Err(ProtocolError::BadMagic(magic));
        }

        let version = u16::from_be_bytes([data[4], data[5]]);
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }

        let msg_type = MessageType::from_byte(data[6]).ok_or(ProtocolError::UnknownType(data[6]))?;
        let flags = data[7];

        let message_id = u64::from_be_bytes([
            data[8], data[9], data[10], data[11], data[12], data[13], data[14], data[15],
        ]);
        let payload_size = u32::from_be_bytes([data[16], data[17], data[18], data[19]]);
        if payload_size > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge(payload_size));
        }

        let timestamp_ns = u64::from_be_bytes([
            data[20], data[21], data[22], data[23], data[24], data[25], data[26], data[27],
        ]);
        let checksum = u32::from_be_bytes([data[28], data[29], data[30], data[31]]);

        Ok(Self {
            magic,
            version,
            msg_type,
            flags,
            message_id,
            payload_size,
            timestamp_ns,
            checksum,
        })
    }
}

/// Frame a payload: header (with checksum) followed by the payload bytes.
pub fn frame_message(msg_type: MessageType, flags: u8, payload: &[u8]) -> Vec<u8> {
    let mut header = MessageHeader::new(msg_type, payload.len() as u32);
    header.flags = flags;
    header.calculate_checksum(payload);

    let mut frame = Vec::with_capacity(MESSAGE_HEADER_SIZE + payload.len());
    frame.extend_from_slice(&header.encode());
    frame.extend_from_slice(payload);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc32_known_vector() {
        // CRC32 of "123456789" is the classic check value 0xCBF43926
        assert_eq!(crc32(b"123456789"), 0xCBF43926);
    }

    #[test]
    fn test_crc32_empty() {
        assert_eq!(crc32(&[]), 0);
    }

    #[test]
    fn test_header_roundtrip_literal() {
        // Scenario from the protocol test plan: fixed field values must
        // produce the documented leading bytes and survive a round trip.
        let mut header = MessageHeader::new(MessageType::Heartbeat, 10);
        header.flags = flags::NONE;
        header.message_id = 0x0102030405060708;
        header.timestamp_ns = 0x1122334455667788;

        let bytes = header.encode();
        assert_eq!(bytes.len(), 32);
        assert_eq!(
            &bytes[..8],
            &[0x48, 0x59, 0x50, 0x45, 0x00, 0x01, 0x03, 0x00]
        );

        let decoded = MessageHeader::decode(&bytes).unwrap();
        assert_eq!(decoded.msg_type, MessageType::Heartbeat);
        assert_eq!(decoded.flags, 0);
        assert_eq!(decoded.message_id, 0x0102030405060708);
        assert_eq!(decoded.payload_size, 10);
        assert_eq!(decoded.timestamp_ns, 0x1122334455667788);
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_header_rejects_bad_magic() {
        let mut bytes = MessageHeader::new(MessageType::Heartbeat, 0).encode();
        bytes[0] = 0x00;
        assert!(matches!(
            MessageHeader::decode(&bytes),
            Err(ProtocolError::BadMagic(_))
        ));
    }

    #[test]
    fn test_header_rejects_bad_version() {
        let mut bytes = MessageHeader::new(MessageType::Heartbeat, 0).encode();
        bytes[5] = 0x02;
        assert!(matches!(
            MessageHeader::decode(&bytes),
            Err(ProtocolError::UnsupportedVersion(2))
        ));
    }

    #[test]
    fn test_header_rejects_unknown_type() {
        let mut bytes = MessageHeader::new(MessageType::Heartbeat, 0).encode();
        bytes[6] = 0x7E;
        assert_eq!(
            MessageHeader::decode(&bytes),
            Err(ProtocolError::UnknownType(0x7E))
        );
    }

    #[test]
    fn test_payload_size_boundary() {
        // Exactly 10 MiB is accepted
        let mut bytes = MessageHeader::new(MessageType::ChunkData, MAX_PAYLOAD_SIZE).encode();
        assert!(MessageHeader::decode(&bytes).is_ok());

        // 10 MiB + 1 is rejected
        bytes[16..20].copy_from_slice(&(MAX_PAYLOAD_SIZE + 1).to_be_bytes());
        assert_eq!(
            MessageHeader::decode(&bytes),
            Err(ProtocolError::PayloadTooLarge(MAX_PAYLOAD_SIZE + 1))
        );
    }

    #[test]
    fn test_checksum_verify() {
        let payload = b"chunk payload bytes";
        let mut header = MessageHeader::new(MessageType::ChunkData, payload.len() as u32);
        header.calculate_checksum(payload);

        assert!(header.verify_checksum(payload));
        assert!(!header.verify_checksum(b"chunk payload byteZ"));
    }

    #[test]
    fn test_frame_message_layout() {
        let payload = vec![0xAA; 16];
        let frame = frame_message(MessageType::Heartbeat, flags::NONE, &payload);
        assert_eq!(frame.len(), MESSAGE_HEADER_SIZE + 16);

        let header = MessageHeader::decode(&frame[..MESSAGE_HEADER_SIZE]).unwrap();
        assert_eq!(header.payload_size, 16);
        assert!(header.verify_checksum(&frame[MESSAGE_HEADER_SIZE..]));
    }

    #[test]
    fn test_message_type_byte_roundtrip() {
        let types = [
            MessageType::Handshake,
            MessageType::HandshakeAck,
            MessageType::Heartbeat,
            MessageType::Disconnect,
            MessageType::SecureHandshake,
            MessageType::SecureHandshakeAck,
            MessageType::EncryptedMessage,
            MessageType::KeyRotation,
            MessageType::PeerAnnounce,
            MessageType::PeerQuery,
            MessageType::PeerResponse,
            MessageType::FileAnnounce,
            MessageType::FileRequest,
            MessageType::FileResponse,
            MessageType::ChunkRequest,
            MessageType::ChunkData,
            MessageType::ChunkAck,
            MessageType::RouteUpdate,
            MessageType::TopologySync,
            MessageType::FileQuery,
            MessageType::FileQueryResponse,
            MessageType::Error,
        ];
        for t in types {
            assert_eq!(MessageType::from_byte(t.as_byte()), Some(t));
        }
        assert_eq!(MessageType::from_byte(0x0F), None);
        assert_eq!(MessageType::from_byte(0x60), None);
    }

    #[test]
    fn test_header_is_valid_invariant() {
        let header = MessageHeader::new(MessageType::Heartbeat, 128);
        assert!(header.is_valid());

        let mut bad = header;
        bad.magic = 0x12345678;
        assert!(!bad.is_valid());

        let mut bad = header;
        bad.payload_size = MAX_PAYLOAD_SIZE + 1;
        assert!(!bad.is_valid());
    }
}
