//! Canonical wire encoding helpers.
//!
//! All typed payloads serialize their fields in declared order, big-endian,
//! with `u32` length prefixes for strings, byte blobs, and sequences. The
//! writer/reader pair below is the single place that byte order and length
//! handling live; payload codecs are written against it.

/// Errors when decoding wire data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Input ended before the named field could be read.
    UnexpectedEnd(&'static str),
    /// A length-prefixed string was not valid UTF-8.
    InvalidUtf8,
    /// Bytes remained after a complete payload.
    TrailingBytes(usize),
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireError::UnexpectedEnd(field) => write!(f, "insufficient data for {}", field),
            WireError::InvalidUtf8 => write!(f, "string field is not valid utf-8"),
            WireError::TrailingBytes(n) => write!(f, "{} trailing bytes after payload", n),
        }
    }
}

impl std::error::Error for WireError {}

/// Append-only encoder for wire payloads.
#[derive(Debug, Default)]
pub struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            buf: Vec::with_capacity(cap),
        }
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn put_u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn put_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn put_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    /// Write a length-prefixed UTF-8 string (`u32` length + bytes).
    pub fn put_string(&mut self, value: &str) {
        self.put_u32(value.len() as u32);
        self.buf.extend_from_slice(value.as_bytes());
    }

    /// Write a length-prefixed byte blob (`u32` length + bytes).
    pub fn put_var_bytes(&mut self, value: &[u8]) {
        self.put_u32(value.len() as u32);
        self.buf.extend_from_slice(value);
    }

    /// Write raw bytes with no length prefix (fixed-size fields).
    pub fn put_bytes(&mut self, value: &[u8]) {
        self.buf.extend_from_slice(value);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor-style decoder for wire payloads.
#[derive(Debug)]
pub struct WireReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, n: usize, field: &'static str) -> Result<&'a [u8], WireError> {
        if self.remaining() < n {
            return Err(WireError::UnexpectedEnd(field));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn get_u8(&mut self, field: &'static str) -> Result<u8, WireError> {
        Ok(self.take(1, field)?[0])
    }

    pub fn get_u16(&mut self, field: &'static str) -> Result<u16, WireError> {
        let b = self.take(2, field)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn get_u32(&mut self, field: &'static str) -> Result<u32, WireError> {
        let b = self.take(4, field)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn get_u64(&mut self, field: &'static str) -> Result<u64, WireError> {
        let b = self.take(8, field)?;
        Ok(u64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    pub fn get_string(&mut self, field: &'static str) -> Result<String, WireError> {
        let len = self.get_u32(field)? as usize;
        let bytes = self.take(len, field)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| WireError::InvalidUtf8)
    }

    pub fn get_var_bytes(&mut self, field: &'static str) -> Result<Vec<u8>, WireError> {
        let len = self.get_u32(field)? as usize;
        Ok(self.take(len, field)?.to_vec())
    }

    pub fn get_array<const N: usize>(&mut self, field: &'static str) -> Result<[u8; N], WireError> {
        let bytes = self.take(N, field)?;
        let mut arr = [0u8; N];
        arr.copy_from_slice(bytes);
        Ok(arr)
    }
}

/// A payload with a canonical wire form.
///
/// Every implementation must round-trip losslessly:
/// `decode(encode(p)) == p` for all values `p`.
pub trait WirePayload: Sized {
    fn encode(&self, w: &mut WireWriter);
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError>;

    fn to_bytes(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        self.encode(&mut w);
        w.into_bytes()
    }

    /// Decode from a full buffer, rejecting trailing bytes.
    fn from_bytes(data: &[u8]) -> Result<Self, WireError> {
        let mut r = WireReader::new(data);
        let value = Self::decode(&mut r)?;
        if !r.is_empty() {
            return Err(WireError::TrailingBytes(r.remaining()));
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_roundtrip() {
        let mut w = WireWriter::new();
        w.put_u8(0xAB);
        w.put_u16(0x1234);
        w.put_u32(0xDEADBEEF);
        w.put_u64(0x0102030405060708);
        let bytes = w.into_bytes();
        assert_eq!(bytes.len(), 15);

        let mut r = WireReader::new(&bytes);
        assert_eq!(r.get_u8("a").unwrap(), 0xAB);
        assert_eq!(r.get_u16("b").unwrap(), 0x1234);
        assert_eq!(r.get_u32("c").unwrap(), 0xDEADBEEF);
        assert_eq!(r.get_u64("d").unwrap(), 0x0102030405060708);
        assert!(r.is_empty());
    }

    #[test]
    fn test_big_endian_layout() {
        let mut w = WireWriter::new();
        w.put_u32(0x48595045);
        assert_eq!(w.into_bytes(), vec![0x48, 0x59, 0x50, 0x45]);
    }

    #[test]
    fn test_string_roundtrip() {
        let mut w = WireWriter::new();
        w.put_string("hello");
        let bytes = w.into_bytes();
        assert_eq!(&bytes[..4], &[0, 0, 0, 5]);

        let mut r = WireReader::new(&bytes);
        assert_eq!(r.get_string("s").unwrap(), "hello");
    }

    #[test]
    fn test_empty_string() {
        let mut w = WireWriter::new();
        w.put_string("");
        let bytes = w.into_bytes();
        assert_eq!(bytes, vec![0, 0, 0, 0]);

        let mut r = WireReader::new(&bytes);
        assert_eq!(r.get_string("s").unwrap(), "");
    }

    #[test]
    fn test_var_bytes_roundtrip() {
        let mut w = WireWriter::new();
        w.put_var_bytes(&[1, 2, 3]);
        let bytes = w.into_bytes();

        let mut r = WireReader::new(&bytes);
        assert_eq!(r.get_var_bytes("b").unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_array_roundtrip() {
        let mut w = WireWriter::new();
        w.put_bytes(&[7u8; 32]);
        let bytes = w.into_bytes();

        let mut r = WireReader::new(&bytes);
        let arr: [u8; 32] = r.get_array("key").unwrap();
        assert_eq!(arr, [7u8; 32]);
    }

    #[test]
    fn test_truncated_input() {
        let mut r = WireReader::new(&[0, 0]);
        assert_eq!(
            r.get_u32("field"),
            Err(WireError::UnexpectedEnd("field"))
        );
    }

    #[test]
    fn test_string_length_exceeds_input() {
        // Claims 100 bytes but provides 2
        let bytes = [0, 0, 0, 100, 0x41, 0x42];
        let mut r = WireReader::new(&bytes);
        assert!(matches!(
            r.get_string("s"),
            Err(WireError::UnexpectedEnd(_))
        ));
    }

    #[test]
    fn test_invalid_utf8() {
        let bytes = [0, 0, 0, 2, 0xFF, 0xFE];
        let mut r = WireReader::new(&bytes);
        assert_eq!(r.get_string("s"), Err(WireError::InvalidUtf8));
    }

    #[derive(Debug, PartialEq)]
    struct Sample {
        id: u32,
        name: String,
    }

    impl WirePayload for Sample {
        fn encode(&self, w: &mut WireWriter) {
            w.put_u32(self.id);
            w.put_string(&self.name);
        }

        fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
            Ok(Self {
                id: r.get_u32("id")?,
                name: r.get_string("name")?,
            })
        }
    }

    #[test]
    fn test_payload_from_bytes_rejects_trailing() {
        let sample = Sample {
            id: 9,
            name: "x".to_string(),
        };
        let mut bytes = sample.to_bytes();
        assert_eq!(Sample::from_bytes(&bytes).unwrap(), sample);

        bytes.push(0);
        assert_eq!(Sample::from_bytes(&bytes), Err(WireError::TrailingBytes(1)));
    }
}
