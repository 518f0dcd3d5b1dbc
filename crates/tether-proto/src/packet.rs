//! TLV packet model and byte codec

use bytes::{BufMut, Bytes, BytesMut};
use crate::{DecodeError, Tag};

/// Size of the packet header: tag plus field count
pub const PACKET_HEADER_LEN: usize = 8;

/// Size of a field header: type plus length
pub const FIELD_HEADER_LEN: usize = 5;

/// Maximum nesting of packets inside packets
pub const MAX_DEPTH: usize = 32;

/// Field type discriminant as it appears on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    /// Signed 32-bit integer
    I32 = 1,
    /// Unsigned 32-bit integer
    U32 = 2,
    /// UTF-8 string, length-prefixed
    String = 3,
    /// Raw byte buffer
    Bytes = 4,
    /// Nested packet
    Packet = 5,
}

impl ValueKind {
    /// Map a wire discriminant to a kind
    pub fn from_u8(ty: u8) -> Option<Self> {
        match ty {
            1 => Some(Self::I32),
            2 => Some(Self::U32),
            3 => Some(Self::String),
            4 => Some(Self::Bytes),
            5 => Some(Self::Packet),
            _ => None,
        }
    }
}

/// A single typed field value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// Signed 32-bit integer
    I32(i32),
    /// Unsigned 32-bit integer
    U32(u32),
    /// UTF-8 string
    String(String),
    /// Raw bytes
    Bytes(Bytes),
    /// Nested packet
    Packet(Packet),
}

impl Value {
    /// Wire discriminant of this value
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::I32(_) => ValueKind::I32,
            Self::U32(_) => ValueKind::U32,
            Self::String(_) => ValueKind::String,
            Self::Bytes(_) => ValueKind::Bytes,
            Self::Packet(_) => ValueKind::Packet,
        }
    }

    /// Length of the encoded value, excluding the field header
    pub fn encoded_len(&self) -> usize {
        match self {
            Self::I32(_) | Self::U32(_) => 4,
            Self::String(s) => s.len(),
            Self::Bytes(b) => b.len(),
            Self::Packet(p) => p.encoded_len(),
        }
    }

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u8(self.kind() as u8);
        buf.put_u32(self.encoded_len() as u32);
        match self {
            Self::I32(v) => buf.put_i32(*v),
            Self::U32(v) => buf.put_u32(*v),
            Self::String(s) => buf.put_slice(s.as_bytes()),
            Self::Bytes(b) => buf.put_slice(b),
            Self::Packet(p) => p.encode_into(buf),
        }
    }

    fn decode(ty: u8, value: &[u8], depth: usize) -> Result<Self, DecodeError> {
        let kind = ValueKind::from_u8(ty).ok_or(DecodeError::UnknownType(ty))?;
        match kind {
            ValueKind::I32 | ValueKind::U32 => {
                let raw: [u8; 4] = value.try_into().map_err(|_| DecodeError::InvalidLength {
                    kind,
                    length: value.len() as u32,
                })?;
                Ok(if kind == ValueKind::I32 {
                    Self::I32(i32::from_be_bytes(raw))
                } else {
                    Self::U32(u32::from_be_bytes(raw))
                })
            }
            ValueKind::String => std::str::from_utf8(value)
                .map(|s| Self::String(s.to_owned()))
                .map_err(|_| DecodeError::InvalidUtf8),
            ValueKind::Bytes => Ok(Self::Bytes(Bytes::copy_from_slice(value))),
            ValueKind::Packet => {
                let (packet, used) = Packet::decode_prefix(value, depth + 1)?;
                if used != value.len() {
                    return Err(DecodeError::TrailingBytes(value.len() - used));
                }
                Ok(Self::Packet(packet))
            }
        }
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::I32(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Self::U32(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_owned())
    }
}

impl From<Bytes> for Value {
    fn from(v: Bytes) -> Self {
        Self::Bytes(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(v))
    }
}

impl From<Packet> for Value {
    fn from(v: Packet) -> Self {
        Self::Packet(v)
    }
}

/// A call tag plus an ordered list of typed fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    tag: Tag,
    fields: Vec<Value>,
}

impl Packet {
    /// Create an empty packet
    pub fn new(tag: Tag) -> Self {
        Self {
            tag,
            fields: Vec::new(),
        }
    }

    /// Packet tag
    pub fn tag(&self) -> Tag {
        self.tag
    }

    /// All fields in insertion order
    pub fn fields(&self) -> &[Value] {
        &self.fields
    }

    /// Number of fields
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the packet has no fields
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Append a field
    pub fn push(&mut self, value: impl Into<Value>) -> &mut Self {
        self.fields.push(value.into());
        self
    }

    /// Append a signed integer
    pub fn add_i32(&mut self, v: i32) -> &mut Self {
        self.push(v)
    }

    /// Append an unsigned integer
    pub fn add_u32(&mut self, v: u32) -> &mut Self {
        self.push(v)
    }

    /// Append a string
    pub fn add_string(&mut self, v: impl Into<String>) -> &mut Self {
        self.push(Value::String(v.into()))
    }

    /// Append a byte buffer
    pub fn add_bytes(&mut self, v: impl Into<Bytes>) -> &mut Self {
        self.push(Value::Bytes(v.into()))
    }

    /// Append a nested packet
    pub fn add_packet(&mut self, v: Packet) -> &mut Self {
        self.push(v)
    }

    /// Builder form of [`Packet::add_i32`]
    pub fn with_i32(mut self, v: i32) -> Self {
        self.add_i32(v);
        self
    }

    /// Builder form of [`Packet::add_u32`]
    pub fn with_u32(mut self, v: u32) -> Self {
        self.add_u32(v);
        self
    }

    /// Builder form of [`Packet::add_string`]
    pub fn with_string(mut self, v: impl Into<String>) -> Self {
        self.add_string(v);
        self
    }

    /// Builder form of [`Packet::add_bytes`]
    pub fn with_bytes(mut self, v: impl Into<Bytes>) -> Self {
        self.add_bytes(v);
        self
    }

    /// Builder form of [`Packet::add_packet`]
    pub fn with_packet(mut self, v: Packet) -> Self {
        self.add_packet(v);
        self
    }

    /// The `n`-th signed integer field
    pub fn get_i32(&self, n: usize) -> Option<i32> {
        self.iter_i32().nth(n)
    }

    /// The `n`-th unsigned integer field
    pub fn get_u32(&self, n: usize) -> Option<u32> {
        self.iter_u32().nth(n)
    }

    /// The `n`-th string field
    pub fn get_str(&self, n: usize) -> Option<&str> {
        self.iter_str().nth(n)
    }

    /// The `n`-th byte buffer field
    pub fn get_bytes(&self, n: usize) -> Option<&Bytes> {
        self.iter_bytes().nth(n)
    }

    /// The `n`-th nested packet
    pub fn get_packet(&self, n: usize) -> Option<&Packet> {
        self.iter_packets().nth(n)
    }

    /// Signed integer fields in order
    pub fn iter_i32(&self) -> impl Iterator<Item = i32> + '_ {
        self.fields.iter().filter_map(|v| match v {
            Value::I32(x) => Some(*x),
            _ => None,
        })
    }

    /// Unsigned integer fields in order
    pub fn iter_u32(&self) -> impl Iterator<Item = u32> + '_ {
        self.fields.iter().filter_map(|v| match v {
            Value::U32(x) => Some(*x),
            _ => None,
        })
    }

    /// String fields in order
    pub fn iter_str(&self) -> impl Iterator<Item = &str> + '_ {
        self.fields.iter().filter_map(|v| match v {
            Value::String(s) => Some(s.as_str()),
            _ => None,
        })
    }

    /// Byte buffer fields in order
    pub fn iter_bytes(&self) -> impl Iterator<Item = &Bytes> + '_ {
        self.fields.iter().filter_map(|v| match v {
            Value::Bytes(b) => Some(b),
            _ => None,
        })
    }

    /// Nested packets in order
    pub fn iter_packets(&self) -> impl Iterator<Item = &Packet> + '_ {
        self.fields.iter().filter_map(|v| match v {
            Value::Packet(p) => Some(p),
            _ => None,
        })
    }

    /// Total encoded size in bytes
    pub fn encoded_len(&self) -> usize {
        PACKET_HEADER_LEN
            + self
                .fields
                .iter()
                .map(|v| FIELD_HEADER_LEN + v.encoded_len())
                .sum::<usize>()
    }

    /// Encode to a fresh buffer
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Append the encoding to `buf`
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_len());
        buf.put_u32(self.tag.raw());
        buf.put_u32(self.fields.len() as u32);
        for value in &self.fields {
            value.encode_into(buf);
        }
    }

    /// Decode exactly one packet occupying all of `bytes`
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let (packet, used) = Self::decode_prefix(bytes, 0)?;
        if used != bytes.len() {
            return Err(DecodeError::TrailingBytes(bytes.len() - used));
        }
        Ok(packet)
    }

    fn decode_prefix(bytes: &[u8], depth: usize) -> Result<(Self, usize), DecodeError> {
        if depth > MAX_DEPTH {
            return Err(DecodeError::TooDeep);
        }

        let mut reader = Reader::new(bytes);
        let tag = Tag::from_raw(reader.u32()?);
        let count = reader.u32()? as usize;

        // Each field needs at least a header, so a bogus count cannot
        // force a huge allocation up front.
        let mut fields = Vec::with_capacity(count.min(bytes.len() / FIELD_HEADER_LEN));
        for _ in 0..count {
            let ty = reader.u8()?;
            let len = reader.u32()? as usize;
            let value = reader.take(len)?;
            fields.push(Value::decode(ty, value, depth)?);
        }

        Ok((Self { tag, fields }, reader.pos))
    }

    /// Determine how many bytes the packet at the start of `bytes` spans
    /// without interpreting field values.
    ///
    /// Returns `Ok(None)` while the header chain is incomplete and
    /// `TooLarge` once the extent is known to exceed `max`.
    pub fn peek_len(bytes: &[u8], max: usize) -> Result<Option<usize>, DecodeError> {
        if bytes.len() < PACKET_HEADER_LEN {
            return Ok(None);
        }

        let count = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let mut extent = PACKET_HEADER_LEN;
        for _ in 0..count {
            if extent + FIELD_HEADER_LEN > max {
                return Err(DecodeError::TooLarge { size: extent + FIELD_HEADER_LEN, max });
            }
            if bytes.len() < extent + FIELD_HEADER_LEN {
                return Ok(None);
            }
            let len = u32::from_be_bytes([
                bytes[extent + 1],
                bytes[extent + 2],
                bytes[extent + 3],
                bytes[extent + 4],
            ]) as usize;
            extent += FIELD_HEADER_LEN + len;
            if extent > max {
                return Err(DecodeError::TooLarge { size: extent, max });
            }
        }

        if bytes.len() < extent {
            return Ok(None);
        }
        Ok(Some(extent))
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.pos.checked_add(n).ok_or(DecodeError::Truncated {
            needed: usize::MAX,
            available: self.bytes.len(),
        })?;
        if end > self.bytes.len() {
            return Err(DecodeError::Truncated {
                needed: end,
                available: self.bytes.len(),
            });
        }
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        let raw = self.take(4)?;
        Ok(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }
}
