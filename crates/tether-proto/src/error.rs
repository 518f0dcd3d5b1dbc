//! Error types for protocol operations

use thiserror::Error;
use crate::packet::ValueKind;
use crate::status::{ErrorCode, ErrorDetails};
use crate::Tag;

/// Failure to decode a TLV packet from bytes
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Fewer bytes available than the packet declares
    #[error("Truncated packet: need {needed} bytes, have {available}")]
    Truncated {
        /// Bytes required to continue decoding
        needed: usize,
        /// Bytes actually available
        available: usize,
    },

    /// Unrecognized field type discriminant
    #[error("Unknown field type: {0}")]
    UnknownType(u8),

    /// Fixed-width field with the wrong length
    #[error("Invalid length {length} for {kind:?} field")]
    InvalidLength {
        /// Field kind
        kind: ValueKind,
        /// Declared length
        length: u32,
    },

    /// String field that is not UTF-8
    #[error("String field is not valid UTF-8")]
    InvalidUtf8,

    /// Packet larger than the configured maximum
    #[error("Packet too large: {size} bytes (max: {max})")]
    TooLarge {
        /// Declared size
        size: usize,
        /// Maximum allowed size
        max: usize,
    },

    /// Bytes left over after a complete packet
    #[error("{0} trailing bytes after packet")]
    TrailingBytes(usize),

    /// Nested packets beyond the supported depth
    #[error("Packet nesting too deep")]
    TooDeep,
}

/// Failure of the streaming packet framer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// A whole packet arrived but its contents are malformed; the bytes
    /// were consumed and the stream is still in sync
    #[error("Malformed packet {tag:?}: {error}")]
    Malformed {
        /// Tag read from the packet header
        tag: Tag,
        /// Underlying decode failure
        error: DecodeError,
    },

    /// Declared packet extent exceeds the limit; the stream cannot recover
    #[error("Packet too large: {size} bytes (max: {max})")]
    TooLarge {
        /// Declared size
        size: usize,
        /// Maximum allowed size
        max: usize,
    },
}

/// Protocol-level errors surfaced by the async helpers
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Packet could not be decoded
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Stream framing failed
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    /// Transport I/O failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Stream ended in the middle of a packet
    #[error("Stream closed mid-packet")]
    UnexpectedEof,
}

impl From<DecodeError> for ErrorDetails {
    fn from(error: DecodeError) -> Self {
        match error {
            DecodeError::TooLarge { .. } => ErrorDetails::new(ErrorCode::ResourceFailed, error.to_string()),
            _ => ErrorDetails::new(ErrorCode::InvalidRequest, error.to_string()),
        }
    }
}
