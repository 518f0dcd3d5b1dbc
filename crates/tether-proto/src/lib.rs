//! # Tether Protocol
//!
//! Tag composition, TLV packets and the streaming packet codec shared by
//! the agent and its clients.

#![warn(missing_docs)]

/// Composite call and pipe-type tags
pub mod tag;

/// TLV packet model and byte codec
pub mod packet;

/// Streaming packet codec for byte transports
pub mod codec;

/// Response status and error payloads
pub mod status;

/// Error types for protocol operations
pub mod error;

pub use tag::{Scope, Tag, API_CALL, PIPE_TYPE};
pub use packet::{Packet, Value, ValueKind};
pub use codec::{PacketCodec, MAX_PACKET_SIZE};
pub use status::{ErrorCode, ErrorDetails, Status};
pub use error::{DecodeError, FrameError, ProtocolError};
