//! Response status and error payloads

use crate::packet::{Packet, Value};
use crate::Tag;

/// Status carried in field 0 of every response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// Call succeeded
    Success = 0,
    /// Call failed; an error code and message follow
    Fail = 1,
}

impl Status {
    /// Parse a wire status value
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Success),
            1 => Some(Self::Fail),
            _ => None,
        }
    }
}

/// Error codes for failure responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// No handler is registered for the tag
    UnknownCall = 1,
    /// Request is malformed or missing required fields
    InvalidRequest = 2,
    /// Referenced pipe, device or resource does not exist
    NotFound = 3,
    /// Acquiring a resource failed
    ResourceFailed = 4,
    /// Operation not supported by the target
    Unsupported = 5,
    /// Target already closed
    Closed = 6,
    /// Internal agent error
    Internal = 7,
}

impl ErrorCode {
    /// Parse a wire error code
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::UnknownCall),
            2 => Some(Self::InvalidRequest),
            3 => Some(Self::NotFound),
            4 => Some(Self::ResourceFailed),
            5 => Some(Self::Unsupported),
            6 => Some(Self::Closed),
            7 => Some(Self::Internal),
            _ => None,
        }
    }
}

/// Error details for failure responses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorDetails {
    /// Error code
    pub code: ErrorCode,
    /// Human-readable error message
    pub message: String,
}

impl ErrorDetails {
    /// Create new error details
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Details for a tag nobody registered
    pub fn unknown_call() -> Self {
        Self::new(ErrorCode::UnknownCall, "unknown call")
    }
}

impl Packet {
    /// Start a response to `tag` with the given status
    pub fn response(tag: Tag, status: Status) -> Self {
        Packet::new(tag).with_u32(status as u32)
    }

    /// Successful response to `tag`
    pub fn success(tag: Tag) -> Self {
        Self::response(tag, Status::Success)
    }

    /// Failure response to `tag` carrying error details
    pub fn failure(tag: Tag, error: &ErrorDetails) -> Self {
        Self::response(tag, Status::Fail)
            .with_u32(error.code as u32)
            .with_string(error.message.clone())
    }

    /// Status of a response packet, if field 0 holds one
    pub fn status(&self) -> Option<Status> {
        match self.fields().first() {
            Some(Value::U32(value)) => Status::from_u32(*value),
            _ => None,
        }
    }

    /// Error details of a failure response
    pub fn error_details(&self) -> Option<ErrorDetails> {
        if self.status()? != Status::Fail {
            return None;
        }
        let code = ErrorCode::from_u32(self.get_u32(1)?)?;
        let message = self.get_str(0).unwrap_or_default();
        Some(ErrorDetails::new(code, message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tag::Scope;

    const TAG: Tag = Tag::new(Scope::Static, 1, 1);

    #[test]
    fn test_success_response() {
        let resp = Packet::success(TAG).with_string("ok");
        assert_eq!(resp.tag(), TAG);
        assert_eq!(resp.status(), Some(Status::Success));
        assert!(resp.error_details().is_none());
        assert_eq!(resp.get_str(0), Some("ok"));
    }

    #[test]
    fn test_failure_response() {
        let resp = Packet::failure(TAG, &ErrorDetails::unknown_call());
        assert_eq!(resp.status(), Some(Status::Fail));

        let details = resp.error_details().unwrap();
        assert_eq!(details.code, ErrorCode::UnknownCall);
        assert_eq!(details.message, "unknown call");
    }

    #[test]
    fn test_status_missing() {
        let packet = Packet::new(TAG).with_string("no status");
        assert_eq!(packet.status(), None);
    }
}
