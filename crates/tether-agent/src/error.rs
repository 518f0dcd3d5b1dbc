//! Error types for the agent runtime

use std::io;
use tether_proto::{ErrorCode, ErrorDetails, ProtocolError, Tag};
use thiserror::Error;

/// Runtime-level failures: startup, configuration and tunnel management
#[derive(Debug, Error)]
pub enum AgentError {
    /// No constructor registered for the URI scheme
    #[error("Unsupported tunnel scheme: {0}")]
    UnsupportedScheme(String),

    /// URI could not be parsed
    #[error("Invalid tunnel URI: {0}")]
    InvalidUri(String),

    /// Startup finished without a single attached transport
    #[error("No transport could be attached")]
    NoTransport,

    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O failure while setting up the runtime
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Protocol failure on a transport
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Failures of pipe operations
#[derive(Debug, Error)]
pub enum PipeError {
    /// No factory registered for the pipe type
    #[error("Unknown pipe type {0:?}")]
    UnknownType(Tag),

    /// No such pipe, device or resource
    #[error("Not found: {0}")]
    NotFound(String),

    /// Pipe was already destroyed
    #[error("Pipe is closed")]
    Closed,

    /// Backend does not implement the operation
    #[error("Operation not supported: {0}")]
    Unsupported(&'static str),

    /// Creation parameters are missing or wrong
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    /// Acquiring a backend resource failed
    #[error("Resource failure: {0}")]
    Resource(String),

    /// Bounded wait for data expired
    #[error("Timed out waiting for data")]
    Timeout,

    /// Underlying child process failure
    #[error(transparent)]
    Child(#[from] ChildError),

    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<&PipeError> for ErrorDetails {
    fn from(error: &PipeError) -> Self {
        let code = match error {
            PipeError::UnknownType(_) | PipeError::NotFound(_) => ErrorCode::NotFound,
            PipeError::Closed => ErrorCode::Closed,
            PipeError::Unsupported(_) => ErrorCode::Unsupported,
            PipeError::InvalidParams(_) => ErrorCode::InvalidRequest,
            PipeError::Resource(_) | PipeError::Timeout | PipeError::Io(_) => {
                ErrorCode::ResourceFailed
            }
            PipeError::Child(ChildError::Closed) => ErrorCode::Closed,
            PipeError::Child(_) => ErrorCode::ResourceFailed,
        };
        ErrorDetails::new(code, error.to_string())
    }
}

/// Failures of the child process manager
#[derive(Debug, Error)]
pub enum ChildError {
    /// Program could not be started
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        /// Program name
        program: String,
        /// OS error
        source: io::Error,
    },

    /// Descriptor or pseudo-terminal system call failed
    #[error("System call failed: {0}")]
    Sys(#[from] nix::Error),

    /// Handle was destroyed
    #[error("Child handle is closed")]
    Closed,

    /// Write failed after part of the buffer went out
    #[error(transparent)]
    Write(#[from] WriteError),

    /// Other I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// A fatal write error together with the bytes that made it out first
#[derive(Debug, Error)]
#[error("Write failed after {written} bytes: {source}")]
pub struct WriteError {
    /// Bytes written before the failure
    pub written: usize,
    /// Non-recoverable error
    #[source]
    pub source: io::Error,
}
