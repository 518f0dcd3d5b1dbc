//! Events delivered to the reactor loop over one ordered channel

use bytes::Bytes;
use std::io;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::pipe::PipeOrigin;
use crate::session::SessionId;
use crate::tunnel::{Transport, Tunnel};

/// What happened to a child process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildEventKind {
    /// New bytes in the stdout queue
    Output,
    /// New bytes in the stderr queue
    Error,
    /// Process terminated with this code (-1 when killed by a signal)
    Exit(i32),
}

/// Notification from a child process backing a pipe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildEvent {
    /// Pipe the child belongs to
    pub origin: PipeOrigin,
    /// What happened
    pub kind: ChildEventKind,
}

/// Everything the reactor reacts to, apart from signals and worker wakes
pub enum Event {
    /// Bytes arrived on a session transport
    Inbound {
        /// Receiving session
        session: SessionId,
        /// Raw transport bytes
        data: Bytes,
    },

    /// A session transport failed or reached end of stream
    Disconnected {
        /// Affected session
        session: SessionId,
        /// Failure, `None` on a clean end of stream
        error: Option<io::Error>,
    },

    /// A child process backing a pipe produced output or exited
    Child(ChildEvent),

    /// Dispatch buffered requests of a session that paused after Break
    Resume {
        /// Session to resume
        session: SessionId,
    },

    /// A handler asked for another tunnel to be attached
    Attach {
        /// Tunnel URI
        uri: String,
    },

    /// A tunnel finished opening
    Opened {
        /// Tunnel that was opened
        tunnel: Arc<dyn Tunnel>,
        /// Session being reconnected, `None` for a fresh attach
        session: Option<SessionId>,
        /// Resulting transport
        result: io::Result<Transport>,
    },
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inbound { session, data } => f
                .debug_struct("Inbound")
                .field("session", session)
                .field("len", &data.len())
                .finish(),
            Self::Disconnected { session, error } => f
                .debug_struct("Disconnected")
                .field("session", session)
                .field("error", error)
                .finish(),
            Self::Child(event) => f.debug_tuple("Child").field(event).finish(),
            Self::Resume { session } => f.debug_struct("Resume").field("session", session).finish(),
            Self::Attach { uri } => f.debug_struct("Attach").field("uri", uri).finish(),
            Self::Opened { tunnel, session, result } => f
                .debug_struct("Opened")
                .field("uri", &tunnel.uri())
                .field("session", session)
                .field("ok", &result.is_ok())
                .finish(),
        }
    }
}

/// Sending half of the reactor event channel
pub type EventSender = mpsc::UnboundedSender<Event>;

/// Receiving half of the reactor event channel
pub type EventReceiver = mpsc::UnboundedReceiver<Event>;

/// Create the reactor event channel
pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}
