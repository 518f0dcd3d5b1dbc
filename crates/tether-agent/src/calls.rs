//! Call registry and dispatch

use std::collections::HashMap;
use std::sync::Arc;
use tether_proto::{ErrorDetails, Packet, Status, Tag};
use tracing::{debug, warn};

use crate::event::EventSender;
use crate::pipe::PipeRegistry;
use crate::session::Session;
use crate::worker::WorkerBridge;

/// How the runtime continues after a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultCode {
    /// Normal reply, session continues
    Success,
    /// Error reply, session continues
    Fail,
    /// Send the final reply, reset the secure context and close the session
    /// unless it is kept alive
    Break,
    /// Reply to an asynchronous request, session continues
    Callback,
    /// Send nothing
    Silent,
}

/// Result of a handler: a code plus the packet to send back
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Continuation code
    pub code: ResultCode,
    /// Response packet; a status-only response is sent when absent
    pub response: Option<Packet>,
}

impl Reply {
    /// Successful reply
    pub fn success(response: Packet) -> Self {
        Self {
            code: ResultCode::Success,
            response: Some(response),
        }
    }

    /// Failure reply to `tag`
    pub fn fail(tag: Tag, error: impl Into<ErrorDetails>) -> Self {
        Self {
            code: ResultCode::Fail,
            response: Some(Packet::failure(tag, &error.into())),
        }
    }

    /// Final reply that ends the session
    pub fn break_with(response: Packet) -> Self {
        Self {
            code: ResultCode::Break,
            response: Some(response),
        }
    }

    /// Reply to an asynchronous request
    pub fn callback(response: Packet) -> Self {
        Self {
            code: ResultCode::Callback,
            response: Some(response),
        }
    }

    /// No reply at all
    pub fn silent() -> Self {
        Self {
            code: ResultCode::Silent,
            response: None,
        }
    }

    /// Packet to put on the wire for a request tagged `tag`, if any
    pub fn into_packet(self, tag: Tag) -> Option<Packet> {
        let status = match self.code {
            ResultCode::Silent => return None,
            ResultCode::Fail => Status::Fail,
            _ => Status::Success,
        };
        Some(self.response.unwrap_or_else(|| Packet::response(tag, status)))
    }
}

/// What a handler can reach while it runs
pub struct CallContext<'a> {
    /// Session the request arrived on
    pub session: &'a mut Session,
    /// Pipe factories
    pub pipes: &'a PipeRegistry,
    /// Offload path for blocking work
    pub worker: &'a WorkerBridge,
    /// Runtime identity string
    pub identity: &'a str,
    /// Reactor event channel
    pub events: &'a EventSender,
}

/// Handles one call tag.
///
/// The request is only borrowed, so a handler cannot keep it past return.
pub trait Handler: Send + Sync {
    /// Handle a request and return the reply
    fn handle(&self, ctx: &mut CallContext<'_>, request: &Packet) -> Reply;
}

impl<F> Handler for F
where
    F: Fn(&mut CallContext<'_>, &Packet) -> Reply + Send + Sync,
{
    fn handle(&self, ctx: &mut CallContext<'_>, request: &Packet) -> Reply {
        self(ctx, request)
    }
}

/// Maps call tags to handlers. Populated before the reactor starts.
#[derive(Default)]
pub struct CallRegistry {
    handlers: HashMap<Tag, Arc<dyn Handler>>,
}

impl CallRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler; a later registration for the same tag wins
    pub fn register(&mut self, tag: Tag, handler: Arc<dyn Handler>) {
        if self.handlers.insert(tag, handler).is_some() {
            warn!("Call {:?} registered twice, replacing", tag);
        } else {
            debug!("Registered call {:?}", tag);
        }
    }

    /// Register a plain function as a handler
    pub fn register_fn<F>(&mut self, tag: Tag, handler: F)
    where
        F: Fn(&mut CallContext<'_>, &Packet) -> Reply + Send + Sync + 'static,
    {
        self.register(tag, Arc::new(handler));
    }

    /// Whether a tag has a handler
    pub fn contains(&self, tag: Tag) -> bool {
        self.handlers.contains_key(&tag)
    }

    /// Number of registered calls
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no call is registered
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Drop every handler
    pub fn clear(&mut self) {
        self.handlers.clear();
    }

    /// Run the handler for `request`; unknown tags fail with "unknown call"
    pub fn dispatch(&self, ctx: &mut CallContext<'_>, request: &Packet) -> Reply {
        match self.handlers.get(&request.tag()) {
            Some(handler) => handler.handle(ctx, request),
            None => {
                debug!("No handler for {:?}", request.tag());
                Reply::fail(request.tag(), ErrorDetails::unknown_call())
            }
        }
    }
}
