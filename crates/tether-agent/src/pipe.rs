//! Pipe registry, backend contract and per-session pipe table

use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tether_proto::{Packet, Scope, Tag};
use tracing::{debug, warn};

use crate::api::PIPE_BASE;
use crate::error::PipeError;
use crate::event::{ChildEventKind, EventSender};
use crate::session::SessionId;

/// Tag of unsolicited pipe event packets sent to the controller
pub const PIPE_EVENT: Tag = Tag::new(Scope::Internal, PIPE_BASE, 1);

/// Pipe event kind: new output
pub const PIPE_EVENT_OUTPUT: u32 = 1;
/// Pipe event kind: new error output
pub const PIPE_EVENT_ERROR: u32 = 2;
/// Pipe event kind: backend exited
pub const PIPE_EVENT_EXIT: u32 = 3;

/// Identity of a pipe: owning session, pipe type and instance id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipeOrigin {
    /// Owning session
    pub session: SessionId,
    /// Pipe type tag
    pub pipe_type: Tag,
    /// Instance id within the session
    pub pipe_id: u32,
}

/// Build the unsolicited packet announcing a backend event
pub fn event_packet(origin: PipeOrigin, kind: ChildEventKind) -> Packet {
    let packet = Packet::new(PIPE_EVENT)
        .with_u32(origin.pipe_type.raw())
        .with_u32(origin.pipe_id);
    match kind {
        ChildEventKind::Output => packet.with_u32(PIPE_EVENT_OUTPUT),
        ChildEventKind::Error => packet.with_u32(PIPE_EVENT_ERROR),
        ChildEventKind::Exit(code) => packet.with_u32(PIPE_EVENT_EXIT).with_i32(code),
    }
}

/// Everything a backend gets to build a new pipe
pub struct PipeRequest<'a> {
    /// Identity the new pipe will have
    pub origin: PipeOrigin,
    /// Creation parameters, if the controller sent any
    pub params: Option<&'a Packet>,
    /// Channel for backend events
    pub events: &'a EventSender,
}

impl PipeRequest<'_> {
    /// The `n`-th unsigned parameter
    pub fn param_u32(&self, n: usize) -> Option<u32> {
        self.params.and_then(|p| p.get_u32(n))
    }

    /// The `n`-th string parameter
    pub fn param_str(&self, n: usize) -> Option<&str> {
        self.params.and_then(|p| p.get_str(n))
    }
}

/// Operations of an open pipe.
///
/// A backend implements only what it supports; the rest report
/// [`PipeError::Unsupported`]. Resources are owned by the backend value, so
/// dropping a half-built backend releases everything it acquired.
pub trait PipeBackend: Send {
    /// Copy already-buffered data into `buf`
    fn read(&mut self, _buf: &mut [u8]) -> Result<usize, PipeError> {
        Err(PipeError::Unsupported("read"))
    }

    /// Acquire a fresh buffer and hand it to the caller
    fn readall(&mut self) -> Result<Bytes, PipeError> {
        Err(PipeError::Unsupported("readall"))
    }

    /// Write `buf`, returning the count written
    fn write(&mut self, _buf: &[u8]) -> Result<usize, PipeError> {
        Err(PipeError::Unsupported("write"))
    }

    /// Ask the backend to terminate without waiting for it
    fn kill(&mut self) -> Result<(), PipeError> {
        Err(PipeError::Unsupported("kill"))
    }

    /// Release backend resources. Must tolerate repeated calls.
    fn destroy(&mut self) -> Result<(), PipeError>;
}

/// Creates backends for one pipe type
pub trait PipeFactory: Send + Sync {
    /// Build a backend; on failure nothing may stay allocated
    fn create(&self, request: &PipeRequest<'_>) -> Result<Box<dyn PipeBackend>, PipeError>;
}

impl<F> PipeFactory for F
where
    F: Fn(&PipeRequest<'_>) -> Result<Box<dyn PipeBackend>, PipeError> + Send + Sync,
{
    fn create(&self, request: &PipeRequest<'_>) -> Result<Box<dyn PipeBackend>, PipeError> {
        self(request)
    }
}

/// Maps pipe-type tags to factories. Populated before the reactor starts.
#[derive(Default)]
pub struct PipeRegistry {
    factories: HashMap<Tag, Arc<dyn PipeFactory>>,
}

impl PipeRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory; a later registration for the same tag wins
    pub fn register(&mut self, pipe_type: Tag, factory: Arc<dyn PipeFactory>) {
        if self.factories.insert(pipe_type, factory).is_some() {
            warn!("Pipe type {:?} registered twice, replacing", pipe_type);
        } else {
            debug!("Registered pipe type {:?}", pipe_type);
        }
    }

    /// Register a plain function as a factory
    pub fn register_fn<F>(&mut self, pipe_type: Tag, factory: F)
    where
        F: Fn(&PipeRequest<'_>) -> Result<Box<dyn PipeBackend>, PipeError> + Send + Sync + 'static,
    {
        self.register(pipe_type, Arc::new(factory));
    }

    /// Look up the factory for a pipe type
    pub fn get(&self, pipe_type: Tag) -> Option<&Arc<dyn PipeFactory>> {
        self.factories.get(&pipe_type)
    }

    /// Whether a pipe type is registered
    pub fn contains(&self, pipe_type: Tag) -> bool {
        self.factories.contains_key(&pipe_type)
    }

    /// Number of registered pipe types
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    /// Whether no pipe type is registered
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Drop every factory
    pub fn clear(&mut self) {
        self.factories.clear();
    }
}

/// Lifecycle state of a pipe
pub enum PipeState {
    /// Backend is live
    Open(Box<dyn PipeBackend>),
    /// Backend was destroyed
    Closed,
}

/// A streaming resource owned by one session
pub struct Pipe {
    origin: PipeOrigin,
    state: PipeState,
}

impl Pipe {
    /// Wrap a freshly created backend
    pub fn new(origin: PipeOrigin, backend: Box<dyn PipeBackend>) -> Self {
        Self {
            origin,
            state: PipeState::Open(backend),
        }
    }

    /// Identity of this pipe
    pub fn origin(&self) -> PipeOrigin {
        self.origin
    }

    /// Whether the backend is still live
    pub fn is_open(&self) -> bool {
        matches!(self.state, PipeState::Open(_))
    }

    fn backend(&mut self) -> Result<&mut Box<dyn PipeBackend>, PipeError> {
        match &mut self.state {
            PipeState::Open(backend) => Ok(backend),
            PipeState::Closed => Err(PipeError::Closed),
        }
    }

    /// Read buffered data
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, PipeError> {
        self.backend()?.read(buf)
    }

    /// Acquire a fresh buffer
    pub fn readall(&mut self) -> Result<Bytes, PipeError> {
        self.backend()?.readall()
    }

    /// Write data
    pub fn write(&mut self, buf: &[u8]) -> Result<usize, PipeError> {
        self.backend()?.write(buf)
    }

    /// Request backend termination
    pub fn kill(&mut self) -> Result<(), PipeError> {
        self.backend()?.kill()
    }

    /// Close the pipe. Backend failures are logged, never propagated.
    pub fn destroy(&mut self) {
        if let PipeState::Open(mut backend) = std::mem::replace(&mut self.state, PipeState::Closed) {
            if let Err(e) = backend.destroy() {
                warn!("Destroying pipe {:?} failed: {}", self.origin, e);
            }
            debug!("Pipe {:?} closed", self.origin);
        }
    }
}

impl Drop for Pipe {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// The pipes of one session, keyed by (pipe type, id).
///
/// Ids come from a counter starting at 1 and are never reused, including
/// ids consumed by failed creations.
pub struct PipeTable {
    session: SessionId,
    next_id: u32,
    pipes: BTreeMap<(Tag, u32), Pipe>,
}

impl PipeTable {
    /// Create an empty table for `session`
    pub fn new(session: SessionId) -> Self {
        Self {
            session,
            next_id: 1,
            pipes: BTreeMap::new(),
        }
    }

    /// Create a pipe of `pipe_type` and return its id
    pub fn create(
        &mut self,
        registry: &PipeRegistry,
        pipe_type: Tag,
        params: Option<&Packet>,
        events: &EventSender,
    ) -> Result<u32, PipeError> {
        let factory = registry
            .get(pipe_type)
            .ok_or(PipeError::UnknownType(pipe_type))?;

        let pipe_id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);

        let origin = PipeOrigin {
            session: self.session,
            pipe_type,
            pipe_id,
        };
        let request = PipeRequest {
            origin,
            params,
            events,
        };
        let backend = factory.create(&request)?;

        self.pipes.insert((pipe_type, pipe_id), Pipe::new(origin, backend));
        debug!("Created pipe {:?}", origin);
        Ok(pipe_id)
    }

    /// Look up a pipe
    pub fn get_mut(&mut self, pipe_type: Tag, pipe_id: u32) -> Result<&mut Pipe, PipeError> {
        self.pipes
            .get_mut(&(pipe_type, pipe_id))
            .ok_or_else(|| PipeError::NotFound(format!("pipe {} of type {}", pipe_id, pipe_type)))
    }

    /// Whether a pipe exists
    pub fn contains(&self, pipe_type: Tag, pipe_id: u32) -> bool {
        self.pipes.contains_key(&(pipe_type, pipe_id))
    }

    /// Read buffered data from a pipe
    pub fn read(&mut self, pipe_type: Tag, pipe_id: u32, buf: &mut [u8]) -> Result<usize, PipeError> {
        self.get_mut(pipe_type, pipe_id)?.read(buf)
    }

    /// Acquire a fresh buffer from a pipe
    pub fn readall(&mut self, pipe_type: Tag, pipe_id: u32) -> Result<Bytes, PipeError> {
        self.get_mut(pipe_type, pipe_id)?.readall()
    }

    /// Write to a pipe
    pub fn write(&mut self, pipe_type: Tag, pipe_id: u32, buf: &[u8]) -> Result<usize, PipeError> {
        self.get_mut(pipe_type, pipe_id)?.write(buf)
    }

    /// Request termination of a pipe backend
    pub fn kill(&mut self, pipe_type: Tag, pipe_id: u32) -> Result<(), PipeError> {
        self.get_mut(pipe_type, pipe_id)?.kill()
    }

    /// Destroy and remove a pipe
    pub fn destroy(&mut self, pipe_type: Tag, pipe_id: u32) -> Result<(), PipeError> {
        let mut pipe = self
            .pipes
            .remove(&(pipe_type, pipe_id))
            .ok_or_else(|| PipeError::NotFound(format!("pipe {} of type {}", pipe_id, pipe_type)))?;
        pipe.destroy();
        Ok(())
    }

    /// Destroy every pipe
    pub fn destroy_all(&mut self) {
        for (_, mut pipe) in std::mem::take(&mut self.pipes) {
            pipe.destroy();
        }
    }

    /// Number of live pipes
    pub fn len(&self) -> usize {
        self.pipes.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.pipes.is_empty()
    }
}

impl Drop for PipeTable {
    fn drop(&mut self) {
        self.destroy_all();
    }
}
