//! Core runtime: sessions, registries and the reactor loop
//!
//! The reactor runs on one thread. Transport bytes, child process events,
//! runtime commands and tunnel completions arrive over one ordered event
//! channel; termination signals and worker completions are the only other
//! wake sources.

use std::collections::BTreeMap;
use std::ffi::CString;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tether_proto::{ErrorDetails, FrameError, Packet, PacketCodec, Tag};
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api;
use crate::calls::{CallContext, CallRegistry, Reply, ResultCode};
use crate::config::CoreConfig;
use crate::error::AgentError;
use crate::event::{self, ChildEvent, Event, EventReceiver, EventSender};
use crate::pipe::{self, PipeRegistry};
use crate::session::{Session, SessionId, SessionState};
use crate::tunnel::{Transport, Tunnel, TunnelTable};
use crate::worker::WorkerBridge;

/// How long closed sessions may keep flushing when the reactor stops
pub const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

struct Signals {
    interrupt: Signal,
    terminate: Signal,
}

impl Signals {
    fn install() -> io::Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }
}

/// Owns every session, both registries, the tunnel table and the reactor
/// state of one agent instance
pub struct Core {
    config: CoreConfig,
    identity: String,
    calls: CallRegistry,
    pipes: PipeRegistry,
    tunnels: TunnelTable,
    sessions: BTreeMap<SessionId, Session>,
    next_session: SessionId,
    events_tx: EventSender,
    events_rx: EventReceiver,
    worker: WorkerBridge,
    signals: Option<Signals>,
    flushing: Vec<JoinHandle<()>>,
    stop_requested: bool,
    stop_requests: usize,
}

impl Core {
    /// Create a runtime with empty registries
    pub fn new(config: CoreConfig) -> Self {
        let identity = config
            .identity
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let (events_tx, events_rx) = event::channel();

        Self {
            config,
            identity,
            calls: CallRegistry::new(),
            pipes: PipeRegistry::new(),
            tunnels: TunnelTable::default(),
            sessions: BTreeMap::new(),
            next_session: 1,
            events_tx,
            events_rx,
            worker: WorkerBridge::new(),
            signals: None,
            flushing: Vec::new(),
            stop_requested: false,
            stop_requests: 0,
        }
    }

    /// Create a runtime with the built-in calls and pipe types registered
    pub fn with_builtins(config: CoreConfig) -> Self {
        let mut core = Self::new(config);
        api::register_builtins(&mut core.calls, &mut core.pipes, &core.config);
        core
    }

    /// Runtime identity
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Startup configuration
    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Call registry, for registration before the reactor starts
    pub fn calls_mut(&mut self) -> &mut CallRegistry {
        &mut self.calls
    }

    /// Pipe registry, for registration before the reactor starts
    pub fn pipes_mut(&mut self) -> &mut PipeRegistry {
        &mut self.pipes
    }

    /// Tunnel table, for registering extra schemes
    pub fn tunnels_mut(&mut self) -> &mut TunnelTable {
        &mut self.tunnels
    }

    /// Sender for the reactor event channel
    pub fn events(&self) -> EventSender {
        self.events_tx.clone()
    }

    /// Worker bridge
    pub fn worker(&self) -> &WorkerBridge {
        &self.worker
    }

    /// Look up a session
    pub fn session(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    /// Sessions that still count as active
    pub fn active_sessions(&self) -> usize {
        self.sessions.values().filter(|s| s.is_active()).count()
    }

    /// Whether stop was requested
    pub fn stop_requested(&self) -> bool {
        self.stop_requested
    }

    /// How many times stop was actually requested (0 or 1)
    pub fn stop_requests(&self) -> usize {
        self.stop_requests
    }

    /// Ask the reactor to stop. Only the first call has an effect.
    pub fn request_stop(&mut self) -> bool {
        if self.stop_requested {
            return false;
        }
        self.stop_requested = true;
        self.stop_requests += 1;
        info!("Stop requested");
        true
    }

    /// Start a session on an already-open transport
    pub fn attach_transport(
        &mut self,
        transport: Transport,
        tunnel: Option<Arc<dyn Tunnel>>,
    ) -> SessionId {
        let id = self.next_session;
        self.next_session += 1;

        let codec = PacketCodec::with_max_packet_size(self.config.max_packet_size);
        let mut session = Session::new(id, self.config.keep_alive, codec, tunnel);
        session.connect(transport, &self.events_tx);
        self.sessions.insert(id, session);

        info!("Session {} attached", id);
        id
    }

    /// Resolve `uri`, open it and start a session on it
    pub async fn add_uri(&mut self, uri: &str) -> Result<SessionId, AgentError> {
        let tunnel = self.tunnels.resolve(uri)?;
        let transport = tunnel.open().await?;
        Ok(self.attach_transport(transport, Some(tunnel)))
    }

    /// Install the termination handlers, apply platform flags and attach
    /// every configured URI.
    ///
    /// Fails when not a single transport could be attached.
    pub async fn start(&mut self) -> Result<(), AgentError> {
        if self.signals.is_none() {
            self.signals = Some(Signals::install()?);
        }
        apply_platform_flags(&self.config);

        for uri in self.config.uris.clone() {
            match self.add_uri(&uri).await {
                Ok(id) => debug!("{} is session {}", uri, id),
                Err(e) => warn!("Failed to attach {}: {}", uri, e),
            }
        }

        if self.sessions.is_empty() {
            return Err(AgentError::NoTransport);
        }
        Ok(())
    }

    /// Run the reactor until stop is requested or a termination signal
    /// arrives, then shut down.
    ///
    /// Returns once the last replies are written or [`FLUSH_TIMEOUT`]
    /// passed, so dropping the tokio runtime right after loses nothing.
    pub async fn run(&mut self) -> Result<(), AgentError> {
        let mut signals = match self.signals.take() {
            Some(signals) => signals,
            None => Signals::install()?,
        };
        let worker = self.worker.clone();

        info!("Reactor running as {} with {} session(s)", self.identity, self.sessions.len());

        while !self.stop_requested {
            tokio::select! {
                biased;

                _ = signals.interrupt.recv() => {
                    info!("Received SIGINT, stopping");
                    break;
                }

                _ = signals.terminate.recv() => {
                    info!("Received SIGTERM, stopping");
                    break;
                }

                event = self.events_rx.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => break,
                },

                _ = worker.ready() => self.drain_completions(),
            }
        }

        self.shutdown();
        self.flush_writers().await;
        Ok(())
    }

    /// Close every session and drop the registries
    pub fn shutdown(&mut self) {
        for (_, mut session) in std::mem::take(&mut self.sessions) {
            session.close();
            self.flushing.extend(session.take_writer());
        }
        self.calls.clear();
        self.pipes.clear();
        self.tunnels.clear();
        info!("Core shut down");
    }

    /// Wait for the writers of closed sessions to deliver what they hold
    async fn flush_writers(&mut self) {
        let writers = std::mem::take(&mut self.flushing);
        if writers.is_empty() {
            return;
        }
        let flushed = futures::future::join_all(writers);
        if tokio::time::timeout(FLUSH_TIMEOUT, flushed).await.is_err() {
            warn!("Transports still flushing after {:?}, dropping them", FLUSH_TIMEOUT);
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Inbound { session, data } => {
                match self.sessions.get_mut(&session) {
                    Some(s) => s.feed(&data),
                    None => {
                        debug!("Bytes for closed session {}", session);
                        return;
                    }
                }
                self.drain_requests(session);
            }
            Event::Disconnected { session, error } => self.on_disconnected(session, error),
            Event::Child(event) => self.on_child_event(event),
            Event::Resume { session } => self.drain_requests(session),
            Event::Attach { uri } => self.begin_attach(&uri),
            Event::Opened {
                tunnel,
                session,
                result,
            } => self.on_opened(tunnel, session, result),
        }
    }

    /// Dispatch buffered requests of one session in arrival order
    fn drain_requests(&mut self, id: SessionId) {
        loop {
            let Some(session) = self.sessions.get_mut(&id) else {
                return;
            };
            if session.state() != SessionState::Active {
                return;
            }

            let request = match session.next_request() {
                Ok(Some(request)) => request,
                Ok(None) => return,
                Err(FrameError::Malformed { tag, error }) => {
                    warn!("Session {} sent malformed {:?}: {}", id, tag, error);
                    session.send(&Packet::failure(tag, &ErrorDetails::from(error)));
                    continue;
                }
                Err(e) => {
                    warn!("Session {} stream unusable: {}", id, e);
                    let error = io::Error::new(io::ErrorKind::InvalidData, e.to_string());
                    self.on_disconnected(id, Some(error));
                    return;
                }
            };

            session.set_state(SessionState::Dispatching);
            debug!("Session {} dispatching {:?}", id, request.tag());
            let reply = {
                let mut ctx = CallContext {
                    session,
                    pipes: &self.pipes,
                    worker: &self.worker,
                    identity: &self.identity,
                    events: &self.events_tx,
                };
                self.calls.dispatch(&mut ctx, &request)
            };

            if !self.apply_reply(id, request.tag(), reply) {
                return;
            }
        }
    }

    /// Send a reply and act on its code. Returns whether the session may
    /// keep dispatching in this pass.
    fn apply_reply(&mut self, id: SessionId, tag: Tag, reply: Reply) -> bool {
        let code = reply.code;
        let Some(session) = self.sessions.get_mut(&id) else {
            debug!("Reply {:?} for closed session {}", tag, id);
            return false;
        };
        if session.state() == SessionState::Dispatching {
            session.set_state(SessionState::Active);
        }
        if let Some(packet) = reply.into_packet(tag) {
            session.send(&packet);
        }
        if code != ResultCode::Break {
            return true;
        }

        session.crypto_mut().reset();
        if session.keep_alive() {
            info!("Session {} kept alive after break", id);
            // Anything still buffered is dispatched on the next pass
            let _ = self.events_tx.send(Event::Resume { session: id });
        } else {
            self.close_session(id);
        }
        if self.active_sessions() == 0 {
            self.request_stop();
        }
        false
    }

    fn close_session(&mut self, id: SessionId) {
        if let Some(mut session) = self.sessions.remove(&id) {
            session.close();
            self.flushing.retain(|writer| !writer.is_finished());
            self.flushing.extend(session.take_writer());
            info!("Session {} closed, {} active", id, self.active_sessions());
            if self.active_sessions() == 0 {
                self.request_stop();
            }
        }
    }

    fn on_disconnected(&mut self, id: SessionId, error: Option<io::Error>) {
        let Some(session) = self.sessions.get_mut(&id) else {
            return;
        };
        if !session.is_connected() {
            return;
        }
        match &error {
            Some(e) => warn!("Session {} transport failed: {}", id, e),
            None => info!("Session {} transport closed", id),
        }
        session.disconnect();

        let tunnel = session
            .tunnel()
            .filter(|t| session.keep_alive() && t.reopenable())
            .cloned();
        match tunnel {
            Some(tunnel) => self.schedule_reconnect(id, tunnel),
            None => self.close_session(id),
        }
    }

    fn on_child_event(&mut self, event: ChildEvent) {
        let origin = event.origin;
        match self.sessions.get_mut(&origin.session) {
            Some(session) if session.pipes().contains(origin.pipe_type, origin.pipe_id) => {
                session.send(&pipe::event_packet(origin, event.kind));
            }
            _ => debug!("Dropping {:?} for a closed pipe", event),
        }
    }

    fn drain_completions(&mut self) {
        for completion in self.worker.poll() {
            if self.sessions.contains_key(&completion.session) {
                self.apply_reply(completion.session, completion.tag, completion.reply);
            } else {
                debug!(
                    "Dropping completion {:?} for closed session {}",
                    completion.tag, completion.session
                );
            }
        }
    }

    fn begin_attach(&mut self, uri: &str) {
        let tunnel = match self.tunnels.resolve(uri) {
            Ok(tunnel) => tunnel,
            Err(e) => {
                warn!("Cannot attach {}: {}", uri, e);
                return;
            }
        };
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let result = tunnel.open().await;
            let _ = events.send(Event::Opened {
                tunnel,
                session: None,
                result,
            });
        });
    }

    fn schedule_reconnect(&mut self, id: SessionId, tunnel: Arc<dyn Tunnel>) {
        let delay = self.config.reconnect_delay();
        info!("Reconnecting session {} to {} in {:?}", id, tunnel.uri(), delay);
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let result = tunnel.open().await;
            let _ = events.send(Event::Opened {
                tunnel,
                session: Some(id),
                result,
            });
        });
    }

    fn on_opened(
        &mut self,
        tunnel: Arc<dyn Tunnel>,
        session: Option<SessionId>,
        result: io::Result<Transport>,
    ) {
        match (session, result) {
            (None, Ok(transport)) => {
                self.attach_transport(transport, Some(tunnel));
            }
            (None, Err(e)) => warn!("Failed to open {}: {}", tunnel.uri(), e),
            (Some(id), Ok(transport)) => match self.sessions.get_mut(&id) {
                Some(session) => {
                    session.connect(transport, &self.events_tx);
                    info!("Session {} reconnected to {}", id, tunnel.uri());
                }
                None => debug!("Session {} closed while reconnecting", id),
            },
            (Some(id), Err(e)) => {
                warn!("Reconnect of session {} to {} failed: {}", id, tunnel.uri(), e);
                if self.sessions.contains_key(&id) {
                    self.schedule_reconnect(id, tunnel);
                }
            }
        }
    }
}

/// Apply process-level hardening flags. Failures are logged only.
pub fn apply_platform_flags(config: &CoreConfig) {
    use nix::sys::prctl;

    if config.no_dump {
        match prctl::set_dumpable(false) {
            Ok(()) => debug!("Core dumps disabled"),
            Err(e) => warn!("Failed to disable core dumps: {}", e),
        }
    }
    if config.hide_name {
        match prctl::set_name(&CString::default()) {
            Ok(()) => debug!("Process name cleared"),
            Err(e) => warn!("Failed to clear process name: {}", e),
        }
    }
}
