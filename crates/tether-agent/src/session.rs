//! Sessions: one controller connection with its queues, crypto state and pipes

use bytes::Bytes;
use std::io;
use std::sync::Arc;
use tether_proto::{FrameError, Packet, PacketCodec, Tag};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, warn};

use crate::error::PipeError;
use crate::event::{Event, EventSender};
use crate::pipe::{PipeRegistry, PipeTable};
use crate::tunnel::{Transport, Tunnel};

/// Session identifier, unique within one runtime
pub type SessionId = u32;

const READ_BUFFER_SIZE: usize = 8192;

/// Dispatch state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for or holding buffered requests
    Active,
    /// A handler is running for this session
    Dispatching,
    /// Tearing down after Break or disconnect
    Closing,
    /// Gone
    Closed,
}

/// Whether traffic is encrypted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Security {
    /// Plain traffic
    #[default]
    NotSecure,
    /// Encrypted by the external provider
    Secure,
}

/// Cipher negotiated with the external provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Algorithm {
    /// No cipher
    #[default]
    None,
    /// AES-256 in CBC mode
    Aes256Cbc,
    /// ChaCha20
    ChaCha20,
}

/// Encryption state of a session. The runtime only stores and resets it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CryptoState {
    /// On/off switch
    pub security: Security,
    /// Selected cipher
    pub algorithm: Algorithm,
}

impl CryptoState {
    /// Mark the session secure with `algorithm`
    pub fn enable(&mut self, algorithm: Algorithm) {
        self.security = Security::Secure;
        self.algorithm = algorithm;
    }

    /// Back to plain traffic with no cipher
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Whether encryption is on
    pub fn is_secure(&self) -> bool {
        self.security == Security::Secure
    }
}

/// One logical connection to a controller
pub struct Session {
    id: SessionId,
    state: SessionState,
    codec: PacketCodec,
    outbound: Option<mpsc::UnboundedSender<Bytes>>,
    reader: Option<AbortHandle>,
    writer: Option<JoinHandle<()>>,
    tunnel: Option<Arc<dyn Tunnel>>,
    crypto: CryptoState,
    keep_alive: bool,
    pipes: PipeTable,
}

impl Session {
    /// Create a session that has no transport yet
    pub fn detached(id: SessionId) -> Self {
        Self::new(id, false, PacketCodec::new(), None)
    }

    /// Create a session around `codec`, optionally remembering the tunnel
    /// it came from so it can be reopened
    pub fn new(
        id: SessionId,
        keep_alive: bool,
        codec: PacketCodec,
        tunnel: Option<Arc<dyn Tunnel>>,
    ) -> Self {
        Self {
            id,
            state: SessionState::Active,
            codec,
            outbound: None,
            reader: None,
            writer: None,
            tunnel,
            crypto: CryptoState::default(),
            keep_alive,
            pipes: PipeTable::new(id),
        }
    }

    /// Session id
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Current dispatch state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Move to another dispatch state
    pub fn set_state(&mut self, state: SessionState) {
        self.state = state;
    }

    /// Whether the session still counts as active
    pub fn is_active(&self) -> bool {
        matches!(self.state, SessionState::Active | SessionState::Dispatching)
    }

    /// Encryption state
    pub fn crypto(&self) -> &CryptoState {
        &self.crypto
    }

    /// Mutable encryption state
    pub fn crypto_mut(&mut self) -> &mut CryptoState {
        &mut self.crypto
    }

    /// Whether the session survives Break and disconnects
    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Set the keep-alive flag
    pub fn set_keep_alive(&mut self, keep_alive: bool) {
        self.keep_alive = keep_alive;
    }

    /// Tunnel the transport came from
    pub fn tunnel(&self) -> Option<&Arc<dyn Tunnel>> {
        self.tunnel.as_ref()
    }

    /// Whether a transport is attached
    pub fn is_connected(&self) -> bool {
        self.outbound.is_some()
    }

    /// Pipes owned by this session
    pub fn pipes(&self) -> &PipeTable {
        &self.pipes
    }

    /// Mutable access to the pipes owned by this session
    pub fn pipes_mut(&mut self) -> &mut PipeTable {
        &mut self.pipes
    }

    /// Create a pipe owned by this session
    pub fn create_pipe(
        &mut self,
        registry: &PipeRegistry,
        pipe_type: Tag,
        params: Option<&Packet>,
        events: &EventSender,
    ) -> Result<u32, PipeError> {
        self.pipes.create(registry, pipe_type, params, events)
    }

    /// Start reader and writer tasks for `transport`
    pub fn connect(&mut self, transport: Transport, events: &EventSender) {
        self.disconnect();

        let (reader, writer) = tokio::io::split(transport);
        let (tx, rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_loop(self.id, reader, events.clone()));
        let writer = tokio::spawn(write_loop(self.id, writer, rx, events.clone()));

        self.reader = Some(reader.abort_handle());
        self.writer = Some(writer);
        self.outbound = Some(tx);
        debug!("Session {} connected", self.id);
    }

    /// Stop the reader and let the writer flush and shut the transport down
    pub fn disconnect(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if self.outbound.take().is_some() {
            debug!("Session {} disconnected", self.id);
        }
        self.codec.clear_buffer();
    }

    /// Buffer transport bytes
    pub fn feed(&mut self, data: &[u8]) {
        self.codec.push(data);
    }

    /// Next complete request, if one is buffered
    pub fn next_request(&mut self) -> Result<Option<Packet>, FrameError> {
        self.codec.next_packet()
    }

    /// Queue a packet for the transport. Returns false when it cannot be sent.
    pub fn send(&mut self, packet: &Packet) -> bool {
        let Some(outbound) = &self.outbound else {
            debug!("Session {} has no transport, dropping {:?}", self.id, packet.tag());
            return false;
        };
        match self.codec.encode_packet(packet) {
            Ok(data) => outbound.send(data).is_ok(),
            Err(e) => {
                warn!("Session {} cannot send {:?}: {}", self.id, packet.tag(), e);
                false
            }
        }
    }

    /// Writer task of the latest transport. It finishes once every queued
    /// packet is written and the transport is shut down.
    pub fn take_writer(&mut self) -> Option<JoinHandle<()>> {
        self.writer.take()
    }

    /// Destroy all pipes and drop the transport
    pub fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.state = SessionState::Closing;
        self.pipes.destroy_all();
        self.disconnect();
        self.state = SessionState::Closed;
        debug!("Session {} closed", self.id);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

async fn read_loop(id: SessionId, mut reader: ReadHalf<Transport>, events: EventSender) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                let _ = events.send(Event::Disconnected {
                    session: id,
                    error: None,
                });
                return;
            }
            Ok(n) => {
                let data = Bytes::copy_from_slice(&buf[..n]);
                if events.send(Event::Inbound { session: id, data }).is_err() {
                    return;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                let _ = events.send(Event::Disconnected {
                    session: id,
                    error: Some(e),
                });
                return;
            }
        }
    }
}

async fn write_loop(
    id: SessionId,
    mut writer: WriteHalf<Transport>,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
    events: EventSender,
) {
    while let Some(data) = outbound.recv().await {
        let result = match writer.write_all(&data).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            let _ = events.send(Event::Disconnected {
                session: id,
                error: Some(e),
            });
            return;
        }
    }
    if let Err(e) = writer.shutdown().await {
        debug!("Session {} transport shutdown failed: {}", id, e);
    }
}
