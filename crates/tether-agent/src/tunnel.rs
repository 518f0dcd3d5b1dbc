//! Tunnels: URI schemes that produce transports

use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf, Stdin, Stdout};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::AgentError;

/// A duplex byte stream carrying packets
pub trait TransportStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> TransportStream for T {}

/// Boxed transport handed to a session
pub type Transport = Box<dyn TransportStream>;

/// Something that can produce a transport, possibly more than once
#[async_trait]
pub trait Tunnel: Send + Sync {
    /// URI this tunnel was built from
    fn uri(&self) -> &str;

    /// Open a new transport
    async fn open(&self) -> io::Result<Transport>;

    /// Whether `open` may be called again after the transport drops
    fn reopenable(&self) -> bool;
}

/// Outbound TCP connection, `tcp://host:port`
pub struct TcpTunnel {
    uri: String,
    addr: String,
}

impl TcpTunnel {
    /// Build from the part after the scheme
    pub fn new(uri: &str, rest: &str) -> Result<Self, AgentError> {
        let addr = rest.trim_end_matches('/');
        match addr.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => Ok(Self {
                uri: uri.to_string(),
                addr: addr.to_string(),
            }),
            _ => Err(AgentError::InvalidUri(uri.to_string())),
        }
    }
}

#[async_trait]
impl Tunnel for TcpTunnel {
    fn uri(&self) -> &str {
        &self.uri
    }

    async fn open(&self) -> io::Result<Transport> {
        let stream = TcpStream::connect(&self.addr).await?;
        stream.set_nodelay(true)?;
        debug!("Connected to {}", self.addr);
        Ok(Box::new(stream))
    }

    fn reopenable(&self) -> bool {
        true
    }
}

/// The process's own stdin and stdout, `stdio://`
pub struct StdioTunnel {
    uri: String,
}

impl StdioTunnel {
    /// Build from the full URI
    pub fn new(uri: &str) -> Self {
        Self {
            uri: uri.to_string(),
        }
    }
}

#[async_trait]
impl Tunnel for StdioTunnel {
    fn uri(&self) -> &str {
        &self.uri
    }

    async fn open(&self) -> io::Result<Transport> {
        Ok(Box::new(StdioTransport {
            stdin: tokio::io::stdin(),
            stdout: tokio::io::stdout(),
        }))
    }

    fn reopenable(&self) -> bool {
        false
    }
}

/// Stdin for reads, stdout for writes
struct StdioTransport {
    stdin: Stdin,
    stdout: Stdout,
}

impl AsyncRead for StdioTransport {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdin).poll_read(cx, buf)
    }
}

impl AsyncWrite for StdioTransport {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stdout).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdout).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdout).poll_shutdown(cx)
    }
}

/// Builds a tunnel from the full URI and the part after `scheme://`
pub type TunnelConstructor = fn(&str, &str) -> Result<Arc<dyn Tunnel>, AgentError>;

/// Maps URI schemes to tunnel constructors
pub struct TunnelTable {
    schemes: HashMap<String, TunnelConstructor>,
}

impl Default for TunnelTable {
    fn default() -> Self {
        let mut table = Self::empty();
        table.register("tcp", |uri, rest| Ok(Arc::new(TcpTunnel::new(uri, rest)?)));
        table.register("stdio", |uri, _rest| Ok(Arc::new(StdioTunnel::new(uri))));
        table
    }
}

impl TunnelTable {
    /// Table with no schemes at all
    pub fn empty() -> Self {
        Self {
            schemes: HashMap::new(),
        }
    }

    /// Register or replace a scheme
    pub fn register(&mut self, scheme: &str, constructor: TunnelConstructor) {
        self.schemes.insert(scheme.to_ascii_lowercase(), constructor);
    }

    /// Whether a scheme is known
    pub fn supports(&self, scheme: &str) -> bool {
        self.schemes.contains_key(&scheme.to_ascii_lowercase())
    }

    /// Build a tunnel for `uri`
    pub fn resolve(&self, uri: &str) -> Result<Arc<dyn Tunnel>, AgentError> {
        let (scheme, rest) = uri
            .split_once("://")
            .ok_or_else(|| AgentError::InvalidUri(uri.to_string()))?;
        let constructor = self
            .schemes
            .get(&scheme.to_ascii_lowercase())
            .ok_or_else(|| AgentError::UnsupportedScheme(scheme.to_string()))?;
        constructor(uri, rest)
    }

    /// Drop every scheme
    pub fn clear(&mut self) {
        self.schemes.clear();
    }
}
