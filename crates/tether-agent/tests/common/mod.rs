//! Shared helpers: a scripted controller talking to a runtime over an
//! in-memory transport

#![allow(dead_code)]

use anyhow::{bail, Context, Result};
use std::collections::VecDeque;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tether_agent::api::builtins::CORE_QUIT;
use tether_agent::pipe::PIPE_EVENT;
use tether_agent::tunnel::Transport;
use tether_agent::{Core, CoreConfig, SessionId};
use tether_proto::{ErrorCode, Packet, PacketCodec, Status, Tag};
use tokio::net::{TcpListener, TcpSocket};

/// Upper bound for any single wait in these tests
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Runtime with the built-ins and a fixed identity
pub fn core() -> Core {
    Core::with_builtins(CoreConfig {
        identity: Some("itest".to_string()),
        ..Default::default()
    })
}

/// Runtime whose sessions survive quit and reconnect after `reconnect_delay_ms`
pub fn keep_alive_core(reconnect_delay_ms: u64) -> Core {
    Core::with_builtins(CoreConfig {
        identity: Some("itest".to_string()),
        keep_alive: true,
        reconnect_delay_ms,
        ..Default::default()
    })
}

/// TCP listener that can be bound again on the same address once dropped
pub fn rebindable_listener(addr: SocketAddr) -> Result<TcpListener> {
    let socket = TcpSocket::new_v4()?;
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    Ok(socket.listen(16)?)
}

/// Accept one connection as a controller
pub async fn accept(listener: &TcpListener) -> Result<Controller> {
    let (stream, _) = tokio::time::timeout(TEST_TIMEOUT, listener.accept())
        .await
        .context("no connection from the agent")??;
    Ok(Controller::new(Box::new(stream)))
}

/// Attach a fresh in-memory transport and return the controller end
pub fn attach(core: &mut Core) -> (SessionId, Controller) {
    let (agent_side, controller_side) = tokio::io::duplex(256 * 1024);
    let id = core.attach_transport(Box::new(agent_side), None);
    (id, Controller::new(Box::new(controller_side)))
}

/// Run the reactor and `script` side by side until both finish
pub async fn drive<F>(core: &mut Core, script: F) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    let (ran, scripted) = tokio::time::timeout(TEST_TIMEOUT, async {
        tokio::join!(core.run(), script)
    })
    .await
    .context("runtime or script did not finish")?;
    scripted?;
    ran?;
    Ok(())
}

/// Controller end of a session
pub struct Controller {
    stream: Transport,
    codec: PacketCodec,
    events: VecDeque<Packet>,
}

impl Controller {
    /// Wrap a transport
    pub fn new(stream: Transport) -> Self {
        Self {
            stream,
            codec: PacketCodec::new(),
            events: VecDeque::new(),
        }
    }

    /// Send one request
    pub async fn send(&mut self, request: &Packet) -> Result<()> {
        self.codec.write_packet(&mut self.stream, request).await?;
        Ok(())
    }

    /// Send raw bytes
    pub async fn send_raw(&mut self, data: &[u8]) -> Result<()> {
        use tokio::io::AsyncWriteExt;
        self.stream.write_all(data).await?;
        Ok(())
    }

    /// Next packet of any kind; `None` once the agent closed the transport
    pub async fn recv(&mut self) -> Result<Option<Packet>> {
        let packet = tokio::time::timeout(TEST_TIMEOUT, self.codec.read_packet(&mut self.stream))
            .await
            .context("timed out waiting for a packet")??;
        Ok(packet)
    }

    /// Next response, setting pipe events aside
    pub async fn response(&mut self) -> Result<Packet> {
        loop {
            match self.recv().await? {
                Some(packet) if packet.tag() == PIPE_EVENT => self.events.push_back(packet),
                Some(packet) => return Ok(packet),
                None => bail!("transport closed while waiting for a response"),
            }
        }
    }

    /// Send `request` and wait for its response
    pub async fn call(&mut self, request: Packet) -> Result<Packet> {
        let tag = request.tag();
        self.send(&request).await?;
        let response = self.response().await?;
        if response.tag() != tag {
            bail!("response {:?} does not match request {:?}", response.tag(), tag);
        }
        Ok(response)
    }

    /// Call and require a success status
    pub async fn call_ok(&mut self, request: Packet) -> Result<Packet> {
        let response = self.call(request).await?;
        if response.status() != Some(Status::Success) {
            bail!("call failed: {:?}", response.error_details());
        }
        Ok(response)
    }

    /// Call and return the failure code
    pub async fn call_err(&mut self, request: Packet) -> Result<ErrorCode> {
        let response = self.call(request).await?;
        let details = response
            .error_details()
            .context("expected a failure response")?;
        Ok(details.code)
    }

    /// Next unsolicited pipe event
    pub async fn event(&mut self) -> Result<Packet> {
        if let Some(event) = self.events.pop_front() {
            return Ok(event);
        }
        match self.recv().await? {
            Some(packet) if packet.tag() == PIPE_EVENT => Ok(packet),
            Some(packet) => bail!("expected a pipe event, got {:?}", packet.tag()),
            None => bail!("transport closed while waiting for an event"),
        }
    }

    /// Quit the session and expect the agent to hang up
    pub async fn quit(&mut self) -> Result<()> {
        self.call_ok(Packet::new(CORE_QUIT)).await?;
        self.expect_closed().await
    }

    /// Expect end of stream
    pub async fn expect_closed(&mut self) -> Result<()> {
        loop {
            match self.recv().await? {
                Some(packet) if packet.tag() == PIPE_EVENT => continue,
                Some(packet) => bail!("expected end of stream, got {:?}", packet.tag()),
                None => return Ok(()),
            }
        }
    }
}

/// Request addressing a pipe: type and id first
pub fn pipe_request(tag: Tag, pipe_type: Tag, id: u32) -> Packet {
    Packet::new(tag).with_u32(pipe_type.raw()).with_u32(id)
}
