//! Integration tests for session lifecycle and dispatch through a running
//! runtime

mod common;

use anyhow::Result;
use common::*;
use std::time::Duration;
use tether_agent::api::builtins::{CORE_ADD_TUNNEL, CORE_IDENTITY, CORE_KEEP_ALIVE, CORE_QUIT};
use tether_agent::api::pipes::{PIPE_CREATE, PIPE_DESTROY};
use tether_agent::api::process::PROCESS_PIPE;
use tether_agent::tunnel::Transport;
use tether_proto::{ErrorCode, Packet, Status, Tag};
use tokio::net::TcpListener;
use tokio::runtime::{Builder, Runtime};

fn current_thread_runtime() -> Result<Runtime> {
    Ok(Builder::new_current_thread().enable_all().build()?)
}

/// Unknown tags fail without hurting the session
#[tokio::test]
async fn test_unknown_call_keeps_session() -> Result<()> {
    let mut core = core();
    let (_, mut controller) = attach(&mut core);

    drive(&mut core, async move {
        let code = controller.call_err(Packet::new(Tag::from_raw(0xFFFF_FFFF))).await?;
        assert_eq!(code, ErrorCode::UnknownCall);

        let identity = controller.call_ok(Packet::new(CORE_IDENTITY)).await?;
        assert_eq!(identity.get_str(0), Some("itest"));

        controller.quit().await
    })
    .await?;

    assert_eq!(core.stop_requests(), 1);
    Ok(())
}

/// A request whose fields cannot be decoded fails with its own tag
#[tokio::test]
async fn test_malformed_request_is_answered() -> Result<()> {
    let mut core = core();
    let (_, mut controller) = attach(&mut core);

    drive(&mut core, async move {
        let mut bad = Packet::new(CORE_IDENTITY).with_u32(7).encode().to_vec();
        // Integer field claiming three bytes
        bad[12] = 3;
        bad.truncate(16);
        controller.send_raw(&bad).await?;

        let response = controller.response().await?;
        assert_eq!(response.tag(), CORE_IDENTITY);
        assert_eq!(
            response.error_details().map(|d| d.code),
            Some(ErrorCode::InvalidRequest)
        );

        controller.call_ok(Packet::new(CORE_IDENTITY)).await?;
        controller.quit().await
    })
    .await?;
    Ok(())
}

/// Quitting one of two sessions leaves the runtime serving the other
#[tokio::test]
async fn test_quit_one_of_two_sessions() -> Result<()> {
    let mut core = core();
    let (_, mut first) = attach(&mut core);
    let (_, mut second) = attach(&mut core);

    drive(&mut core, async move {
        first.quit().await?;

        let identity = second.call_ok(Packet::new(CORE_IDENTITY)).await?;
        assert_eq!(identity.get_str(0), Some("itest"));

        second.quit().await
    })
    .await?;

    assert_eq!(core.stop_requests(), 1);
    assert_eq!(core.active_sessions(), 0);
    Ok(())
}

/// A keep-alive session answers quit but stays usable
#[tokio::test]
async fn test_keep_alive_survives_quit() -> Result<()> {
    let mut core = core();
    let (id, mut controller) = attach(&mut core);

    drive(&mut core, async move {
        controller.call_ok(Packet::new(CORE_KEEP_ALIVE).with_u32(1)).await?;
        controller.call_ok(Packet::new(CORE_QUIT)).await?;

        let identity = controller.call_ok(Packet::new(CORE_IDENTITY)).await?;
        assert_eq!(identity.get_str(0), Some("itest"));

        controller.call_ok(Packet::new(CORE_KEEP_ALIVE).with_u32(0)).await?;
        controller.quit().await
    })
    .await?;

    assert!(core.session(id).is_none());
    assert_eq!(core.stop_requests(), 1);
    Ok(())
}

/// Losing the last transport stops the runtime
#[tokio::test]
async fn test_disconnect_of_last_session_stops() -> Result<()> {
    let mut core = core();
    let (_, controller) = attach(&mut core);

    drive(&mut core, async move {
        drop(controller);
        Ok(())
    })
    .await?;

    assert_eq!(core.stop_requests(), 1);
    Ok(())
}

/// Tunnels requested by a handler come up as new sessions
#[tokio::test]
async fn test_add_tunnel_attaches_session() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let uri = format!("tcp://{}", listener.local_addr()?);

    let mut core = core();
    let (_, mut controller) = attach(&mut core);

    drive(&mut core, async move {
        controller
            .call_ok(Packet::new(CORE_ADD_TUNNEL).with_string(uri))
            .await?;

        let (stream, _) = listener.accept().await?;
        let transport: Transport = Box::new(stream);
        let mut tunneled = Controller::new(transport);
        let identity = tunneled.call_ok(Packet::new(CORE_IDENTITY)).await?;
        assert_eq!(identity.get_str(0), Some("itest"));

        controller.quit().await?;
        tunneled.quit().await
    })
    .await?;

    assert_eq!(core.stop_requests(), 1);
    Ok(())
}

/// Unsupported tunnel schemes are rejected without touching the session
#[tokio::test]
async fn test_add_tunnel_unknown_scheme() -> Result<()> {
    let mut core = core();
    let (_, mut controller) = attach(&mut core);

    drive(&mut core, async move {
        controller
            .call_ok(Packet::new(CORE_ADD_TUNNEL).with_string("gopher://nowhere"))
            .await?;
        controller.call_ok(Packet::new(CORE_IDENTITY)).await?;
        controller.quit().await
    })
    .await?;
    Ok(())
}

/// The final reply is written before `run` returns, even when the tokio
/// runtime is dropped right afterwards as the binary does
#[test]
fn test_quit_reply_survives_runtime_drop() -> Result<()> {
    let runtime = current_thread_runtime()?;
    let mut controller = runtime.block_on(async {
        let mut core = core();
        let (_, mut controller) = attach(&mut core);
        controller.send(&Packet::new(CORE_QUIT)).await?;
        core.run().await?;
        assert_eq!(core.stop_requests(), 1);
        Ok::<_, anyhow::Error>(controller)
    })?;
    drop(runtime);

    current_thread_runtime()?.block_on(async {
        let response = controller.response().await?;
        assert_eq!(response.tag(), CORE_QUIT);
        assert_eq!(response.status(), Some(Status::Success));
        controller.expect_closed().await
    })
}

/// A keep-alive session whose tunnel drops reconnects as the same session
#[tokio::test]
async fn test_keep_alive_session_reconnects() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let uri = format!("tcp://{}", listener.local_addr()?);

    let mut core = keep_alive_core(0);
    let (attached, first) = tokio::join!(core.add_uri(&uri), accept(&listener));
    let id = attached?;
    let mut first = first?;

    drive(&mut core, async move {
        let request = Packet::new(PIPE_CREATE)
            .with_u32(PROCESS_PIPE.raw())
            .with_packet(Packet::new(PROCESS_PIPE).with_string("sleep").with_string("30"));
        let pipe_id = first.call_ok(request).await?.get_u32(1).unwrap_or_default();
        drop(first);

        let mut second = accept(&listener).await?;
        let identity = second.call_ok(Packet::new(CORE_IDENTITY)).await?;
        assert_eq!(identity.get_str(0), Some("itest"));
        // Pipes outlive the transport, so this is still the same session
        second
            .call_ok(pipe_request(PIPE_DESTROY, PROCESS_PIPE, pipe_id))
            .await?;

        second.call_ok(Packet::new(CORE_KEEP_ALIVE).with_u32(0)).await?;
        second.quit().await
    })
    .await?;

    assert!(core.session(id).is_none());
    assert_eq!(core.stop_requests(), 1);
    Ok(())
}

/// Reconnects that fail are retried until the tunnel is reachable again
#[tokio::test]
async fn test_failed_reconnect_is_retried() -> Result<()> {
    let listener = rebindable_listener("127.0.0.1:0".parse()?)?;
    let addr = listener.local_addr()?;

    let mut core = keep_alive_core(10);
    let uri = format!("tcp://{}", addr);
    let (attached, first) = tokio::join!(core.add_uri(&uri), accept(&listener));
    attached?;
    let mut first = first?;

    drive(&mut core, async move {
        first.call_ok(Packet::new(CORE_IDENTITY)).await?;
        drop(listener);
        drop(first);

        // Several attempts are refused meanwhile
        tokio::time::sleep(Duration::from_millis(100)).await;
        let listener = rebindable_listener(addr)?;

        let mut second = accept(&listener).await?;
        let identity = second.call_ok(Packet::new(CORE_IDENTITY)).await?;
        assert_eq!(identity.get_str(0), Some("itest"));

        second.call_ok(Packet::new(CORE_KEEP_ALIVE).with_u32(0)).await?;
        second.quit().await
    })
    .await?;

    assert_eq!(core.stop_requests(), 1);
    Ok(())
}
