//! Core calls: quit, identity, keep-alive and tunnel attachment

use tether_proto::{Packet, Scope, Tag};
use tracing::{debug, info};

use super::{missing_field, CORE_BASE};
use crate::calls::{CallContext, CallRegistry, Reply};
use crate::event::Event;

/// End the session
pub const CORE_QUIT: Tag = Tag::new(Scope::Static, CORE_BASE, 1);
/// Report the runtime identity
pub const CORE_IDENTITY: Tag = Tag::new(Scope::Static, CORE_BASE, 2);
/// Set the session keep-alive flag
pub const CORE_KEEP_ALIVE: Tag = Tag::new(Scope::Static, CORE_BASE, 3);
/// Attach another tunnel by URI
pub const CORE_ADD_TUNNEL: Tag = Tag::new(Scope::Static, CORE_BASE, 4);

/// Register the core calls
pub fn register(calls: &mut CallRegistry) {
    calls.register_fn(CORE_QUIT, quit);
    calls.register_fn(CORE_IDENTITY, identity);
    calls.register_fn(CORE_KEEP_ALIVE, keep_alive);
    calls.register_fn(CORE_ADD_TUNNEL, add_tunnel);
}

fn quit(ctx: &mut CallContext<'_>, request: &Packet) -> Reply {
    info!("Session {} asked to quit", ctx.session.id());
    Reply::break_with(Packet::success(request.tag()))
}

fn identity(ctx: &mut CallContext<'_>, request: &Packet) -> Reply {
    Reply::success(Packet::success(request.tag()).with_string(ctx.identity))
}

fn keep_alive(ctx: &mut CallContext<'_>, request: &Packet) -> Reply {
    let Some(flag) = request.get_u32(0) else {
        return missing_field(request.tag(), "keep-alive flag");
    };
    ctx.session.set_keep_alive(flag != 0);
    debug!("Session {} keep-alive {}", ctx.session.id(), flag != 0);
    Reply::success(Packet::success(request.tag()))
}

fn add_tunnel(ctx: &mut CallContext<'_>, request: &Packet) -> Reply {
    let Some(uri) = request.get_str(0) else {
        return missing_field(request.tag(), "tunnel uri");
    };
    info!("Session {} requested tunnel {}", ctx.session.id(), uri);
    let _ = ctx.events.send(Event::Attach {
        uri: uri.to_string(),
    });
    Reply::callback(Packet::success(request.tag()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calls::ResultCode;
    use crate::event;
    use crate::pipe::PipeRegistry;
    use crate::session::Session;
    use crate::worker::WorkerBridge;
    use tether_proto::{ErrorCode, Status};

    fn call(session: &mut Session, request: &Packet) -> (Reply, event::EventReceiver) {
        let (tx, rx) = event::channel();
        let mut calls = CallRegistry::new();
        register(&mut calls);
        let pipes = PipeRegistry::new();
        let worker = WorkerBridge::new();
        let mut ctx = CallContext {
            session,
            pipes: &pipes,
            worker: &worker,
            identity: "agent-1",
            events: &tx,
        };
        (calls.dispatch(&mut ctx, request), rx)
    }

    #[test]
    fn test_quit_breaks() {
        let mut session = Session::detached(1);
        let (reply, _) = call(&mut session, &Packet::new(CORE_QUIT));
        assert_eq!(reply.code, ResultCode::Break);
        assert_eq!(reply.response.unwrap().status(), Some(Status::Success));
    }

    #[test]
    fn test_identity() {
        let mut session = Session::detached(1);
        let (reply, _) = call(&mut session, &Packet::new(CORE_IDENTITY));
        assert_eq!(reply.response.unwrap().get_str(0), Some("agent-1"));
    }

    #[test]
    fn test_keep_alive_flag() {
        let mut session = Session::detached(1);
        call(&mut session, &Packet::new(CORE_KEEP_ALIVE).with_u32(1));
        assert!(session.keep_alive());
        call(&mut session, &Packet::new(CORE_KEEP_ALIVE).with_u32(0));
        assert!(!session.keep_alive());

        let (reply, _) = call(&mut session, &Packet::new(CORE_KEEP_ALIVE));
        let details = reply.response.unwrap().error_details().unwrap();
        assert_eq!(details.code, ErrorCode::InvalidRequest);
    }

    #[test]
    fn test_add_tunnel_posts_attach() {
        let mut session = Session::detached(1);
        let request = Packet::new(CORE_ADD_TUNNEL).with_string("tcp://127.0.0.1:9");
        let (reply, mut rx) = call(&mut session, &request);
        assert_eq!(reply.code, ResultCode::Callback);

        match rx.try_recv().unwrap() {
            Event::Attach { uri } => assert_eq!(uri, "tcp://127.0.0.1:9"),
            other => panic!("unexpected event {:?}", other),
        }
    }
}
