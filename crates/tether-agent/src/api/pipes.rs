//! Generic pipe calls: create, read, readall, write, destroy

use tether_proto::{ErrorCode, ErrorDetails, Packet, Scope, Tag};
use tracing::{debug, warn};

use super::{missing_field, PIPE_BASE};
use crate::calls::{CallContext, CallRegistry, Reply};
use crate::error::{ChildError, PipeError, WriteError};

/// Create a pipe of a registered type
pub const PIPE_CREATE: Tag = Tag::new(Scope::Static, PIPE_BASE, 1);
/// Read buffered pipe data
pub const PIPE_READ: Tag = Tag::new(Scope::Static, PIPE_BASE, 2);
/// Take a whole buffer from a pipe
pub const PIPE_READALL: Tag = Tag::new(Scope::Static, PIPE_BASE, 3);
/// Write to a pipe
pub const PIPE_WRITE: Tag = Tag::new(Scope::Static, PIPE_BASE, 4);
/// Destroy a pipe
pub const PIPE_DESTROY: Tag = Tag::new(Scope::Static, PIPE_BASE, 5);

/// Largest single read a controller may ask for
pub const MAX_READ_LEN: usize = 4 * 1024 * 1024;

/// Register the pipe calls
pub fn register(calls: &mut CallRegistry) {
    calls.register_fn(PIPE_CREATE, create);
    calls.register_fn(PIPE_READ, read);
    calls.register_fn(PIPE_READALL, readall);
    calls.register_fn(PIPE_WRITE, write);
    calls.register_fn(PIPE_DESTROY, destroy);
}

/// Pipe type and id addressed by a request
fn target(request: &Packet) -> Option<(Tag, u32)> {
    Some((Tag::from_raw(request.get_u32(0)?), request.get_u32(1)?))
}

fn failed(tag: Tag, error: PipeError) -> Reply {
    debug!("{:?} failed: {}", tag, error);
    Reply::fail(tag, &error)
}

fn create(ctx: &mut CallContext<'_>, request: &Packet) -> Reply {
    let tag = request.tag();
    let Some(raw) = request.get_u32(0) else {
        return missing_field(tag, "pipe type");
    };
    let pipe_type = Tag::from_raw(raw);

    match ctx
        .session
        .create_pipe(ctx.pipes, pipe_type, request.get_packet(0), ctx.events)
    {
        Ok(id) => Reply::success(Packet::success(tag).with_u32(id)),
        Err(e) => {
            warn!("Creating pipe of type {:?} failed: {}", pipe_type, e);
            Reply::fail(tag, &e)
        }
    }
}

fn read(ctx: &mut CallContext<'_>, request: &Packet) -> Reply {
    let tag = request.tag();
    let (Some((pipe_type, id)), Some(max)) = (target(request), request.get_u32(2)) else {
        return missing_field(tag, "pipe type, id or length");
    };

    let mut buf = vec![0u8; (max as usize).min(MAX_READ_LEN)];
    match ctx.session.pipes_mut().read(pipe_type, id, &mut buf) {
        Ok(n) => {
            buf.truncate(n);
            Reply::success(Packet::success(tag).with_bytes(buf))
        }
        Err(e) => failed(tag, e),
    }
}

fn readall(ctx: &mut CallContext<'_>, request: &Packet) -> Reply {
    let tag = request.tag();
    let Some((pipe_type, id)) = target(request) else {
        return missing_field(tag, "pipe type or id");
    };

    match ctx.session.pipes_mut().readall(pipe_type, id) {
        Ok(data) => Reply::success(Packet::success(tag).with_bytes(data)),
        Err(e) => failed(tag, e),
    }
}

fn write(ctx: &mut CallContext<'_>, request: &Packet) -> Reply {
    let tag = request.tag();
    let (Some((pipe_type, id)), Some(data)) = (target(request), request.get_bytes(0)) else {
        return missing_field(tag, "pipe type, id or data");
    };

    match ctx.session.pipes_mut().write(pipe_type, id, data) {
        Ok(0) if !data.is_empty() => Reply::fail(
            tag,
            ErrorDetails::new(ErrorCode::ResourceFailed, "nothing written"),
        ),
        Ok(n) => Reply::success(Packet::success(tag).with_u32(n as u32)),
        // A short write still reports what went out
        Err(PipeError::Child(ChildError::Write(WriteError { written, source }))) if written > 0 => {
            warn!("Short write to pipe {} ({} of {}): {}", id, written, data.len(), source);
            Reply::success(Packet::success(tag).with_u32(written as u32))
        }
        Err(e) => failed(tag, e),
    }
}

fn destroy(ctx: &mut CallContext<'_>, request: &Packet) -> Reply {
    let tag = request.tag();
    let Some((pipe_type, id)) = target(request) else {
        return missing_field(tag, "pipe type or id");
    };

    match ctx.session.pipes_mut().destroy(pipe_type, id) {
        Ok(()) => Reply::success(Packet::success(tag)),
        Err(e) => failed(tag, e),
    }
}
