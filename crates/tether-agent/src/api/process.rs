//! Process pipes: child processes exposed as pipes

use tether_proto::{Packet, Scope, Tag};
use tracing::{debug, warn};

use super::PROCESS_BASE;
use crate::calls::{CallContext, CallRegistry, Reply};
use crate::child::{Child, ChildOptions};
use crate::config::CoreConfig;
use crate::error::PipeError;
use crate::pipe::{PipeBackend, PipeRegistry, PipeRequest};

/// Pipe type backed by a child process
pub const PROCESS_PIPE: Tag = Tag::new(Scope::Static, PROCESS_BASE, 1);
/// Kill the process behind a pipe
pub const PROCESS_KILL: Tag = Tag::new(Scope::Static, PROCESS_BASE, 1);

/// Register the process pipe type and its calls
pub fn register(calls: &mut CallRegistry, pipes: &mut PipeRegistry, config: &CoreConfig) {
    let queue_capacity = config.queue_capacity;
    pipes.register_fn(PROCESS_PIPE, move |request: &PipeRequest<'_>| {
        ProcessPipe::spawn(request, queue_capacity)
    });
    calls.register_fn(PROCESS_KILL, kill);
}

/// A running child process
pub struct ProcessPipe {
    child: Child,
}

impl ProcessPipe {
    /// Spawn the program named by the first string parameter; further
    /// strings are its arguments, the first u32 selects pty mode
    pub fn spawn(
        request: &PipeRequest<'_>,
        queue_capacity: usize,
    ) -> Result<Box<dyn PipeBackend>, PipeError> {
        let mut strings = request.params.into_iter().flat_map(|p| p.iter_str());
        let program = strings
            .next()
            .ok_or_else(|| PipeError::InvalidParams("missing program".to_string()))?
            .to_string();
        let options = ChildOptions {
            args: strings.map(str::to_string).collect(),
            pty: request.param_u32(0).unwrap_or(0) != 0,
            queue_capacity,
            ..Default::default()
        };

        let child = Child::spawn(&program, options, request.origin, request.events.clone())?;
        debug!("Process pipe {} runs {} as pid {}", request.origin.pipe_id, program, child.pid());
        Ok(Box::new(Self { child }))
    }
}

impl PipeBackend for ProcessPipe {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, PipeError> {
        Ok(self.child.read(buf)?)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, PipeError> {
        Ok(self.child.write(buf)?)
    }

    fn kill(&mut self) -> Result<(), PipeError> {
        Ok(self.child.kill()?)
    }

    fn destroy(&mut self) -> Result<(), PipeError> {
        self.child.destroy();
        Ok(())
    }
}

fn kill(ctx: &mut CallContext<'_>, request: &Packet) -> Reply {
    match request.get_u32(0) {
        Some(id) => {
            if let Err(e) = ctx.session.pipes_mut().kill(PROCESS_PIPE, id) {
                warn!("Killing process pipe {} failed: {}", id, e);
            }
        }
        None => warn!("Kill request without pipe id"),
    }
    Reply::silent()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calls::ResultCode;
    use crate::event::{self, ChildEventKind, Event, EventReceiver};
    use crate::pipe::PipeTable;
    use crate::session::Session;
    use crate::worker::WorkerBridge;
    use std::time::Duration;

    fn registry() -> PipeRegistry {
        let mut calls = CallRegistry::new();
        let mut pipes = PipeRegistry::new();
        register(&mut calls, &mut pipes, &CoreConfig::default());
        pipes
    }

    async fn next_kind(rx: &mut EventReceiver) -> ChildEventKind {
        match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
            Ok(Some(Event::Child(event))) => event.kind,
            other => panic!("expected a child event, got {:?}", other),
        }
    }

    async fn wait_exit(rx: &mut EventReceiver) -> i32 {
        loop {
            if let ChildEventKind::Exit(code) = next_kind(rx).await {
                return code;
            }
        }
    }

    #[tokio::test]
    async fn test_process_output_through_pipe() {
        let pipes = registry();
        let (tx, mut rx) = event::channel();
        let mut table = PipeTable::new(1);

        let params = Packet::new(PROCESS_PIPE)
            .with_string("sh")
            .with_string("-c")
            .with_string("printf hello");
        let id = table.create(&pipes, PROCESS_PIPE, Some(&params), &tx).unwrap();

        assert_eq!(wait_exit(&mut rx).await, 0);
        let mut buf = [0u8; 16];
        let n = table.read(PROCESS_PIPE, id, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[tokio::test]
    async fn test_write_reaches_child() {
        let pipes = registry();
        let (tx, mut rx) = event::channel();
        let mut table = PipeTable::new(1);

        let params = Packet::new(PROCESS_PIPE).with_string("cat");
        let id = table.create(&pipes, PROCESS_PIPE, Some(&params), &tx).unwrap();
        assert_eq!(table.write(PROCESS_PIPE, id, b"ping").unwrap(), 4);
        assert_eq!(next_kind(&mut rx).await, ChildEventKind::Output);

        let mut buf = [0u8; 16];
        let n = table.read(PROCESS_PIPE, id, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");
    }

    #[tokio::test]
    async fn test_missing_program() {
        let pipes = registry();
        let (tx, _rx) = event::channel();
        let mut table = PipeTable::new(1);

        let result = table.create(&pipes, PROCESS_PIPE, None, &tx);
        assert!(matches!(result, Err(PipeError::InvalidParams(_))));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_kill_call_is_silent() {
        let pipes = registry();
        let (tx, mut rx) = event::channel();
        let mut session = Session::detached(1);

        let params = Packet::new(PROCESS_PIPE).with_string("sleep").with_string("10");
        let id = session
            .create_pipe(&pipes, PROCESS_PIPE, Some(&params), &tx)
            .unwrap();

        let mut calls = CallRegistry::new();
        calls.register_fn(PROCESS_KILL, kill);
        let worker = WorkerBridge::new();
        let mut ctx = CallContext {
            session: &mut session,
            pipes: &pipes,
            worker: &worker,
            identity: "test",
            events: &tx,
        };
        let reply = calls.dispatch(&mut ctx, &Packet::new(PROCESS_KILL).with_u32(id));
        assert_eq!(reply.code, ResultCode::Silent);
        assert_eq!(wait_exit(&mut rx).await, -1);

        let reply = calls.dispatch(&mut ctx, &Packet::new(PROCESS_KILL).with_u32(99));
        assert_eq!(reply.code, ResultCode::Silent);
    }
}
