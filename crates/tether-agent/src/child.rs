//! Child process manager
//!
//! A [`Child`] owns one OS process, a bounded input queue and two bounded
//! output queues. Every descriptor is registered with the reactor through
//! [`AsyncFd`]; each readiness event drains an output descriptor into its
//! queue and emits at most one [`ChildEvent`]. Input is written by a task that
//! waits for writability, so the reactor thread never blocks on a child.
//! Exit is observed through `SIGCHLD`.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::pty::openpty;
use nix::sys::signal::{self, Signal};
use nix::unistd::{setsid, Pid};
use tokio::io::unix::AsyncFd;
use tokio::signal::unix::{signal as unix_signal, Signal as SignalStream, SignalKind};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, warn};

use crate::error::{ChildError, WriteError};
use crate::event::{ChildEvent, ChildEventKind, Event, EventSender};
use crate::pipe::PipeOrigin;
use crate::queue::{SharedQueue, DEFAULT_QUEUE_CAPACITY};

/// How long readers may keep draining after the process exited
pub const EXIT_DRAIN_GRACE: Duration = Duration::from_millis(250);

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(500);
const READ_CHUNK: usize = 4096;

/// Spawn options
#[derive(Debug, Clone)]
pub struct ChildOptions {
    /// Arguments after the program name
    pub args: Vec<String>,
    /// Extra environment variables
    pub env: Vec<(String, String)>,
    /// Working directory
    pub cwd: Option<PathBuf>,
    /// Run the child on a pseudo-terminal
    pub pty: bool,
    /// Capacity of the input queue and of each output queue
    pub queue_capacity: usize,
}

impl Default for ChildOptions {
    fn default() -> Self {
        Self {
            args: Vec::new(),
            env: Vec::new(),
            cwd: None,
            pty: false,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Liveness of the OS process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildStatus {
    /// Process has not been reaped yet
    Running,
    /// Process terminated
    Dead,
}

#[derive(Debug, Default)]
struct ExitState {
    dead: AtomicBool,
    code: AtomicI32,
}

/// Handle to a spawned child process
pub struct Child {
    pid: Pid,
    origin: PipeOrigin,
    input: Option<mpsc::UnboundedSender<Bytes>>,
    input_pending: Arc<AtomicUsize>,
    input_capacity: usize,
    stdout: SharedQueue,
    stderr: SharedQueue,
    exit: Arc<ExitState>,
    tasks: Vec<AbortHandle>,
    destroyed: bool,
}

impl Child {
    /// Spawn `program` and register its output with the reactor.
    ///
    /// Must be called from within the runtime. Events for this child are
    /// tagged with `origin` and delivered on `events`.
    pub fn spawn(
        program: &str,
        options: ChildOptions,
        origin: PipeOrigin,
        events: EventSender,
    ) -> Result<Self, ChildError> {
        let mut command = Command::new(program);
        command.args(&options.args);
        for (key, value) in &options.env {
            command.env(key, value);
        }
        if let Some(cwd) = &options.cwd {
            command.current_dir(cwd);
        }

        // Registered before the child exists so its SIGCHLD cannot be missed
        let sigchld = unix_signal(SignalKind::child())?;

        let spawn_error = |source| ChildError::Spawn {
            program: program.to_string(),
            source,
        };

        let (mut process, stdin, stdout, stderr) = if options.pty {
            let pty = openpty(None, None)?;
            command
                .stdin(Stdio::from(pty.slave.try_clone()?))
                .stdout(Stdio::from(pty.slave.try_clone()?))
                .stderr(Stdio::from(pty.slave));

            // SAFETY: only async-signal-safe calls run between fork and exec
            unsafe {
                command.pre_exec(|| {
                    setsid().map_err(io::Error::from)?;
                    if libc::ioctl(libc::STDIN_FILENO, libc::TIOCSCTTY as _, 0) < 0 {
                        return Err(io::Error::last_os_error());
                    }
                    Ok(())
                });
            }

            let process = command.spawn().map_err(spawn_error)?;
            // Close our copies of the slave side
            drop(command);

            let writer = File::from(pty.master.try_clone()?);
            (process, writer, pty.master, None)
        } else {
            command
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());

            let mut process = command.spawn().map_err(spawn_error)?;
            let pipes = (process.stdin.take(), process.stdout.take(), process.stderr.take());
            match pipes {
                (Some(stdin), Some(stdout), Some(stderr)) => (
                    process,
                    File::from(OwnedFd::from(stdin)),
                    OwnedFd::from(stdout),
                    Some(OwnedFd::from(stderr)),
                ),
                _ => {
                    reap(&mut process);
                    return Err(ChildError::Io(io::Error::other("child stdio was not piped")));
                }
            }
        };

        let registered = register_stdio(stdin, stdout, stderr);
        let (stdin_fd, stdout_fd, stderr_fd) = match registered {
            Ok(fds) => fds,
            Err(e) => {
                reap(&mut process);
                return Err(e);
            }
        };

        let pid = Pid::from_raw(process.id() as i32);
        let stdout_queue = SharedQueue::new(options.queue_capacity);
        let stderr_queue = SharedQueue::new(options.queue_capacity);

        let mut handles: Vec<JoinHandle<()>> = vec![tokio::spawn(pump(
            stdout_fd,
            stdout_queue.clone(),
            ChildEventKind::Output,
            origin,
            events.clone(),
        ))];
        if let Some(fd) = stderr_fd {
            handles.push(tokio::spawn(pump(
                fd,
                stderr_queue.clone(),
                ChildEventKind::Error,
                origin,
                events.clone(),
            )));
        }
        let mut tasks: Vec<AbortHandle> = handles.iter().map(JoinHandle::abort_handle).collect();

        let (input, input_rx) = mpsc::unbounded_channel();
        let input_pending = Arc::new(AtomicUsize::new(0));
        let feeder = tokio::spawn(feed_input(stdin_fd, input_rx, input_pending.clone(), origin));
        tasks.push(feeder.abort_handle());

        let exit = Arc::new(ExitState::default());
        tokio::spawn(watch_exit(process, sigchld, handles, exit.clone(), origin, events));

        debug!("Spawned {} as pid {} (pty: {})", program, pid, options.pty);

        Ok(Self {
            pid,
            origin,
            input: Some(input),
            input_pending,
            input_capacity: options.queue_capacity,
            stdout: stdout_queue,
            stderr: stderr_queue,
            exit,
            tasks,
            destroyed: false,
        })
    }

    /// OS process id
    pub fn pid(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    /// Pipe this child backs
    pub fn origin(&self) -> PipeOrigin {
        self.origin
    }

    /// Current process status
    pub fn status(&self) -> ChildStatus {
        if self.exit.dead.load(Ordering::Acquire) {
            ChildStatus::Dead
        } else {
            ChildStatus::Running
        }
    }

    /// Exit code once the process is dead
    pub fn exit_code(&self) -> Option<i32> {
        match self.status() {
            ChildStatus::Dead => Some(self.exit.code.load(Ordering::Acquire)),
            ChildStatus::Running => None,
        }
    }

    /// Bytes buffered across both output queues
    pub fn pending(&self) -> usize {
        self.stdout.len() + self.stderr.len()
    }

    /// Drain buffered output into `buf`, stdout first then stderr
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, ChildError> {
        if self.destroyed {
            return Err(ChildError::Closed);
        }
        let mut n = self.stdout.pop_into(buf);
        n += self.stderr.pop_into(&mut buf[n..]);
        Ok(n)
    }

    /// Queue `buf` for the child's input and return how many bytes were
    /// accepted.
    ///
    /// The input task writes queued bytes as the descriptor becomes
    /// writable. Only what fits in the free input space is accepted; a full
    /// queue accepts nothing. Fails once the input task gave up.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize, ChildError> {
        let input = self.input.as_ref().ok_or(ChildError::Closed)?;
        let pending = self.input_pending.load(Ordering::Acquire);
        let n = buf.len().min(self.input_capacity.saturating_sub(pending));
        if n == 0 {
            return Ok(0);
        }

        self.input_pending.fetch_add(n, Ordering::AcqRel);
        if input.send(Bytes::copy_from_slice(&buf[..n])).is_err() {
            self.input_pending.fetch_sub(n, Ordering::AcqRel);
            return Err(WriteError {
                written: 0,
                source: io::ErrorKind::BrokenPipe.into(),
            }
            .into());
        }
        Ok(n)
    }

    /// Input bytes accepted but not yet written to the child
    pub fn input_pending(&self) -> usize {
        self.input_pending.load(Ordering::Acquire)
    }

    /// Send `SIGKILL`; exit is reported later through the event channel
    pub fn kill(&self) -> Result<(), ChildError> {
        if self.status() == ChildStatus::Dead {
            return Ok(());
        }
        match signal::kill(self.pid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(ChildError::Io(e.into())),
        }
    }

    /// Kill if still running, stop the I/O tasks, close descriptors and free
    /// the queues. Safe to call repeatedly.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;

        if let Err(e) = self.kill() {
            warn!("Failed to kill child {}: {}", self.pid, e);
        }
        for task in &self.tasks {
            task.abort();
        }
        self.tasks.clear();
        self.input = None;
        self.stdout.clear();
        self.stderr.clear();
        debug!("Destroyed child {}", self.pid);
    }
}

impl Drop for Child {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Write all of `buf`, retrying interrupted calls and resuming after partial
/// writes. `wait_writable` is invoked whenever the writer would block and
/// must return an error to give up.
pub fn write_retrying<W, F>(writer: &mut W, buf: &[u8], mut wait_writable: F) -> Result<usize, WriteError>
where
    W: Write,
    F: FnMut() -> io::Result<()>,
{
    let mut written = 0;
    while written < buf.len() {
        match writer.write(&buf[written..]) {
            Ok(0) => {
                return Err(WriteError {
                    written,
                    source: io::ErrorKind::WriteZero.into(),
                });
            }
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if let Err(source) = wait_writable() {
                    return Err(WriteError { written, source });
                }
            }
            Err(source) => return Err(WriteError { written, source }),
        }
    }
    Ok(written)
}

/// Write all of `data` to a non-blocking descriptor, parking on the reactor
/// whenever it would block
pub async fn write_when_ready(fd: &AsyncFd<File>, data: &[u8]) -> Result<usize, WriteError> {
    let mut written = 0;
    while written < data.len() {
        let mut guard = fd
            .writable()
            .await
            .map_err(|source| WriteError { written, source })?;
        let mut file: &File = guard.get_inner();
        match write_retrying(&mut file, &data[written..], would_block) {
            Ok(n) => written += n,
            Err(e) if e.source.kind() == io::ErrorKind::WouldBlock => {
                written += e.written;
                guard.clear_ready();
            }
            Err(e) => {
                return Err(WriteError {
                    written: written + e.written,
                    source: e.source,
                });
            }
        }
    }
    Ok(written)
}

fn would_block() -> io::Result<()> {
    Err(io::ErrorKind::WouldBlock.into())
}

fn set_nonblocking(fd: &impl AsRawFd) -> Result<(), ChildError> {
    let flags = OFlag::from_bits_truncate(fcntl(fd.as_raw_fd(), FcntlArg::F_GETFL)?);
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

type StdioFds = (AsyncFd<File>, AsyncFd<File>, Option<AsyncFd<File>>);

fn register_fd(fd: OwnedFd) -> Result<AsyncFd<File>, ChildError> {
    set_nonblocking(&fd)?;
    // SAFETY: the File owns the descriptor for as long as the AsyncFd lives
    let registered = unsafe { AsyncFd::register(File::from(fd)) }.map_err(io::Error::from)?;
    Ok(registered)
}

fn register_stdio(
    stdin: File,
    stdout: OwnedFd,
    stderr: Option<OwnedFd>,
) -> Result<StdioFds, ChildError> {
    let stdin = register_fd(OwnedFd::from(stdin))?;
    let stdout = register_fd(stdout)?;
    let stderr = stderr.map(register_fd).transpose()?;
    Ok((stdin, stdout, stderr))
}

fn reap(process: &mut std::process::Child) {
    if let Err(e) = process.kill() {
        debug!("Kill during failed spawn: {}", e);
    }
    if let Err(e) = process.wait() {
        debug!("Wait during failed spawn: {}", e);
    }
}

async fn pump(
    fd: AsyncFd<File>,
    queue: SharedQueue,
    kind: ChildEventKind,
    origin: PipeOrigin,
    events: EventSender,
) {
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        queue.wait_for_space().await;

        let mut guard = match fd.readable().await {
            Ok(guard) => guard,
            Err(e) => {
                warn!("Readiness wait failed for {:?}: {}", origin, e);
                return;
            }
        };

        let mut pulled = 0;
        let mut eof = false;
        loop {
            let room = queue.remaining().min(chunk.len());
            if room == 0 {
                break;
            }
            let mut file: &File = guard.get_inner();
            match file.read(&mut chunk[..room]) {
                Ok(0) => {
                    eof = true;
                    break;
                }
                Ok(n) => {
                    queue.push(&chunk[..n]);
                    pulled += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    guard.clear_ready();
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                // pty master reports EIO once the slave side is gone
                Err(e) if e.raw_os_error() == Some(libc::EIO) => {
                    eof = true;
                    break;
                }
                Err(e) => {
                    warn!("Read failed for {:?}: {}", origin, e);
                    eof = true;
                    break;
                }
            }
        }

        if pulled > 0 && events.send(Event::Child(ChildEvent { origin, kind })).is_err() {
            return;
        }
        if eof {
            return;
        }
    }
}

async fn feed_input(
    fd: AsyncFd<File>,
    mut input: mpsc::UnboundedReceiver<Bytes>,
    pending: Arc<AtomicUsize>,
    origin: PipeOrigin,
) {
    while let Some(data) = input.recv().await {
        let result = write_when_ready(&fd, &data).await;
        pending.fetch_sub(data.len(), Ordering::AcqRel);
        if let Err(e) = result {
            warn!("Input of {:?} failed: {}", origin, e);
            return;
        }
    }
}

async fn watch_exit(
    mut process: std::process::Child,
    mut sigchld: SignalStream,
    mut readers: Vec<JoinHandle<()>>,
    exit: Arc<ExitState>,
    origin: PipeOrigin,
    events: EventSender,
) {
    let code = loop {
        match process.try_wait() {
            Ok(Some(status)) => break status.code().unwrap_or(-1),
            Ok(None) => {}
            Err(e) => {
                warn!("Failed to poll child {}: {}", process.id(), e);
                break -1;
            }
        }
        // SIGCHLD is shared by every child, so re-check on each delivery
        let _ = tokio::time::timeout(EXIT_POLL_INTERVAL, sigchld.recv()).await;
    };

    // The pid is reaped now and may be reused, so never signal it again
    exit.code.store(code, Ordering::Release);
    exit.dead.store(true, Ordering::Release);
    debug!("Child {} exited with {}", process.id(), code);

    // Exit is reported after the output still in flight
    let drain = futures::future::join_all(readers.iter_mut());
    if tokio::time::timeout(EXIT_DRAIN_GRACE, drain).await.is_err() {
        debug!("Output of {:?} still open after exit, stopping readers", origin);
    }
    for reader in &readers {
        reader.abort();
    }

    let _ = events.send(Event::Child(ChildEvent {
        origin,
        kind: ChildEventKind::Exit(code),
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{self, EventReceiver};
    use tether_proto::{Scope, Tag};

    const ORIGIN: PipeOrigin = PipeOrigin {
        session: 1,
        pipe_type: Tag::new(Scope::Static, 3, 1),
        pipe_id: 1,
    };

    fn sh(script: &str) -> ChildOptions {
        ChildOptions {
            args: vec!["-c".to_string(), script.to_string()],
            ..Default::default()
        }
    }

    async fn events_until_exit(rx: &mut EventReceiver) -> Vec<ChildEventKind> {
        let mut kinds = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("child did not exit in time")
                .expect("event channel closed");
            if let Event::Child(ChildEvent { kind, .. }) = event {
                kinds.push(kind);
                if matches!(kind, ChildEventKind::Exit(_)) {
                    return kinds;
                }
            }
        }
    }

    #[tokio::test]
    async fn test_ten_bytes_fire_one_output_event() {
        let (tx, mut rx) = event::channel();
        let mut child = Child::spawn("sh", sh("printf 0123456789"), ORIGIN, tx).unwrap();

        let kinds = events_until_exit(&mut rx).await;
        assert_eq!(
            kinds,
            vec![ChildEventKind::Output, ChildEventKind::Exit(0)]
        );

        let mut buf = [0u8; 64];
        let n = child.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"0123456789");
        assert_eq!(child.status(), ChildStatus::Dead);
        assert_eq!(child.exit_code(), Some(0));
    }

    #[tokio::test]
    async fn test_read_drains_stdout_before_stderr() {
        let (tx, mut rx) = event::channel();
        let mut child = Child::spawn("sh", sh("printf err >&2; printf out; exit 3"), ORIGIN, tx).unwrap();

        let kinds = events_until_exit(&mut rx).await;
        assert!(kinds.contains(&ChildEventKind::Output));
        assert!(kinds.contains(&ChildEventKind::Error));
        assert_eq!(kinds.last(), Some(&ChildEventKind::Exit(3)));

        let mut buf = [0u8; 64];
        let n = child.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"outerr");
    }

    #[tokio::test]
    async fn test_write_then_kill() {
        let (tx, mut rx) = event::channel();
        let mut child = Child::spawn("cat", ChildOptions::default(), ORIGIN, tx).unwrap();

        assert_eq!(child.write(b"hello\n").unwrap(), 6);
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            event,
            Event::Child(ChildEvent { kind: ChildEventKind::Output, .. })
        ));

        let mut buf = [0u8; 16];
        let n = child.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello\n");

        child.kill().unwrap();
        let kinds = events_until_exit(&mut rx).await;
        assert_eq!(kinds.last(), Some(&ChildEventKind::Exit(-1)));

        // Safe after kill and after exit
        child.kill().unwrap();
        child.destroy();
        child.destroy();
        assert!(matches!(child.read(&mut buf), Err(ChildError::Closed)));
        assert!(matches!(child.write(b"x"), Err(ChildError::Closed)));
    }

    #[tokio::test]
    async fn test_large_write_is_echoed_in_full() {
        let (tx, mut rx) = event::channel();
        let mut child = Child::spawn("cat", ChildOptions::default(), ORIGIN, tx).unwrap();

        let payload = vec![b'x'; 1024 * 1024];
        assert_eq!(child.write(&payload).unwrap(), payload.len());

        let mut echoed = 0;
        let mut buf = vec![0u8; 64 * 1024];
        while echoed < payload.len() {
            tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("echo stalled")
                .expect("event channel closed");
            loop {
                let n = child.read(&mut buf).unwrap();
                if n == 0 {
                    break;
                }
                echoed += n;
            }
        }
        assert_eq!(echoed, payload.len());
        assert_eq!(child.input_pending(), 0);
    }

    #[tokio::test]
    async fn test_write_is_bounded_by_input_capacity() {
        let (tx, _rx) = event::channel();
        let options = ChildOptions {
            queue_capacity: 4,
            ..sh("exec sleep 5")
        };
        let mut child = Child::spawn("sh", options, ORIGIN, tx).unwrap();

        // Nothing is written before the input task gets to run
        assert_eq!(child.write(b"abcdefgh").unwrap(), 4);
        assert_eq!(child.write(b"ijkl").unwrap(), 0);
        assert_eq!(child.input_pending(), 4);

        tokio::time::timeout(Duration::from_secs(5), async {
            while child.input_pending() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("input never drained");
        assert_eq!(child.write(b"ijkl").unwrap(), 4);
    }

    #[tokio::test]
    async fn test_status_dead_as_soon_as_reaped() {
        let (tx, mut rx) = event::channel();
        // The background sleep keeps stdout open after the shell exits
        let child = Child::spawn("sh", sh("sleep 3 & exit 0"), ORIGIN, tx).unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while child.status() == ChildStatus::Running {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("exit not observed");
        assert_eq!(child.exit_code(), Some(0));

        // Exit is held back while the readers drain
        assert!(!matches!(
            rx.try_recv(),
            Ok(Event::Child(ChildEvent {
                kind: ChildEventKind::Exit(_),
                ..
            }))
        ));
        child.kill().unwrap();

        let kinds = events_until_exit(&mut rx).await;
        assert_eq!(kinds.last(), Some(&ChildEventKind::Exit(0)));
    }

    #[tokio::test]
    async fn test_pty_child_has_terminal() {
        let (tx, mut rx) = event::channel();
        let options = ChildOptions {
            pty: true,
            ..sh("tty")
        };
        let mut child = Child::spawn("sh", options, ORIGIN, tx).unwrap();

        let kinds = events_until_exit(&mut rx).await;
        assert!(!kinds.contains(&ChildEventKind::Error));

        let mut buf = [0u8; 128];
        let n = child.read(&mut buf).unwrap();
        let output = String::from_utf8_lossy(&buf[..n]);
        assert!(output.contains("/dev/"), "unexpected tty output: {:?}", output);
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let (tx, _rx) = event::channel();
        let result = Child::spawn("/nonexistent/tether-test", ChildOptions::default(), ORIGIN, tx);
        assert!(matches!(result, Err(ChildError::Spawn { .. })));
    }

    /// Writer that interrupts every other call and accepts short chunks
    struct FlakyWriter {
        data: Vec<u8>,
        calls: usize,
        max_chunk: usize,
        fail_after: Option<usize>,
        would_block_once: bool,
    }

    impl FlakyWriter {
        fn new(max_chunk: usize) -> Self {
            Self {
                data: Vec::new(),
                calls: 0,
                max_chunk,
                fail_after: None,
                would_block_once: false,
            }
        }
    }

    impl Write for FlakyWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.calls += 1;
            if self.calls % 2 == 1 {
                return Err(io::ErrorKind::Interrupted.into());
            }
            if self.would_block_once {
                self.would_block_once = false;
                return Err(io::ErrorKind::WouldBlock.into());
            }
            if let Some(limit) = self.fail_after {
                if self.data.len() >= limit {
                    return Err(io::ErrorKind::BrokenPipe.into());
                }
            }
            let n = buf.len().min(self.max_chunk);
            self.data.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_write_retries_interrupts_and_partial_writes() {
        let mut writer = FlakyWriter::new(3);
        let payload = b"interrupted but complete";

        let written = write_retrying(&mut writer, payload, || Ok(())).unwrap();
        assert_eq!(written, payload.len());
        assert_eq!(writer.data, payload);
    }

    #[test]
    fn test_write_waits_when_blocked() {
        let mut writer = FlakyWriter::new(64);
        writer.would_block_once = true;
        let mut waits = 0;

        let written = write_retrying(&mut writer, b"abc", || {
            waits += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(written, 3);
        assert_eq!(waits, 1);
    }

    #[test]
    fn test_fatal_write_reports_partial_count() {
        let mut writer = FlakyWriter::new(2);
        writer.fail_after = Some(4);

        let error = write_retrying(&mut writer, b"abcdefgh", || Ok(())).unwrap_err();
        assert_eq!(error.written, 4);
        assert_eq!(error.source.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn test_stalled_writer_gives_up() {
        let mut writer = FlakyWriter::new(8);
        writer.would_block_once = true;

        let error = write_retrying(&mut writer, b"abc", || {
            Err(io::Error::new(io::ErrorKind::TimedOut, "stalled"))
        })
        .unwrap_err();
        assert_eq!(error.written, 0);
        assert_eq!(error.source.kind(), io::ErrorKind::TimedOut);
    }
}
