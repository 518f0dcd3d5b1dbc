//! Camera capture pipes
//!
//! Frames come from an external `ffmpeg` process reading the V4L2 device and
//! writing MJPEG to stdout. A producer thread splits that stream on JPEG
//! markers and keeps only the latest complete frame in a [`FrameSlot`].

use bytes::Bytes;
use std::io::Read;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::process::{Child as Process, ChildStdout, Command, Stdio};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use tether_proto::{Packet, Scope, Tag};
use tracing::{debug, warn};

use super::{string_list, CAM_BASE};
use crate::calls::{CallContext, CallRegistry, Reply};
use crate::error::PipeError;
use crate::pipe::{PipeBackend, PipeRegistry, PipeRequest};

/// Pipe type streaming camera frames
pub const CAM_PIPE: Tag = Tag::new(Scope::Static, CAM_BASE, 1);
/// List capture devices
pub const CAM_LIST: Tag = Tag::new(Scope::Static, CAM_BASE, 1);

/// Device indices probed by [`CAM_LIST`]
pub const MAX_DEVICES: u32 = 10;
/// Longest `readall` waits for a frame
pub const FRAME_TIMEOUT: Duration = Duration::from_secs(1);

const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];
const JPEG_EOI: [u8; 2] = [0xFF, 0xD9];
const MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;
const CAPTURE_CHUNK: usize = 64 * 1024;

/// Register the camera pipe type and its calls
pub fn register(calls: &mut CallRegistry, pipes: &mut PipeRegistry) {
    pipes.register_fn(CAM_PIPE, create);
    calls.register_fn(CAM_LIST, list);
}

/// Path of video device `index`
pub fn device_path(index: u32) -> PathBuf {
    PathBuf::from(format!("/dev/video{}", index))
}

fn is_char_device(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.file_type().is_char_device())
        .unwrap_or(false)
}

/// Character devices named `video0`..`video9` under `dir`
pub fn list_devices(dir: &Path) -> Vec<String> {
    (0..MAX_DEVICES)
        .map(|i| dir.join(format!("video{}", i)))
        .filter(|path| is_char_device(path))
        .map(|path| path.display().to_string())
        .collect()
}

fn list(_ctx: &mut CallContext<'_>, request: &Packet) -> Reply {
    Reply::success(string_list(request.tag(), list_devices(Path::new("/dev"))))
}

fn create(request: &PipeRequest<'_>) -> Result<Box<dyn PipeBackend>, PipeError> {
    let index = request
        .param_u32(0)
        .ok_or_else(|| PipeError::InvalidParams("missing device index".to_string()))?;
    let device = device_path(index);
    if !is_char_device(&device) {
        return Err(PipeError::NotFound(device.display().to_string()));
    }

    let mut pipe = CamPipe::new();
    pipe.open(capture_command(&device))?;
    Ok(Box::new(pipe))
}

fn capture_command(device: &Path) -> Command {
    let mut command = Command::new("ffmpeg");
    command
        .args(["-loglevel", "quiet", "-f", "v4l2", "-i"])
        .arg(device)
        .args(["-f", "mjpeg", "-q:v", "5", "-"]);
    command
}

/// Latest complete frame, handed over by move
#[derive(Debug, Default)]
pub struct FrameSlot {
    frame: Mutex<Option<Bytes>>,
    ready: Condvar,
}

impl FrameSlot {
    /// Replace the stored frame
    pub fn publish(&self, frame: Bytes) {
        *self.frame.lock().unwrap_or_else(PoisonError::into_inner) = Some(frame);
        self.ready.notify_all();
    }

    /// Take the stored frame, waiting up to `timeout` for one to appear
    pub fn take_timeout(&self, timeout: Duration) -> Option<Bytes> {
        let guard = self.frame.lock().unwrap_or_else(PoisonError::into_inner);
        let (mut guard, _) = self
            .ready
            .wait_timeout_while(guard, timeout, |frame| frame.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        guard.take()
    }
}

/// Splits an MJPEG byte stream into whole JPEG images
#[derive(Debug, Default)]
pub struct FrameSplitter {
    buf: Vec<u8>,
}

fn find(haystack: &[u8], marker: [u8; 2]) -> Option<usize> {
    haystack.windows(2).position(|w| w == marker)
}

impl FrameSplitter {
    /// Feed stream bytes; returns every frame completed by them
    pub fn push(&mut self, data: &[u8]) -> Vec<Bytes> {
        self.buf.extend_from_slice(data);
        let mut frames = Vec::new();

        loop {
            let Some(start) = find(&self.buf, JPEG_SOI) else {
                // Keep a trailing 0xFF, it may begin the next marker
                let keep = usize::from(self.buf.last() == Some(&0xFF));
                self.buf.drain(..self.buf.len() - keep);
                break;
            };
            self.buf.drain(..start);

            match find(&self.buf[2..], JPEG_EOI) {
                Some(end) => {
                    let frame: Vec<u8> = self.buf.drain(..end + 4).collect();
                    frames.push(Bytes::from(frame));
                }
                None => {
                    if self.buf.len() > MAX_FRAME_SIZE {
                        warn!("Dropping oversized frame of {} bytes", self.buf.len());
                        self.buf.clear();
                    }
                    break;
                }
            }
        }
        frames
    }
}

fn produce(mut stdout: ChildStdout, slot: Arc<FrameSlot>) {
    let mut splitter = FrameSplitter::default();
    let mut chunk = vec![0u8; CAPTURE_CHUNK];
    loop {
        match stdout.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                if let Some(frame) = splitter.push(&chunk[..n]).pop() {
                    slot.publish(frame);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!("Capture stream failed: {}", e);
                break;
            }
        }
    }
    debug!("Frame producer finished");
}

/// A capture process and the thread reading it. Dropping it stops both.
struct Capture {
    process: Process,
    producer: Option<JoinHandle<()>>,
    slot: Arc<FrameSlot>,
}

impl Drop for Capture {
    fn drop(&mut self) {
        if let Err(e) = self.process.kill() {
            debug!("Capture process already gone: {}", e);
        }
        if let Err(e) = self.process.wait() {
            warn!("Failed to reap capture process: {}", e);
        }
        if let Some(producer) = self.producer.take() {
            if producer.join().is_err() {
                warn!("Frame producer panicked");
            }
        }
    }
}

enum CamState {
    Unopened,
    Open(Capture),
    Closed,
}

/// Camera pipe: `Unopened`, then `Open` while capturing, then `Closed`
pub struct CamPipe {
    state: CamState,
}

impl Default for CamPipe {
    fn default() -> Self {
        Self::new()
    }
}

impl CamPipe {
    /// A pipe that is not capturing yet
    pub fn new() -> Self {
        Self {
            state: CamState::Unopened,
        }
    }

    /// Start `command` as the frame source. Its stdout must carry MJPEG.
    pub fn open(&mut self, mut command: Command) -> Result<(), PipeError> {
        if !matches!(self.state, CamState::Unopened) {
            return Err(PipeError::Closed);
        }

        let mut process = command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| PipeError::Resource(format!("capture process: {}", e)))?;
        let stdout = process.stdout.take();

        let mut capture = Capture {
            process,
            producer: None,
            slot: Arc::new(FrameSlot::default()),
        };
        let stdout =
            stdout.ok_or_else(|| PipeError::Resource("capture process has no stdout".to_string()))?;
        let slot = capture.slot.clone();
        let producer = std::thread::Builder::new()
            .name("frame-producer".to_string())
            .spawn(move || produce(stdout, slot))
            .map_err(|e| PipeError::Resource(format!("frame producer: {}", e)))?;
        capture.producer = Some(producer);

        self.state = CamState::Open(capture);
        Ok(())
    }

    /// Whether capture is running
    pub fn is_open(&self) -> bool {
        matches!(self.state, CamState::Open(_))
    }
}

impl PipeBackend for CamPipe {
    fn readall(&mut self) -> Result<Bytes, PipeError> {
        match &self.state {
            CamState::Open(capture) => capture
                .slot
                .take_timeout(FRAME_TIMEOUT)
                .ok_or(PipeError::Timeout),
            CamState::Unopened => Err(PipeError::Resource("capture not started".to_string())),
            CamState::Closed => Err(PipeError::Closed),
        }
    }

    fn destroy(&mut self) -> Result<(), PipeError> {
        if let CamState::Open(capture) = std::mem::replace(&mut self.state, CamState::Closed) {
            drop(capture);
            debug!("Camera capture stopped");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::thread;
    use std::time::Instant;

    fn frame(body: &[u8]) -> Vec<u8> {
        [&JPEG_SOI[..], body, &JPEG_EOI[..]].concat()
    }

    #[test]
    fn test_splitter_finds_frames_across_chunks() {
        let mut splitter = FrameSplitter::default();
        let mut stream = b"junk".to_vec();
        stream.extend(frame(b"one"));
        stream.extend(frame(b"two"));

        let (head, tail) = stream.split_at(9);
        assert!(splitter.push(head).is_empty());
        let frames = splitter.push(tail);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].as_ref(), frame(b"one").as_slice());
        assert_eq!(frames[1].as_ref(), frame(b"two").as_slice());
    }

    #[test]
    fn test_splitter_marker_split_between_chunks() {
        let mut splitter = FrameSplitter::default();
        let data = frame(b"x");
        assert!(splitter.push(&[0x00, 0xFF]).is_empty());
        let frames = splitter.push(&data[1..]);
        assert_eq!(frames, vec![Bytes::from(data)]);
    }

    proptest! {
        #[test]
        fn test_splitter_chunking_properties(
            bodies in prop::collection::vec(prop::collection::vec(0u8..0xFF, 0..64), 1..5),
            cuts in prop::collection::vec(any::<prop::sample::Index>(), 0..8),
        ) {
            // Bodies avoid 0xFF so they never contain a marker
            let stream: Vec<u8> = bodies.iter().flat_map(|b| frame(b)).collect();
            let mut points: Vec<usize> = cuts.iter().map(|c| c.index(stream.len())).collect();
            points.sort_unstable();

            let mut splitter = FrameSplitter::default();
            let mut frames = Vec::new();
            let mut from = 0;
            for point in points.into_iter().chain([stream.len()]) {
                frames.extend(splitter.push(&stream[from..point]));
                from = point;
            }

            let expected: Vec<Bytes> = bodies.iter().map(|b| Bytes::from(frame(b))).collect();
            prop_assert_eq!(frames, expected);
        }
    }

    #[test]
    fn test_slot_hands_over_latest_frame() {
        let slot = Arc::new(FrameSlot::default());
        slot.publish(Bytes::from_static(b"old"));
        slot.publish(Bytes::from_static(b"new"));
        assert_eq!(slot.take_timeout(FRAME_TIMEOUT).unwrap(), "new");

        let start = Instant::now();
        assert!(slot.take_timeout(Duration::from_millis(50)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(50));

        let producer = {
            let slot = slot.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                slot.publish(Bytes::from_static(b"late"));
            })
        };
        assert_eq!(slot.take_timeout(FRAME_TIMEOUT).unwrap(), "late");
        producer.join().unwrap();
    }

    #[test]
    fn test_list_devices_skips_regular_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("video0"), b"").unwrap();
        assert!(list_devices(dir.path()).is_empty());
        assert!(is_char_device(Path::new("/dev/null")));
    }

    #[test]
    fn test_missing_device_is_not_found() {
        let (tx, _rx) = crate::event::channel();
        let params = Packet::new(CAM_PIPE).with_u32(MAX_DEVICES + 90);
        let request = PipeRequest {
            origin: crate::pipe::PipeOrigin {
                session: 1,
                pipe_type: CAM_PIPE,
                pipe_id: 1,
            },
            params: Some(&params),
            events: &tx,
        };
        assert!(matches!(create(&request), Err(PipeError::NotFound(_))));
    }

    #[test]
    fn test_capture_lifecycle() {
        let mut pipe = CamPipe::new();
        assert!(matches!(pipe.readall(), Err(PipeError::Resource(_))));

        let mut command = Command::new("sh");
        command.args(["-c", r"printf '\377\330img\377\331'; exec sleep 5"]);
        pipe.open(command).unwrap();
        assert!(pipe.is_open());

        let frame = pipe.readall().unwrap();
        assert_eq!(frame.as_ref(), b"\xff\xd8img\xff\xd9");
        assert!(matches!(pipe.readall(), Err(PipeError::Timeout)));

        pipe.destroy().unwrap();
        pipe.destroy().unwrap();
        assert!(matches!(pipe.readall(), Err(PipeError::Closed)));
    }
}
