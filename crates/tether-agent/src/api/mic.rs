//! Microphone capture pipes and audio playback
//!
//! Capture runs `arecord` as a managed child process; playback pipes raw
//! audio into `aplay` on the worker pool so the reactor never blocks on it.

use std::io::Write;
use std::process::{Command, Stdio};
use tether_proto::{ErrorCode, ErrorDetails, Packet, Scope, Tag};
use tracing::{debug, warn};

use super::{missing_field, string_list, MIC_BASE};
use crate::calls::{CallContext, CallRegistry, Reply};
use crate::child::{Child, ChildOptions};
use crate::config::CoreConfig;
use crate::error::PipeError;
use crate::pipe::{PipeBackend, PipeRegistry, PipeRequest};

/// Pipe type streaming raw microphone audio
pub const MIC_PIPE: Tag = Tag::new(Scope::Static, MIC_BASE, 1);
/// Play raw audio
pub const MIC_PLAY: Tag = Tag::new(Scope::Static, MIC_BASE, 1);
/// List capture devices
pub const MIC_LIST: Tag = Tag::new(Scope::Static, MIC_BASE, 2);

const PCM_LIST: &str = "/proc/asound/pcm";

/// Register the microphone pipe type and its calls
pub fn register(calls: &mut CallRegistry, pipes: &mut PipeRegistry, config: &CoreConfig) {
    let queue_capacity = config.queue_capacity;
    pipes.register_fn(MIC_PIPE, move |request: &PipeRequest<'_>| {
        MicPipe::spawn(request, queue_capacity)
    });
    calls.register_fn(MIC_PLAY, play);
    calls.register_fn(MIC_LIST, list);
}

/// Lines of an ALSA pcm listing that describe capture devices
pub fn parse_pcm_list(text: &str) -> Vec<String> {
    text.lines()
        .filter(|line| line.contains("capture"))
        .map(str::to_string)
        .collect()
}

fn list(_ctx: &mut CallContext<'_>, request: &Packet) -> Reply {
    match std::fs::read_to_string(PCM_LIST) {
        Ok(text) => Reply::success(string_list(request.tag(), parse_pcm_list(&text))),
        Err(e) => Reply::fail(
            request.tag(),
            ErrorDetails::new(ErrorCode::ResourceFailed, format!("{}: {}", PCM_LIST, e)),
        ),
    }
}

fn play(ctx: &mut CallContext<'_>, request: &Packet) -> Reply {
    let tag = request.tag();
    let Some(data) = request.get_bytes(0).cloned() else {
        return missing_field(tag, "audio data");
    };

    ctx.worker.submit(ctx.session.id(), tag, move || {
        let mut player = Command::new("aplay");
        player.arg("-q");
        match feed_player(player, &data) {
            Ok(()) => Reply::callback(Packet::success(tag)),
            Err(e) => {
                warn!("Playback failed: {}", e);
                Reply::fail(tag, &e)
            }
        }
    });
    Reply::silent()
}

/// Run `command`, write `data` to its stdin and wait for it to finish
pub fn feed_player(mut command: Command, data: &[u8]) -> Result<(), PipeError> {
    let mut process = command
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| PipeError::Resource(format!("player: {}", e)))?;

    let written = match process.stdin.take() {
        Some(mut stdin) => stdin.write_all(data),
        None => Ok(()),
    };
    let status = process.wait()?;
    if !status.success() {
        return Err(PipeError::Resource(format!("player exited with {}", status)));
    }
    written?;
    debug!("Played {} bytes", data.len());
    Ok(())
}

/// Raw 48 kHz stereo capture from one ALSA device
pub struct MicPipe {
    child: Child,
}

impl MicPipe {
    /// Start `arecord` on the device named by the first u32 parameter
    pub fn spawn(
        request: &PipeRequest<'_>,
        queue_capacity: usize,
    ) -> Result<Box<dyn PipeBackend>, PipeError> {
        let device = request
            .param_u32(0)
            .ok_or_else(|| PipeError::InvalidParams("missing device index".to_string()))?;
        let options = ChildOptions {
            args: vec![
                "-D".to_string(),
                format!("plughw:{}", device),
                "-q".to_string(),
                "-f".to_string(),
                "cd".to_string(),
                "-t".to_string(),
                "raw".to_string(),
                "-r".to_string(),
                "48000".to_string(),
                "-c".to_string(),
                "2".to_string(),
            ],
            queue_capacity,
            ..Default::default()
        };

        let child = Child::spawn("arecord", options, request.origin, request.events.clone())?;
        Ok(Box::new(Self { child }))
    }
}

impl PipeBackend for MicPipe {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, PipeError> {
        Ok(self.child.read(buf)?)
    }

    fn destroy(&mut self) -> Result<(), PipeError> {
        self.child.destroy();
        Ok(())
    }
}
