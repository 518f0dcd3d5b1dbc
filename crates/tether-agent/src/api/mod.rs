//! Built-in API modules
//!
//! Each module owns a base in the tag space and registers its calls and
//! pipe types with the runtime registries.

pub mod builtins;
pub mod cam;
pub mod mic;
pub mod pipes;
pub mod process;

use tether_proto::{ErrorCode, ErrorDetails, Packet, Tag};

use crate::calls::{CallRegistry, Reply};
use crate::config::CoreConfig;
use crate::pipe::PipeRegistry;

/// Core module: quit, identity, keep-alive, tunnels
pub const CORE_BASE: u16 = 1;
/// Generic pipe operations
pub const PIPE_BASE: u16 = 2;
/// Child processes
pub const PROCESS_BASE: u16 = 3;
/// Camera capture
pub const CAM_BASE: u16 = 5;
/// Microphone capture and playback
pub const MIC_BASE: u16 = 6;

/// Register every built-in call and pipe type
pub fn register_builtins(calls: &mut CallRegistry, pipes: &mut PipeRegistry, config: &CoreConfig) {
    builtins::register(calls);
    pipes::register(calls);
    process::register(calls, pipes, config);
    cam::register(calls, pipes);
    mic::register(calls, pipes, config);
}

/// Reply with `Fail`/`InvalidRequest` when a required field is missing
pub(crate) fn missing_field(tag: Tag, what: &str) -> Reply {
    Reply::fail(
        tag,
        ErrorDetails::new(ErrorCode::InvalidRequest, format!("missing {}", what)),
    )
}

/// Success response carrying one string per entry
pub(crate) fn string_list(tag: Tag, entries: impl IntoIterator<Item = String>) -> Packet {
    entries
        .into_iter()
        .fold(Packet::success(tag), |packet, entry| packet.with_string(entry))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_registered() {
        let mut calls = CallRegistry::new();
        let mut pipes = PipeRegistry::new();
        register_builtins(&mut calls, &mut pipes, &CoreConfig::default());

        for tag in [
            builtins::CORE_QUIT,
            builtins::CORE_IDENTITY,
            builtins::CORE_KEEP_ALIVE,
            builtins::CORE_ADD_TUNNEL,
            pipes::PIPE_CREATE,
            pipes::PIPE_READ,
            pipes::PIPE_READALL,
            pipes::PIPE_WRITE,
            pipes::PIPE_DESTROY,
            process::PROCESS_KILL,
            cam::CAM_LIST,
            mic::MIC_PLAY,
            mic::MIC_LIST,
        ] {
            assert!(calls.contains(tag), "{:?} missing", tag);
        }
        for tag in [process::PROCESS_PIPE, cam::CAM_PIPE, mic::MIC_PIPE] {
            assert!(pipes.contains(tag), "{:?} missing", tag);
        }
    }

    #[test]
    fn test_string_list() {
        let packet = string_list(builtins::CORE_IDENTITY, vec!["a".into(), "b".into()]);
        assert_eq!(packet.iter_str().collect::<Vec<_>>(), vec!["a", "b"]);
    }
}
