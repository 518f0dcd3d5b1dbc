//! # Tether Agent
//!
//! Runtime core of the remote agent: call dispatch, pipes, child processes,
//! sessions over pluggable tunnels and a single-threaded reactor.

#![warn(missing_docs)]

/// Runtime, pipe and child process errors
pub mod error;

/// Bounded byte queues
pub mod queue;

/// Reactor events
pub mod event;

/// Child process manager
pub mod child;

/// Pipe registry and contract
pub mod pipe;

/// Call registry and dispatch
pub mod calls;

/// Sessions and their crypto state
pub mod session;

/// Tunnels and transports
pub mod tunnel;

/// Worker-pool bridge
pub mod worker;

/// Runtime configuration
pub mod config;

/// Core runtime and reactor loop
pub mod runtime;

/// Built-in API modules
pub mod api;

pub use calls::{CallContext, CallRegistry, Handler, Reply, ResultCode};
pub use config::CoreConfig;
pub use runtime::Core;
pub use error::{AgentError, ChildError, PipeError, WriteError};
pub use pipe::{PipeBackend, PipeFactory, PipeRegistry, PipeRequest};
pub use session::{Session, SessionId, SessionState};
pub use tunnel::{Transport, Tunnel, TunnelTable};
