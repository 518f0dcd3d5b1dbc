//! Worker-pool bridge for blocking operations
//!
//! Jobs run on the blocking pool. Each completion is queued and the reactor
//! is woken through a single [`Notify`]; the reactor drains at most
//! [`POLL_BUDGET`] completions per wake and re-arms the wake itself while
//! more remain.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tether_proto::{ErrorCode, ErrorDetails, Tag};
use tokio::sync::Notify;
use tracing::error;

use crate::calls::Reply;
use crate::session::SessionId;

/// Completions handled per reactor wake
pub const POLL_BUDGET: usize = 16;

/// A finished job waiting to be applied to its session
#[derive(Debug)]
pub struct Completion {
    /// Session the reply belongs to
    pub session: SessionId,
    /// Tag of the request that started the job
    pub tag: Tag,
    /// Reply produced by the job
    pub reply: Reply,
}

#[derive(Default)]
struct Shared {
    done: Mutex<VecDeque<Completion>>,
    wake: Notify,
    in_flight: AtomicUsize,
}

/// Handle for submitting blocking jobs and collecting their replies
#[derive(Clone, Default)]
pub struct WorkerBridge {
    shared: Arc<Shared>,
}

impl WorkerBridge {
    /// Create an idle bridge
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `job` on the blocking pool. Must be called from within the runtime.
    pub fn submit<F>(&self, session: SessionId, tag: Tag, job: F)
    where
        F: FnOnce() -> Reply + Send + 'static,
    {
        self.shared.in_flight.fetch_add(1, Ordering::AcqRel);
        let shared = self.shared.clone();
        tokio::task::spawn_blocking(move || {
            let reply = panic::catch_unwind(AssertUnwindSafe(job)).unwrap_or_else(|_| {
                error!("Worker job for {:?} panicked", tag);
                Reply::fail(tag, ErrorDetails::new(ErrorCode::Internal, "worker job failed"))
            });
            shared
                .done
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push_back(Completion { session, tag, reply });
            shared.in_flight.fetch_sub(1, Ordering::AcqRel);
            shared.wake.notify_one();
        });
    }

    /// Wait until completions may be available
    pub async fn ready(&self) {
        self.shared.wake.notified().await;
    }

    /// Take up to [`POLL_BUDGET`] completions. Re-arms the wake when more
    /// are left so the reactor comes back for them.
    pub fn poll(&self) -> Vec<Completion> {
        let mut done = self.shared.done.lock().unwrap_or_else(PoisonError::into_inner);
        let n = done.len().min(POLL_BUDGET);
        let batch: Vec<Completion> = done.drain(..n).collect();
        if !done.is_empty() {
            self.shared.wake.notify_one();
        }
        batch
    }

    /// Jobs still running
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::Acquire)
    }

    /// Completions waiting to be polled
    pub fn queued(&self) -> usize {
        self.shared.done.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}
