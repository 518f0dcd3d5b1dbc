//! Bounded byte queues shared between fd readers and pipe consumers

use bytes::{Buf, Bytes, BytesMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

/// Default capacity of a child output queue (1MB)
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024 * 1024;

/// A FIFO byte buffer that never grows past its capacity
#[derive(Debug)]
pub struct ByteQueue {
    buf: BytesMut,
    capacity: usize,
}

impl ByteQueue {
    /// Create an empty queue
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            capacity,
        }
    }

    /// Bytes currently buffered
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing is buffered
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Free space left
    pub fn remaining(&self) -> usize {
        self.capacity.saturating_sub(self.buf.len())
    }

    /// Whether no more bytes fit
    pub fn is_full(&self) -> bool {
        self.remaining() == 0
    }

    /// Append as much of `data` as fits and return the count accepted
    pub fn push(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.remaining());
        self.buf.extend_from_slice(&data[..n]);
        n
    }

    /// Move up to `out.len()` bytes into `out`
    pub fn pop_into(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.buf.len());
        self.buf.copy_to_slice(&mut out[..n]);
        n
    }

    /// Take everything buffered
    pub fn take_all(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    /// Drop everything buffered and release the allocation
    pub fn clear(&mut self) {
        self.buf = BytesMut::new();
    }
}

#[derive(Debug)]
struct Shared {
    queue: Mutex<ByteQueue>,
    space: Notify,
}

/// A [`ByteQueue`] shared by one producer task and one consumer.
///
/// The producer parks on [`SharedQueue::wait_for_space`] while the queue is
/// full; every consumer pop wakes it.
#[derive(Debug, Clone)]
pub struct SharedQueue {
    shared: Arc<Shared>,
}

impl SharedQueue {
    /// Create an empty shared queue
    pub fn new(capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(ByteQueue::new(capacity)),
                space: Notify::new(),
            }),
        }
    }

    /// Lock the queue
    pub fn lock(&self) -> MutexGuard<'_, ByteQueue> {
        self.shared
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Append as much of `data` as fits
    pub fn push(&self, data: &[u8]) -> usize {
        self.lock().push(data)
    }

    /// Move buffered bytes into `out`, waking a parked producer
    pub fn pop_into(&self, out: &mut [u8]) -> usize {
        let n = self.lock().pop_into(out);
        if n > 0 {
            self.shared.space.notify_one();
        }
        n
    }

    /// Take everything buffered, waking a parked producer
    pub fn take_all(&self) -> Bytes {
        let data = self.lock().take_all();
        self.shared.space.notify_one();
        data
    }

    /// Bytes currently buffered
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether nothing is buffered
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Free space left
    pub fn remaining(&self) -> usize {
        self.lock().remaining()
    }

    /// Release the buffer
    pub fn clear(&self) {
        self.lock().clear();
        self.shared.space.notify_one();
    }

    /// Wait until at least one byte fits
    pub async fn wait_for_space(&self) {
        loop {
            let notified = self.shared.space.notified();
            if self.remaining() > 0 {
                return;
            }
            notified.await;
        }
    }
}
