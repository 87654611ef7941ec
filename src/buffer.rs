//! Relay buffer pool.
//!
//! Each bridge direction checks out one fixed-size buffer for its whole copy
//! loop. The buffer goes back to the pool when the [`PooledBuffer`] guard is
//! dropped, whichever way the loop exits. The pool keeps at most
//! `max_idle` buffers around; anything returned past that bound is freed.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Default relay buffer size (8 KiB).
pub const DEFAULT_BUFFER_SIZE: usize = 8 * 1024;

/// Default number of idle buffers kept by the pool.
pub const DEFAULT_MAX_IDLE_BUFFERS: usize = 1024;

/// Pool of equally sized byte buffers shared by all connections.
#[derive(Debug)]
pub struct BufferPool {
    buffer_size: usize,
    max_idle: usize,
    idle: Mutex<Vec<Box<[u8]>>>,
    /// Buffers allocated over the lifetime of the pool.
    allocated: AtomicUsize,
}

impl BufferPool {
    /// Create a pool handing out buffers of `buffer_size` bytes.
    pub fn new(buffer_size: usize, max_idle: usize) -> Arc<Self> {
        Arc::new(Self {
            buffer_size,
            max_idle,
            idle: Mutex::new(Vec::new()),
            allocated: AtomicUsize::new(0),
        })
    }

    /// Size of every buffer handed out by this pool.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Take a buffer from the pool, allocating one if none is idle.
    pub fn checkout(self: &Arc<Self>) -> PooledBuffer {
        let reused = self.idle.lock().pop();
        let buf = reused.unwrap_or_else(|| {
            self.allocated.fetch_add(1, Ordering::Relaxed);
            vec![0u8; self.buffer_size].into_boxed_slice()
        });

        PooledBuffer {
            buf,
            pool: Arc::clone(self),
        }
    }

    /// Number of buffers currently waiting in the pool.
    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    /// Number of buffers allocated since the pool was created.
    pub fn allocated_count(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    fn give_back(&self, buf: Box<[u8]>) {
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(buf);
        }
    }
}

/// A buffer checked out of a [`BufferPool`].
///
/// Dereferences to the full fixed-size byte slice.
#[derive(Debug)]
pub struct PooledBuffer {
    buf: Box<[u8]>,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        self.pool.give_back(buf);
    }
}
