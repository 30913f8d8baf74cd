//! Pooled receive buffers.
//!
//! Inbound frame data and read buffers are checked out of a [`BufferPool`]
//! and travel as [`PooledBuffer`] guards. A guard has exactly one owner at a
//! time and returns its buffer to the pool when dropped, so every exit path
//! (completion, error, teardown) releases it exactly once.
//!
//! The pool tracks outstanding checkouts, which makes leaks observable:
//!
//! ```
//! use mh_stream::pool::BufferPool;
//!
//! let pool = BufferPool::new(1024, 4);
//! {
//!     let mut buf = pool.allocate();
//!     buf.extend_from_slice(b"frame");
//!     assert_eq!(pool.outstanding(), 1);
//! }
//! assert_eq!(pool.outstanding(), 0);
//! ```

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::BytesMut;

use crate::config::{DEFAULT_BUFFER_SIZE, DEFAULT_POOL_CAPACITY};

#[derive(Debug)]
struct Shared {
    free: Mutex<Vec<BytesMut>>,
    outstanding: AtomicUsize,
    buffer_size: usize,
    capacity: usize,
}

/// A shared pool of receive buffers.
///
/// Cloning is cheap and yields a handle to the same pool.
#[derive(Debug, Clone)]
pub struct BufferPool {
    shared: Arc<Shared>,
}

impl BufferPool {
    /// Create a pool handing out buffers of `buffer_size` bytes and keeping
    /// at most `capacity` idle buffers.
    pub fn new(buffer_size: usize, capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                free: Mutex::new(Vec::with_capacity(capacity)),
                outstanding: AtomicUsize::new(0),
                buffer_size,
                capacity,
            }),
        }
    }

    /// Check out an empty buffer.
    pub fn allocate(&self) -> PooledBuffer {
        let reused = self.free_list().pop();
        let buf = reused.unwrap_or_else(|| BytesMut::with_capacity(self.shared.buffer_size));
        self.shared.outstanding.fetch_add(1, Ordering::AcqRel);
        PooledBuffer {
            buf,
            pool: self.clone(),
        }
    }

    /// Number of buffers currently checked out.
    #[inline]
    pub fn outstanding(&self) -> usize {
        self.shared.outstanding.load(Ordering::Acquire)
    }

    /// Number of idle buffers ready for reuse.
    pub fn idle(&self) -> usize {
        self.free_list().len()
    }

    /// Size of freshly allocated buffers.
    #[inline]
    pub fn buffer_size(&self) -> usize {
        self.shared.buffer_size
    }

    fn release(&self, mut buf: BytesMut) {
        self.shared.outstanding.fetch_sub(1, Ordering::AcqRel);
        buf.clear();
        let mut free = self.free_list();
        if free.len() < self.shared.capacity {
            free.push(buf);
        }
    }

    fn free_list(&self) -> std::sync::MutexGuard<'_, Vec<BytesMut>> {
        // A poisoned free list is still a valid list of buffers.
        self.shared
            .free
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE, DEFAULT_POOL_CAPACITY)
    }
}

/// A checked-out buffer that returns to its pool on drop.
#[derive(Debug)]
pub struct PooledBuffer {
    buf: BytesMut,
    pool: BufferPool,
}

impl PooledBuffer {
    /// The pool this buffer returns to.
    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }
}

impl Deref for PooledBuffer {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.pool.release(std::mem::take(&mut self.buf));
    }
}
