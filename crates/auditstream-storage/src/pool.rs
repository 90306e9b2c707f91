//! Reusable Byte Buffers
//!
//! Slices hold up to `min_upload_bytes + min_upload_bytes / 3` bytes each and
//! records are framed in a scratch buffer before compression. Both are recycled
//! through a `BufferPool` instead of being allocated per slice or per event.
//!
//! ```text
//!   BufferPool::get() ──► PooledBuffer ──► (slice / record framing)
//!         ▲                                        │
//!         └──────────── Drop: clear + return ◄─────┘
//! ```
//!
//! A `PooledBuffer` goes back to its pool exactly once, when it is dropped.
//! Whoever owns the buffer owns the release, so a slice that moves into an
//! upload task takes its buffer along and returns it when the task ends.

use std::fmt;
use std::io::{self, Write};
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

/// Default number of idle buffers kept per pool.
pub const DEFAULT_MAX_IDLE_BUFFERS: usize = 16;

/// Shared pool of byte buffers with a fixed initial capacity.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    buffers: Mutex<Vec<Vec<u8>>>,
    capacity: usize,
    max_idle: usize,
}

impl BufferPool {
    /// Create a pool handing out buffers of `capacity` bytes, keeping at most
    /// `max_idle` returned buffers around.
    pub fn new(capacity: usize, max_idle: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                buffers: Mutex::new(Vec::new()),
                capacity,
                max_idle,
            }),
        }
    }

    /// Take an empty buffer from the pool, allocating if none is idle.
    pub fn get(&self) -> PooledBuffer {
        let buf = self
            .inner
            .lock()
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.inner.capacity));
        PooledBuffer {
            buf,
            pool: Some(self.inner.clone()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Number of buffers currently idle in the pool.
    pub fn idle(&self) -> usize {
        self.inner.lock().len()
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("capacity", &self.inner.capacity)
            .field("max_idle", &self.inner.max_idle)
            .field("idle", &self.idle())
            .finish()
    }
}

impl PoolInner {
    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Vec<u8>>> {
        self.buffers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn release(&self, mut buf: Vec<u8>) {
        buf.clear();
        // Buffers that shrank below the pool size are not worth keeping
        if buf.capacity() < self.capacity {
            return;
        }
        let mut idle = self.lock();
        if idle.len() < self.max_idle {
            idle.push(buf);
        }
    }
}

/// A buffer checked out of a `BufferPool`.
pub struct PooledBuffer {
    buf: Vec<u8>,
    pool: Option<Arc<PoolInner>>,
}

impl PooledBuffer {
    /// A buffer that is not tied to any pool.
    pub fn detached(buf: Vec<u8>) -> Self {
        Self { buf, pool: None }
    }

    pub fn as_vec(&self) -> &Vec<u8> {
        &self.buf
    }

    pub fn as_mut_vec(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }
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

impl Write for PooledBuffer {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.release(std::mem::take(&mut self.buf));
        }
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.buf.len())
            .field("capacity", &self.buf.capacity())
            .field("pooled", &self.pool.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_returns_to_pool_on_drop() {
        let pool = BufferPool::new(128, 4);
        assert_eq!(pool.idle(), 0);

        let mut buf = pool.get();
        buf.write_all(b"hello").unwrap();
        assert_eq!(&buf[..], b"hello");
        drop(buf);

        assert_eq!(pool.idle(), 1);
        let buf = pool.get();
        assert!(buf.is_empty(), "returned buffers must be reset");
        assert!(buf.as_vec().capacity() >= 128);
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn test_max_idle_is_respected() {
        let pool = BufferPool::new(16, 2);
        let buffers: Vec<_> = (0..5).map(|_| pool.get()).collect();
        drop(buffers);
        assert_eq!(pool.idle(), 2);
    }

    #[test]
    fn test_shrunk_buffers_are_discarded() {
        let pool = BufferPool::new(64, 4);
        let mut buf = pool.get();
        buf.as_mut_vec().shrink_to(0);
        drop(buf);
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn test_detached_buffer() {
        let buf = PooledBuffer::detached(vec![1, 2, 3]);
        assert_eq!(&buf[..], &[1, 2, 3]);
    }

    #[test]
    fn test_pool_shared_across_threads() {
        let pool = BufferPool::new(32, 8);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    let mut buf = pool.get();
                    buf.write_all(&[7u8; 10]).unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(pool.idle() >= 1 && pool.idle() <= 4);
    }
}
