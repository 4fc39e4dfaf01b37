//! Reusable byte buffers for proxy I/O.
//!
//! Bounds per-connection allocation when relaying upgraded (e.g. WebSocket)
//! connections. Buffers go back on the shelf when the guard drops, on
//! success and error paths alike; the shelf itself is capped so idle memory
//! stays bounded.
use std::{
    ops::{Deref, DerefMut},
    sync::{Arc, Mutex},
};

const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;
const MAX_SHELVED: usize = 64;

/// Concurrency-safe pool of fixed-size byte buffers. Cloning shares the
/// underlying shelf.
#[derive(Debug, Clone)]
pub struct BufferPool {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    buffer_size: usize,
    shelf: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                buffer_size,
                shelf: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Take a buffer from the shelf, or allocate one if empty.
    pub fn get(&self) -> PooledBuffer {
        let buf = self
            .inner
            .shelf
            .lock()
            .expect("buffer pool lock poisoned")
            .pop()
            .unwrap_or_else(|| vec![0; self.inner.buffer_size]);
        PooledBuffer {
            pool: self.clone(),
            buf: Some(buf),
        }
    }

    fn put_back(&self, buf: Vec<u8>) {
        let mut shelf = self.inner.shelf.lock().expect("buffer pool lock poisoned");
        if shelf.len() < MAX_SHELVED {
            shelf.push(buf);
        }
    }

    #[cfg(test)]
    fn shelved(&self) -> usize {
        self.inner.shelf.lock().unwrap().len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE)
    }
}

/// A buffer checked out of the pool; returns itself on drop.
#[derive(Debug)]
pub struct PooledBuffer {
    pool: BufferPool,
    buf: Option<Vec<u8>>,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().expect("buffer present until drop")
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().expect("buffer present until drop")
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.put_back(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_return_on_drop() {
        let pool = BufferPool::new(8);
        assert_eq!(pool.shelved(), 0);
        {
            let _a = pool.get();
            let _b = pool.get();
            assert_eq!(pool.shelved(), 0);
        }
        assert_eq!(pool.shelved(), 2);

        // Reuse picks the shelved buffer back up.
        let _c = pool.get();
        assert_eq!(pool.shelved(), 1);
    }

    #[test]
    fn buffers_have_the_configured_size() {
        let pool = BufferPool::new(16);
        assert_eq!(pool.get().len(), 16);
    }

    #[test]
    fn buffers_return_even_when_dropped_mid_panic_unwind() {
        let pool = BufferPool::new(8);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _buf = pool.get();
            panic!("simulated error path");
        }));
        assert!(result.is_err());
        assert_eq!(pool.shelved(), 1);
    }

    #[test]
    fn shared_across_clones() {
        let pool = BufferPool::new(8);
        let other = pool.clone();
        drop(other.get());
        assert_eq!(pool.shelved(), 1);
    }
}
