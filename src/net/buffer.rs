//! Reusable scratch buffers.
//!
//! Template rendering and hand-built upgrade requests write into buffers
//! drawn from a shared pool. A `PooledBuffer` clears itself and returns to
//! the pool when dropped, so early returns release it too.

use std::io;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

/// Buffers that grew past this are dropped instead of pooled.
const MAX_RETAINED_CAPACITY: usize = 64 * 1024;

/// Maximum number of idle buffers kept.
const MAX_POOLED: usize = 256;

const INITIAL_CAPACITY: usize = 1024;

/// A pool of byte buffers shared across requests.
#[derive(Debug, Clone, Default)]
pub struct BufferPool {
    free: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take an empty buffer from the pool, allocating if none is idle.
    pub fn get(&self) -> PooledBuffer {
        let buf = self
            .free
            .lock()
            .ok()
            .and_then(|mut free| free.pop())
            .unwrap_or_else(|| Vec::with_capacity(INITIAL_CAPACITY));

        PooledBuffer {
            buf,
            pool: Arc::clone(&self.free),
        }
    }

    /// Number of idle buffers currently held.
    pub fn idle(&self) -> usize {
        self.free.lock().map(|free| free.len()).unwrap_or(0)
    }
}

/// RAII handle on a pooled buffer.
#[derive(Debug)]
pub struct PooledBuffer {
    buf: Vec<u8>,
    pool: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl PooledBuffer {
    /// The contents as UTF-8, replacing invalid sequences.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.buf).into_owned()
    }

    pub fn push_str(&mut self, s: &str) {
        self.buf.extend_from_slice(s.as_bytes());
    }
}

impl Deref for PooledBuffer {
    type Target = Vec<u8>;
    fn deref(&self) -> &Self::Target {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buf
    }
}

impl io::Write for PooledBuffer {
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
        if self.buf.capacity() > MAX_RETAINED_CAPACITY {
            return;
        }
        let mut buf = std::mem::take(&mut self.buf);
        buf.clear();
        if let Ok(mut free) = self.pool.lock() {
            if free.len() < MAX_POOLED {
                free.push(buf);
            }
        }
    }
}
