//! Free-list object pools.
//!
//! Request processing reuses its per-message objects instead of allocating
//! them for every packet. A pooled object is owned by exactly one holder
//! between `acquire` and `release`; the pool only keeps objects nobody holds.

use parking_lot::Mutex;
use std::fmt;

/// Objects that can be returned to a pool.
pub trait Reset {
    /// Clear per-use state so the next holder starts fresh.
    fn reset(&mut self);
}

/// Mutex-guarded free list with a factory for misses.
pub struct ObjectPool<T> {
    free: Mutex<Vec<T>>,
    factory: Box<dyn Fn() -> T + Send + Sync>,
    max_idle: usize,
}

impl<T: Reset> ObjectPool<T> {
    /// Create a pool keeping at most `max_idle` released objects.
    pub fn new<F>(max_idle: usize, factory: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self {
            free: Mutex::new(Vec::new()),
            factory: Box::new(factory),
            max_idle,
        }
    }

    /// Take an object, constructing one if the free list is empty.
    pub fn acquire(&self) -> T {
        let pooled = self.free.lock().pop();
        pooled.unwrap_or_else(|| (self.factory)())
    }

    /// Reset `obj` and keep it for reuse, or drop it if the pool is full.
    pub fn release(&self, mut obj: T) {
        obj.reset();
        let mut free = self.free.lock();
        if free.len() < self.max_idle {
            free.push(obj);
        }
    }

    /// Number of idle objects.
    pub fn available(&self) -> usize {
        self.free.lock().len()
    }
}

impl<T> fmt::Debug for ObjectPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectPool")
            .field("idle", &self.free.lock().len())
            .field("max_idle", &self.max_idle)
            .finish()
    }
}

/// Pool of fixed-size read buffers.
///
/// Every acquired buffer has length `buffer_size`. Buffers that grew past
/// twice that size while in use are dropped on release.
pub struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
    buffer_size: usize,
    max_idle: usize,
}

impl BufferPool {
    pub fn new(buffer_size: usize, max_idle: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            buffer_size,
            max_idle,
        }
    }

    /// Create a pool with `count` buffers allocated up front.
    pub fn with_preallocated(buffer_size: usize, count: usize) -> Self {
        let buffers = (0..count).map(|_| vec![0u8; buffer_size]).collect();
        Self {
            free: Mutex::new(buffers),
            buffer_size,
            max_idle: count,
        }
    }

    /// Take a buffer of exactly `buffer_size` bytes.
    pub fn acquire(&self) -> Vec<u8> {
        let pooled = self.free.lock().pop();
        pooled.unwrap_or_else(|| vec![0u8; self.buffer_size])
    }

    /// Return a buffer to the pool.
    pub fn release(&self, mut buf: Vec<u8>) {
        if buf.capacity() > self.buffer_size * 2 {
            return;
        }
        buf.clear();
        buf.resize(self.buffer_size, 0);

        let mut free = self.free.lock();
        if free.len() < self.max_idle {
            free.push(buf);
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Number of idle buffers.
    pub fn available(&self) -> usize {
        self.free.lock().len()
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffer_size", &self.buffer_size)
            .field("idle", &self.free.lock().len())
            .finish()
    }
}
