//! Reusable chunk buffers with bounded check-out.
//!
//! A write call checks out one buffer per chunk and hands it to a writer task,
//! so the number of outstanding buffers is also the number of chunks held in
//! memory. `get()` blocks once `limit` buffers are out, which gives the chunk
//! reader backpressure against slow block writers.

use std::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex, PoisonError};

use crossbeam::queue::ArrayQueue;

pub struct BufferPool {
    buf_size: usize,
    limit: usize,
    free: ArrayQueue<Vec<u8>>,
    outstanding: Mutex<usize>,
    released: Condvar,
}

impl BufferPool {
    /// Create a pool of `buf_size` byte buffers, allowing at most `limit`
    /// to be checked out at once.
    pub fn new(buf_size: usize, limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            buf_size,
            limit,
            free: ArrayQueue::new(limit),
            outstanding: Mutex::new(0),
            released: Condvar::new(),
        }
    }

    /// Check out a buffer of exactly `buf_size` bytes, blocking while the
    /// pool is at its limit.
    pub fn get(&self) -> PooledBuffer<'_> {
        let mut outstanding = self
            .outstanding
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while *outstanding >= self.limit {
            outstanding = self
                .released
                .wait(outstanding)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *outstanding += 1;
        drop(outstanding);

        let mut buf = self
            .free
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.buf_size));
        buf.resize(self.buf_size, 0);
        PooledBuffer { pool: self, buf }
    }

    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Buffers currently checked out.
    pub fn outstanding(&self) -> usize {
        *self
            .outstanding
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn put(&self, buf: Vec<u8>) {
        let _ = self.free.push(buf);
        let mut outstanding = self
            .outstanding
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *outstanding = outstanding.saturating_sub(1);
        self.released.notify_one();
    }
}

/// Buffer checked out of a [`BufferPool`], returned on drop.
pub struct PooledBuffer<'a> {
    pool: &'a BufferPool,
    buf: Vec<u8>,
}

impl Deref for PooledBuffer<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for PooledBuffer<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for PooledBuffer<'_> {
    fn drop(&mut self) {
        self.pool.put(std::mem::take(&mut self.buf));
    }
}
