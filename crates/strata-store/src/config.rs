//! Block storage configuration.

use serde::{Deserialize, Serialize};

use crate::compress::Compression;

/// Default chunk size (16 KiB)
pub const DEFAULT_BLOCK_SIZE: usize = 16 * 1024;

/// Default buffer size for node file I/O
pub const DEFAULT_BUF_SIZE: usize = 4096;

/// Maximum threads for block writes (preserve system resources)
pub const MAX_WRITE_THREADS: usize = 4;

/// Calculate default thread count: min(cpu_cores / 2, MAX_WRITE_THREADS)
pub fn default_thread_count() -> usize {
    (num_cpus::get() / 2).clamp(1, MAX_WRITE_THREADS)
}

/// Options used when opening a [`BlockStorage`](crate::BlockStorage)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockConfig {
    /// Chunk size used when splitting values into blocks
    pub block_size: usize,
    /// Buffer size used when writing node files
    pub write_buf_size: usize,
    /// Buffer size used when reading node files
    pub read_buf_size: usize,
    /// Allow replacing the value of an existing key
    pub overwrite: bool,
    /// Compression applied to block files
    pub compression: Compression,
    /// Block writer threads (None = min(cpu/2, 4))
    pub write_threads: Option<usize>,
    /// Chunks allowed in memory at once (None = 2 x writer threads)
    pub max_inflight_blocks: Option<usize>,
    /// Re-hash blocks on read and report mismatches as corruption
    pub verify_reads: bool,
    /// fsync block and node files before reporting success
    pub sync_writes: bool,
}

impl Default for BlockConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            write_buf_size: DEFAULT_BUF_SIZE,
            read_buf_size: DEFAULT_BUF_SIZE,
            overwrite: false,
            compression: Compression::None,
            write_threads: None,
            max_inflight_blocks: None,
            verify_reads: false,
            sync_writes: false,
        }
    }
}

impl BlockConfig {
    /// Return a copy with zero sizes replaced by their defaults.
    pub fn normalized(&self) -> Self {
        let mut cfg = self.clone();
        if cfg.block_size == 0 {
            cfg.block_size = DEFAULT_BLOCK_SIZE;
        }
        if cfg.write_buf_size == 0 {
            cfg.write_buf_size = DEFAULT_BUF_SIZE;
        }
        if cfg.read_buf_size == 0 {
            cfg.read_buf_size = DEFAULT_BUF_SIZE;
        }
        cfg.write_threads = Some(match cfg.write_threads {
            Some(n) if n > 0 => n,
            _ => default_thread_count(),
        });
        cfg
    }

    /// Resolved writer thread count.
    pub fn threads(&self) -> usize {
        match self.write_threads {
            Some(n) if n > 0 => n,
            _ => default_thread_count(),
        }
    }

    /// Resolved in-flight chunk limit.
    pub fn inflight_blocks(&self) -> usize {
        match self.max_inflight_blocks {
            Some(n) if n > 0 => n,
            _ => self.threads() * 2,
        }
    }

    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_write_threads(mut self, threads: usize) -> Self {
        self.write_threads = Some(threads);
        self
    }

    pub fn with_verify_reads(mut self, verify: bool) -> Self {
        self.verify_reads = verify;
        self
    }
}
