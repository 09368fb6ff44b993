//! # strata-kv
//!
//! Key-value facade over [`BlockStorage`].
//!
//! The engine itself does not serialize callers working on the same key. This
//! crate does: reads of a key share it, writes and deletes take it
//! exclusively, and iterators hold a map-wide read lock so the key set they
//! walk cannot change underneath them.
//!
//! ```no_run
//! use strata_kv::KvStore;
//! use strata_store::BlockConfig;
//!
//! let kv = KvStore::open("/var/lib/strata", BlockConfig::default())?;
//! kv.put("greeting", b"hello")?;
//!
//! let mut iter = kv.iter()?;
//! while let Some(key) = iter.next() {
//!     println!("{} = {} bytes", key, iter.value(&key)?.len());
//! }
//! # Ok::<(), strata_store::StoreError>(())
//! ```

pub mod locks;

use std::io::{self, Read};
use std::path::Path;
use std::time::Duration;

use strata_config::{log_gc_info, log_kv_debug, log_kv_info, log_kv_warn};
use strata_store::{
    validate_key, BlockConfig, BlockReader, BlockStorage, CleanStats, Result, StoreStats,
};

pub use locks::{KeyGuard, KeyLocks, MapGuard};

/// Block store guarded by per-key locks.
#[derive(Debug)]
pub struct KvStore {
    storage: BlockStorage,
    locks: KeyLocks,
}

impl KvStore {
    /// Open the block store at `root` and wrap it.
    pub fn open(root: impl AsRef<Path>, config: BlockConfig) -> Result<Self> {
        Ok(Self::from_storage(BlockStorage::open(root, config)?))
    }

    pub fn from_storage(storage: BlockStorage) -> Self {
        Self {
            storage,
            locks: KeyLocks::new(),
        }
    }

    /// Underlying engine. Calls made through it bypass key locking.
    pub fn storage(&self) -> &BlockStorage {
        &self.storage
    }

    pub fn get(&self, key: &str) -> Result<Vec<u8>> {
        validate_key(key)?;
        let _guard = self.locks.read(key);
        self.storage.read_bytes(key).inspect_err(|e| {
            if e.is_corrupt() {
                log_kv_warn!(
                    "Corrupt value",
                    key = key,
                    error = tracing::field::display(e)
                );
            }
        })
    }

    /// Stream the value of `key`. The key stays read locked until the reader
    /// is dropped.
    pub fn get_stream(&self, key: &str) -> Result<KvReader<'_>> {
        validate_key(key)?;
        let guard = self.locks.read(key);
        let inner = self.storage.read_stream(key)?;
        Ok(KvReader {
            inner,
            _guard: guard,
        })
    }

    pub fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.put_stream(key, value)
    }

    pub fn put_stream(&self, key: &str, reader: impl Read) -> Result<()> {
        validate_key(key)?;
        let _guard = self.locks.write(key);
        self.storage.write_stream(key, reader)?;
        log_kv_debug!("Value stored", key = key);
        Ok(())
    }

    /// Whether a value is stored under `key`.
    pub fn has(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        let _guard = self.locks.read(key);
        self.storage.stat(key)
    }

    pub fn delete(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        let _guard = self.locks.write(key);
        self.storage.remove(key)?;
        log_kv_debug!("Value deleted", key = key);
        Ok(())
    }

    /// Snapshot the key set and hold off writers until the iterator is
    /// dropped.
    ///
    /// Writing through this store, or opening a second iterator, from the
    /// thread that owns the iterator can deadlock; finish iterating first.
    pub fn iter(&self) -> Result<KvIterator<'_>> {
        let guard = self.locks.read_map();
        let keys = self.storage.keys()?;
        log_kv_debug!("Iterator opened", keys = keys.len());
        Ok(KvIterator {
            store: self,
            keys: keys.into_iter(),
            _guard: guard,
        })
    }

    /// Garbage-collect unreferenced blocks with writers held off.
    ///
    /// No write can be in flight, so every temporary block file is stale.
    pub fn clean(&self) -> Result<CleanStats> {
        let _guard = self.locks.read_map();
        let stats = self.storage.clean_with_temp_age(Duration::ZERO)?;
        log_gc_info!(
            "Clean finished",
            removed_blocks = stats.removed_blocks,
            live_blocks = stats.live_blocks
        );
        Ok(stats)
    }

    pub fn stats(&self) -> Result<StoreStats> {
        self.storage.stats()
    }

    pub fn close(&self) -> Result<()> {
        self.storage.close()?;
        log_kv_info!(
            "Store closed",
            root = tracing::field::display(self.storage.root().display())
        );
        Ok(())
    }
}

/// Streaming value reader holding its key's read lock.
#[derive(Debug)]
pub struct KvReader<'a> {
    inner: BlockReader<'a>,
    _guard: KeyGuard<'a>,
}

impl KvReader<'_> {
    pub fn key(&self) -> &str {
        self.inner.key()
    }
}

impl Read for KvReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

/// Read-only walk over the keys present when the iterator was opened.
///
/// Not meant to be shared between threads, but any number of iterators can
/// be open at once.
#[derive(Debug)]
pub struct KvIterator<'a> {
    store: &'a KvStore,
    keys: std::vec::IntoIter<String>,
    _guard: MapGuard<'a>,
}

impl KvIterator<'_> {
    /// Read the value of `key` under the iterator's lock.
    pub fn value(&self, key: &str) -> Result<Vec<u8>> {
        self.store.get(key)
    }

    /// Keys not yet yielded.
    pub fn remaining(&self) -> usize {
        self.keys.len()
    }

    /// Release the store lock. Same as dropping the iterator.
    pub fn release(self) {}
}

impl Iterator for KvIterator<'_> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        self.keys.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.keys.size_hint()
    }
}

impl ExactSizeIterator for KvIterator<'_> {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open(temp: &TempDir) -> KvStore {
        let cfg = BlockConfig::default().with_block_size(32);
        KvStore::open(temp.path(), cfg).unwrap()
    }

    #[test]
    fn test_put_get_has_delete() {
        let temp = TempDir::new().unwrap();
        let kv = open(&temp);

        kv.put("k", b"value").unwrap();
        assert!(kv.has("k").unwrap());
        assert_eq!(kv.get("k").unwrap(), b"value");

        kv.delete("k").unwrap();
        assert!(!kv.has("k").unwrap());
        assert!(kv.get("k").unwrap_err().is_not_found());
    }

    #[test]
    fn test_invalid_key_takes_no_lock() {
        let temp = TempDir::new().unwrap();
        let kv = open(&temp);
        assert!(kv.put("a/b", b"v").is_err());
        assert!(kv.get("..").is_err());
        assert_eq!(kv.locks.held(), 0);
    }

    #[test]
    fn test_get_stream_holds_read_lock() {
        let temp = TempDir::new().unwrap();
        let kv = open(&temp);
        kv.put("k", b"streamed value").unwrap();

        let mut reader = kv.get_stream("k").unwrap();
        assert_eq!(kv.locks.held(), 1);
        let mut out = String::new();
        reader.read_to_string(&mut out).unwrap();
        assert_eq!(out, "streamed value");
        drop(reader);
        assert_eq!(kv.locks.held(), 0);
    }

    #[test]
    fn test_iterator_yields_sorted_snapshot() {
        let temp = TempDir::new().unwrap();
        let kv = open(&temp);
        for key in ["c", "a", "b"] {
            kv.put(key, key.as_bytes()).unwrap();
        }

        let iter = kv.iter().unwrap();
        assert_eq!(iter.len(), 3);
        let pairs: Vec<(String, Vec<u8>)> = {
            let mut iter = iter;
            let mut pairs = Vec::new();
            while let Some(key) = iter.next() {
                let value = iter.value(&key).unwrap();
                pairs.push((key, value));
            }
            pairs
        };
        assert_eq!(
            pairs,
            vec![
                ("a".to_string(), b"a".to_vec()),
                ("b".to_string(), b"b".to_vec()),
                ("c".to_string(), b"c".to_vec()),
            ]
        );
    }

    #[test]
    fn test_clean_removes_fresh_temporaries() {
        let temp = TempDir::new().unwrap();
        let kv = open(&temp);
        kv.put("k", b"value").unwrap();

        // Left behind by a crashed write; no writer can be running under clean
        let leftover = temp.path().join("block").join("feedface.1.0.tmp");
        std::fs::write(&leftover, b"partial").unwrap();

        let stats = kv.clean().unwrap();
        assert_eq!(stats.removed_temp, 1);
        assert!(!leftover.exists());
        assert_eq!(kv.get("k").unwrap(), b"value");
    }
}
