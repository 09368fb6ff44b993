//! Per-key reader/writer locks with a map-wide read mode.
//!
//! Readers of a key share it, a writer of a key excludes everyone else on
//! that key. A map read lock (taken by iterators and `clean`) waits for
//! running and queued writers to finish and then holds off new writers of
//! every key, while per-key readers keep going. Queued writers go first so a
//! stream of overlapping iterators cannot starve them.
//!
//! A thread that already holds a map read lock must not take another one:
//! a writer queued in between blocks the second request forever.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct KeyState {
    readers: usize,
    writer: bool,
}

impl KeyState {
    fn is_idle(&self) -> bool {
        self.readers == 0 && !self.writer
    }
}

#[derive(Debug, Default)]
struct LockTable {
    keys: HashMap<String, KeyState>,
    writers: usize,
    waiting_writers: usize,
    map_readers: usize,
}

#[derive(Debug, Default)]
pub struct KeyLocks {
    table: Mutex<LockTable>,
    changed: Condvar,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Share `key` with other readers.
    pub fn read(&self, key: &str) -> KeyGuard<'_> {
        let mut table = self.table();
        while table.keys.get(key).is_some_and(|k| k.writer) {
            table = self.wait(table);
        }
        table.keys.entry(key.to_string()).or_default().readers += 1;
        KeyGuard {
            locks: self,
            key: key.to_string(),
            write: false,
        }
    }

    /// Take `key` exclusively. Waits for map readers to go away first.
    pub fn write(&self, key: &str) -> KeyGuard<'_> {
        let mut table = self.table();
        table.waiting_writers += 1;
        while table.map_readers > 0 || table.keys.get(key).is_some_and(|k| !k.is_idle()) {
            table = self.wait(table);
        }
        table.waiting_writers -= 1;
        table.keys.entry(key.to_string()).or_default().writer = true;
        table.writers += 1;
        KeyGuard {
            locks: self,
            key: key.to_string(),
            write: true,
        }
    }

    /// Block writers of every key until the guard is dropped. Writers already
    /// queued are let through first.
    pub fn read_map(&self) -> MapGuard<'_> {
        let mut table = self.table();
        while table.writers > 0 || table.waiting_writers > 0 {
            table = self.wait(table);
        }
        table.map_readers += 1;
        MapGuard { locks: self }
    }

    /// Keys with at least one holder.
    pub fn held(&self) -> usize {
        self.table().keys.len()
    }

    fn release_key(&self, key: &str, write: bool) {
        let mut table = self.table();
        if let Some(state) = table.keys.get_mut(key) {
            if write {
                state.writer = false;
            } else {
                state.readers = state.readers.saturating_sub(1);
            }
            if state.is_idle() {
                table.keys.remove(key);
            }
        }
        if write {
            table.writers = table.writers.saturating_sub(1);
        }
        drop(table);
        self.changed.notify_all();
    }

    fn release_map(&self) {
        let mut table = self.table();
        table.map_readers = table.map_readers.saturating_sub(1);
        drop(table);
        self.changed.notify_all();
    }

    fn table(&self) -> MutexGuard<'_, LockTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(&self, table: MutexGuard<'a, LockTable>) -> MutexGuard<'a, LockTable> {
        self.changed
            .wait(table)
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Held lock on one key.
#[derive(Debug)]
pub struct KeyGuard<'a> {
    locks: &'a KeyLocks,
    key: String,
    write: bool,
}

impl KeyGuard<'_> {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        self.locks.release_key(&self.key, self.write);
    }
}

/// Held map-wide read lock.
#[derive(Debug)]
pub struct MapGuard<'a> {
    locks: &'a KeyLocks,
}

impl Drop for MapGuard<'_> {
    fn drop(&mut self) {
        self.locks.release_map();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[test]
    fn test_readers_share_a_key() {
        let locks = KeyLocks::new();
        let a = locks.read("k");
        let b = locks.read("k");
        assert_eq!(locks.held(), 1);
        drop(a);
        drop(b);
        assert_eq!(locks.held(), 0);
    }

    #[test]
    fn test_writers_of_distinct_keys_do_not_block() {
        let locks = KeyLocks::new();
        let _a = locks.write("a");
        let _b = locks.write("b");
        assert_eq!(locks.held(), 2);
    }

    #[test]
    fn test_writer_waits_for_reader() {
        let locks = KeyLocks::new();
        let written = AtomicBool::new(false);

        std::thread::scope(|s| {
            let reader = locks.read("k");
            s.spawn(|| {
                let _w = locks.write("k");
                written.store(true, Ordering::SeqCst);
            });

            std::thread::sleep(Duration::from_millis(50));
            assert!(!written.load(Ordering::SeqCst));
            drop(reader);
        });
        assert!(written.load(Ordering::SeqCst));
        assert_eq!(locks.held(), 0);
    }

    #[test]
    fn test_map_lock_holds_off_writers_but_not_readers() {
        let locks = KeyLocks::new();
        let written = AtomicBool::new(false);

        std::thread::scope(|s| {
            let map = locks.read_map();
            s.spawn(|| {
                let _w = locks.write("any");
                written.store(true, Ordering::SeqCst);
            });

            // Readers proceed while the map is read locked
            drop(locks.read("other"));

            std::thread::sleep(Duration::from_millis(50));
            assert!(!written.load(Ordering::SeqCst));
            drop(map);
        });
        assert!(written.load(Ordering::SeqCst));
    }

    #[test]
    fn test_map_lock_waits_for_running_writer() {
        let locks = KeyLocks::new();
        let mapped = AtomicBool::new(false);

        std::thread::scope(|s| {
            let writer = locks.write("k");
            s.spawn(|| {
                let _m = locks.read_map();
                mapped.store(true, Ordering::SeqCst);
            });

            std::thread::sleep(Duration::from_millis(50));
            assert!(!mapped.load(Ordering::SeqCst));
            drop(writer);
        });
        assert!(mapped.load(Ordering::SeqCst));
    }

    #[test]
    fn test_queued_writer_goes_before_new_map_reader() {
        let locks = KeyLocks::new();
        let order = Mutex::new(Vec::new());

        std::thread::scope(|s| {
            let first = locks.read_map();
            s.spawn(|| {
                let _w = locks.write("k");
                order.lock().unwrap().push("write");
            });
            std::thread::sleep(Duration::from_millis(50));

            // Overlaps the first map reader, but must not jump the queue
            s.spawn(|| {
                let _m = locks.read_map();
                order.lock().unwrap().push("map");
            });
            std::thread::sleep(Duration::from_millis(50));
            assert!(order.lock().unwrap().is_empty());
            drop(first);
        });
        assert_eq!(*order.lock().unwrap(), vec!["write", "map"]);
        assert_eq!(locks.held(), 0);
    }
}
