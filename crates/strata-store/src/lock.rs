//! Store lifecycle lock.
//!
//! Combines the on-disk `.lock` file (one open handle per store root) with the
//! in-process Open/Closed state and an in-flight operation counter. Every
//! public operation holds an [`OpGuard`] while it touches the filesystem;
//! [`StoreLock::close`] flips the state to Closed and waits until all guards
//! are dropped.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use fs2::FileExt;
use tracing::debug;

use crate::error::{IoResultExt, Result, StoreError};

#[derive(Debug, Default)]
struct LockState {
    closed: bool,
    in_flight: usize,
}

#[derive(Debug)]
pub struct StoreLock {
    path: PathBuf,
    file: Mutex<Option<File>>,
    state: Mutex<LockState>,
    drained: Condvar,
}

impl StoreLock {
    /// Create (if needed) and exclusively lock the file at `path`.
    ///
    /// Fails with [`StoreError::Locked`] if another handle holds it.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .at(&path)?;

        if let Err(e) = file.try_lock_exclusive() {
            let contended = fs2::lock_contended_error().raw_os_error();
            if e.kind() == std::io::ErrorKind::WouldBlock
                || (e.raw_os_error().is_some() && e.raw_os_error() == contended)
            {
                return Err(StoreError::Locked { path });
            }
            return Err(StoreError::from_io(e, &path));
        }
        debug!(path = %path.display(), "store lock acquired");

        Ok(Self {
            path,
            file: Mutex::new(Some(file)),
            state: Mutex::new(LockState::default()),
            drained: Condvar::new(),
        })
    }

    /// Register an in-flight operation.
    pub fn enter(&self) -> Result<OpGuard<'_>> {
        let mut state = self.state();
        if state.closed {
            return Err(StoreError::Closed);
        }
        state.in_flight += 1;
        Ok(OpGuard { lock: self })
    }

    /// Mark the store closed, wait for in-flight operations to drain, then
    /// release the lock file. Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state();
        state.closed = true;
        while state.in_flight > 0 {
            state = self
                .drained
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        drop(state);

        let file = self
            .file
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(file) = file {
            FileExt::unlock(&file).at(&self.path)?;
            debug!(path = %self.path.display(), "store lock released");
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// Operations currently holding a guard.
    pub fn in_flight(&self) -> usize {
        self.state().in_flight
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn exit(&self) {
        let mut state = self.state();
        state.in_flight = state.in_flight.saturating_sub(1);
        if state.in_flight == 0 {
            self.drained.notify_all();
        }
    }

    fn state(&self) -> MutexGuard<'_, LockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Proof of a registered in-flight operation; exits on drop.
#[derive(Debug)]
pub struct OpGuard<'a> {
    lock: &'a StoreLock,
}

impl Drop for OpGuard<'_> {
    fn drop(&mut self) {
        self.lock.exit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_enter_and_exit_track_in_flight() {
        let temp = TempDir::new().unwrap();
        let lock = StoreLock::open(temp.path().join(".lock")).unwrap();

        let a = lock.enter().unwrap();
        let b = lock.enter().unwrap();
        assert_eq!(lock.in_flight(), 2);
        drop(a);
        drop(b);
        assert_eq!(lock.in_flight(), 0);
    }

    #[test]
    fn test_enter_after_close_fails() {
        let temp = TempDir::new().unwrap();
        let lock = StoreLock::open(temp.path().join(".lock")).unwrap();
        lock.close().unwrap();
        assert!(lock.is_closed());
        assert!(matches!(lock.enter(), Err(StoreError::Closed)));
        // Idempotent
        lock.close().unwrap();
    }

    #[test]
    fn test_close_waits_for_in_flight() {
        let temp = TempDir::new().unwrap();
        let lock = StoreLock::open(temp.path().join(".lock")).unwrap();
        let finished = AtomicBool::new(false);

        std::thread::scope(|s| {
            let guard = lock.enter().unwrap();
            let closer = s.spawn(|| {
                lock.close().unwrap();
                assert!(finished.load(Ordering::SeqCst));
            });

            std::thread::sleep(Duration::from_millis(50));
            // New operations are refused while draining
            while !lock.is_closed() {
                std::thread::yield_now();
            }
            assert!(lock.enter().is_err());

            finished.store(true, Ordering::SeqCst);
            drop(guard);
            closer.join().unwrap();
        });
    }

    #[test]
    fn test_second_handle_is_locked_out() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(".lock");
        let first = StoreLock::open(&path).unwrap();

        assert!(matches!(
            StoreLock::open(&path),
            Err(StoreError::Locked { .. })
        ));

        first.close().unwrap();
        let second = StoreLock::open(&path).unwrap();
        second.close().unwrap();
    }
}
