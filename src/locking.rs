//! Per-entry cache locking: an in-process mutex keyed by entry path, paired
//! with an OS advisory file lock on `.lock` (spec §4.3, §5). Order is always
//! in-process first, then file lock; released in reverse. This prevents two
//! threads in one process from racing for the same OS file lock, which
//! `fs2::FileExt` alone does not guard against.
//!
//! Acquisition retries the OS lock with exponential backoff, the same shape
//! as the teacher's `TransactionEngine::begin` lock loop.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use fs2::FileExt;

use crate::error::{Error, Result};

const MAX_ATTEMPTS: u32 = 8;
const INITIAL_BACKOFF: Duration = Duration::from_millis(50);

/// A named, in-process exclusive lock: unlike `Mutex<()>`, acquire/release
/// are separate calls, so the held state can live inside `EntryLock`
/// without a borrowed guard and its lifetime parameter.
#[derive(Default)]
struct InProcessLock {
    locked: Mutex<bool>,
    cv: Condvar,
}

impl InProcessLock {
    fn acquire(self: &Arc<Self>) {
        let mut locked = self.locked.lock().expect("in-process lock poisoned");
        while *locked {
            locked = self.cv.wait(locked).expect("in-process lock poisoned");
        }
        *locked = true;
    }

    fn release(&self) {
        let mut locked = self.locked.lock().expect("in-process lock poisoned");
        *locked = false;
        self.cv.notify_one();
    }
}

/// Process-wide registry of in-process mutexes keyed by entry directory, so
/// concurrent threads targeting the same entry serialize before either ever
/// touches the OS file lock.
#[derive(Default)]
pub struct LockRegistry {
    inner: Mutex<HashMap<PathBuf, Arc<InProcessLock>>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, entry_dir: &Path) -> Arc<InProcessLock> {
        let mut map = self.inner.lock().expect("lock registry poisoned");
        map.entry(entry_dir.to_path_buf())
            .or_insert_with(|| Arc::new(InProcessLock::default()))
            .clone()
    }

    /// Acquire the entry lock for `entry_dir`, blocking until both the
    /// in-process mutex and the OS file lock (on `lock_path`) are held.
    pub fn acquire(&self, entry_dir: &Path, lock_path: &Path) -> Result<EntryLock> {
        let in_process = self.lock_for(entry_dir);
        in_process.acquire();

        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_path)?;

        let mut backoff = INITIAL_BACKOFF;
        let mut attempt = 0;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => break,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    attempt += 1;
                    if attempt >= MAX_ATTEMPTS {
                        return Err(Error::LockBroken {
                            reason: format!(
                                "timed out acquiring file lock at {}",
                                lock_path.display()
                            ),
                        });
                    }
                    thread::sleep(backoff);
                    backoff *= 2;
                }
                Err(e) => return Err(Error::Io(e)),
            }
        }

        Ok(EntryLock {
            in_process,
            file: Some(file),
        })
    }
}

/// RAII guard over a held entry lock. Dropping releases the OS lock first,
/// then the in-process mutex (reverse acquisition order).
pub struct EntryLock {
    in_process: Arc<InProcessLock>,
    file: Option<File>,
}

impl Drop for EntryLock {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = fs2::FileExt::unlock(&file);
        }
        self.in_process.release();
    }
}
