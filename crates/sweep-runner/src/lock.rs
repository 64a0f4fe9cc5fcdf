//! The run-status lock.
//!
//! Claiming work is a list-then-flip critical section shared by every queue
//! and batch process using a run store. [`FileLock`] provides it across
//! processes with `flock`; [`MemoryLock`] provides it across threads for
//! tests and single-process use.

use anyhow::{Context, Result};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, TryLockError};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::SweepError;
use crate::ensure_dir;

pub const RUN_STATUS_LOCK: &str = "run-status";

const POLL_INTERVAL: Duration = Duration::from_millis(50);

trait Held {}

impl<T> Held for T {}

/// Held while the lock is owned; dropping it releases the lock.
pub struct StatusLockGuard<'a> {
    _held: Box<dyn Held + 'a>,
}

pub trait StatusLock: Send + Sync {
    /// Blocks until the lock is acquired or its timeout elapses, in which case
    /// the error downcasts to [`SweepError::LockTimeout`].
    fn acquire(&self) -> Result<StatusLockGuard<'_>>;
}

#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    timeout: Duration,
}

impl FileLock {
    pub fn new(path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            timeout,
        }
    }

    /// The named lock under `locks_dir`.
    pub fn named(locks_dir: &Path, name: &str, timeout: Duration) -> Self {
        Self::new(locks_dir.join(name), timeout)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StatusLock for FileLock {
    fn acquire(&self) -> Result<StatusLockGuard<'_>> {
        if let Some(parent) = self.path.parent() {
            ensure_dir(parent)?;
        }
        let file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.path)
            .with_context(|| format!("opening lock file {}", self.path.display()))?;
        let deadline = Instant::now() + self.timeout;
        loop {
            if try_flock_exclusive(&file)
                .with_context(|| format!("locking {}", self.path.display()))?
            {
                // Closing the file releases the flock.
                return Ok(StatusLockGuard {
                    _held: Box::new(file),
                });
            }
            if Instant::now() >= deadline {
                return Err(SweepError::LockTimeout {
                    path: self.path.clone(),
                }
                .into());
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}

fn try_flock_exclusive(file: &File) -> io::Result<bool> {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        // SAFETY: fd is owned by `file` for the duration of the call.
        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if result == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock || err.raw_os_error() == Some(libc::EWOULDBLOCK) {
            return Ok(false);
        }
        Err(err)
    }
    #[cfg(not(unix))]
    {
        let _ = file;
        Ok(true)
    }
}

/// In-process lock with the same timeout behaviour as [`FileLock`].
#[derive(Debug)]
pub struct MemoryLock {
    name: String,
    inner: Mutex<()>,
    timeout: Duration,
}

impl MemoryLock {
    pub fn new(name: impl Into<String>, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(()),
            timeout,
        }
    }
}

impl StatusLock for MemoryLock {
    fn acquire(&self) -> Result<StatusLockGuard<'_>> {
        let deadline = Instant::now() + self.timeout;
        loop {
            let guard: Option<MutexGuard<'_, ()>> = match self.inner.try_lock() {
                Ok(guard) => Some(guard),
                Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
                Err(TryLockError::WouldBlock) => None,
            };
            if let Some(guard) = guard {
                return Ok(StatusLockGuard {
                    _held: Box::new(guard),
                });
            }
            if Instant::now() >= deadline {
                return Err(SweepError::LockTimeout {
                    path: PathBuf::from(&self.name),
                }
                .into());
            }
            thread::sleep(Duration::from_millis(1));
        }
    }
}
