// src/lock.rs

//! Per-resource advisory locks, cross-process and cross-thread
//!
//! A resource is an opaque canonical string, typically a reference's
//! `full_str()` or a download fingerprint. Locks come in two modes,
//! shared (many concurrent readers) and exclusive (one writer), and are
//! enforced at two levels:
//!
//! - **Cross-process**: an OS-advisory lock on a per-resource file under
//!   the lock directory, held for the guard's lifetime.
//! - **Cross-thread**: an in-process reader/writer state per resource,
//!   waited on with a condition variable so acquisition can honor a
//!   caller-supplied timeout.
//!
//! Acquisition order is always process lock first, then thread lock.
//! Callers never touch either layer directly; they hold a [`LockGuard`]
//! and drop it (or [`ResourceLocks::exchange`] it) when done.

use crate::error::{Error, Result};
use crate::hash;
use std::collections::HashMap;
use std::fs::{self, File};
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

/// Poll interval for process-lock acquisition under a deadline
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Lock mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Many concurrent holders
    Shared,
    /// Single holder
    Exclusive,
}

#[derive(Default)]
struct ThreadLockState {
    readers: usize,
    writer: bool,
}

struct ThreadLock {
    state: Mutex<ThreadLockState>,
    cv: Condvar,
}

impl ThreadLock {
    fn new() -> Self {
        Self {
            state: Mutex::new(ThreadLockState::default()),
            cv: Condvar::new(),
        }
    }

    /// Returns false on deadline expiry without acquiring
    fn acquire(&self, mode: LockMode, deadline: Option<Instant>) -> bool {
        let mut state = self.state.lock().unwrap();
        loop {
            let free = match mode {
                LockMode::Shared => !state.writer,
                LockMode::Exclusive => !state.writer && state.readers == 0,
            };
            if free {
                match mode {
                    LockMode::Shared => state.readers += 1,
                    LockMode::Exclusive => state.writer = true,
                }
                return true;
            }

            match deadline {
                None => state = self.cv.wait(state).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    let (guard, _) = self.cv.wait_timeout(state, deadline - now).unwrap();
                    state = guard;
                }
            }
        }
    }

    fn release(&self, mode: LockMode) {
        let mut state = self.state.lock().unwrap();
        match mode {
            LockMode::Shared => state.readers = state.readers.saturating_sub(1),
            LockMode::Exclusive => state.writer = false,
        }
        drop(state);
        self.cv.notify_all();
    }
}

/// Registry of per-resource locks rooted at a lock directory
pub struct ResourceLocks {
    dir: PathBuf,
    registry: Mutex<HashMap<String, Arc<ThreadLock>>>,
}

impl ResourceLocks {
    /// Create a lock registry; the directory is created if missing
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| {
            Error::IoError(format!(
                "Failed to create lock directory {}: {e}",
                dir.display()
            ))
        })?;
        Ok(Self {
            dir,
            registry: Mutex::new(HashMap::new()),
        })
    }

    /// Acquire a shared lock on a resource
    pub fn shared(&self, resource: &str, timeout: Option<Duration>) -> Result<LockGuard> {
        self.acquire(resource, LockMode::Shared, timeout)
    }

    /// Acquire an exclusive lock on a resource
    pub fn exclusive(&self, resource: &str, timeout: Option<Duration>) -> Result<LockGuard> {
        self.acquire(resource, LockMode::Exclusive, timeout)
    }

    /// Release one resource and acquire another in its place
    ///
    /// The new lock is taken before the old one is released, so there is
    /// no window in which neither resource is held. On failure the old
    /// lock has been released and nothing is held.
    pub fn exchange(
        &self,
        held: LockGuard,
        resource: &str,
        timeout: Option<Duration>,
    ) -> Result<LockGuard> {
        debug!("exchanging lock '{}' for '{}'", held.resource, resource);
        let next = self.acquire(resource, held.mode, timeout)?;
        drop(held);
        Ok(next)
    }

    fn acquire(&self, resource: &str, mode: LockMode, timeout: Option<Duration>) -> Result<LockGuard> {
        let deadline = timeout.map(|t| Instant::now() + t);

        // Process lock first
        let path = self.lock_file(resource);
        let file = File::create(&path).map_err(|e| {
            Error::IoError(format!("Failed to create lock file {}: {e}", path.display()))
        })?;
        self.lock_process(&file, resource, mode, deadline)?;

        // Then the in-process lock; release the file lock if the deadline
        // expires while waiting on other threads.
        let thread = {
            let mut registry = self.registry.lock().unwrap();
            registry
                .entry(resource.to_string())
                .or_insert_with(|| Arc::new(ThreadLock::new()))
                .clone()
        };
        if !thread.acquire(mode, deadline) {
            drop(file);
            return Err(Error::LockTimeout(resource.to_string()));
        }

        debug!("acquired {:?} lock on '{}'", mode, resource);
        Ok(LockGuard {
            resource: resource.to_string(),
            mode,
            thread,
            _file: file,
        })
    }

    fn lock_process(
        &self,
        file: &File,
        resource: &str,
        mode: LockMode,
        deadline: Option<Instant>,
    ) -> Result<()> {
        let block = |f: &File| match mode {
            LockMode::Shared => fs2::FileExt::lock_shared(f),
            LockMode::Exclusive => fs2::FileExt::lock_exclusive(f),
        };
        let try_once = |f: &File| match mode {
            LockMode::Shared => fs2::FileExt::try_lock_shared(f),
            LockMode::Exclusive => fs2::FileExt::try_lock_exclusive(f),
        };

        match deadline {
            None => block(file).map_err(|e| {
                Error::IoError(format!("Failed to lock resource '{}': {e}", resource))
            }),
            Some(deadline) => loop {
                match try_once(file) {
                    Ok(()) => return Ok(()),
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        if Instant::now() >= deadline {
                            return Err(Error::LockTimeout(resource.to_string()));
                        }
                        std::thread::sleep(LOCK_POLL_INTERVAL);
                    }
                    Err(e) => {
                        return Err(Error::IoError(format!(
                            "Failed to lock resource '{}': {e}",
                            resource
                        )))
                    }
                }
            },
        }
    }

    /// Lock file for a resource: a sanitized prefix for readability plus
    /// a digest suffix so distinct resources never collide.
    fn lock_file(&self, resource: &str) -> PathBuf {
        let sanitized: String = resource
            .chars()
            .take(48)
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
            .collect();
        let digest = &hash::sha256(resource.as_bytes())[..12];
        self.dir.join(format!("{}-{}.lock", sanitized, digest))
    }
}

/// RAII guard for a held resource lock; dropping it releases both layers
pub struct LockGuard {
    resource: String,
    mode: LockMode,
    thread: Arc<ThreadLock>,
    // Kept open to hold the OS advisory lock; released on close
    _file: File,
}

impl LockGuard {
    /// The canonical resource string this guard holds
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// The mode this guard was acquired with
    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.thread.release(self.mode);
        debug!("released {:?} lock on '{}'", self.mode, self.resource);
    }
}
