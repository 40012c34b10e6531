// src/locker.rs

//! Shared-mode hold on the package resources
//!
//! Every client keeps a shared `flock(LOCK_SH)` on the resources lock file
//! while it reads the package database. The daemon takes the exclusive side
//! to run an activity, so it asks each client to drop its hold first and to
//! take it back once the activity is over.
//!
//! [`SharedLocker`] is the per-process view of that hold: a boolean, not a
//! counter. Concurrent `lock()` calls collapse into one underlying
//! acquisition and concurrent `unlock()` calls into one release.
//!
//! # Example
//!
//! ```ignore
//! use pkgmux::locker::{FileResourceLock, SharedLocker};
//!
//! let lock = FileResourceLock::new("/var/lib/pkgmux/resources.lock");
//! let locker = SharedLocker::new(Box::new(lock), false);
//! locker.lock()?;   // blocks while the daemon holds the exclusive side
//! locker.unlock()?; // daemon asked us to step aside
//! ```

use crate::Result;
use fs2::FileExt;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Underlying cross-process resource lock
pub trait ResourceLock: Send + Sync {
    /// Take the shared hold, blocking while an exclusive holder exists
    fn acquire_shared(&self) -> Result<()>;

    /// Drop the shared hold
    fn release(&self) -> Result<()>;
}

/// Shared `flock` on a lock file
pub struct FileResourceLock {
    path: PathBuf,
    /// Open handle while the hold is taken
    file: Mutex<Option<File>>,
}

impl FileResourceLock {
    /// Default lock path shared with the daemon
    pub const DEFAULT_PATH: &'static str = "/var/lib/pkgmux/resources.lock";

    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            file: Mutex::new(None),
        }
    }

    /// Get the path to the lock file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether any process holds the lock exclusively
    ///
    /// Non-destructive: a successful trial lock is released immediately.
    pub fn is_exclusively_held<P: AsRef<Path>>(path: P) -> bool {
        let file = match File::open(path.as_ref()) {
            Ok(f) => f,
            Err(_) => return false,
        };
        match file.try_lock_shared() {
            Ok(()) => {
                let _ = file.unlock();
                false
            }
            Err(_) => true,
        }
    }
}

impl ResourceLock for FileResourceLock {
    fn acquire_shared(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)?;

        file.lock_shared().map_err(|e| {
            crate::Error::Lock(format!(
                "Failed to acquire shared lock on {}: {}",
                self.path.display(),
                e
            ))
        })?;

        debug!("Acquired shared resources lock at {:?}", self.path);
        *self.file.lock() = Some(file);
        Ok(())
    }

    fn release(&self) -> Result<()> {
        let Some(file) = self.file.lock().take() else {
            return Ok(());
        };
        file.unlock().map_err(|e| {
            crate::Error::Lock(format!(
                "Failed to release shared lock on {}: {}",
                self.path.display(),
                e
            ))
        })?;
        debug!("Released shared resources lock at {:?}", self.path);
        Ok(())
    }
}

impl Drop for FileResourceLock {
    fn drop(&mut self) {
        // Closing the handle drops the flock
        if self.file.get_mut().take().is_some() {
            debug!("Dropped shared resources lock at {:?}", self.path);
        }
    }
}

/// Idempotent, non-counting shared hold
pub struct SharedLocker {
    lock: Box<dyn ResourceLock>,
    /// Guards the decision only; the blocking call runs outside it
    locked: Mutex<bool>,
}

impl SharedLocker {
    /// Wrap `lock`; `locked` says whether the hold was already taken
    pub fn new(lock: Box<dyn ResourceLock>, locked: bool) -> Self {
        Self {
            lock,
            locked: Mutex::new(locked),
        }
    }

    /// Take the shared hold unless this process already has it
    pub fn lock(&self) -> Result<()> {
        {
            let mut locked = self.locked.lock();
            if *locked {
                debug!("shared locker: already locked");
                return Ok(());
            }
            *locked = true;
        }

        info!("Acquiring shared resources lock");
        if let Err(e) = self.lock.acquire_shared() {
            // Leave the flag consistent with the real hold
            *self.locked.lock() = false;
            warn!("Failed to acquire shared resources lock: {}", e);
            return Err(e);
        }
        Ok(())
    }

    /// Drop the shared hold unless this process does not have it
    pub fn unlock(&self) -> Result<()> {
        {
            let mut locked = self.locked.lock();
            if !*locked {
                debug!("shared locker: already unlocked");
                return Ok(());
            }
            *locked = false;
        }

        info!("Releasing shared resources lock");
        self.lock.release()
    }

    pub fn is_locked(&self) -> bool {
        *self.locked.lock()
    }
}
