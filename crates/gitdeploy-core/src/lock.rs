//! Single-flight run lock.
//!
//! The lock is a file created with `O_CREAT | O_EXCL`, so two invocations
//! racing for it cannot both succeed. The holder's pid, run id and
//! acquisition time are written into the file for operators. A lock left by
//! a crashed run stays until cleared with [`RunLock::clear`].

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::domain::Result;

/// Contents of a held lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHolder {
    pub pid: u32,
    pub run_id: String,
    pub acquired_at: DateTime<Utc>,
}

/// Result of [`RunLock::try_acquire`].
#[derive(Debug)]
pub enum LockAttempt {
    Acquired(RunLockGuard),
    /// Another run holds the lock. The holder is `None` when the file is
    /// unreadable or was written by something else.
    AlreadyHeld(Option<LockHolder>),
}

/// Run lock at a fixed path.
#[derive(Debug, Clone)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Atomically create the lock file.
    pub fn try_acquire(&self, run_id: &str) -> Result<LockAttempt> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Ok(LockAttempt::AlreadyHeld(self.holder()?));
            }
            Err(e) => return Err(e.into()),
        };

        let holder = LockHolder {
            pid: std::process::id(),
            run_id: run_id.to_string(),
            acquired_at: Utc::now(),
        };
        let guard = RunLockGuard {
            path: self.path.clone(),
            released: false,
        };
        // The guard owns the file from here, so a failed write still releases it.
        file.write_all(serde_json::to_string(&holder)?.as_bytes())?;
        file.sync_all()?;
        Ok(LockAttempt::Acquired(guard))
    }

    /// Current holder, if the lock file exists.
    pub fn holder(&self) -> Result<Option<LockHolder>> {
        match fs::read_to_string(&self.path) {
            Ok(text) => Ok(serde_json::from_str(&text).ok()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn is_held(&self) -> bool {
        self.path.exists()
    }

    /// Remove a stale lock. Returns whether a file was removed.
    pub fn clear(&self) -> Result<bool> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Held lock. Released by [`RunLockGuard::release`] or on drop.
#[derive(Debug)]
pub struct RunLockGuard {
    path: PathBuf,
    released: bool,
}

impl RunLockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release the lock, reporting removal errors.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for RunLockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "failed to release run lock");
            }
        }
    }
}
