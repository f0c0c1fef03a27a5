//! Instance lock preventing two mirrors from writing the same state store.
//!
//! Exclusion comes from an OS advisory lock (`fs4`) held on the artifact for
//! as long as the process runs; the kernel drops it when the process exits,
//! so a crashed owner never blocks the next start. The artifact also carries
//! a small JSON record naming the owner, used for diagnostics only.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs4::fs_std::FileExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("Lock file I/O error at {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("Failed to encode lock record: {0}")]
    Record(#[from] serde_json::Error),
}

/// Contents of the lock artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
}

/// Whether a process with the given pid currently exists.
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 only performs the existence and permission checks.
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    // EPERM: the process exists but belongs to someone else.
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Without a liveness probe every recorded owner is assumed alive.
#[cfg(not(unix))]
pub fn process_alive(_pid: u32) -> bool {
    true
}

fn parse_record(raw: &[u8]) -> Option<LockRecord> {
    serde_json::from_slice(raw).ok()
}

#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
    allow_multiple: bool,
    /// Open handle carrying the exclusive lock while held.
    file: Option<File>,
    probe: fn(u32) -> bool,
}

impl InstanceLock {
    pub fn new(path: impl Into<PathBuf>, allow_multiple: bool) -> Self {
        Self {
            path: path.into(),
            allow_multiple,
            file: None,
            probe: process_alive,
        }
    }

    /// Replace the liveness probe used when reporting on a previous owner.
    pub fn with_probe(mut self, probe: fn(u32) -> bool) -> Self {
        self.probe = probe;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_held(&self) -> bool {
        self.file.is_some()
    }

    fn io_err(&self, source: io::Error) -> LockError {
        LockError::Io {
            path: self.path.clone(),
            source,
        }
    }

    /// The record currently in the artifact, if it parses.
    pub fn read_record(&self) -> Option<LockRecord> {
        let raw = std::fs::read(&self.path).ok()?;
        parse_record(&raw)
    }

    /// Try to become the single running instance.
    ///
    /// Returns `Ok(false)` when another process holds the lock; that is an
    /// expected outcome, not an error.
    pub fn check_and_acquire(&mut self) -> Result<bool, LockError> {
        if self.allow_multiple {
            tracing::debug!("Multiple instances allowed, skipping instance lock");
            return Ok(true);
        }
        if self.file.is_some() {
            return Ok(true);
        }
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| self.io_err(e))?;
        }

        // Never truncate on open: the record belongs to whoever holds the lock.
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|e| self.io_err(e))?;

        if let Err(e) = file.try_lock_exclusive() {
            tracing::debug!(error = %e, "Instance lock is held elsewhere");
            match self.read_record() {
                Some(owner) => tracing::info!(
                    pid = owner.pid,
                    since = %owner.acquired_at,
                    alive = (self.probe)(owner.pid),
                    "Another instance is already running"
                ),
                None => tracing::info!(
                    path = %self.path.display(),
                    "Another instance is already running"
                ),
            }
            return Ok(false);
        }

        let mut previous = Vec::new();
        file.read_to_end(&mut previous).map_err(|e| self.io_err(e))?;
        match parse_record(&previous) {
            Some(old) if old.pid != std::process::id() => tracing::warn!(
                pid = old.pid,
                alive = (self.probe)(old.pid),
                since = %old.acquired_at,
                "Reclaiming stale instance lock"
            ),
            None if !previous.is_empty() => {
                tracing::warn!(path = %self.path.display(), "Replacing unreadable instance lock record")
            }
            _ => {}
        }

        let record = LockRecord {
            pid: std::process::id(),
            acquired_at: Utc::now(),
        };
        let bytes = serde_json::to_vec(&record)?;
        file.set_len(0).map_err(|e| self.io_err(e))?;
        file.seek(SeekFrom::Start(0)).map_err(|e| self.io_err(e))?;
        file.write_all(&bytes).map_err(|e| self.io_err(e))?;
        file.sync_all().map_err(|e| self.io_err(e))?;

        self.file = Some(file);
        tracing::debug!(path = %self.path.display(), "Acquired instance lock");
        Ok(true)
    }

    /// Clear the record and drop the OS lock.
    ///
    /// The artifact itself stays in place: unlinking a locked file would let
    /// a process that already opened it and one that creates a fresh file
    /// both succeed.
    pub fn release(&mut self) -> Result<(), LockError> {
        let Some(file) = self.file.take() else {
            return Ok(());
        };
        let cleared = file.set_len(0);
        drop(file);
        cleared.map_err(|e| self.io_err(e))?;
        tracing::debug!(path = %self.path.display(), "Released instance lock");
        Ok(())
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            tracing::warn!(error = %e, "Failed to release instance lock");
        }
    }
}
