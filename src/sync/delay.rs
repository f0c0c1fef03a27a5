//! Persisted backoff delay between throttled sync runs.
//!
//! The value survives process restarts in a small JSON sidecar so that a
//! series of short-lived runs does not forget an active backoff.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
struct DelayRecord {
    delay_ms: u64,
}

#[derive(Debug, Clone)]
pub struct SyncDelay {
    path: Option<PathBuf>,
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl SyncDelay {
    /// Load the persisted delay, clamped to `[initial, max]`. A missing or
    /// unreadable sidecar starts at `initial`.
    pub fn load(path: Option<PathBuf>, initial: Duration, max: Duration) -> Self {
        let max = max.max(initial);
        let current = path
            .as_deref()
            .and_then(read_record)
            .map(|r| Duration::from_millis(r.delay_ms).clamp(initial, max))
            .unwrap_or(initial);

        if current > initial {
            tracing::info!(delay_ms = current.as_millis() as u64, "Resuming sync backoff");
        }

        Self {
            path,
            initial,
            max,
            current,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn initial(&self) -> Duration {
        self.initial
    }

    /// Double the delay, capped at the maximum. Returns the new value.
    pub fn escalate(&mut self) -> Duration {
        self.current = self.current.saturating_mul(2).min(self.max);
        self.current
    }

    /// Return to the initial delay. Returns whether the value changed.
    pub fn reset(&mut self) -> bool {
        let changed = self.current != self.initial;
        self.current = self.initial;
        changed
    }

    /// Write the current value to the sidecar. Failures are logged: losing
    /// the sidecar only forgets the backoff.
    pub fn save(&self) {
        let Some(path) = &self.path else {
            return;
        };
        if let Err(e) = write_record(path, self.current) {
            tracing::warn!(path = %path.display(), error = %e, "Failed to persist sync delay");
        }
    }
}

fn read_record(path: &Path) -> Option<DelayRecord> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Cannot read sync delay");
            return None;
        }
    };
    match serde_json::from_str(&raw) {
        Ok(record) => Some(record),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Ignoring malformed sync delay");
            None
        }
    }
}

fn write_record(path: &Path, delay: Duration) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let record = DelayRecord {
        delay_ms: delay.as_millis() as u64,
    };
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, serde_json::to_vec(&record)?)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
