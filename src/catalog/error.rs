use std::time::Duration;

use thiserror::Error;

/// Typed errors surfaced by a remote catalog.
///
/// `is_throttle()` picks out the rate-limiting signal that drives the sync
/// backoff; `is_retryable()` distinguishes transient transfer failures from
/// permanent ones so the per-item retry loop can abort early.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Remote service is throttling requests")]
    Throttled { retry_after: Option<Duration> },

    #[error("Transfer of {item} failed: {reason}")]
    Transfer {
        item: String,
        reason: String,
        transient: bool,
    },

    #[error("Disk error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RemoteError {
    pub fn is_throttle(&self) -> bool {
        matches!(self, RemoteError::Throttled { .. })
    }

    /// Whether this error is transient and worth retrying within the run.
    ///
    /// Throttling is not retried here; it is handled by the run-level backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            RemoteError::Transfer { transient, .. } => *transient,
            RemoteError::Auth(_)
            | RemoteError::Throttled { .. }
            | RemoteError::Io(_)
            | RemoteError::Other(_) => false,
        }
    }
}
