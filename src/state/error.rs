//! Error types for the state store.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur during state store operations.
#[derive(Error, Debug)]
pub enum StateError {
    /// Failed to open or create the store file.
    #[error("Failed to open state store at {path}: {source}")]
    Open {
        path: PathBuf,
        source: rusqlite::Error,
    },

    /// Failed to run a schema migration.
    #[error("State store migration failed: {0}")]
    Migration(#[from] rusqlite::Error),

    /// A read or write against the store failed (medium unwritable, locked, ...).
    #[error("State store query failed: {0}")]
    Query(String),

    /// Filesystem error while handling store artifacts (backups, sidecars).
    #[error("State store I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Creating or validating a backup failed.
    #[error("Backup failed: {0}")]
    Backup(String),

    /// The store is corrupted and no valid backup could replace it.
    #[error("State store at {path} is corrupted and cannot be recovered: {reason}")]
    Unrecoverable { path: PathBuf, reason: String },

    /// Failed to spawn a blocking task.
    #[error("Failed to spawn blocking task: {0}")]
    Spawn(#[from] tokio::task::JoinError),

    /// The store schema version is newer than supported.
    #[error("State store schema version {found} is newer than supported version {expected}")]
    UnsupportedSchemaVersion { found: i32, expected: i32 },
}

impl StateError {
    /// Create a Query error from a rusqlite error.
    pub fn query(source: rusqlite::Error) -> Self {
        Self::Query(source.to_string())
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this error means the store cannot be trusted any more.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Unrecoverable { .. } | Self::UnsupportedSchemaVersion { .. }
        )
    }
}
