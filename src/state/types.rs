//! Types for the state store.

use std::path::{Component, Path};

use chrono::{DateTime, Utc};

/// An item the mirror has fetched.
///
/// Keyed by `item_id`. For name-based lookups `(item_name, album_name)` is
/// unique, since one display name may legitimately recur across albums.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRecord {
    /// Remote-assigned, stable item identifier.
    pub item_id: String,
    /// Display name; not unique on its own.
    pub item_name: String,
    /// Path relative to the sync root, `/`-separated.
    pub local_relative_path: String,
    /// Source collection.
    pub album_name: String,
    pub file_size_bytes: u64,
    pub downloaded_at: DateTime<Utc>,
}

impl DownloadRecord {
    pub fn new(
        item_id: impl Into<String>,
        item_name: impl Into<String>,
        album_name: impl Into<String>,
        local_relative_path: impl Into<String>,
        file_size_bytes: u64,
    ) -> Self {
        Self {
            item_id: item_id.into(),
            item_name: item_name.into(),
            local_relative_path: local_relative_path.into(),
            album_name: album_name.into(),
            file_size_bytes,
            downloaded_at: Utc::now(),
        }
    }

    /// The deletion mark recorded when this item's file disappears locally.
    pub fn to_deletion(&self) -> DeletionRecord {
        DeletionRecord {
            item_id: self.item_id.clone(),
            item_name: self.item_name.clone(),
            file_size_bytes: Some(self.file_size_bytes),
            original_path: Some(self.local_relative_path.clone()),
            deleted_at: Utc::now(),
        }
    }
}

/// An item the local user removed and that must not be fetched again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletionRecord {
    pub item_id: String,
    pub item_name: String,
    pub file_size_bytes: Option<u64>,
    pub original_path: Option<String>,
    pub deleted_at: DateTime<Utc>,
}

impl DeletionRecord {
    pub fn new(item_id: impl Into<String>, item_name: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            item_name: item_name.into(),
            file_size_bytes: None,
            original_path: None,
            deleted_at: Utc::now(),
        }
    }
}

/// Statistics for a single sync run. Accumulated in memory and reported at
/// the end of the run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Catalog items evaluated this run.
    pub total_items: u64,
    /// Items transferred (or that would be, in dry-run).
    pub new_downloads: u64,
    /// Items already present under their tracked or target path.
    pub already_exists: u64,
    /// Items skipped because the user deleted them.
    pub skipped_deleted: u64,
    /// Items skipped because a count or byte limit was reached.
    pub skipped_limit: u64,
    /// Tracked items newly found missing and marked deleted.
    pub marked_deleted: u64,
    /// Items left for a later run because the remote side throttled.
    pub throttled: u64,
    pub bytes_transferred: u64,
    pub errors: u64,
    /// The run stopped early because a stop was requested.
    pub interrupted: bool,
}

/// Summary of the current store contents.
#[derive(Debug, Clone)]
pub struct StoreSummary {
    pub downloads: u64,
    pub deletions: u64,
    /// Total bytes across tracked downloads.
    pub tracked_bytes: u64,
    /// Time of the last run start (if any).
    pub last_sync_started: Option<DateTime<Utc>>,
    /// Time of the last completed run (if any).
    pub last_sync_completed: Option<DateTime<Utc>>,
}

/// Render a relative path with `/` separators regardless of platform.
pub fn to_relative_string(path: &Path) -> String {
    let mut out = String::new();
    for component in path.components() {
        if let Component::Normal(part) = component {
            if !out.is_empty() {
                out.push('/');
            }
            out.push_str(&part.to_string_lossy());
        }
    }
    out
}
