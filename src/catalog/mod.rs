//! Remote photo catalog and step-up authentication collaborators.
//!
//! The mirror consumes a catalog through the [`PhotoCatalog`] trait; the
//! remote protocol itself lives behind it. [`DirectoryCatalog`] is the local
//! implementation used by the binary, reading a mounted export tree.

mod directory;
mod error;
mod stepup;
#[cfg(test)]
pub mod testing;

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use directory::DirectoryCatalog;
pub use error::RemoteError;
pub use stepup::{is_valid_code, LineReader, StepUpAuthenticator, TerminalStepUp};

/// Metadata for one remote item as reported by the catalog listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemMetadata {
    pub id: String,
    pub filename: String,
    /// Catalog-reported size in bytes.
    pub size: u64,
    pub album: String,
    pub kind: AlbumKind,
    pub created_at: Option<DateTime<Utc>>,
}

/// Album categories a catalog exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlbumKind {
    Personal,
    Shared,
}

impl std::fmt::Display for AlbumKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlbumKind::Personal => f.write_str("personal"),
            AlbumKind::Shared => f.write_str("shared"),
        }
    }
}

/// Per-category album allow-lists.
///
/// An empty list includes every album of that category; a non-empty list
/// includes only the named albums, compared case-insensitively.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlbumFilters {
    pub personal: Vec<String>,
    pub shared: Vec<String>,
}

impl AlbumFilters {
    pub fn allows(&self, kind: AlbumKind, album: &str) -> bool {
        let list = match kind {
            AlbumKind::Personal => &self.personal,
            AlbumKind::Shared => &self.shared,
        };
        list.is_empty() || list.iter().any(|name| name.eq_ignore_ascii_case(album))
    }
}

/// Remote photo service client.
///
/// Throttling is surfaced as [`RemoteError::Throttled`] from any call.
#[async_trait]
pub trait PhotoCatalog: Send + Sync {
    async fn authenticate(&self) -> Result<(), RemoteError>;

    /// Whether an interactive second factor must be completed before the
    /// catalog can be listed.
    async fn requires_step_up(&self) -> bool;

    /// List items in catalog order, restricted to albums `filters` allows.
    async fn list_items(&self, filters: &AlbumFilters) -> Result<Vec<ItemMetadata>, RemoteError>;

    /// Transfer `item` to `destination`. The file must only appear at
    /// `destination` once complete.
    async fn download(&self, item: &ItemMetadata, destination: &Path) -> Result<(), RemoteError>;

    /// Ask the service to deliver a fresh step-up code.
    async fn request_new_code(&self) -> bool {
        false
    }

    /// Submit a step-up code. Returns `true` once access is granted.
    async fn validate_code(&self, _code: &str) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_filters_allow_everything() {
        let filters = AlbumFilters::default();
        assert!(filters.allows(AlbumKind::Personal, "Anything"));
        assert!(filters.allows(AlbumKind::Shared, "Family"));
    }

    #[test]
    fn test_filters_case_insensitive_per_kind() {
        let filters = AlbumFilters {
            personal: vec!["Trips".to_string()],
            shared: vec![],
        };
        assert!(filters.allows(AlbumKind::Personal, "trips"));
        assert!(!filters.allows(AlbumKind::Personal, "Work"));
        assert!(filters.allows(AlbumKind::Shared, "Work"));
    }
}
