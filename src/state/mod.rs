//! Persistent sync state.
//!
//! This module provides SQLite-based tracking of what the mirror has fetched
//! and what the user deliberately removed. It enables:
//! - Skipping items already downloaded or deleted
//! - Deletion detection against the local tree
//! - Backup rotation and corruption recovery
//! - Status reporting

mod backup;
pub mod db;
pub mod error;
pub mod schema;
pub mod types;

pub use db::{SqliteStateStore, StateStore};
pub use error::StateError;
pub use types::{to_relative_string, DeletionRecord, DownloadRecord, StoreSummary, SyncStats};
