//! State store trait and SQLite implementation.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, OpenFlags, OptionalExtension};

use super::backup;
use super::error::StateError;
use super::schema;
use super::types::{DeletionRecord, DownloadRecord, StoreSummary, SyncStats};

/// Trait for state store operations.
///
/// This trait is object-safe and can be used with `Arc<dyn StateStore>` for
/// shared access across async tasks. Each operation is individually atomic;
/// callers serialize writers themselves (see `scheduler::SyncGate`).
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Insert or replace a download record.
    ///
    /// A row conflicting on `item_id` or on `(item_name, album_name)` is
    /// replaced. Fails with `StateError::Query` if the medium is unwritable.
    async fn record_download(&self, record: &DownloadRecord) -> Result<(), StateError>;

    /// Insert a deletion record keyed by `item_id`. Idempotent: a duplicate
    /// replaces size and path but keeps the original identity and timestamp.
    async fn record_deletion(&self, record: &DeletionRecord) -> Result<(), StateError>;

    async fn is_deleted(&self, item_id: &str) -> Result<bool, StateError>;

    /// Legacy compatibility lookup by display name.
    async fn is_deleted_by_name(&self, item_name: &str) -> Result<bool, StateError>;

    async fn list_downloads(&self) -> Result<HashMap<String, DownloadRecord>, StateError>;

    async fn list_deletions(&self) -> Result<Vec<DeletionRecord>, StateError>;

    /// Download records whose file no longer resolves under `root`,
    /// excluding items already marked deleted.
    async fn detect_locally_missing(&self, root: &Path)
        -> Result<Vec<DownloadRecord>, StateError>;

    /// Record a deletion for every record of a detection result, in one
    /// transaction. Returns the number of records marked.
    async fn mark_missing_as_deleted(&self, records: &[DownloadRecord])
        -> Result<usize, StateError>;

    /// Remove a deletion record so the item may be fetched again.
    async fn remove_deletion(&self, item_id: &str) -> Result<bool, StateError>;

    /// Explicitly purge a download record from history.
    async fn purge_download(&self, item_id: &str) -> Result<bool, StateError>;

    /// Whether the store is readable and its schema present.
    async fn check_integrity(&self) -> bool;

    /// Snapshot the store into a new backup, pruning the oldest beyond
    /// `max_backups`. Returns the path of the new backup.
    async fn create_backup(&self, max_backups: usize) -> Result<PathBuf, StateError>;

    /// Replace the live store with the newest valid backup. Fails with
    /// `StateError::Unrecoverable` when there is none.
    async fn recover_from_backup(&self) -> Result<PathBuf, StateError>;

    async fn summary(&self) -> Result<StoreSummary, StateError>;

    /// Start a new sync run and return its ID.
    async fn start_sync_run(&self) -> Result<i64, StateError>;

    /// Complete a sync run with statistics.
    async fn complete_sync_run(&self, run_id: i64, stats: &SyncStats) -> Result<(), StateError>;
}

/// SQLite implementation of the state store.
pub struct SqliteStateStore {
    /// Wrapped in Mutex because rusqlite::Connection is not Sync.
    /// Replaced wholesale when the store is restored from a backup.
    conn: Mutex<Connection>,
    /// Path to the store file; `None` for in-memory stores.
    path: Option<PathBuf>,
}

impl std::fmt::Debug for SqliteStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStateStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// Open a store file with the connection settings every caller expects and
/// bring its schema up to date.
fn open_configured(path: &Path) -> Result<Connection, StateError> {
    let conn = Connection::open(path).map_err(|e| StateError::Open {
        path: path.to_path_buf(),
        source: e,
    })?;

    // WAL keeps readers (status, verify) from blocking the syncing writer.
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
        row.get::<_, String>(0)
    })
    .map_err(StateError::Migration)?;
    conn.pragma_update(None, "synchronous", "NORMAL")
        .map_err(StateError::Migration)?;
    conn.busy_timeout(Duration::from_secs(5))
        .map_err(StateError::Migration)?;

    schema::migrate(&conn)?;
    Ok(conn)
}

impl SqliteStateStore {
    /// Open or create a store at the given path, running
    /// [`ensure_safety`](Self::ensure_safety) first.
    pub async fn open(path: &Path, max_backups: usize) -> Result<Self, StateError> {
        let path = path.to_path_buf();
        let path_clone = path.clone();

        let conn =
            tokio::task::spawn_blocking(move || Self::ensure_safety(&path_clone, max_backups))
                .await??;

        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path),
        })
    }

    /// Construction-time safety routine.
    ///
    /// - store absent: initialize an empty schema;
    /// - store unreadable: restore the newest valid backup, or, when no backup
    ///   artifact exists at all, quarantine the file and start empty;
    /// - backups present but none valid: `StateError::Unrecoverable`.
    ///
    /// Always finishes with a fresh backup.
    pub fn ensure_safety(path: &Path, max_backups: usize) -> Result<Connection, StateError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| StateError::io(parent, e))?;
        }

        if path.exists() {
            let healthy = match Connection::open(path) {
                Ok(conn) => backup::quick_check_ok(&conn),
                Err(_) => false,
            };
            if !healthy {
                tracing::error!(path = %path.display(), "State store failed integrity check");
                Self::replace_damaged(path)?;
            }
        } else {
            tracing::info!(path = %path.display(), "Creating new state store");
        }

        // Readable pages are not enough: after migration every table of the
        // current schema must be present too.
        let mut conn = open_configured(path)?;
        if !backup::schema_present(&conn) {
            tracing::error!(path = %path.display(), "State store is missing schema tables");
            drop(conn);
            Self::replace_damaged(path)?;
            conn = open_configured(path)?;
        }

        backup::write_backup(&conn, path)?;
        backup::prune_backups(path, max_backups)?;
        Ok(conn)
    }

    /// Restore the newest valid backup over a damaged store, or quarantine it
    /// when no backup artifact exists at all.
    fn replace_damaged(path: &Path) -> Result<(), StateError> {
        if backup::list_backups(path)?.is_empty() {
            let moved = backup::quarantine(path)?;
            tracing::error!(
                quarantined = %moved.display(),
                "No backup available; starting with an empty state store"
            );
            return Ok(());
        }

        let source = backup::newest_valid_backup(path)?.ok_or_else(|| StateError::Unrecoverable {
            path: path.to_path_buf(),
            reason: "no valid backup found".to_string(),
        })?;
        backup::restore(path, &source)?;
        tracing::warn!(backup = %source.display(), "Recovered state store from backup");
        Ok(())
    }

    /// Open an existing store for reporting, without recovery, migration or
    /// backups.
    pub async fn open_read_only(path: &Path) -> Result<Self, StateError> {
        let path = path.to_path_buf();
        let path_clone = path.clone();

        let conn = tokio::task::spawn_blocking(move || {
            let conn = Connection::open_with_flags(&path_clone, OpenFlags::SQLITE_OPEN_READ_ONLY)
                .map_err(|e| StateError::Open {
                    path: path_clone.clone(),
                    source: e,
                })?;
            let version = schema::get_schema_version(&conn)?;
            if version != schema::SCHEMA_VERSION {
                return Err(StateError::Query(format!(
                    "store schema version {} needs migration (expected {}); run a sync first",
                    version,
                    schema::SCHEMA_VERSION
                )));
            }
            Ok(conn)
        })
        .await??;

        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path),
        })
    }

    /// Open an in-memory store (for testing).
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StateError> {
        let conn = Connection::open_in_memory().map_err(|e| StateError::Open {
            path: PathBuf::from(":memory:"),
            source: e,
        })?;
        schema::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    /// Get the path to the store file.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StateError> {
        self.conn
            .lock()
            .map_err(|e| StateError::Query(e.to_string()))
    }

    fn file_path(&self) -> Result<&Path, StateError> {
        self.path
            .as_deref()
            .ok_or_else(|| StateError::Backup("in-memory stores have no backups".to_string()))
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn record_download(&self, record: &DownloadRecord) -> Result<(), StateError> {
        let conn = self.conn()?;

        conn.execute(
            r#"
            INSERT OR REPLACE INTO downloads (item_id, item_name, album_name, local_path, size_bytes, downloaded_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            rusqlite::params![
                &record.item_id,
                &record.item_name,
                &record.album_name,
                &record.local_relative_path,
                record.file_size_bytes as i64,
                record.downloaded_at.timestamp(),
            ],
        )
        .map_err(StateError::query)?;

        Ok(())
    }

    async fn record_deletion(&self, record: &DeletionRecord) -> Result<(), StateError> {
        let conn = self.conn()?;
        upsert_deletion(&conn, record).map_err(StateError::query)?;
        Ok(())
    }

    async fn is_deleted(&self, item_id: &str) -> Result<bool, StateError> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM deletions WHERE item_id = ?1)",
            [item_id],
            |row| row.get(0),
        )
        .map_err(StateError::query)
    }

    async fn is_deleted_by_name(&self, item_name: &str) -> Result<bool, StateError> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM deletions WHERE item_name = ?1)",
            [item_name],
            |row| row.get(0),
        )
        .map_err(StateError::query)
    }

    async fn list_downloads(&self) -> Result<HashMap<String, DownloadRecord>, StateError> {
        let conn = self.conn()?;
        let records = select_downloads(&conn).map_err(StateError::query)?;
        Ok(records
            .into_iter()
            .map(|r| (r.item_id.clone(), r))
            .collect())
    }

    async fn list_deletions(&self) -> Result<Vec<DeletionRecord>, StateError> {
        let conn = self.conn()?;

        let mut stmt = conn
            .prepare(
                "SELECT item_id, item_name, size_bytes, original_path, deleted_at FROM deletions ORDER BY deleted_at, item_id",
            )
            .map_err(StateError::query)?;

        let records = stmt
            .query_map([], row_to_deletion_record)
            .map_err(StateError::query)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StateError::query)?;

        Ok(records)
    }

    async fn detect_locally_missing(
        &self,
        root: &Path,
    ) -> Result<Vec<DownloadRecord>, StateError> {
        // Query in a separate scope so the MutexGuard is dropped before any await
        let (downloads, deleted): (Vec<DownloadRecord>, HashSet<String>) = {
            let conn = self.conn()?;
            let downloads = select_downloads(&conn).map_err(StateError::query)?;
            let mut stmt = conn
                .prepare_cached("SELECT item_id FROM deletions")
                .map_err(StateError::query)?;
            let deleted = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(StateError::query)?
                .collect::<Result<HashSet<_>, _>>()
                .map_err(StateError::query)?;
            (downloads, deleted)
        };

        let mut missing = Vec::new();
        for record in downloads {
            if deleted.contains(&record.item_id) {
                continue;
            }
            let path = root.join(&record.local_relative_path);
            match tokio::fs::try_exists(&path).await {
                Ok(true) => {}
                Ok(false) => missing.push(record),
                Err(e) => {
                    // An unreadable path is not proof of deletion.
                    tracing::warn!(
                        item_id = %record.item_id,
                        path = %path.display(),
                        error = %e,
                        "Failed to check file existence, assuming present"
                    );
                }
            }
        }

        Ok(missing)
    }

    async fn mark_missing_as_deleted(
        &self,
        records: &[DownloadRecord],
    ) -> Result<usize, StateError> {
        if records.is_empty() {
            return Ok(0);
        }

        let conn = self.conn()?;

        // Use a transaction for atomicity and better performance
        conn.execute("BEGIN TRANSACTION", [])
            .map_err(StateError::query)?;

        let result = (|| {
            for record in records {
                upsert_deletion(&conn, &record.to_deletion()).map_err(StateError::query)?;
            }
            Ok::<_, StateError>(())
        })();

        match result {
            Ok(()) => {
                conn.execute("COMMIT", []).map_err(StateError::query)?;
                Ok(records.len())
            }
            Err(e) => {
                let _ = conn.execute("ROLLBACK", []);
                Err(e)
            }
        }
    }

    async fn remove_deletion(&self, item_id: &str) -> Result<bool, StateError> {
        let conn = self.conn()?;
        let rows = conn
            .execute("DELETE FROM deletions WHERE item_id = ?1", [item_id])
            .map_err(StateError::query)?;
        Ok(rows > 0)
    }

    async fn purge_download(&self, item_id: &str) -> Result<bool, StateError> {
        let conn = self.conn()?;
        let rows = conn
            .execute("DELETE FROM downloads WHERE item_id = ?1", [item_id])
            .map_err(StateError::query)?;
        Ok(rows > 0)
    }

    async fn check_integrity(&self) -> bool {
        match self.conn() {
            Ok(conn) => backup::integrity_ok(&conn),
            Err(e) => {
                tracing::error!(error = %e, "State store connection unusable");
                false
            }
        }
    }

    async fn create_backup(&self, max_backups: usize) -> Result<PathBuf, StateError> {
        let path = self.file_path()?;
        let conn = self.conn()?;
        let target = backup::write_backup(&conn, path)?;
        let pruned = backup::prune_backups(path, max_backups)?;
        tracing::info!(
            backup = %target.display(),
            pruned,
            "Created state store backup"
        );
        Ok(target)
    }

    async fn recover_from_backup(&self) -> Result<PathBuf, StateError> {
        let path = self.file_path()?;
        let mut conn = self.conn()?;

        let source = backup::newest_valid_backup(path)?.ok_or_else(|| StateError::Unrecoverable {
            path: path.to_path_buf(),
            reason: "no valid backup found".to_string(),
        })?;

        // Close the live handle before the file underneath it is replaced.
        let placeholder = Connection::open_in_memory().map_err(StateError::query)?;
        let old = std::mem::replace(&mut *conn, placeholder);
        if let Err((_, e)) = old.close() {
            tracing::warn!(error = %e, "Closing corrupted store handle failed");
        }

        let restored = backup::restore(path, &source).and_then(|()| open_configured(path));
        match restored {
            Ok(fresh) => {
                *conn = fresh;
                tracing::warn!(backup = %source.display(), "Restored state store from backup");
                Ok(source)
            }
            Err(e) => {
                // Keep serving the on-disk store if it can still be opened.
                if let Ok(reopened) = open_configured(path) {
                    *conn = reopened;
                }
                Err(e)
            }
        }
    }

    async fn summary(&self) -> Result<StoreSummary, StateError> {
        let conn = self.conn()?;

        let (downloads, tracked_bytes): (i64, i64) = conn
            .query_row(
                "SELECT COUNT(*), COALESCE(SUM(size_bytes), 0) FROM downloads",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(StateError::query)?;

        let deletions: i64 = conn
            .query_row("SELECT COUNT(*) FROM deletions", [], |row| row.get(0))
            .map_err(StateError::query)?;

        let last_sync: Option<(Option<i64>, Option<i64>)> = conn
            .query_row(
                "SELECT started_at, completed_at FROM sync_runs ORDER BY id DESC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(StateError::query)?;

        let (last_sync_started, last_sync_completed) = match last_sync {
            Some((started, completed)) => (
                started.and_then(from_timestamp),
                completed.and_then(from_timestamp),
            ),
            None => (None, None),
        };

        Ok(StoreSummary {
            downloads: downloads as u64,
            deletions: deletions as u64,
            tracked_bytes: tracked_bytes as u64,
            last_sync_started,
            last_sync_completed,
        })
    }

    async fn start_sync_run(&self) -> Result<i64, StateError> {
        let started_at = Utc::now().timestamp();
        let conn = self.conn()?;

        conn.execute(
            "INSERT INTO sync_runs (started_at) VALUES (?1)",
            [started_at],
        )
        .map_err(StateError::query)?;

        Ok(conn.last_insert_rowid())
    }

    async fn complete_sync_run(&self, run_id: i64, stats: &SyncStats) -> Result<(), StateError> {
        let completed_at = Utc::now().timestamp();
        let conn = self.conn()?;

        conn.execute(
            r#"
            UPDATE sync_runs SET completed_at = ?1, items_seen = ?2, items_downloaded = ?3,
                items_marked_deleted = ?4, bytes_downloaded = ?5, errors = ?6, interrupted = ?7
            WHERE id = ?8
            "#,
            rusqlite::params![
                completed_at,
                stats.total_items as i64,
                stats.new_downloads as i64,
                stats.marked_deleted as i64,
                stats.bytes_transferred as i64,
                stats.errors as i64,
                stats.interrupted as i64,
                run_id
            ],
        )
        .map_err(StateError::query)?;

        Ok(())
    }
}

fn upsert_deletion(conn: &Connection, record: &DeletionRecord) -> rusqlite::Result<usize> {
    conn.execute(
        r#"
        INSERT INTO deletions (item_id, item_name, size_bytes, original_path, deleted_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ON CONFLICT(item_id) DO UPDATE SET
            size_bytes = excluded.size_bytes,
            original_path = excluded.original_path
        "#,
        rusqlite::params![
            &record.item_id,
            &record.item_name,
            record.file_size_bytes.map(|s| s as i64),
            &record.original_path,
            record.deleted_at.timestamp(),
        ],
    )
}

fn select_downloads(conn: &Connection) -> rusqlite::Result<Vec<DownloadRecord>> {
    let mut stmt = conn.prepare_cached(
        "SELECT item_id, item_name, album_name, local_path, size_bytes, downloaded_at FROM downloads",
    )?;
    let records = stmt
        .query_map([], row_to_download_record)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(records)
}

fn from_timestamp(ts: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(ts, 0).single()
}

/// Convert a row to a DownloadRecord.
fn row_to_download_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<DownloadRecord> {
    let size_bytes: i64 = row.get(4)?;
    let downloaded_at: i64 = row.get(5)?;
    Ok(DownloadRecord {
        item_id: row.get(0)?,
        item_name: row.get(1)?,
        album_name: row.get(2)?,
        local_relative_path: row.get(3)?,
        file_size_bytes: size_bytes.max(0) as u64,
        downloaded_at: from_timestamp(downloaded_at).unwrap_or(DateTime::UNIX_EPOCH),
    })
}

/// Convert a row to a DeletionRecord.
fn row_to_deletion_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<DeletionRecord> {
    let size_bytes: Option<i64> = row.get(2)?;
    let deleted_at: i64 = row.get(4)?;
    Ok(DeletionRecord {
        item_id: row.get(0)?,
        item_name: row.get(1)?,
        file_size_bytes: size_bytes.map(|s| s.max(0) as u64),
        original_path: row.get(3)?,
        deleted_at: from_timestamp(deleted_at).unwrap_or(DateTime::UNIX_EPOCH),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn test_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join("photomirror")
            .join("state_db_tests")
            .join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn record(id: &str, name: &str, album: &str) -> DownloadRecord {
        DownloadRecord::new(id, name, album, format!("{}/{}", album, name), 100)
    }

    #[tokio::test]
    async fn test_open_creates_store_and_backup() {
        let dir = test_dir("open_creates");
        let path = dir.join("test.db");
        let store = SqliteStateStore::open(&path, 3).await.unwrap();
        assert!(path.exists());
        assert_eq!(store.path(), Some(path.as_path()));
        assert_eq!(backup::list_backups(&path).unwrap().len(), 1);
        assert!(store.check_integrity().await);
    }

    #[tokio::test]
    async fn test_record_and_list_downloads() {
        let store = SqliteStateStore::open_in_memory().unwrap();
        store
            .record_download(&record("ID1", "a.jpg", "Trips"))
            .await
            .unwrap();

        let downloads = store.list_downloads().await.unwrap();
        assert_eq!(downloads.len(), 1);
        let stored = &downloads["ID1"];
        assert_eq!(stored.item_name, "a.jpg");
        assert_eq!(stored.album_name, "Trips");
        assert_eq!(stored.local_relative_path, "Trips/a.jpg");
        assert_eq!(stored.file_size_bytes, 100);
    }

    #[tokio::test]
    async fn test_same_name_in_different_albums() {
        let store = SqliteStateStore::open_in_memory().unwrap();
        store
            .record_download(&record("ID1", "IMG_0001.jpg", "Trips"))
            .await
            .unwrap();
        store
            .record_download(&record("ID2", "IMG_0001.jpg", "Family"))
            .await
            .unwrap();
        assert_eq!(store.list_downloads().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_name_album_conflict_replaces_row() {
        let store = SqliteStateStore::open_in_memory().unwrap();
        store
            .record_download(&record("OLD", "a.jpg", "Trips"))
            .await
            .unwrap();
        store
            .record_download(&record("NEW", "a.jpg", "Trips"))
            .await
            .unwrap();

        let downloads = store.list_downloads().await.unwrap();
        assert_eq!(downloads.len(), 1);
        assert!(downloads.contains_key("NEW"));
    }

    #[tokio::test]
    async fn test_record_deletion_idempotent_keeps_identity() {
        let store = SqliteStateStore::open_in_memory().unwrap();
        let mut first = DeletionRecord::new("ID1", "a.jpg");
        first.deleted_at = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        store.record_deletion(&first).await.unwrap();

        let mut second = DeletionRecord::new("ID1", "renamed.jpg");
        second.file_size_bytes = Some(77);
        second.original_path = Some("Trips/a.jpg".to_string());
        store.record_deletion(&second).await.unwrap();

        let deletions = store.list_deletions().await.unwrap();
        assert_eq!(deletions.len(), 1);
        assert_eq!(deletions[0].item_name, "a.jpg");
        assert_eq!(deletions[0].file_size_bytes, Some(77));
        assert_eq!(deletions[0].original_path.as_deref(), Some("Trips/a.jpg"));
        assert_eq!(deletions[0].deleted_at.timestamp(), 1_700_000_000);
    }

    #[tokio::test]
    async fn test_is_deleted_and_by_name() {
        let store = SqliteStateStore::open_in_memory().unwrap();
        assert!(!store.is_deleted("ID1").await.unwrap());
        store
            .record_deletion(&DeletionRecord::new("ID1", "a.jpg"))
            .await
            .unwrap();
        assert!(store.is_deleted("ID1").await.unwrap());
        assert!(store.is_deleted_by_name("a.jpg").await.unwrap());
        assert!(!store.is_deleted_by_name("b.jpg").await.unwrap());
    }

    #[tokio::test]
    async fn test_detect_locally_missing() {
        let dir = test_dir("detect_missing");
        fs::create_dir_all(dir.join("Trips")).unwrap();
        fs::write(dir.join("Trips/present.jpg"), b"x").unwrap();

        let store = SqliteStateStore::open_in_memory().unwrap();
        store
            .record_download(&record("P", "present.jpg", "Trips"))
            .await
            .unwrap();
        store
            .record_download(&record("M", "missing.jpg", "Trips"))
            .await
            .unwrap();
        store
            .record_download(&record("D", "already.jpg", "Trips"))
            .await
            .unwrap();
        store
            .record_deletion(&DeletionRecord::new("D", "already.jpg"))
            .await
            .unwrap();

        let missing = store.detect_locally_missing(&dir).await.unwrap();
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].item_id, "M");
    }

    #[tokio::test]
    async fn test_mark_missing_as_deleted() {
        let store = SqliteStateStore::open_in_memory().unwrap();
        let records = vec![record("A", "a.jpg", "X"), record("B", "b.jpg", "X")];
        assert_eq!(store.mark_missing_as_deleted(&records).await.unwrap(), 2);
        assert!(store.is_deleted("A").await.unwrap());
        assert!(store.is_deleted("B").await.unwrap());

        let deletions = store.list_deletions().await.unwrap();
        assert!(deletions
            .iter()
            .all(|d| d.original_path.as_deref().unwrap().starts_with("X/")));
        assert_eq!(store.mark_missing_as_deleted(&[]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_remove_deletion_and_purge() {
        let store = SqliteStateStore::open_in_memory().unwrap();
        store
            .record_deletion(&DeletionRecord::new("ID1", "a.jpg"))
            .await
            .unwrap();
        assert!(store.remove_deletion("ID1").await.unwrap());
        assert!(!store.remove_deletion("ID1").await.unwrap());
        assert!(!store.is_deleted("ID1").await.unwrap());

        store
            .record_download(&record("ID2", "b.jpg", "X"))
            .await
            .unwrap();
        assert!(store.purge_download("ID2").await.unwrap());
        assert!(store.list_downloads().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sync_run_summary() {
        let store = SqliteStateStore::open_in_memory().unwrap();
        store
            .record_download(&record("ID1", "a.jpg", "X"))
            .await
            .unwrap();
        store
            .record_deletion(&DeletionRecord::new("ID9", "z.jpg"))
            .await
            .unwrap();

        let run = store.start_sync_run().await.unwrap();
        let stats = SyncStats {
            total_items: 3,
            new_downloads: 1,
            ..Default::default()
        };
        store.complete_sync_run(run, &stats).await.unwrap();

        let summary = store.summary().await.unwrap();
        assert_eq!(summary.downloads, 1);
        assert_eq!(summary.deletions, 1);
        assert_eq!(summary.tracked_bytes, 100);
        assert!(summary.last_sync_started.is_some());
        assert!(summary.last_sync_completed.is_some());
    }

    #[tokio::test]
    async fn test_in_memory_store_cannot_backup() {
        let store = SqliteStateStore::open_in_memory().unwrap();
        assert!(matches!(
            store.create_backup(3).await,
            Err(StateError::Backup(_))
        ));
    }

    #[tokio::test]
    async fn test_create_backup_rotates() {
        let dir = test_dir("rotate");
        let path = dir.join("test.db");
        let store = SqliteStateStore::open(&path, 2).await.unwrap();
        store.create_backup(2).await.unwrap();
        store.create_backup(2).await.unwrap();
        assert_eq!(backup::list_backups(&path).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_recovery_restores_records_from_backup() {
        let dir = test_dir("recover_with_backup");
        let path = dir.join("test.db");
        {
            let store = SqliteStateStore::open(&path, 3).await.unwrap();
            store
                .record_download(&record("ID1", "a.jpg", "Trips"))
                .await
                .unwrap();
            store.create_backup(3).await.unwrap();
        }

        fs::write(&path, vec![0x5A; 16384]).unwrap();

        let store = SqliteStateStore::open(&path, 3).await.unwrap();
        assert!(store.check_integrity().await);
        let downloads = store.list_downloads().await.unwrap();
        assert!(downloads.contains_key("ID1"));
    }

    #[tokio::test]
    async fn test_recovery_without_backup_starts_empty() {
        let dir = test_dir("recover_without_backup");
        let path = dir.join("test.db");
        fs::write(&path, b"definitely not sqlite").unwrap();

        let store = SqliteStateStore::open(&path, 3).await.unwrap();
        assert!(store.check_integrity().await);
        assert!(store.list_downloads().await.unwrap().is_empty());

        // The corrupted file is kept aside for inspection.
        let quarantined = fs::read_dir(&dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .any(|e| e.file_name().to_string_lossy().contains(".corrupt."));
        assert!(quarantined);

        store
            .record_download(&record("ID1", "a.jpg", "Trips"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_missing_table_restored_from_backup_on_open() {
        let dir = test_dir("missing_table");
        let path = dir.join("test.db");
        {
            let store = SqliteStateStore::open(&path, 3).await.unwrap();
            store
                .record_download(&record("ID1", "a.jpg", "Trips"))
                .await
                .unwrap();
            store.create_backup(3).await.unwrap();
        }
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch("DROP TABLE deletions").unwrap();
            assert!(backup::quick_check_ok(&conn));
        }

        let store = SqliteStateStore::open(&path, 3).await.unwrap();
        assert!(store.check_integrity().await);
        assert!(!store.is_deleted("ID1").await.unwrap());
        assert!(store.list_downloads().await.unwrap().contains_key("ID1"));

        // The damaged schema was never snapshotted.
        for snapshot in backup::list_backups(&path).unwrap() {
            assert!(backup::is_valid_store(&snapshot));
        }
    }

    #[tokio::test]
    async fn test_all_backups_invalid_is_unrecoverable() {
        let dir = test_dir("unrecoverable");
        let path = dir.join("test.db");
        fs::write(&path, b"corrupt").unwrap();
        fs::write(dir.join("test.db.bak.20240101T000000.000000"), b"also corrupt").unwrap();

        let result = SqliteStateStore::open(&path, 3).await;
        assert!(matches!(result, Err(StateError::Unrecoverable { .. })));
    }

    #[tokio::test]
    async fn test_recover_from_backup_on_live_store() {
        let dir = test_dir("recover_live");
        let path = dir.join("test.db");
        let store = SqliteStateStore::open(&path, 3).await.unwrap();
        store
            .record_download(&record("ID1", "a.jpg", "Trips"))
            .await
            .unwrap();
        store.create_backup(3).await.unwrap();
        store
            .record_download(&record("ID2", "b.jpg", "Trips"))
            .await
            .unwrap();

        store.recover_from_backup().await.unwrap();

        let downloads = store.list_downloads().await.unwrap();
        assert!(downloads.contains_key("ID1"));
        assert!(!downloads.contains_key("ID2"));
    }

    #[tokio::test]
    async fn test_legacy_store_file_is_upgraded_on_open() {
        let dir = test_dir("legacy_open");
        let path = dir.join("test.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(schema::LEGACY_SCHEMA_V1).unwrap();
            conn.execute(
                "INSERT INTO downloaded_photos VALUES ('L1', 'old.jpg', 'Album/old.jpg', 5, 1700000000)",
                [],
            )
            .unwrap();
        }

        let store = SqliteStateStore::open(&path, 3).await.unwrap();
        let downloads = store.list_downloads().await.unwrap();
        assert_eq!(downloads["L1"].album_name, "Album");
        assert!(store.check_integrity().await);
    }
}
