//! Backup rotation, integrity probing and restore for the state store file.
//!
//! Backups are `VACUUM INTO` snapshots written beside the store as
//! `<store>.bak.<UTC timestamp>`, so lexical order is chronological order.

use std::path::{Path, PathBuf};

use chrono::Utc;
use rusqlite::{Connection, OpenFlags};

use super::error::StateError;
use super::schema;

const BACKUP_MARKER: &str = ".bak.";
const CORRUPT_MARKER: &str = ".corrupt.";

fn file_name(db_path: &Path) -> String {
    db_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "state.db".to_string())
}

fn parent_dir(db_path: &Path) -> &Path {
    match db_path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

fn timestamp() -> String {
    Utc::now().format("%Y%m%dT%H%M%S%.6f").to_string()
}

/// Sidecar files SQLite keeps next to a WAL-mode store.
fn sidecars(db_path: &Path) -> [PathBuf; 2] {
    let name = file_name(db_path);
    let dir = parent_dir(db_path);
    [
        dir.join(format!("{}-wal", name)),
        dir.join(format!("{}-shm", name)),
    ]
}

fn remove_sidecars(db_path: &Path) {
    for sidecar in sidecars(db_path) {
        match std::fs::remove_file(&sidecar) {
            Ok(()) => tracing::debug!(path = %sidecar.display(), "Removed stale store sidecar"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %sidecar.display(), error = %e, "Failed to remove store sidecar"),
        }
    }
}

/// Whether SQLite can read every page of the store.
pub(crate) fn quick_check_ok(conn: &Connection) -> bool {
    match conn.query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0)) {
        Ok(result) => result.eq_ignore_ascii_case("ok"),
        Err(e) => {
            tracing::debug!(error = %e, "quick_check failed");
            false
        }
    }
}

/// Whether all tables of the current schema are present.
pub(crate) fn schema_present(conn: &Connection) -> bool {
    schema::REQUIRED_TABLES
        .iter()
        .all(|table| schema::table_exists(conn, table).unwrap_or(false))
}

/// Full structural check: readable and schema present.
pub(crate) fn integrity_ok(conn: &Connection) -> bool {
    quick_check_ok(conn) && schema_present(conn)
}

/// Open a candidate file read-only and check it can serve as a store.
pub(crate) fn is_valid_store(path: &Path) -> bool {
    match Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY) {
        Ok(conn) => integrity_ok(&conn),
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "Cannot open backup");
            false
        }
    }
}

/// All backup artifacts of a store, newest first.
pub(crate) fn list_backups(db_path: &Path) -> Result<Vec<PathBuf>, StateError> {
    let dir = parent_dir(db_path);
    let prefix = format!("{}{}", file_name(db_path), BACKUP_MARKER);

    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StateError::io(dir, e)),
    };

    let mut backups: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            // Skip SQLite journals that may linger beside a snapshot.
            name.starts_with(&prefix) && !name.ends_with("-wal") && !name.ends_with("-shm")
        })
        .map(|entry| entry.path())
        .collect();
    backups.sort();
    backups.reverse();
    Ok(backups)
}

/// Snapshot the live store into a new backup artifact.
pub(crate) fn write_backup(conn: &Connection, db_path: &Path) -> Result<PathBuf, StateError> {
    // Fold the WAL into the main file first so the live store stays compact.
    if let Err(e) = conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(())) {
        tracing::debug!(error = %e, "WAL checkpoint before backup failed");
    }

    let dir = parent_dir(db_path);
    let base = format!("{}{}{}", file_name(db_path), BACKUP_MARKER, timestamp());
    let mut target = dir.join(&base);
    let mut n = 1;
    while target.exists() {
        target = dir.join(format!("{}-{}", base, n));
        n += 1;
    }

    conn.execute("VACUUM INTO ?1", [target.to_string_lossy().into_owned()])
        .map_err(|e| StateError::Backup(format!("{}: {}", target.display(), e)))?;

    tracing::debug!(path = %target.display(), "Wrote state store backup");
    Ok(target)
}

/// Delete the oldest backups so that at most `max_backups` remain.
///
/// `max_backups` is clamped to at least one; a store must always keep a
/// recovery point.
pub(crate) fn prune_backups(db_path: &Path, max_backups: usize) -> Result<usize, StateError> {
    let keep = max_backups.max(1);
    let backups = list_backups(db_path)?;
    let mut removed = 0;
    for old in backups.iter().skip(keep) {
        std::fs::remove_file(old).map_err(|e| StateError::io(old, e))?;
        tracing::debug!(path = %old.display(), "Pruned old backup");
        removed += 1;
    }
    Ok(removed)
}

/// The newest backup that passes the integrity check, if any.
pub(crate) fn newest_valid_backup(db_path: &Path) -> Result<Option<PathBuf>, StateError> {
    for candidate in list_backups(db_path)? {
        if is_valid_store(&candidate) {
            return Ok(Some(candidate));
        }
        tracing::warn!(path = %candidate.display(), "Skipping invalid backup");
    }
    Ok(None)
}

/// Replace the store file with a copy of `backup`.
///
/// The copy goes to a temporary file first and is renamed into place, so a
/// crash mid-restore never leaves a half-written store. Stale WAL/SHM files
/// are removed so they are not replayed on top of the restored snapshot.
pub(crate) fn restore(db_path: &Path, backup: &Path) -> Result<(), StateError> {
    let staging = parent_dir(db_path).join(format!("{}.restore", file_name(db_path)));
    std::fs::copy(backup, &staging).map_err(|e| StateError::io(&staging, e))?;
    remove_sidecars(db_path);
    std::fs::rename(&staging, db_path).map_err(|e| StateError::io(db_path, e))?;
    Ok(())
}

/// Move a corrupted store out of the way, keeping it for inspection.
pub(crate) fn quarantine(db_path: &Path) -> Result<PathBuf, StateError> {
    let target = parent_dir(db_path).join(format!(
        "{}{}{}",
        file_name(db_path),
        CORRUPT_MARKER,
        timestamp()
    ));
    std::fs::rename(db_path, &target).map_err(|e| StateError::io(db_path, e))?;
    remove_sidecars(db_path);
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn test_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join("photomirror")
            .join("backup_tests")
            .join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn seeded_store(path: &Path) -> Connection {
        let conn = Connection::open(path).unwrap();
        schema::migrate(&conn).unwrap();
        conn
    }

    #[test]
    fn test_write_and_list_backups() {
        let dir = test_dir("write_list");
        let db = dir.join("state.db");
        let conn = seeded_store(&db);

        let first = write_backup(&conn, &db).unwrap();
        let second = write_backup(&conn, &db).unwrap();

        let backups = list_backups(&db).unwrap();
        assert_eq!(backups.len(), 2);
        assert_eq!(backups[0], second);
        assert_eq!(backups[1], first);
        assert!(is_valid_store(&first));
    }

    #[test]
    fn test_prune_keeps_newest() {
        let dir = test_dir("prune");
        let db = dir.join("state.db");
        let conn = seeded_store(&db);

        for _ in 0..4 {
            write_backup(&conn, &db).unwrap();
        }
        let newest = list_backups(&db).unwrap()[0].clone();

        let removed = prune_backups(&db, 2).unwrap();
        assert_eq!(removed, 2);
        let remaining = list_backups(&db).unwrap();
        assert_eq!(remaining.len(), 2);
        assert_eq!(remaining[0], newest);
    }

    #[test]
    fn test_prune_zero_keeps_one() {
        let dir = test_dir("prune_zero");
        let db = dir.join("state.db");
        let conn = seeded_store(&db);
        write_backup(&conn, &db).unwrap();
        write_backup(&conn, &db).unwrap();

        prune_backups(&db, 0).unwrap();
        assert_eq!(list_backups(&db).unwrap().len(), 1);
    }

    #[test]
    fn test_newest_valid_skips_garbage() {
        let dir = test_dir("newest_valid");
        let db = dir.join("state.db");
        let conn = seeded_store(&db);
        let good = write_backup(&conn, &db).unwrap();

        // Lexically newer than the good snapshot.
        let bad = dir.join("state.db.bak.99999999T999999.999999");
        fs::write(&bad, b"this is not a database").unwrap();

        assert_eq!(newest_valid_backup(&db).unwrap(), Some(good));
    }

    #[test]
    fn test_list_ignores_other_files() {
        let dir = test_dir("list_other");
        let db = dir.join("state.db");
        fs::write(dir.join("other.db.bak.1"), b"x").unwrap();
        fs::write(dir.join("state.db-wal"), b"x").unwrap();
        assert!(list_backups(&db).unwrap().is_empty());
    }

    #[test]
    fn test_restore_replaces_store_and_drops_sidecars() {
        let dir = test_dir("restore");
        let db = dir.join("state.db");
        let conn = seeded_store(&db);
        let snapshot = write_backup(&conn, &db).unwrap();
        drop(conn);

        fs::write(&db, b"garbage").unwrap();
        fs::write(dir.join("state.db-wal"), b"stale").unwrap();

        restore(&db, &snapshot).unwrap();
        assert!(is_valid_store(&db));
        assert!(!dir.join("state.db-wal").exists());
    }

    #[test]
    fn test_quarantine_moves_file() {
        let dir = test_dir("quarantine");
        let db = dir.join("state.db");
        fs::write(&db, b"garbage").unwrap();

        let moved = quarantine(&db).unwrap();
        assert!(!db.exists());
        assert!(moved.exists());
        assert!(moved
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("state.db.corrupt."));
    }

    #[test]
    fn test_garbage_fails_integrity() {
        let dir = test_dir("garbage");
        let db = dir.join("state.db");
        fs::write(&db, vec![0xAB; 8192]).unwrap();
        assert!(!is_valid_store(&db));
    }
}
