//! Store schema definitions and migrations.

use rusqlite::Connection;

use super::error::StateError;

/// Current schema version. Increment when making schema changes.
pub const SCHEMA_VERSION: i32 = 2;

/// Version assigned to the pre-album-aware layout. Stores written by that
/// layout never set `user_version`, so it is recognised by shape.
pub const LEGACY_SCHEMA_VERSION: i32 = 1;

/// Schema DDL for version 2 (album-aware).
const SCHEMA_V2: &str = r#"
CREATE TABLE IF NOT EXISTS downloads (
    item_id TEXT PRIMARY KEY NOT NULL,
    item_name TEXT NOT NULL,
    album_name TEXT NOT NULL,
    local_path TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    downloaded_at INTEGER NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_downloads_name_album ON downloads(item_name, album_name);
CREATE INDEX IF NOT EXISTS idx_downloads_local_path ON downloads(local_path);

CREATE TABLE IF NOT EXISTS deletions (
    item_id TEXT PRIMARY KEY NOT NULL,
    item_name TEXT NOT NULL,
    size_bytes INTEGER,
    original_path TEXT,
    deleted_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_deletions_item_name ON deletions(item_name);

CREATE TABLE IF NOT EXISTS sync_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    started_at INTEGER NOT NULL,
    completed_at INTEGER,
    items_seen INTEGER DEFAULT 0,
    items_downloaded INTEGER DEFAULT 0,
    items_marked_deleted INTEGER DEFAULT 0,
    bytes_downloaded INTEGER DEFAULT 0,
    errors INTEGER DEFAULT 0,
    interrupted INTEGER DEFAULT 0
);
"#;

/// Schema DDL of the legacy layout, kept so tests can build old stores.
#[cfg(test)]
pub(crate) const LEGACY_SCHEMA_V1: &str = r#"
CREATE TABLE downloaded_photos (
    photo_id TEXT PRIMARY KEY NOT NULL,
    filename TEXT NOT NULL,
    local_path TEXT NOT NULL,
    file_size INTEGER,
    downloaded_at INTEGER NOT NULL
);

CREATE TABLE deleted_photos (
    photo_id TEXT PRIMARY KEY NOT NULL,
    filename TEXT NOT NULL,
    file_size INTEGER,
    original_path TEXT,
    deleted_at INTEGER NOT NULL
);
"#;

/// Tables that must exist for the store to be considered structurally sound.
pub(crate) const REQUIRED_TABLES: &[&str] = &["downloads", "deletions", "sync_runs"];

/// Get the current schema version from the store.
pub(crate) fn get_schema_version(conn: &Connection) -> Result<i32, StateError> {
    let version: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

/// Set the schema version in the store.
fn set_schema_version(conn: &Connection, version: i32) -> Result<(), StateError> {
    conn.pragma_update(None, "user_version", version)?;
    Ok(())
}

pub(crate) fn table_exists(conn: &Connection, name: &str) -> Result<bool, rusqlite::Error> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [name],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Detect the version of an existing store, recognising the legacy layout
/// by the presence of its tables.
fn detect_version(conn: &Connection) -> Result<i32, StateError> {
    let version = get_schema_version(conn)?;
    if version == 0 && table_exists(conn, "downloaded_photos")? {
        return Ok(LEGACY_SCHEMA_VERSION);
    }
    Ok(version)
}

/// Initialize or migrate the store schema.
///
/// This function is idempotent and safe to call on both new and existing stores.
pub(crate) fn migrate(conn: &Connection) -> Result<(), StateError> {
    let current_version = detect_version(conn)?;

    if current_version > SCHEMA_VERSION {
        return Err(StateError::UnsupportedSchemaVersion {
            found: current_version,
            expected: SCHEMA_VERSION,
        });
    }

    if current_version == 0 {
        conn.execute_batch(SCHEMA_V2)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
        tracing::debug!("Initialized state store schema at version {}", SCHEMA_VERSION);
    } else if current_version < SCHEMA_VERSION {
        for version in (current_version + 1)..=SCHEMA_VERSION {
            migrate_to_version(conn, version)?;
        }
    }

    Ok(())
}

/// Apply migration for a specific version.
fn migrate_to_version(conn: &Connection, version: i32) -> Result<(), StateError> {
    match version {
        2 => {
            let migrated = migrate_legacy(conn)?;
            tracing::info!(
                downloads = migrated.0,
                deletions = migrated.1,
                "Migrated legacy state store to album-aware schema"
            );
        }
        _ => {
            tracing::warn!("No migration registered for schema version {}", version);
            conn.execute_batch(SCHEMA_V2)?;
            set_schema_version(conn, version)?;
        }
    }
    Ok(())
}

/// One-time upgrade from the legacy layout.
///
/// Copies `downloaded_photos` and `deleted_photos` rows into the current
/// tables, deriving `album_name` from the first component of the stored
/// relative path, then drops the legacy tables. Runs in a single transaction
/// so an interrupted upgrade leaves the legacy store untouched.
///
/// Returns the number of (download, deletion) rows carried over.
pub(crate) fn migrate_legacy(conn: &Connection) -> Result<(usize, usize), StateError> {
    let tx = conn.unchecked_transaction()?;
    tx.execute_batch(SCHEMA_V2)?;

    let downloads = tx.execute(
        r#"
        INSERT OR REPLACE INTO downloads (item_id, item_name, album_name, local_path, size_bytes, downloaded_at)
        SELECT
            photo_id,
            filename,
            CASE WHEN instr(local_path, '/') > 0
                THEN substr(local_path, 1, instr(local_path, '/') - 1)
                ELSE ''
            END,
            local_path,
            COALESCE(file_size, 0),
            downloaded_at
        FROM downloaded_photos
        "#,
        [],
    )?;

    let deletions = if table_exists(&tx, "deleted_photos")? {
        let n = tx.execute(
            r#"
            INSERT OR REPLACE INTO deletions (item_id, item_name, size_bytes, original_path, deleted_at)
            SELECT photo_id, filename, file_size, original_path, deleted_at FROM deleted_photos
            "#,
            [],
        )?;
        tx.execute_batch("DROP TABLE deleted_photos")?;
        n
    } else {
        0
    };

    tx.execute_batch("DROP TABLE downloaded_photos")?;
    set_schema_version(&tx, SCHEMA_VERSION)?;
    tx.commit()?;

    Ok((downloads, deletions))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_db_migration() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_idempotent_migration() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_unsupported_version() {
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "user_version", SCHEMA_VERSION + 1)
            .unwrap();
        let result = migrate(&conn);
        assert!(matches!(
            result,
            Err(StateError::UnsupportedSchemaVersion { .. })
        ));
    }

    #[test]
    fn test_tables_created() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        for table in REQUIRED_TABLES {
            assert!(table_exists(&conn, table).unwrap(), "missing {}", table);
        }
    }

    #[test]
    fn test_legacy_store_detected_and_migrated() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(LEGACY_SCHEMA_V1).unwrap();
        conn.execute(
            "INSERT INTO downloaded_photos VALUES ('A1', 'beach.jpg', 'Summer/beach.jpg', 2048, 1700000000)",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO downloaded_photos VALUES ('A2', 'loose.jpg', 'loose.jpg', NULL, 1700000001)",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO deleted_photos VALUES ('A3', 'gone.jpg', 10, 'Summer/gone.jpg', 1700000002)",
            [],
        )
        .unwrap();

        migrate(&conn).unwrap();

        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
        assert!(!table_exists(&conn, "downloaded_photos").unwrap());
        assert!(!table_exists(&conn, "deleted_photos").unwrap());

        let album: String = conn
            .query_row(
                "SELECT album_name FROM downloads WHERE item_id = 'A1'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(album, "Summer");

        let (album, size): (String, i64) = conn
            .query_row(
                "SELECT album_name, size_bytes FROM downloads WHERE item_id = 'A2'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(album, "");
        assert_eq!(size, 0);

        let deleted: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM deletions WHERE item_id = 'A3'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(deleted, 1);
    }

    #[test]
    fn test_legacy_without_deletions_table() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE downloaded_photos (photo_id TEXT PRIMARY KEY, filename TEXT, local_path TEXT, file_size INTEGER, downloaded_at INTEGER)",
        )
        .unwrap();
        let (downloads, deletions) = migrate_legacy(&conn).unwrap();
        assert_eq!((downloads, deletions), (0, 0));
        assert!(table_exists(&conn, "deletions").unwrap());
    }
}
