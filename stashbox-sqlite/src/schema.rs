//! Schema creation, versioning and forward migration.
//!
//! Runs once on the writer thread before the queue loop starts. Versions
//! are tracked in a single-column `SchemaInfo` table; a database without
//! that table is pre-versioned (version 1) and is migrated forward.

use rusqlite::Connection;
use tracing::{debug, info};

use stashbox_core::{CacheError, CacheResult, Clock, time};

/// Current schema version.
pub const SCHEMA_VERSION: i64 = 2;

const CREATE_CACHE_ELEMENT: &str = "CREATE TABLE IF NOT EXISTS CacheElement (
    Key        TEXT PRIMARY KEY NOT NULL,
    TypeName   TEXT NULL,
    Value      BLOB NOT NULL,
    Expiration INTEGER NOT NULL,
    CreatedAt  INTEGER NOT NULL
);";

pub(crate) fn initialize(conn: &mut Connection, clock: Clock) -> CacheResult<()> {
    apply_pragmas(conn);

    conn.execute_batch(CREATE_CACHE_ELEMENT)
        .map_err(CacheError::backend)?;

    let version = read_version(conn)?;
    if version < SCHEMA_VERSION {
        migrate_v1_to_v2(conn, clock)?;
    }
    Ok(())
}

/// Best-effort performance pragmas. Older engines reject some of these;
/// failures are swallowed.
fn apply_pragmas(conn: &Connection) {
    for pragma in [
        "PRAGMA journal_mode=WAL;",
        "PRAGMA temp_store=MEMORY;",
        "PRAGMA synchronous=OFF;",
    ] {
        if let Err(err) = conn.execute_batch(pragma) {
            debug!(pragma, error = %err, "pragma rejected, continuing");
        }
    }
}

/// Reads the latest recorded schema version, creating the `SchemaInfo`
/// table (and treating the database as version 1) when it is absent.
fn read_version(conn: &Connection) -> CacheResult<i64> {
    let exists: bool = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='SchemaInfo')",
            [],
            |row| row.get(0),
        )
        .map_err(CacheError::backend)?;

    if !exists {
        conn.execute_batch("CREATE TABLE SchemaInfo (Version INTEGER NOT NULL);")
            .map_err(CacheError::backend)?;
        return Ok(1);
    }

    match conn.query_row(
        "SELECT Version FROM SchemaInfo ORDER BY Version DESC LIMIT 1",
        [],
        |row| row.get(0),
    ) {
        Ok(version) => Ok(version),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(1),
        Err(err) => Err(CacheError::backend(err)),
    }
}

/// v1 → v2: the legacy layout had no `CreatedAt` column. Existing rows are
/// copied into the new layout with `CreatedAt` stamped at migration time.
fn migrate_v1_to_v2(conn: &mut Connection, clock: Clock) -> CacheResult<()> {
    let now_ticks = time::to_ticks(clock());
    let tx = conn.transaction().map_err(CacheError::backend)?;

    tx.execute_batch("ALTER TABLE CacheElement RENAME TO VersionOneCacheElement;")
        .map_err(CacheError::backend)?;
    tx.execute_batch(CREATE_CACHE_ELEMENT)
        .map_err(CacheError::backend)?;
    tx.execute(
        "INSERT INTO CacheElement (Key, TypeName, Value, Expiration, CreatedAt)
         SELECT Key, TypeName, Value, Expiration, ?1 FROM VersionOneCacheElement",
        [now_ticks],
    )
    .map_err(CacheError::backend)?;
    tx.execute_batch("DROP TABLE VersionOneCacheElement;")
        .map_err(CacheError::backend)?;
    tx.execute("INSERT INTO SchemaInfo (Version) VALUES (?1)", [SCHEMA_VERSION])
        .map_err(CacheError::backend)?;

    tx.commit().map_err(CacheError::backend)?;
    info!(version = SCHEMA_VERSION, "cache schema migrated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use stashbox_core::system_clock;

    fn version_of(conn: &Connection) -> i64 {
        conn.query_row(
            "SELECT Version FROM SchemaInfo ORDER BY Version DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .unwrap()
    }

    #[test]
    fn fresh_database_lands_on_current_version() {
        let mut conn = Connection::open_in_memory().unwrap();
        initialize(&mut conn, system_clock).unwrap();
        assert_eq!(version_of(&conn), SCHEMA_VERSION);

        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM CacheElement", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 0);
    }

    #[test]
    fn initialization_is_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        initialize(&mut conn, system_clock).unwrap();
        initialize(&mut conn, system_clock).unwrap();
        assert_eq!(version_of(&conn), SCHEMA_VERSION);
    }

    #[test]
    fn v1_rows_are_migrated_with_a_fresh_created_at() {
        let mut conn = Connection::open_in_memory().unwrap();
        // A pre-versioned database: v1 table layout, no SchemaInfo.
        conn.execute_batch(
            "CREATE TABLE CacheElement (
                Key        TEXT PRIMARY KEY NOT NULL,
                TypeName   TEXT NULL,
                Value      BLOB NOT NULL,
                Expiration INTEGER NOT NULL
            );",
        )
        .unwrap();
        conn.execute(
            "INSERT INTO CacheElement (Key, TypeName, Value, Expiration) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params!["legacy", Option::<String>::None, b"payload".as_slice(), i64::MAX],
        )
        .unwrap();

        let before = Utc::now();
        initialize(&mut conn, system_clock).unwrap();
        let after = Utc::now();

        assert_eq!(version_of(&conn), SCHEMA_VERSION);

        let (value, created_ticks): (Vec<u8>, i64) = conn
            .query_row(
                "SELECT Value, CreatedAt FROM CacheElement WHERE Key = 'legacy'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(value, b"payload");

        let created = time::from_ticks(created_ticks).unwrap();
        assert!(created >= before - chrono::Duration::seconds(1));
        assert!(created <= after + chrono::Duration::seconds(1));

        // The legacy table is gone.
        let legacy_exists: bool = conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE name='VersionOneCacheElement')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert!(!legacy_exists);
    }
}
