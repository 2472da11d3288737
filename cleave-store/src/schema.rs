//! Container database schema and migrations.
//!
//! Migrations run at every open; `schema_version` records the applied level so
//! re-opening an up-to-date database is a no-op.

use cleave_core::errors::StorageError;
use rusqlite::Connection;

const SCHEMA_VERSION: u32 = 1;

const V1: &str = "
CREATE TABLE IF NOT EXISTS object (
    name                 TEXT NOT NULL,
    timestamp            TEXT NOT NULL,
    size                 INTEGER NOT NULL DEFAULT 0,
    content_type         TEXT NOT NULL DEFAULT '',
    etag                 TEXT NOT NULL DEFAULT '',
    deleted              INTEGER NOT NULL DEFAULT 0,
    storage_policy_index INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (name, storage_policy_index)
);

CREATE TABLE IF NOT EXISTS shard_range (
    name            TEXT PRIMARY KEY,
    account         TEXT NOT NULL,
    container       TEXT NOT NULL,
    lower           TEXT NOT NULL,
    upper           TEXT NOT NULL,
    timestamp       TEXT NOT NULL,
    state           TEXT NOT NULL,
    state_timestamp TEXT NOT NULL,
    meta_timestamp  TEXT NOT NULL,
    object_count    INTEGER NOT NULL DEFAULT 0,
    bytes_used      INTEGER NOT NULL DEFAULT 0,
    deleted         INTEGER NOT NULL DEFAULT 0,
    epoch           TEXT
);

CREATE TABLE IF NOT EXISTS container_stat (
    id                   INTEGER PRIMARY KEY CHECK (id = 1),
    account              TEXT NOT NULL,
    container            TEXT NOT NULL,
    put_timestamp        TEXT NOT NULL DEFAULT '',
    delete_timestamp     TEXT NOT NULL DEFAULT '',
    status               TEXT NOT NULL DEFAULT '',
    storage_policy_index INTEGER NOT NULL DEFAULT 0,
    db_epoch             TEXT,
    sharded              INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS container_meta (
    key       TEXT PRIMARY KEY,
    value     TEXT NOT NULL,
    timestamp TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS cleave_context (
    id     INTEGER PRIMARY KEY CHECK (id = 1),
    cursor TEXT NOT NULL DEFAULT '',
    done   INTEGER NOT NULL DEFAULT 0
);
";

/// Apply pragmas and bring the schema up to the current version.
pub fn run_migrations(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version    INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| migration_err(0, e))?;

    let current: u32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .map_err(|e| migration_err(0, e))?;

    if current < 1 {
        tracing::debug!(version = 1, "applying container schema migration");
        conn.execute_batch(V1).map_err(|e| migration_err(1, e))?;
        conn.execute("INSERT INTO schema_version (version) VALUES (1)", [])
            .map_err(|e| migration_err(1, e))?;
    }

    debug_assert!(current <= SCHEMA_VERSION);
    Ok(())
}

fn migration_err(version: u32, e: impl std::fmt::Display) -> StorageError {
    StorageError::MigrationFailed { version, message: e.to_string() }
}
