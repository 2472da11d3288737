//! container_stat, container_meta and cleave_context queries.

use cleave_core::errors::StorageError;
use cleave_core::traits::broker::CleaveContext;
use cleave_core::types::timestamp::Timestamp;
use rusqlite::{params, Connection, OptionalExtension};

use super::{parse_ts, sqe};

/// The single container_stat row.
#[derive(Debug, Clone)]
pub struct StatRow {
    pub account: String,
    pub container: String,
    pub put_timestamp: String,
    pub delete_timestamp: String,
    pub storage_policy_index: i64,
    pub db_epoch: Option<String>,
    pub sharded: bool,
}

/// Insert the stat row if the database is fresh.
pub fn init_stat(
    conn: &Connection,
    account: &str,
    container: &str,
    storage_policy_index: i64,
    put_timestamp: Timestamp,
) -> Result<(), StorageError> {
    conn.prepare_cached(
        "INSERT OR IGNORE INTO container_stat
           (id, account, container, put_timestamp, storage_policy_index)
         VALUES (1, ?1, ?2, ?3, ?4)",
    )
    .map_err(sqe)?
    .execute(params![account, container, put_timestamp.internal(), storage_policy_index])
    .map_err(sqe)?;
    Ok(())
}

pub fn get_stat(conn: &Connection) -> Result<StatRow, StorageError> {
    conn.prepare_cached(
        "SELECT account, container, put_timestamp, delete_timestamp,
                storage_policy_index, db_epoch, sharded
         FROM container_stat WHERE id = 1",
    )
    .map_err(sqe)?
    .query_row([], |row| {
        Ok(StatRow {
            account: row.get(0)?,
            container: row.get(1)?,
            put_timestamp: row.get(2)?,
            delete_timestamp: row.get(3)?,
            storage_policy_index: row.get(4)?,
            db_epoch: row.get(5)?,
            sharded: row.get(6)?,
        })
    })
    .optional()
    .map_err(sqe)?
    .ok_or_else(|| StorageError::InvalidRecord {
        message: "container database has no stat row".to_string(),
    })
}

/// Whether the container is tombstoned: deleted at or after the last PUT.
pub fn is_deleted(stat: &StatRow) -> Result<bool, StorageError> {
    if stat.delete_timestamp.is_empty() {
        return Ok(false);
    }
    if stat.put_timestamp.is_empty() {
        return Ok(true);
    }
    Ok(parse_ts(&stat.delete_timestamp)? >= parse_ts(&stat.put_timestamp)?)
}

pub fn set_delete_timestamp(conn: &Connection, timestamp: Timestamp) -> Result<(), StorageError> {
    conn.prepare_cached(
        "UPDATE container_stat SET delete_timestamp = ?1, status = 'DELETED' WHERE id = 1",
    )
    .map_err(sqe)?
    .execute(params![timestamp.internal()])
    .map_err(sqe)?;
    Ok(())
}

/// Record the sharding epoch, clear the sharded flag, and reset cleave
/// progress so a re-shard starts from the beginning of the namespace.
pub fn set_db_epoch(conn: &Connection, epoch: Timestamp) -> Result<(), StorageError> {
    conn.prepare_cached("UPDATE container_stat SET db_epoch = ?1, sharded = 0 WHERE id = 1")
        .map_err(sqe)?
        .execute(params![epoch.internal()])
        .map_err(sqe)?;
    dump_cleave_context(conn, &CleaveContext::default())?;
    Ok(())
}

pub fn set_sharded(conn: &Connection) -> Result<(), StorageError> {
    conn.prepare_cached("UPDATE container_stat SET sharded = 1 WHERE id = 1")
        .map_err(sqe)?
        .execute([])
        .map_err(sqe)?;
    Ok(())
}

// ── container_meta ──

pub fn get_meta(conn: &Connection, key: &str) -> Result<Option<String>, StorageError> {
    conn.prepare_cached("SELECT value FROM container_meta WHERE key = ?1")
        .map_err(sqe)?
        .query_row(params![key], |row| row.get(0))
        .optional()
        .map_err(sqe)
}

/// Timestamp-keyed upsert; older writes lose.
pub fn upsert_meta(
    conn: &Connection,
    key: &str,
    value: &str,
    timestamp: Timestamp,
) -> Result<(), StorageError> {
    conn.prepare_cached(
        "INSERT INTO container_meta (key, value, timestamp) VALUES (?1, ?2, ?3)
         ON CONFLICT (key) DO UPDATE SET
           value = excluded.value,
           timestamp = excluded.timestamp
         WHERE excluded.timestamp > container_meta.timestamp",
    )
    .map_err(sqe)?
    .execute(params![key, value, timestamp.internal()])
    .map_err(sqe)?;
    Ok(())
}

// ── cleave_context ──

pub fn load_cleave_context(conn: &Connection) -> Result<CleaveContext, StorageError> {
    Ok(conn
        .prepare_cached("SELECT cursor, done FROM cleave_context WHERE id = 1")
        .map_err(sqe)?
        .query_row([], |row| {
            Ok(CleaveContext { cursor: row.get(0)?, done: row.get(1)? })
        })
        .optional()
        .map_err(sqe)?
        .unwrap_or_default())
}

pub fn dump_cleave_context(conn: &Connection, context: &CleaveContext) -> Result<(), StorageError> {
    conn.prepare_cached(
        "INSERT OR REPLACE INTO cleave_context (id, cursor, done) VALUES (1, ?1, ?2)",
    )
    .map_err(sqe)?
    .execute(params![context.cursor, context.done])
    .map_err(sqe)?;
    Ok(())
}
