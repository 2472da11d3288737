//! object table queries.

use cleave_core::errors::StorageError;
use cleave_core::traits::broker::ObjectRecord;
use rusqlite::{params, Connection};

use super::{parse_ts, sqe};

/// Name-ordered listing page. `marker` is exclusive, `end_marker` exclusive,
/// empty meaning unbounded.
pub fn get_objects(
    conn: &Connection,
    limit: usize,
    marker: &str,
    end_marker: &str,
    storage_policy_index: i64,
    include_deleted: bool,
) -> Result<Vec<ObjectRecord>, StorageError> {
    let mut stmt = conn
        .prepare_cached(
            "SELECT name, timestamp, size, content_type, etag, deleted
             FROM object
             WHERE storage_policy_index = ?1
               AND name > ?2
               AND (?3 = '' OR name < ?3)
               AND (?4 OR deleted = 0)
             ORDER BY name
             LIMIT ?5",
        )
        .map_err(sqe)?;

    let rows = stmt
        .query_map(
            params![storage_policy_index, marker, end_marker, include_deleted, limit as i64],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, bool>(5)?,
                ))
            },
        )
        .map_err(sqe)?;

    let mut result = Vec::new();
    for row in rows {
        let (name, timestamp, size, content_type, etag, deleted) = row.map_err(sqe)?;
        result.push(ObjectRecord {
            name,
            timestamp: parse_ts(&timestamp)?,
            size: size as u64,
            content_type,
            etag,
            deleted,
            storage_policy_index,
        });
    }
    Ok(result)
}

/// Timestamp-keyed upsert: a row only replaces an existing one with an older
/// timestamp, so replays are no-ops.
pub fn merge_items(conn: &Connection, objects: &[ObjectRecord]) -> Result<(), StorageError> {
    let mut stmt = conn
        .prepare_cached(
            "INSERT INTO object
               (name, timestamp, size, content_type, etag, deleted, storage_policy_index)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT (name, storage_policy_index) DO UPDATE SET
               timestamp = excluded.timestamp,
               size = excluded.size,
               content_type = excluded.content_type,
               etag = excluded.etag,
               deleted = excluded.deleted
             WHERE excluded.timestamp > object.timestamp",
        )
        .map_err(sqe)?;

    for obj in objects {
        stmt.execute(params![
            obj.name,
            obj.timestamp.internal(),
            obj.size as i64,
            obj.content_type,
            obj.etag,
            obj.deleted,
            obj.storage_policy_index,
        ])
        .map_err(sqe)?;
    }
    Ok(())
}

/// Delete rows with `lower < name <= upper` (empty upper = unbounded).
pub fn remove_objects(
    conn: &Connection,
    lower: &str,
    upper: &str,
    storage_policy_index: i64,
) -> Result<usize, StorageError> {
    conn.prepare_cached(
        "DELETE FROM object
         WHERE storage_policy_index = ?1
           AND name > ?2
           AND (?3 = '' OR name <= ?3)",
    )
    .map_err(sqe)?
    .execute(params![storage_policy_index, lower, upper])
    .map_err(sqe)
}

/// Live object count and byte total for the policy.
pub fn stats(conn: &Connection, storage_policy_index: i64) -> Result<(u64, u64), StorageError> {
    conn.prepare_cached(
        "SELECT COUNT(*), COALESCE(SUM(size), 0)
         FROM object
         WHERE storage_policy_index = ?1 AND deleted = 0",
    )
    .map_err(sqe)?
    .query_row(params![storage_policy_index], |row| {
        Ok((row.get::<_, i64>(0)? as u64, row.get::<_, i64>(1)? as u64))
    })
    .map_err(sqe)
}

/// Page of `(name, size)` pairs for split scanning; `marker` exclusive.
pub fn split_page(
    conn: &Connection,
    storage_policy_index: i64,
    marker: &str,
    limit: usize,
) -> Result<Vec<(String, u64)>, StorageError> {
    let mut stmt = conn
        .prepare_cached(
            "SELECT name, size FROM object
             WHERE storage_policy_index = ?1 AND deleted = 0 AND name > ?2
             ORDER BY name
             LIMIT ?3",
        )
        .map_err(sqe)?;
    let rows = stmt
        .query_map(params![storage_policy_index, marker, limit as i64], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
        })
        .map_err(sqe)?;
    let mut result = Vec::new();
    for row in rows {
        result.push(row.map_err(sqe)?);
    }
    Ok(result)
}
