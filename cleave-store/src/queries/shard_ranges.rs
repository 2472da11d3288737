//! shard_range table queries.

use cleave_core::errors::StorageError;
use cleave_core::types::shard_range::{ShardRange, ShardState};
use rusqlite::{params, Connection};

use super::{parse_ts, sqe};

const COLUMNS: &str = "account, container, lower, upper, timestamp, state,
                       state_timestamp, meta_timestamp, object_count, bytes_used,
                       deleted, epoch";

fn read_range(row: &rusqlite::Row<'_>) -> Result<ShardRange, StorageError> {
    let timestamp: String = row.get(4).map_err(sqe)?;
    let state: String = row.get(5).map_err(sqe)?;
    let state_timestamp: String = row.get(6).map_err(sqe)?;
    let meta_timestamp: String = row.get(7).map_err(sqe)?;
    let epoch: Option<String> = row.get(11).map_err(sqe)?;

    Ok(ShardRange {
        account: row.get(0).map_err(sqe)?,
        container: row.get(1).map_err(sqe)?,
        lower: row.get(2).map_err(sqe)?,
        upper: row.get(3).map_err(sqe)?,
        timestamp: parse_ts(&timestamp)?,
        state: ShardState::parse(&state).ok_or_else(|| StorageError::InvalidRecord {
            message: format!("bad shard state {state:?}"),
        })?,
        state_timestamp: parse_ts(&state_timestamp)?,
        meta_timestamp: parse_ts(&meta_timestamp)?,
        object_count: row.get::<_, i64>(8).map_err(sqe)? as u64,
        bytes_used: row.get::<_, i64>(9).map_err(sqe)? as u64,
        deleted: row.get(10).map_err(sqe)?,
        epoch: epoch.as_deref().map(parse_ts).transpose()?,
    })
}

/// Every stored range, tombstones included, in bound order.
pub fn fetch_all(conn: &Connection) -> Result<Vec<ShardRange>, StorageError> {
    let mut stmt = conn
        .prepare_cached(&format!("SELECT {COLUMNS} FROM shard_range"))
        .map_err(sqe)?;
    let mut rows = stmt.query([]).map_err(sqe)?;
    let mut result = Vec::new();
    while let Some(row) = rows.next().map_err(sqe)? {
        result.push(read_range(row)?);
    }
    result.sort_by(|a, b| a.cmp_bounds(b));
    Ok(result)
}

/// Fetch one range by `account/container` name.
pub fn fetch_by_name(conn: &Connection, name: &str) -> Result<Option<ShardRange>, StorageError> {
    let mut stmt = conn
        .prepare_cached(&format!("SELECT {COLUMNS} FROM shard_range WHERE name = ?1"))
        .map_err(sqe)?;
    let mut rows = stmt.query(params![name]).map_err(sqe)?;
    match rows.next().map_err(sqe)? {
        Some(row) => Ok(Some(read_range(row)?)),
        None => Ok(None),
    }
}

/// Merge ranges with per-column last-writer-wins:
/// `timestamp` guards the namespace columns (bounds, deleted),
/// `state_timestamp` guards state and epoch,
/// `meta_timestamp` guards the usage stats.
/// Replaying the same ranges is a no-op.
pub fn merge(conn: &Connection, ranges: &[ShardRange]) -> Result<(), StorageError> {
    for incoming in ranges {
        let name = incoming.name();
        let merged = match fetch_by_name(conn, &name)? {
            None => incoming.clone(),
            Some(current) => {
                let mut merged = current.clone();
                if incoming.timestamp > current.timestamp {
                    merged.timestamp = incoming.timestamp;
                    merged.lower = incoming.lower.clone();
                    merged.upper = incoming.upper.clone();
                    merged.deleted = incoming.deleted;
                }
                if incoming.state_timestamp > current.state_timestamp {
                    merged.state = incoming.state;
                    merged.state_timestamp = incoming.state_timestamp;
                    merged.epoch = incoming.epoch;
                }
                if incoming.meta_timestamp > current.meta_timestamp {
                    merged.object_count = incoming.object_count;
                    merged.bytes_used = incoming.bytes_used;
                    merged.meta_timestamp = incoming.meta_timestamp;
                }
                merged
            }
        };

        conn.prepare_cached(
            "INSERT OR REPLACE INTO shard_range
               (name, account, container, lower, upper, timestamp, state,
                state_timestamp, meta_timestamp, object_count, bytes_used,
                deleted, epoch)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        )
        .map_err(sqe)?
        .execute(params![
            name,
            merged.account,
            merged.container,
            merged.lower,
            merged.upper,
            merged.timestamp.internal(),
            merged.state.as_str(),
            merged.state_timestamp.internal(),
            merged.meta_timestamp.internal(),
            merged.object_count as i64,
            merged.bytes_used as i64,
            merged.deleted,
            merged.epoch.map(|e| e.internal()),
        ])
        .map_err(sqe)?;
    }
    Ok(())
}
