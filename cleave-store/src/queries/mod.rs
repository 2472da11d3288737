//! Prepared-statement CRUD, one module per table.

pub mod meta;
pub mod objects;
pub mod shard_ranges;

use cleave_core::errors::StorageError;
use cleave_core::types::timestamp::Timestamp;

pub(crate) fn sqe(e: impl std::fmt::Display) -> StorageError {
    StorageError::SqliteError { message: e.to_string() }
}

pub(crate) fn parse_ts(raw: &str) -> Result<Timestamp, StorageError> {
    raw.parse().map_err(|_| StorageError::InvalidRecord {
        message: format!("bad timestamp {raw:?}"),
    })
}
