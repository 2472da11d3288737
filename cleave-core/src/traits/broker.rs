//! `ContainerBroker` — the contract the sharder requires of each local
//! container database.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::errors::StorageError;
use crate::types::shard_range::{ShardRange, ShardState};
use crate::types::timestamp::Timestamp;

// ─── Row Types ──────────────────────────────────────────────────────

/// State of the local database as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbState {
    Unsharded,
    Sharding,
    Sharded,
    Collapsed,
}

impl DbState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unsharded => "unsharded",
            Self::Sharding => "sharding",
            Self::Sharded => "sharded",
            Self::Collapsed => "collapsed",
        }
    }
}

/// An object listing row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRecord {
    pub name: String,
    pub timestamp: Timestamp,
    pub size: u64,
    pub content_type: String,
    pub etag: String,
    pub deleted: bool,
    pub storage_policy_index: i64,
}

/// Container identity and usage totals.
#[derive(Debug, Clone)]
pub struct BrokerInfo {
    pub account: String,
    pub container: String,
    pub object_count: u64,
    pub bytes_used: u64,
    pub storage_policy_index: i64,
}

/// Persistent cleave progress: the upper bound of the last successfully
/// cleaved shard range, replicated with the database so any replica resumes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleaveContext {
    pub cursor: String,
    pub done: bool,
}

/// One chunk proposed by `find_shard_ranges`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundRange {
    pub lower: String,
    pub upper: String,
    pub object_count: u64,
    pub bytes_used: u64,
    pub index: usize,
}

/// Selection arguments for `get_shard_ranges`.
#[derive(Debug, Clone, Default)]
pub struct ShardRangeFilter {
    /// Restrict to these states.
    pub states: Option<Vec<ShardState>>,
    /// Skip ranges whose namespace ends before the marker.
    pub marker: Option<String>,
    /// Include the broker's own record.
    pub include_own: bool,
    /// Include tombstoned records.
    pub include_deleted: bool,
    /// Return only the broker's own record.
    pub exclude_others: bool,
}

impl ShardRangeFilter {
    pub fn states(states: &[ShardState]) -> Self {
        Self { states: Some(states.to_vec()), ..Self::default() }
    }
}

/// Guard holding a container's sharding lock; dropping it releases the lock.
pub trait ShardingLock: Send {}

// ─── Trait ───────────────────────────────────────────────────────────

/// A local container database.
///
/// Covers the object listing, the shard-range table, sysmeta, db state, and
/// the merge/replicate primitives the sharder drives. All merges are
/// timestamp-keyed and idempotent.
pub trait ContainerBroker: Send + Sync {
    // ── identity ──

    fn get_info(&self) -> Result<BrokerInfo, StorageError>;

    /// Path of the database file, for replication.
    fn db_file(&self) -> PathBuf;

    fn is_deleted(&self) -> Result<bool, StorageError>;

    fn is_root_container(&self) -> Result<bool, StorageError>;

    fn root_account(&self) -> Result<String, StorageError>;

    fn root_container(&self) -> Result<String, StorageError>;

    fn root_path(&self) -> Result<String, StorageError> {
        Ok(format!("{}/{}", self.root_account()?, self.root_container()?))
    }

    fn storage_policy_index(&self) -> Result<i64, StorageError>;

    // ── db state ──

    fn get_db_state(&self) -> Result<DbState, StorageError>;

    fn set_sharding_state(&self, epoch: Timestamp) -> Result<(), StorageError>;

    /// Returns false if the database was not ready to move to sharded.
    fn set_sharded_state(&self) -> Result<bool, StorageError>;

    // ── shard ranges ──

    /// The range this broker believes describes its own contents; a default
    /// record covering the whole namespace when none is stored.
    fn get_own_shard_range(&self) -> Result<ShardRange, StorageError>;

    /// As `get_own_shard_range` but without synthesising a default.
    fn get_own_shard_range_opt(&self) -> Result<Option<ShardRange>, StorageError>;

    fn merge_shard_ranges(&self, ranges: &[ShardRange]) -> Result<(), StorageError>;

    fn get_shard_ranges(&self, filter: &ShardRangeFilter)
        -> Result<Vec<ShardRange>, StorageError>;

    /// Propose up to `limit` new ranges of roughly `target_size` objects,
    /// continuing from the upper bound of `existing`. The bool reports
    /// whether the end of the namespace was reached.
    fn find_shard_ranges(
        &self,
        target_size: u64,
        limit: usize,
        existing: &[ShardRange],
    ) -> Result<(Vec<FoundRange>, bool), StorageError>;

    // ── objects ──

    fn get_objects(
        &self,
        limit: usize,
        marker: &str,
        end_marker: &str,
        storage_policy_index: i64,
        include_deleted: bool,
    ) -> Result<Vec<ObjectRecord>, StorageError>;

    fn merge_items(&self, objects: &[ObjectRecord]) -> Result<(), StorageError>;

    /// Remove object rows with `lower < name <= upper` for the policy.
    fn remove_objects(
        &self,
        lower: &str,
        upper: &str,
        storage_policy_index: i64,
    ) -> Result<(), StorageError>;

    // ── sharding bookkeeping ──

    fn load_cleave_context(&self) -> Result<CleaveContext, StorageError>;

    fn dump_cleave_context(&self, context: &CleaveContext) -> Result<(), StorageError>;

    /// Read a key from the shard sysmeta family (`Root`, `Scan-Done`, `Epoch`).
    fn get_sharding_info(&self, key: &str) -> Result<Option<String>, StorageError>;

    fn update_sharding_info(&self, items: &[(&str, &str)]) -> Result<(), StorageError>;

    fn get_metadata(&self, key: &str) -> Result<Option<String>, StorageError>;

    fn update_metadata(
        &self,
        key: &str,
        value: &str,
        timestamp: Timestamp,
    ) -> Result<(), StorageError>;

    // ── lifecycle ──

    /// The ordered source databases holding the pre-cleave contents.
    fn get_brokers(&self) -> Vec<Arc<dyn ContainerBroker>>;

    /// Exclusive lock preventing concurrent cleaves into this database.
    fn sharding_lock(&self) -> Result<Box<dyn ShardingLock>, StorageError>;

    /// Tombstone the container at `timestamp`.
    fn delete_db(&self, timestamp: Timestamp) -> Result<(), StorageError>;
}

// ─── Arc blanket impl ───────────────────────────────────────────────

impl<T: ContainerBroker + ?Sized> ContainerBroker for Arc<T> {
    fn get_info(&self) -> Result<BrokerInfo, StorageError> {
        (**self).get_info()
    }
    fn db_file(&self) -> PathBuf {
        (**self).db_file()
    }
    fn is_deleted(&self) -> Result<bool, StorageError> {
        (**self).is_deleted()
    }
    fn is_root_container(&self) -> Result<bool, StorageError> {
        (**self).is_root_container()
    }
    fn root_account(&self) -> Result<String, StorageError> {
        (**self).root_account()
    }
    fn root_container(&self) -> Result<String, StorageError> {
        (**self).root_container()
    }
    fn storage_policy_index(&self) -> Result<i64, StorageError> {
        (**self).storage_policy_index()
    }
    fn get_db_state(&self) -> Result<DbState, StorageError> {
        (**self).get_db_state()
    }
    fn set_sharding_state(&self, epoch: Timestamp) -> Result<(), StorageError> {
        (**self).set_sharding_state(epoch)
    }
    fn set_sharded_state(&self) -> Result<bool, StorageError> {
        (**self).set_sharded_state()
    }
    fn get_own_shard_range(&self) -> Result<ShardRange, StorageError> {
        (**self).get_own_shard_range()
    }
    fn get_own_shard_range_opt(&self) -> Result<Option<ShardRange>, StorageError> {
        (**self).get_own_shard_range_opt()
    }
    fn merge_shard_ranges(&self, ranges: &[ShardRange]) -> Result<(), StorageError> {
        (**self).merge_shard_ranges(ranges)
    }
    fn get_shard_ranges(
        &self,
        filter: &ShardRangeFilter,
    ) -> Result<Vec<ShardRange>, StorageError> {
        (**self).get_shard_ranges(filter)
    }
    fn find_shard_ranges(
        &self,
        target_size: u64,
        limit: usize,
        existing: &[ShardRange],
    ) -> Result<(Vec<FoundRange>, bool), StorageError> {
        (**self).find_shard_ranges(target_size, limit, existing)
    }
    fn get_objects(
        &self,
        limit: usize,
        marker: &str,
        end_marker: &str,
        storage_policy_index: i64,
        include_deleted: bool,
    ) -> Result<Vec<ObjectRecord>, StorageError> {
        (**self).get_objects(limit, marker, end_marker, storage_policy_index, include_deleted)
    }
    fn merge_items(&self, objects: &[ObjectRecord]) -> Result<(), StorageError> {
        (**self).merge_items(objects)
    }
    fn remove_objects(
        &self,
        lower: &str,
        upper: &str,
        storage_policy_index: i64,
    ) -> Result<(), StorageError> {
        (**self).remove_objects(lower, upper, storage_policy_index)
    }
    fn load_cleave_context(&self) -> Result<CleaveContext, StorageError> {
        (**self).load_cleave_context()
    }
    fn dump_cleave_context(&self, context: &CleaveContext) -> Result<(), StorageError> {
        (**self).dump_cleave_context(context)
    }
    fn get_sharding_info(&self, key: &str) -> Result<Option<String>, StorageError> {
        (**self).get_sharding_info(key)
    }
    fn update_sharding_info(&self, items: &[(&str, &str)]) -> Result<(), StorageError> {
        (**self).update_sharding_info(items)
    }
    fn get_metadata(&self, key: &str) -> Result<Option<String>, StorageError> {
        (**self).get_metadata(key)
    }
    fn update_metadata(
        &self,
        key: &str,
        value: &str,
        timestamp: Timestamp,
    ) -> Result<(), StorageError> {
        (**self).update_metadata(key, value, timestamp)
    }
    fn get_brokers(&self) -> Vec<Arc<dyn ContainerBroker>> {
        (**self).get_brokers()
    }
    fn sharding_lock(&self) -> Result<Box<dyn ShardingLock>, StorageError> {
        (**self).sharding_lock()
    }
    fn delete_db(&self, timestamp: Timestamp) -> Result<(), StorageError> {
        (**self).delete_db(timestamp)
    }
}
