//! `SqliteBroker` — one SQLite database per container.
//!
//! Single owner of the connection; all access goes through `with_conn()`. No
//! code outside this module touches a raw `&Connection` for container
//! databases. Cheap to clone; clones share the connection.

use std::ffi::OsString;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rusqlite::Connection;

use cleave_core::constants::SHARD_SYSMETA_PREFIX;
use cleave_core::errors::StorageError;
use cleave_core::traits::broker::{
    BrokerInfo, CleaveContext, ContainerBroker, DbState, FoundRange, ObjectRecord,
    ShardRangeFilter, ShardingLock,
};
use cleave_core::types::shard_range::{cmp_upper, ShardRange, ShardState};
use cleave_core::types::timestamp::Timestamp;

use crate::queries::{meta, objects, shard_ranges};
use crate::schema;

struct Inner {
    conn: Mutex<Connection>,
    path: PathBuf,
}

/// A container database on local disk.
#[derive(Clone)]
pub struct SqliteBroker {
    inner: Arc<Inner>,
}

impl SqliteBroker {
    /// Open an existing database (or create an uninitialised one), applying
    /// pragmas and migrations.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let conn = Connection::open(path).map_err(sqe)?;
        conn.pragma_update(None, "journal_mode", "WAL").map_err(sqe)?;
        conn.pragma_update(None, "synchronous", "NORMAL").map_err(sqe)?;
        conn.busy_timeout(std::time::Duration::from_secs(5)).map_err(sqe)?;
        schema::run_migrations(&conn)?;
        Ok(Self {
            inner: Arc::new(Inner { conn: Mutex::new(conn), path: path.to_path_buf() }),
        })
    }

    /// Open, creating parent directories and the stat row when the database
    /// is fresh. Re-opening an initialised database leaves it untouched.
    pub fn create(
        path: &Path,
        account: &str,
        container: &str,
        storage_policy_index: i64,
        put_timestamp: Timestamp,
    ) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let broker = Self::open(path)?;
        broker.with_conn(|conn| {
            meta::init_stat(conn, account, container, storage_policy_index, put_timestamp)
        })?;
        Ok(broker)
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let conn = self.inner.conn.lock().map_err(|_| StorageError::SqliteError {
            message: "connection mutex poisoned".to_string(),
        })?;
        f(&conn)
    }

    fn stat(&self) -> Result<meta::StatRow, StorageError> {
        self.with_conn(meta::get_stat)
    }

    fn own_name(&self) -> Result<String, StorageError> {
        let stat = self.stat()?;
        Ok(format!("{}/{}", stat.account, stat.container))
    }

    /// Upsert a live object row (primarily for seeding and tests).
    pub fn put_object(
        &self,
        name: &str,
        timestamp: Timestamp,
        size: u64,
        content_type: &str,
        etag: &str,
    ) -> Result<(), StorageError> {
        let storage_policy_index = self.storage_policy_index()?;
        self.merge_items(&[ObjectRecord {
            name: name.to_string(),
            timestamp,
            size,
            content_type: content_type.to_string(),
            etag: etag.to_string(),
            deleted: false,
            storage_policy_index,
        }])
    }

    /// Upsert a tombstone row for an object.
    pub fn delete_object(&self, name: &str, timestamp: Timestamp) -> Result<(), StorageError> {
        let storage_policy_index = self.storage_policy_index()?;
        self.merge_items(&[ObjectRecord {
            name: name.to_string(),
            timestamp,
            size: 0,
            content_type: String::new(),
            etag: String::new(),
            deleted: true,
            storage_policy_index,
        }])
    }
}

fn sqe(e: impl std::fmt::Display) -> StorageError {
    StorageError::SqliteError { message: e.to_string() }
}

fn lock_path(db_path: &Path) -> PathBuf {
    let mut raw: OsString = db_path.as_os_str().to_owned();
    raw.push(".lock");
    PathBuf::from(raw)
}

/// Held while cleaving into a database. The advisory lock lives on the open
/// file descriptor, so closing the file on drop releases it; a crashed
/// holder releases it the same way. The lock file itself is left behind,
/// which is harmless.
struct CleaveLockGuard {
    _lock: fd_lock::RwLock<File>,
}

impl ShardingLock for CleaveLockGuard {}

impl ContainerBroker for SqliteBroker {
    fn get_info(&self) -> Result<BrokerInfo, StorageError> {
        let stat = self.stat()?;
        let (object_count, bytes_used) =
            self.with_conn(|conn| objects::stats(conn, stat.storage_policy_index))?;
        Ok(BrokerInfo {
            account: stat.account,
            container: stat.container,
            object_count,
            bytes_used,
            storage_policy_index: stat.storage_policy_index,
        })
    }

    fn db_file(&self) -> PathBuf {
        self.inner.path.clone()
    }

    fn is_deleted(&self) -> Result<bool, StorageError> {
        meta::is_deleted(&self.stat()?)
    }

    fn is_root_container(&self) -> Result<bool, StorageError> {
        match self.get_sharding_info("Root")? {
            None => Ok(true),
            Some(root) => Ok(root == self.own_name()?),
        }
    }

    fn root_account(&self) -> Result<String, StorageError> {
        match self.get_sharding_info("Root")? {
            Some(root) => match root.split_once('/') {
                Some((account, _)) => Ok(account.to_string()),
                None => Err(StorageError::InvalidRecord {
                    message: format!("bad root path {root:?}"),
                }),
            },
            None => Ok(self.stat()?.account),
        }
    }

    fn root_container(&self) -> Result<String, StorageError> {
        match self.get_sharding_info("Root")? {
            Some(root) => match root.split_once('/') {
                Some((_, container)) => Ok(container.to_string()),
                None => Err(StorageError::InvalidRecord {
                    message: format!("bad root path {root:?}"),
                }),
            },
            None => Ok(self.stat()?.container),
        }
    }

    fn storage_policy_index(&self) -> Result<i64, StorageError> {
        Ok(self.stat()?.storage_policy_index)
    }

    fn get_db_state(&self) -> Result<DbState, StorageError> {
        let stat = self.stat()?;
        if stat.db_epoch.is_none() {
            return Ok(DbState::Unsharded);
        }
        if !stat.sharded {
            return Ok(DbState::Sharding);
        }
        // A sharded database whose shard ranges have all been retired has
        // collapsed back to holding its own namespace.
        let own_name = format!("{}/{}", stat.account, stat.container);
        let others = self.with_conn(shard_ranges::fetch_all)?;
        let live = others.iter().any(|r| !r.deleted && r.name() != own_name);
        Ok(if live { DbState::Sharded } else { DbState::Collapsed })
    }

    fn set_sharding_state(&self, epoch: Timestamp) -> Result<(), StorageError> {
        self.with_conn(|conn| meta::set_db_epoch(conn, epoch))
    }

    fn set_sharded_state(&self) -> Result<bool, StorageError> {
        let stat = self.stat()?;
        if stat.db_epoch.is_none() {
            return Ok(false);
        }
        self.with_conn(meta::set_sharded)?;
        Ok(true)
    }

    fn get_own_shard_range(&self) -> Result<ShardRange, StorageError> {
        if let Some(own) = self.get_own_shard_range_opt()? {
            return Ok(own);
        }
        let info = self.get_info()?;
        let timestamp = Timestamp::now();
        let mut own =
            ShardRange::new(info.account.clone(), info.container.clone(), timestamp, "", "");
        own.state = ShardState::Active;
        own.object_count = info.object_count;
        own.bytes_used = info.bytes_used;
        Ok(own)
    }

    fn get_own_shard_range_opt(&self) -> Result<Option<ShardRange>, StorageError> {
        let name = self.own_name()?;
        self.with_conn(|conn| shard_ranges::fetch_by_name(conn, &name))
    }

    fn merge_shard_ranges(&self, ranges: &[ShardRange]) -> Result<(), StorageError> {
        self.with_conn(|conn| shard_ranges::merge(conn, ranges))
    }

    fn get_shard_ranges(
        &self,
        filter: &ShardRangeFilter,
    ) -> Result<Vec<ShardRange>, StorageError> {
        let own_name = self.own_name()?;
        let mut ranges = self.with_conn(shard_ranges::fetch_all)?;
        ranges.retain(|range| {
            if !filter.include_deleted && range.deleted {
                return false;
            }
            let is_own = range.name() == own_name;
            if filter.exclude_others && !is_own {
                return false;
            }
            if !filter.include_own && is_own {
                return false;
            }
            if let Some(states) = &filter.states {
                if !states.contains(&range.state) {
                    return false;
                }
            }
            if let Some(marker) = &filter.marker {
                if !range.upper.is_empty() && range.upper.as_str() < marker.as_str() {
                    return false;
                }
            }
            true
        });
        Ok(ranges)
    }

    fn find_shard_ranges(
        &self,
        target_size: u64,
        limit: usize,
        existing: &[ShardRange],
    ) -> Result<(Vec<FoundRange>, bool), StorageError> {
        let own = self.get_own_shard_range()?;
        let storage_policy_index = self.storage_policy_index()?;
        let target = target_size.max(1) as usize;

        let mut lower = own.lower.clone();
        let mut index = existing.len();
        if !existing.is_empty() {
            let max_upper = existing
                .iter()
                .map(|r| r.upper.as_str())
                .max_by(|a, b| cmp_upper(a, b))
                .unwrap_or("");
            let covered = max_upper.is_empty()
                || (!own.upper.is_empty() && max_upper >= own.upper.as_str());
            if covered {
                return Ok((Vec::new(), true));
            }
            lower = max_upper.to_string();
        }

        let mut found = Vec::new();
        loop {
            let rows = self.with_conn(|conn| {
                objects::split_page(conn, storage_policy_index, &lower, target + 1)
            })?;
            if rows.is_empty() {
                return Ok((found, true));
            }
            if rows.len() <= target {
                // The tail chunk runs out to the end of our namespace.
                let object_count = rows.len() as u64;
                let bytes_used = rows.iter().map(|(_, size)| *size).sum();
                found.push(FoundRange {
                    lower,
                    upper: own.upper.clone(),
                    object_count,
                    bytes_used,
                    index,
                });
                return Ok((found, true));
            }
            let upper = rows[target - 1].0.clone();
            let bytes_used = rows[..target].iter().map(|(_, size)| *size).sum();
            found.push(FoundRange {
                lower: lower.clone(),
                upper: upper.clone(),
                object_count: target as u64,
                bytes_used,
                index,
            });
            index += 1;
            lower = upper;
            if found.len() == limit {
                return Ok((found, false));
            }
        }
    }

    fn get_objects(
        &self,
        limit: usize,
        marker: &str,
        end_marker: &str,
        storage_policy_index: i64,
        include_deleted: bool,
    ) -> Result<Vec<ObjectRecord>, StorageError> {
        self.with_conn(|conn| {
            objects::get_objects(conn, limit, marker, end_marker, storage_policy_index, include_deleted)
        })
    }

    fn merge_items(&self, items: &[ObjectRecord]) -> Result<(), StorageError> {
        self.with_conn(|conn| objects::merge_items(conn, items))
    }

    fn remove_objects(
        &self,
        lower: &str,
        upper: &str,
        storage_policy_index: i64,
    ) -> Result<(), StorageError> {
        self.with_conn(|conn| objects::remove_objects(conn, lower, upper, storage_policy_index))?;
        Ok(())
    }

    fn load_cleave_context(&self) -> Result<CleaveContext, StorageError> {
        self.with_conn(meta::load_cleave_context)
    }

    fn dump_cleave_context(&self, context: &CleaveContext) -> Result<(), StorageError> {
        self.with_conn(|conn| meta::dump_cleave_context(conn, context))
    }

    fn get_sharding_info(&self, key: &str) -> Result<Option<String>, StorageError> {
        let full_key = format!("{SHARD_SYSMETA_PREFIX}{key}");
        self.with_conn(|conn| meta::get_meta(conn, &full_key))
    }

    fn update_sharding_info(&self, items: &[(&str, &str)]) -> Result<(), StorageError> {
        let timestamp = Timestamp::now();
        self.with_conn(|conn| {
            for (key, value) in items {
                let full_key = format!("{SHARD_SYSMETA_PREFIX}{key}");
                meta::upsert_meta(conn, &full_key, value, timestamp)?;
            }
            Ok(())
        })
    }

    fn get_metadata(&self, key: &str) -> Result<Option<String>, StorageError> {
        // A tombstoned container has lost its user-facing sysmeta.
        if self.is_deleted()? {
            return Ok(None);
        }
        self.with_conn(|conn| meta::get_meta(conn, key))
    }

    fn update_metadata(
        &self,
        key: &str,
        value: &str,
        timestamp: Timestamp,
    ) -> Result<(), StorageError> {
        self.with_conn(|conn| meta::upsert_meta(conn, key, value, timestamp))
    }

    fn get_brokers(&self) -> Vec<Arc<dyn ContainerBroker>> {
        vec![Arc::new(self.clone())]
    }

    fn sharding_lock(&self) -> Result<Box<dyn ShardingLock>, StorageError> {
        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_path(&self.inner.path))?;
        let mut lock = fd_lock::RwLock::new(file);
        match lock.try_write() {
            // The guard type borrows the lock, so the held lock travels as
            // the open file instead; it stays locked until the file closes.
            Ok(guard) => std::mem::forget(guard),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                return Err(StorageError::DbLocked {
                    path: self.inner.path.display().to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        }
        Ok(Box::new(CleaveLockGuard { _lock: lock }))
    }

    fn delete_db(&self, timestamp: Timestamp) -> Result<(), StorageError> {
        self.with_conn(|conn| meta::set_delete_timestamp(conn, timestamp))
    }
}
