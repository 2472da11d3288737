//! The cleaver: incremental object-row copy from a sharding container into
//! its shard databases, resumable through the persisted cleave context.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use cleave_core::constants::CONTAINER_LISTING_LIMIT;
use cleave_core::errors::{SharderError, StorageError};
use cleave_core::traits::broker::{ContainerBroker, DbState, ShardRangeFilter};
use cleave_core::types::shard_range::{cmp_upper, ShardRange, ShardState};
use cleave_core::types::timestamp::Timestamp;

use crate::sharder::ContainerSharder;

impl ContainerSharder {
    /// Copy one range's objects from every source database into the shard
    /// broker, pages of `CONTAINER_LISTING_LIMIT`, tombstones included.
    fn copy_objects(
        &self,
        sources: &[Arc<dyn ContainerBroker>],
        shard_range: &ShardRange,
        shard_broker: &Arc<dyn ContainerBroker>,
        storage_policy_index: i64,
    ) -> Result<(), SharderError> {
        let end_marker = shard_range.end_marker();
        for source in sources {
            let mut marker = shard_range.lower.clone();
            loop {
                let objects = source.get_objects(
                    CONTAINER_LISTING_LIMIT,
                    &marker,
                    &end_marker,
                    storage_policy_index,
                    true,
                )?;
                let Some(last) = objects.last() else { break };
                marker = last.name.clone();
                let short_page = objects.len() < CONTAINER_LISTING_LIMIT;
                shard_broker.merge_items(&objects)?;
                if short_page {
                    break;
                }
            }
        }
        Ok(())
    }

    /// Cleave the next batch of pending shard ranges. True iff every pending
    /// range was completed this call.
    pub(crate) fn cleave(
        &mut self,
        broker: &Arc<dyn ContainerBroker>,
    ) -> Result<bool, SharderError> {
        if broker.get_db_state()? == DbState::Sharded {
            debug!("passing over already sharded container");
            return Ok(true);
        }

        let mut context = broker.load_cleave_context()?;
        if context.done {
            debug!("passing over already cleaved container");
            return Ok(true);
        }

        let ranges_todo = broker.get_shard_ranges(&ShardRangeFilter {
            marker: Some(format!("{}\u{0}", context.cursor)),
            states: Some(vec![ShardState::Created, ShardState::Cleaved, ShardState::Active]),
            ..Default::default()
        })?;
        if ranges_todo.is_empty() {
            debug!("no uncleaved shard ranges");
            return Ok(true);
        }
        debug!(
            resuming = !context.cursor.is_empty(),
            todo = ranges_todo.len(),
            "cleaving container"
        );

        let mut own_shard_range = broker.get_own_shard_range()?;
        let storage_policy_index = broker.storage_policy_index()?;
        let root_path = broker.root_path()?;
        let sources = broker.get_brokers();
        let todo_count = ranges_todo.len();
        let mut ranges_done: Vec<ShardRange> = Vec::new();
        let mut replication_jobs: Vec<(u32, PathBuf, u64)> = Vec::new();

        for mut shard_range in ranges_todo.into_iter().take(self.shard_batch_size) {
            info!(shard = %shard_range.name(), "cleaving shard range");
            self.stats.cleaved.attempted += 1;
            let start = Instant::now();
            // An acceptor spanning our whole namespace means we are the donor
            // in a shrink, not splitting into children.
            let shrinking = shard_range.includes(&own_shard_range);

            // Force so existing shard metadata timestamps move with us.
            let (new_part, new_broker, node_id) = match self.get_shard_broker(
                &shard_range,
                &root_path,
                storage_policy_index,
                true,
            ) {
                Ok(target) => target,
                Err(SharderError::DeviceUnavailable { reason }) => {
                    warn!(reason, "cleave target unavailable");
                    self.stats.cleaved.failure += 1;
                    return Ok(false);
                }
                Err(e) => return Err(e),
            };

            match new_broker.sharding_lock() {
                Ok(_lock) => {
                    self.copy_objects(&sources, &shard_range, &new_broker, storage_policy_index)?;
                }
                Err(StorageError::DbLocked { path }) => {
                    warn!(path, "shard database locked by a concurrent cleave");
                    self.stats.cleaved.failure += 1;
                    return Ok(false);
                }
                Err(e) => return Err(e.into()),
            }

            if shrinking {
                // Hand the acceptor a deleted copy of our own record so its
                // next root report atomically expands the acceptor namespace
                // and retires this donor.
                if own_shard_range.state != ShardState::Sharded {
                    let now = Timestamp::now();
                    let mut retired = own_shard_range.clone();
                    retired.timestamp = now;
                    retired.deleted = true;
                    retired.state = ShardState::Sharded;
                    retired.state_timestamp = now;
                    broker.merge_shard_ranges(std::slice::from_ref(&retired))?;
                    new_broker.merge_shard_ranges(std::slice::from_ref(&retired))?;
                    own_shard_range = retired;
                }
            } else if shard_range.state == ShardState::Created {
                // The stats found at scan time are stale; replace them with
                // what actually landed in the shard broker. On the root the
                // range is immediately authoritative; on a shard it stays
                // CLEAVED until the whole namespace is done.
                let shard_info = new_broker.get_info()?;
                shard_range.update_meta(shard_info.object_count, shard_info.bytes_used);
                if broker.is_root_container()? {
                    shard_range.update_state(ShardState::Active);
                } else {
                    shard_range.update_state(ShardState::Cleaved);
                }
                new_broker.merge_shard_ranges(std::slice::from_ref(&shard_range))?;
            }

            info!(shard = %shard_range.name(), "replicating cleaved shard container");
            replication_jobs.push((new_part, new_broker.db_file(), node_id));
            self.shard_cleanups.insert(shard_range.name(), Arc::clone(&new_broker));

            ranges_done.push(shard_range);
            self.stats.cleaved.success += 1;
            let elapsed = start.elapsed().as_secs_f64();
            self.stats.cleaved.record_min_time(elapsed);
            self.stats.cleaved.record_max_time(elapsed);
        }

        if ranges_done.is_empty() {
            warn!("no progress made cleaving");
        } else {
            broker.merge_shard_ranges(&ranges_done)?;
            let last = ranges_done.last().unwrap_or_else(|| unreachable!());
            context.cursor = last.upper.clone();
            if cmp_upper(&context.cursor, &own_shard_range.upper) != std::cmp::Ordering::Less {
                context.done = true;
            }
            broker.dump_cleave_context(&context)?;
        }

        self.replicate_all(replication_jobs);
        Ok(ranges_done.len() == todo_count)
    }
}
