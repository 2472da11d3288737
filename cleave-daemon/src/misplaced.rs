//! Misplaced-object mover: finds rows outside a broker's owned namespace and
//! forwards them to the shard containers that own them.

use std::path::PathBuf;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

use cleave_core::constants::CONTAINER_LISTING_LIMIT;
use cleave_core::errors::SharderError;
use cleave_core::traits::broker::{ContainerBroker, DbState, ObjectRecord, ShardRangeFilter};
use cleave_core::types::shard_range::{ShardRange, ShardState};

use crate::sharder::ContainerSharder;

/// A namespace `(lower, upper]` whose rows do not belong to the broker.
type Query = (String, String);

struct Placement {
    part: u32,
    broker: Arc<dyn ContainerBroker>,
    node_id: u64,
    range: ShardRange,
    placed: usize,
}

impl ContainerSharder {
    /// Sweep one broker for misplaced rows and move them out. Runs for every
    /// broker ahead of any state work.
    pub(crate) fn misplaced_objects(
        &mut self,
        broker: &Arc<dyn ContainerBroker>,
        own_shard_range: &ShardRange,
    ) -> Result<(), SharderError> {
        if broker.is_deleted()? {
            debug!("not looking for misplaced objects in deleted container");
            return Ok(());
        }
        if own_shard_range.state == ShardState::Expanding {
            // An acceptor must not bounce rows that are being cleaved to it.
            debug!("not looking for misplaced objects in expanding container");
            return Ok(());
        }

        debug!("looking for misplaced objects");
        self.stats.misplaced.attempted += 1;

        let state = broker.get_db_state()?;
        let mut queries: Vec<Query> = Vec::new();
        match state {
            DbState::Sharded => {
                // Everything left in the object table belongs elsewhere.
                queries.push((String::new(), String::new()));
            }
            DbState::Sharding => {
                // Rows behind the cleave cursor have moved on; rows past our
                // upper bound never belonged here.
                let context = broker.load_cleave_context()?;
                if !context.cursor.is_empty() {
                    queries.push((String::new(), context.cursor));
                    if !own_shard_range.upper.is_empty() {
                        queries.push((own_shard_range.upper.clone(), String::new()));
                    }
                }
            }
            _ => {}
        }
        if queries.is_empty() {
            if !own_shard_range.lower.is_empty() {
                queries.push((String::new(), own_shard_range.lower.clone()));
            }
            if !own_shard_range.upper.is_empty() {
                queries.push((own_shard_range.upper.clone(), String::new()));
            }
        }
        if queries.is_empty() {
            return Ok(());
        }

        // Destinations are loaded once, lazily, across all queries.
        let mut destinations: Option<Vec<ShardRange>> = None;
        let mut moved_any = false;
        for (lower, upper) in queries {
            moved_any |=
                self.move_misplaced_objects(broker, &lower, &upper, &mut destinations)?;
        }
        if moved_any {
            self.stats.misplaced.success += 1;
        }

        self.drain_shard_cleanups();
        Ok(())
    }

    /// Pass-end drain: drop the shard brokers replicated during this pass so
    /// nothing removes a database out from under an in-flight step.
    pub(crate) fn drain_shard_cleanups(&mut self) {
        let cleanups = std::mem::take(&mut self.shard_cleanups);
        if !cleanups.is_empty() {
            info!(count = cleanups.len(), "cleaning up replicated shard containers");
        }
    }

    fn destination_ranges(
        &self,
        broker: &Arc<dyn ContainerBroker>,
        cache: &mut Option<Vec<ShardRange>>,
    ) -> Result<Vec<ShardRange>, SharderError> {
        if cache.is_none() {
            let ranges = if broker.is_root_container()? {
                broker.get_shard_ranges(&ShardRangeFilter::default())?
            } else {
                // The root may lag behind a shard mid-shard, so ask for the
                // newest view it has.
                match self.root_client.fetch_shard_ranges(
                    &broker.root_account()?,
                    &broker.root_container()?,
                    true,
                ) {
                    Some(ranges) => ranges,
                    None => {
                        warn!("could not fetch destination shard ranges from root");
                        Vec::new()
                    }
                }
            };
            *cache = Some(ranges);
        }
        Ok(cache.clone().unwrap_or_default())
    }

    /// Walk the query's objects and the destination ranges in parallel,
    /// merging each contiguous run into its destination broker; after
    /// replication the placed rows are removed from the source.
    fn move_misplaced_objects(
        &mut self,
        broker: &Arc<dyn ContainerBroker>,
        lower: &str,
        upper: &str,
        destinations: &mut Option<Vec<ShardRange>>,
    ) -> Result<bool, SharderError> {
        let destinations = self.destination_ranges(broker, destinations)?;
        if destinations.is_empty() {
            warn!("no destinations for misplaced objects; leaving rows for next cycle");
            return Ok(false);
        }

        let info = broker.get_info()?;
        let own_name = format!("{}/{}", info.account, info.container);
        let storage_policy_index = info.storage_policy_index;
        let root_path = broker.root_path()?;
        let end_marker =
            if upper.is_empty() { String::new() } else { format!("{upper}\u{0}") };

        let mut placements: FxHashMap<String, Placement> = FxHashMap::default();
        let mut dest_index = 0usize;
        let mut unplaced = 0usize;
        let mut marker = lower.to_string();

        'pages: loop {
            let objects = broker.get_objects(
                CONTAINER_LISTING_LIMIT,
                &marker,
                &end_marker,
                storage_policy_index,
                true,
            )?;
            let Some(last) = objects.last() else { break };
            marker = last.name.clone();
            let page_len = objects.len();
            let short_page = page_len < CONTAINER_LISTING_LIMIT;

            let mut run: Vec<ObjectRecord> = Vec::new();
            let mut run_dest: Option<usize> = None;
            for (position, object) in objects.into_iter().enumerate() {
                while dest_index < destinations.len()
                    && !destinations[dest_index].upper.is_empty()
                    && object.name.as_str() > destinations[dest_index].upper.as_str()
                {
                    dest_index += 1;
                }
                if dest_index >= destinations.len() {
                    // No destination covers anything this far up the
                    // namespace; the rest of the listing is unplaceable.
                    self.flush_run(&mut placements, &destinations, &mut run, run_dest, &root_path, storage_policy_index)?;
                    warn!("ran out of destination shard ranges");
                    unplaced += page_len - position;
                    unplaced += self.count_remaining(broker, &marker, &end_marker, storage_policy_index)?;
                    break 'pages;
                }
                let dest = &destinations[dest_index];
                if !dest.lower.is_empty() && object.name.as_str() <= dest.lower.as_str() {
                    // In a gap below the current destination.
                    unplaced += 1;
                    continue;
                }
                if dest.name() == own_name {
                    // Mid-shrink the root may have expanded this container;
                    // rows mapping back to us are correctly placed after all.
                    continue;
                }
                if run_dest != Some(dest_index) {
                    self.flush_run(&mut placements, &destinations, &mut run, run_dest, &root_path, storage_policy_index)?;
                    run_dest = Some(dest_index);
                }
                run.push(object);
            }
            self.flush_run(&mut placements, &destinations, &mut run, run_dest, &root_path, storage_policy_index)?;

            if short_page {
                break;
            }
        }

        if unplaced > 0 {
            warn!(unplaced, "failed to find destinations for misplaced objects");
        }
        if placements.is_empty() {
            return Ok(false);
        }

        // Replicate every target before touching the source, then drop the
        // placed rows. Rows that found no destination stay put for retry.
        let jobs: Vec<(u32, PathBuf, u64)> = placements
            .values()
            .map(|p| (p.part, p.broker.db_file(), p.node_id))
            .collect();
        self.replicate_all(jobs);

        let mut placed = 0usize;
        for placement in placements.into_values() {
            debug!(dest = %placement.range.name(), "moving misplaced objects");
            broker.remove_objects(
                &placement.range.lower,
                &placement.range.upper,
                storage_policy_index,
            )?;
            placed += placement.placed;
            self.shard_cleanups
                .insert(placement.range.name(), placement.broker);
        }
        debug!(placed, "moved misplaced objects");
        Ok(true)
    }

    fn flush_run(
        &self,
        placements: &mut FxHashMap<String, Placement>,
        destinations: &[ShardRange],
        run: &mut Vec<ObjectRecord>,
        run_dest: Option<usize>,
        root_path: &str,
        storage_policy_index: i64,
    ) -> Result<(), SharderError> {
        let Some(dest_index) = run_dest else {
            run.clear();
            return Ok(());
        };
        if run.is_empty() {
            return Ok(());
        }
        let dest = &destinations[dest_index];
        let name = dest.name();
        if !placements.contains_key(&name) {
            let (part, dest_broker, node_id) =
                self.get_shard_broker(dest, root_path, storage_policy_index, false)?;
            placements.insert(
                name.clone(),
                Placement { part, broker: dest_broker, node_id, range: dest.clone(), placed: 0 },
            );
        }
        let placement = placements.get_mut(&name).unwrap_or_else(|| unreachable!());
        placement.broker.merge_items(run)?;
        placement.placed += run.len();
        run.clear();
        Ok(())
    }

    fn count_remaining(
        &self,
        broker: &Arc<dyn ContainerBroker>,
        marker: &str,
        end_marker: &str,
        storage_policy_index: i64,
    ) -> Result<usize, SharderError> {
        let mut total = 0usize;
        let mut marker = marker.to_string();
        loop {
            let objects = broker.get_objects(
                CONTAINER_LISTING_LIMIT,
                &marker,
                end_marker,
                storage_policy_index,
                true,
            )?;
            let Some(last) = objects.last() else { break };
            total += objects.len();
            if objects.len() < CONTAINER_LISTING_LIMIT {
                break;
            }
            marker = last.name.clone();
        }
        Ok(total)
    }
}
