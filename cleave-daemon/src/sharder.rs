//! The per-broker processor: a state machine driving scan, create, cleave,
//! misplaced-object sweeps, and shrinking across the local containers.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use cleave_core::constants::{headers, SYSMETA_SHARDING};
use cleave_core::errors::SharderError;
use cleave_core::traits::broker::{ContainerBroker, DbState, FoundRange, ShardRangeFilter};
use cleave_core::traits::client::{Headers, ShardClient};
use cleave_core::traits::replicator::Replicator;
use cleave_core::traits::ring::{Ring, RingNode};
use cleave_core::types::shard_range::{ShardRange, ShardState};
use cleave_core::types::timestamp::Timestamp;
use cleave_core::SharderConfig;
use cleave_store::SqliteBroker;

use crate::client::RootClient;
use crate::pool::WorkerPool;
use crate::stats::SharderStats;

/// Subdirectory of each device holding container databases.
pub const DATADIR: &str = "containers";

/// Shards containers.
pub struct ContainerSharder {
    pub(crate) ring: Arc<dyn Ring>,
    pub(crate) replicator: Arc<dyn Replicator>,
    pub(crate) root_client: RootClient,
    pub(crate) pool: WorkerPool,
    pub(crate) stats: SharderStats,

    pub(crate) devices_root: PathBuf,
    pub(crate) mount_check: bool,
    pub(crate) bind_port: u16,
    pub(crate) my_ips: Vec<String>,

    pub(crate) shard_container_size: u64,
    pub(crate) split_size: u64,
    pub(crate) shrink_size: u64,
    pub(crate) merge_size: u64,
    pub(crate) scanner_batch_size: usize,
    pub(crate) shard_batch_size: usize,
    pub(crate) auto_shard: bool,
    pub(crate) shards_account_prefix: String,

    pub(crate) interval: Duration,
    pub(crate) report_interval: Duration,
    pub(crate) recon_cache_path: PathBuf,
    pub(crate) reported: Instant,

    /// Device id -> device name for every local, mounted device this cycle.
    pub(crate) local_devices: BTreeMap<u64, String>,
    /// Shard brokers replicated during this pass; drained at pass end so a
    /// database is never removed mid-cycle.
    pub(crate) shard_cleanups: BTreeMap<String, Arc<dyn ContainerBroker>>,
}

impl ContainerSharder {
    pub fn new(
        config: &SharderConfig,
        ring: Arc<dyn Ring>,
        client: Arc<dyn ShardClient>,
        replicator: Arc<dyn Replicator>,
    ) -> Result<Self, SharderError> {
        config.validate()?;
        let root_client =
            RootClient::new(client, Arc::clone(&ring), config.effective_request_tries());
        Ok(Self {
            ring,
            replicator,
            root_client,
            pool: WorkerPool::new(config.effective_concurrency()),
            stats: SharderStats::new(),
            devices_root: config.effective_devices_root(),
            mount_check: config.effective_mount_check(),
            bind_port: config.effective_bind_port(),
            my_ips: config.my_ips(),
            shard_container_size: config.effective_shard_container_size(),
            split_size: config.split_size(),
            shrink_size: config.shrink_size(),
            merge_size: config.merge_size(),
            scanner_batch_size: config.effective_scanner_batch_size(),
            shard_batch_size: config.effective_shard_batch_size(),
            auto_shard: config.effective_auto_shard(),
            shards_account_prefix: config.shards_account_prefix(),
            interval: config.effective_interval(),
            report_interval: config.effective_report_interval(),
            recon_cache_path: config.effective_recon_cache_path(),
            reported: Instant::now(),
            local_devices: BTreeMap::new(),
            shard_cleanups: BTreeMap::new(),
        })
    }

    /// Register a device as local and mounted for this cycle (the cycle
    /// driver does this from the ring; tests do it directly).
    pub fn set_local_device(&mut self, id: u64, name: &str) {
        self.local_devices.insert(id, name.to_string());
    }

    pub fn stats(&self) -> &SharderStats {
        &self.stats
    }

    pub(crate) fn send_shard_ranges(
        &self,
        account: &str,
        container: &str,
        ranges: &[ShardRange],
        extra_headers: Headers,
    ) -> bool {
        self.root_client
            .send_shard_ranges(&self.pool, account, container, ranges, extra_headers)
    }

    pub(crate) fn replicate_all(&self, jobs: Vec<(u32, PathBuf, u64)>) {
        let tasks: Vec<_> = jobs
            .into_iter()
            .map(|(part, db_file, node_id)| {
                let replicator = Arc::clone(&self.replicator);
                move || replicator.replicate_db(part, &db_file, node_id)
            })
            .collect();
        self.pool.run_all(tasks);
    }

    /// Pick a local device for the shard's partition: a local primary when we
    /// have one, otherwise any local device as a handoff.
    pub(crate) fn find_local_handoff_for_part(&self, part: u32) -> Option<(u64, String)> {
        for node in self.ring.get_part_nodes(part) {
            if let Some(name) = self.local_devices.get(&node.device.id) {
                return Some((node.device.id, name.clone()));
            }
        }
        self.local_devices.iter().next().map(|(id, name)| (*id, name.clone()))
    }

    /// Open (or create) the local database for a shard range, stamping the
    /// root pointer and sharding flag on first touch (always when `force`).
    pub(crate) fn get_shard_broker(
        &self,
        shard_range: &ShardRange,
        root_path: &str,
        storage_policy_index: i64,
        force: bool,
    ) -> Result<(u32, Arc<dyn ContainerBroker>, u64), SharderError> {
        let part = self.ring.get_part(&shard_range.account, &shard_range.container);
        let (node_id, device) = self.find_local_handoff_for_part(part).ok_or_else(|| {
            SharderError::DeviceUnavailable {
                reason: format!(
                    "no mounted device suitable to handoff container {} in partition {part}",
                    shard_range.name()
                ),
            }
        })?;

        let db_path = self
            .devices_root
            .join(&device)
            .join(DATADIR)
            .join(part.to_string())
            .join(&shard_range.account)
            .join(format!("{}.db", shard_range.container));
        let broker = SqliteBroker::create(
            &db_path,
            &shard_range.account,
            &shard_range.container,
            storage_policy_index,
            Timestamp::now(),
        )?;

        if force || broker.get_sharding_info("Root")?.is_none() {
            broker.merge_shard_ranges(std::slice::from_ref(shard_range))?;
            broker.update_sharding_info(&[("Root", root_path)])?;
            broker.update_metadata(SYSMETA_SHARDING, "True", Timestamp::now())?;
        }

        Ok((part, Arc::new(broker), node_id))
    }

    /// One pass of the state machine over a single broker.
    pub fn process_broker(
        &mut self,
        broker: &Arc<dyn ContainerBroker>,
        node: &RingNode,
        part: u32,
    ) -> Result<(), SharderError> {
        let mut own_shard_range = broker.get_own_shard_range()?;
        let info = broker.get_info()?;
        let mut state = broker.get_db_state()?;
        info!(
            account = %info.account,
            container = %info.container,
            state = state.as_str(),
            "processing container"
        );

        // Always deal with misplaced rows first, even for deleted brokers:
        // new objects may have landed in them and still need to move.
        self.misplaced_objects(broker, &own_shard_range)?;
        if broker.is_deleted()? {
            return Ok(());
        }
        self.shard_cleanups.clear();

        let is_leader = node.index == 0 && self.auto_shard;

        if matches!(state, DbState::Unsharded | DbState::Collapsed) {
            if is_leader && broker.is_root_container()? {
                // Bootstrap sharding of the root container.
                let seeds = vec![own_shard_range.clone()];
                if self.find_sharding_candidates(broker, Some(seeds))? > 0 {
                    own_shard_range = broker.get_own_shard_range()?;
                }
            }

            if !broker.get_shard_ranges(&ShardRangeFilter::default())?.is_empty() {
                // The container was handed shard ranges (replication or a
                // shrink event) rather than finding them itself; the epoch
                // arrived with them.
                let epoch = match broker.get_sharding_info("Epoch")? {
                    Some(raw) => raw.parse().unwrap_or_else(|_| Timestamp::now()),
                    None => Timestamp::now(),
                };
                broker.set_sharding_state(epoch)?;
                state = DbState::Sharding;
            } else if matches!(own_shard_range.state, ShardState::Sharding | ShardState::Shrinking)
            {
                broker.update_sharding_info(&[("Scan-Done", "false")])?;
                own_shard_range.update_state(ShardState::Sharding);
                broker.merge_shard_ranges(std::slice::from_ref(&own_shard_range))?;
                broker.set_sharding_state(Timestamp::now())?;
                state = DbState::Sharding;
            }
        }

        if state == DbState::Sharding {
            let mut num_found = 0;
            let mut num_created = 0;
            let mut scan_complete = broker
                .get_sharding_info("Scan-Done")?
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(false);

            if is_leader && !scan_complete {
                let (complete, found) = self.find_shard_ranges(broker)?;
                scan_complete = complete;
                num_found = found;
            }

            if is_leader {
                num_created = self.create_shard_containers(broker)?;
            }

            if num_found > 0 || num_created > 0 {
                // Share the new ranges with peers so they can start cleaving.
                self.replicate_all(vec![(part, broker.db_file(), node.device.id)]);
            }

            let cleave_complete = self.cleave(broker)?;
            // `done` distinguishes a fully cleaved namespace from one with
            // nothing cleavable yet (e.g. every range still FOUND after a
            // failed create).
            let cursor_done = broker.load_cleave_context()?.done;

            if scan_complete && cleave_complete && cursor_done {
                info!(account = %info.account, container = %info.container, "completed cleaving");
                let mut modified =
                    broker.get_shard_ranges(&ShardRangeFilter::states(&[ShardState::Cleaved]))?;
                for shard_range in &mut modified {
                    shard_range.update_state(ShardState::Active);
                }
                let mut own = broker.get_own_shard_range()?;
                own.update_state(ShardState::Sharded);
                own.update_meta(0, 0);
                if !broker.is_root_container()? && !own.deleted {
                    own.timestamp = Timestamp::now();
                    own.deleted = true;
                }
                modified.push(own);
                broker.merge_shard_ranges(&modified)?;

                if broker.set_sharded_state()? {
                    state = DbState::Sharded;
                } else {
                    debug!(
                        account = %info.account,
                        container = %info.container,
                        "remaining in sharding state"
                    );
                }
            }
        }

        if state == DbState::Sharded && broker.is_root_container()? {
            if is_leader {
                self.find_shrinks(broker)?;
                self.find_sharding_candidates(broker, None)?;
            }
            // Keep pushing the sharding decision to affected shards until
            // they acknowledge it by moving on.
            for shard_range in
                broker.get_shard_ranges(&ShardRangeFilter::states(&[ShardState::Sharding]))?
            {
                self.send_shard_ranges(
                    &shard_range.account,
                    &shard_range.container,
                    std::slice::from_ref(&shard_range),
                    Headers::new(),
                );
            }
        }

        if !broker.is_root_container()? {
            // Update the root with this container's view, even when sharded,
            // in case previous attempts failed. While shrinking, report only
            // our own record so the half-filled acceptor stats stay private.
            if let Some(own) = broker.get_own_shard_range_opt()? {
                broker.merge_shard_ranges(std::slice::from_ref(&own))?;
                let shrinking = own.state == ShardState::Shrinking;
                let ranges = broker.get_shard_ranges(&ShardRangeFilter {
                    include_own: true,
                    include_deleted: true,
                    exclude_others: shrinking,
                    ..Default::default()
                })?;
                self.send_shard_ranges(
                    &broker.root_account()?,
                    &broker.root_container()?,
                    &ranges,
                    Headers::new(),
                );
            }
        }

        info!(
            account = %info.account,
            container = %info.container,
            state = broker.get_db_state()?.as_str(),
            "finished processing container"
        );
        Ok(())
    }

    fn make_shard_ranges(
        &self,
        broker: &Arc<dyn ContainerBroker>,
        shard_data: &[FoundRange],
    ) -> Result<Vec<ShardRange>, SharderError> {
        let timestamp = Timestamp::now();
        let root_account = broker.root_account()?;
        let root_container = broker.root_container()?;
        let parent_container = broker.get_info()?.container;
        let shards_account = format!("{}{root_account}", self.shards_account_prefix);
        Ok(shard_data
            .iter()
            .map(|data| {
                let (account, container) = ShardRange::make_path(
                    &shards_account,
                    &root_container,
                    &parent_container,
                    timestamp,
                    data.index,
                );
                let mut shard_range = ShardRange::new(
                    account,
                    container,
                    timestamp,
                    data.lower.clone(),
                    data.upper.clone(),
                );
                shard_range.object_count = data.object_count;
                shard_range.bytes_used = data.bytes_used;
                shard_range
            })
            .collect())
    }

    /// Scanner: ask the broker for the next batch of split points and record
    /// them. Returns `(scan_complete, num_found)`.
    pub(crate) fn find_shard_ranges(
        &mut self,
        broker: &Arc<dyn ContainerBroker>,
    ) -> Result<(bool, usize), SharderError> {
        let info = broker.get_info()?;
        info!(account = %info.account, container = %info.container, "started scan for shard ranges");
        self.stats.scanned.attempted += 1;

        let start = Instant::now();
        let existing = broker.get_shard_ranges(&ShardRangeFilter::default())?;
        let (shard_data, last_found) =
            broker.find_shard_ranges(self.split_size, self.scanner_batch_size, &existing)?;
        let elapsed = start.elapsed().as_secs_f64();

        if shard_data.is_empty() {
            if last_found {
                info!("already found all shard ranges");
                broker.update_sharding_info(&[("Scan-Done", "true")])?;
            } else {
                self.stats.scanned.failure += 1;
                warn!("no shard ranges found, will try again next cycle");
            }
            return Ok((last_found, 0));
        }

        let shard_ranges = self.make_shard_ranges(broker, &shard_data)?;
        broker.merge_shard_ranges(&shard_ranges)?;
        if !broker.is_root_container()? {
            self.send_shard_ranges(
                &broker.root_account()?,
                &broker.root_container()?,
                &shard_ranges,
                Headers::new(),
            );
        }

        let num_found = shard_ranges.len();
        info!(num_found, "completed scan for shard ranges");
        self.stats.scanned.found += num_found as u64;
        let per_range = elapsed / num_found as f64;
        self.stats.scanned.record_min_time(per_range);
        self.stats.scanned.record_max_time(per_range);

        if last_found {
            broker.update_sharding_info(&[("Scan-Done", "true")])?;
            info!("final shard range reached");
        }
        self.stats.scanned.success += 1;
        Ok((last_found, num_found))
    }

    /// Create shard containers for `Found` ranges so redirection can begin
    /// before cleaving. A creation failure stops the loop: later ranges must
    /// not advance past an earlier one still in `Found`.
    pub(crate) fn create_shard_containers(
        &mut self,
        broker: &Arc<dyn ContainerBroker>,
    ) -> Result<usize, SharderError> {
        let found_ranges =
            broker.get_shard_ranges(&ShardRangeFilter::states(&[ShardState::Found]))?;
        let storage_policy_index = broker.storage_policy_index()?;
        let root_path = broker.root_path()?;
        let mut created_ranges = Vec::new();

        for mut shard_range in found_ranges {
            self.stats.created.attempted += 1;
            // Give the new, empty shard a slightly older record than the one
            // we persist: until cleaving fills it, reports from the shard
            // would otherwise make it look shrink-eligible.
            let mut older = shard_range.clone();
            older.timestamp = shard_range.timestamp.prev_tick();
            older.state_timestamp = older.timestamp;
            older.meta_timestamp = older.timestamp;

            let extra_headers: Headers = vec![
                (
                    headers::BACKEND_STORAGE_POLICY_INDEX.to_string(),
                    storage_policy_index.to_string(),
                ),
                (headers::SYSMETA_SHARD_ROOT.to_string(), root_path.clone()),
                (headers::SYSMETA_SHARDING.to_string(), "True".to_string()),
            ];
            let success = self.send_shard_ranges(
                &shard_range.account,
                &shard_range.container,
                std::slice::from_ref(&older),
                extra_headers,
            );
            if success {
                debug!(shard = %older.name(), "created shard container");
                self.stats.created.success += 1;
            } else {
                error!(shard = %older.name(), "failed to create shard container");
                self.stats.created.failure += 1;
                break;
            }
            shard_range.update_state(ShardState::Created);
            created_ranges.push(shard_range);
        }

        broker.merge_shard_ranges(&created_ranges)?;
        if !broker.is_root_container()? {
            self.send_shard_ranges(
                &broker.root_account()?,
                &broker.root_container()?,
                &created_ranges,
                Headers::new(),
            );
        }
        info!(created = created_ranges.len(), "completed creating shard containers");
        Ok(created_ranges.len())
    }

    /// Mark oversized shards of a root as sharding candidates.
    pub(crate) fn find_sharding_candidates(
        &mut self,
        broker: &Arc<dyn ContainerBroker>,
        shard_ranges: Option<Vec<ShardRange>>,
    ) -> Result<usize, SharderError> {
        let ranges = match shard_ranges {
            Some(ranges) => ranges,
            None => broker.get_shard_ranges(&ShardRangeFilter::states(&[ShardState::Active]))?,
        };
        let mut candidates = Vec::new();
        for mut shard_range in ranges {
            if shard_range.object_count >= self.shard_container_size {
                shard_range.update_state(ShardState::Sharding);
                candidates.push(shard_range);
            }
        }
        broker.merge_shard_ranges(&candidates)?;
        Ok(candidates.len())
    }

    /// Pair undersized shards with their upper neighbours and push the
    /// expanded acceptor to each donor, forcing the donor to cleave itself
    /// into the acceptor.
    pub(crate) fn find_shrinks(
        &mut self,
        broker: &Arc<dyn ContainerBroker>,
    ) -> Result<(), SharderError> {
        let state = broker.get_db_state()?;
        if state != DbState::Sharded {
            warn!("cannot shrink a not yet sharded container");
        }

        let mut shard_ranges = broker.get_shard_ranges(&ShardRangeFilter::default())?;
        let own_shard_range = broker.get_own_shard_range()?;
        let own_name = own_shard_range.name();
        if shard_ranges.len() == 1 {
            // Special case: the final shard shrinks back into the root.
            shard_ranges.push(own_shard_range.clone());
        }

        let mut merge_pairs: Vec<(ShardRange, ShardRange)> = Vec::new();
        for window in shard_ranges.windows(2) {
            let (donor, acceptor) = (&window[0], &window[1]);
            if merge_pairs.iter().any(|(_, a)| a.name() == donor.name()) {
                // One donor per acceptor per cycle keeps the procedure easy
                // to reason about; small ranges retire over later cycles.
                continue;
            }
            let acceptor_is_own = acceptor.name() == own_name;
            if !acceptor_is_own
                && !matches!(acceptor.state, ShardState::Active | ShardState::Expanding)
            {
                continue;
            }
            if !matches!(donor.state, ShardState::Active | ShardState::Shrinking) {
                continue;
            }
            let proposed_object_count = donor.object_count + acceptor.object_count;
            if donor.state == ShardState::Shrinking
                || (donor.object_count < self.shrink_size
                    && proposed_object_count < self.merge_size)
            {
                merge_pairs.push((donor.clone(), acceptor.clone()));
            }
        }

        for (mut donor, mut acceptor) in merge_pairs {
            debug!(donor = %donor.name(), acceptor = %acceptor.name(), "shrinking shard range");
            let mut modified = Vec::new();
            if acceptor.update_state(ShardState::Expanding) {
                modified.push(acceptor.clone());
            }
            // The donor's state_timestamp defines the new epoch for the donor
            // and the timestamp for the expanded acceptor below; it must beat
            // the acceptor's expanding timestamp in any merge.
            let donor_ts = Timestamp::now().max(acceptor.state_timestamp.next_tick());
            if donor.update_state_at(ShardState::Shrinking, donor_ts) {
                modified.push(donor.clone());
            }
            broker.merge_shard_ranges(&modified)?;

            let acceptor_is_own = acceptor.name() == own_name;
            if !acceptor_is_own {
                // Tell the acceptor it is expanding so it does not treat rows
                // cleaved from the donor as misplaced.
                self.send_shard_ranges(
                    &acceptor.account,
                    &acceptor.container,
                    std::slice::from_ref(&acceptor),
                    Headers::new(),
                );
                // The donor gets a copy of the acceptor with the namespace
                // already expanded over the donor and the stats summed.
                let mut expanded = acceptor.clone();
                expanded.timestamp = donor.state_timestamp;
                expanded.lower = donor.lower.clone();
                expanded.state = ShardState::Active;
                expanded.state_timestamp = donor.state_timestamp;
                expanded.meta_timestamp = donor.state_timestamp;
                expanded.object_count = acceptor.object_count + donor.object_count;
                expanded.bytes_used = acceptor.bytes_used + donor.bytes_used;
                acceptor = expanded;
            } else {
                // Shrinking into the root: no namespace or stats change, but
                // the record must outrank the expanding one just written.
                let active_ts = Timestamp::now().max(acceptor.state_timestamp.next_tick());
                acceptor.update_state_at(ShardState::Active, active_ts);
            }

            // Scan-Done stops the donor scanning itself; the epoch makes it
            // enter the sharding state and cleave straight into the acceptor.
            let extra_headers: Headers = vec![
                (headers::SYSMETA_SHARD_SCAN_DONE.to_string(), "true".to_string()),
                (
                    headers::SYSMETA_SHARD_EPOCH.to_string(),
                    donor.state_timestamp.internal(),
                ),
            ];
            let donor_account = donor.account.clone();
            let donor_container = donor.container.clone();
            self.send_shard_ranges(
                &donor_account,
                &donor_container,
                &[donor, acceptor],
                extra_headers,
            );
        }
        Ok(())
    }
}
