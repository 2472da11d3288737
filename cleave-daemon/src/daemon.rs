//! Cycle driver: walks local partitions, gates by ring membership and mount
//! state, and dispatches each container database to the processor.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tracing::{error, info, warn};

use cleave_core::constants::SYSMETA_SHARDING;
use cleave_core::errors::{SharderError, StorageError};
use cleave_core::traits::broker::{ContainerBroker, ShardRangeFilter};
use cleave_core::traits::ring::is_local_device;
use cleave_store::SqliteBroker;

use crate::sharder::{ContainerSharder, DATADIR};
use crate::stats::{dump_recon_cache, SharderStats};

/// Whether the sharder should process this broker. The sysmeta flag is the
/// normal signal, but a deletion tombstone strips sysmeta, so any shard-range
/// row also qualifies.
pub fn sharding_enabled(broker: &dyn ContainerBroker) -> Result<bool, StorageError> {
    if let Some(value) = broker.get_metadata(SYSMETA_SHARDING)? {
        if value.eq_ignore_ascii_case("true") {
            return Ok(true);
        }
    }
    let ranges = broker.get_shard_ranges(&ShardRangeFilter {
        include_own: true,
        include_deleted: true,
        ..Default::default()
    })?;
    Ok(!ranges.is_empty())
}

/// Interleave partitions across datadirs so one device cannot starve the
/// others, yielding `(partition, db_path, device_id)` triples.
pub fn roundrobin_datadirs(dirs: &[(PathBuf, u64)]) -> Vec<(u32, PathBuf, u64)> {
    let mut queues: Vec<(Vec<u32>, &PathBuf, u64)> = dirs
        .iter()
        .map(|(datadir, device_id)| {
            let mut parts: Vec<u32> = std::fs::read_dir(datadir)
                .map(|entries| {
                    entries
                        .filter_map(|e| e.ok())
                        .filter(|e| e.path().is_dir())
                        .filter_map(|e| e.file_name().to_string_lossy().parse().ok())
                        .collect()
                })
                .unwrap_or_default();
            parts.sort_unstable();
            parts.reverse();
            (parts, datadir, *device_id)
        })
        .collect();

    let mut result = Vec::new();
    loop {
        let mut progressed = false;
        for (parts, datadir, device_id) in &mut queues {
            let Some(part) = parts.pop() else { continue };
            progressed = true;
            let part_dir = datadir.join(part.to_string());
            for db in find_container_dbs(&part_dir) {
                result.push((part, db, *device_id));
            }
        }
        if !progressed {
            break;
        }
    }
    result
}

/// Database files under a partition directory, at most two levels deep
/// (`<part>/<account>/<container>.db`), sorted for determinism.
fn find_container_dbs(part_dir: &Path) -> Vec<PathBuf> {
    fn walk(dir: &Path, depth: usize, out: &mut Vec<PathBuf>) {
        let Ok(entries) = std::fs::read_dir(dir) else { return };
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.is_dir() && depth > 0 {
                walk(&path, depth - 1, out);
            } else if path.extension().is_some_and(|ext| ext == "db") {
                out.push(path);
            }
        }
    }
    let mut dbs = Vec::new();
    walk(part_dir, 2, &mut dbs);
    dbs.sort();
    dbs
}

impl ContainerSharder {
    /// One full pass over every eligible local container.
    pub fn run_cycle(
        &mut self,
        override_devices: &[String],
        override_partitions: &[String],
    ) -> Result<(), SharderError> {
        info!(auto_shard = self.auto_shard, "container sharder cycle starting");
        if !override_devices.is_empty() {
            info!(devices = ?override_devices, "device override");
        }
        if !override_partitions.is_empty() {
            info!(partitions = ?override_partitions, "partition override");
        }
        self.stats = SharderStats::new();
        self.shard_cleanups.clear();
        self.local_devices.clear();

        let mut dirs: Vec<(PathBuf, u64)> = Vec::new();
        for device in self.ring.devs() {
            if !override_devices.is_empty() && !override_devices.contains(&device.device) {
                continue;
            }
            if !is_local_device(&self.my_ips, self.bind_port, &device) {
                continue;
            }
            let mount = self.devices_root.join(&device.device);
            if self.mount_check && !mount.is_dir() {
                warn!(device = %device.device, "skipping device: not mounted");
                continue;
            }
            // Track every local device so shard handoffs can land on it.
            self.local_devices.insert(device.id, device.device.clone());
            let datadir = mount.join(DATADIR);
            if datadir.is_dir() {
                dirs.push((datadir, device.id));
            }
        }
        if dirs.is_empty() {
            warn!("found no data dirs");
        }

        for (part, db_path, device_id) in roundrobin_datadirs(&dirs) {
            if !override_partitions.is_empty()
                && !override_partitions.contains(&part.to_string())
            {
                continue;
            }
            let Some(node) = self
                .ring
                .get_part_nodes(part)
                .into_iter()
                .find(|n| n.device.id == device_id)
            else {
                // Not assigned here any more; the db is a handoff awaiting
                // replication, not ours to shard.
                warn!(part, device_id, "no ring node matches this device");
                continue;
            };

            let broker: Arc<dyn ContainerBroker> = match SqliteBroker::open(&db_path) {
                Ok(broker) => Arc::new(broker),
                Err(e) => {
                    self.stats.visited.failure += 1;
                    error!(db = %db_path.display(), error = %e, "cannot open container database");
                    continue;
                }
            };

            match sharding_enabled(&*broker) {
                Ok(true) => {
                    self.stats.visited.attempted += 1;
                    match self.process_broker(&broker, &node, part) {
                        Ok(()) => self.stats.visited.success += 1,
                        Err(e) => {
                            self.stats.visited.failure += 1;
                            error!(db = %db_path.display(), error = %e, "unhandled error processing container");
                        }
                    }
                }
                Ok(false) => {
                    self.stats.visited.skipped += 1;
                    info!(db = %db_path.display(), "skipping: sharding is not enabled");
                }
                Err(e) => {
                    self.stats.visited.failure += 1;
                    error!(db = %db_path.display(), error = %e, "cannot inspect container database");
                }
            }

            self.periodic_report_stats();
        }

        self.drain_shard_cleanups();
        self.report_stats();
        Ok(())
    }

    fn report_stats(&mut self) {
        self.stats.report();
        if let Err(e) = dump_recon_cache(&self.recon_cache_path, &self.stats) {
            warn!(error = %e, "failed to write recon cache");
        }
        self.reported = Instant::now();
    }

    fn periodic_report_stats(&mut self) {
        if self.reported.elapsed() >= self.report_interval {
            self.report_stats();
            self.stats = SharderStats::new();
        }
    }

    /// Run one cycle, honouring device and partition overrides.
    pub fn run_once(
        &mut self,
        devices: &[String],
        partitions: &[String],
    ) -> Result<(), SharderError> {
        info!("begin container sharder once mode");
        let begin = Instant::now();
        let result = self.run_cycle(devices, partitions);
        info!(elapsed = begin.elapsed().as_secs_f64(), "container sharder once mode completed");
        result
    }

    /// Run until stopped, sleeping out the remainder of each interval.
    pub fn run_forever(&mut self) -> ! {
        loop {
            let begin = Instant::now();
            if let Err(e) = self.run_cycle(&[], &[]) {
                error!(error = %e, "exception in sharder cycle");
            }
            let elapsed = begin.elapsed();
            info!(elapsed = elapsed.as_secs_f64(), "container sharder cycle completed");
            if elapsed < self.interval {
                std::thread::sleep(self.interval - elapsed);
            }
        }
    }
}
