//! Shared fixtures: a three-device loopback ring, a fake container server
//! backed by local databases, and a recording replicator.
#![allow(dead_code)]

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tempfile::TempDir;

use cleave_core::errors::ClientError;
use cleave_core::traits::broker::ContainerBroker;
use cleave_core::traits::client::{Headers, ShardClient};
use cleave_core::traits::replicator::Replicator;
use cleave_core::traits::ring::{Ring, RingDevice, RingNode};
use cleave_core::types::shard_range::ShardRange;
use cleave_core::types::timestamp::Timestamp;
use cleave_core::{SharderConfig, ShardRangeFilter};
use cleave_daemon::ring::StaticRing;
use cleave_daemon::ContainerSharder;
use cleave_store::SqliteBroker;

pub const DATADIR: &str = "containers";

/// Applies shard-range PUTs straight to the local replica databases the way
/// a container server would, and serves root listings back out of them.
pub struct FakeShardClient {
    devices_root: PathBuf,
    pub fail_devices: Mutex<HashSet<String>>,
}

impl FakeShardClient {
    pub fn new(devices_root: PathBuf) -> Self {
        Self { devices_root, fail_devices: Mutex::new(HashSet::new()) }
    }

    pub fn fail_device(&self, device: &str) {
        self.fail_devices.lock().unwrap().insert(device.to_string());
    }

    pub fn heal_device(&self, device: &str) {
        self.fail_devices.lock().unwrap().remove(device);
    }

    fn find_db(&self, account: &str, container: &str) -> Option<PathBuf> {
        let devices = std::fs::read_dir(&self.devices_root).ok()?;
        for device in devices.filter_map(|e| e.ok()) {
            let datadir = device.path().join(DATADIR);
            let Ok(parts) = std::fs::read_dir(&datadir) else { continue };
            for part in parts.filter_map(|e| e.ok()) {
                let candidate = part.path().join(account).join(format!("{container}.db"));
                if candidate.is_file() {
                    return Some(candidate);
                }
            }
        }
        None
    }
}

fn transport_error(message: impl Into<String>) -> ClientError {
    ClientError::Transport { message: message.into() }
}

impl ShardClient for FakeShardClient {
    fn put_container(
        &self,
        node: &RingDevice,
        part: u32,
        account: &str,
        container: &str,
        headers: &Headers,
        body: &[u8],
    ) -> Result<(), ClientError> {
        if self.fail_devices.lock().unwrap().contains(&node.device) {
            return Err(transport_error(format!("{} is down", node.device)));
        }

        let header = |name: &str| {
            headers
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(name))
                .map(|(_, value)| value.clone())
        };
        let policy_index: i64 = header("X-Backend-Storage-Policy-Index")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        let path = self
            .devices_root
            .join(&node.device)
            .join(DATADIR)
            .join(part.to_string())
            .join(account)
            .join(format!("{container}.db"));
        let broker = SqliteBroker::create(&path, account, container, policy_index, Timestamp::now())
            .map_err(|e| transport_error(e.to_string()))?;

        let apply = |result: Result<(), cleave_core::StorageError>| {
            result.map_err(|e| transport_error(e.to_string()))
        };
        if let Some(root) = header("X-Container-Sysmeta-Shard-Root") {
            apply(broker.update_sharding_info(&[("Root", &root)]))?;
        }
        if let Some(value) = header("X-Container-Sysmeta-Sharding") {
            apply(broker.update_metadata(
                "X-Container-Sysmeta-Sharding",
                &value,
                Timestamp::now(),
            ))?;
        }
        if let Some(value) = header("X-Container-Sysmeta-Shard-Scan-Done") {
            apply(broker.update_sharding_info(&[("Scan-Done", &value)]))?;
        }
        if let Some(value) = header("X-Container-Sysmeta-Shard-Epoch") {
            apply(broker.update_sharding_info(&[("Epoch", &value)]))?;
        }

        if !body.is_empty() {
            let ranges: Vec<ShardRange> =
                serde_json::from_slice(body).map_err(|e| transport_error(e.to_string()))?;
            apply(broker.merge_shard_ranges(&ranges))?;
        }
        Ok(())
    }

    fn get_container(
        &self,
        account: &str,
        container: &str,
        _headers: &Headers,
    ) -> Result<Vec<u8>, ClientError> {
        let path = self
            .find_db(account, container)
            .ok_or(ClientError::Status { status: 404 })?;
        let broker = SqliteBroker::open(&path).map_err(|e| transport_error(e.to_string()))?;
        let ranges = broker
            .get_shard_ranges(&ShardRangeFilter::default())
            .map_err(|e| transport_error(e.to_string()))?;
        serde_json::to_vec(&ranges).map_err(|e| transport_error(e.to_string()))
    }
}

/// Records replication requests and reports success.
#[derive(Default)]
pub struct RecordingReplicator {
    pub calls: Mutex<Vec<(u32, PathBuf, u64)>>,
}

impl Replicator for RecordingReplicator {
    fn replicate_db(&self, part: u32, db_file: &std::path::Path, node_id: u64) -> bool {
        self.calls.lock().unwrap().push((part, db_file.to_path_buf(), node_id));
        true
    }
}

pub struct TestEnv {
    pub _dir: TempDir,
    pub devices_root: PathBuf,
    pub ring: Arc<StaticRing>,
    pub client: Arc<FakeShardClient>,
    pub replicator: Arc<RecordingReplicator>,
}

impl TestEnv {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let devices_root = dir.path().join("node");
        let devices: Vec<RingDevice> = (0..3)
            .map(|i| {
                let name = format!("sd{}", (b'a' + i as u8) as char);
                std::fs::create_dir_all(devices_root.join(&name).join(DATADIR)).unwrap();
                RingDevice {
                    id: i,
                    device: name,
                    ip: "127.0.0.1".to_string(),
                    port: 6201,
                    replication_ip: "127.0.0.1".to_string(),
                    replication_port: 6201,
                }
            })
            .collect();
        let ring = Arc::new(StaticRing::new(6, 3, devices).unwrap());
        let client = Arc::new(FakeShardClient::new(devices_root.clone()));
        Self {
            _dir: dir,
            devices_root,
            ring,
            client,
            replicator: Arc::new(RecordingReplicator::default()),
        }
    }

    pub fn config(&self) -> SharderConfig {
        SharderConfig {
            devices_root: Some(self.devices_root.clone()),
            auto_shard: Some(true),
            concurrency: Some(2),
            recon_cache_path: Some(self._dir.path().join("recon")),
            ..Default::default()
        }
    }

    pub fn sharder(&self, config: &SharderConfig) -> ContainerSharder {
        ContainerSharder::new(
            config,
            Arc::clone(&self.ring) as Arc<dyn Ring>,
            Arc::clone(&self.client) as Arc<dyn ShardClient>,
            Arc::clone(&self.replicator) as Arc<dyn Replicator>,
        )
        .unwrap()
    }

    pub fn part_for(&self, account: &str, container: &str) -> u32 {
        self.ring.get_part(account, container)
    }

    pub fn primary_node(&self, account: &str, container: &str) -> RingNode {
        let part = self.part_for(account, container);
        self.ring.get_part_nodes(part).into_iter().next().unwrap()
    }

    pub fn db_path(&self, device: &str, part: u32, account: &str, container: &str) -> PathBuf {
        self.devices_root
            .join(device)
            .join(DATADIR)
            .join(part.to_string())
            .join(account)
            .join(format!("{container}.db"))
    }

    /// Create a container database on its primary device.
    pub fn create_container(&self, account: &str, container: &str) -> SqliteBroker {
        let node = self.primary_node(account, container);
        let part = self.part_for(account, container);
        let path = self.db_path(&node.device.device, part, account, container);
        SqliteBroker::create(&path, account, container, 0, Timestamp::from_usecs(1)).unwrap()
    }

    /// Open a container database, preferring the primary replica (the copy
    /// the cleaver writes to).
    pub fn open_container(&self, account: &str, container: &str) -> Option<SqliteBroker> {
        let node = self.primary_node(account, container);
        let part = self.part_for(account, container);
        let primary = self.db_path(&node.device.device, part, account, container);
        let path = if primary.is_file() { primary } else { self.client.find_db(account, container)? };
        SqliteBroker::open(&path).ok()
    }
}
