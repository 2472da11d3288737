//! A file-backed ring: devices and replica count from JSON, deterministic
//! hash-based partition assignment.

use std::hash::Hasher;
use std::path::Path;

use rustc_hash::FxHasher;
use serde::Deserialize;

use cleave_core::errors::SharderError;
use cleave_core::traits::ring::{Ring, RingDevice, RingNode};

#[derive(Debug, Deserialize)]
struct RingFile {
    part_power: u32,
    replica_count: usize,
    devices: Vec<RingFileDevice>,
}

#[derive(Debug, Deserialize)]
struct RingFileDevice {
    id: u64,
    device: String,
    ip: String,
    port: u16,
    #[serde(default)]
    replication_ip: Option<String>,
    #[serde(default)]
    replication_port: Option<u16>,
}

/// An immutable ring loaded at startup.
pub struct StaticRing {
    part_power: u32,
    replica_count: usize,
    devices: Vec<RingDevice>,
}

impl StaticRing {
    pub fn load(path: &Path) -> Result<Self, SharderError> {
        let raw = std::fs::read_to_string(path).map_err(|e| SharderError::Config {
            message: format!("cannot read ring {}: {e}", path.display()),
        })?;
        let file: RingFile = serde_json::from_str(&raw).map_err(|e| SharderError::Config {
            message: format!("cannot parse ring {}: {e}", path.display()),
        })?;
        Self::from_parts(file.part_power, file.replica_count, file.devices)
    }

    pub fn new(
        part_power: u32,
        replica_count: usize,
        devices: Vec<RingDevice>,
    ) -> Result<Self, SharderError> {
        if replica_count == 0 || devices.is_empty() {
            return Err(SharderError::Config {
                message: "ring needs at least one replica and one device".to_string(),
            });
        }
        Ok(Self { part_power, replica_count, devices })
    }

    fn from_parts(
        part_power: u32,
        replica_count: usize,
        devices: Vec<RingFileDevice>,
    ) -> Result<Self, SharderError> {
        let devices = devices
            .into_iter()
            .map(|d| RingDevice {
                replication_ip: d.replication_ip.unwrap_or_else(|| d.ip.clone()),
                replication_port: d.replication_port.unwrap_or(d.port),
                id: d.id,
                device: d.device,
                ip: d.ip,
                port: d.port,
            })
            .collect();
        Self::new(part_power, replica_count, devices)
    }

    pub fn part_count(&self) -> u32 {
        1u32 << self.part_power
    }
}

impl Ring for StaticRing {
    fn replica_count(&self) -> usize {
        self.replica_count
    }

    fn devs(&self) -> Vec<RingDevice> {
        self.devices.clone()
    }

    fn get_part(&self, account: &str, container: &str) -> u32 {
        let mut hasher = FxHasher::default();
        hasher.write(account.as_bytes());
        hasher.write(b"/");
        hasher.write(container.as_bytes());
        (hasher.finish() % u64::from(self.part_count())) as u32
    }

    fn get_part_nodes(&self, part: u32) -> Vec<RingNode> {
        let count = self.replica_count.min(self.devices.len());
        (0..count)
            .map(|index| {
                let device = self.devices[(part as usize + index) % self.devices.len()].clone();
                RingNode { device, index }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(id: u64) -> RingDevice {
        RingDevice {
            id,
            device: format!("sd{id}"),
            ip: "127.0.0.1".to_string(),
            port: 6201,
            replication_ip: "127.0.0.1".to_string(),
            replication_port: 6201,
        }
    }

    #[test]
    fn partition_assignment_is_deterministic_and_in_range() {
        let ring = StaticRing::new(4, 3, (0..5).map(device).collect()).unwrap();
        let part = ring.get_part("acct", "cont");
        assert_eq!(part, ring.get_part("acct", "cont"));
        assert!(part < ring.part_count());
    }

    #[test]
    fn part_nodes_are_distinct_and_indexed() {
        let ring = StaticRing::new(4, 3, (0..5).map(device).collect()).unwrap();
        let nodes = ring.get_part_nodes(7);
        assert_eq!(nodes.len(), 3);
        assert_eq!(nodes[0].index, 0);
        let ids: Vec<u64> = nodes.iter().map(|n| n.device.id).collect();
        let mut deduped = ids.clone();
        deduped.dedup();
        assert_eq!(ids, deduped);
    }

    #[test]
    fn replica_count_is_capped_by_device_count() {
        let ring = StaticRing::new(2, 3, vec![device(0)]).unwrap();
        assert_eq!(ring.get_part_nodes(1).len(), 1);
    }
}
