//! Sharder configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::SharderError;

/// Configuration for the container sharder daemon.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SharderConfig {
    /// Root directory holding one subdirectory per device. Default: /srv/node.
    pub devices_root: Option<PathBuf>,
    /// Skip devices whose mount point is absent. Default: true.
    pub mount_check: Option<bool>,
    /// Replication address used to decide which ring devices are local.
    /// Defaults to the loopback addresses.
    pub bind_ip: Option<String>,
    /// Replication port used to decide which ring devices are local.
    pub bind_port: Option<u16>,
    /// Target max objects per shard; the split target is half this.
    /// Default: 10_000_000.
    pub shard_container_size: Option<u64>,
    /// Percentage of `shard_container_size` below which a shard becomes a
    /// shrink donor. Default: 25.
    pub shard_shrink_point: Option<f64>,
    /// Percentage of `shard_container_size` a merged donor+acceptor pair must
    /// stay below. Default: 75.
    pub shard_shrink_merge_point: Option<f64>,
    /// Ranges discovered per scan call. Default: 10.
    pub shard_scanner_batch_size: Option<usize>,
    /// Ranges cleaved per cycle. Default: 2.
    pub shard_batch_size: Option<usize>,
    /// Retries for root-container requests. Default: 3.
    pub request_tries: Option<usize>,
    /// Connection timeout in seconds. Default: 5.
    pub conn_timeout: Option<f64>,
    /// Response timeout in seconds. Default: 10.
    pub node_timeout: Option<f64>,
    /// Enables leader-only actions (scan, create, shrink-find).
    /// Default: false.
    pub auto_shard: Option<bool>,
    /// Prefix for auto-created shard accounts. Default: ".".
    pub auto_create_account_prefix: Option<String>,
    /// Seconds between cycles in long-running mode. Default: 30.
    pub interval: Option<f64>,
    /// Seconds between periodic stats reports. Default: 3600.
    pub report_interval: Option<f64>,
    /// Directory for the recon cache dump. Default: /var/cache/cleave.
    pub recon_cache_path: Option<PathBuf>,
    /// Worker pool size for fan-out requests. Default: 8.
    pub concurrency: Option<usize>,
}

impl SharderConfig {
    /// Load from a TOML file. Errors here are fatal at daemon start.
    pub fn from_toml_file(path: &Path) -> Result<Self, SharderError> {
        let raw = std::fs::read_to_string(path).map_err(|e| SharderError::Config {
            message: format!("cannot read {}: {e}", path.display()),
        })?;
        let config: Self = toml::from_str(&raw).map_err(|e| SharderError::Config {
            message: format!("cannot parse {}: {e}", path.display()),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject out-of-range values up front rather than mid-cycle.
    pub fn validate(&self) -> Result<(), SharderError> {
        for (name, value) in [
            ("shard_shrink_point", self.effective_shrink_point_pct()),
            ("shard_shrink_merge_point", self.effective_merge_point_pct()),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return Err(SharderError::Config {
                    message: format!("{name} must be between 0 and 100, got {value}"),
                });
            }
        }
        for (name, value) in [
            ("shard_container_size", self.effective_shard_container_size() as usize),
            ("shard_scanner_batch_size", self.effective_scanner_batch_size()),
            ("shard_batch_size", self.effective_shard_batch_size()),
            ("request_tries", self.effective_request_tries()),
            ("concurrency", self.effective_concurrency()),
        ] {
            if value == 0 {
                return Err(SharderError::Config {
                    message: format!("{name} must be positive"),
                });
            }
        }
        Ok(())
    }

    pub fn effective_devices_root(&self) -> PathBuf {
        self.devices_root.clone().unwrap_or_else(|| PathBuf::from("/srv/node"))
    }

    pub fn effective_mount_check(&self) -> bool {
        self.mount_check.unwrap_or(true)
    }

    pub fn effective_bind_port(&self) -> u16 {
        self.bind_port.unwrap_or(6201)
    }

    /// Addresses this host answers replication traffic on.
    pub fn my_ips(&self) -> Vec<String> {
        match &self.bind_ip {
            Some(ip) => vec![ip.clone()],
            None => vec!["127.0.0.1".to_string(), "::1".to_string()],
        }
    }

    pub fn effective_shard_container_size(&self) -> u64 {
        self.shard_container_size.unwrap_or(10_000_000)
    }

    fn effective_shrink_point_pct(&self) -> f64 {
        self.shard_shrink_point.unwrap_or(25.0)
    }

    fn effective_merge_point_pct(&self) -> f64 {
        self.shard_shrink_merge_point.unwrap_or(75.0)
    }

    /// Object count below which a shard becomes a shrink donor.
    pub fn shrink_size(&self) -> u64 {
        (self.effective_shard_container_size() as f64 * self.effective_shrink_point_pct() / 100.0)
            as u64
    }

    /// Object count a merged donor+acceptor pair must stay below.
    pub fn merge_size(&self) -> u64 {
        (self.effective_shard_container_size() as f64 * self.effective_merge_point_pct() / 100.0)
            as u64
    }

    /// Target object count when splitting.
    pub fn split_size(&self) -> u64 {
        self.effective_shard_container_size() / 2
    }

    pub fn effective_scanner_batch_size(&self) -> usize {
        self.shard_scanner_batch_size.unwrap_or(10)
    }

    pub fn effective_shard_batch_size(&self) -> usize {
        self.shard_batch_size.unwrap_or(2)
    }

    pub fn effective_request_tries(&self) -> usize {
        self.request_tries.unwrap_or(3)
    }

    pub fn conn_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.conn_timeout.unwrap_or(5.0))
    }

    pub fn node_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.node_timeout.unwrap_or(10.0))
    }

    pub fn effective_auto_shard(&self) -> bool {
        self.auto_shard.unwrap_or(false)
    }

    /// Account prefix for shard containers: `<prefix>shards_<root account>`.
    pub fn shards_account_prefix(&self) -> String {
        let prefix = self.auto_create_account_prefix.as_deref().unwrap_or(".");
        format!("{prefix}shards_")
    }

    pub fn effective_interval(&self) -> Duration {
        Duration::from_secs_f64(self.interval.unwrap_or(30.0))
    }

    pub fn effective_report_interval(&self) -> Duration {
        Duration::from_secs_f64(self.report_interval.unwrap_or(3600.0))
    }

    pub fn effective_recon_cache_path(&self) -> PathBuf {
        self.recon_cache_path
            .clone()
            .unwrap_or_else(|| PathBuf::from("/var/cache/cleave"))
    }

    pub fn effective_concurrency(&self) -> usize {
        self.concurrency.unwrap_or(8)
    }
}
