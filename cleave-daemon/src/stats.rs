//! Per-cycle counters and the recon cache dump.

use std::path::Path;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tracing::info;

/// Counters for one category of work.
#[derive(Debug, Default, Clone, Serialize)]
pub struct CategoryStats {
    pub attempted: u64,
    pub success: u64,
    pub failure: u64,
    pub skipped: u64,
    pub found: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_time: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_time: Option<f64>,
}

impl CategoryStats {
    pub fn record_min_time(&mut self, seconds: f64) {
        self.min_time = Some(self.min_time.map_or(seconds, |t| t.min(seconds)));
    }

    pub fn record_max_time(&mut self, seconds: f64) {
        self.max_time = Some(self.max_time.map_or(seconds, |t| t.max(seconds)));
    }
}

/// All sharding counters for the current reporting window.
#[derive(Debug, Clone, Serialize)]
pub struct SharderStats {
    pub visited: CategoryStats,
    pub scanned: CategoryStats,
    pub created: CategoryStats,
    pub cleaved: CategoryStats,
    pub misplaced: CategoryStats,
    #[serde(skip)]
    pub start: Instant,
}

impl Default for SharderStats {
    fn default() -> Self {
        Self {
            visited: CategoryStats::default(),
            scanned: CategoryStats::default(),
            created: CategoryStats::default(),
            cleaved: CategoryStats::default(),
            misplaced: CategoryStats::default(),
            start: Instant::now(),
        }
    }
}

impl SharderStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    /// Log one line per category.
    pub fn report(&self) {
        for (category, stats) in [
            ("visited", &self.visited),
            ("scanned", &self.scanned),
            ("created", &self.created),
            ("cleaved", &self.cleaved),
            ("misplaced", &self.misplaced),
        ] {
            info!(
                category,
                attempted = stats.attempted,
                success = stats.success,
                failure = stats.failure,
                skipped = stats.skipped,
                found = stats.found,
                min_time = stats.min_time,
                max_time = stats.max_time,
                "cycle stats"
            );
        }
    }
}

/// Write the recon cache atomically: temp file in the same directory, then
/// rename over the target.
pub fn dump_recon_cache(cache_dir: &Path, stats: &SharderStats) -> std::io::Result<()> {
    std::fs::create_dir_all(cache_dir)?;
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    let payload = serde_json::json!({
        "sharding_stats": stats,
        "sharding_time": stats.elapsed_secs(),
        "sharding_last": now,
    });
    let tmp = cache_dir.join(".sharder.recon.tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(&payload)?)?;
    std::fs::rename(&tmp, cache_dir.join("sharder.recon"))
}
