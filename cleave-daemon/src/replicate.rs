//! Stand-in replicator: the replication daemon owns real peer-to-peer moves,
//! so the sharder's hook just records the request.

use std::path::Path;

use tracing::debug;

use cleave_core::traits::replicator::Replicator;

/// Logs replication requests and reports success; the replication daemon
/// picks the databases up on its own schedule.
#[derive(Debug, Default)]
pub struct NoopReplicator;

impl Replicator for NoopReplicator {
    fn replicate_db(&self, part: u32, db_file: &Path, node_id: u64) -> bool {
        debug!(part, node_id, db = %db_file.display(), "replication requested");
        true
    }
}
