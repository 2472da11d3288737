//! `Replicator` — pushes a local database to its peer nodes.

use std::path::Path;

/// Best-effort database replication. Failures are retried on later cycles by
/// the replication daemon, so callers treat the result as advisory.
pub trait Replicator: Send + Sync {
    fn replicate_db(&self, part: u32, db_file: &Path, node_id: u64) -> bool;
}
