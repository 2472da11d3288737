//! Root-reporting client: quorum writes of shard-range batches and listing
//! fetches against the root container.

use std::sync::Arc;

use tracing::{error, warn};

use cleave_core::constants::{headers, RECORD_TYPE_SHARD};
use cleave_core::traits::client::{Headers, ShardClient};
use cleave_core::traits::ring::{quorum_size, Ring};
use cleave_core::types::shard_range::ShardRange;
use cleave_core::types::timestamp::Timestamp;

use crate::pool::WorkerPool;

/// Writes shard-range batches to every replica of a container and reads the
/// root's shard listing.
pub struct RootClient {
    client: Arc<dyn ShardClient>,
    ring: Arc<dyn Ring>,
    request_tries: usize,
}

impl RootClient {
    pub fn new(client: Arc<dyn ShardClient>, ring: Arc<dyn Ring>, request_tries: usize) -> Self {
        Self { client, ring, request_tries: request_tries.max(1) }
    }

    /// PUT `ranges` to all replicas of `account/container` in parallel.
    /// True iff a majority of replicas accepted the write. Per-node failures
    /// are logged and counted but do not abort the fan-out.
    pub fn send_shard_ranges(
        &self,
        pool: &WorkerPool,
        account: &str,
        container: &str,
        ranges: &[ShardRange],
        extra_headers: Headers,
    ) -> bool {
        let body = match serde_json::to_vec(ranges) {
            Ok(body) => body,
            Err(e) => {
                error!(account, container, error = %e, "failed to encode shard ranges");
                return false;
            }
        };

        let mut request_headers = extra_headers;
        request_headers.extend([
            (headers::BACKEND_RECORD_TYPE.to_string(), RECORD_TYPE_SHARD.to_string()),
            (headers::TIMESTAMP.to_string(), Timestamp::now().normal()),
            (headers::CONTENT_LENGTH.to_string(), body.len().to_string()),
            (headers::CONTENT_TYPE.to_string(), "application/json".to_string()),
        ]);

        let part = self.ring.get_part(account, container);
        let nodes = self.ring.get_part_nodes(part);
        let body = Arc::new(body);
        let request_headers = Arc::new(request_headers);

        let tasks: Vec<_> = nodes
            .into_iter()
            .map(|node| {
                let client = Arc::clone(&self.client);
                let body = Arc::clone(&body);
                let request_headers = Arc::clone(&request_headers);
                let account = account.to_string();
                let container = container.to_string();
                move || {
                    match client.put_container(
                        &node.device,
                        part,
                        &account,
                        &container,
                        &request_headers,
                        &body,
                    ) {
                        Ok(()) => true,
                        Err(e) => {
                            warn!(
                                ip = %node.device.ip,
                                port = node.device.port,
                                device = %node.device.device,
                                error = %e,
                                "failed to put shard ranges"
                            );
                            false
                        }
                    }
                }
            })
            .collect();

        let successes = pool.run_all(tasks).into_iter().filter(|ok| *ok).count();
        successes >= quorum_size(self.ring.replica_count())
    }

    /// GET the shard-range listing from the root container. `None` is a soft
    /// failure the caller retries next cycle.
    pub fn fetch_shard_ranges(
        &self,
        root_account: &str,
        root_container: &str,
        newest: bool,
    ) -> Option<Vec<ShardRange>> {
        let mut request_headers: Headers =
            vec![(headers::BACKEND_RECORD_TYPE.to_string(), RECORD_TYPE_SHARD.to_string())];
        if newest {
            request_headers.push((headers::NEWEST.to_string(), "true".to_string()));
        }

        let mut last_error = None;
        for _ in 0..self.request_tries {
            match self.client.get_container(root_account, root_container, &request_headers) {
                Ok(body) => match serde_json::from_slice::<Vec<ShardRange>>(&body) {
                    Ok(mut ranges) => {
                        ranges.sort_by(|a, b| a.cmp_bounds(b));
                        return Some(ranges);
                    }
                    Err(e) => {
                        error!(
                            root = format!("{root_account}/{root_container}"),
                            error = %e,
                            "shard range listing is not valid JSON"
                        );
                        return None;
                    }
                },
                Err(e) => {
                    let transient = e.is_transient();
                    last_error = Some(e);
                    if !transient {
                        break;
                    }
                }
            }
        }
        if let Some(e) = last_error {
            error!(
                root = format!("{root_account}/{root_container}"),
                error = %e,
                "failed to get shard ranges"
            );
        }
        None
    }
}
