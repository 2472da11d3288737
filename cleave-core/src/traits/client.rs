//! `ShardClient` — direct HTTP access to container servers.

use crate::errors::ClientError;
use crate::traits::ring::RingDevice;

/// Request/response headers as ordered pairs.
pub type Headers = Vec<(String, String)>;

/// A retrying HTTP client for container backends. One implementation talks to
/// real servers; tests substitute in-process fakes.
pub trait ShardClient: Send + Sync {
    /// PUT a container (with a shard-range body) directly to one node.
    fn put_container(
        &self,
        node: &RingDevice,
        part: u32,
        account: &str,
        container: &str,
        headers: &Headers,
        body: &[u8],
    ) -> Result<(), ClientError>;

    /// GET a container listing through the proxy tier; returns the body.
    fn get_container(
        &self,
        account: &str,
        container: &str,
        headers: &Headers,
    ) -> Result<Vec<u8>, ClientError>;
}
