//! Shared constants: listing page size, wire headers, sysmeta keys.

/// Maximum number of object rows fetched per listing page.
pub const CONTAINER_LISTING_LIMIT: usize = 10_000;

/// Record type tag for shard-range requests.
pub const RECORD_TYPE_SHARD: &str = "shard";

/// Sysmeta key marking a container as a sharding candidate.
pub const SYSMETA_SHARDING: &str = "X-Container-Sysmeta-Sharding";

/// Prefix under which sharding bookkeeping keys are stored
/// (`Root`, `Scan-Done`, `Epoch`).
pub const SHARD_SYSMETA_PREFIX: &str = "X-Container-Sysmeta-Shard-";

/// Request headers understood by the container backends.
pub mod headers {
    pub const BACKEND_RECORD_TYPE: &str = "X-Backend-Record-Type";
    pub const BACKEND_STORAGE_POLICY_INDEX: &str = "X-Backend-Storage-Policy-Index";
    pub const TIMESTAMP: &str = "X-Timestamp";
    pub const NEWEST: &str = "X-Newest";
    pub const CONTENT_TYPE: &str = "Content-Type";
    pub const CONTENT_LENGTH: &str = "Content-Length";
    pub const SYSMETA_SHARD_ROOT: &str = "X-Container-Sysmeta-Shard-Root";
    pub const SYSMETA_SHARDING: &str = "X-Container-Sysmeta-Sharding";
    pub const SYSMETA_SHARD_SCAN_DONE: &str = "X-Container-Sysmeta-Shard-Scan-Done";
    pub const SYSMETA_SHARD_EPOCH: &str = "X-Container-Sysmeta-Shard-Epoch";
}
