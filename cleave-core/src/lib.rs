//! # cleave-core
//!
//! Foundation crate for the cleave container sharder.
//! Defines the shard-range value types and namespace algebra, the range
//! analyser, the broker/ring/client/replicator contracts, errors, and config.
//! Every other crate in the workspace depends on this.

pub mod analyser;
pub mod config;
pub mod constants;
pub mod errors;
pub mod traits;
pub mod types;

// Re-export the most commonly used types at the crate root.
pub use analyser::{AnalysedPath, RangeAnalyser};
pub use config::SharderConfig;
pub use errors::{AnalyserError, ClientError, SharderError, StorageError};
pub use traits::broker::{
    BrokerInfo, CleaveContext, ContainerBroker, DbState, FoundRange, ObjectRecord,
    ShardRangeFilter,
};
pub use traits::client::ShardClient;
pub use traits::replicator::Replicator;
pub use traits::ring::{quorum_size, Ring, RingDevice, RingNode};
pub use types::shard_range::{ShardRange, ShardState};
pub use types::timestamp::Timestamp;
