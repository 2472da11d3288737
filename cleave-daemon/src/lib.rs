//! # cleave-daemon
//!
//! The container sharder: walks local container databases, splits oversized
//! ones into shards, shrinks undersized shards into neighbours, relocates
//! misplaced object rows, and reconciles the namespace back to the root.

pub mod client;
pub mod daemon;
pub mod http;
pub mod pool;
pub mod replicate;
pub mod ring;
pub mod sharder;
pub mod stats;

mod cleave;
mod misplaced;

pub use client::RootClient;
pub use daemon::sharding_enabled;
pub use pool::WorkerPool;
pub use sharder::ContainerSharder;
pub use stats::SharderStats;
