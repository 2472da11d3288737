//! Daemon configuration.

mod sharder_config;

pub use sharder_config::SharderConfig;
