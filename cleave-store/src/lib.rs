//! # cleave-store
//!
//! SQLite persistence for the cleave sharder: one database file per
//! container, exposed through the `ContainerBroker` trait from `cleave-core`.

pub mod broker;
pub mod queries;
pub mod schema;

pub use broker::SqliteBroker;
