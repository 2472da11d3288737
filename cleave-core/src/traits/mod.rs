//! Contracts for the sharder's collaborators.
//!
//! Concrete implementations plug in from other crates; tests use fakes.

pub mod broker;
pub mod client;
pub mod replicator;
pub mod ring;
