//! Collective - Process-group abstraction for cross-rank communication
//!
//! This crate provides:
//! - The [`ProcessGroup`] trait: blocking tensor and byte collectives
//! - [`ObjectCollectives`]: serde-typed object collectives on top of it
//! - [`LocalGroup`]: an in-process, thread-backed group for simulation and tests
//! - [`CollectiveStats`]: per-operation call counters

pub mod group;
pub mod local;
pub mod stats;

pub use group::{ObjectCollectives, ProcessGroup};
pub use local::LocalGroup;
pub use stats::{CollectiveStats, StatsSnapshot};
