//! Simulator - Optimizer state conversion scenarios on in-process ranks
//!
//! A [`SimulationConfig`] describes a model (sharded units plus plain
//! parameters), the conversion settings and the world size. [`run`] plays
//! every rank on its own thread over a [`collective::LocalGroup`], loads a
//! reference state dict and saves it back.

pub mod config;
pub mod runner;

pub use config::{ParamSpec, SimulationConfig, UnitSpec};
pub use runner::{build_model, reference_state_dict, run, RankReport, SimulationReport};
