//! Shard Core - Foundation for sharded optimizer state conversion
//!
//! Provides the host tensor type, optimizer state values, error handling,
//! configuration and the scoped profiler used by the collective and
//! conversion crates.

pub mod config;
pub mod error;
pub mod profiler;
pub mod tensor;
pub mod types;
pub mod value;

pub use config::{
    CollectiveConfig, OsdConfig, OptimStateDictConfig, ParamLayout, ShardingConfig,
    ShardingStrategy,
};
pub use error::{Error, Result};
pub use profiler::{ProfileKind, ProfileReport, Profiler};
pub use tensor::{DType, Device, Element, Tensor};
pub use types::*;
pub use value::{ParamState, PosDimTensorInfo, ShardPlacement, ShardedTensor, StateValue};
