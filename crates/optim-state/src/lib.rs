//! Optim State - Sharded optimizer state dict conversion
//!
//! Converts between a rank's sharded optimizer state (keyed by the
//! optimizer's own parameter keys, with flattened or original parameters)
//! and the unflattened form keyed by fully qualified parameter names:
//!
//! - [`optim_state_dict`]: sharded to unflattened, for saving
//! - [`flatten_optim_state_dict`]: unflattened to this rank's shard
//! - [`optim_state_dict_to_load`]: unflattened to a dict the optimizer loads
//!
//! All three are collectives over the model's process group.

pub mod api;
pub mod broadcast;
pub mod chunk;
pub mod consolidate;
pub mod convert;
pub mod flatten;
pub mod identity;
pub mod key;
pub mod model;
pub mod optimizer;
pub mod orig_params;
pub mod reconcile;
pub mod state_dict;

pub use api::{
    flatten_optim_state_dict, optim_state_dict, optim_state_dict_to_load, ConversionContext,
    KeySource,
};
pub use identity::{param_to_fqns, OptimInput, ParamToFqns};
pub use key::{clean_tensor_name, KeyScheme, OptimStateKey};
pub use model::{
    FlatParamGeometry, FlatParamLayout, FsdpParamInfo, ModelTraversal, ShardedModule,
    ShardedUnit, ShardingState,
};
pub use optimizer::{Optimizer, OptimizerGroup, SimpleOptimizer};
pub use reconcile::rekey_sharded_optim_state_dict;
pub use state_dict::{FlatStateKey, OptimStateDict, ParamGroup, ShardedOptimStateDict};
