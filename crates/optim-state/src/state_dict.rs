//! Optimizer state dict shapes
//!
//! An optimizer state dict has a `state` part, mapping a parameter key to that
//! parameter's per-state-name values, and an optional `param_groups` part.
//! Absence of `param_groups` is preserved through every conversion.

use serde::{Deserialize, Serialize};
use shard_core::{ParamState, StateKey, StateValue, Tensor};
use std::collections::BTreeMap;
use std::fmt;

use crate::key::OptimStateKey;

/// One optimizer parameter group
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParamGroup {
    /// Member parameters in the dict's key scheme
    pub params: Vec<StateKey>,
    /// Every non-parameter field (learning rate, betas, ...)
    pub options: BTreeMap<String, StateValue>,
}

impl ParamGroup {
    pub fn new(params: Vec<StateKey>) -> Self {
        Self {
            params,
            options: BTreeMap::new(),
        }
    }

    pub fn with_option(mut self, name: impl Into<String>, value: impl Into<StateValue>) -> Self {
        self.options.insert(name.into(), value.into());
        self
    }
}

/// Optimizer state dict keyed by local keys or qualified names
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptimStateDict {
    pub state: BTreeMap<StateKey, ParamState>,
    pub param_groups: Option<Vec<ParamGroup>>,
}

impl OptimStateDict {
    pub fn new(state: BTreeMap<StateKey, ParamState>) -> Self {
        Self {
            state,
            param_groups: None,
        }
    }

    pub fn with_param_groups(mut self, param_groups: Vec<ParamGroup>) -> Self {
        self.param_groups = Some(param_groups);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.state.is_empty() && self.param_groups.is_none()
    }

    /// Copy of the dict with `f` applied to every dense tensor, including
    /// tensors nested in group options
    pub fn map_tensors<F>(&self, mut f: F) -> OptimStateDict
    where
        F: FnMut(&Tensor) -> StateValue,
    {
        let state = self
            .state
            .iter()
            .map(|(key, param_state)| {
                let mapped = param_state
                    .iter()
                    .map(|(name, value)| (name.clone(), value.map_tensors(&mut f)))
                    .collect();
                (key.clone(), mapped)
            })
            .collect();
        let param_groups = self.param_groups.as_ref().map(|groups| {
            groups
                .iter()
                .map(|group| ParamGroup {
                    params: group.params.clone(),
                    options: group
                        .options
                        .iter()
                        .map(|(name, value)| (name.clone(), value.map_tensors(&mut f)))
                        .collect(),
                })
                .collect()
        });
        OptimStateDict {
            state,
            param_groups,
        }
    }
}

/// Key of a flattened, not yet rekeyed state dict
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FlatStateKey {
    /// State belonging to a parameter
    Param(OptimStateKey),
    /// User-defined state not associated with any parameter
    User(StateKey),
}

impl fmt::Display for FlatStateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlatStateKey::Param(key) => write!(f, "{}", key),
            FlatStateKey::User(key) => write!(f, "{}", key),
        }
    }
}

/// Flattened state dict, keyed by rank-independent keys
///
/// Produced by [`crate::flatten_optim_state_dict`] and turned into a
/// loadable dict by [`crate::rekey_sharded_optim_state_dict`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShardedOptimStateDict {
    pub state: BTreeMap<FlatStateKey, ParamState>,
    pub param_groups: Option<Vec<ParamGroup>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use shard_core::Device;

    #[test]
    fn test_map_tensors_covers_options() {
        let mut state = BTreeMap::new();
        let mut param_state = ParamState::new();
        param_state.insert(
            "exp_avg".to_string(),
            StateValue::from(Tensor::from_slice(&[1.0f32]).to(Device::Accelerator(0))),
        );
        state.insert(StateKey::from(0), param_state);
        let osd = OptimStateDict::new(state).with_param_groups(vec![ParamGroup::new(vec![
            StateKey::from(0),
        ])
        .with_option("lr", 0.1)
        .with_option(
            "scale",
            Tensor::from_slice(&[2.0f32]).to(Device::Accelerator(0)),
        )]);

        let moved = osd.map_tensors(|t| StateValue::Tensor(t.cpu()));
        let exp_avg = moved.state[&StateKey::from(0)]["exp_avg"].as_tensor().unwrap();
        assert_eq!(exp_avg.device(), Device::Cpu);
        let groups = moved.param_groups.unwrap();
        assert_eq!(groups[0].options["lr"], StateValue::Float(0.1));
        assert_eq!(
            groups[0].options["scale"].as_tensor().unwrap().device(),
            Device::Cpu
        );
    }
}
