//! Optimizer interface and a reference implementation

use std::collections::{BTreeMap, HashMap};

use shard_core::{Error, ParamId, ParamState, Result, StateKey, StateValue};

use crate::key::KeyScheme;
use crate::state_dict::{OptimStateDict, ParamGroup};

/// Optimizer as seen by the conversion code
pub trait Optimizer {
    /// Member parameters of each group, in declared order
    fn param_groups(&self) -> Vec<Vec<ParamId>>;

    /// Current state of one parameter
    fn state(&self, param: ParamId) -> Option<&ParamState>;

    /// State dict in the optimizer's own key scheme
    fn state_dict(&self) -> OptimStateDict;

    /// How [`state_dict`](Self::state_dict) keys its entries
    fn key_scheme(&self) -> KeyScheme {
        KeyScheme::infer(&self.state_dict())
    }
}

/// Group of parameters with shared options
#[derive(Debug, Clone, Default)]
pub struct OptimizerGroup {
    pub params: Vec<ParamId>,
    pub options: BTreeMap<String, StateValue>,
}

impl OptimizerGroup {
    pub fn new(params: Vec<ParamId>) -> Self {
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

/// Optimizer holding explicit per-parameter state
///
/// Keys its state dict positionally unless built with [`SimpleOptimizer::named`].
#[derive(Debug, Clone, Default)]
pub struct SimpleOptimizer {
    groups: Vec<OptimizerGroup>,
    state: HashMap<ParamId, ParamState>,
    names: Option<HashMap<ParamId, String>>,
}

impl SimpleOptimizer {
    pub fn new(groups: Vec<OptimizerGroup>) -> Self {
        Self {
            groups,
            state: HashMap::new(),
            names: None,
        }
    }

    /// Optimizer keyed by qualified names; every grouped parameter needs one
    pub fn named(groups: Vec<OptimizerGroup>, names: HashMap<ParamId, String>) -> Result<Self> {
        if let Some(param) = groups
            .iter()
            .flat_map(|g| g.params.iter())
            .find(|param| !names.contains_key(*param))
        {
            return Err(Error::InvalidOptimInput {
                message: format!("named optimizer has no name for {}", param),
            });
        }
        Ok(Self {
            groups,
            state: HashMap::new(),
            names: Some(names),
        })
    }

    pub fn set_state(&mut self, param: ParamId, state: ParamState) {
        self.state.insert(param, state);
    }

    fn key_for(&self, position: usize, param: ParamId) -> Result<StateKey> {
        match &self.names {
            None => Ok(StateKey::Id(position)),
            Some(names) => names
                .get(&param)
                .map(|name| StateKey::Name(name.clone()))
                .ok_or_else(|| Error::Internal {
                    message: format!("named optimizer has no name for {}", param),
                }),
        }
    }

    fn keyed_params(&self) -> Result<Vec<(StateKey, ParamId)>> {
        self.groups
            .iter()
            .flat_map(|group| group.params.iter().copied())
            .enumerate()
            .map(|(position, param)| Ok((self.key_for(position, param)?, param)))
            .collect()
    }

    /// Replace all state from a dict in this optimizer's key scheme
    pub fn load_state_dict(&mut self, osd: &OptimStateDict) -> Result<()> {
        let keyed: HashMap<StateKey, ParamId> = self.keyed_params()?.into_iter().collect();
        let mut state = HashMap::new();
        for (key, param_state) in &osd.state {
            let param = keyed.get(key).ok_or_else(|| Error::Schema {
                message: format!("state key {} does not name a parameter of this optimizer", key),
            })?;
            state.insert(*param, param_state.clone());
        }
        if let Some(groups) = &osd.param_groups {
            if groups.len() != self.groups.len() {
                return Err(Error::Schema {
                    message: format!(
                        "loaded state dict has {} parameter groups but the optimizer has {}",
                        groups.len(),
                        self.groups.len()
                    ),
                });
            }
            for (group, loaded) in self.groups.iter_mut().zip(groups) {
                group.options = loaded.options.clone();
            }
        }
        self.state = state;
        Ok(())
    }
}

impl Optimizer for SimpleOptimizer {
    fn param_groups(&self) -> Vec<Vec<ParamId>> {
        self.groups.iter().map(|g| g.params.clone()).collect()
    }

    fn state(&self, param: ParamId) -> Option<&ParamState> {
        self.state.get(&param)
    }

    fn state_dict(&self) -> OptimStateDict {
        let mut state = BTreeMap::new();
        let mut param_groups = Vec::with_capacity(self.groups.len());
        let mut position = 0;
        for group in &self.groups {
            let mut params = Vec::with_capacity(group.params.len());
            for &param in &group.params {
                // Names are checked in `named`
                let key = self
                    .key_for(position, param)
                    .unwrap_or(StateKey::Id(position));
                if let Some(param_state) = self.state.get(&param) {
                    state.insert(key.clone(), param_state.clone());
                }
                params.push(key);
                position += 1;
            }
            param_groups.push(ParamGroup {
                params,
                options: group.options.clone(),
            });
        }
        OptimStateDict::new(state).with_param_groups(param_groups)
    }

    fn key_scheme(&self) -> KeyScheme {
        match self.names {
            Some(_) => KeyScheme::Named,
            None => KeyScheme::Positional,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shard_core::Tensor;

    fn step_state(step: i64) -> ParamState {
        let mut s = ParamState::new();
        s.insert("step".to_string(), StateValue::from(Tensor::scalar(step as f32)));
        s
    }

    #[test]
    fn test_positional_ids_follow_group_order() {
        let mut optim = SimpleOptimizer::new(vec![
            OptimizerGroup::new(vec![ParamId(4), ParamId(2)]).with_option("lr", 0.1),
            OptimizerGroup::new(vec![ParamId(0)]),
        ]);
        optim.set_state(ParamId(0), step_state(3));

        let osd = optim.state_dict();
        let groups = osd.param_groups.unwrap();
        assert_eq!(groups[0].params, vec![StateKey::Id(0), StateKey::Id(1)]);
        assert_eq!(groups[1].params, vec![StateKey::Id(2)]);
        assert!(osd.state.contains_key(&StateKey::Id(2)));
        assert_eq!(osd.state.len(), 1);
    }

    #[test]
    fn test_named_state_dict_and_load() {
        let names = HashMap::from([
            (ParamId(0), "net.weight".to_string()),
            (ParamId(1), "net.bias".to_string()),
        ]);
        let mut optim =
            SimpleOptimizer::named(vec![OptimizerGroup::new(vec![ParamId(0), ParamId(1)])], names)
                .unwrap();
        optim.set_state(ParamId(1), step_state(1));

        assert_eq!(optim.key_scheme(), KeyScheme::Named);
        let osd = optim.state_dict();
        assert!(osd.state.contains_key(&StateKey::from("net.bias")));

        let mut fresh = optim.clone();
        fresh.state.clear();
        fresh.load_state_dict(&osd).unwrap();
        assert_eq!(fresh.state(ParamId(1)), Some(&step_state(1)));

        let mut bad = OptimStateDict::default();
        bad.state.insert(StateKey::from("other"), ParamState::new());
        assert!(matches!(fresh.load_state_dict(&bad), Err(Error::Schema { .. })));
    }
}
