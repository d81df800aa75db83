//! Parameter identity maps
//!
//! Ranks agree on "which parameter" through qualified names, never through
//! local optimizer numbering. This module builds the maps between parameter
//! handles, their names and each rank's optimizer keys.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use shard_core::{Error, ParamId, Result, StateKey, StateValue};

use crate::key::{clean_tensor_name, KeyScheme};
use crate::model::{FsdpParamInfo, ModelTraversal};
use crate::optimizer::Optimizer;

/// Parameter to the ordered qualified names referencing it
///
/// A flat parameter maps to the names of the original parameters it packs;
/// a shared parameter maps to every name it is registered under.
#[derive(Debug, Clone, Default)]
pub struct ParamToFqns {
    entries: Vec<(ParamId, Vec<String>)>,
    index: HashMap<ParamId, usize>,
}

impl ParamToFqns {
    pub fn get(&self, param: ParamId) -> Option<&[String]> {
        self.index
            .get(&param)
            .map(|&i| self.entries[i].1.as_slice())
    }

    /// Entries in declaration order
    pub fn iter(&self) -> impl Iterator<Item = (ParamId, &[String])> {
        self.entries
            .iter()
            .map(|(param, names)| (*param, names.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn names_for(&self, param: ParamId) -> Result<&[String]> {
        self.get(param).ok_or_else(|| Error::Internal {
            message: format!("{} is not a parameter of the model", param),
        })
    }
}

/// Build the parameter to qualified names map
pub fn param_to_fqns(model: &dyn ModelTraversal) -> ParamToFqns {
    let units = model.sharded_units();
    let flat_units: HashMap<ParamId, usize> = units
        .iter()
        .enumerate()
        .filter_map(|(i, unit)| unit.flat_param.as_ref().map(|(_, id)| (*id, i)))
        .collect();

    let mut result = ParamToFqns::default();
    for (name, param) in model.named_parameters() {
        if let Some(&slot) = result.index.get(&param) {
            if flat_units.contains_key(&param) {
                continue;
            }
            let cleaned = clean_tensor_name(&name);
            let names = &mut result.entries[slot].1;
            if !names.contains(&cleaned) {
                names.push(cleaned);
            }
            continue;
        }
        let names = match flat_units.get(&param) {
            Some(&i) => {
                let unit = &units[i];
                unit.handle
                    .fqns()
                    .iter()
                    .map(|local| clean_tensor_name(&format!("{}{}", unit.prefix, local)))
                    .collect()
            }
            None => vec![clean_tensor_name(&name)],
        };
        result.index.insert(param, result.entries.len());
        result.entries.push((param, names));
    }
    result
}

/// Flat parameter to its own clean name; empty in original-parameter layout
pub fn flat_param_to_fqn(model: &dyn ModelTraversal) -> HashMap<ParamId, String> {
    model
        .sharded_units()
        .into_iter()
        .filter_map(|unit| {
            unit.flat_param
                .map(|(name, id)| (id, clean_tensor_name(&name)))
        })
        .collect()
}

/// Every managed original parameter name to its flat parameter's info
///
/// All names of one flat parameter share one [`FsdpParamInfo`]. A name
/// claimed by two different flat parameters is an error.
pub fn fqn_to_fsdp_param_info(
    model: &dyn ModelTraversal,
) -> Result<BTreeMap<String, Arc<FsdpParamInfo>>> {
    let mut result: BTreeMap<String, Arc<FsdpParamInfo>> = BTreeMap::new();
    for (unit_idx, unit) in model.sharded_units().into_iter().enumerate() {
        let param_indices: BTreeMap<String, usize> = unit
            .handle
            .fqns()
            .iter()
            .enumerate()
            .map(|(idx, local)| (clean_tensor_name(&format!("{}{}", unit.prefix, local)), idx))
            .collect();
        for fqn in param_indices.keys() {
            if let Some(existing) = result.get(fqn) {
                if existing.unit != unit_idx {
                    return Err(Error::Internal {
                        message: format!(
                            "{} is managed by two flat parameters (units {} and {})",
                            fqn, existing.unit, unit_idx
                        ),
                    });
                }
            }
        }
        let info = Arc::new(FsdpParamInfo {
            unit: unit_idx,
            state: unit.state,
            handle: unit.handle,
            param_indices,
        });
        for fqn in info.param_indices.keys() {
            result.insert(fqn.clone(), info.clone());
        }
    }
    Ok(result)
}

/// Map each of this rank's optimizer keys to its parameter
///
/// Positional IDs are assigned by walking param groups in declared order and
/// each group's members in list order, matching what a freshly built
/// optimizer produces. Named keys are the parameter's current registered name.
pub fn param_key_to_param(
    optim: &dyn Optimizer,
    model: &dyn ModelTraversal,
    scheme: KeyScheme,
    param_to_fqns: &ParamToFqns,
    flat_param_to_fqn: &HashMap<ParamId, String>,
) -> Result<BTreeMap<StateKey, ParamId>> {
    let mut result = BTreeMap::new();
    match scheme {
        KeyScheme::Positional => {
            let params = optim.param_groups().into_iter().flatten();
            for (pid, param) in params.enumerate() {
                result.insert(StateKey::Id(pid), param);
            }
        }
        KeyScheme::Named => {
            let clean_to_current: HashMap<String, String> = model
                .named_parameters()
                .into_iter()
                .map(|(name, _)| (clean_tensor_name(&name), name))
                .collect();
            for param in optim.param_groups().into_iter().flatten() {
                let clean = match flat_param_to_fqn.get(&param) {
                    Some(name) => name.clone(),
                    None => {
                        let names = param_to_fqns.names_for(param)?;
                        if names.len() != 1 {
                            return Err(Error::InvalidOptimInput {
                                message: format!(
                                    "named optimizer parameter {} has names {:?}, expected exactly one",
                                    param, names
                                ),
                            });
                        }
                        names[0].clone()
                    }
                };
                let current = clean_to_current.get(&clean).ok_or_else(|| {
                    let mut known: Vec<String> = clean_to_current.keys().cloned().collect();
                    known.sort();
                    Error::UnknownParamName {
                        name: clean.clone(),
                        known,
                    }
                })?;
                result.insert(StateKey::Name(current.clone()), param);
            }
        }
    }
    Ok(result)
}

/// Inverse of [`param_key_to_param`]
pub fn param_to_param_key(param_key_to_param: &BTreeMap<StateKey, ParamId>) -> HashMap<ParamId, StateKey> {
    param_key_to_param
        .iter()
        .map(|(key, param)| (*param, key.clone()))
        .collect()
}

/// One item of a raw optimizer input
#[derive(Debug, Clone)]
pub enum OptimInput {
    Param(ParamId),
    Group {
        /// `None` models a group missing its parameter list
        params: Option<Vec<ParamId>>,
        options: BTreeMap<String, StateValue>,
    },
}

/// Positional IDs from a raw optimizer input
///
/// Kept for callers that only have the input the optimizer was built from.
/// `None` means the model's de-duplicated parameters in declaration order.
pub fn param_id_to_param_from_optim_input(
    model: &dyn ModelTraversal,
    optim_input: Option<&[OptimInput]>,
) -> Result<BTreeMap<StateKey, ParamId>> {
    let params: Vec<ParamId> = match optim_input {
        None => model.parameters(),
        Some([]) => {
            return Err(Error::InvalidOptimInput {
                message: "Optimizer input should not be empty".to_string(),
            })
        }
        Some(items) => {
            let all_params = items.iter().all(|i| matches!(i, OptimInput::Param(_)));
            let all_groups = items.iter().all(|i| matches!(i, OptimInput::Group { .. }));
            if !all_params && !all_groups {
                return Err(Error::InvalidOptimInput {
                    message: format!(
                        "Optimizer input should be a list of parameters or a list of groups, but got {:?}",
                        items
                    ),
                });
            }
            let mut params = Vec::new();
            for item in items {
                match item {
                    OptimInput::Param(param) => params.push(*param),
                    OptimInput::Group {
                        params: Some(group),
                        ..
                    } => params.extend(group.iter().copied()),
                    OptimInput::Group {
                        params: None,
                        options,
                    } => {
                        return Err(Error::InvalidOptimInput {
                            message: format!(
                                "A parameter group should map \"params\" to a list of the parameters in the group, but got {:?}",
                                options
                            ),
                        })
                    }
                }
            }
            params
        }
    };
    Ok(params
        .into_iter()
        .enumerate()
        .map(|(pid, param)| (StateKey::Id(pid), param))
        .collect())
}

/// Names the identity layer can attribute to a parameter
pub(crate) fn known_flat_names(flat_param_to_fqn: &HashMap<ParamId, String>) -> HashSet<String> {
    flat_param_to_fqn.values().cloned().collect()
}
