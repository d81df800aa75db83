//! Cross-rank key reconciliation and rekeying

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use collective::{ObjectCollectives, ProcessGroup};
use shard_core::{Error, ParamId, ParamState, Result, StateKey};
use tracing::{debug, instrument, warn};

use crate::identity::ParamToFqns;
use crate::key::OptimStateKey;
use crate::model::FsdpParamInfo;
use crate::state_dict::{FlatStateKey, OptimStateDict, ParamGroup, ShardedOptimStateDict};

const MISSING_STATES_MESSAGE: &str = "FSDP currently requires each rank to have at least the \
     optimizer states needed by rank 0's optimizer but some ranks are missing some of those states";

/// Globally agreed keys plus this rank's mapping to its own optimizer keys
#[derive(Debug, Clone, Default)]
pub struct KeyMapping {
    /// Keys every rank iterates, in the same order
    pub all_optim_state_keys: Vec<OptimStateKey>,
    /// Local keys only; a global key may be absent here
    pub optim_state_key_to_param_key: HashMap<OptimStateKey, StateKey>,
}

/// Build the global key list and this rank's key mapping
///
/// Only parameters with non-empty local state get a key. With `merge_keys`
/// every rank's keys are unioned and sorted; otherwise rank 0's list is
/// authoritative and every rank must hold state for all of rank 0's keys.
#[instrument(skip_all, fields(rank = group.rank(), merge_keys = merge_keys))]
pub fn map_param_key_to_optim_keys(
    optim_state: &BTreeMap<StateKey, ParamState>,
    group: &dyn ProcessGroup,
    param_key_to_param: &BTreeMap<StateKey, ParamId>,
    param_to_fqns: &ParamToFqns,
    fqn_to_info: &BTreeMap<String, Arc<FsdpParamInfo>>,
    merge_keys: bool,
) -> Result<KeyMapping> {
    let rank = group.rank();
    let mut local_keys = Vec::new();
    let mut optim_state_key_to_param_key = HashMap::new();
    for (param_key, param) in param_key_to_param {
        if optim_state.get(param_key).map_or(true, |s| s.is_empty()) {
            continue;
        }
        let fqns = param_to_fqns.names_for(*param)?;
        let is_fsdp_managed = fqns
            .first()
            .is_some_and(|first| fqn_to_info.contains_key(first));
        let key = OptimStateKey::new(fqns.to_vec(), is_fsdp_managed);
        if rank == 0 || merge_keys {
            local_keys.push(key.clone());
        }
        optim_state_key_to_param_key.insert(key, param_key.clone());
    }

    let all_optim_state_keys = if merge_keys {
        let gathered: Vec<Vec<OptimStateKey>> = group.all_gather_object(&local_keys)?;
        let merged: BTreeSet<OptimStateKey> = gathered.into_iter().flatten().collect();
        merged.into_iter().collect()
    } else {
        let source = (rank == 0).then_some(&local_keys);
        let keys: Vec<OptimStateKey> = group.broadcast_object(source, 0)?;
        check_missing_keys_on_rank(&keys, &optim_state_key_to_param_key, param_key_to_param, group)?;
        keys
    };
    debug!(
        keys = all_optim_state_keys.len(),
        local = optim_state_key_to_param_key.len(),
        "reconciled optimizer state keys"
    );
    Ok(KeyMapping {
        all_optim_state_keys,
        optim_state_key_to_param_key,
    })
}

/// Fail on every rank if any rank lacks state for one of rank 0's keys
///
/// The missing count is all-reduced first so that every rank agrees on
/// whether the diagnostic all-gather happens.
pub fn check_missing_keys_on_rank(
    r0_optim_state_keys: &[OptimStateKey],
    optim_state_key_to_param_key: &HashMap<OptimStateKey, StateKey>,
    param_key_to_param: &BTreeMap<StateKey, ParamId>,
    group: &dyn ProcessGroup,
) -> Result<()> {
    let mut missing: Vec<Vec<String>> = Vec::new();
    for key in r0_optim_state_keys {
        match optim_state_key_to_param_key.get(key) {
            None => missing.push(key.unflat_param_names.clone()),
            Some(param_key) if !param_key_to_param.contains_key(param_key) => {
                return Err(Error::Internal {
                    message: format!("{} maps to unknown optimizer key {}", key, param_key),
                });
            }
            Some(_) => {}
        }
    }

    let total_missing = group.all_reduce_sum(missing.len() as i64)?;
    if total_missing == 0 {
        return Ok(());
    }
    let gathered: Vec<Vec<Vec<String>>> = group.all_gather_object(&missing)?;
    let mut message = MISSING_STATES_MESSAGE.to_string();
    let mut per_rank = Vec::new();
    for (rank, names) in gathered.into_iter().enumerate() {
        if names.is_empty() {
            continue;
        }
        message.push_str(&format!(
            "\nRank {} is missing states for the parameters: {:?}",
            rank, names
        ));
        per_rank.push((rank, names));
    }
    warn!(missing = total_missing, "ranks are missing optimizer states");
    Err(Error::MissingOptimStates {
        message,
        missing: per_rank,
    })
}

/// Rekey a flattened state dict into this rank's optimizer key scheme
///
/// `param_to_param_key` covers the parameters the optimizer owns. A
/// parameter key without a local counterpart falls back to its joined
/// names; user keys pass through.
pub fn rekey_sharded_optim_state_dict(
    sharded_osd: ShardedOptimStateDict,
    param_to_fqns: &ParamToFqns,
    param_to_param_key: &HashMap<ParamId, StateKey>,
) -> Result<OptimStateDict> {
    let mut names_to_param_key: HashMap<Vec<String>, StateKey> = HashMap::new();
    let mut name_to_param_key: HashMap<String, StateKey> = HashMap::new();
    for (param, names) in param_to_fqns.iter() {
        let Some(param_key) = param_to_param_key.get(&param) else {
            continue;
        };
        names_to_param_key.insert(names.to_vec(), param_key.clone());
        for name in names {
            name_to_param_key.insert(name.clone(), param_key.clone());
        }
    }

    let mut state = BTreeMap::new();
    for (key, param_state) in sharded_osd.state {
        let param_key = match key {
            FlatStateKey::User(user_key) => user_key,
            FlatStateKey::Param(optim_key) => {
                match names_to_param_key.get(&optim_key.unflat_param_names) {
                    Some(param_key) => param_key.clone(),
                    None => {
                        warn!(key = %optim_key, "no local optimizer key, keeping parameter names");
                        StateKey::Name(optim_key.unflat_param_names.join(","))
                    }
                }
            }
        };
        state.insert(param_key, param_state);
    }

    let param_groups = match sharded_osd.param_groups {
        None => None,
        Some(groups) => {
            let mut rekeyed = Vec::with_capacity(groups.len());
            for group in groups {
                let mut params = BTreeSet::new();
                for name in &group.params {
                    let name = name.to_string();
                    let param_key = name_to_param_key.get(&name).ok_or_else(|| {
                        let mut known: Vec<String> = name_to_param_key.keys().cloned().collect();
                        known.sort();
                        Error::UnknownParamName {
                            name: name.clone(),
                            known,
                        }
                    })?;
                    params.insert(param_key.clone());
                }
                rekeyed.push(ParamGroup {
                    params: params.into_iter().collect(),
                    options: group.options,
                });
            }
            Some(rekeyed)
        }
    };

    Ok(OptimStateDict {
        state,
        param_groups,
    })
}

/// Rewrite each group's members from local keys to qualified names
pub fn unflatten_param_groups(
    param_groups: &[ParamGroup],
    param_key_to_param: &BTreeMap<StateKey, ParamId>,
    param_to_fqns: &ParamToFqns,
) -> Result<Vec<ParamGroup>> {
    param_groups
        .iter()
        .map(|group| {
            let mut params = Vec::new();
            for param_key in &group.params {
                let param = param_key_to_param.get(param_key).ok_or_else(|| Error::Internal {
                    message: format!("param group member {} is not an optimizer key", param_key),
                })?;
                params.extend(
                    param_to_fqns
                        .names_for(*param)?
                        .iter()
                        .map(|name| StateKey::Name(name.clone())),
                );
            }
            Ok(ParamGroup {
                params,
                options: group.options.clone(),
            })
        })
        .collect()
}
