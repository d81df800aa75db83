//! Per-layout state converters for the save direction

use std::collections::BTreeMap;
use std::sync::Arc;

use shard_core::{Error, ParamState, ProfileKind, Profiler, Result, StateKey};
use tracing::debug;

use crate::consolidate::unflatten_optim_state;
use crate::model::FsdpParamInfo;
use crate::orig_params::gather_all_orig_param_state;
use crate::reconcile::KeyMapping;

/// Options shared by both converters
#[derive(Debug, Clone, Copy)]
pub struct ConvertOptions {
    pub to_save: bool,
    pub shard_state: bool,
    pub use_dtensor: bool,
}

fn host_copy(state: &ParamState) -> ParamState {
    state
        .iter()
        .map(|(name, value)| (name.clone(), value.cpu()))
        .collect()
}

/// Copy a parameter the sharding module does not manage
fn copy_non_managed(
    names: &[String],
    state: &ParamState,
    output: &mut BTreeMap<StateKey, ParamState>,
    profiler: &Profiler,
) {
    let _scope = profiler.scope(ProfileKind::NonManagedCopy);
    let copied = host_copy(state);
    for name in names {
        output.insert(StateKey::Name(name.clone()), copied.clone());
    }
}

fn local_state<'a>(
    optim_state: &'a BTreeMap<StateKey, ParamState>,
    param_key: &StateKey,
) -> Result<&'a ParamState> {
    optim_state.get(param_key).ok_or_else(|| Error::Internal {
        message: format!("optimizer key {} has no state", param_key),
    })
}

/// Convert state when the optimizer sees flat parameters
///
/// Every global key must have a local optimizer key in this layout.
pub fn convert_state_with_flat_params(
    mapping: &KeyMapping,
    fqn_to_info: &BTreeMap<String, Arc<FsdpParamInfo>>,
    optim_state: &BTreeMap<StateKey, ParamState>,
    options: ConvertOptions,
    profiler: &Profiler,
) -> Result<BTreeMap<StateKey, ParamState>> {
    let mut output = BTreeMap::new();
    for key in &mapping.all_optim_state_keys {
        let param_key = mapping
            .optim_state_key_to_param_key
            .get(key)
            .ok_or_else(|| Error::Internal {
                message: format!(
                    "with flat parameters every key needs a local optimizer key, {} has none",
                    key
                ),
            })?;
        if key.is_fsdp_managed {
            let info = fqn_to_info.get(key.first_name()).ok_or_else(|| Error::Internal {
                message: format!("{} is managed but has no sharding info", key),
            })?;
            let unflat = unflatten_optim_state(
                info,
                local_state(optim_state, param_key)?,
                options.to_save,
                options.shard_state,
                options.use_dtensor,
                profiler,
            )?;
            if !options.to_save {
                continue;
            }
            if unflat.len() != key.unflat_param_names.len() {
                return Err(Error::Internal {
                    message: format!(
                        "{} unflattened into {} states",
                        key,
                        unflat.len()
                    ),
                });
            }
            for (name, state) in key.unflat_param_names.iter().zip(unflat) {
                output.insert(StateKey::Name(name.clone()), state);
            }
        } else if options.to_save {
            copy_non_managed(
                &key.unflat_param_names,
                local_state(optim_state, param_key)?,
                &mut output,
                profiler,
            );
        }
    }
    Ok(output)
}

/// Convert state when the optimizer sees original parameters
///
/// A rank may lack state for a managed parameter it holds no slice of; it
/// still takes part in that unit's gathers with empty state.
pub fn convert_state_with_orig_params(
    mapping: &KeyMapping,
    fqn_to_info: &BTreeMap<String, Arc<FsdpParamInfo>>,
    optim_state: &BTreeMap<StateKey, ParamState>,
    options: ConvertOptions,
    profiler: &Profiler,
) -> Result<BTreeMap<StateKey, ParamState>> {
    let mut output = BTreeMap::new();
    let mut units: BTreeMap<usize, (Arc<FsdpParamInfo>, BTreeMap<String, ParamState>)> =
        BTreeMap::new();
    for key in &mapping.all_optim_state_keys {
        let param_key = mapping.optim_state_key_to_param_key.get(key);
        if !key.is_fsdp_managed {
            if let (Some(param_key), true) = (param_key, options.to_save) {
                copy_non_managed(
                    &key.unflat_param_names,
                    local_state(optim_state, param_key)?,
                    &mut output,
                    profiler,
                );
            }
            continue;
        }
        let fqn = key.first_name();
        let Some(info) = fqn_to_info.get(fqn) else {
            debug!(fqn = %fqn, "managed key without local sharding info");
            continue;
        };
        let state = match param_key {
            Some(param_key) => local_state(optim_state, param_key)?.clone(),
            None => ParamState::new(),
        };
        units
            .entry(info.unit)
            .or_insert_with(|| (info.clone(), BTreeMap::new()))
            .1
            .insert(fqn.to_string(), state);
    }

    for (info, input_states) in units.into_values() {
        let gathered = gather_all_orig_param_state(
            &info,
            input_states,
            options.shard_state,
            options.use_dtensor,
            options.to_save,
            profiler,
        )?;
        for (fqn, state) in gathered {
            output.insert(StateKey::Name(fqn), state);
        }
    }
    Ok(output)
}
