//! Conversion entry points
//!
//! Every function here is a collective: all ranks of the group call it with
//! the same model structure and configuration.

use std::collections::{BTreeMap, BTreeSet};

use collective::ProcessGroup;
use shard_core::{
    Error, OptimStateDictConfig, ParamId, ParamLayout, ProfileKind, Profiler, Result, StateKey,
};
use tracing::{info, instrument, warn};

use crate::broadcast::{broadcast_processed_state, broadcast_state};
use crate::convert::{convert_state_with_flat_params, convert_state_with_orig_params, ConvertOptions};
use crate::flatten::{flatten_optim_state, shard_orig_param_state};
use crate::identity::{
    flat_param_to_fqn, fqn_to_fsdp_param_info, known_flat_names, param_id_to_param_from_optim_input,
    param_key_to_param, param_to_fqns, param_to_param_key, OptimInput, ParamToFqns,
};
use crate::key::{KeyScheme, OptimStateKey};
use crate::model::ModelTraversal;
use crate::optimizer::Optimizer;
use crate::reconcile::{map_param_key_to_optim_keys, rekey_sharded_optim_state_dict, unflatten_param_groups};
use crate::state_dict::{FlatStateKey, OptimStateDict, ShardedOptimStateDict};

/// Everything a conversion call needs besides the model and the state
#[derive(Clone, Copy)]
pub struct ConversionContext<'a> {
    pub group: &'a dyn ProcessGroup,
    pub config: &'a OptimStateDictConfig,
    /// Reset when a call starts and dumped when it ends
    pub profiler: &'a Profiler,
}

impl<'a> ConversionContext<'a> {
    pub fn new(
        group: &'a dyn ProcessGroup,
        config: &'a OptimStateDictConfig,
        profiler: &'a Profiler,
    ) -> Self {
        Self {
            group,
            config,
            profiler,
        }
    }
}

/// Where a rank's optimizer keys come from
#[derive(Clone, Copy)]
pub enum KeySource<'a> {
    Optimizer(&'a dyn Optimizer),
    /// Positional keys derived from the optimizer's construction input
    OptimInput(Option<&'a [OptimInput]>),
}

impl KeySource<'_> {
    fn resolve(
        &self,
        model: &dyn ModelTraversal,
        scheme: KeyScheme,
        param_to_fqns: &ParamToFqns,
    ) -> Result<BTreeMap<StateKey, ParamId>> {
        match self {
            KeySource::Optimizer(optim) => param_key_to_param(
                *optim,
                model,
                scheme,
                param_to_fqns,
                &flat_param_to_fqn(model),
            ),
            KeySource::OptimInput(input) => param_id_to_param_from_optim_input(model, *input),
        }
    }

    fn scheme(&self) -> KeyScheme {
        match self {
            KeySource::Optimizer(optim) => optim.key_scheme(),
            KeySource::OptimInput(_) => KeyScheme::Positional,
        }
    }
}

/// Convert a rank's sharded optimizer state into the unflattened form
///
/// `optim_state_dict` is this rank's optimizer state dict. Ranks that are not
/// savers under the configuration take part in every collective and return
/// an empty dict.
#[instrument(skip_all, fields(rank = ctx.group.rank(), layout = ?ctx.config.layout))]
pub fn optim_state_dict(
    ctx: &ConversionContext<'_>,
    model: &dyn ModelTraversal,
    optim_state_dict: &OptimStateDict,
    keys: KeySource<'_>,
) -> Result<OptimStateDict> {
    ctx.profiler.reset();
    let result = {
        let _scope = ctx.profiler.scope(ProfileKind::All);
        optim_state_dict_impl(ctx, model, optim_state_dict, keys)
    };
    ctx.profiler.dump("optim_state_dict() profiling:");
    result
}

fn optim_state_dict_impl(
    ctx: &ConversionContext<'_>,
    model: &dyn ModelTraversal,
    osd: &OptimStateDict,
    keys: KeySource<'_>,
) -> Result<OptimStateDict> {
    let config = ctx.config;
    let profiler = ctx.profiler;
    let to_save = config.is_saver(ctx.group.rank());

    let (fqns, flat_names, param_key_to_param, fqn_to_info) = {
        let _scope = profiler.scope(ProfileKind::Preprocessing);
        let fqns = param_to_fqns(model);
        let flat_names = known_flat_names(&flat_param_to_fqn(model));
        let scheme = match keys {
            KeySource::Optimizer(_) => KeyScheme::infer(osd),
            KeySource::OptimInput(_) => KeyScheme::Positional,
        };
        let param_key_to_param = keys.resolve(model, scheme, &fqns)?;
        let fqn_to_info = fqn_to_fsdp_param_info(model)?;
        (fqns, flat_names, param_key_to_param, fqn_to_info)
    };

    let mapping = {
        let _scope = profiler.scope(ProfileKind::PreprocessingWithComm);
        map_param_key_to_optim_keys(
            &osd.state,
            ctx.group,
            &param_key_to_param,
            &fqns,
            &fqn_to_info,
            config.layout == ParamLayout::OrigParams,
        )?
    };

    let options = ConvertOptions {
        to_save,
        shard_state: config.shard_state,
        use_dtensor: config.use_dtensor,
    };
    let mut state = {
        let _scope = profiler.scope(ProfileKind::StateConverting);
        match config.layout {
            ParamLayout::FlatParams => {
                convert_state_with_flat_params(&mapping, &fqn_to_info, &osd.state, options, profiler)?
            }
            ParamLayout::OrigParams => {
                convert_state_with_orig_params(&mapping, &fqn_to_info, &osd.state, options, profiler)?
            }
        }
    };

    if !to_save {
        return Ok(OptimStateDict::default());
    }

    for (key, value) in &osd.state {
        if state.contains_key(key)
            || key.as_name().is_some_and(|name| flat_names.contains(name))
            || param_key_to_param.contains_key(key)
        {
            continue;
        }
        warn!(
            key = %key,
            "found optimizer state that cannot be mapped to a parameter, copying it as is"
        );
        state.insert(key.clone(), value.clone());
    }

    let param_groups = osd
        .param_groups
        .as_ref()
        .map(|groups| unflatten_param_groups(groups, &param_key_to_param, &fqns))
        .transpose()?;
    info!(entries = state.len(), "converted optimizer state dict");
    Ok(OptimStateDict {
        state,
        param_groups,
    })
}

/// Flatten an unflattened state dict into this rank's shard of it
///
/// `optim_state_dict` may be `None` on non-zero ranks when `rank0_only` is
/// set. `optim` is consulted for parameters that end up with no local state
/// when the optimizer sees original parameters.
#[instrument(skip_all, fields(rank = ctx.group.rank(), layout = ?ctx.config.layout))]
pub fn flatten_optim_state_dict(
    ctx: &ConversionContext<'_>,
    model: &dyn ModelTraversal,
    optim_state_dict: Option<&OptimStateDict>,
    optim: Option<&dyn Optimizer>,
) -> Result<ShardedOptimStateDict> {
    ctx.profiler.reset();
    let result = {
        let _scope = ctx.profiler.scope(ProfileKind::All);
        flatten_optim_state_dict_impl(ctx, model, optim_state_dict, optim)
    };
    ctx.profiler.dump("flatten_optim_state_dict() profiling:");
    result
}

fn flatten_optim_state_dict_impl(
    ctx: &ConversionContext<'_>,
    model: &dyn ModelTraversal,
    osd: Option<&OptimStateDict>,
    optim: Option<&dyn Optimizer>,
) -> Result<ShardedOptimStateDict> {
    let config = ctx.config;
    let group = ctx.group;
    let rank0_only = config.rank0_only;
    let orig_params = config.layout == ParamLayout::OrigParams;

    let fqns = param_to_fqns(model);
    let fqn_to_info = fqn_to_fsdp_param_info(model)?;
    let compute_device = fqn_to_info
        .values()
        .next()
        .map(|info| info.state.compute_device)
        .unwrap_or_else(|| group.default_device());

    let unflat = if rank0_only {
        broadcast_processed_state(osd, group)?
    } else {
        osd.cloned().ok_or_else(|| Error::Schema {
            message: "an optimizer state dict with a state part is required".to_string(),
        })?
    };
    let mut unflat_state = unflat.state;
    let mut user_keys: BTreeSet<StateKey> = unflat_state.keys().cloned().collect();
    let mut flat_state = BTreeMap::new();

    for (param, names) in fqns.iter() {
        let name_keys: Vec<StateKey> = names.iter().map(|n| StateKey::Name(n.clone())).collect();
        let Some(first_present) = name_keys.iter().find(|k| unflat_state.contains_key(*k)).cloned()
        else {
            continue;
        };
        for key in &name_keys {
            user_keys.remove(key);
        }
        if rank0_only {
            for key in &name_keys {
                let Some(param_state) = unflat_state.get_mut(key) else {
                    continue;
                };
                for value in param_state.values_mut() {
                    *value = broadcast_state(value, group, compute_device)?;
                }
            }
        }

        let Some(info) = fqn_to_info.get(&names[0]) else {
            let key = OptimStateKey::new(names.to_vec(), false);
            flat_state.insert(FlatStateKey::Param(key), unflat_state[&first_present].clone());
            continue;
        };
        let flattened = if orig_params {
            let _scope = ctx.profiler.scope(ProfileKind::Resharding);
            let sharded = shard_orig_param_state(info, &names[0], &unflat_state[&first_present])?;
            (!sharded.is_empty()).then_some(sharded)
        } else {
            flatten_optim_state(info, &unflat_state, names)?
        };
        let key = OptimStateKey::new(names.to_vec(), true);
        match flattened {
            Some(state) if !state.is_empty() => {
                flat_state.insert(FlatStateKey::Param(key), state);
            }
            _ if orig_params => match optim.and_then(|o| o.state(param)) {
                Some(own) => {
                    flat_state.insert(FlatStateKey::Param(key), own.clone());
                }
                None if optim.is_some() => {
                    warn!(key = %key, rank = group.rank(), "optimizer state is not on this rank");
                }
                None => {}
            },
            _ => {
                return Err(Error::Internal {
                    message: format!(
                        "the state of {} is empty, which only happens with original parameters",
                        key
                    ),
                });
            }
        }
    }

    for key in user_keys {
        let Some(mut user_state) = unflat_state.remove(&key) else {
            continue;
        };
        if rank0_only && orig_params {
            for value in user_state.values_mut() {
                *value = broadcast_state(value, group, compute_device)?;
            }
        }
        flat_state.insert(FlatStateKey::User(key), user_state);
    }

    info!(entries = flat_state.len(), "flattened optimizer state dict");
    Ok(ShardedOptimStateDict {
        state: flat_state,
        param_groups: unflat.param_groups,
    })
}

/// Turn an unflattened state dict into one this rank's optimizer can load
///
/// Flattens, then rekeys into the optimizer's own key scheme.
#[instrument(skip_all, fields(rank = ctx.group.rank(), layout = ?ctx.config.layout))]
pub fn optim_state_dict_to_load(
    ctx: &ConversionContext<'_>,
    model: &dyn ModelTraversal,
    keys: KeySource<'_>,
    optim_state_dict: Option<&OptimStateDict>,
) -> Result<OptimStateDict> {
    ctx.profiler.reset();
    let result = {
        let _scope = ctx.profiler.scope(ProfileKind::All);
        let scheme = keys.scheme();
        let fallback = match keys {
            KeySource::Optimizer(optim) if scheme == KeyScheme::Named => Some(optim),
            _ => None,
        };
        flatten_optim_state_dict_impl(ctx, model, optim_state_dict, fallback).and_then(|sharded| {
            let fqns = param_to_fqns(model);
            let param_key_to_param = keys.resolve(model, scheme, &fqns)?;
            rekey_sharded_optim_state_dict(sharded, &fqns, &param_to_param_key(&param_key_to_param))
        })
    };
    ctx.profiler.dump("optim_state_dict_to_load() profiling:");
    result
}
