//! Flatten path: unflattened per-parameter state into flat, sharded state

use std::collections::BTreeMap;

use shard_core::{DType, Device, Error, ParamState, Result, StateKey, StateValue, Tensor};
use tracing::trace;

use crate::chunk::gather_state_dict;
use crate::model::{get_shard, FsdpParamInfo};

/// Flatten the state of every original parameter in one flat parameter
///
/// `unflat_param_names` lists the flat parameter's original parameters in
/// flat order. Returns `None` when none of them has recorded state.
pub fn flatten_optim_state(
    info: &FsdpParamInfo,
    unflat_osd_state: &BTreeMap<StateKey, ParamState>,
    unflat_param_names: &[String],
) -> Result<Option<ParamState>> {
    let handle = &info.handle;
    let state = &info.state;
    if unflat_param_names.len() != handle.num_params() {
        return Err(Error::Internal {
            message: format!(
                "expected {} unflattened parameter names but got {:?}",
                handle.num_params(),
                unflat_param_names
            ),
        });
    }

    let raw: Vec<Option<&ParamState>> = unflat_param_names
        .iter()
        .map(|name| unflat_osd_state.get(&StateKey::Name(name.clone())))
        .collect();
    if raw.iter().all(Option::is_none) {
        return Ok(None);
    }

    let mut unflat_states = Vec::with_capacity(raw.len());
    for param_state in raw {
        unflat_states.push(match param_state {
            Some(s) => Some(gather_state_dict(s, state.process_group.as_ref())?),
            None => None,
        });
    }

    let present: Vec<&ParamState> = unflat_states.iter().flatten().collect();
    let state_names: Vec<&String> = present[0].keys().collect();
    if present
        .iter()
        .any(|s| !s.keys().eq(state_names.iter().copied()))
    {
        return Err(Error::StateNameMismatch {
            param_names: unflat_param_names.to_vec(),
        });
    }

    let mut flat_state = ParamState::new();
    for state_name in state_names {
        let values: Vec<Option<&StateValue>> = unflat_states
            .iter()
            .map(|s| {
                s.as_ref()
                    .and_then(|s| s.get(state_name))
                    .filter(|v| !v.is_none())
            })
            .collect();
        let non_none: Vec<&StateValue> = values.iter().flatten().copied().collect();
        if non_none.is_empty() {
            flat_state.insert(state_name.clone(), StateValue::None);
            continue;
        }

        let are_pos_dim = non_none.iter().all(|v| v.is_pos_dim_tensor());
        let are_zero_dim = non_none.iter().all(|v| v.is_zero_dim_tensor());
        let are_non_tensors = non_none.iter().all(|v| !v.is_tensor());
        let first_type = non_none[0].type_name();
        let single_type = non_none.iter().all(|v| v.type_name() == first_type);
        if !single_type || !(are_pos_dim || are_zero_dim || are_non_tensors) {
            return Err(Error::StateTypeMismatch {
                state_name: state_name.clone(),
                values: format_values(&non_none),
                param_names: unflat_param_names.to_vec(),
            });
        }

        let flat_value = if are_pos_dim {
            let tensors: Vec<Option<&Tensor>> =
                values.iter().map(|v| v.and_then(StateValue::as_tensor)).collect();
            let flat = flatten_tensor_optim_state(info, state_name, &tensors, unflat_param_names)?;
            if state.is_sharded() {
                let (shard, _) = get_shard(&flat, state.rank, state.world_size)?;
                StateValue::Tensor(shard)
            } else {
                StateValue::Tensor(flat)
            }
        } else if are_zero_dim {
            let tensors: Vec<Option<&Tensor>> =
                values.iter().map(|v| v.and_then(StateValue::as_tensor)).collect();
            StateValue::Tensor(flatten_zero_dim_tensor_optim_state(
                state_name,
                &tensors,
                unflat_param_names,
            )?)
        } else {
            flatten_non_tensor_optim_state(state_name, &values, unflat_param_names)?
        };
        trace!(state = %state_name, "flattened state");
        flat_state.insert(state_name.clone(), flat_value);
    }
    Ok(Some(flat_state))
}

fn format_values(values: &[&StateValue]) -> String {
    let parts: Vec<String> = values.iter().map(|v| v.to_string()).collect();
    format!("[{}]", parts.join(", "))
}

/// Concatenate positive-dimension tensor state, zero-filling absent parameters
fn flatten_tensor_optim_state(
    info: &FsdpParamInfo,
    state_name: &str,
    tensors: &[Option<&Tensor>],
    unflat_param_names: &[String],
) -> Result<Tensor> {
    let handle = &info.handle;
    let mut dtypes: Vec<DType> = tensors.iter().flatten().map(|t| t.dtype()).collect();
    dtypes.sort();
    dtypes.dedup();
    if dtypes.len() != 1 {
        return Err(Error::DtypeMismatch {
            state_name: state_name.to_string(),
            dtypes: dtypes.iter().map(|d| d.to_string()).collect(),
            param_names: unflat_param_names.to_vec(),
        });
    }
    let dtype = dtypes[0];

    let mut to_flatten = Vec::with_capacity(tensors.len());
    for ((tensor, shape), name) in tensors.iter().zip(handle.shapes()).zip(unflat_param_names) {
        match tensor {
            None if shape.is_empty() => {
                return Err(Error::UnsupportedZeroDimFlatten {
                    param_name: name.clone(),
                });
            }
            None => to_flatten.push(Tensor::zeros(shape, dtype, Device::Cpu).flatten()),
            Some(t) if t.shape() != shape.as_slice() => {
                return Err(Error::ShapeMismatch {
                    param_name: name.clone(),
                    actual: t.shape().to_vec(),
                    expected: shape.clone(),
                });
            }
            Some(t) => to_flatten.push(t.cpu().flatten()),
        }
    }

    let flat = handle.flatten_tensors(&to_flatten)?;
    if flat.numel() != handle.unpadded_unsharded_size() {
        return Err(Error::FlatSizeMismatch {
            state_name: state_name.to_string(),
            actual: flat.numel(),
            expected: handle.unpadded_unsharded_size(),
        });
    }
    Ok(flat)
}

/// Collapse per-parameter scalar tensors into one
///
/// Every parameter needs a value, and all values and dtypes must agree.
fn flatten_zero_dim_tensor_optim_state(
    state_name: &str,
    tensors: &[Option<&Tensor>],
    unflat_param_names: &[String],
) -> Result<Tensor> {
    let mut values: Vec<Option<&Tensor>> = Vec::new();
    let mut dtypes: Vec<Option<DType>> = Vec::new();
    for tensor in tensors {
        let seen = values.iter().any(|v| match (v, tensor) {
            (Some(a), Some(b)) => a.values_equal(b),
            (None, None) => true,
            _ => false,
        });
        if !seen {
            values.push(*tensor);
        }
        let dtype = tensor.map(|t| t.dtype());
        if !dtypes.contains(&dtype) {
            dtypes.push(dtype);
        }
    }
    match values.as_slice() {
        [Some(value)] => Ok(value.cpu()),
        _ => Err(Error::ScalarValueMismatch {
            state_name: state_name.to_string(),
            values: format_options(&values),
            dtypes: format_options(&dtypes),
            param_names: unflat_param_names.to_vec(),
        }),
    }
}

/// Collapse per-parameter non-tensor values into one
fn flatten_non_tensor_optim_state(
    state_name: &str,
    values: &[Option<&StateValue>],
    unflat_param_names: &[String],
) -> Result<StateValue> {
    let mut distinct: Vec<Option<&StateValue>> = Vec::new();
    for value in values {
        if !distinct.contains(value) {
            distinct.push(*value);
        }
    }
    match distinct.as_slice() {
        [Some(value)] => Ok((*value).clone()),
        _ => {
            let types: Vec<Option<&str>> = values.iter().map(|v| v.map(|v| v.type_name())).collect();
            Err(Error::ScalarValueMismatch {
                state_name: state_name.to_string(),
                values: format_options(&distinct),
                dtypes: format_options(&types),
                param_names: unflat_param_names.to_vec(),
            })
        }
    }
}

fn format_options<T: std::fmt::Display>(items: &[Option<T>]) -> String {
    let parts: Vec<String> = items
        .iter()
        .map(|item| match item {
            Some(v) => v.to_string(),
            None => "None".to_string(),
        })
        .collect();
    format!("{{{}}}", parts.join(", "))
}

/// Slice one original parameter's state down to this rank's part of it
///
/// Used when the optimizer sees original parameters. Sharded values are
/// gathered first, which is a collective, so every rank calls this for the
/// same parameters. Returns an empty state when the parameter has no
/// elements on this rank.
pub fn shard_orig_param_state(
    info: &FsdpParamInfo,
    fqn: &str,
    optim_state: &ParamState,
) -> Result<ParamState> {
    if optim_state.is_empty() {
        return Ok(ParamState::new());
    }
    let state = &info.state;
    let idx = info.index_of(fqn)?;
    let shard_info = *info
        .handle
        .shard_param_info(idx)
        .ok_or_else(|| Error::Internal {
            message: format!("no shard info for {} at index {}", fqn, idx),
        })?;
    let optim_state = gather_state_dict(optim_state, state.process_group.as_ref())?;
    if !shard_info.in_shard {
        return Ok(ParamState::new());
    }

    let mut sharded = ParamState::new();
    for (name, value) in optim_state {
        let value = match value {
            StateValue::Tensor(t) if t.dim() > 0 && state.is_sharded() => {
                let start = shard_info.intra_param_start_idx;
                let len = shard_info.intra_param_end_idx + 1 - start;
                StateValue::Tensor(t.flatten().narrow(start, len)?)
            }
            other => other,
        };
        sharded.insert(name, value);
    }
    Ok(sharded)
}
