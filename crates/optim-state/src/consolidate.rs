//! Unflatten path for flat parameters
//!
//! A flat parameter's optimizer state is first made whole on every rank
//! ([`communicate_optim_state`]) and then cut back into one state mapping per
//! original parameter ([`unflatten_communicated_optim_state`]).

use std::collections::BTreeMap;

use shard_core::{Error, ParamState, ProfileKind, Profiler, Result, StateValue, Tensor};
use tracing::debug;

use crate::chunk::{chunk_dtensor, chunk_tensor};
use crate::model::{FlatParamGeometry, FsdpParamInfo};

/// One flat parameter's state after cross-rank communication
///
/// Every state name lands in exactly one of the three maps.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConsolidatedOptimState {
    /// Unsharded, unpadded flat tensors
    pub tensor_state: BTreeMap<String, Tensor>,
    /// Local scalar tensors, never communicated
    pub zero_dim_tensor_state: BTreeMap<String, Tensor>,
    /// Everything else, never communicated
    pub non_tensor_state: BTreeMap<String, StateValue>,
}

/// Make a flat parameter's sharded state whole on every rank
///
/// Positive-dimension tensors are all-gathered when the state is sharded;
/// the branch depends only on world size and strategy, so every rank issues
/// the same collectives.
pub fn communicate_optim_state(
    info: &FsdpParamInfo,
    flat_state: &ParamState,
    profiler: &Profiler,
) -> Result<ConsolidatedOptimState> {
    let state = &info.state;
    let handle = &info.handle;
    let mut consolidated = ConsolidatedOptimState::default();

    for (name, value) in flat_state {
        match value {
            StateValue::Tensor(tensor) if tensor.dim() > 0 => {
                if !state.is_sharded() {
                    consolidated.tensor_state.insert(name.clone(), tensor.clone());
                    continue;
                }
                let local = if tensor.device().kind() != state.compute_device.kind() {
                    tensor.to(state.compute_device)
                } else {
                    tensor.clone()
                };
                let mut gathered = Tensor::zeros(
                    &[handle.padded_unsharded_size()],
                    tensor.dtype(),
                    state.compute_device,
                );
                {
                    let _scope = profiler.scope(ProfileKind::AllGather);
                    state
                        .process_group
                        .all_gather_into_tensor(&mut gathered, &local)?;
                }
                let unpadded = gathered.narrow(0, handle.unpadded_unsharded_size())?;
                consolidated.tensor_state.insert(name.clone(), unpadded);
            }
            StateValue::Tensor(tensor) => {
                consolidated
                    .zero_dim_tensor_state
                    .insert(name.clone(), tensor.clone());
            }
            StateValue::Sharded(_) => {
                return Err(Error::Schema {
                    message: format!("flat optimizer state {} must not be re-sharded", name),
                });
            }
            other => {
                consolidated
                    .non_tensor_state
                    .insert(name.clone(), other.clone());
            }
        }
    }
    Ok(consolidated)
}

/// Walks a flat tensor one original parameter at a time
///
/// Alignment padding entries are skipped; each yielded view has its
/// parameter's original shape.
pub struct ViewCursor<'a> {
    flat: &'a Tensor,
    handle: &'a dyn FlatParamGeometry,
    entry: usize,
    offset: usize,
    param: usize,
}

impl<'a> ViewCursor<'a> {
    pub fn new(flat: &'a Tensor, handle: &'a dyn FlatParamGeometry) -> Self {
        Self {
            flat,
            handle,
            entry: 0,
            offset: 0,
            param: 0,
        }
    }
}

impl Iterator for ViewCursor<'_> {
    type Item = Result<Tensor>;

    fn next(&mut self) -> Option<Self::Item> {
        let mask = self.handle.padding_mask();
        let numels = self.handle.numels_with_padding();
        while self.entry < mask.len() {
            let (is_padding, numel) = (mask[self.entry], numels[self.entry]);
            let start = self.offset;
            self.entry += 1;
            self.offset += numel;
            if is_padding {
                continue;
            }
            let shape = &self.handle.shapes()[self.param];
            self.param += 1;
            return Some(
                self.flat
                    .narrow(start, numel)
                    .and_then(|view| view.reshape(shape)),
            );
        }
        None
    }
}

/// Cut consolidated flat state into one mapping per original parameter
///
/// With `shard_state`, each tensor view is re-sharded across the group (or
/// the device mesh when `use_dtensor`) instead of being kept whole.
pub fn unflatten_communicated_optim_state(
    info: &FsdpParamInfo,
    consolidated: &ConsolidatedOptimState,
    shard_state: bool,
    use_dtensor: bool,
) -> Result<Vec<ParamState>> {
    let handle = info.handle.as_ref();
    let state = &info.state;
    let mut cursors: Vec<(&str, ViewCursor<'_>)> = consolidated
        .tensor_state
        .iter()
        .map(|(name, flat)| (name.as_str(), ViewCursor::new(flat, handle)))
        .collect();

    let mut unflat = Vec::with_capacity(handle.num_params());
    for _ in 0..handle.num_params() {
        let mut param_state = ParamState::new();
        for (name, cursor) in cursors.iter_mut() {
            let view = cursor.next().ok_or_else(|| Error::Internal {
                message: format!("flat state {} ran out of views", name),
            })??;
            let value = if !shard_state {
                StateValue::Tensor(view)
            } else if use_dtensor {
                let mesh = state.device_mesh.as_ref().ok_or_else(|| Error::InvalidConfig {
                    message: "use_dtensor requires a device mesh".to_string(),
                })?;
                chunk_dtensor(&view, state.rank, mesh)?
            } else {
                chunk_tensor(
                    &view,
                    state.rank,
                    state.world_size,
                    state.process_group.device_count(),
                )?
            };
            param_state.insert(name.to_string(), value);
        }
        for (name, tensor) in &consolidated.zero_dim_tensor_state {
            param_state.insert(name.clone(), StateValue::Tensor(tensor.clone()));
        }
        for (name, value) in &consolidated.non_tensor_state {
            param_state.insert(name.clone(), value.clone());
        }
        unflat.push(param_state);
    }
    Ok(unflat)
}

/// Unflatten one flat parameter's state
///
/// Every rank takes part in the communication; only savers build the
/// per-parameter mappings, with tensors moved to host memory. Non-savers get
/// an empty list.
pub fn unflatten_optim_state(
    info: &FsdpParamInfo,
    flat_state: &ParamState,
    to_save: bool,
    shard_state: bool,
    use_dtensor: bool,
    profiler: &Profiler,
) -> Result<Vec<ParamState>> {
    let consolidated = communicate_optim_state(info, flat_state, profiler)?;
    if !to_save {
        return Ok(Vec::new());
    }
    let mut unflat =
        unflatten_communicated_optim_state(info, &consolidated, shard_state, use_dtensor)?;
    let _scope = profiler.scope(ProfileKind::D2H);
    for param_state in &mut unflat {
        for value in param_state.values_mut() {
            if value.is_tensor() {
                *value = value.cpu();
            }
        }
    }
    debug!(unit = info.unit, params = unflat.len(), "unflattened flat parameter state");
    Ok(unflat)
}
