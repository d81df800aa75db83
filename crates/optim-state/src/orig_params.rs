//! Unflatten path when the optimizer sees original parameters
//!
//! Each rank holds a (possibly empty) slice of every original parameter's
//! state. A unit's states are gathered together: first a metadata exchange
//! so every rank knows what exists where, then one tensor all-gather per
//! state name.

use std::collections::{BTreeMap, BTreeSet};

use collective::ObjectCollectives;
use serde::{Deserialize, Serialize};
use shard_core::{
    DType, Error, ParamState, PosDimTensorInfo, ProfileKind, Profiler, Result, StateValue, Tensor,
};
use tracing::{debug, instrument};

use crate::chunk::{chunk_dtensor, chunk_tensor};
use crate::model::FsdpParamInfo;

/// One rank's summary of one original parameter's state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateInfo {
    pub tensors: BTreeMap<String, PosDimTensorInfo>,
    pub scalar_tensors: BTreeMap<String, Tensor>,
    pub non_tensors: BTreeMap<String, StateValue>,
}

impl StateInfo {
    fn of(state: &ParamState) -> Self {
        let mut info = StateInfo::default();
        for (name, value) in state {
            match value {
                StateValue::Tensor(t) if t.is_zero_dim() => {
                    info.scalar_tensors.insert(name.clone(), t.cpu());
                }
                StateValue::Tensor(t) => {
                    info.tensors.insert(name.clone(), PosDimTensorInfo::of(t));
                }
                other => {
                    info.non_tensors.insert(name.clone(), other.clone());
                }
            }
        }
        info
    }
}

/// Per-rank state summaries, indexed by rank
pub type GatheredStateInfo = Vec<BTreeMap<String, StateInfo>>;

/// Exchange every rank's state summary for one unit
pub fn allgather_state_info(
    info: &FsdpParamInfo,
    input_states: &BTreeMap<String, ParamState>,
) -> Result<GatheredStateInfo> {
    let processed: BTreeMap<String, StateInfo> = input_states
        .iter()
        .map(|(fqn, state)| (fqn.clone(), StateInfo::of(state)))
        .collect();
    info.state.process_group.all_gather_object(&processed)
}

/// Agree on one value per rank-reported scalar or non-tensor state
fn merge_rank_values(fqn: &str, holders: &[&StateInfo], output: &mut ParamState) -> Result<()> {
    for state_info in holders {
        for (name, value) in &state_info.non_tensors {
            if output.get(name).is_some_and(|existing| existing != value) {
                return Err(Error::RankValueMismatch {
                    state_name: name.clone(),
                    fqn: fqn.to_string(),
                });
            }
            output.insert(name.clone(), value.clone());
        }
        for (name, tensor) in &state_info.scalar_tensors {
            let differs = output
                .get(name)
                .and_then(StateValue::as_tensor)
                .is_some_and(|existing| !existing.values_equal(tensor));
            if differs {
                return Err(Error::RankValueMismatch {
                    state_name: name.clone(),
                    fqn: fqn.to_string(),
                });
            }
            output.insert(name.clone(), StateValue::Tensor(tensor.clone()));
        }
    }
    Ok(())
}

/// Ranks that hold none of a parameter's tensor state
///
/// A rank is empty for a state name when it reports no tensor or a
/// zero-element tensor under it. Every tensor state name must give the same
/// set. A parameter without tensor state has no empty ranks.
fn empty_ranks_for(fqn: &str, per_rank: &[Option<&StateInfo>]) -> Result<BTreeSet<usize>> {
    let state_names: BTreeSet<&String> = per_rank
        .iter()
        .flatten()
        .flat_map(|s| s.tensors.keys())
        .collect();
    let mut empty_ranks: Option<BTreeSet<usize>> = None;
    for state_name in state_names {
        let ranks: BTreeSet<usize> = per_rank
            .iter()
            .enumerate()
            .filter(|(_, state)| match state {
                Some(s) => s.tensors.get(state_name).map_or(true, |t| t.numel() == 0),
                None => true,
            })
            .map(|(rank, _)| rank)
            .collect();
        match &empty_ranks {
            Some(previous) if *previous != ranks => {
                return Err(Error::EmptyRankMismatch {
                    state_name: state_name.clone(),
                    fqn: fqn.to_string(),
                });
            }
            _ => empty_ranks = Some(ranks),
        }
    }
    Ok(empty_ranks.unwrap_or_default())
}

/// Check every rank's reported slice sizes against the layout
///
/// Works on gathered metadata only, so all ranks reach the same verdict
/// before any tensor collective.
fn check_shard_sizes(info: &FsdpParamInfo, gathered: &GatheredStateInfo) -> Result<()> {
    for (rank, by_fqn) in gathered.iter().enumerate() {
        for (fqn, state_info) in by_fqn {
            let Some(&idx) = info.param_indices.get(fqn) else {
                continue;
            };
            let expected = info.handle.numel_in_shard_of(idx, rank);
            if expected == 0 {
                continue;
            }
            for (state_name, tensor_info) in &state_info.tensors {
                if tensor_info.numel() != expected {
                    return Err(Error::ShardSizeMismatch {
                        state_name: state_name.clone(),
                        fqn: fqn.clone(),
                        rank,
                        actual: tensor_info.numel(),
                        expected,
                    });
                }
            }
        }
    }
    Ok(())
}

/// Gather one unit's tensor state and split it per original parameter
///
/// Scalar and non-tensor state is taken from the gathered metadata of ranks
/// that hold part of the parameter. Tensor state is assigned only to
/// parameters for which some rank holds it.
pub fn allgather_orig_param_states(
    info: &FsdpParamInfo,
    gathered: &GatheredStateInfo,
    input_states: &BTreeMap<String, ParamState>,
    shard_state: bool,
    use_dtensor: bool,
    to_save: bool,
    profiler: &Profiler,
) -> Result<BTreeMap<String, ParamState>> {
    let state = &info.state;
    let handle = &info.handle;
    check_shard_sizes(info, gathered)?;
    let mut output: BTreeMap<String, ParamState> = input_states
        .keys()
        .map(|fqn| (fqn.clone(), ParamState::new()))
        .collect();

    // state name -> (dtype, params held by any rank)
    let mut tensor_states: BTreeMap<String, (DType, BTreeSet<usize>)> = BTreeMap::new();
    for (fqn, idx) in &info.param_indices {
        let per_rank: Vec<Option<&StateInfo>> =
            gathered.iter().map(|by_fqn| by_fqn.get(fqn)).collect();
        let empty_ranks = empty_ranks_for(fqn, &per_rank)?;
        if !empty_ranks.is_empty() {
            debug!(fqn = %fqn, empty_ranks = empty_ranks.len(), "ranks without state");
        }
        let holders: Vec<&StateInfo> = per_rank
            .iter()
            .enumerate()
            .filter(|(rank, _)| !empty_ranks.contains(rank))
            .filter_map(|(_, s)| *s)
            .collect();
        if let Some(out) = output.get_mut(fqn) {
            merge_rank_values(fqn, &holders, out)?;
        }
        for state_info in &holders {
            for (name, tensor_info) in &state_info.tensors {
                let entry = tensor_states
                    .entry(name.clone())
                    .or_insert_with(|| (tensor_info.dtype, BTreeSet::new()));
                if entry.0 != tensor_info.dtype {
                    return Err(Error::DtypeMismatch {
                        state_name: name.clone(),
                        dtypes: vec![entry.0.to_string(), tensor_info.dtype.to_string()],
                        param_names: vec![fqn.clone()],
                    });
                }
                entry.1.insert(*idx);
            }
        }
    }

    let fqns_by_index: BTreeMap<usize, &String> =
        info.param_indices.iter().map(|(fqn, idx)| (*idx, fqn)).collect();
    for (state_name, (dtype, reported)) in &tensor_states {
        let mut local_shard = Tensor::zeros(&[handle.sharded_size()], *dtype, state.compute_device);
        for (idx, fqn) in &fqns_by_index {
            let Some(shard_info) = handle.shard_param_info(*idx) else {
                continue;
            };
            let buffer = input_states
                .get(*fqn)
                .and_then(|s| s.get(state_name))
                .and_then(StateValue::as_tensor);
            let (true, Some(buffer)) = (shard_info.in_shard, buffer) else {
                continue;
            };
            local_shard.write_at(shard_info.offset_in_shard, &buffer.to(state.compute_device))?;
        }

        let mut gathered_tensor =
            Tensor::zeros(&[handle.padded_unsharded_size()], *dtype, state.compute_device);
        {
            let _scope = profiler.scope(ProfileKind::AllGather);
            state
                .process_group
                .all_gather_into_tensor(&mut gathered_tensor, &local_shard)?;
        }
        if !to_save {
            continue;
        }
        let unpadded = gathered_tensor.narrow(0, handle.unpadded_unsharded_size())?;

        let mut offset = 0;
        let mut idx = 0;
        for (&is_padding, &numel) in handle.padding_mask().iter().zip(handle.numels_with_padding()) {
            let start = offset;
            offset += numel;
            if is_padding {
                continue;
            }
            let param_idx = idx;
            idx += 1;
            let Some(fqn) = fqns_by_index.get(&param_idx) else {
                continue;
            };
            if !reported.contains(&param_idx) {
                continue;
            }
            let Some(out) = output.get_mut(*fqn) else {
                continue;
            };
            let value = unpadded.narrow(start, numel)?;
            out.insert(state_name.clone(), StateValue::Tensor(value));
        }
        unflatten_orig_param_states(info, &mut output, state_name, shard_state, use_dtensor, profiler)?;
    }
    Ok(output)
}

/// Reshape one gathered state to original parameter shapes, re-shard if
/// asked, and move it to host memory
pub fn unflatten_orig_param_states(
    info: &FsdpParamInfo,
    output: &mut BTreeMap<String, ParamState>,
    state_name: &str,
    shard_state: bool,
    use_dtensor: bool,
    profiler: &Profiler,
) -> Result<()> {
    let state = &info.state;
    let handle = &info.handle;
    for (fqn, param_state) in output.iter_mut() {
        let Some(StateValue::Tensor(value)) = param_state.get(state_name) else {
            continue;
        };
        let idx = info.index_of(fqn)?;
        let value = value.reshape(&handle.shapes()[idx])?;
        let value = if !shard_state {
            StateValue::Tensor(value)
        } else if use_dtensor {
            let mesh = state.device_mesh.as_ref().ok_or_else(|| Error::InvalidConfig {
                message: "use_dtensor requires a device mesh".to_string(),
            })?;
            chunk_dtensor(&value, state.rank, mesh)?
        } else {
            chunk_tensor(
                &value,
                state.rank,
                state.world_size,
                state.process_group.device_count(),
            )?
        };
        let _scope = profiler.scope(ProfileKind::D2H);
        param_state.insert(state_name.to_string(), value.cpu());
    }
    Ok(())
}

/// Gather the state of every original parameter in one unit
///
/// `input_states` holds this rank's slice of each parameter's state, keyed
/// by clean qualified name. Non-savers take part in the collectives and get
/// an empty map.
#[instrument(skip_all, fields(unit = info.unit, rank = info.state.rank))]
pub fn gather_all_orig_param_state(
    info: &FsdpParamInfo,
    input_states: BTreeMap<String, ParamState>,
    shard_state: bool,
    use_dtensor: bool,
    to_save: bool,
    profiler: &Profiler,
) -> Result<BTreeMap<String, ParamState>> {
    if !info.state.is_sharded() {
        if !to_save {
            return Ok(BTreeMap::new());
        }
        let _scope = profiler.scope(ProfileKind::D2H);
        return Ok(input_states
            .into_iter()
            .map(|(fqn, state)| {
                let state = state.iter().map(|(n, v)| (n.clone(), v.cpu())).collect();
                (fqn, state)
            })
            .collect());
    }

    let _scope = profiler.scope(ProfileKind::Resharding);
    let gathered = {
        let _scope = profiler.scope(ProfileKind::AllGatherObj);
        allgather_state_info(info, &input_states)?
    };
    let output = allgather_orig_param_states(
        info,
        &gathered,
        &input_states,
        shard_state,
        use_dtensor,
        to_save,
        profiler,
    )?;
    if !to_save {
        return Ok(BTreeMap::new());
    }
    debug!(params = output.len(), "gathered original parameter state");
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FlatParamLayout, ShardingState};
    use collective::{LocalGroup, ProcessGroup};
    use shard_core::{CollectiveConfig, ShardingStrategy};
    use std::sync::Arc;
    use std::thread;

    fn info_for(group: LocalGroup, aligned: usize) -> FsdpParamInfo {
        unit_with(group, vec![("w", vec![2, 2]), ("b", vec![3])], aligned)
    }

    fn unit_with(group: LocalGroup, params: Vec<(&str, Vec<usize>)>, aligned: usize) -> FsdpParamInfo {
        let (rank, world_size) = (group.rank(), group.world_size());
        let state = ShardingState::new(Arc::new(group), ShardingStrategy::FullShard);
        let param_indices = params
            .iter()
            .enumerate()
            .map(|(i, (name, _))| (name.to_string(), i))
            .collect();
        let handle = FlatParamLayout::new(
            params.into_iter().map(|(n, s)| (n.to_string(), s)).collect(),
            aligned,
            rank,
            world_size,
        )
        .unwrap();
        FsdpParamInfo {
            unit: 0,
            state: Arc::new(state),
            handle: Arc::new(handle),
            param_indices,
        }
    }

    fn adam_state(exp_avg: Tensor, step: f32) -> ParamState {
        ParamState::from([
            ("exp_avg".to_string(), StateValue::from(exp_avg)),
            ("step".to_string(), StateValue::from(Tensor::scalar(step))),
        ])
    }

    /// This rank's slice of `full` for the parameter at `idx`
    fn local_slice(info: &FsdpParamInfo, idx: usize, full: &[f32]) -> Tensor {
        let shard = info.handle.shard_param_info(idx).unwrap();
        if !shard.in_shard {
            return Tensor::from_slice::<f32>(&[]);
        }
        Tensor::from_slice(&full[shard.intra_param_start_idx..=shard.intra_param_end_idx])
    }

    #[test]
    fn test_gather_with_alignment_padding() {
        let groups = LocalGroup::create(2, &CollectiveConfig::default()).unwrap();
        let handles: Vec<_> = groups
            .into_iter()
            .map(|group| {
                thread::spawn(move || {
                    let rank = group.rank();
                    // w: 4, pad: 4, b: 3 -> 11 elements, 6 per rank
                    let info = info_for(group, 8);
                    let w: Vec<f32> = (1..=4).map(|v| v as f32).collect();
                    let b = vec![10.0f32, 20.0, 30.0];
                    let mut input = BTreeMap::new();
                    for (fqn, idx, full) in [("w", 0, &w), ("b", 1, &b)] {
                        let mut s = ParamState::new();
                        s.insert("exp_avg".into(), StateValue::from(local_slice(&info, idx, full)));
                        s.insert("step".into(), StateValue::from(Tensor::scalar(3.0f32)));
                        input.insert(fqn.to_string(), s);
                    }
                    let profiler = Profiler::new();
                    let out =
                        gather_all_orig_param_state(&info, input, false, false, true, &profiler)
                            .unwrap();
                    (rank, out, profiler.report())
                })
            })
            .collect();
        for handle in handles {
            let (_, out, report) = handle.join().unwrap();
            let w = out["w"]["exp_avg"].as_tensor().unwrap();
            assert_eq!(w.shape(), &[2, 2]);
            assert_eq!(w.to_vec::<f32>().unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
            assert_eq!(
                out["b"]["exp_avg"].as_tensor().unwrap().to_vec::<f32>().unwrap(),
                vec![10.0, 20.0, 30.0]
            );
            assert_eq!(out["b"]["step"].as_tensor().unwrap().item().unwrap(), 3.0);
            assert_eq!(report.count(ProfileKind::AllGather), 1);
            assert_eq!(report.count(ProfileKind::AllGatherObj), 1);
        }
    }

    #[test]
    fn test_rank_value_mismatch() {
        let groups = LocalGroup::create(2, &CollectiveConfig::default()).unwrap();
        let handles: Vec<_> = groups
            .into_iter()
            .map(|group| {
                thread::spawn(move || {
                    let rank = group.rank();
                    // w spans both shards
                    let info = unit_with(group, vec![("w", vec![5]), ("b", vec![1])], 0);
                    let w = vec![1.0f32; 5];
                    let mut s = ParamState::new();
                    s.insert("exp_avg".into(), StateValue::from(local_slice(&info, 0, &w)));
                    s.insert("lr".into(), StateValue::Float(0.1 * (rank + 1) as f64));
                    let input = BTreeMap::from([("w".to_string(), s)]);
                    gather_all_orig_param_state(&info, input, false, false, true, &Profiler::new())
                })
            })
            .collect();
        for handle in handles {
            assert!(matches!(
                handle.join().unwrap(),
                Err(Error::RankValueMismatch { .. })
            ));
        }
    }

    #[test]
    fn test_ranks_without_a_slice_do_not_vote() {
        let groups = LocalGroup::create(2, &CollectiveConfig::default()).unwrap();
        let handles: Vec<_> = groups
            .into_iter()
            .map(|group| {
                thread::spawn(move || {
                    let rank = group.rank();
                    // w and b fill one rank each
                    let info = unit_with(group, vec![("w", vec![4]), ("b", vec![4])], 0);
                    let held = [(rank as f32 + 1.0) * 10.0; 4];
                    let (mine, other) = if rank == 0 { ("w", "b") } else { ("b", "w") };
                    let input = BTreeMap::from([
                        (mine.to_string(), adam_state(Tensor::from_slice(&held), 5.0)),
                        (
                            other.to_string(),
                            adam_state(Tensor::from_slice::<f32>(&[]), 0.0),
                        ),
                    ]);
                    gather_all_orig_param_state(&info, input, false, false, true, &Profiler::new())
                })
            })
            .collect();
        for handle in handles {
            let out = handle.join().unwrap().unwrap();
            for (fqn, value) in [("w", 10.0f32), ("b", 20.0)] {
                assert_eq!(out[fqn]["step"].as_tensor().unwrap().item().unwrap(), 5.0);
                assert_eq!(
                    out[fqn]["exp_avg"].as_tensor().unwrap().to_vec::<f32>().unwrap(),
                    vec![value; 4]
                );
            }
        }
    }

    #[test]
    fn test_wrong_slice_size_fails_on_every_rank() {
        let groups = LocalGroup::create(2, &CollectiveConfig::default()).unwrap();
        let handles: Vec<_> = groups
            .into_iter()
            .map(|group| {
                thread::spawn(move || {
                    let rank = group.rank();
                    // w: 4, b: 3 -> rank 0 holds w, rank 1 holds b
                    let info = info_for(group, 0);
                    let input = if rank == 0 {
                        BTreeMap::from([("w".to_string(), adam_state(Tensor::from_slice(&[1.0f32; 4]), 1.0))])
                    } else {
                        BTreeMap::from([("b".to_string(), adam_state(Tensor::from_slice(&[1.0f32; 2]), 1.0))])
                    };
                    gather_all_orig_param_state(&info, input, false, false, true, &Profiler::new())
                })
            })
            .collect();
        for handle in handles {
            match handle.join().unwrap() {
                Err(Error::ShardSizeMismatch {
                    rank,
                    actual,
                    expected,
                    ..
                }) => assert_eq!((rank, actual, expected), (1, 2, 3)),
                other => panic!("unexpected result {other:?}"),
            }
        }
    }

    #[test]
    fn test_empty_ranks_must_agree_across_states() {
        let groups = LocalGroup::create(2, &CollectiveConfig::default()).unwrap();
        let handles: Vec<_> = groups
            .into_iter()
            .map(|group| {
                thread::spawn(move || {
                    let rank = group.rank();
                    let info = info_for(group, 0);
                    let w = if rank == 0 {
                        ParamState::from([
                            ("exp_avg".to_string(), StateValue::from(Tensor::from_slice(&[1.0f32; 4]))),
                            ("exp_avg_sq".to_string(), StateValue::from(Tensor::from_slice(&[1.0f32; 4]))),
                        ])
                    } else {
                        // rank 1 holds none of w but reports elements for one state
                        ParamState::from([
                            ("exp_avg".to_string(), StateValue::from(Tensor::from_slice::<f32>(&[]))),
                            ("exp_avg_sq".to_string(), StateValue::from(Tensor::from_slice(&[1.0f32; 2]))),
                        ])
                    };
                    let input = BTreeMap::from([("w".to_string(), w)]);
                    gather_all_orig_param_state(&info, input, false, false, true, &Profiler::new())
                })
            })
            .collect();
        for handle in handles {
            assert!(matches!(
                handle.join().unwrap(),
                Err(Error::EmptyRankMismatch { .. })
            ));
        }
    }

    #[test]
    fn test_unsharded_short_circuit() {
        let group = LocalGroup::create(1, &CollectiveConfig::default())
            .unwrap()
            .pop()
            .unwrap();
        let info = info_for(group, 0);
        let mut s = ParamState::new();
        s.insert(
            "exp_avg".into(),
            StateValue::from(Tensor::from_vec(vec![1.0f32; 4], &[2, 2]).unwrap()),
        );
        let input = BTreeMap::from([("w".to_string(), s)]);
        let profiler = Profiler::new();
        let out =
            gather_all_orig_param_state(&info, input.clone(), false, false, true, &profiler).unwrap();
        assert_eq!(out, input);
        assert_eq!(profiler.report().count(ProfileKind::AllGatherObj), 0);
        assert!(gather_all_orig_param_state(&info, input, false, false, false, &profiler)
            .unwrap()
            .is_empty());
    }
}
