//! Behavioral properties of flattening, consolidation and key reconciliation

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;

use anyhow::Result;
use collective::{LocalGroup, ProcessGroup};
use optim_state::consolidate::communicate_optim_state;
use optim_state::flatten::flatten_optim_state;
use optim_state::identity::{flat_param_to_fqn, fqn_to_fsdp_param_info, param_key_to_param};
use optim_state::reconcile::map_param_key_to_optim_keys;
use optim_state::{
    optim_state_dict, ConversionContext, FlatParamLayout, FsdpParamInfo, KeyScheme, KeySource,
    Optimizer, OptimizerGroup, ShardedModule, ShardingState, SimpleOptimizer,
};
use shard_core::{
    CollectiveConfig, Error, OptimStateDictConfig, ParamLayout, ParamState, Profiler,
    ShardingStrategy, StateKey, StateValue, Tensor,
};

fn single_group() -> Arc<LocalGroup> {
    let group = LocalGroup::create(1, &CollectiveConfig::default())
        .unwrap()
        .pop()
        .unwrap();
    Arc::new(group)
}

/// Sharding info for one unit `layer.` holding `params`
fn unit_info(
    group: Arc<LocalGroup>,
    params: &[(&str, &[usize])],
    aligned_numel: usize,
) -> Result<Arc<FsdpParamInfo>> {
    let (rank, world_size) = (group.rank(), group.world_size());
    let state = ShardingState::new(group, ShardingStrategy::FullShard);
    let handle = FlatParamLayout::new(
        params
            .iter()
            .map(|(name, shape)| (name.to_string(), shape.to_vec()))
            .collect(),
        aligned_numel,
        rank,
        world_size,
    )?;
    let mut model = ShardedModule::new();
    model.add_unit("layer.", ParamLayout::FlatParams, Arc::new(state), Arc::new(handle));
    let infos = fqn_to_fsdp_param_info(&model)?;
    Ok(infos[&format!("layer.{}", params[0].0)].clone())
}

fn names(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| format!("layer.{}", n)).collect()
}

fn unflat(entries: Vec<(&str, Vec<(&str, StateValue)>)>) -> BTreeMap<StateKey, ParamState> {
    entries
        .into_iter()
        .map(|(param, values)| {
            let state = values
                .into_iter()
                .map(|(name, value)| (name.to_string(), value))
                .collect();
            (StateKey::Name(format!("layer.{}", param)), state)
        })
        .collect()
}

#[test]
fn test_scalar_state_must_agree_within_flat_param() -> Result<()> {
    let info = unit_info(single_group(), &[("a", &[2]), ("b", &[2])], 0)?;
    let state = unflat(vec![
        ("a", vec![("step", Tensor::scalar(5.0f32).into())]),
        ("b", vec![("step", Tensor::scalar(3.0f32).into())]),
    ]);
    let err = flatten_optim_state(&info, &state, &names(&["a", "b"])).unwrap_err();
    match err {
        Error::ScalarValueMismatch { state_name, .. } => assert_eq!(state_name, "step"),
        other => panic!("unexpected error {other}"),
    }

    let state = unflat(vec![
        ("a", vec![("kind", StateValue::from("adam"))]),
        ("b", vec![("kind", StateValue::from("sgd"))]),
    ]);
    assert!(flatten_optim_state(&info, &state, &names(&["a", "b"])).is_err());
    Ok(())
}

#[test]
fn test_flat_param_without_state_has_no_entry() -> Result<()> {
    let info = unit_info(single_group(), &[("a", &[2]), ("b", &[3])], 0)?;
    let state = unflat(vec![(
        "other",
        vec![("exp_avg", Tensor::from_slice(&[1.0f32]).into())],
    )]);
    assert!(flatten_optim_state(&info, &state, &names(&["a", "b"]))?.is_none());
    Ok(())
}

#[test]
fn test_absent_tensor_state_is_zero_filled() -> Result<()> {
    let info = unit_info(single_group(), &[("p1", &[4]), ("p2", &[3])], 0)?;
    let state = unflat(vec![(
        "p1",
        vec![("exp_avg", Tensor::from_slice(&[1.0f32, 2.0, 3.0, 4.0]).into())],
    )]);
    let flat = flatten_optim_state(&info, &state, &names(&["p1", "p2"]))?.unwrap();
    assert_eq!(
        flat["exp_avg"].as_tensor().unwrap().to_vec::<f32>().unwrap(),
        vec![1.0, 2.0, 3.0, 4.0, 0.0, 0.0, 0.0]
    );
    Ok(())
}

#[test]
fn test_zero_fill_respects_alignment() -> Result<()> {
    let info = unit_info(single_group(), &[("p1", &[3]), ("p2", &[3])], 4)?;
    let state = unflat(vec![(
        "p1",
        vec![("exp_avg", Tensor::from_slice(&[1.0f32, 2.0, 3.0]).into())],
    )]);
    let flat = flatten_optim_state(&info, &state, &names(&["p1", "p2"]))?.unwrap();
    // p1: 3, alignment pad: 1, p2: 3
    assert_eq!(
        flat["exp_avg"].as_tensor().unwrap().to_vec::<f32>().unwrap(),
        vec![1.0, 2.0, 3.0, 0.0, 0.0, 0.0, 0.0]
    );
    Ok(())
}

#[test]
fn test_single_rank_consolidation_issues_no_gather() -> Result<()> {
    let group = single_group();
    let info = unit_info(group.clone(), &[("a", &[2, 2]), ("b", &[2])], 0)?;
    let flat = Tensor::from_slice(&[1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0]);
    let state = ParamState::from([
        ("exp_avg".to_string(), StateValue::from(flat.clone())),
        ("step".to_string(), StateValue::from(Tensor::scalar(2.0f32))),
    ]);

    let consolidated = communicate_optim_state(&info, &state, &Profiler::new())?;
    assert!(consolidated.tensor_state["exp_avg"].values_equal(&flat));
    assert!(consolidated.zero_dim_tensor_state.contains_key("step"));
    assert_eq!(group.stats().all_gather, 0);
    assert_eq!(group.stats().total_calls(), 0);
    Ok(())
}

#[test]
fn test_absent_zero_dim_param_cannot_be_flattened() -> Result<()> {
    let info = unit_info(single_group(), &[("w", &[2]), ("scale", &[])], 0)?;
    let state = unflat(vec![(
        "w",
        vec![("exp_avg", Tensor::from_slice(&[1.0f32, 2.0]).into())],
    )]);
    let err = flatten_optim_state(&info, &state, &names(&["w", "scale"])).unwrap_err();
    match err {
        Error::UnsupportedZeroDimFlatten { param_name } => assert_eq!(param_name, "layer.scale"),
        other => panic!("unexpected error {other}"),
    }
    Ok(())
}

/// Plain parameters `A`, `B`, `C`; `with_state` picks which ones have state
fn plain_rig(with_state: &[usize]) -> (ShardedModule, SimpleOptimizer) {
    let mut model = ShardedModule::new();
    let params: Vec<_> = ["A", "B", "C"].iter().map(|n| model.add_param(*n)).collect();
    let mut optim = SimpleOptimizer::new(vec![OptimizerGroup::new(params.clone())]);
    for &i in with_state {
        optim.set_state(
            params[i],
            ParamState::from([(
                "exp_avg".to_string(),
                StateValue::from(Tensor::from_slice(&[i as f32])),
            )]),
        );
    }
    (model, optim)
}

#[test]
fn test_missing_keys_reported_on_every_rank() {
    let groups = LocalGroup::create(3, &CollectiveConfig::default()).unwrap();
    let handles: Vec<_> = groups
        .into_iter()
        .map(|group| {
            thread::spawn(move || {
                let with_state: &[usize] = if group.rank() == 2 { &[0, 1] } else { &[0, 1, 2] };
                let (model, optim) = plain_rig(with_state);
                let config = OptimStateDictConfig::default();
                let profiler = Profiler::new();
                let ctx = ConversionContext::new(&group, &config, &profiler);
                optim_state_dict(&ctx, &model, &optim.state_dict(), KeySource::Optimizer(&optim))
            })
        })
        .collect();
    for handle in handles {
        let err = handle.join().unwrap().unwrap_err();
        let message = err.to_string();
        assert!(message.contains("Rank 2"), "{message}");
        assert!(message.contains("C"), "{message}");
        match err {
            Error::MissingOptimStates { missing, .. } => {
                assert_eq!(missing, vec![(2, vec![vec!["C".to_string()]])]);
            }
            other => panic!("unexpected error {other}"),
        }
    }
}

#[test]
fn test_merged_key_order_is_sorted_and_repeatable() {
    let groups = LocalGroup::create(3, &CollectiveConfig::default()).unwrap();
    let handles: Vec<_> = groups
        .into_iter()
        .map(|group| {
            thread::spawn(move || {
                let with_state: &[usize] = match group.rank() {
                    0 => &[2],
                    1 => &[0, 1],
                    _ => &[1, 2],
                };
                let (model, optim) = plain_rig(with_state);
                let p2f = optim_state::param_to_fqns(&model);
                let keyed = param_key_to_param(
                    &optim,
                    &model,
                    KeyScheme::Positional,
                    &p2f,
                    &flat_param_to_fqn(&model),
                )
                .unwrap();
                let infos = fqn_to_fsdp_param_info(&model).unwrap();
                let state = optim.state_dict().state;
                (0..2)
                    .map(|_| {
                        map_param_key_to_optim_keys(&state, &group, &keyed, &p2f, &infos, true)
                            .unwrap()
                            .all_optim_state_keys
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let expected: Vec<Vec<String>> = vec![
        vec!["A".to_string()],
        vec!["B".to_string()],
        vec!["C".to_string()],
    ];
    for runs in &results {
        for keys in runs {
            let names: Vec<_> = keys.iter().map(|k| k.unflat_param_names.clone()).collect();
            assert_eq!(names, expected);
            assert!(keys.iter().all(|k| !k.is_fsdp_managed));
        }
        assert_eq!(runs[0], results[0][0]);
    }
}
