//! Save then load (and load then save) across in-process ranks

use std::sync::Arc;
use std::thread;

use anyhow::Result;
use collective::{LocalGroup, ProcessGroup};
use optim_state::chunk::gather_state_dict;
use optim_state::{
    flatten_optim_state_dict, optim_state_dict, ConversionContext, FlatParamLayout, FlatStateKey,
    KeySource, OptimStateKey, Optimizer, OptimizerGroup, ShardedModule, ShardingState,
    SimpleOptimizer,
};
use shard_core::{
    CollectiveConfig, OptimStateDictConfig, OsdConfig, ParamLayout, ParamState, Profiler,
    ShardingStrategy, StateKey, StateValue, Tensor,
};
use simulator::{run, ParamSpec, SimulationConfig, UnitSpec};
use tempfile::TempDir;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Flat unit `block.` holding `w` [3, 2] and `b` [4]; 10 elements in total
fn flat_model(group: Arc<LocalGroup>) -> Result<(ShardedModule, shard_core::ParamId)> {
    let (rank, world_size) = (group.rank(), group.world_size());
    let state = ShardingState::new(group, ShardingStrategy::FullShard);
    let handle = FlatParamLayout::new(
        vec![("w".to_string(), vec![3, 2]), ("b".to_string(), vec![4])],
        0,
        rank,
        world_size,
    )?;
    let mut model = ShardedModule::new();
    let flat = model.add_unit("block.", ParamLayout::FlatParams, Arc::new(state), Arc::new(handle))[0];
    Ok((model, flat))
}

/// This rank's slice of `0..10` in a flat parameter padded to `world_size`
fn flat_shard(rank: usize, world_size: usize) -> Vec<f32> {
    let chunk = 10usize.div_ceil(world_size);
    (rank * chunk..(rank + 1) * chunk)
        .map(|i| if i < 10 { i as f32 } else { 0.0 })
        .collect()
}

#[test]
fn test_flat_state_survives_unflatten_then_flatten() {
    init_tracing();
    let world_size = 3;
    let groups = LocalGroup::create(world_size, &CollectiveConfig::default()).unwrap();
    let handles: Vec<_> = groups
        .into_iter()
        .map(|group| {
            thread::spawn(move || -> Result<(Vec<f32>, ParamState)> {
                let group = Arc::new(group);
                let rank = group.rank();
                let (model, flat) = flat_model(group.clone())?;
                let mut optim = SimpleOptimizer::new(vec![OptimizerGroup::new(vec![flat])]);
                let shard = flat_shard(rank, world_size);
                optim.set_state(
                    flat,
                    ParamState::from([
                        ("exp_avg".to_string(), StateValue::from(Tensor::from_slice(&shard))),
                        ("step".to_string(), StateValue::from(Tensor::scalar(4.0f32))),
                    ]),
                );

                let config = OptimStateDictConfig::default();
                let profiler = Profiler::new();
                let ctx = ConversionContext::new(group.as_ref(), &config, &profiler);
                let full =
                    optim_state_dict(&ctx, &model, &optim.state_dict(), KeySource::Optimizer(&optim))?;
                let w = full.state[&StateKey::from("block.w")]["exp_avg"]
                    .as_tensor()
                    .unwrap()
                    .to_vec::<f32>().unwrap();
                assert_eq!(w, vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
                tracing::info!(rank, "unflattened");

                let sharded = flatten_optim_state_dict(&ctx, &model, Some(&full), None)?;
                let key = FlatStateKey::Param(OptimStateKey::new(
                    vec!["block.w".to_string(), "block.b".to_string()],
                    true,
                ));
                Ok((shard, sharded.state[&key].clone()))
            })
        })
        .collect();
    for handle in handles {
        let (shard, flattened) = handle.join().unwrap().unwrap();
        let exp_avg = flattened["exp_avg"].as_tensor().unwrap();
        assert_eq!(exp_avg.to_vec::<f32>().unwrap(), shard);
        assert_eq!(flattened["step"].as_tensor().unwrap().item().unwrap(), 4.0);
    }
}

#[test]
fn test_shard_state_gathers_back_to_full() {
    let world_size = 2;
    let groups = LocalGroup::create(world_size, &CollectiveConfig::default()).unwrap();
    let handles: Vec<_> = groups
        .into_iter()
        .map(|group| {
            thread::spawn(move || -> Result<Vec<f32>> {
                let group = Arc::new(group);
                let (model, flat) = flat_model(group.clone())?;
                let mut optim = SimpleOptimizer::new(vec![OptimizerGroup::new(vec![flat])]);
                optim.set_state(
                    flat,
                    ParamState::from([(
                        "exp_avg".to_string(),
                        StateValue::from(Tensor::from_slice(&flat_shard(group.rank(), world_size))),
                    )]),
                );
                let config = OptimStateDictConfig {
                    shard_state: true,
                    ..Default::default()
                };
                let profiler = Profiler::new();
                let ctx = ConversionContext::new(group.as_ref(), &config, &profiler);
                let full =
                    optim_state_dict(&ctx, &model, &optim.state_dict(), KeySource::Optimizer(&optim))?;
                let w = &full.state[&StateKey::from("block.w")];
                assert!(matches!(w["exp_avg"], StateValue::Sharded(_)));
                let gathered = gather_state_dict(w, group.as_ref())?;
                Ok(gathered["exp_avg"].as_tensor().unwrap().to_vec::<f32>().unwrap())
            })
        })
        .collect();
    for handle in handles {
        assert_eq!(
            handle.join().unwrap().unwrap(),
            vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]
        );
    }
}

fn scenario(world_size: usize, layout: ParamLayout, aligned_numel: usize) -> SimulationConfig {
    let mut osd = OsdConfig::default();
    osd.optim_state_dict.layout = layout;
    osd.sharding.aligned_numel = aligned_numel;
    SimulationConfig {
        world_size,
        osd,
        units: vec![
            UnitSpec {
                prefix: "encoder.layer0".to_string(),
                params: vec![ParamSpec::new("weight", &[4, 3]), ParamSpec::new("bias", &[4])],
            },
            UnitSpec {
                prefix: "decoder".to_string(),
                params: vec![ParamSpec::new("weight", &[5])],
            },
        ],
        plain_params: vec![ParamSpec::new("logit_scale", &[1])],
        state_names: vec!["exp_avg".to_string(), "exp_avg_sq".to_string()],
    }
}

#[test]
fn test_simulated_round_trips() -> Result<()> {
    init_tracing();
    for layout in [ParamLayout::FlatParams, ParamLayout::OrigParams] {
        for (world_size, aligned_numel) in [(1, 0), (2, 0), (4, 8)] {
            let report = run(&scenario(world_size, layout, aligned_numel))?;
            assert!(
                report.round_trip_ok(),
                "{layout:?} at world size {world_size} did not round trip"
            );
            assert_eq!(report.ranks.len(), world_size);
        }
    }
    Ok(())
}

#[test]
fn test_single_rank_flat_save_skips_tensor_gathers() -> Result<()> {
    let report = run(&scenario(1, ParamLayout::FlatParams, 0))?;
    assert_eq!(report.ranks[0].collectives.all_gather, 0);
    Ok(())
}

#[test]
fn test_rank0_only_orig_params_with_report_file() -> Result<()> {
    let mut config = scenario(3, ParamLayout::OrigParams, 0);
    config.osd.optim_state_dict.rank0_only = true;
    let report = run(&config)?;
    assert_eq!(report.ranks[0].round_trip, Some(true));
    assert!(report.ranks[1..].iter().all(|r| !r.saver && r.entries == 0));

    let dir = TempDir::new()?;
    let path = dir.path().join("report.json");
    report.write_to(&path)?;
    assert!(std::fs::read_to_string(&path)?.contains("\"OrigParams\""));
    Ok(())
}

#[test]
fn test_load_into_named_optimizer() {
    let groups = LocalGroup::create(2, &CollectiveConfig::default()).unwrap();
    let handles: Vec<_> = groups
        .into_iter()
        .map(|group| {
            thread::spawn(move || -> Result<Vec<f32>> {
                let group = Arc::new(group);
                let (model, flat) = flat_model(group.clone())?;
                let names = [(flat, "block._fsdp_wrapped_module._flat_param".to_string())]
                    .into_iter()
                    .collect();
                let mut optim = SimpleOptimizer::named(vec![OptimizerGroup::new(vec![flat])], names)?;

                let reference = optim_state::OptimStateDict::new(
                    [
                        (
                            StateKey::from("block.w"),
                            ParamState::from([(
                                "exp_avg".to_string(),
                                StateValue::from(Tensor::from_vec(
                                    (0..6).map(|v| v as f32).collect(),
                                    &[3, 2],
                                )?),
                            )]),
                        ),
                        (
                            StateKey::from("block.b"),
                            ParamState::from([(
                                "exp_avg".to_string(),
                                StateValue::from(Tensor::from_slice(&[6.0f32, 7.0, 8.0, 9.0])),
                            )]),
                        ),
                    ]
                    .into_iter()
                    .collect(),
                );
                let config = OptimStateDictConfig::default();
                let profiler = Profiler::new();
                let ctx = ConversionContext::new(group.as_ref(), &config, &profiler);
                let loadable = optim_state::optim_state_dict_to_load(
                    &ctx,
                    &model,
                    KeySource::Optimizer(&optim),
                    Some(&reference),
                )?;
                optim.load_state_dict(&loadable)?;
                let state = optim.state(flat).unwrap();
                Ok(state["exp_avg"].as_tensor().unwrap().to_vec::<f32>().unwrap())
            })
        })
        .collect();
    for (rank, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.join().unwrap().unwrap(), flat_shard(rank, 2));
    }
}
