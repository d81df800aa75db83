//! Scenario execution, one thread per rank
//!
//! Every rank builds the same model, loads a reference unflattened state
//! dict into a fresh optimizer, then saves it back and compares.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::thread;

use collective::{LocalGroup, ProcessGroup, StatsSnapshot};
use optim_state::chunk::gather_state_dict;
use optim_state::{
    optim_state_dict, optim_state_dict_to_load, ConversionContext, FlatParamLayout, KeySource,
    ModelTraversal, OptimStateDict, Optimizer, OptimizerGroup, ParamGroup, ShardedModule,
    ShardingState, SimpleOptimizer,
};
use serde::Serialize;
use shard_core::{
    Error, ParamLayout, ParamState, ProfileReport, Profiler, Result, StateKey, StateValue, Tensor,
};
use tracing::{debug, info, instrument};

use crate::config::{ParamSpec, SimulationConfig};

/// What one rank observed
#[derive(Debug, Clone, Serialize)]
pub struct RankReport {
    pub rank: usize,
    pub saver: bool,
    /// Entries in the saved state dict
    pub entries: usize,
    /// Tensor elements held per state name after saving
    pub state_numels: BTreeMap<String, usize>,
    /// Whether the saved dict equals the reference; `None` on non-savers
    pub round_trip: Option<bool>,
    /// Profile of the save call
    pub profile: ProfileReport,
    /// Collectives issued by the load and save calls
    pub collectives: StatsSnapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub world_size: usize,
    pub layout: ParamLayout,
    pub ranks: Vec<RankReport>,
}

impl SimulationReport {
    /// No saver saw a mismatch
    pub fn round_trip_ok(&self) -> bool {
        self.ranks.iter().all(|r| r.round_trip != Some(false))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn write_to(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }
}

/// Run `config` on `world_size` in-process ranks
pub fn run(config: &SimulationConfig) -> Result<SimulationReport> {
    config.validate()?;
    let groups = LocalGroup::create(config.world_size, &config.osd.collective)?;
    let handles = groups
        .into_iter()
        .map(|group| {
            let config = config.clone();
            thread::Builder::new()
                .name(format!("rank-{}", group.rank()))
                .spawn(move || run_rank(&config, group))
        })
        .collect::<std::io::Result<Vec<_>>>()?;

    let mut ranks = Vec::with_capacity(handles.len());
    for handle in handles {
        let report = handle.join().map_err(|_| Error::Internal {
            message: "a rank thread panicked".to_string(),
        })??;
        ranks.push(report);
    }
    ranks.sort_by_key(|r| r.rank);

    let report = SimulationReport {
        world_size: config.world_size,
        layout: config.osd.optim_state_dict.layout,
        ranks,
    };
    info!(
        world_size = report.world_size,
        round_trip_ok = report.round_trip_ok(),
        "simulation finished"
    );
    Ok(report)
}

/// Build this rank's model; returns it with every parameter under its
/// qualified name, in declaration order
pub fn build_model(
    config: &SimulationConfig,
    group: Arc<dyn ProcessGroup>,
) -> Result<(ShardedModule, Vec<ParamSpec>)> {
    let sharding = &config.osd.sharding;
    let layout = config.osd.optim_state_dict.layout;
    // An unsharded unit holds its whole flat parameter on every rank
    let (rank, world_size) = if sharding.strategy.shards_state() {
        (group.rank(), group.world_size())
    } else {
        (0, 1)
    };

    let mut model = ShardedModule::new();
    let mut params = Vec::new();
    for unit in &config.units {
        let prefix = unit.normalized_prefix();
        let mut state = ShardingState::new(group.clone(), sharding.strategy);
        if config.osd.optim_state_dict.use_dtensor {
            state = state.with_device_mesh((0..group.world_size()).collect());
        }
        let handle = FlatParamLayout::new(
            unit.params
                .iter()
                .map(|p| (p.name.clone(), p.shape.clone()))
                .collect(),
            sharding.aligned_numel,
            rank,
            world_size,
        )?;
        model.add_unit(prefix.clone(), layout, Arc::new(state), Arc::new(handle));
        params.extend(
            unit.params
                .iter()
                .map(|p| ParamSpec::new(format!("{}{}", prefix, p.name), &p.shape)),
        );
    }
    for param in &config.plain_params {
        model.add_param(param.name.clone());
        params.push(param.clone());
    }
    Ok((model, params))
}

/// Deterministic unflattened state dict for `params`
///
/// Tensor values differ per parameter and state name. `step` is the same
/// scalar everywhere so flat parameters can carry it.
pub fn reference_state_dict(params: &[ParamSpec], state_names: &[String]) -> Result<OptimStateDict> {
    let mut state = BTreeMap::new();
    for (p, param) in params.iter().enumerate() {
        let numel: usize = param.shape.iter().product();
        let mut param_state = ParamState::new();
        for (s, name) in state_names.iter().enumerate() {
            let base = (p * 1000 + s * 100) as f32;
            let values = (0..numel).map(|i| base + i as f32 * 0.5).collect();
            param_state.insert(
                name.clone(),
                StateValue::from(Tensor::from_vec(values, &param.shape)?),
            );
        }
        param_state.insert("step".to_string(), StateValue::from(Tensor::scalar(10.0f32)));
        state.insert(StateKey::Name(param.name.clone()), param_state);
    }
    let group = ParamGroup::new(params.iter().map(|p| StateKey::Name(p.name.clone())).collect())
        .with_option("lr", 1e-3);
    Ok(OptimStateDict::new(state).with_param_groups(vec![group]))
}

fn state_numels(osd: &OptimStateDict) -> BTreeMap<String, usize> {
    let mut numels = BTreeMap::new();
    for param_state in osd.state.values() {
        for (name, value) in param_state {
            let numel = match value {
                StateValue::Tensor(t) => t.numel(),
                StateValue::Sharded(s) => s.local.numel(),
                _ => continue,
            };
            *numels.entry(name.clone()).or_insert(0) += numel;
        }
    }
    numels
}

fn values_match(a: &StateValue, b: &StateValue) -> bool {
    match (a, b) {
        (StateValue::Tensor(a), StateValue::Tensor(b)) => a.values_equal(b),
        _ => a == b,
    }
}

fn states_match(expected: &OptimStateDict, state: &BTreeMap<StateKey, ParamState>) -> bool {
    expected.state.len() == state.len()
        && expected.state.iter().all(|(key, expected)| {
            state.get(key).is_some_and(|actual| {
                expected.len() == actual.len()
                    && expected
                        .iter()
                        .all(|(name, v)| actual.get(name).is_some_and(|a| values_match(v, a)))
            })
        })
}

#[instrument(skip_all, fields(rank = group.rank()))]
fn run_rank(config: &SimulationConfig, group: LocalGroup) -> Result<RankReport> {
    let group = Arc::new(group);
    let rank = group.rank();
    let osd_config = &config.osd.optim_state_dict;
    let (model, params) = build_model(config, group.clone())?;
    let reference = reference_state_dict(&params, &config.state_names)?;

    let mut optim = SimpleOptimizer::new(vec![
        OptimizerGroup::new(model.parameters()).with_option("lr", 1e-3)
    ]);
    let profiler = Profiler::new();
    let ctx = ConversionContext::new(group.as_ref(), osd_config, &profiler);

    let local = (!osd_config.rank0_only || rank == 0).then_some(&reference);
    let loadable = optim_state_dict_to_load(&ctx, &model, KeySource::Optimizer(&optim), local)?;
    optim.load_state_dict(&loadable)?;
    debug!(entries = loadable.state.len(), "loaded flattened state");

    let saved = optim_state_dict(&ctx, &model, &optim.state_dict(), KeySource::Optimizer(&optim))?;
    let profile = profiler.report();
    let collectives = group.stats();

    let saver = osd_config.is_saver(rank);
    let round_trip = if saver {
        let full = if osd_config.shard_state {
            saved
                .state
                .iter()
                .map(|(key, state)| Ok((key.clone(), gather_state_dict(state, group.as_ref())?)))
                .collect::<Result<BTreeMap<_, _>>>()?
        } else {
            saved.state.clone()
        };
        Some(states_match(&reference, &full) && saved.param_groups == reference.param_groups)
    } else {
        None
    };

    Ok(RankReport {
        rank,
        saver,
        entries: saved.state.len(),
        state_numels: state_numels(&saved),
        round_trip,
        profile,
        collectives,
    })
}
