//! Sharding geometry and model traversal interfaces
//!
//! The sharding module owns how original parameters are packed into flat
//! parameters and how those are split across ranks. The conversion code only
//! sees that through [`FlatParamGeometry`], plus the model's parameter names
//! through [`ModelTraversal`].

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

use collective::ProcessGroup;
use shard_core::{Device, Error, ParamId, ParamLayout, Rank, Result, ShardingStrategy, Tensor};

/// Where one original parameter lands inside this rank's shard
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShardParamInfo {
    pub in_shard: bool,
    /// Offset of the parameter's first local element within the shard
    pub offset_in_shard: usize,
    pub numel_in_shard: usize,
    /// First local element, as an index into the flattened parameter
    pub intra_param_start_idx: usize,
    /// Last local element (inclusive), as an index into the flattened parameter
    pub intra_param_end_idx: usize,
}

/// Shape of one flat parameter as laid out by the sharding module
///
/// The flat parameter is a sequence of entries, each either an original
/// parameter or alignment padding, padded again at the end so it splits
/// evenly across ranks. Indices in [`shapes`](Self::shapes) and
/// [`numels`](Self::numels) skip padding entries.
pub trait FlatParamGeometry: Send + Sync + fmt::Debug {
    /// Names of the original parameters, relative to the owning module
    fn fqns(&self) -> &[String];

    fn shapes(&self) -> &[Vec<usize>];

    fn numels(&self) -> &[usize];

    /// Element count of every entry, padding included
    fn numels_with_padding(&self) -> &[usize];

    /// Whether each entry of [`numels_with_padding`](Self::numels_with_padding) is padding
    fn padding_mask(&self) -> &[bool];

    /// Elements before end padding, alignment padding included
    fn unpadded_unsharded_size(&self) -> usize;

    fn padded_unsharded_size(&self) -> usize;

    /// Elements held by each rank
    fn sharded_size(&self) -> usize;

    /// Alignment, in elements, of each original parameter (0 disables it)
    fn aligned_numel(&self) -> usize;

    /// This rank's slice of the original parameter at `index`
    fn shard_param_info(&self, index: usize) -> Option<&ShardParamInfo>;

    /// Elements of the original parameter at `index` held by `rank`
    fn numel_in_shard_of(&self, index: usize, rank: Rank) -> usize {
        let shard_start = rank * self.sharded_size();
        let shard_end = shard_start + self.sharded_size();
        let mut offset = 0;
        let mut param = 0;
        for (&is_padding, &numel) in self.padding_mask().iter().zip(self.numels_with_padding()) {
            let (start, end) = (offset, offset + numel);
            offset = end;
            if is_padding {
                continue;
            }
            if param == index {
                return end.min(shard_end).saturating_sub(start.max(shard_start));
            }
            param += 1;
        }
        0
    }

    fn num_params(&self) -> usize {
        self.shapes().len()
    }

    /// Index of an original parameter by its local name
    fn index_for(&self, fqn: &str) -> Option<usize> {
        self.fqns().iter().position(|name| name == fqn)
    }

    /// Concatenate per-parameter tensors the way the flat parameter is built
    ///
    /// Alignment padding entries are filled with zeros. The result holds
    /// [`unpadded_unsharded_size`](Self::unpadded_unsharded_size) elements.
    fn flatten_tensors(&self, tensors: &[Tensor]) -> Result<Tensor> {
        let first = tensors.first().ok_or_else(|| Error::Internal {
            message: "cannot flatten an empty tensor list".to_string(),
        })?;
        if tensors.len() != self.num_params() {
            return Err(Error::Internal {
                message: format!(
                    "expected {} tensors to flatten but got {}",
                    self.num_params(),
                    tensors.len()
                ),
            });
        }
        let mut parts = Vec::with_capacity(self.padding_mask().len());
        let mut params = tensors.iter();
        for (&is_padding, &numel) in self.padding_mask().iter().zip(self.numels_with_padding()) {
            if is_padding {
                parts.push(Tensor::zeros(&[numel], first.dtype(), first.device()));
            } else if let Some(tensor) = params.next() {
                parts.push(tensor.flatten());
            }
        }
        Tensor::cat(&parts)
    }
}

/// Take `rank`'s chunk of a flattened tensor, zero-padded to the chunk size
///
/// Chunks are `ceil(numel / world_size)` elements; trailing ranks may get a
/// short or empty chunk. Returns the shard and the number of padding elements.
pub fn get_shard(tensor: &Tensor, rank: Rank, world_size: usize) -> Result<(Tensor, usize)> {
    let numel = tensor.numel();
    let chunk = numel.div_ceil(world_size.max(1));
    let start = (rank * chunk).min(numel);
    let end = (start + chunk).min(numel);
    let local = tensor.flatten().narrow(start, end - start)?;
    let pad = chunk - (end - start);
    Ok((local.pad(pad)?, pad))
}

/// Concrete flat parameter layout with alignment padding
#[derive(Debug, Clone)]
pub struct FlatParamLayout {
    fqns: Vec<String>,
    shapes: Vec<Vec<usize>>,
    numels: Vec<usize>,
    numels_with_padding: Vec<usize>,
    padding_mask: Vec<bool>,
    unpadded_unsharded_size: usize,
    padded_unsharded_size: usize,
    sharded_size: usize,
    aligned_numel: usize,
    shard_param_infos: Vec<ShardParamInfo>,
}

impl FlatParamLayout {
    /// Lay out `params` (local name, shape) for `rank` of `world_size`
    ///
    /// Alignment padding is inserted before a parameter whenever the running
    /// element count is not a multiple of `aligned_numel`.
    pub fn new(
        params: Vec<(String, Vec<usize>)>,
        aligned_numel: usize,
        rank: Rank,
        world_size: usize,
    ) -> Result<Self> {
        if params.is_empty() {
            return Err(Error::InvalidConfig {
                message: "a flat parameter needs at least one original parameter".to_string(),
            });
        }
        if world_size == 0 || rank >= world_size {
            return Err(Error::InvalidConfig {
                message: format!("rank {} is outside world size {}", rank, world_size),
            });
        }

        let mut fqns = Vec::with_capacity(params.len());
        let mut shapes = Vec::with_capacity(params.len());
        let mut numels = Vec::with_capacity(params.len());
        let mut numels_with_padding = Vec::new();
        let mut padding_mask = Vec::new();
        let mut total = 0usize;
        for (fqn, shape) in params {
            if aligned_numel > 0 && total % aligned_numel != 0 {
                let pad = aligned_numel - total % aligned_numel;
                numels_with_padding.push(pad);
                padding_mask.push(true);
                total += pad;
            }
            let numel: usize = shape.iter().product();
            numels_with_padding.push(numel);
            padding_mask.push(false);
            total += numel;
            fqns.push(fqn);
            shapes.push(shape);
            numels.push(numel);
        }

        let sharded_size = total.div_ceil(world_size);
        let padded_unsharded_size = sharded_size * world_size;
        let shard_start = rank * sharded_size;
        let shard_end = shard_start + sharded_size;

        let mut shard_param_infos = Vec::with_capacity(numels.len());
        let mut offset = 0usize;
        for (&is_padding, &numel) in padding_mask.iter().zip(&numels_with_padding) {
            let (start, end) = (offset, offset + numel);
            offset = end;
            if is_padding {
                continue;
            }
            let lo = start.max(shard_start);
            let hi = end.min(shard_end);
            shard_param_infos.push(if lo < hi {
                ShardParamInfo {
                    in_shard: true,
                    offset_in_shard: lo - shard_start,
                    numel_in_shard: hi - lo,
                    intra_param_start_idx: lo - start,
                    intra_param_end_idx: hi - start - 1,
                }
            } else {
                ShardParamInfo::default()
            });
        }

        Ok(Self {
            fqns,
            shapes,
            numels,
            numels_with_padding,
            padding_mask,
            unpadded_unsharded_size: total,
            padded_unsharded_size,
            sharded_size,
            aligned_numel,
            shard_param_infos,
        })
    }
}

impl FlatParamGeometry for FlatParamLayout {
    fn fqns(&self) -> &[String] {
        &self.fqns
    }

    fn shapes(&self) -> &[Vec<usize>] {
        &self.shapes
    }

    fn numels(&self) -> &[usize] {
        &self.numels
    }

    fn numels_with_padding(&self) -> &[usize] {
        &self.numels_with_padding
    }

    fn padding_mask(&self) -> &[bool] {
        &self.padding_mask
    }

    fn unpadded_unsharded_size(&self) -> usize {
        self.unpadded_unsharded_size
    }

    fn padded_unsharded_size(&self) -> usize {
        self.padded_unsharded_size
    }

    fn sharded_size(&self) -> usize {
        self.sharded_size
    }

    fn aligned_numel(&self) -> usize {
        self.aligned_numel
    }

    fn shard_param_info(&self, index: usize) -> Option<&ShardParamInfo> {
        self.shard_param_infos.get(index)
    }
}

/// Per-module sharding state
#[derive(Clone)]
pub struct ShardingState {
    pub rank: Rank,
    pub world_size: usize,
    pub strategy: ShardingStrategy,
    pub compute_device: Device,
    pub process_group: Arc<dyn ProcessGroup>,
    /// Ranks of the one-dimensional device mesh used for mesh re-sharding
    pub device_mesh: Option<Vec<Rank>>,
}

impl ShardingState {
    pub fn new(process_group: Arc<dyn ProcessGroup>, strategy: ShardingStrategy) -> Self {
        Self {
            rank: process_group.rank(),
            world_size: process_group.world_size(),
            strategy,
            compute_device: process_group.default_device(),
            process_group,
            device_mesh: None,
        }
    }

    pub fn with_device_mesh(mut self, mesh: Vec<Rank>) -> Self {
        self.device_mesh = Some(mesh);
        self
    }

    /// Whether tensor state is split across ranks
    pub fn is_sharded(&self) -> bool {
        self.world_size > 1 && self.strategy.shards_state()
    }
}

impl fmt::Debug for ShardingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardingState")
            .field("rank", &self.rank)
            .field("world_size", &self.world_size)
            .field("strategy", &self.strategy)
            .field("compute_device", &self.compute_device)
            .field("device_mesh", &self.device_mesh)
            .finish()
    }
}

/// How one flat parameter decomposes into original parameters
#[derive(Debug)]
pub struct FsdpParamInfo {
    /// Identifies the owning sharded unit
    pub unit: usize,
    pub state: Arc<ShardingState>,
    pub handle: Arc<dyn FlatParamGeometry>,
    /// Clean qualified name to index into the handle's original parameters
    pub param_indices: BTreeMap<String, usize>,
}

impl FsdpParamInfo {
    /// Qualified names in flat parameter order
    pub fn fqns_in_order(&self) -> Vec<String> {
        let mut names: Vec<_> = self.param_indices.iter().collect();
        names.sort_by_key(|entry| *entry.1);
        names.into_iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn index_of(&self, fqn: &str) -> Result<usize> {
        self.param_indices
            .get(fqn)
            .copied()
            .ok_or_else(|| Error::UnknownParamName {
                name: fqn.to_string(),
                known: self.param_indices.keys().cloned().collect(),
            })
    }
}

/// One module whose parameters are managed by the sharding module
#[derive(Debug, Clone)]
pub struct ShardedUnit {
    /// Module path, including the trailing dot (empty for the root)
    pub prefix: String,
    /// The flat parameter and its registered name, when parameters are flattened
    pub flat_param: Option<(String, ParamId)>,
    pub state: Arc<ShardingState>,
    pub handle: Arc<dyn FlatParamGeometry>,
}

/// Model traversal as seen by the conversion code
pub trait ModelTraversal {
    /// Every registered parameter with its name, duplicates included, in
    /// declaration order
    fn named_parameters(&self) -> Vec<(String, ParamId)>;

    /// Sharded units, outermost first
    fn sharded_units(&self) -> Vec<ShardedUnit>;

    /// De-duplicated parameters in declaration order
    fn parameters(&self) -> Vec<ParamId> {
        let mut seen = HashSet::new();
        self.named_parameters()
            .into_iter()
            .filter_map(|(_, id)| seen.insert(id).then_some(id))
            .collect()
    }
}

/// In-memory model description
///
/// Register plain parameters with [`add_param`](Self::add_param) and sharded
/// modules with [`add_unit`](Self::add_unit). In flat layout a unit registers
/// one flat parameter; in original-parameter layout it registers every
/// original parameter.
#[derive(Debug, Clone, Default)]
pub struct ShardedModule {
    params: Vec<(String, ParamId)>,
    units: Vec<ShardedUnit>,
    next_id: usize,
}

impl ShardedModule {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate(&mut self) -> ParamId {
        let id = ParamId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Register a parameter not managed by the sharding module
    pub fn add_param(&mut self, name: impl Into<String>) -> ParamId {
        let id = self.allocate();
        self.params.push((name.into(), id));
        id
    }

    /// Register another name for an existing parameter
    pub fn share_param(&mut self, name: impl Into<String>, id: ParamId) {
        self.params.push((name.into(), id));
    }

    /// Register a sharded module and return the parameters it exposes
    pub fn add_unit(
        &mut self,
        prefix: impl Into<String>,
        layout: ParamLayout,
        state: Arc<ShardingState>,
        handle: Arc<dyn FlatParamGeometry>,
    ) -> Vec<ParamId> {
        let prefix = prefix.into();
        let (exposed, flat_param) = match layout {
            ParamLayout::FlatParams => {
                let id = self.allocate();
                let name = format!("{}_fsdp_wrapped_module._flat_param", prefix);
                self.params.push((name.clone(), id));
                (vec![id], Some((name, id)))
            }
            ParamLayout::OrigParams => {
                let ids: Vec<_> = handle
                    .fqns()
                    .to_vec()
                    .into_iter()
                    .map(|local| {
                        let id = self.allocate();
                        self.params
                            .push((format!("{}_fsdp_wrapped_module.{}", prefix, local), id));
                        id
                    })
                    .collect();
                (ids, None)
            }
        };
        self.units.push(ShardedUnit {
            prefix,
            flat_param,
            state,
            handle,
        });
        exposed
    }
}

impl ModelTraversal for ShardedModule {
    fn named_parameters(&self) -> Vec<(String, ParamId)> {
        self.params.clone()
    }

    fn sharded_units(&self) -> Vec<ShardedUnit> {
        self.units.clone()
    }
}
