//! Re-sharding of unflattened tensor state
//!
//! Chunking splits a full tensor along its first dimension into
//! `ceil(rows / world_size)`-row chunks; trailing ranks may hold fewer rows
//! or none. Gathering is the inverse and is a collective.

use collective::ProcessGroup;
use shard_core::{
    Error, ParamState, Rank, Result, ShardPlacement, ShardedTensor, StateValue, Tensor,
};
use tracing::debug;

fn chunk_rows(tensor: &Tensor, index: usize, parts: usize) -> Result<(Tensor, usize)> {
    let rows = tensor.shape().first().copied().ok_or_else(|| {
        Error::tensor("cannot chunk a zero-dimension tensor")
    })?;
    let per_chunk = rows.div_ceil(parts.max(1));
    let start = (index * per_chunk).min(rows);
    let end = (start + per_chunk).min(rows);
    Ok((tensor.rows(start, end - start)?, start))
}

/// Keep `rank`'s chunk of `tensor`, split across a process group
pub fn chunk_tensor(
    tensor: &Tensor,
    rank: Rank,
    world_size: usize,
    device_count: usize,
) -> Result<StateValue> {
    let (local, row_offset) = chunk_rows(tensor, rank, world_size)?;
    Ok(StateValue::Sharded(ShardedTensor {
        local,
        global_shape: tensor.shape().to_vec(),
        row_offset,
        placement: ShardPlacement::ProcessGroup {
            rank,
            world_size,
            device_count,
        },
    }))
}

/// Keep `rank`'s chunk of `tensor`, split across a one-dimensional device mesh
pub fn chunk_dtensor(tensor: &Tensor, rank: Rank, mesh: &[Rank]) -> Result<StateValue> {
    let index = mesh
        .iter()
        .position(|&r| r == rank)
        .ok_or_else(|| Error::InvalidConfig {
            message: format!("rank {} is not part of device mesh {:?}", rank, mesh),
        })?;
    let (local, row_offset) = chunk_rows(tensor, index, mesh.len())?;
    Ok(StateValue::Sharded(ShardedTensor {
        local,
        global_shape: tensor.shape().to_vec(),
        row_offset,
        placement: ShardPlacement::DeviceMesh {
            rank,
            mesh: mesh.to_vec(),
        },
    }))
}

/// Reassemble one sharded value on every rank
fn gather_sharded(sharded: &ShardedTensor, group: &dyn ProcessGroup) -> Result<Tensor> {
    let parts = match &sharded.placement {
        ShardPlacement::ProcessGroup { world_size, .. } => *world_size,
        ShardPlacement::DeviceMesh { mesh, .. } => mesh.len(),
    };
    if parts != group.world_size() {
        return Err(Error::Internal {
            message: format!(
                "sharded state spans {} ranks but the process group has {}",
                parts,
                group.world_size()
            ),
        });
    }
    let global_numel: usize = sharded.global_shape.iter().product();
    let rows = sharded.global_shape.first().copied().unwrap_or(1);
    let row_numel = if rows == 0 { 0 } else { global_numel / rows };
    let chunk_numel = rows.div_ceil(parts) * row_numel;

    let local = sharded
        .local
        .to(group.default_device())
        .pad(chunk_numel.saturating_sub(sharded.local.numel()))?;
    let mut gathered = Tensor::zeros(
        &[chunk_numel * parts],
        sharded.local.dtype(),
        group.default_device(),
    );
    group.all_gather_into_tensor(&mut gathered, &local)?;
    gathered
        .narrow(0, global_numel)?
        .reshape(&sharded.global_shape)
}

/// Replace every sharded value in `state` with its full tensor
///
/// Issues one all-gather per sharded value, in state-name order.
pub fn gather_state_dict(state: &ParamState, group: &dyn ProcessGroup) -> Result<ParamState> {
    let mut gathered = ParamState::new();
    for (name, value) in state {
        let value = match value {
            StateValue::Sharded(sharded) => {
                debug!(state = %name, shape = ?sharded.global_shape, "gathering sharded state");
                StateValue::Tensor(gather_sharded(sharded, group)?)
            }
            other => other.clone(),
        };
        gathered.insert(name.clone(), value);
    }
    Ok(gathered)
}
