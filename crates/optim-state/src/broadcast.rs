//! Rank-0-only loading helpers
//!
//! When only rank 0 holds the unflattened state dict, its structure goes out
//! first as metadata (positive-dimension tensors replaced by shape and
//! dtype), and tensor data follows value by value.

use collective::{ObjectCollectives, ProcessGroup};
use shard_core::{Device, Error, PosDimTensorInfo, Result, StateValue, Tensor};
use tracing::debug;

use crate::state_dict::OptimStateDict;

/// Share rank 0's state dict structure with every rank
///
/// Rank 0 gets its own dict back. Other ranks get the dict with every
/// positive-dimension tensor replaced by [`StateValue::TensorMeta`] and every
/// scalar tensor as a host copy. Rank 0 passing `None` fails on every rank.
pub fn broadcast_processed_state(
    optim_state_dict: Option<&OptimStateDict>,
    group: &dyn ProcessGroup,
) -> Result<OptimStateDict> {
    let processed = if group.rank() == 0 {
        Some(optim_state_dict.map(|osd| {
            osd.map_tensors(|t| {
                if t.is_zero_dim() {
                    StateValue::Tensor(t.cpu())
                } else {
                    StateValue::TensorMeta(PosDimTensorInfo::of(t))
                }
            })
        }))
    } else {
        None
    };
    let received: Option<OptimStateDict> = group.broadcast_object(processed.as_ref(), 0)?;
    let received = received.ok_or_else(|| Error::Schema {
        message: "rank 0 has no optimizer state dict to broadcast".to_string(),
    })?;
    if group.rank() == 0 {
        if let Some(osd) = optim_state_dict {
            return Ok(osd.clone());
        }
    }
    debug!(entries = received.state.len(), "received processed optimizer state");
    Ok(received)
}

/// Fill in one value's tensor data from rank 0
///
/// Only positive-dimension tensors (on rank 0) and their metadata stand-ins
/// (elsewhere) take part in a broadcast; everything else is returned as is.
pub fn broadcast_state(
    value: &StateValue,
    group: &dyn ProcessGroup,
    compute_device: Device,
) -> Result<StateValue> {
    let mut tensor = if group.rank() == 0 {
        match value {
            StateValue::Tensor(t) if t.dim() > 0 => t.to(compute_device),
            other => return Ok(other.clone()),
        }
    } else {
        match value {
            StateValue::Tensor(t) if t.dim() > 0 => {
                return Err(Error::Internal {
                    message: format!(
                        "a tensor state on a non-zero rank should have zero dimension, but got shape {:?}",
                        t.shape()
                    ),
                });
            }
            StateValue::TensorMeta(info) => Tensor::zeros(&info.shape, info.dtype, compute_device),
            other => return Ok(other.clone()),
        }
    };
    group.broadcast(&mut tensor, 0)?;
    Ok(StateValue::Tensor(tensor))
}
