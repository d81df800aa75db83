//! Optimizer state values
//!
//! An optimizer keeps, per parameter, a mapping from state name (for example
//! `exp_avg` or `step`) to a value. Values are tensors of positive dimension,
//! zero-dimension tensors, or arbitrary non-tensor data.

use crate::tensor::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Per-parameter optimizer state: state name to value, iterated in sorted order
pub type ParamState = BTreeMap<String, StateValue>;

/// Shape and dtype standing in for a positive-dimension tensor on
/// metadata-only channels
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PosDimTensorInfo {
    pub shape: Vec<usize>,
    pub dtype: DType,
}

impl PosDimTensorInfo {
    pub fn of(tensor: &Tensor) -> Self {
        Self {
            shape: tensor.shape().to_vec(),
            dtype: tensor.dtype(),
        }
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }
}

/// How a re-sharded tensor was split
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardPlacement {
    /// Chunked across the ranks of a process group
    ProcessGroup {
        rank: usize,
        world_size: usize,
        device_count: usize,
    },
    /// Chunked across the ranks of a one-dimensional device mesh
    DeviceMesh { rank: usize, mesh: Vec<usize> },
}

/// Local chunk of a tensor that is logically global
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardedTensor {
    /// This rank's rows
    pub local: Tensor,

    /// Shape of the full tensor
    pub global_shape: Vec<usize>,

    /// First row of the local chunk within the full tensor
    pub row_offset: usize,

    pub placement: ShardPlacement,
}

/// A single optimizer state value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StateValue {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Tensor(Tensor),
    Sharded(ShardedTensor),
    TensorMeta(PosDimTensorInfo),
    List(Vec<StateValue>),
    Map(BTreeMap<String, StateValue>),
}

impl StateValue {
    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            StateValue::Tensor(t) => Some(t),
            _ => None,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, StateValue::None)
    }

    /// Dense or sharded tensor
    pub fn is_tensor(&self) -> bool {
        matches!(self, StateValue::Tensor(_) | StateValue::Sharded(_))
    }

    pub fn is_pos_dim_tensor(&self) -> bool {
        match self {
            StateValue::Tensor(t) => t.dim() > 0,
            StateValue::Sharded(s) => !s.global_shape.is_empty(),
            _ => false,
        }
    }

    pub fn is_zero_dim_tensor(&self) -> bool {
        matches!(self, StateValue::Tensor(t) if t.is_zero_dim())
    }

    /// Concrete type of the value, used to reject mixed-type state
    pub fn type_name(&self) -> &'static str {
        match self {
            StateValue::None => "None",
            StateValue::Bool(_) => "bool",
            StateValue::Int(_) => "int",
            StateValue::Float(_) => "float",
            StateValue::Str(_) => "str",
            StateValue::Tensor(_) => "Tensor",
            StateValue::Sharded(_) => "ShardedTensor",
            StateValue::TensorMeta(_) => "PosDimTensorInfo",
            StateValue::List(_) => "list",
            StateValue::Map(_) => "dict",
        }
    }

    /// Apply `f` to every dense tensor, recursing through lists and maps
    pub fn map_tensors<F>(&self, f: &mut F) -> StateValue
    where
        F: FnMut(&Tensor) -> StateValue,
    {
        match self {
            StateValue::Tensor(t) => f(t),
            StateValue::List(items) => {
                StateValue::List(items.iter().map(|v| v.map_tensors(&mut *f)).collect())
            }
            StateValue::Map(entries) => StateValue::Map(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.map_tensors(&mut *f)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Copy of the value with every tensor moved to host memory
    pub fn cpu(&self) -> StateValue {
        match self {
            StateValue::Sharded(s) => StateValue::Sharded(ShardedTensor {
                local: s.local.to(Device::Cpu),
                ..s.clone()
            }),
            other => other.map_tensors(&mut |t| StateValue::Tensor(t.cpu())),
        }
    }
}

impl From<Tensor> for StateValue {
    fn from(value: Tensor) -> Self {
        StateValue::Tensor(value)
    }
}

impl From<i64> for StateValue {
    fn from(value: i64) -> Self {
        StateValue::Int(value)
    }
}

impl From<f64> for StateValue {
    fn from(value: f64) -> Self {
        StateValue::Float(value)
    }
}

impl From<bool> for StateValue {
    fn from(value: bool) -> Self {
        StateValue::Bool(value)
    }
}

impl From<&str> for StateValue {
    fn from(value: &str) -> Self {
        StateValue::Str(value.to_string())
    }
}

impl fmt::Display for StateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateValue::None => f.write_str("None"),
            StateValue::Bool(v) => write!(f, "{}", v),
            StateValue::Int(v) => write!(f, "{}", v),
            StateValue::Float(v) => write!(f, "{}", v),
            StateValue::Str(v) => write!(f, "{:?}", v),
            StateValue::Tensor(t) => write!(f, "{}", t),
            StateValue::Sharded(s) => write!(
                f,
                "ShardedTensor(global_shape={:?}, local_shape={:?})",
                s.global_shape,
                s.local.shape()
            ),
            StateValue::TensorMeta(info) => write!(
                f,
                "PosDimTensorInfo(shape={:?}, dtype={})",
                info.shape, info.dtype
            ),
            StateValue::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str("]")
            }
            StateValue::Map(entries) => {
                f.write_str("{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{:?}: {}", k, v)?;
                }
                f.write_str("}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let pos = StateValue::from(Tensor::from_slice(&[1.0f32, 2.0]));
        let zero = StateValue::from(Tensor::scalar(3.0f32));
        let other = StateValue::Int(3);

        assert!(pos.is_pos_dim_tensor() && !pos.is_zero_dim_tensor());
        assert!(zero.is_zero_dim_tensor() && !zero.is_pos_dim_tensor());
        assert!(!other.is_tensor());
        assert_eq!(other.type_name(), "int");
    }

    #[test]
    fn test_map_tensors_recurses() {
        let mut inner = BTreeMap::new();
        inner.insert(
            "m".to_string(),
            StateValue::from(Tensor::from_slice(&[1.0f32]).to(Device::Accelerator(0))),
        );
        let value = StateValue::List(vec![StateValue::Map(inner), StateValue::Int(1)]);

        let moved = value.cpu();
        let StateValue::List(items) = moved else {
            panic!("expected list");
        };
        let StateValue::Map(entries) = &items[0] else {
            panic!("expected map");
        };
        assert_eq!(entries["m"].as_tensor().unwrap().device(), Device::Cpu);
        assert_eq!(items[1], StateValue::Int(1));
    }
}
