//! Core identifier types shared across the workspace

use serde::{Deserialize, Serialize};
use std::fmt;

/// Rank of a process inside a process group
pub type Rank = usize;

/// Handle to one parameter object owned by the model
///
/// Two names referring to the same handle denote a shared parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParamId(pub usize);

impl fmt::Display for ParamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ParamId({})", self.0)
    }
}

/// Key of one entry in an optimizer state dict's `state` part
///
/// Positional optimizers key by integer ID, named optimizers and unflattened
/// dicts key by qualified name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StateKey {
    Id(usize),
    Name(String),
}

impl StateKey {
    pub fn as_name(&self) -> Option<&str> {
        match self {
            StateKey::Name(name) => Some(name),
            StateKey::Id(_) => None,
        }
    }

    pub fn is_name(&self) -> bool {
        matches!(self, StateKey::Name(_))
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateKey::Id(id) => write!(f, "{}", id),
            StateKey::Name(name) => write!(f, "{}", name),
        }
    }
}

impl From<usize> for StateKey {
    fn from(value: usize) -> Self {
        StateKey::Id(value)
    }
}

impl From<&str> for StateKey {
    fn from(value: &str) -> Self {
        StateKey::Name(value.to_string())
    }
}

impl From<String> for StateKey {
    fn from(value: String) -> Self {
        StateKey::Name(value)
    }
}
