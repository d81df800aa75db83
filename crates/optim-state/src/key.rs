//! Rank-independent parameter identity

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::state_dict::OptimStateDict;

/// Wrapper prefixes removed from qualified names
const WRAPPER_PREFIXES: [&str; 3] = [
    "_fsdp_wrapped_module.",
    "_checkpoint_wrapped_module.",
    "_orig_mod.",
];

/// Optimizer state key shared by every rank
///
/// Built from the unflattened parameter names rather than positional IDs, so
/// it does not depend on how each rank constructed its optimizer. Ordering is
/// derived, which makes sorted key lists identical on every rank.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OptimStateKey {
    /// More than one name only when several original parameters share one
    /// flat parameter
    pub unflat_param_names: Vec<String>,
    pub is_fsdp_managed: bool,
}

impl OptimStateKey {
    pub fn new(unflat_param_names: Vec<String>, is_fsdp_managed: bool) -> Self {
        Self {
            unflat_param_names,
            is_fsdp_managed,
        }
    }

    /// Name used to find the parameter's sharding info
    pub fn first_name(&self) -> &str {
        self.unflat_param_names
            .first()
            .map(String::as_str)
            .unwrap_or_default()
    }
}

impl fmt::Display for OptimStateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "OptimStateKey(unflat_param_names={:?}, is_fsdp_managed={})",
            self.unflat_param_names, self.is_fsdp_managed
        )
    }
}

/// How an optimizer keys its state dict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyScheme {
    /// Integer IDs in param-group order
    Positional,
    /// Qualified parameter names
    Named,
}

impl KeyScheme {
    /// Infer the scheme from a state dict's keys
    ///
    /// An empty state is treated as positional since named optimizers
    /// initialize their state eagerly.
    pub fn infer(optim_state_dict: &OptimStateDict) -> Self {
        if is_named_optimizer(optim_state_dict) {
            KeyScheme::Named
        } else {
            KeyScheme::Positional
        }
    }
}

/// Whether a state dict comes from an optimizer keyed by qualified names
pub fn is_named_optimizer(optim_state_dict: &OptimStateDict) -> bool {
    optim_state_dict
        .state
        .keys()
        .next()
        .map(|key| key.is_name())
        .unwrap_or(false)
}

/// Strip wrapper prefixes from a qualified name
pub fn clean_tensor_name(name: &str) -> String {
    WRAPPER_PREFIXES
        .iter()
        .fold(name.to_string(), |acc, prefix| acc.replace(prefix, ""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use shard_core::{ParamState, StateKey};

    #[test]
    fn test_clean_tensor_name() {
        assert_eq!(
            clean_tensor_name("layer1._fsdp_wrapped_module._checkpoint_wrapped_module.weight"),
            "layer1.weight"
        );
        assert_eq!(clean_tensor_name("_orig_mod.net.0.bias"), "net.0.bias");
        assert_eq!(clean_tensor_name("plain.weight"), "plain.weight");
    }

    #[test]
    fn test_key_ordering_is_total() {
        let mut keys = vec![
            OptimStateKey::new(vec!["b".into()], true),
            OptimStateKey::new(vec!["a".into(), "c".into()], true),
            OptimStateKey::new(vec!["a".into()], false),
        ];
        keys.sort();
        assert_eq!(keys[0].unflat_param_names, vec!["a".to_string()]);
        assert_eq!(keys[1].unflat_param_names, vec!["a".to_string(), "c".to_string()]);
        assert_eq!(keys[2].first_name(), "b");
    }

    #[test]
    fn test_key_scheme_inference() {
        let mut osd = OptimStateDict::default();
        assert_eq!(KeyScheme::infer(&osd), KeyScheme::Positional);

        osd.state.insert(StateKey::from("net.weight"), ParamState::new());
        assert_eq!(KeyScheme::infer(&osd), KeyScheme::Named);

        let mut positional = OptimStateDict::default();
        positional.state.insert(StateKey::from(0), ParamState::new());
        assert!(!is_named_optimizer(&positional));
    }
}
