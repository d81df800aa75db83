//! Scenario description

use std::path::Path;

use serde::{Deserialize, Serialize};
use shard_core::{Error, OsdConfig, Result};

/// One parameter of the simulated model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub shape: Vec<usize>,
}

impl ParamSpec {
    pub fn new(name: impl Into<String>, shape: &[usize]) -> Self {
        Self {
            name: name.into(),
            shape: shape.to_vec(),
        }
    }
}

/// A module whose parameters are sharded together
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitSpec {
    /// Module path, e.g. `encoder.layer0`
    pub prefix: String,
    pub params: Vec<ParamSpec>,
}

impl UnitSpec {
    /// Prefix with exactly one trailing dot, or empty for the root module
    pub fn normalized_prefix(&self) -> String {
        let trimmed = self.prefix.trim_end_matches('.');
        if trimmed.is_empty() {
            String::new()
        } else {
            format!("{}.", trimmed)
        }
    }
}

/// Full simulation scenario, loaded from JSON
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub world_size: usize,

    #[serde(default)]
    pub osd: OsdConfig,

    pub units: Vec<UnitSpec>,

    /// Parameters outside every sharded unit
    #[serde(default)]
    pub plain_params: Vec<ParamSpec>,

    /// Tensor state names every parameter carries, besides `step`
    #[serde(default = "default_state_names")]
    pub state_names: Vec<String>,
}

fn default_state_names() -> Vec<String> {
    vec!["exp_avg".to_string(), "exp_avg_sq".to_string()]
}

impl SimulationConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: SimulationConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if self.world_size == 0 {
            return Err(Error::InvalidConfig {
                message: "world_size must be positive".to_string(),
            });
        }
        if self.state_names.iter().any(|name| name == "step") {
            return Err(Error::InvalidConfig {
                message: "`step` is always simulated as a scalar and cannot be a tensor state"
                    .to_string(),
            });
        }
        for unit in &self.units {
            if unit.params.is_empty() {
                return Err(Error::InvalidConfig {
                    message: format!("unit {:?} has no parameters", unit.prefix),
                });
            }
            if let Some(param) = unit.params.iter().find(|p| p.shape.is_empty()) {
                return Err(Error::InvalidConfig {
                    message: format!(
                        "{}{} is zero-dimensional, which a flat parameter cannot hold",
                        unit.normalized_prefix(),
                        param.name
                    ),
                });
            }
        }
        self.osd.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shard_core::ParamLayout;

    #[test]
    fn test_parse_minimal() {
        let config = SimulationConfig::from_json_str(
            r#"{
                "world_size": 2,
                "units": [{"prefix": "layer", "params": [{"name": "weight", "shape": [4, 2]}]}]
            }"#,
        )
        .unwrap();
        assert_eq!(config.world_size, 2);
        assert_eq!(config.units[0].normalized_prefix(), "layer.");
        assert_eq!(config.osd.optim_state_dict.layout, ParamLayout::FlatParams);
        assert_eq!(config.state_names, vec!["exp_avg", "exp_avg_sq"]);
    }

    #[test]
    fn test_rejects_zero_world_size() {
        let result = SimulationConfig::from_json_str(r#"{"world_size": 0, "units": []}"#);
        assert!(matches!(result, Err(Error::InvalidConfig { .. })));
    }

    #[test]
    fn test_rejects_scalar_param_in_unit() {
        let result = SimulationConfig::from_json_str(
            r#"{"world_size": 1, "units": [{"prefix": "", "params": [{"name": "s", "shape": []}]}]}"#,
        );
        assert!(matches!(result, Err(Error::InvalidConfig { .. })));
    }
}
