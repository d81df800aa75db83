//! Conversion configuration types

use crate::tensor::Device;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration for a sharded optimizer state conversion
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OsdConfig {
    /// Optimizer state dict settings
    pub optim_state_dict: OptimStateDictConfig,

    /// Sharding settings
    pub sharding: ShardingConfig,

    /// Collective transport settings
    pub collective: CollectiveConfig,
}

impl OsdConfig {
    pub fn validate(&self) -> Result<()> {
        self.sharding.validate()?;
        self.collective.validate()
    }
}

/// How parameters are presented to the optimizer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParamLayout {
    /// Original parameters are concatenated into flat parameters and the
    /// optimizer sees the flat parameters
    #[default]
    FlatParams,

    /// The optimizer sees the original parameters, each rank holding a
    /// (possibly empty) slice of every one of them
    OrigParams,
}

/// Optimizer state dict configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimStateDictConfig {
    /// Only rank 0 materializes the unflattened state dict
    pub rank0_only: bool,

    /// Re-shard unflattened tensor state across ranks instead of
    /// materializing it in full
    pub shard_state: bool,

    /// Re-shard over a device mesh rather than the process group
    pub use_dtensor: bool,

    /// Parameter layout seen by the optimizer
    pub layout: ParamLayout,
}

impl OptimStateDictConfig {
    /// Whether `rank` keeps the converted state dict
    pub fn is_saver(&self, rank: usize) -> bool {
        !self.rank0_only || rank == 0 || self.shard_state
    }
}

/// Strategy for sharding parameters and optimizer state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardingStrategy {
    /// Shard parameters, gradients and optimizer state
    #[default]
    FullShard,

    /// Shard gradients and optimizer state only
    ShardGradOp,

    /// Replicate across ranks
    NoShard,

    /// Shard within a node, replicate across nodes
    HybridShard,
}

impl ShardingStrategy {
    /// Whether optimizer state is partitioned across ranks
    pub fn shards_state(&self) -> bool {
        !matches!(self, ShardingStrategy::NoShard)
    }
}

/// Sharding configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardingConfig {
    /// Sharding strategy
    pub strategy: ShardingStrategy,

    /// Alignment, in elements, of each original parameter inside a flat
    /// parameter (0 disables alignment padding)
    pub aligned_numel: usize,

    /// Device that collectives run on
    pub compute_device: Device,
}

impl Default for ShardingConfig {
    fn default() -> Self {
        Self {
            strategy: ShardingStrategy::FullShard,
            aligned_numel: 0,
            compute_device: Device::Accelerator(0),
        }
    }
}

impl ShardingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.aligned_numel > 1 << 20 {
            return Err(Error::InvalidConfig {
                message: format!("aligned_numel {} is unreasonably large", self.aligned_numel),
            });
        }
        Ok(())
    }
}

/// Collective transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectiveConfig {
    /// How long a rank waits for its peers at one collective
    #[serde(with = "duration_millis")]
    pub timeout: Duration,
}

impl Default for CollectiveConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
        }
    }
}

impl CollectiveConfig {
    pub fn validate(&self) -> Result<()> {
        if self.timeout.is_zero() {
            return Err(Error::InvalidConfig {
                message: "collective timeout must be positive".to_string(),
            });
        }
        Ok(())
    }
}

/// Duration serialization helper for human-readable formats
mod duration_millis {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = OsdConfig::default();
        assert_eq!(config.optim_state_dict.layout, ParamLayout::FlatParams);
        assert_eq!(config.sharding.strategy, ShardingStrategy::FullShard);
        assert_eq!(config.collective.timeout, Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let config = OsdConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: OsdConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.collective.timeout, config.collective.timeout);
        assert_eq!(parsed.sharding.compute_device, config.sharding.compute_device);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let parsed: OsdConfig =
            serde_json::from_str(r#"{"optim_state_dict": {"layout": "OrigParams"}}"#).unwrap();
        assert_eq!(parsed.optim_state_dict.layout, ParamLayout::OrigParams);
        assert!(!parsed.optim_state_dict.rank0_only);
        assert_eq!(parsed.collective.timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_saver_gating() {
        let mut config = OptimStateDictConfig {
            rank0_only: true,
            ..Default::default()
        };
        assert!(config.is_saver(0));
        assert!(!config.is_saver(1));

        config.shard_state = true;
        assert!(config.is_saver(1));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let config = CollectiveConfig {
            timeout: Duration::ZERO,
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig { .. })));
    }
}
