//! Rebalance configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors loading a [`RebalanceConfig`] from disk.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

/// Recognised configuration options, with defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RebalanceConfig {
    /// `rebalance.transferBatchSize` — tokens per published batch.
    pub transfer_batch_size: usize,
    /// `rebalance.drop_index.wait_time` — seconds to delay the first
    /// source drop per rebalance.
    pub drop_index_wait_time_secs: u64,
    /// `rebalance.maxRemainingBuildTime` — upper bound in seconds on
    /// catch-up work before a token may proceed to `Ready`.
    pub max_remaining_build_time_secs: u64,
    /// `rebalance.node_eject_only`.
    pub node_eject_only: bool,
    /// `rebalance.disable_replica_repair`.
    pub disable_replica_repair: bool,
    /// `settings.rebalance.redistribute_indexes`.
    pub redistribute_indexes: bool,
    /// `planner.timeout` in seconds.
    pub planner_timeout_secs: u64,
    /// `planner.variationThreshold`.
    pub planner_variation_threshold: f64,
    /// `planner.internal.minIterPerTemp`.
    pub planner_min_iter_per_temp: u32,
    /// `planner.internal.maxIterPerTemp`.
    pub planner_max_iter_per_temp: u32,
    /// `planner.cpuProfile`. Not meaningful outside the planner process;
    /// kept only so a real-world config file round-trips.
    pub planner_cpu_profile: bool,
}

impl Default for RebalanceConfig {
    fn default() -> Self {
        Self {
            transfer_batch_size: 20,
            drop_index_wait_time_secs: 5,
            max_remaining_build_time_secs: 10,
            node_eject_only: false,
            disable_replica_repair: false,
            redistribute_indexes: false,
            planner_timeout_secs: 120,
            planner_variation_threshold: 0.1,
            planner_min_iter_per_temp: 100,
            planner_max_iter_per_temp: 1000,
            planner_cpu_profile: false,
        }
    }
}

impl RebalanceConfig {
    /// Loads configuration from a TOML file, falling back to defaults for
    /// any key not present.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), std::io::Error> {
        let content = toml::to_string_pretty(self).expect("RebalanceConfig always serialises");
        std::fs::write(path, content)
    }

    pub fn drop_index_wait_time(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.drop_index_wait_time_secs)
    }

    pub fn max_remaining_build_time(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.max_remaining_build_time_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_match_documented_values() {
        let config = RebalanceConfig::default();
        assert_eq!(config.transfer_batch_size, 20);
        assert_eq!(config.drop_index_wait_time_secs, 5);
        assert_eq!(config.max_remaining_build_time_secs, 10);
        assert!(!config.node_eject_only);
    }

    #[test]
    fn save_then_load_round_trips() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("rebalance.toml");

        let mut config = RebalanceConfig::default();
        config.transfer_batch_size = 7;
        config.node_eject_only = true;
        config.save(&path).unwrap();

        let loaded = RebalanceConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn missing_keys_fall_back_to_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("partial.toml");
        std::fs::write(&path, "transfer_batch_size = 5\n").unwrap();

        let loaded = RebalanceConfig::load(&path).unwrap();
        assert_eq!(loaded.transfer_batch_size, 5);
        assert_eq!(loaded.max_remaining_build_time_secs, 10);
    }

    #[test]
    fn load_missing_file_is_io_error() {
        let result = RebalanceConfig::load(Path::new("/nonexistent/rebalance.toml"));
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }
}
