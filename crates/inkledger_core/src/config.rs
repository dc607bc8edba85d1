//! Core configuration loaded from TOML.
//!
//! # Responsibility
//! - Parse `CoreConfig` with every field defaulted.
//! - Reject sizes and intervals that would stall background work.
//! - Translate settings into the option structs of each layer.

use crate::db::IoRetryPolicy;
use crate::projection::OrchestratorOptions;
use crate::service::CommandBusOptions;
use crate::tags::PropagationOptions;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoreConfig {
    pub db_path: PathBuf,
    pub log_level: String,
    /// Absolute directory for rolling log files; `None` leaves logging to the
    /// host.
    pub log_dir: Option<PathBuf>,
    pub catch_up_batch_size: usize,
    pub poll_interval_ms: u64,
    pub debounce_ms: u64,
    pub propagation_batch_size: usize,
    pub propagation_delay_ms: u64,
    pub conflict_max_attempts: u32,
    pub conflict_backoff_ms: u64,
    pub io_max_attempts: u32,
    pub io_backoff_ms: u64,
    pub max_hierarchy_depth: usize,
    /// `0` disables snapshots.
    pub snapshot_interval: u64,
    pub task_cache_capacity: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("inkledger.sqlite3"),
            log_level: crate::logging::default_log_level().to_string(),
            log_dir: None,
            catch_up_batch_size: 1000,
            poll_interval_ms: 5000,
            debounce_ms: 500,
            propagation_batch_size: 10,
            propagation_delay_ms: 100,
            conflict_max_attempts: 3,
            conflict_backoff_ms: 100,
            io_max_attempts: 5,
            io_backoff_ms: 20,
            max_hierarchy_depth: crate::model::DEFAULT_MAX_HIERARCHY_DEPTH,
            snapshot_interval: 50,
            task_cache_capacity: 1024,
        }
    }
}

impl CoreConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Parses and validates TOML. Missing keys take their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.db_path.as_os_str().is_empty() {
            return Err(ConfigError::Validation("db_path must not be empty".to_string()));
        }
        let positive = [
            ("catch_up_batch_size", self.catch_up_batch_size as u64),
            ("poll_interval_ms", self.poll_interval_ms),
            ("debounce_ms", self.debounce_ms),
            ("propagation_batch_size", self.propagation_batch_size as u64),
            ("conflict_max_attempts", u64::from(self.conflict_max_attempts)),
            ("io_max_attempts", u64::from(self.io_max_attempts)),
            ("max_hierarchy_depth", self.max_hierarchy_depth as u64),
            ("task_cache_capacity", self.task_cache_capacity),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Validation(format!("{name} must be greater than zero")));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn io_retry(&self) -> IoRetryPolicy {
        IoRetryPolicy {
            max_attempts: self.io_max_attempts,
            backoff: Duration::from_millis(self.io_backoff_ms),
        }
    }

    pub fn orchestrator_options(&self) -> OrchestratorOptions {
        OrchestratorOptions {
            batch_size: self.catch_up_batch_size,
            ..OrchestratorOptions::default()
        }
    }

    pub fn command_bus_options(&self) -> CommandBusOptions {
        CommandBusOptions {
            conflict_max_attempts: self.conflict_max_attempts,
            conflict_backoff: Duration::from_millis(self.conflict_backoff_ms),
            io_retry: self.io_retry(),
            snapshot_interval: self.snapshot_interval,
            max_hierarchy_depth: self.max_hierarchy_depth,
            sync_catch_up: true,
        }
    }

    pub fn propagation_options(&self) -> PropagationOptions {
        PropagationOptions {
            batch_size: self.propagation_batch_size,
            batch_delay: Duration::from_millis(self.propagation_delay_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ConfigError, CoreConfig};
    use std::time::Duration;

    #[test]
    fn empty_toml_yields_defaults() {
        let config = CoreConfig::from_toml_str("").unwrap();
        assert_eq!(config, CoreConfig::default());
        assert_eq!(config.catch_up_batch_size, 1000);
        assert_eq!(config.poll_interval(), Duration::from_secs(5));
        assert_eq!(config.debounce_window(), Duration::from_millis(500));
    }

    #[test]
    fn partial_toml_overrides_only_given_keys() {
        let config = CoreConfig::from_toml_str(
            r#"
db_path = "/tmp/ledger.sqlite3"
debounce_ms = 250
snapshot_interval = 0
"#,
        )
        .unwrap();
        assert_eq!(config.db_path.to_str(), Some("/tmp/ledger.sqlite3"));
        assert_eq!(config.debounce_ms, 250);
        assert_eq!(config.command_bus_options().snapshot_interval, 0);
        assert_eq!(config.propagation_options().batch_size, 10);
    }

    #[test]
    fn zero_batch_size_and_unknown_keys_are_rejected() {
        let err = CoreConfig::from_toml_str("catch_up_batch_size = 0").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Validation(message) if message.contains("catch_up_batch_size")
        ));

        let err = CoreConfig::from_toml_str("poll_interval = 5").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
