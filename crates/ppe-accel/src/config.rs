//! Acceleration Configuration

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::admission::{AdmissionLimit, LimitMode};

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file could not be read or written
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// Config file is not valid JSON for this schema
    #[error("malformed config: {0}")]
    Json(#[from] serde_json::Error),

    /// Config value out of range
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Engine capacities and acceleration policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccelConfig {
    /// Admission policy
    pub limit_mode: LimitMode,
    /// Engine connection capacity
    pub max_connections: u32,
    /// Prefix table rows
    pub prefix_table_size: u32,
    /// IID table rows
    pub iid_table_size: u16,
    /// Deadline for a pending attempt in milliseconds; 0 disables it
    pub pending_timeout_ms: u64,
    /// Watchdog scan period in milliseconds
    pub watchdog_interval_ms: u64,
    /// Consecutive transient failures before giving up; 0 never gives up
    pub driver_fail_limit: u32,
}

impl Default for AccelConfig {
    fn default() -> Self {
        Self {
            limit_mode: LimitMode::Unbounded,
            max_connections: crate::DEFAULT_MAX_CONNECTIONS,
            prefix_table_size: crate::DEFAULT_PREFIX_TABLE_SIZE,
            iid_table_size: crate::DEFAULT_IID_TABLE_SIZE,
            pending_timeout_ms: 5000,
            watchdog_interval_ms: 500,
            driver_fail_limit: 3,
        }
    }
}

impl AccelConfig {
    /// Load from file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject values the engine cannot honor
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.prefix_table_size == 0 {
            return Err(ConfigError::Invalid("prefix_table_size must be nonzero".into()));
        }
        if self.iid_table_size == 0 {
            return Err(ConfigError::Invalid("iid_table_size must be nonzero".into()));
        }
        if self.limit_mode == LimitMode::Fixed && self.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "max_connections must be nonzero in fixed mode".into(),
            ));
        }
        if self.pending_timeout_ms > 0 && self.watchdog_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "watchdog_interval_ms must be nonzero when pending_timeout_ms is set".into(),
            ));
        }
        Ok(())
    }

    /// Admission limit
    pub fn admission_limit(&self) -> AdmissionLimit {
        AdmissionLimit {
            mode: self.limit_mode,
            max_slots: self.max_connections,
        }
    }

    /// Pending deadline, `None` when disabled
    pub fn pending_timeout(&self) -> Option<Duration> {
        (self.pending_timeout_ms > 0).then(|| Duration::from_millis(self.pending_timeout_ms))
    }

    /// Watchdog scan period
    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms)
    }
}
