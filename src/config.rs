//! Configuration for the provider lifecycle engine
//!
//! Loaded from TOML. Every section is optional and every field has a default,
//! so an empty document yields the stock configuration.

use crate::health::monitor::HealthMonitorConfig;
use crate::health::process::{ProcessMonitorConfig, WarningDecay};
use crate::observability::metrics::MetricsConfig;
use crate::pool::PoolConfig;
use crate::retry::RetryConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Top-level lifecycle configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LifecycleConfig {
    #[serde(default)]
    pub pool: PoolSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub health: HealthSection,
    #[serde(default)]
    pub process: ProcessSection,
    #[serde(default)]
    pub metrics: MetricsSection,
    #[serde(default)]
    pub state: StateSection,
}

/// Connection pool section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolSection {
    /// Maximum slots per provider (default: 5)
    #[serde(default = "default_max_pool_size")]
    pub max_pool_size: usize,
    /// Idle time before a free slot is reaped, also the reaper interval (default: 300)
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

/// Retry section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrySection {
    /// Total attempts before the last error is re-raised (default: 3)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// First backoff delay in milliseconds, doubled per attempt (default: 1000)
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

/// Provider health check section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthSection {
    /// Check interval in seconds (default: 60)
    #[serde(default = "default_health_interval_secs")]
    pub interval_secs: u64,
    /// Consecutive failed checks before escalating to critical (default: 3)
    #[serde(default = "default_critical_threshold")]
    pub critical_threshold: u32,
}

/// Process resource monitor section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessSection {
    /// Sampling interval in seconds (default: 5)
    #[serde(default = "default_process_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_threshold_pct")]
    pub cpu_threshold_pct: f32,
    #[serde(default = "default_threshold_pct")]
    pub memory_threshold_pct: f32,
    #[serde(default = "default_critical_threshold")]
    pub critical_threshold: u32,
    #[serde(default)]
    pub warning_decay: WarningDecay,
}

/// Metrics section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsSection {
    /// Samples kept for the rolling response time (default: 100)
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    /// Interval between `metrics:updated` publications in seconds (default: 5)
    #[serde(default = "default_update_interval_secs")]
    pub update_interval_secs: u64,
}

/// State history section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateSection {
    /// Transitions kept per provider (default: 100)
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn default_max_pool_size() -> usize {
    5
}

fn default_idle_timeout_secs() -> u64 {
    300 // 5 minutes
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_health_interval_secs() -> u64 {
    60
}

fn default_process_interval_secs() -> u64 {
    5
}

fn default_threshold_pct() -> f32 {
    90.0
}

fn default_critical_threshold() -> u32 {
    3
}

fn default_window_size() -> usize {
    100
}

fn default_update_interval_secs() -> u64 {
    5
}

fn default_history_limit() -> usize {
    100
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            max_pool_size: default_max_pool_size(),
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            interval_secs: default_health_interval_secs(),
            critical_threshold: default_critical_threshold(),
        }
    }
}

impl Default for ProcessSection {
    fn default() -> Self {
        Self {
            interval_secs: default_process_interval_secs(),
            cpu_threshold_pct: default_threshold_pct(),
            memory_threshold_pct: default_threshold_pct(),
            critical_threshold: default_critical_threshold(),
            warning_decay: WarningDecay::default(),
        }
    }
}

impl Default for MetricsSection {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            update_interval_secs: default_update_interval_secs(),
        }
    }
}

impl Default for StateSection {
    fn default() -> Self {
        Self {
            history_limit: default_history_limit(),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl LifecycleConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: LifecycleConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_nonzero(self.pool.max_pool_size as u64, "pool.max_pool_size")?;
        require_nonzero(self.pool.idle_timeout_secs, "pool.idle_timeout_secs")?;
        require_nonzero(self.retry.max_retries as u64, "retry.max_retries")?;
        require_nonzero(self.health.interval_secs, "health.interval_secs")?;
        require_nonzero(
            self.health.critical_threshold as u64,
            "health.critical_threshold",
        )?;
        require_nonzero(self.process.interval_secs, "process.interval_secs")?;
        require_nonzero(
            self.process.critical_threshold as u64,
            "process.critical_threshold",
        )?;
        require_percentage(self.process.cpu_threshold_pct, "process.cpu_threshold_pct")?;
        require_percentage(
            self.process.memory_threshold_pct,
            "process.memory_threshold_pct",
        )?;
        require_nonzero(self.metrics.window_size as u64, "metrics.window_size")?;
        require_nonzero(
            self.metrics.update_interval_secs,
            "metrics.update_interval_secs",
        )?;
        require_nonzero(self.state.history_limit as u64, "state.history_limit")?;
        Ok(())
    }
}

fn require_nonzero(value: u64, field: &str) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidConfig(format!(
            "{field} must be greater than 0"
        )));
    }
    Ok(())
}

fn require_percentage(value: f32, field: &str) -> Result<(), ConfigError> {
    if !(value > 0.0 && value <= 100.0) {
        return Err(ConfigError::InvalidConfig(format!(
            "{field} must be within (0, 100], got {value}"
        )));
    }
    Ok(())
}

impl From<&PoolSection> for PoolConfig {
    fn from(section: &PoolSection) -> Self {
        PoolConfig {
            max_pool_size: section.max_pool_size,
            idle_timeout: Duration::from_secs(section.idle_timeout_secs),
        }
    }
}

impl From<&RetrySection> for RetryConfig {
    fn from(section: &RetrySection) -> Self {
        RetryConfig {
            max_retries: section.max_retries,
            base_delay: Duration::from_millis(section.base_delay_ms),
        }
    }
}

impl From<&HealthSection> for HealthMonitorConfig {
    fn from(section: &HealthSection) -> Self {
        HealthMonitorConfig {
            interval: Duration::from_secs(section.interval_secs),
            critical_threshold: section.critical_threshold,
        }
    }
}

impl From<&ProcessSection> for ProcessMonitorConfig {
    fn from(section: &ProcessSection) -> Self {
        ProcessMonitorConfig {
            interval: Duration::from_secs(section.interval_secs),
            cpu_threshold_pct: section.cpu_threshold_pct,
            memory_threshold_pct: section.memory_threshold_pct,
            critical_threshold: section.critical_threshold,
            warning_decay: section.warning_decay,
        }
    }
}

impl From<&MetricsSection> for MetricsConfig {
    fn from(section: &MetricsSection) -> Self {
        MetricsConfig {
            window_size: section.window_size,
            update_interval: Duration::from_secs(section.update_interval_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = LifecycleConfig::from_toml_str("").unwrap();
        assert_eq!(config, LifecycleConfig::default());
        assert_eq!(config.pool.max_pool_size, 5);
        assert_eq!(config.pool.idle_timeout_secs, 300);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.base_delay_ms, 1000);
        assert_eq!(config.health.interval_secs, 60);
        assert_eq!(config.process.interval_secs, 5);
        assert_eq!(config.process.warning_decay, WarningDecay::Never);
        assert_eq!(config.metrics.window_size, 100);
        assert_eq!(config.state.history_limit, 100);
    }

    #[test]
    fn test_full_document() {
        let toml_content = r#"
[pool]
max_pool_size = 2
idle_timeout_secs = 30

[retry]
max_retries = 5
base_delay_ms = 100

[health]
interval_secs = 10
critical_threshold = 4

[process]
interval_secs = 1
cpu_threshold_pct = 75.0
warning_decay = "reset_on_healthy"

[metrics]
window_size = 20
"#;

        let config = LifecycleConfig::from_toml_str(toml_content).unwrap();
        assert_eq!(config.pool.max_pool_size, 2);
        assert_eq!(config.retry.base_delay_ms, 100);
        assert_eq!(config.health.critical_threshold, 4);
        assert_eq!(config.process.cpu_threshold_pct, 75.0);
        assert_eq!(config.process.memory_threshold_pct, 90.0);
        assert_eq!(config.process.warning_decay, WarningDecay::ResetOnHealthy);
        assert_eq!(config.metrics.window_size, 20);
        assert_eq!(config.metrics.update_interval_secs, 5);
    }

    #[test]
    fn test_zero_pool_size_rejected() {
        let result = LifecycleConfig::from_toml_str("[pool]\nmax_pool_size = 0\n");
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_percentage_out_of_range_rejected() {
        let result = LifecycleConfig::from_toml_str("[process]\nmemory_threshold_pct = 150.0\n");
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));

        let result = LifecycleConfig::from_toml_str("[process]\ncpu_threshold_pct = 0.0\n");
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_invalid_toml_is_parse_error() {
        let result = LifecycleConfig::from_toml_str("[pool\nmax_pool_size = ");
        assert!(matches!(result, Err(ConfigError::TomlParse(_))));
    }

    #[test]
    fn test_section_conversions() {
        let config = LifecycleConfig::default();

        let pool = PoolConfig::from(&config.pool);
        assert_eq!(pool.max_pool_size, 5);
        assert_eq!(pool.idle_timeout, Duration::from_secs(300));

        let retry = RetryConfig::from(&config.retry);
        assert_eq!(retry.base_delay, Duration::from_millis(1000));

        let health = HealthMonitorConfig::from(&config.health);
        assert_eq!(health.interval, Duration::from_secs(60));

        let process = ProcessMonitorConfig::from(&config.process);
        assert_eq!(process.interval, Duration::from_secs(5));
        assert_eq!(process.critical_threshold, 3);
    }
}
