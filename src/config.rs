//! Engine configuration
//!
//! Loaded from a TOML file; every field has a default so a missing file
//! or a partial file still yields a runnable configuration.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub correlation: CorrelationConfig,
    #[serde(default)]
    pub response: ResponseConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Log filter, e.g. "info" or "siemcor=debug"
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationConfig {
    /// Suppression cooldown for rules without their own override
    #[serde(default = "default_dedup_cooldown_minutes")]
    pub dedup_cooldown_minutes: u32,
    /// Deadline per indicator lookup
    #[serde(default = "default_lookup_timeout_secs")]
    pub lookup_timeout_secs: u64,
    /// Maximum indicator lookups in flight at once
    #[serde(default = "default_lookup_concurrency")]
    pub lookup_concurrency: usize,
    /// How long to wait for a threshold counter lock
    #[serde(default = "default_counter_lock_timeout_ms")]
    pub counter_lock_timeout_ms: u64,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            dedup_cooldown_minutes: default_dedup_cooldown_minutes(),
            lookup_timeout_secs: default_lookup_timeout_secs(),
            lookup_concurrency: default_lookup_concurrency(),
            counter_lock_timeout_ms: default_counter_lock_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseConfig {
    /// Wall-time budget for one pipeline run
    #[serde(default = "default_pipeline_timeout_secs")]
    pub pipeline_timeout_secs: u64,
}

impl Default for ResponseConfig {
    fn default() -> Self {
        Self {
            pipeline_timeout_secs: default_pipeline_timeout_secs(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_dedup_cooldown_minutes() -> u32 {
    10
}

fn default_lookup_timeout_secs() -> u64 {
    2
}

fn default_lookup_concurrency() -> usize {
    16
}

fn default_counter_lock_timeout_ms() -> u64 {
    250
}

fn default_pipeline_timeout_secs() -> u64 {
    120
}

impl Config {
    /// Load from a TOML file; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Config = toml::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.correlation.dedup_cooldown_minutes, 10);
        assert_eq!(config.correlation.lookup_concurrency, 16);
        assert_eq!(config.response.pipeline_timeout_secs, 120);
        assert_eq!(config.general.log_level, "info");
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [correlation]
            dedup_cooldown_minutes = 30
            "#,
        )
        .unwrap();
        assert_eq!(config.correlation.dedup_cooldown_minutes, 30);
        assert_eq!(config.correlation.lookup_timeout_secs, 2);
        assert_eq!(config.response.pipeline_timeout_secs, 120);
    }

    #[test]
    fn test_rejects_malformed_toml() {
        let result: std::result::Result<Config, _> = toml::from_str("correlation = 5");
        assert!(result.is_err());
    }
}
