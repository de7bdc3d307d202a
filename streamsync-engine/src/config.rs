//! Engine configuration
//!
//! Loaded from TOML. Every field has a built-in default so an empty (or
//! missing) file yields a usable configuration. Values the scheduler normally
//! supplies at runtime (container frame duration, early-EOS listener) may be
//! preset here for standalone runs.
//!
//! ```toml
//! [sync]
//! frame_duration_us = 10000
//! best_effort_port_ids = [5]
//!
//! [gapless]
//! early_eos_delay_ms = 40
//!
//! [logging]
//! level = "debug"
//! ```

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use streamsync_common::config as common_config;
use streamsync_common::media_format::MAX_CHANNELS;
use streamsync_common::PortId;
use tracing::info;

/// Upper bound on the early end-of-stream delay line
pub const MAX_EARLY_EOS_DELAY_MS: u32 = 500;

/// Full engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub gapless: GaplessConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Synchronization engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Output frame duration; becomes the per-port threshold
    #[serde(default)]
    pub frame_duration_us: Option<u32>,

    /// Slack added to each internal buffer for one upstream frame
    #[serde(default = "default_upstream_frame_us")]
    pub upstream_frame_us: u32,

    /// Output timestamp jump that counts as a discontinuity
    #[serde(default = "default_timestamp_tolerance_us")]
    pub timestamp_tolerance_us: u32,

    #[serde(default = "default_max_input_ports")]
    pub max_input_ports: usize,

    /// Input port ids that drop their oldest data instead of back-pressuring
    #[serde(default)]
    pub best_effort_port_ids: Vec<PortId>,
}

/// Gapless switchover engine settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GaplessConfig {
    /// Delay line length; 0 keeps the engine in pass-through
    #[serde(default)]
    pub early_eos_delay_ms: u32,

    #[serde(default)]
    pub frame_duration_us: Option<u32>,

    /// Reported in early end-of-stream events
    #[serde(default)]
    pub module_id: u32,

    #[serde(default)]
    pub duty_cycling: bool,

    /// Listener registered at construction
    #[serde(default)]
    pub early_eos_client: Option<u32>,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log file path (optional, logs to stderr if not specified)
    #[serde(default)]
    pub file: Option<PathBuf>,
}

fn default_upstream_frame_us() -> u32 {
    1_000
}

fn default_timestamp_tolerance_us() -> u32 {
    1_000
}

fn default_max_input_ports() -> usize {
    8
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            frame_duration_us: None,
            upstream_frame_us: default_upstream_frame_us(),
            timestamp_tolerance_us: default_timestamp_tolerance_us(),
            max_input_ports: default_max_input_ports(),
            best_effort_port_ids: Vec::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

impl EngineConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: EngineConfig = common_config::parse_toml(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let config: EngineConfig = common_config::load_toml_file(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Locate the config file (CLI, environment, platform dirs) and load it,
    /// falling back to defaults when none exists
    pub fn resolve(cli_path: Option<&Path>) -> Result<Self> {
        let config: EngineConfig =
            common_config::load_or_default(cli_path, common_config::CONFIG_ENV_VAR)?;
        config.validate()?;
        info!(
            "Engine config: sync frame {:?}us, gapless delay {}ms",
            config.sync.frame_duration_us, config.gapless.early_eos_delay_ms
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sync.frame_duration_us == Some(0) {
            return Err(EngineError::Config("sync.frame_duration_us must be positive".into()));
        }
        if self.gapless.frame_duration_us == Some(0) {
            return Err(EngineError::Config("gapless.frame_duration_us must be positive".into()));
        }
        if self.sync.max_input_ports == 0 || self.sync.max_input_ports > usize::from(MAX_CHANNELS) {
            return Err(EngineError::Config(format!(
                "sync.max_input_ports must be within 1..={}, got {}",
                MAX_CHANNELS, self.sync.max_input_ports
            )));
        }
        if self.gapless.early_eos_delay_ms > MAX_EARLY_EOS_DELAY_MS {
            return Err(EngineError::Config(format!(
                "gapless.early_eos_delay_ms {} exceeds maximum {}",
                self.gapless.early_eos_delay_ms, MAX_EARLY_EOS_DELAY_MS
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.sync.upstream_frame_us, 1_000);
        assert_eq!(config.sync.timestamp_tolerance_us, 1_000);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_sections_parse() {
        let config = EngineConfig::from_toml_str(
            r#"
            [sync]
            frame_duration_us = 10000
            best_effort_port_ids = [5, 7]

            [gapless]
            early_eos_delay_ms = 40
            module_id = 17
            duty_cycling = true
            "#,
        )
        .unwrap();

        assert_eq!(config.sync.frame_duration_us, Some(10_000));
        assert_eq!(config.sync.best_effort_port_ids, vec![5, 7]);
        assert_eq!(config.gapless.early_eos_delay_ms, 40);
        assert_eq!(config.gapless.module_id, 17);
        assert!(config.gapless.duty_cycling);
    }

    #[test]
    fn test_delay_limit_enforced() {
        let result = EngineConfig::from_toml_str("[gapless]\nearly_eos_delay_ms = 501\n");
        assert!(matches!(result, Err(EngineError::Config(_))));
    }

    #[test]
    fn test_zero_frame_rejected() {
        let result = EngineConfig::from_toml_str("[sync]\nframe_duration_us = 0\n");
        assert!(matches!(result, Err(EngineError::Config(_))));
    }
}
