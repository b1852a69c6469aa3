// ABOUTME: Engine configuration loaded from YAML files and environment variables
// ABOUTME: Holds correlation windows, retry limits, signal retention and logging settings

use anyhow::{Context, Result};
use serde::de::IntoDeserializer;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::error::ConfigError;
use crate::signal::CorrelatorConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    /// `pretty`, `compact` or `json`
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    #[serde(with = "humantime_serde")]
    pub missing_signal_window: Duration,

    pub stall_wakeups: u32,

    /// Delay suggested when a state loops on itself without a table wait.
    #[serde(with = "humantime_serde")]
    pub default_poll_delay: Duration,

    /// Consecutive transient failures tolerated before the task fails.
    pub transient_retry_limit: u32,

    #[serde(with = "humantime_serde")]
    pub transient_retry_delay: Duration,

    /// Unmatched signals older than this are deleted from the transport.
    #[serde(with = "humantime_serde")]
    pub signal_retention: Duration,

    pub record_transitions: bool,

    pub logging: LoggingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            missing_signal_window: Duration::from_secs(10 * 60),
            stall_wakeups: 3,
            default_poll_delay: Duration::from_secs(30),
            transient_retry_limit: 5,
            transient_retry_delay: Duration::from_secs(60),
            signal_retention: Duration::from_secs(24 * 60 * 60),
            record_transitions: true,
            logging: LoggingConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from file path or default locations
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = match path {
            Some(p) => Some(p),
            None => Self::find_config_file(),
        };

        let mut config = match config_path {
            Some(path) if path.exists() => Self::from_file(&path)?,
            _ => EngineConfig::default(),
        };

        config.merge_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: EngineConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        Ok(config)
    }

    fn find_config_file() -> Option<PathBuf> {
        let local = [
            PathBuf::from("waypoint.yaml"),
            PathBuf::from("waypoint.yml"),
            PathBuf::from(".waypoint.yaml"),
        ];
        if let Some(path) = local.into_iter().find(|p| p.exists()) {
            return Some(path);
        }

        dirs::home_dir()
            .map(|home| home.join(".waypoint").join("config.yaml"))
            .filter(|p| p.exists())
    }

    fn merge_env(&mut self) -> Result<()> {
        if let Ok(level) = std::env::var("WAYPOINT_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("WAYPOINT_LOG_FORMAT") {
            self.logging.format = format;
        }
        if let Ok(window) = std::env::var("WAYPOINT_MISSING_SIGNAL_WINDOW") {
            self.missing_signal_window = parse_duration("WAYPOINT_MISSING_SIGNAL_WINDOW", &window)?;
        }
        if let Ok(wakeups) = std::env::var("WAYPOINT_STALL_WAKEUPS") {
            self.stall_wakeups = wakeups
                .parse()
                .context("WAYPOINT_STALL_WAKEUPS must be a non-negative integer")?;
        }
        if let Ok(limit) = std::env::var("WAYPOINT_TRANSIENT_RETRY_LIMIT") {
            self.transient_retry_limit = limit
                .parse()
                .context("WAYPOINT_TRANSIENT_RETRY_LIMIT must be a non-negative integer")?;
        }
        Ok(())
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.missing_signal_window.is_zero() {
            return Err(ConfigError::invalid(
                "missing_signal_window",
                "must be greater than zero",
            ));
        }
        if !matches!(self.logging.format.as_str(), "pretty" | "compact" | "json") {
            return Err(ConfigError::invalid(
                "logging.format",
                format!("unknown format '{}'", self.logging.format),
            ));
        }
        Ok(())
    }

    pub fn correlator_config(&self) -> CorrelatorConfig {
        CorrelatorConfig {
            missing_signal_window: self.missing_signal_window,
            stall_wakeups: self.stall_wakeups,
        }
    }
}

fn parse_duration(name: &str, value: &str) -> Result<Duration> {
    let deserializer: serde::de::value::StrDeserializer<'_, serde::de::value::Error> =
        value.into_deserializer();
    humantime_serde::deserialize(deserializer)
        .with_context(|| format!("{} must be a duration like '90s' or '10m', got '{}'", name, value))
}
