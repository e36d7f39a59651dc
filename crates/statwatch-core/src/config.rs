//! Configuration management for statwatch
//!
//! Handles loading and validation of `statwatch.toml` files. Every field has
//! a default, so an empty file (or no file) yields a working configuration.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};
use crate::logging::{LogConfig, LogLevel};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Logging settings
    #[serde(default)]
    pub logging: LogConfig,

    /// Correlator settings
    #[serde(default)]
    pub correlator: CorrelatorConfig,
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-friendly output for interactive use
    #[default]
    Pretty,
    /// JSON lines for machine consumption
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pretty => f.write_str("pretty"),
            Self::Json => f.write_str("json"),
        }
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: {s}. Expected one of: pretty, json")),
        }
    }
}

/// Correlator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelatorConfig {
    /// Queue depth of each (user, ruleset) processing lane
    #[serde(default = "default_lane_capacity")]
    pub lane_capacity: usize,

    /// Drop ledger entries and registrations of other users on session change
    #[serde(default = "default_true")]
    pub invalidate_on_session_change: bool,

    /// How many processed orphan score ids to remember for late registration
    #[serde(default = "default_recent_scores_capacity")]
    pub recent_scores_capacity: usize,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            lane_capacity: default_lane_capacity(),
            invalidate_on_session_change: true,
            recent_scores_capacity: default_recent_scores_capacity(),
        }
    }
}

fn default_lane_capacity() -> usize {
    64
}

fn default_true() -> bool {
    true
}

fn default_recent_scores_capacity() -> usize {
    16
}

impl CorrelatorConfig {
    /// Validate config for runtime safety.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.lane_capacity == 0 {
            return Err(ConfigError::ZeroCapacity {
                field: "lane_capacity",
            });
        }
        Ok(())
    }
}

impl Config {
    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific path
    ///
    /// A missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::from_toml_str(&text),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file, using defaults");
                Ok(Self::default())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Validate every section
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        self.logging
            .level
            .parse::<LogLevel>()
            .map_err(|_| ConfigError::InvalidLogLevel(self.logging.level.clone()))?;
        self.correlator.validate()
    }
}
