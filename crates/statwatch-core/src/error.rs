//! Error types for statwatch-core

use std::fmt::Write;
use thiserror::Error;

use crate::types::{RulesetId, ScoreId, UserId};

/// Actionable remediation guidance for an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Remediation {
    /// One-line summary of how to fix the issue
    pub summary: String,
    /// Additional alternative guidance
    pub alternatives: Vec<String>,
}

impl Remediation {
    /// Create a new remediation with a summary
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            alternatives: Vec::new(),
        }
    }

    /// Add an alternative suggestion
    #[must_use]
    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }

    /// Render remediation text for human-readable output
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "To fix:");
        let _ = writeln!(output, "  {}", self.summary);

        if !self.alternatives.is_empty() {
            let _ = writeln!(output, "  Alternatives:");
            for alt in &self.alternatives {
                let _ = writeln!(output, "    - {alt}");
            }
        }

        output
    }
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for statwatch-core
#[derive(Error, Debug)]
pub enum Error {
    /// A live registration already exists for this score
    #[error("score {score_id} already has a pending registration")]
    DuplicateRegistration { score_id: ScoreId },

    /// The score was never submitted, so no signal will ever arrive for it
    #[error("score {score_id} is not a submitted score")]
    InvalidScore { score_id: ScoreId },

    /// Registration attempted for a user other than the session user
    #[error("score belongs to user {actual}, but the session user is {}", display_user(.expected))]
    SessionMismatch {
        expected: Option<UserId>,
        actual: UserId,
    },

    /// Statistics fetch errors
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parse errors
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

fn display_user(user: &Option<UserId>) -> String {
    user.map_or_else(|| "logged out".to_string(), |id| id.to_string())
}

impl Error {
    /// Return remediation guidance when available.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::DuplicateRegistration { .. } => Some(
                Remediation::new("Dispose the existing registration before registering again.")
                    .alternative("Keep the first handle; it will still receive the update."),
            ),
            Self::InvalidScore { .. } => Some(Remediation::new(
                "Only register scores that received an online id from submission.",
            )),
            Self::SessionMismatch { .. } => Some(
                Remediation::new("Register scores only for the logged-in user.")
                    .alternative("Wait for login to complete before registering."),
            ),
            Self::Fetch(err) => err.remediation(),
            Self::Config(_) | Self::Toml(_) => Some(
                Remediation::new("Fix the configuration file and reload.")
                    .alternative("Delete the file to fall back to defaults."),
            ),
            Self::Io(_) => Some(Remediation::new(
                "Check filesystem permissions and paths, then retry.",
            )),
        }
    }
}

/// Failure of [`crate::provider::StatisticsProvider::fetch`].
///
/// Never propagated to callers of the correlator; it only reaches logs and
/// telemetry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request was not authorized")]
    Unauthorized,

    #[error("no statistics for user {user_id} in ruleset {ruleset}")]
    NotFound { user_id: UserId, ruleset: RulesetId },

    #[error("request cancelled")]
    Cancelled,
}

impl FetchError {
    /// Whether a later attempt could plausibly succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Cancelled)
    }

    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::Network(_) => Some(Remediation::new(
                "Check connectivity; the next processed score will refresh statistics.",
            )),
            Self::Unauthorized => Some(Remediation::new("Log in again to refresh credentials.")),
            Self::NotFound { .. } | Self::Cancelled => None,
        }
    }
}

/// Configuration validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} must be >= 1")]
    ZeroCapacity { field: &'static str },

    #[error("invalid log level: {0}")]
    InvalidLogLevel(String),
}
