//! statwatch-core: score-to-statistics correlation for a game client session
//!
//! After a ranked play is submitted, the server recalculates the player's
//! statistics asynchronously and later tells the client only that "score
//! processing finished for user U, score S". This crate turns that bare
//! signal into "statistics changed from A to B because of score S" for
//! whoever registered interest in S.
//!
//! # Architecture
//!
//! ```text
//! transport ──► SignalIngress ──► Correlator ──► per-key lane ──► fetch
//!                  │ (session filter)  │                            │
//!                  ▼                   ▼                            ▼
//!            SessionContext    RegistrationTable ◄──── DeltaLedger (advance/consume)
//!                                      │
//!                                      ▼
//!                          callback(StatisticsUpdate)
//! ```
//!
//! # Modules
//!
//! - `types`: ids, snapshots, updates, transport signal
//! - `provider`: statistics provider and session boundary traits
//! - `registration`: pending registrations and disposable handles
//! - `ledger`: per-(user, ruleset) unresolved deltas
//! - `correlator`: signal processing and per-key lanes
//! - `ingress`: session-filtered transport intake
//! - `telemetry`: diagnostic counters
//! - `config`: TOML configuration
//! - `logging`: `tracing` subscriber setup
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod config;
pub mod correlator;
pub mod error;
pub mod ingress;
pub mod ledger;
pub mod logging;
pub mod provider;
pub mod registration;
pub mod telemetry;
pub mod types;

pub use correlator::Correlator;
pub use error::{Error, FetchError, Result};
pub use ingress::{IngressDecision, SignalIngress};
pub use provider::{SessionContext, SessionState, StatisticsProvider};
pub use registration::{RegistrationHandle, RegistrationState};
pub use telemetry::{SignalOutcome, TelemetrySnapshot};
pub use types::{
    RulesetId, ScoreId, ScoreIdentity, ScoreProcessedSignal, StatisticsSnapshot,
    StatisticsUpdate, UserId,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
