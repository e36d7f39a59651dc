//! Diagnostic counters for the correlator.
//!
//! Fetch failures never reach callers; this is where they surface, next to
//! the other per-signal outcomes.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Lock-free counters updated on the signal path.
#[derive(Debug, Default)]
pub struct CorrelatorTelemetry {
    signals_received: AtomicU64,
    signals_dropped_session: AtomicU64,
    orphan_signals: AtomicU64,
    fetch_failures: AtomicU64,
    updates_delivered: AtomicU64,
    registrations_disposed: AtomicU64,
    duplicate_registrations: AtomicU64,
}

/// Why a signal finished the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalOutcome {
    /// A registration was resolved and its callback invoked.
    Delivered,
    /// The ledger advanced; nothing was waiting for this score.
    Merged,
    /// Signal user was not the session user. No side effects.
    SessionMismatch,
    /// Fetch failed; ledger and registration left as they were.
    FetchFailed,
    /// A registration for this score exists but could not be resolved
    /// against the key the signal was processed under.
    Deferred,
}

impl CorrelatorTelemetry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_received(&self) {
        self.signals_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_outcome(&self, outcome: SignalOutcome) {
        let counter = match outcome {
            SignalOutcome::Delivered => &self.updates_delivered,
            SignalOutcome::Merged => &self.orphan_signals,
            SignalOutcome::SessionMismatch => &self.signals_dropped_session,
            SignalOutcome::FetchFailed => &self.fetch_failures,
            SignalOutcome::Deferred => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_disposed(&self, count: usize) {
        self.registrations_disposed
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_duplicate(&self) {
        self.duplicate_registrations.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of the counters.
    #[must_use]
    pub fn snapshot(&self, pending_registrations: usize, open_ledger_entries: usize) -> TelemetrySnapshot {
        TelemetrySnapshot {
            signals_received: self.signals_received.load(Ordering::Relaxed),
            signals_dropped_session: self.signals_dropped_session.load(Ordering::Relaxed),
            orphan_signals: self.orphan_signals.load(Ordering::Relaxed),
            fetch_failures: self.fetch_failures.load(Ordering::Relaxed),
            updates_delivered: self.updates_delivered.load(Ordering::Relaxed),
            registrations_disposed: self.registrations_disposed.load(Ordering::Relaxed),
            duplicate_registrations: self.duplicate_registrations.load(Ordering::Relaxed),
            pending_registrations,
            open_ledger_entries,
        }
    }
}

/// Serializable view of [`CorrelatorTelemetry`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub signals_received: u64,
    pub signals_dropped_session: u64,
    pub orphan_signals: u64,
    pub fetch_failures: u64,
    pub updates_delivered: u64,
    pub registrations_disposed: u64,
    pub duplicate_registrations: u64,
    pub pending_registrations: usize,
    pub open_ledger_entries: usize,
}

impl TelemetrySnapshot {
    /// Fraction of accepted signals whose fetch failed.
    #[must_use]
    pub fn fetch_failure_ratio(&self) -> f64 {
        let accepted = self
            .signals_received
            .saturating_sub(self.signals_dropped_session);
        if accepted == 0 {
            return 0.0;
        }
        self.fetch_failures as f64 / accepted as f64
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
