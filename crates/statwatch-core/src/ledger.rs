//! Unresolved statistics deltas per (user, ruleset).
//!
//! A ledger entry opens on the first signal for its key, keeping the
//! baseline captured at that moment as `before`. Every further signal only
//! replaces `after`. The entry closes when a matching registration consumes
//! it, so consecutive unmatched signals merge into the next delivered update.
//!
//! ```text
//! Absent ──(signal)──► Open(before, after) ──(signal)──► Open(before, after')
//!    ▲                                                         │
//!    └───────────────────────(consume)─────────────────────────┘
//! ```

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::trace;

use crate::types::{LedgerKey, RulesetId, StatisticsSnapshot, UserId};

/// One open delta.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerEntry {
    pub user_id: UserId,
    pub ruleset: RulesetId,
    /// Baseline captured when the entry opened. Never changes while open.
    pub before: StatisticsSnapshot,
    /// Most recent successful fetch.
    pub after: StatisticsSnapshot,
    /// Signals merged into this entry so far.
    pub signals: u32,
}

/// Open deltas, keyed by (user, ruleset).
///
/// Not internally synchronised; the correlator guards it together with the
/// registration table.
#[derive(Debug, Default)]
pub struct DeltaLedger {
    entries: BTreeMap<LedgerKey, LedgerEntry>,
}

impl DeltaLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open an entry for `key` if none exists, seeding both sides from
    /// `baseline`. The closure only runs when an entry is created.
    pub fn ensure_entry(
        &mut self,
        key: &LedgerKey,
        baseline: impl FnOnce() -> StatisticsSnapshot,
    ) -> &mut LedgerEntry {
        self.entries.entry(key.clone()).or_insert_with(|| {
            let before = baseline();
            trace!(user_id = %key.user_id, ruleset = %key.ruleset, "Ledger entry opened");
            LedgerEntry {
                user_id: key.user_id,
                ruleset: key.ruleset.clone(),
                after: before.clone(),
                before,
                signals: 0,
            }
        })
    }

    /// Record a fresh snapshot as the entry's `after`, opening the entry
    /// first if needed. `before` is untouched.
    pub fn advance_entry(
        &mut self,
        key: &LedgerKey,
        fresh: StatisticsSnapshot,
        baseline: impl FnOnce() -> StatisticsSnapshot,
    ) {
        let entry = self.ensure_entry(key, baseline);
        entry.after = fresh;
        entry.signals = entry.signals.saturating_add(1);
    }

    /// Close the entry and hand back `(before, after)`.
    ///
    /// Only valid right after [`advance_entry`](Self::advance_entry) for the
    /// same key; `None` means that contract was broken.
    pub fn consume(&mut self, key: &LedgerKey) -> Option<(StatisticsSnapshot, StatisticsSnapshot)> {
        self.entries
            .remove(key)
            .map(|entry| (entry.before, entry.after))
    }

    /// Drop every entry belonging to `user_id`. Returns how many were dropped.
    pub fn invalidate_all(&mut self, user_id: UserId) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| key.user_id != user_id);
        before - self.entries.len()
    }

    /// Drop every entry whose user does not satisfy `keep`.
    pub fn retain_users(&mut self, mut keep: impl FnMut(UserId) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| keep(key.user_id));
        before - self.entries.len()
    }

    #[must_use]
    pub fn get(&self, key: &LedgerKey) -> Option<&LedgerEntry> {
        self.entries.get(key)
    }

    /// Rulesets with an open entry for `user_id`, in sorted order.
    pub fn open_rulesets(&self, user_id: UserId) -> impl Iterator<Item = &RulesetId> + '_ {
        self.entries
            .keys()
            .filter(move |key| key.user_id == user_id)
            .map(|key| &key.ruleset)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
