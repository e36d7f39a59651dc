//! Identity and value types shared by the correlator components.
//!
//! Everything here is an immutable value: ids are `Copy` newtypes, snapshots
//! are compared by value only, and a [`StatisticsUpdate`] is built once and
//! handed to exactly one callback.

use std::fmt;

use serde::{Deserialize, Serialize};

// =============================================================================
// Identifiers
// =============================================================================

/// Online id of a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub u64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Online id of a submitted score.
///
/// Zero is reserved for scores that were never submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScoreId(pub u64);

impl ScoreId {
    /// Whether the id refers to a score the server knows about.
    #[must_use]
    pub const fn is_submitted(self) -> bool {
        self.0 > 0
    }
}

impl fmt::Display for ScoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Short name of a ruleset ("osu", "taiko", "fruits", "mania", or a custom one).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RulesetId(String);

impl RulesetId {
    #[must_use]
    pub fn new(short_name: impl Into<String>) -> Self {
        Self(short_name.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RulesetId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl fmt::Display for RulesetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Key of a ledger entry and of a processing lane.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LedgerKey {
    pub user_id: UserId,
    pub ruleset: RulesetId,
}

impl LedgerKey {
    #[must_use]
    pub fn new(user_id: UserId, ruleset: RulesetId) -> Self {
        Self { user_id, ruleset }
    }
}

impl fmt::Display for LedgerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.user_id, self.ruleset)
    }
}

// =============================================================================
// Score identity
// =============================================================================

/// A submitted score as seen by the caller that wants its statistics delta.
///
/// Built once at registration time and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScoreIdentity {
    /// Globally unique online id.
    pub id: ScoreId,
    /// Ruleset the score was played in.
    pub ruleset: RulesetId,
    /// User that submitted the score.
    pub user_id: UserId,
}

impl ScoreIdentity {
    #[must_use]
    pub fn new(id: ScoreId, ruleset: RulesetId, user_id: UserId) -> Self {
        Self {
            id,
            ruleset,
            user_id,
        }
    }

    #[must_use]
    pub fn ledger_key(&self) -> LedgerKey {
        LedgerKey::new(self.user_id, self.ruleset.clone())
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// A user's aggregate counters for one ruleset at one point in time.
///
/// Only value equality is meaningful; freshness is decided by fetch order,
/// never by comparing fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatisticsSnapshot {
    /// Cumulative score across all plays.
    pub total_score: u64,
    /// Cumulative score of best plays on ranked beatmaps.
    pub ranked_score: u64,
    /// Performance points.
    pub pp: f64,
    /// Weighted accuracy in the 0..=1 range.
    pub accuracy: f64,
    pub play_count: u64,
    /// Seconds spent playing.
    pub play_time: u64,
    pub total_hits: u64,
    pub maximum_combo: u32,
    /// Global rank, absent when the user is unranked.
    pub global_rank: Option<u32>,
    /// Country rank, absent when the user is unranked.
    pub country_rank: Option<u32>,
    /// Level including progress towards the next one (e.g. 101.37).
    pub level: f64,
}

impl StatisticsSnapshot {
    /// Snapshot with only the cumulative score set.
    #[must_use]
    pub fn with_total_score(total_score: u64) -> Self {
        Self {
            total_score,
            ..Self::default()
        }
    }
}

/// "Statistics changed from `before` to `after` because of `score`".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticsUpdate {
    pub score: ScoreIdentity,
    pub before: StatisticsSnapshot,
    pub after: StatisticsSnapshot,
}

impl StatisticsUpdate {
    /// Signed change in total score between the two snapshots.
    #[must_use]
    pub fn total_score_delta(&self) -> i128 {
        i128::from(self.after.total_score) - i128::from(self.before.total_score)
    }

    /// Signed change in performance points.
    #[must_use]
    pub fn pp_delta(&self) -> f64 {
        self.after.pp - self.before.pp
    }
}

// =============================================================================
// Transport signal
// =============================================================================

/// "Score processing finished for user U, score S", as delivered by the
/// session transport. Carries no payload beyond the two ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScoreProcessedSignal {
    pub user_id: UserId,
    pub score_id: ScoreId,
}

impl ScoreProcessedSignal {
    #[must_use]
    pub const fn new(user_id: UserId, score_id: ScoreId) -> Self {
        Self { user_id, score_id }
    }
}
