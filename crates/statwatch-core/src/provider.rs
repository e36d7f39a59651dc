//! Boundary traits for the correlator's external collaborators.
//!
//! * [`StatisticsProvider`] fetches authoritative statistics and exposes the
//!   locally cached baseline used to seed ledger entries.
//! * [`SessionContext`] answers "who is logged in" and "which ruleset is
//!   active" at the moment a signal is processed.
//!
//! [`SessionState`] is the in-process session holder embedding clients use:
//! it implements [`SessionContext`] and publishes every change on a
//! `tokio::sync::watch` channel so the ingress loop can react to logout and
//! user switches.

use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::info;

use crate::error::FetchError;
use crate::types::{RulesetId, StatisticsSnapshot, UserId};

/// Source of statistics snapshots for a (user, ruleset) pair.
pub trait StatisticsProvider: Send + Sync + 'static {
    /// Request fresh statistics from the server. Fallible.
    fn fetch(
        &self,
        user_id: UserId,
        ruleset: &RulesetId,
    ) -> impl Future<Output = Result<StatisticsSnapshot, FetchError>> + Send;

    /// Best-effort locally known statistics; an empty snapshot when unknown.
    fn current_baseline(&self, user_id: UserId, ruleset: &RulesetId) -> StatisticsSnapshot;
}

impl<P: StatisticsProvider> StatisticsProvider for Arc<P> {
    fn fetch(
        &self,
        user_id: UserId,
        ruleset: &RulesetId,
    ) -> impl Future<Output = Result<StatisticsSnapshot, FetchError>> + Send {
        (**self).fetch(user_id, ruleset)
    }

    fn current_baseline(&self, user_id: UserId, ruleset: &RulesetId) -> StatisticsSnapshot {
        (**self).current_baseline(user_id, ruleset)
    }
}

/// Read-only view of the active session.
pub trait SessionContext: Send + Sync + 'static {
    /// Authenticated user, or `None` when logged out.
    fn current_user_id(&self) -> Option<UserId>;

    /// Ruleset currently selected by the user.
    fn current_ruleset(&self) -> RulesetId;
}

impl<S: SessionContext> SessionContext for Arc<S> {
    fn current_user_id(&self) -> Option<UserId> {
        (**self).current_user_id()
    }

    fn current_ruleset(&self) -> RulesetId {
        (**self).current_ruleset()
    }
}

// =============================================================================
// SessionState
// =============================================================================

/// Value published on the session watch channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub user_id: Option<UserId>,
    pub ruleset: RulesetId,
}

/// Watch-backed session holder.
#[derive(Debug)]
pub struct SessionState {
    tx: watch::Sender<SessionSnapshot>,
}

impl SessionState {
    /// Logged-out session with `ruleset` selected.
    #[must_use]
    pub fn new(ruleset: RulesetId) -> Self {
        let (tx, _rx) = watch::channel(SessionSnapshot {
            user_id: None,
            ruleset,
        });
        Self { tx }
    }

    pub fn login(&self, user_id: UserId) {
        self.tx.send_if_modified(|s| {
            if s.user_id == Some(user_id) {
                return false;
            }
            info!(user_id = %user_id, previous = ?s.user_id, "Session user changed");
            s.user_id = Some(user_id);
            true
        });
    }

    pub fn logout(&self) {
        self.tx.send_if_modified(|s| {
            let Some(previous) = s.user_id.take() else {
                return false;
            };
            info!(user_id = %previous, "Session logged out");
            true
        });
    }

    pub fn set_ruleset(&self, ruleset: RulesetId) {
        self.tx.send_if_modified(|s| {
            if s.ruleset == ruleset {
                return false;
            }
            s.ruleset = ruleset;
            true
        });
    }

    /// Receiver observing every subsequent change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.tx.subscribe()
    }

    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        self.tx.borrow().clone()
    }
}

impl SessionContext for SessionState {
    fn current_user_id(&self) -> Option<UserId> {
        self.tx.borrow().user_id
    }

    fn current_ruleset(&self) -> RulesetId {
        self.tx.borrow().ruleset.clone()
    }
}
