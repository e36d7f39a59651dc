//! Pending registrations keyed by score id, and the handles that cancel them.
//!
//! # State machine
//!
//! ```text
//! Pending ──┬──► Resolved   (matching signal + successful fetch)
//!           └──► Disposed   (handle disposed, or session user changed)
//! ```
//!
//! Both transitions leave the table in the same step, and both happen while
//! the owner's lock is held, so for any registration exactly one of them
//! wins. The state ordinal lives in an `AtomicU8` shared with the handle,
//! letting callers observe the outcome without touching the lock.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::types::{ScoreId, ScoreIdentity, StatisticsUpdate};

/// Callback invoked with the finished update.
pub type UpdateCallback = Box<dyn FnOnce(StatisticsUpdate) + Send + 'static>;

// =============================================================================
// Registration state
// =============================================================================

/// Lifecycle state of a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum RegistrationState {
    /// Waiting for a matching signal.
    Pending = 0,
    /// Committed to delivery; the callback has fired or is about to.
    Resolved = 1,
    /// Cancelled; the callback will never fire.
    Disposed = 2,
}

impl RegistrationState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Pending,
            1 => Self::Resolved,
            _ => Self::Disposed,
        }
    }
}

/// Shared state ordinal. Only ever moves away from `Pending`, once.
#[derive(Debug, Clone)]
struct StateCell(Arc<AtomicU8>);

impl StateCell {
    fn pending() -> Self {
        Self(Arc::new(AtomicU8::new(RegistrationState::Pending as u8)))
    }

    fn get(&self) -> RegistrationState {
        RegistrationState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn transition(&self, to: RegistrationState) -> bool {
        self.0
            .compare_exchange(
                RegistrationState::Pending as u8,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

/// Distinguishes successive registrations of the same score id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegistrationToken(u64);

impl fmt::Display for RegistrationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "reg-{:04x}", self.0)
    }
}

// =============================================================================
// Registration
// =============================================================================

/// A caller's interest in the statistics delta produced by one score.
pub struct Registration {
    token: RegistrationToken,
    score: ScoreIdentity,
    callback: UpdateCallback,
    state: StateCell,
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("token", &self.token)
            .field("score", &self.score)
            .field("state", &self.state.get())
            .finish()
    }
}

impl Registration {
    #[must_use]
    pub fn score(&self) -> &ScoreIdentity {
        &self.score
    }

    #[must_use]
    pub fn token(&self) -> RegistrationToken {
        self.token
    }

    #[must_use]
    pub fn state(&self) -> RegistrationState {
        self.state.get()
    }

    /// Invoke the callback. Only registrations taken through
    /// [`RegistrationTable::try_take_for_resolution`] are ever delivered.
    pub fn deliver(self, update: StatisticsUpdate) {
        debug_assert_eq!(self.state.get(), RegistrationState::Resolved);
        (self.callback)(update);
    }
}

// =============================================================================
// RegistrationTable
// =============================================================================

/// At most one pending registration per score id.
///
/// Not internally synchronised: the correlator keeps it behind the same lock
/// as the delta ledger.
#[derive(Debug, Default)]
pub struct RegistrationTable {
    entries: HashMap<ScoreId, Registration>,
    next_token: u64,
}

/// What [`RegistrationTable::register`] hands back to the owner.
#[derive(Debug)]
pub struct RegisteredTicket {
    pub score_id: ScoreId,
    pub token: RegistrationToken,
    state: StateCell,
}

impl RegistrationTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a pending registration.
    ///
    /// A second registration for a score that is still pending is rejected
    /// and leaves the first one untouched.
    pub fn register(
        &mut self,
        score: ScoreIdentity,
        callback: UpdateCallback,
    ) -> Result<RegisteredTicket> {
        let score_id = score.id;
        if self.entries.contains_key(&score_id) {
            return Err(Error::DuplicateRegistration { score_id });
        }

        self.next_token += 1;
        let token = RegistrationToken(self.next_token);
        let state = StateCell::pending();
        self.entries.insert(
            score_id,
            Registration {
                token,
                score,
                callback,
                state: state.clone(),
            },
        );
        debug!(score_id = %score_id, token = %token, "Registration stored");

        Ok(RegisteredTicket {
            score_id,
            token,
            state,
        })
    }

    /// Cancel the registration identified by `(score_id, token)`.
    ///
    /// Returns the registration only for the call that actually moved it to
    /// `Disposed`, so the caller can drop its callback outside any lock.
    /// Already resolved, already disposed, or superseded tokens are no-ops.
    pub fn dispose(&mut self, score_id: ScoreId, token: RegistrationToken) -> Option<Registration> {
        match self.entries.get(&score_id) {
            Some(reg) if reg.token == token => {}
            _ => return None,
        }
        let reg = self.entries.remove(&score_id)?;
        if !reg.state.transition(RegistrationState::Disposed) {
            return None;
        }
        debug!(score_id = %score_id, token = %token, "Registration disposed");
        Some(reg)
    }

    /// Remove and commit the pending registration for `score_id`.
    ///
    /// After this returns `Some`, the registration can no longer be disposed.
    pub fn try_take_for_resolution(&mut self, score_id: ScoreId) -> Option<Registration> {
        let reg = self.entries.remove(&score_id)?;
        if reg.state.transition(RegistrationState::Resolved) {
            Some(reg)
        } else {
            None
        }
    }

    #[must_use]
    pub fn get(&self, score_id: ScoreId) -> Option<&Registration> {
        self.entries.get(&score_id)
    }

    /// Dispose every pending registration matching `predicate`.
    pub fn dispose_where(
        &mut self,
        mut predicate: impl FnMut(&ScoreIdentity) -> bool,
    ) -> Vec<Registration> {
        let doomed: Vec<ScoreId> = self
            .entries
            .iter()
            .filter(|(_, reg)| predicate(&reg.score))
            .map(|(id, _)| *id)
            .collect();

        doomed
            .into_iter()
            .filter_map(|id| self.entries.remove(&id))
            .filter(|reg| reg.state.transition(RegistrationState::Disposed))
            .collect()
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

// =============================================================================
// Handles
// =============================================================================

/// Owner of a registration table that a handle can reach back into.
pub trait RegistrationDisposer: Send + Sync {
    /// Dispose `(score_id, token)`; see [`RegistrationTable::dispose`].
    /// Returns whether this call performed the disposal.
    fn dispose_registration(&self, score_id: ScoreId, token: RegistrationToken) -> bool;
}

/// Disposable handle returned by registration.
///
/// Dropping the handle disposes the registration unless it was
/// [`detach`](Self::detach)ed.
pub struct RegistrationHandle {
    score_id: ScoreId,
    token: RegistrationToken,
    state: StateCell,
    owner: Option<Weak<dyn RegistrationDisposer>>,
}

impl fmt::Debug for RegistrationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistrationHandle")
            .field("score_id", &self.score_id)
            .field("token", &self.token)
            .field("state", &self.state.get())
            .field("attached", &self.owner.is_some())
            .finish()
    }
}

impl RegistrationHandle {
    pub(crate) fn new(ticket: RegisteredTicket, owner: Weak<dyn RegistrationDisposer>) -> Self {
        Self {
            score_id: ticket.score_id,
            token: ticket.token,
            state: ticket.state,
            owner: Some(owner),
        }
    }

    #[must_use]
    pub fn score_id(&self) -> ScoreId {
        self.score_id
    }

    #[must_use]
    pub fn token(&self) -> RegistrationToken {
        self.token
    }

    #[must_use]
    pub fn state(&self) -> RegistrationState {
        self.state.get()
    }

    /// Cancel the registration. Idempotent; a no-op once resolved.
    pub fn dispose(&self) {
        if self.state.get().is_terminal() {
            return;
        }
        if let Some(owner) = self.owner.as_ref().and_then(Weak::upgrade) {
            owner.dispose_registration(self.score_id, self.token);
        }
    }

    /// Let the registration outlive this handle.
    pub fn detach(mut self) {
        self.owner = None;
    }
}

impl Drop for RegistrationHandle {
    fn drop(&mut self) {
        self.dispose();
    }
}
