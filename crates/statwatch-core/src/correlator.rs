//! Turns bare "score processed" signals into statistics updates.
//!
//! # Algorithm (per accepted signal)
//!
//! 1. Pick the ledger key: the ruleset of the pending registration for the
//!    score if there is one, otherwise the ruleset of the user's open ledger
//!    entry, otherwise the session's active ruleset.
//! 2. Fetch fresh statistics for the key, with no lock held. On failure the
//!    signal is abandoned; ledger and registration stay as they were.
//! 3. Advance the ledger entry (opening it from the baseline if needed).
//! 4. If a registration is pending for the score, consume the entry, build
//!    the update and invoke the callback once, outside the lock.
//!
//! # Concurrency
//!
//! Registration table and ledger share one `std::sync::Mutex`; it is never
//! held across an await. Signals for the same (user, ruleset) key run one at
//! a time: [`SignalIngress`](crate::ingress::SignalIngress) routes them into
//! a per-key lane (a tokio task fed by a bounded channel) so they apply in
//! arrival order, and every processing path holds a per-key async mutex
//! around fetch + apply. Different keys proceed in parallel.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::{mpsc, oneshot};
use tracing::{Instrument, debug, error, info, trace, warn};

use crate::config::CorrelatorConfig;
use crate::error::{Error, Result};
use crate::ledger::{DeltaLedger, LedgerEntry};
use crate::provider::{SessionContext, StatisticsProvider};
use crate::registration::{
    Registration, RegistrationDisposer, RegistrationHandle, RegistrationTable, RegistrationToken,
    UpdateCallback,
};
use crate::statwatch_span;
use crate::telemetry::{CorrelatorTelemetry, SignalOutcome, TelemetrySnapshot};
use crate::types::{
    LedgerKey, RulesetId, ScoreId, ScoreIdentity, ScoreProcessedSignal, StatisticsSnapshot,
    StatisticsUpdate, UserId,
};

/// Everything guarded by the single critical section.
#[derive(Debug, Default)]
struct CorrelatorState {
    registrations: RegistrationTable,
    ledger: DeltaLedger,
    /// Orphan signals whose delta is still open in the ledger, newest last.
    recent_orphans: VecDeque<RememberedOrphan>,
}

/// An orphan signal together with the ledger entry it advanced.
#[derive(Debug, Clone)]
struct RememberedOrphan {
    key: LedgerKey,
    signal: ScoreProcessedSignal,
}

struct Inner<P, S> {
    provider: P,
    session: S,
    config: CorrelatorConfig,
    state: Mutex<CorrelatorState>,
    lanes: Mutex<HashMap<LedgerKey, mpsc::Sender<ScoreProcessedSignal>>>,
    key_locks: Mutex<HashMap<LedgerKey, Arc<tokio::sync::Mutex<()>>>>,
    telemetry: CorrelatorTelemetry,
}

/// Score-to-statistics correlator for a single local session.
///
/// Cheap to clone; clones share all state.
pub struct Correlator<P, S> {
    inner: Arc<Inner<P, S>>,
}

impl<P, S> Clone for Correlator<P, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P, S> std::fmt::Debug for Correlator<P, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock_state();
        f.debug_struct("Correlator")
            .field("pending_registrations", &state.registrations.len())
            .field("open_ledger_entries", &state.ledger.len())
            .finish()
    }
}

impl<P, S> Correlator<P, S>
where
    P: StatisticsProvider,
    S: SessionContext,
{
    #[must_use]
    pub fn new(provider: P, session: S, config: CorrelatorConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                provider,
                session,
                config,
                state: Mutex::new(CorrelatorState::default()),
                lanes: Mutex::new(HashMap::new()),
                key_locks: Mutex::new(HashMap::new()),
                telemetry: CorrelatorTelemetry::new(),
            }),
        }
    }

    #[must_use]
    pub fn with_defaults(provider: P, session: S) -> Self {
        Self::new(provider, session, CorrelatorConfig::default())
    }

    /// Ask for the statistics update caused by `score`.
    ///
    /// `on_update` fires at most once. The returned handle cancels the
    /// registration when disposed or dropped. Never blocks on I/O.
    pub fn register<F>(&self, score: ScoreIdentity, on_update: F) -> Result<RegistrationHandle>
    where
        F: FnOnce(StatisticsUpdate) + Send + 'static,
    {
        self.inner.register(score, Box::new(on_update))
    }

    /// Like [`register`](Self::register), delivering through a oneshot
    /// channel. Disposal closes the channel.
    pub fn register_oneshot(
        &self,
        score: ScoreIdentity,
    ) -> Result<(RegistrationHandle, oneshot::Receiver<StatisticsUpdate>)> {
        let (tx, rx) = oneshot::channel();
        let handle = self.inner.register(
            score,
            Box::new(move |update: StatisticsUpdate| {
                let _ = tx.send(update);
            }),
        )?;
        Ok((handle, rx))
    }

    /// Process one signal inline, without going through a lane.
    ///
    /// Serialised per key against lanes and other inline calls, but arrival
    /// order relative to them is whatever order the calls take the key lock.
    pub async fn process_signal(&self, signal: ScoreProcessedSignal) -> SignalOutcome {
        self.inner.telemetry.record_received();
        if !self.inner.session_admits(signal.user_id) {
            return self.inner.drop_mismatched(signal);
        }
        let key = self.inner.resolve_key(signal);
        self.inner.process_keyed(signal, key).await
    }

    /// Queue an accepted signal onto its key's lane.
    pub(crate) async fn route(&self, signal: ScoreProcessedSignal) {
        self.inner.route(signal).await;
    }

    pub(crate) fn session(&self) -> &S {
        &self.inner.session
    }

    pub(crate) fn telemetry_counters(&self) -> &CorrelatorTelemetry {
        &self.inner.telemetry
    }

    /// React to login, logout, or a user switch.
    ///
    /// With `invalidate_on_session_change` set, every ledger entry and
    /// pending registration of a user other than `new_user` is dropped, and
    /// their lanes are closed.
    pub fn handle_session_change(&self, new_user: Option<UserId>) {
        self.inner.handle_session_change(new_user);
    }

    /// Drop all ledger entries of `user_id`.
    pub fn invalidate_user(&self, user_id: UserId) -> usize {
        let dropped = {
            let mut state = self.inner.lock_state();
            state.recent_orphans.retain(|o| o.key.user_id != user_id);
            state.ledger.invalidate_all(user_id)
        };
        if dropped > 0 {
            info!(user_id = %user_id, dropped, "Ledger entries invalidated");
        }
        dropped
    }

    /// Close every lane. Queued signals are still processed; new ones open
    /// fresh lanes.
    pub fn close_lanes(&self) {
        self.inner.lock_lanes().clear();
    }

    #[must_use]
    pub fn pending_registrations(&self) -> usize {
        self.inner.lock_state().registrations.len()
    }

    #[must_use]
    pub fn open_ledger_entries(&self) -> usize {
        self.inner.lock_state().ledger.len()
    }

    #[must_use]
    pub fn ledger_entry(&self, user_id: UserId, ruleset: &RulesetId) -> Option<LedgerEntry> {
        self.inner
            .lock_state()
            .ledger
            .get(&LedgerKey::new(user_id, ruleset.clone()))
            .cloned()
    }

    #[must_use]
    pub fn telemetry(&self) -> TelemetrySnapshot {
        let state = self.inner.lock_state();
        self.inner
            .telemetry
            .snapshot(state.registrations.len(), state.ledger.len())
    }
}

/// What step 4 decided while the lock was held.
enum Resolution {
    Deliver(Registration, StatisticsUpdate),
    Merged,
    Deferred(RulesetId),
    SessionMismatch,
}

impl<P, S> Inner<P, S> {
    fn lock_state(&self) -> MutexGuard<'_, CorrelatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_lanes(&self) -> MutexGuard<'_, HashMap<LedgerKey, mpsc::Sender<ScoreProcessedSignal>>> {
        self.lanes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<P, S> Inner<P, S>
where
    P: StatisticsProvider,
    S: SessionContext,
{
    fn session_admits(&self, user_id: UserId) -> bool {
        self.session.current_user_id() == Some(user_id)
    }

    fn drop_mismatched(&self, signal: ScoreProcessedSignal) -> SignalOutcome {
        debug!(
            user_id = %signal.user_id,
            score_id = %signal.score_id,
            session_user = ?self.session.current_user_id(),
            "Signal dropped: not the session user"
        );
        self.telemetry.record_outcome(SignalOutcome::SessionMismatch);
        SignalOutcome::SessionMismatch
    }

    fn register(
        self: &Arc<Self>,
        score: ScoreIdentity,
        callback: UpdateCallback,
    ) -> Result<RegistrationHandle> {
        if !score.id.is_submitted() {
            return Err(Error::InvalidScore { score_id: score.id });
        }
        let session_user = self.session.current_user_id();
        if session_user != Some(score.user_id) {
            return Err(Error::SessionMismatch {
                expected: session_user,
                actual: score.user_id,
            });
        }

        let registered = {
            let mut state = self.lock_state();
            if state.registrations.get(score.id).is_some() {
                None
            } else {
                let ticket = state.registrations.register(score.clone(), callback)?;
                let replay = state
                    .recent_orphans
                    .iter()
                    .position(|o| o.signal.score_id == score.id && o.signal.user_id == score.user_id)
                    .and_then(|idx| state.recent_orphans.remove(idx))
                    .map(|o| o.signal);
                Some((ticket, replay))
            }
        };
        // A rejected callback must drop after the lock is released; it may
        // own handles that dispose on drop.
        let Some((ticket, replay)) = registered else {
            self.telemetry.record_duplicate();
            return Err(Error::DuplicateRegistration { score_id: score.id });
        };

        if let Some(signal) = replay {
            debug!(
                user_id = %signal.user_id,
                score_id = %signal.score_id,
                "Score already processed; replaying signal for late registration"
            );
            self.spawn_replay(signal);
        }

        let owner: Weak<dyn RegistrationDisposer> = Arc::downgrade(self) as Weak<dyn RegistrationDisposer>;
        Ok(RegistrationHandle::new(ticket, owner))
    }

    /// Re-route a signal from a context that must not wait on it.
    fn spawn_replay(self: &Arc<Self>, signal: ScoreProcessedSignal) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(
                score_id = %signal.score_id,
                "No runtime available; registration stays pending"
            );
            return;
        };
        let weak = Arc::downgrade(self);
        runtime.spawn(async move {
            if let Some(inner) = weak.upgrade() {
                inner.route(signal).await;
            }
        });
    }

    /// Step 1: choose the (user, ruleset) key for a signal.
    ///
    /// An orphan follows the user's single open entry even when another
    /// ruleset is active: with an open osu entry and mania selected, a mania
    /// orphan fetches osu statistics and merges into the osu entry.
    fn resolve_key(&self, signal: ScoreProcessedSignal) -> LedgerKey {
        let state = self.lock_state();
        if let Some(reg) = state.registrations.get(signal.score_id) {
            if reg.score().user_id == signal.user_id {
                return reg.score().ledger_key();
            }
        }

        let active = self.session.current_ruleset();
        let open: Vec<&RulesetId> = state.ledger.open_rulesets(signal.user_id).collect();
        let ruleset = match open.as_slice() {
            [only] if **only != active => (*only).clone(),
            _ => active,
        };
        LedgerKey::new(signal.user_id, ruleset)
    }

    fn key_lock(&self, key: &LedgerKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.key_locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(key.clone()).or_default())
    }

    async fn route(self: &Arc<Self>, signal: ScoreProcessedSignal) {
        let key = self.resolve_key(signal);
        let mut signal = signal;
        // A lane whose task died hands the signal back; retry once on a fresh lane.
        for _ in 0..2 {
            let lane = self.lane_sender(&key);
            match lane.send(signal).await {
                Ok(()) => return,
                Err(mpsc::error::SendError(returned)) => {
                    warn!(user_id = %key.user_id, ruleset = %key.ruleset, "Lane closed unexpectedly; reopening");
                    self.lock_lanes().remove(&key);
                    signal = returned;
                }
            }
        }
        error!(
            user_id = %signal.user_id,
            score_id = %signal.score_id,
            "Signal could not be queued"
        );
    }

    fn lane_sender(self: &Arc<Self>, key: &LedgerKey) -> mpsc::Sender<ScoreProcessedSignal> {
        let mut lanes = self.lock_lanes();
        if let Some(tx) = lanes.get(key) {
            if !tx.is_closed() {
                return tx.clone();
            }
        }

        let (tx, mut rx) = mpsc::channel(self.config.lane_capacity.max(1));
        let weak = Arc::downgrade(self);
        let lane_key = key.clone();
        let span = statwatch_span!("lane", user_id = key.user_id.0, ruleset = key.ruleset.as_str());
        tokio::spawn(
            async move {
                while let Some(signal) = rx.recv().await {
                    let Some(inner) = weak.upgrade() else {
                        break;
                    };
                    inner.process_keyed(signal, lane_key.clone()).await;
                }
                trace!("Lane closed");
            }
            .instrument(span),
        );
        lanes.insert(key.clone(), tx.clone());
        tx
    }

    /// Steps 2–4 for one signal under its key's serialisation lock.
    async fn process_keyed(self: &Arc<Self>, signal: ScoreProcessedSignal, key: LedgerKey) -> SignalOutcome {
        let key_lock = self.key_lock(&key);
        let _serial = key_lock.lock().await;

        if !self.session_admits(signal.user_id) {
            return self.drop_mismatched(signal);
        }

        // Baseline is captured before the fetch so it predates the server's
        // view of this score.
        let baseline = {
            let state = self.lock_state();
            if state.ledger.get(&key).is_none() {
                Some(self.provider.current_baseline(key.user_id, &key.ruleset))
            } else {
                None
            }
        };

        let fresh = match self.provider.fetch(key.user_id, &key.ruleset).await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(
                    user_id = %key.user_id,
                    score_id = %signal.score_id,
                    ruleset = %key.ruleset,
                    error = %err,
                    transient = err.is_transient(),
                    "Statistics fetch failed; signal abandoned"
                );
                self.telemetry.record_outcome(SignalOutcome::FetchFailed);
                return SignalOutcome::FetchFailed;
            }
        };

        let resolution = self.apply(signal, &key, fresh, baseline);
        match resolution {
            Resolution::Deliver(registration, update) => {
                info!(
                    user_id = %key.user_id,
                    score_id = %signal.score_id,
                    ruleset = %key.ruleset,
                    total_score_delta = %update.total_score_delta(),
                    "Statistics update delivered"
                );
                self.telemetry.record_outcome(SignalOutcome::Delivered);
                if std::panic::catch_unwind(AssertUnwindSafe(|| registration.deliver(update))).is_err() {
                    error!(score_id = %signal.score_id, "Update callback panicked");
                }
                SignalOutcome::Delivered
            }
            Resolution::Merged => {
                debug!(
                    user_id = %key.user_id,
                    score_id = %signal.score_id,
                    ruleset = %key.ruleset,
                    "Orphan signal merged into ledger"
                );
                self.telemetry.record_outcome(SignalOutcome::Merged);
                SignalOutcome::Merged
            }
            Resolution::Deferred(wanted) => {
                debug!(
                    user_id = %key.user_id,
                    score_id = %signal.score_id,
                    ruleset = %key.ruleset,
                    registered_ruleset = %wanted,
                    "Registration appeared under another ruleset; replaying"
                );
                self.telemetry.record_outcome(SignalOutcome::Deferred);
                self.spawn_replay(signal);
                SignalOutcome::Deferred
            }
            Resolution::SessionMismatch => self.drop_mismatched(signal),
        }
    }

    /// Steps 3–4 under the state lock.
    fn apply(
        &self,
        signal: ScoreProcessedSignal,
        key: &LedgerKey,
        fresh: StatisticsSnapshot,
        baseline: Option<StatisticsSnapshot>,
    ) -> Resolution {
        let mut guard = self.lock_state();
        let state = &mut *guard;

        // The session may have changed while the fetch was in flight.
        if !self.session_admits(signal.user_id) {
            return Resolution::SessionMismatch;
        }

        let registered = state
            .registrations
            .get(signal.score_id)
            .map(|reg| reg.score().clone())
            .filter(|score| score.user_id == signal.user_id);
        // Registered meanwhile under another ruleset: this fetch belongs to
        // no open delta, so the ledger stays untouched.
        if let Some(score) = &registered {
            if score.ruleset != key.ruleset {
                return Resolution::Deferred(score.ruleset.clone());
            }
        }

        let provider = &self.provider;
        state.ledger.advance_entry(key, fresh, || {
            baseline.unwrap_or_else(|| provider.current_baseline(key.user_id, &key.ruleset))
        });

        let Some(score) = registered else {
            remember_orphan(
                &mut state.recent_orphans,
                key,
                signal,
                self.config.recent_scores_capacity,
            );
            return Resolution::Merged;
        };

        let Some((before, after)) = state.ledger.consume(key) else {
            return Resolution::Merged;
        };
        // Orphans merged into this delta are delivered with it.
        state.recent_orphans.retain(|o| o.key != *key);
        match state.registrations.try_take_for_resolution(signal.score_id) {
            Some(registration) => Resolution::Deliver(
                registration,
                StatisticsUpdate {
                    score,
                    before,
                    after,
                },
            ),
            None => Resolution::Merged,
        }
    }

    fn handle_session_change(&self, new_user: Option<UserId>) {
        if !self.config.invalidate_on_session_change {
            return;
        }
        let keep = |user: UserId| Some(user) == new_user;

        let (dropped_entries, disposed) = {
            let mut state = self.lock_state();
            let dropped = state.ledger.retain_users(keep);
            let disposed = state.registrations.dispose_where(|score| !keep(score.user_id));
            state.recent_orphans.retain(|o| keep(o.key.user_id));
            (dropped, disposed)
        };
        self.lock_lanes().retain(|key, _| keep(key.user_id));
        self.key_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|key, _| keep(key.user_id));

        self.telemetry.record_disposed(disposed.len());
        if dropped_entries > 0 || !disposed.is_empty() {
            info!(
                new_user = ?new_user,
                dropped_entries,
                disposed_registrations = disposed.len(),
                "Session changed; stale correlation state dropped"
            );
        }
        drop(disposed);
    }
}

fn remember_orphan(
    recent: &mut VecDeque<RememberedOrphan>,
    key: &LedgerKey,
    signal: ScoreProcessedSignal,
    capacity: usize,
) {
    if capacity == 0 {
        return;
    }
    recent.retain(|o| o.signal.score_id != signal.score_id);
    while recent.len() >= capacity {
        recent.pop_front();
    }
    recent.push_back(RememberedOrphan {
        key: key.clone(),
        signal,
    });
}

impl<P, S> RegistrationDisposer for Inner<P, S>
where
    P: StatisticsProvider,
    S: SessionContext,
{
    fn dispose_registration(&self, score_id: ScoreId, token: RegistrationToken) -> bool {
        let disposed = self.lock_state().registrations.dispose(score_id, token);
        match disposed {
            Some(registration) => {
                self.telemetry.record_disposed(1);
                drop(registration);
                true
            }
            None => false,
        }
    }
}
