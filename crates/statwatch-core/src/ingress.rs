//! Entry point for completion signals arriving from the session transport.
//!
//! Each signal is checked against the session user at the moment it is
//! read. Signals for anyone else are dropped for good (never queued, never
//! retried); the rest go to the correlator's per-key lanes unchanged.
//!
//! [`SignalIngress::run`] drives a transport channel together with the
//! session watch channel. Session changes are polled first, so a logout that
//! happened before a signal was read always takes effect before that signal
//! is filtered.

use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::correlator::Correlator;
use crate::provider::{SessionContext, SessionSnapshot, StatisticsProvider};
use crate::telemetry::SignalOutcome;
use crate::types::{ScoreProcessedSignal, UserId};

/// What happened to a signal at the ingress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngressDecision {
    /// Queued onto the correlator.
    Forwarded,
    /// Not for the session user; discarded.
    Dropped,
}

/// Session-filtering front of the correlator.
#[derive(Debug)]
pub struct SignalIngress<P, S> {
    correlator: Correlator<P, S>,
}

impl<P, S> Clone for SignalIngress<P, S> {
    fn clone(&self) -> Self {
        Self {
            correlator: self.correlator.clone(),
        }
    }
}

impl<P, S> SignalIngress<P, S>
where
    P: StatisticsProvider,
    S: SessionContext,
{
    #[must_use]
    pub fn new(correlator: Correlator<P, S>) -> Self {
        Self { correlator }
    }

    #[must_use]
    pub fn correlator(&self) -> &Correlator<P, S> {
        &self.correlator
    }

    /// Whether the current session accepts signals for `user_id`.
    #[must_use]
    pub fn admits(&self, user_id: UserId) -> bool {
        self.correlator.session().current_user_id() == Some(user_id)
    }

    /// Filter one signal and forward it if it belongs to the session user.
    ///
    /// Waits only if the signal's lane is full.
    pub async fn forward(&self, signal: ScoreProcessedSignal) -> IngressDecision {
        let telemetry = self.correlator.telemetry_counters();
        telemetry.record_received();

        if !self.admits(signal.user_id) {
            debug!(
                user_id = %signal.user_id,
                score_id = %signal.score_id,
                "Signal dropped at ingress: not the session user"
            );
            telemetry.record_outcome(SignalOutcome::SessionMismatch);
            return IngressDecision::Dropped;
        }

        self.correlator.route(signal).await;
        IngressDecision::Forwarded
    }

    /// Consume the transport until its channel closes.
    ///
    /// Session changes observed on `session` are applied to the correlator
    /// before the next signal is filtered.
    pub async fn run(
        self,
        mut signals: mpsc::Receiver<ScoreProcessedSignal>,
        mut session: watch::Receiver<SessionSnapshot>,
    ) {
        let mut current_user = session.borrow_and_update().user_id;
        let mut session_open = true;
        info!(user_id = ?current_user, "Signal ingress started");
        // Changes that happened before the loop started are not replayed by
        // the watch channel.
        self.correlator.handle_session_change(current_user);

        loop {
            tokio::select! {
                biased;

                changed = session.changed(), if session_open => {
                    if changed.is_err() {
                        debug!("Session channel closed; keeping last known user");
                        session_open = false;
                        continue;
                    }
                    let user = session.borrow_and_update().user_id;
                    if user != current_user {
                        current_user = user;
                        self.correlator.handle_session_change(user);
                    }
                }

                maybe = signals.recv() => {
                    let Some(signal) = maybe else {
                        break;
                    };
                    self.forward(signal).await;
                }
            }
        }

        info!("Signal ingress stopped");
    }
}
