//! Shared fakes for correlator integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use statwatch_core::{
    Correlator, FetchError, RulesetId, ScoreId, ScoreIdentity, ScoreProcessedSignal,
    SessionState, SignalIngress, StatisticsProvider, StatisticsSnapshot, StatisticsUpdate, UserId,
};
use tokio::sync::Semaphore;

pub const USER: UserId = UserId(2001);

/// Scripted behaviour for the next fetch.
#[derive(Debug, Clone)]
pub enum ScriptedFetch {
    Fail(FetchError),
    /// Sleep, then return this total score.
    Delayed(Duration, u64),
}

/// In-memory statistics server with a locally cached baseline.
#[derive(Debug, Default)]
pub struct FakeStatisticsProvider {
    server: Mutex<HashMap<(UserId, RulesetId), StatisticsSnapshot>>,
    baseline: Mutex<HashMap<(UserId, RulesetId), StatisticsSnapshot>>,
    script: Mutex<VecDeque<ScriptedFetch>>,
    gates: Mutex<HashMap<RulesetId, Arc<Semaphore>>>,
    fetch_log: Mutex<Vec<(UserId, RulesetId)>>,
}

impl FakeStatisticsProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set both the server value and the local baseline.
    pub fn seed(&self, user: UserId, ruleset: &str, total_score: u64) {
        self.set_server(user, ruleset, total_score);
        self.baseline.lock().unwrap().insert(
            (user, RulesetId::from(ruleset)),
            StatisticsSnapshot::with_total_score(total_score),
        );
    }

    /// Simulate the server finishing its recalculation.
    pub fn set_server(&self, user: UserId, ruleset: &str, total_score: u64) {
        self.server.lock().unwrap().insert(
            (user, RulesetId::from(ruleset)),
            StatisticsSnapshot::with_total_score(total_score),
        );
    }

    pub fn push_script(&self, step: ScriptedFetch) {
        self.script.lock().unwrap().push_back(step);
    }

    pub fn fail_next(&self) {
        self.push_script(ScriptedFetch::Fail(FetchError::Network(
            "connection reset".to_string(),
        )));
    }

    /// Hold every fetch for `ruleset` until permits are added.
    pub fn gate(&self, ruleset: &str) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        self.gates
            .lock()
            .unwrap()
            .insert(RulesetId::from(ruleset), Arc::clone(&gate));
        gate
    }

    pub fn fetch_count(&self) -> usize {
        self.fetch_log.lock().unwrap().len()
    }

    pub fn fetches(&self) -> Vec<(UserId, RulesetId)> {
        self.fetch_log.lock().unwrap().clone()
    }
}

impl StatisticsProvider for FakeStatisticsProvider {
    async fn fetch(
        &self,
        user_id: UserId,
        ruleset: &RulesetId,
    ) -> Result<StatisticsSnapshot, FetchError> {
        self.fetch_log
            .lock()
            .unwrap()
            .push((user_id, ruleset.clone()));

        let gate = { self.gates.lock().unwrap().get(ruleset).cloned() };
        if let Some(gate) = gate {
            gate.acquire().await.map_err(|_| FetchError::Cancelled)?.forget();
        }

        let step = { self.script.lock().unwrap().pop_front() };
        match step {
            Some(ScriptedFetch::Fail(err)) => Err(err),
            Some(ScriptedFetch::Delayed(delay, total)) => {
                tokio::time::sleep(delay).await;
                Ok(StatisticsSnapshot::with_total_score(total))
            }
            None => Ok(self
                .server
                .lock()
                .unwrap()
                .get(&(user_id, ruleset.clone()))
                .cloned()
                .unwrap_or_default()),
        }
    }

    fn current_baseline(&self, user_id: UserId, ruleset: &RulesetId) -> StatisticsSnapshot {
        self.baseline
            .lock()
            .unwrap()
            .get(&(user_id, ruleset.clone()))
            .cloned()
            .unwrap_or_default()
    }
}

pub type TestCorrelator = Correlator<Arc<FakeStatisticsProvider>, Arc<SessionState>>;
pub type TestIngress = SignalIngress<Arc<FakeStatisticsProvider>, Arc<SessionState>>;

pub struct Harness {
    pub provider: Arc<FakeStatisticsProvider>,
    pub session: Arc<SessionState>,
    pub correlator: TestCorrelator,
    pub ingress: TestIngress,
}

/// User 2001 logged in, "osu" active, baseline total score `baseline`.
pub fn harness(baseline: u64) -> Harness {
    let provider = Arc::new(FakeStatisticsProvider::new());
    provider.seed(USER, "osu", baseline);
    let session = Arc::new(SessionState::new(RulesetId::from("osu")));
    session.login(USER);
    let correlator = Correlator::with_defaults(Arc::clone(&provider), Arc::clone(&session));
    let ingress = SignalIngress::new(correlator.clone());
    Harness {
        provider,
        session,
        correlator,
        ingress,
    }
}

pub fn osu_score(id: u64) -> ScoreIdentity {
    ScoreIdentity::new(ScoreId(id), RulesetId::from("osu"), USER)
}

pub fn signal(id: u64) -> ScoreProcessedSignal {
    ScoreProcessedSignal::new(USER, ScoreId(id))
}

/// Callback sink recording every delivered update.
#[derive(Debug, Clone, Default)]
pub struct Collector(Arc<Mutex<Vec<StatisticsUpdate>>>);

impl Collector {
    pub fn callback(&self) -> impl FnOnce(StatisticsUpdate) + Send + 'static {
        let sink = Arc::clone(&self.0);
        move |update| sink.lock().unwrap().push(update)
    }

    pub fn updates(&self) -> Vec<StatisticsUpdate> {
        self.0.lock().unwrap().clone()
    }
}

/// Let every runnable task finish. Under paused time this returns once the
/// runtime is idle.
pub async fn settle() {
    tokio::time::sleep(Duration::from_secs(60)).await;
}
