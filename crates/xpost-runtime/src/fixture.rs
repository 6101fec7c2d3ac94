//! Scripted poster, in-process sessions and the fixture replay driver.
//!
//! A fixture is a JSON list of decisions, each carrying the poster outcomes to
//! replay for it. Unscripted calls succeed with generated numeric ids.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use xpost_core::{lock_or_recover, MetricsSnapshot};
use xpost_pool::SessionFactory;
use xpost_types::Decision;

use crate::coordinator::{ExecutionCoordinator, PublishReport};
use crate::poster::{
    ComposerOutcome, PostOutcome, PostRequest, Poster, ThreadComposer, ThreadRequest,
};

const FIRST_GENERATED_ID: u64 = 1_800_000_000_000_000_001;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixtureSession {
    pub slot: usize,
    pub serial: usize,
}

#[derive(Debug, Default)]
pub struct FixtureSessionFactory {
    created: AtomicUsize,
    discarded: AtomicUsize,
    failing_creates: AtomicUsize,
    create_delay_ms: AtomicU64,
}

impl FixtureSessionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` session starts fail.
    pub fn fail_next_creates(&self, count: usize) {
        self.failing_creates.store(count, Ordering::SeqCst);
    }

    /// Delays every later session start by `delay`.
    pub fn set_create_delay(&self, delay: Duration) {
        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.create_delay_ms.store(delay_ms, Ordering::SeqCst);
    }

    pub fn sessions_created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn sessions_discarded(&self) -> usize {
        self.discarded.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionFactory for FixtureSessionFactory {
    type Session = FixtureSession;

    async fn create_session(&self, slot: usize) -> anyhow::Result<FixtureSession> {
        let delay_ms = self.create_delay_ms.load(Ordering::SeqCst);
        if delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
        if self
            .failing_creates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                remaining.checked_sub(1)
            })
            .is_ok()
        {
            anyhow::bail!("fixture session for slot {slot} failed to start");
        }
        let serial = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(FixtureSession { slot, serial })
    }

    fn discard_session(&self, _slot: usize, _session: FixtureSession) {
        self.discarded.fetch_add(1, Ordering::SeqCst);
    }
}

/// Poster and thread composer replaying scripted outcomes per decision id.
#[derive(Debug)]
pub struct FixturePoster {
    scripts: Mutex<HashMap<String, VecDeque<PostOutcome>>>,
    composer_scripts: Mutex<HashMap<String, VecDeque<ComposerOutcome>>>,
    calls: Mutex<Vec<PostRequest>>,
    compose_calls: Mutex<Vec<ThreadRequest>>,
    next_id: AtomicU64,
}

impl Default for FixturePoster {
    fn default() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            composer_scripts: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            compose_calls: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(FIRST_GENERATED_ID),
        }
    }
}

impl FixturePoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues outcomes returned, in order, by `submit` calls for `decision_id`.
    pub fn script<I>(&self, decision_id: &str, outcomes: I)
    where
        I: IntoIterator<Item = PostOutcome>,
    {
        lock_or_recover(&self.scripts)
            .entry(decision_id.to_string())
            .or_default()
            .extend(outcomes);
    }

    pub fn script_composer<I>(&self, decision_id: &str, outcomes: I)
    where
        I: IntoIterator<Item = ComposerOutcome>,
    {
        lock_or_recover(&self.composer_scripts)
            .entry(decision_id.to_string())
            .or_default()
            .extend(outcomes);
    }

    pub fn calls(&self) -> Vec<PostRequest> {
        lock_or_recover(&self.calls).clone()
    }

    pub fn call_count(&self) -> usize {
        lock_or_recover(&self.calls).len()
    }

    pub fn calls_for(&self, decision_id: &str) -> usize {
        lock_or_recover(&self.calls)
            .iter()
            .filter(|request| request.decision_id == decision_id)
            .count()
    }

    pub fn compose_calls_for(&self, decision_id: &str) -> usize {
        lock_or_recover(&self.compose_calls)
            .iter()
            .filter(|request| request.decision_id == decision_id)
            .count()
    }

    fn generated_id(&self) -> String {
        self.next_id.fetch_add(1, Ordering::SeqCst).to_string()
    }
}

#[async_trait]
impl Poster for FixturePoster {
    type Session = FixtureSession;

    async fn submit(&self, _session: &mut FixtureSession, request: &PostRequest) -> PostOutcome {
        lock_or_recover(&self.calls).push(request.clone());
        let scripted = lock_or_recover(&self.scripts)
            .get_mut(&request.decision_id)
            .and_then(VecDeque::pop_front);
        scripted.unwrap_or_else(|| PostOutcome::posted(self.generated_id()))
    }
}

#[async_trait]
impl ThreadComposer for FixturePoster {
    type Session = FixtureSession;

    async fn compose(
        &self,
        _session: &mut FixtureSession,
        request: &ThreadRequest,
    ) -> ComposerOutcome {
        lock_or_recover(&self.compose_calls).push(request.clone());
        let scripted = lock_or_recover(&self.composer_scripts)
            .get_mut(&request.decision_id)
            .and_then(VecDeque::pop_front);
        scripted.unwrap_or_else(|| ComposerOutcome::Posted {
            external_ids: request
                .segments
                .iter()
                .map(|_| self.generated_id())
                .collect(),
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixtureGuard {
    #[default]
    Issue,
    Omit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixtureDecision {
    #[serde(flatten)]
    pub decision: Decision,
    #[serde(default)]
    pub outcomes: Vec<PostOutcome>,
    #[serde(default)]
    pub composer_outcomes: Vec<ComposerOutcome>,
    #[serde(default)]
    pub guard: FixtureGuard,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishFixture {
    pub decisions: Vec<FixtureDecision>,
}

impl PublishFixture {
    pub fn from_json_str(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).context("failed to parse publish fixture")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_json_str(&raw).with_context(|| format!("invalid fixture {}", path.display()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplayEntry {
    pub decision_id: String,
    pub outcome: String,
    pub reason: Option<String>,
    pub external_ids: Vec<String>,
    pub attempts: usize,
    pub chain_broken: bool,
}

impl ReplayEntry {
    fn from_report(report: &PublishReport) -> Self {
        let external_ids = match report.thread.as_ref() {
            Some(thread) => thread
                .external_ids
                .iter()
                .map(ToString::to_string)
                .collect(),
            None => report
                .external_id()
                .map(|id| vec![id.to_string()])
                .unwrap_or_default(),
        };
        Self {
            decision_id: report.decision_id.clone(),
            outcome: report.outcome.label().to_string(),
            reason: report.reason_code(),
            external_ids,
            attempts: report.attempts,
            chain_broken: report
                .thread
                .as_ref()
                .is_some_and(|thread| thread.chain_broken),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplaySummary {
    pub job_run_id: String,
    pub entries: Vec<ReplayEntry>,
    pub posted: usize,
    pub blocked: usize,
    pub failed: usize,
    pub already_terminal: usize,
    pub reconciliation_needed: usize,
    pub poster_calls: usize,
    pub metrics: MetricsSnapshot,
}

/// Runs every fixture decision through `coordinator`, one at a time.
pub async fn replay_fixture(
    coordinator: &ExecutionCoordinator<FixtureSessionFactory>,
    poster: &FixturePoster,
    fixture: &PublishFixture,
    job_run_id: &str,
) -> ReplaySummary {
    let mut entries = Vec::with_capacity(fixture.decisions.len());
    for item in &fixture.decisions {
        let decision_id = item.decision.id.as_str();
        poster.script(decision_id, item.outcomes.iter().cloned());
        poster.script_composer(decision_id, item.composer_outcomes.iter().cloned());
        let guard = match item.guard {
            FixtureGuard::Issue => {
                Some(coordinator.guards().issue(decision_id, "replay", job_run_id))
            }
            FixtureGuard::Omit => None,
        };
        let report = coordinator.publish(&item.decision, guard).await;
        entries.push(ReplayEntry::from_report(&report));
    }

    let count = |label: &str| entries.iter().filter(|entry| entry.outcome == label).count();
    ReplaySummary {
        job_run_id: job_run_id.to_string(),
        posted: count("posted"),
        blocked: count("blocked"),
        failed: count("failed"),
        already_terminal: count("already_terminal"),
        reconciliation_needed: count("reconciliation_needed"),
        poster_calls: poster.call_count(),
        metrics: coordinator.metrics().snapshot(),
        entries,
    }
}
