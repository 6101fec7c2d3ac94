use super::{
    CoordinatorSettings, CoordinatorStage, ExecutionCoordinator, PublishError, PublishOutcome,
};
use crate::audit::InMemoryAuditSink;
use crate::fixture::{FixturePoster, FixtureSession, FixtureSessionFactory};
use crate::poster::{ComposerOutcome, PostOutcome, PostRequest, Poster};
use crate::retry::{PostError, RetryPolicy};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use xpost_access::{GuardIssuer, GuardIssuerConfig, KillSwitches};
use xpost_core::{ClockFn, PublishMetrics};
use xpost_pool::{PoolConfig, ResourcePool};
use xpost_store::{
    InMemoryPublishStore, PublishStore, StoreError, StoreResult,
};
use xpost_types::{
    AuditEvent, AuditEventType, Decision, ExternalId, LedgerQuery, LedgerRow, LedgerStatus,
    Permit, PermitStatus,
};

/// Store wrapper that fails selected operations a fixed number of times.
#[derive(Default)]
struct FaultyStore {
    inner: InMemoryPublishStore,
    fail_upserts: AtomicUsize,
    fail_mark_posted: AtomicUsize,
    fail_create_permit: AtomicUsize,
}

fn take_fault(counter: &AtomicUsize, operation: &str) -> StoreResult<()> {
    if counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
            remaining.checked_sub(1)
        })
        .is_ok()
    {
        return Err(StoreError::Injected(operation.to_string()));
    }
    Ok(())
}

#[async_trait]
impl PublishStore for FaultyStore {
    async fn upsert_posting_attempt(&self, decision_id: &str) -> StoreResult<LedgerRow> {
        take_fault(&self.fail_upserts, "upsert_posting_attempt")?;
        self.inner.upsert_posting_attempt(decision_id).await
    }

    async fn get_ledger_row(&self, decision_id: &str) -> StoreResult<Option<LedgerRow>> {
        self.inner.get_ledger_row(decision_id).await
    }

    async fn link_permit(&self, decision_id: &str, permit_id: &str) -> StoreResult<()> {
        self.inner.link_permit(decision_id, permit_id).await
    }

    async fn mark_ledger_posted(
        &self,
        decision_id: &str,
        external_id: &ExternalId,
        permit_id: &str,
    ) -> StoreResult<LedgerRow> {
        take_fault(&self.fail_mark_posted, "mark_ledger_posted")?;
        self.inner
            .mark_ledger_posted(decision_id, external_id, permit_id)
            .await
    }

    async fn mark_ledger_failed(&self, decision_id: &str, reason: &str) -> StoreResult<LedgerRow> {
        self.inner.mark_ledger_failed(decision_id, reason).await
    }

    async fn mark_ledger_blocked(
        &self,
        decision_id: &str,
        reason: &str,
    ) -> StoreResult<LedgerRow> {
        self.inner.mark_ledger_blocked(decision_id, reason).await
    }

    async fn query_ledger(&self, query: LedgerQuery) -> StoreResult<Vec<LedgerRow>> {
        self.inner.query_ledger(query).await
    }

    async fn create_permit(&self, permit: Permit) -> StoreResult<Permit> {
        take_fault(&self.fail_create_permit, "create_permit")?;
        self.inner.create_permit(permit).await
    }

    async fn get_permit(&self, permit_id: &str) -> StoreResult<Option<Permit>> {
        self.inner.get_permit(permit_id).await
    }

    async fn get_permit_for_decision(&self, decision_id: &str) -> StoreResult<Option<Permit>> {
        self.inner.get_permit_for_decision(decision_id).await
    }

    async fn transition_permit(
        &self,
        permit_id: &str,
        next: PermitStatus,
        external_id: Option<&ExternalId>,
        reason: Option<&str>,
    ) -> StoreResult<Permit> {
        self.inner
            .transition_permit(permit_id, next, external_id, reason)
            .await
    }

    async fn list_permits(&self) -> StoreResult<Vec<Permit>> {
        self.inner.list_permits().await
    }

    async fn record_audit_event(&self, event: AuditEvent) -> StoreResult<bool> {
        self.inner.record_audit_event(event).await
    }

    async fn list_audit_events(&self, decision_id: Option<&str>) -> StoreResult<Vec<AuditEvent>> {
        self.inner.list_audit_events(decision_id).await
    }
}

/// Poster that answers only after `delay`.
struct SlowPoster {
    calls: AtomicUsize,
    delay: Duration,
}

impl SlowPoster {
    fn new(delay: Duration) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            delay,
        }
    }
}

#[async_trait]
impl Poster for SlowPoster {
    type Session = FixtureSession;

    async fn submit(&self, _session: &mut FixtureSession, _request: &PostRequest) -> PostOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        PostOutcome::posted("321")
    }
}

struct Harness {
    coordinator: ExecutionCoordinator<FixtureSessionFactory>,
    store: Arc<FaultyStore>,
    poster: Arc<FixturePoster>,
    metrics: Arc<PublishMetrics>,
    audit: Arc<InMemoryAuditSink>,
    clock: Arc<AtomicU64>,
}

fn settings() -> CoordinatorSettings {
    CoordinatorSettings {
        account_handle: "@XPoster".to_string(),
        run_deadline: Duration::from_secs(2),
        update_retry_attempts: 3,
        update_retry_backoff: Duration::from_millis(1),
        thread_max_attempts: 3,
        composer_enabled: true,
    }
}

fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        max_additional_attempts: 2,
        standard_backoff_step_ms: 1,
        rate_limit_delays_ms: vec![1, 2, 3],
        rate_limit_jitter_ratio: 0.0,
        rate_limit_floor_ms: 1,
    }
}

fn coordinator_with_poster(
    store: Arc<InMemoryPublishStore>,
    poster: Arc<SlowPoster>,
    settings: CoordinatorSettings,
) -> ExecutionCoordinator<FixtureSessionFactory> {
    let metrics = Arc::new(PublishMetrics::new());
    let pool = ResourcePool::new(
        FixtureSessionFactory::new(),
        PoolConfig::default(),
        Arc::clone(&metrics),
    )
    .expect("pool");
    ExecutionCoordinator::new(
        store,
        Arc::new(GuardIssuer::new(
            GuardIssuerConfig::default(),
            Arc::clone(&metrics),
        )),
        pool,
        poster,
        metrics,
        settings,
        fast_policy(),
    )
}

fn harness_with(guard_config: GuardIssuerConfig, settings: CoordinatorSettings) -> Harness {
    let metrics = Arc::new(PublishMetrics::new());
    let store = Arc::new(FaultyStore::default());
    let poster = Arc::new(FixturePoster::new());
    let audit = Arc::new(InMemoryAuditSink::new());
    let clock = Arc::new(AtomicU64::new(1_000_000));
    let clock_handle = Arc::clone(&clock);
    let clock_fn: ClockFn = Arc::new(move || clock_handle.load(Ordering::SeqCst));
    let pool = ResourcePool::new(
        FixtureSessionFactory::new(),
        PoolConfig::default(),
        Arc::clone(&metrics),
    )
    .expect("pool");
    let coordinator = ExecutionCoordinator::new(
        store.clone(),
        Arc::new(GuardIssuer::with_clock(
            guard_config,
            Arc::clone(&metrics),
            clock_fn,
        )),
        pool,
        poster.clone(),
        Arc::clone(&metrics),
        settings,
        fast_policy(),
    )
    .with_audit_sink(audit.clone())
    .with_composer(poster.clone());
    Harness {
        coordinator,
        store,
        poster,
        metrics,
        audit,
        clock,
    }
}

fn harness() -> Harness {
    harness_with(GuardIssuerConfig::default(), settings())
}

impl Harness {
    async fn publish(&self, decision: &Decision) -> super::PublishReport {
        let guard = self
            .coordinator
            .guards()
            .issue(&decision.id, "scheduler", "run-1");
        self.coordinator.publish(decision, Some(guard)).await
    }

    async fn ledger(&self, decision_id: &str) -> LedgerRow {
        self.store
            .get_ledger_row(decision_id)
            .await
            .expect("ledger read")
            .expect("ledger row")
    }

    async fn permit(&self, decision_id: &str) -> Permit {
        self.store
            .get_permit_for_decision(decision_id)
            .await
            .expect("permit read")
            .expect("permit")
    }

    async fn audit_count(&self, decision_id: &str, event_type: AuditEventType) -> usize {
        self.store
            .list_audit_events(Some(decision_id))
            .await
            .expect("audit read")
            .into_iter()
            .filter(|event| event.event_type == event_type)
            .count()
    }
}

#[tokio::test]
async fn integration_d1_posts_once_despite_two_transient_update_failures() {
    let harness = harness();
    harness.store.fail_mark_posted.store(2, Ordering::SeqCst);
    harness
        .poster
        .script("d1", [PostOutcome::posted("12345678901234567")]);

    let report = harness.publish(&Decision::single("d1", "hello world")).await;
    assert_eq!(report.stage, CoordinatorStage::Completed);
    assert_eq!(
        report.external_id().map(ExternalId::as_str),
        Some("12345678901234567")
    );

    let row = harness.ledger("d1").await;
    assert_eq!(row.status, LedgerStatus::Posted);
    assert_eq!(
        row.external_id.as_ref().map(ExternalId::as_str),
        Some("12345678901234567")
    );
    let permit = harness.permit("d1").await;
    assert_eq!(permit.status, PermitStatus::Used);
    assert_eq!(row.permit_id.as_deref(), Some(permit.permit_id.as_str()));
    assert_eq!(harness.audit_count("d1", AuditEventType::PostSuccess).await, 1);
    assert_eq!(harness.audit.events().len(), 1);
    assert_eq!(harness.poster.calls_for("d1"), 1);

    let again = harness.publish(&Decision::single("d1", "hello world")).await;
    assert!(matches!(
        again.outcome,
        PublishOutcome::AlreadyTerminal {
            status: LedgerStatus::Posted,
            ..
        }
    ));
    assert_eq!(harness.poster.calls_for("d1"), 1);
    assert_eq!(harness.audit_count("d1", AuditEventType::PostSuccess).await, 1);
}

#[tokio::test]
async fn functional_timeouts_then_success_invoke_poster_three_times() {
    let harness = harness();
    harness.poster.script(
        "d2",
        [
            PostOutcome::failed("Timeout"),
            PostOutcome::failed("Timeout"),
            PostOutcome::posted("999"),
        ],
    );
    let report = harness.publish(&Decision::single("d2", "retry me")).await;
    assert!(report.is_posted());
    assert_eq!(report.attempts, 3);
    assert_eq!(harness.poster.calls_for("d2"), 3);
    assert_eq!(harness.metrics.snapshot().poster_invocations, 3);
    assert_eq!(
        harness.ledger("d2").await.external_id.map(|id| id.to_string()),
        Some("999".to_string())
    );
}

#[tokio::test]
async fn regression_prewrite_failure_never_invokes_poster() {
    let harness = harness();
    harness.store.fail_upserts.store(1, Ordering::SeqCst);
    let report = harness.publish(&Decision::single("d3", "content")).await;
    assert_eq!(report.stage, CoordinatorStage::Aborted);
    assert_eq!(report.aborted_at, Some(CoordinatorStage::Prewriting));
    assert!(matches!(report.error, Some(PublishError::PrewriteFailure(_))));
    assert_eq!(harness.poster.call_count(), 0);
    assert_eq!(harness.metrics.snapshot().prewrite_failures, 1);
    assert!(harness
        .store
        .get_permit_for_decision("d3")
        .await
        .expect("permit read")
        .is_none());
}

#[tokio::test]
async fn regression_permit_failure_after_prewrite_settles_ledger_row() {
    let harness = harness();
    harness.store.fail_create_permit.store(1, Ordering::SeqCst);
    let report = harness.publish(&Decision::single("p1", "content")).await;
    assert_eq!(report.aborted_at, Some(CoordinatorStage::Prewriting));
    assert_eq!(
        report.outcome,
        PublishOutcome::Failed {
            reason: "prewrite_failure".to_string()
        }
    );
    assert_eq!(harness.poster.call_count(), 0);

    let row = harness.ledger("p1").await;
    assert_eq!(row.status, LedgerStatus::Failed);
    assert_eq!(row.skip_reason.as_deref(), Some("prewrite_failure"));

    let rerun = harness.publish(&Decision::single("p1", "content")).await;
    assert!(matches!(
        rerun.outcome,
        PublishOutcome::AlreadyTerminal {
            status: LedgerStatus::Failed,
            ..
        }
    ));
    assert_eq!(harness.poster.call_count(), 0);
}

#[tokio::test]
async fn functional_self_reply_is_blocked_without_posting() {
    let harness = harness();
    let decision = Decision::reply("d4", "thanks!", "555", "@xposter");
    let report = harness.publish(&decision).await;
    assert_eq!(
        report.outcome,
        PublishOutcome::Blocked {
            reason: "self_reply".to_string()
        }
    );
    let row = harness.ledger("d4").await;
    assert_eq!(row.status, LedgerStatus::Blocked);
    assert_eq!(row.skip_reason.as_deref(), Some("self_reply"));
    assert_eq!(harness.permit("d4").await.status, PermitStatus::Failed);
    assert_eq!(harness.poster.call_count(), 0);
    assert_eq!(harness.metrics.snapshot().gate_blocks, 1);
    assert_eq!(harness.audit_count("d4", AuditEventType::PostBlocked).await, 1);
}

#[tokio::test]
async fn regression_default_settings_block_replies_without_account_handle() {
    let store = Arc::new(InMemoryPublishStore::new());
    let poster = Arc::new(SlowPoster::new(Duration::ZERO));
    let coordinator =
        coordinator_with_poster(store.clone(), poster.clone(), CoordinatorSettings::default());
    assert!(coordinator.settings().account_handle.is_empty());

    let guard = coordinator.guards().issue("p2", "scheduler", "run-1");
    let report = coordinator
        .publish(&Decision::reply("p2", "agreed", "555", "@xposter"), Some(guard))
        .await;
    assert_eq!(
        report.outcome,
        PublishOutcome::Blocked {
            reason: "missing_account_handle".to_string()
        }
    );
    assert_eq!(poster.calls.load(Ordering::SeqCst), 0);
    let row = store
        .get_ledger_row("p2")
        .await
        .expect("ledger read")
        .expect("row");
    assert_eq!(row.status, LedgerStatus::Blocked);
}

#[tokio::test]
async fn functional_kill_switch_blocks_with_switch_reason() {
    let harness = harness_with(
        GuardIssuerConfig {
            kill_switches: KillSwitches {
                disable_all_posting: true,
                ..KillSwitches::default()
            },
            ..GuardIssuerConfig::default()
        },
        settings(),
    );
    let report = harness.publish(&Decision::single("d5", "content")).await;
    assert_eq!(
        report.outcome,
        PublishOutcome::Blocked {
            reason: "kill_switch:disable_all_posting".to_string()
        }
    );
    assert_eq!(harness.ledger("d5").await.status, LedgerStatus::Blocked);
    assert_eq!(harness.poster.call_count(), 0);
}

#[tokio::test]
async fn regression_expired_guard_fails_closed() {
    let harness = harness();
    let guard = harness
        .coordinator
        .guards()
        .issue("d6", "scheduler", "run-1");
    harness.clock.fetch_add(60_001, Ordering::SeqCst);
    let report = harness
        .coordinator
        .publish(&Decision::single("d6", "content"), Some(guard))
        .await;
    assert_eq!(report.reason_code().as_deref(), Some("guard_expired"));
    let row = harness.ledger("d6").await;
    assert_eq!(row.status, LedgerStatus::Failed);
    assert_eq!(row.skip_reason.as_deref(), Some("guard_expired"));
    assert_eq!(harness.poster.call_count(), 0);
}

#[tokio::test]
async fn unit_missing_guard_is_rejected_before_posting() {
    let harness = harness();
    let report = harness
        .coordinator
        .publish(&Decision::single("d7", "content"), None)
        .await;
    assert_eq!(
        report.outcome,
        PublishOutcome::Failed {
            reason: "guard_missing".to_string()
        }
    );
    assert_eq!(harness.poster.call_count(), 0);
    assert_eq!(harness.metrics.guard_rejections(), 1);
}

#[tokio::test]
async fn regression_success_without_id_is_fatal_and_never_posted() {
    let harness = harness();
    harness.poster.script(
        "d8",
        [PostOutcome {
            success: true,
            external_id: None,
            error: None,
        }],
    );
    let report = harness.publish(&Decision::single("d8", "content")).await;
    assert!(matches!(
        report.error,
        Some(PublishError::Post(PostError::MissingExternalId))
    ));
    assert_eq!(harness.poster.calls_for("d8"), 1);
    let row = harness.ledger("d8").await;
    assert_eq!(row.status, LedgerStatus::Failed);
    assert!(row.external_id.is_none());
    assert_eq!(harness.permit("d8").await.status, PermitStatus::Failed);
}

#[tokio::test]
async fn functional_deadline_marks_permit_and_ledger_failed() {
    let store = Arc::new(InMemoryPublishStore::new());
    let poster = Arc::new(SlowPoster::new(Duration::from_secs(5)));
    let coordinator = coordinator_with_poster(
        store.clone(),
        poster.clone(),
        CoordinatorSettings {
            run_deadline: Duration::from_millis(30),
            ..settings()
        },
    );

    let guard = coordinator.guards().issue("d9", "scheduler", "run-1");
    let report = coordinator
        .publish(&Decision::single("d9", "slow"), Some(guard))
        .await;
    assert!(matches!(
        report.error,
        Some(PublishError::DeadlineExceeded { deadline_ms: 30 })
    ));
    assert_eq!(report.aborted_at, Some(CoordinatorStage::Posting));
    assert_eq!(poster.calls.load(Ordering::SeqCst), 1);

    let row = store
        .get_ledger_row("d9")
        .await
        .expect("ledger read")
        .expect("row");
    assert_eq!(row.status, LedgerStatus::Failed);
    assert_eq!(row.skip_reason.as_deref(), Some("deadline_exceeded"));
    let permit = store
        .get_permit_for_decision("d9")
        .await
        .expect("permit read")
        .expect("permit");
    assert_eq!(permit.status, PermitStatus::Failed);
    assert_eq!(coordinator.pool().stats().leased, 0);
}

#[tokio::test]
async fn regression_deadline_during_session_start_releases_pool_slot() {
    let store = Arc::new(InMemoryPublishStore::new());
    let poster = Arc::new(SlowPoster::new(Duration::ZERO));
    let coordinator = coordinator_with_poster(
        store.clone(),
        poster.clone(),
        CoordinatorSettings {
            run_deadline: Duration::from_millis(30),
            ..settings()
        },
    );
    coordinator
        .pool()
        .factory()
        .set_create_delay(Duration::from_millis(500));

    let guard = coordinator.guards().issue("s1", "scheduler", "run-1");
    let report = coordinator
        .publish(&Decision::single("s1", "stuck starting"), Some(guard))
        .await;
    assert!(matches!(
        report.error,
        Some(PublishError::DeadlineExceeded { deadline_ms: 30 })
    ));
    assert_eq!(poster.calls.load(Ordering::SeqCst), 0);
    let stats = coordinator.pool().stats();
    assert_eq!(stats.leased, 0);
    assert_eq!(stats.idle, 1);

    coordinator.pool().factory().set_create_delay(Duration::ZERO);
    let guard = coordinator.guards().issue("s2", "scheduler", "run-1");
    let report = coordinator
        .publish(&Decision::single("s2", "next in line"), Some(guard))
        .await;
    assert!(report.is_posted());
    assert_eq!(poster.calls.load(Ordering::SeqCst), 1);
    assert_eq!(coordinator.pool().factory().sessions_created(), 1);
}

#[tokio::test]
async fn regression_concurrent_run_for_same_decision_is_refused() {
    let store = Arc::new(InMemoryPublishStore::new());
    let poster = Arc::new(SlowPoster::new(Duration::from_millis(20)));
    let coordinator = coordinator_with_poster(store.clone(), poster.clone(), settings());
    let decision = Decision::single("d13", "once");
    let first_guard = coordinator.guards().issue("d13", "scheduler", "run-1");
    let second_guard = coordinator.guards().issue("d13", "scheduler", "run-2");

    let (first, second) = tokio::join!(
        coordinator.publish(&decision, Some(first_guard)),
        coordinator.publish(&decision, Some(second_guard)),
    );
    assert!(first.is_posted());
    assert_eq!(second.reason_code().as_deref(), Some("run_in_progress"));
    assert_eq!(poster.calls.load(Ordering::SeqCst), 1);
    let row = store
        .get_ledger_row("d13")
        .await
        .expect("ledger read")
        .expect("row");
    assert_eq!(row.status, LedgerStatus::Posted);

    let third_guard = coordinator.guards().issue("d13", "scheduler", "run-3");
    let third = coordinator.publish(&decision, Some(third_guard)).await;
    assert!(matches!(third.outcome, PublishOutcome::AlreadyTerminal { .. }));
}

#[tokio::test]
async fn regression_used_permit_is_finalized_without_posting() {
    let harness = harness();
    let store: &dyn PublishStore = harness.store.as_ref();
    store
        .upsert_posting_attempt("d10")
        .await
        .expect("prewrite");
    let permit = store
        .create_permit(Permit::new("d10", HashMap::new()))
        .await
        .expect("permit");
    store
        .transition_permit(&permit.permit_id, PermitStatus::Approved, None, None)
        .await
        .expect("approve");
    let external_id = ExternalId::parse("777").expect("id");
    store
        .transition_permit(&permit.permit_id, PermitStatus::Used, Some(&external_id), None)
        .await
        .expect("use");

    let report = harness.publish(&Decision::single("d10", "content")).await;
    assert_eq!(
        report.outcome,
        PublishOutcome::Posted {
            external_id: external_id.clone()
        }
    );
    assert_eq!(harness.poster.call_count(), 0);
    assert_eq!(harness.ledger("d10").await.external_id, Some(external_id));
}

#[tokio::test]
async fn functional_update_exhaustion_needs_reconciliation_and_never_reposts() {
    let harness = harness();
    harness.store.fail_mark_posted.store(10, Ordering::SeqCst);
    harness.poster.script("d11", [PostOutcome::posted("4242")]);

    let report = harness.publish(&Decision::single("d11", "content")).await;
    assert!(matches!(
        report.outcome,
        PublishOutcome::ReconciliationNeeded { .. }
    ));
    assert_eq!(report.aborted_at, Some(CoordinatorStage::Updating));
    assert_eq!(harness.metrics.snapshot().reconciliation_needed, 1);
    assert_eq!(
        harness.ledger("d11").await.status,
        LedgerStatus::PostingAttempt
    );
    assert_eq!(harness.permit("d11").await.status, PermitStatus::Used);
    assert_eq!(
        harness
            .audit_count("d11", AuditEventType::ReconciliationNeeded)
            .await,
        1
    );

    harness.store.fail_mark_posted.store(0, Ordering::SeqCst);
    let rerun = harness.publish(&Decision::single("d11", "content")).await;
    assert!(rerun.is_posted());
    assert_eq!(harness.poster.calls_for("d11"), 1);
    assert_eq!(harness.ledger("d11").await.status, LedgerStatus::Posted);
}

#[tokio::test]
async fn functional_thread_records_root_id_after_composer_fallback() {
    let harness = harness();
    harness.poster.script_composer(
        "t1",
        [ComposerOutcome::Abandoned {
            staged_segments: 2,
            error: "composer lost focus".to_string(),
        }],
    );
    harness.poster.script(
        "t1",
        [
            PostOutcome::posted("500"),
            PostOutcome::posted("501"),
            PostOutcome::posted("502"),
        ],
    );
    let report = harness
        .publish(&Decision::thread("t1", ["first", "second", "third"]))
        .await;
    assert!(report.is_posted());
    let thread = report.thread.as_ref().expect("thread publication");
    assert_eq!(thread.external_ids.len(), 3);
    assert_eq!(
        harness.ledger("t1").await.external_id.map(|id| id.to_string()),
        Some("500".to_string())
    );
    assert_eq!(harness.poster.compose_calls_for("t1"), 1);
    assert_eq!(harness.poster.calls_for("t1"), 3);
}

#[tokio::test]
async fn unit_unauthorized_failure_is_not_retried() {
    let harness = harness();
    harness
        .poster
        .script("d12", [PostOutcome::failed("403 Forbidden: account suspended")]);
    let report = harness.publish(&Decision::single("d12", "content")).await;
    assert_eq!(report.reason_code().as_deref(), Some("unauthorized"));
    assert_eq!(harness.poster.calls_for("d12"), 1);
    assert_eq!(harness.metrics.snapshot().decisions_failed, 1);
}
