use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use chrono::Utc;
use tempfile::TempDir;
use xpost_access::{GuardIssuer, GuardIssuerConfig, KillSwitches};
use xpost_core::{AuditLogRotationPolicy, PublishMetrics};
use xpost_pool::{PoolConfig, ResourcePool};
use xpost_runtime::{
    audit_ledger, repair_ledger, CoordinatorSettings, ExecutionCoordinator, FixturePoster,
    FixtureSessionFactory, InMemoryAuditSink, JsonlAuditSink, PostOutcome, PublishOutcome,
    PublishReport, RepairAction, RetryPolicy,
};
use xpost_store::{PublishStore, SqlitePublishStore};
use xpost_types::{Decision, ExternalId, LedgerStatus, Permit, PermitStatus};

struct IsolatedWorkspace {
    dir: TempDir,
    db: PathBuf,
}

impl IsolatedWorkspace {
    fn new() -> Self {
        let dir = tempfile::tempdir().expect("must create isolated workspace root");
        let db = dir.path().join("state").join("publish.sqlite");
        Self { dir, db }
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }

    fn open_store(&self) -> Arc<SqlitePublishStore> {
        Arc::new(SqlitePublishStore::new(&self.db).expect("open sqlite store"))
    }
}

struct Rig {
    coordinator: ExecutionCoordinator<FixtureSessionFactory>,
    poster: Arc<FixturePoster>,
    metrics: Arc<PublishMetrics>,
}

fn settings() -> CoordinatorSettings {
    CoordinatorSettings {
        account_handle: "@xposter".to_string(),
        run_deadline: Duration::from_secs(5),
        update_retry_attempts: 3,
        update_retry_backoff: Duration::from_millis(1),
        thread_max_attempts: 3,
        composer_enabled: true,
    }
}

fn rig(store: Arc<SqlitePublishStore>, settings: CoordinatorSettings) -> Rig {
    let metrics = Arc::new(PublishMetrics::new());
    let poster = Arc::new(FixturePoster::new());
    let pool = ResourcePool::new(
        FixtureSessionFactory::new(),
        PoolConfig::default(),
        Arc::clone(&metrics),
    )
    .expect("pool");
    let coordinator = ExecutionCoordinator::new(
        store,
        Arc::new(GuardIssuer::new(
            GuardIssuerConfig::default(),
            Arc::clone(&metrics),
        )),
        pool,
        poster.clone(),
        Arc::clone(&metrics),
        settings,
        RetryPolicy {
            max_additional_attempts: 2,
            standard_backoff_step_ms: 1,
            rate_limit_delays_ms: vec![1, 2, 4],
            rate_limit_jitter_ratio: 0.0,
            rate_limit_floor_ms: 1,
        },
    )
    .with_composer(poster.clone());
    Rig {
        coordinator,
        poster,
        metrics,
    }
}

impl Rig {
    async fn publish(&self, decision: &Decision) -> PublishReport {
        let guard = self
            .coordinator
            .guards()
            .issue(&decision.id, "integration", "job-1");
        self.coordinator.publish(decision, Some(guard)).await
    }
}

#[tokio::test]
async fn integration_restart_against_same_database_never_reposts() {
    let workspace = IsolatedWorkspace::new();
    let first = rig(workspace.open_store(), settings());
    first
        .poster
        .script("d1", [PostOutcome::posted("1790000000000000001")]);
    let report = first.publish(&Decision::single("d1", "hello")).await;
    assert!(report.is_posted());
    drop(first);

    let restarted = rig(workspace.open_store(), settings());
    let again = restarted.publish(&Decision::single("d1", "hello")).await;
    assert!(matches!(
        again.outcome,
        PublishOutcome::AlreadyTerminal {
            status: LedgerStatus::Posted,
            ..
        }
    ));
    assert_eq!(again.external_id().map(ExternalId::as_str), Some("1790000000000000001"));
    assert_eq!(restarted.poster.call_count(), 0);

    let store = workspace.open_store();
    let permit = store
        .get_permit_for_decision("d1")
        .await
        .expect("read permit")
        .expect("permit");
    assert_eq!(permit.status, PermitStatus::Used);
    let events = store
        .list_audit_events(Some("d1"))
        .await
        .expect("read audit");
    assert_eq!(events.len(), 1);
}

#[tokio::test]
async fn integration_rate_limited_attempt_is_retried_then_recorded() {
    let workspace = IsolatedWorkspace::new();
    let rig = rig(workspace.open_store(), settings());
    rig.poster.script(
        "d2",
        [
            PostOutcome::failed("HTTP 429 Too Many Requests"),
            PostOutcome::posted("555"),
        ],
    );
    let report = rig.publish(&Decision::single("d2", "retry later")).await;
    assert!(report.is_posted());
    assert_eq!(rig.poster.calls_for("d2"), 2);
    let snapshot = rig.metrics.snapshot();
    assert_eq!(snapshot.retries_scheduled, 1);
    assert_eq!(snapshot.poster_invocations, 2);
    assert_eq!(snapshot.decisions_posted, 1);
}

#[tokio::test]
async fn integration_reply_chain_thread_persists_root_id() {
    let workspace = IsolatedWorkspace::new();
    let store = workspace.open_store();
    let rig = rig(
        store.clone(),
        CoordinatorSettings {
            composer_enabled: false,
            ..settings()
        },
    );
    let report = rig
        .publish(&Decision::thread("t1", ["one", "two", "three"]))
        .await;
    assert!(report.is_posted());
    let thread = report.thread.as_ref().expect("thread publication");
    assert_eq!(thread.external_ids.len(), 3);
    assert!(!thread.chain_broken);

    let calls = rig.poster.calls();
    assert_eq!(calls.len(), 3);
    assert!(calls[0].reply_to.is_none());
    assert_eq!(calls[1].reply_to.as_ref(), Some(&thread.external_ids[0]));
    assert_eq!(calls[2].reply_to.as_ref(), Some(&thread.external_ids[1]));

    let row = store
        .get_ledger_row("t1")
        .await
        .expect("read")
        .expect("row");
    assert_eq!(row.external_id.as_ref(), Some(&thread.external_ids[0]));
}

#[tokio::test]
async fn integration_runtime_kill_switch_blocks_replies_only() {
    let workspace = IsolatedWorkspace::new();
    let store = workspace.open_store();
    let rig = rig(store.clone(), settings());
    rig.coordinator.guards().set_kill_switches(KillSwitches {
        disable_reply_posting: true,
        ..KillSwitches::default()
    });

    let reply = rig
        .publish(&Decision::reply("r1", "nice thread", "42", "@someone"))
        .await;
    assert_eq!(
        reply.outcome,
        PublishOutcome::Blocked {
            reason: "kill_switch:disable_reply_posting".to_string()
        }
    );
    let single = rig.publish(&Decision::single("s1", "still allowed")).await;
    assert!(single.is_posted());
    assert_eq!(rig.poster.calls_for("r1"), 0);

    let row = store
        .get_ledger_row("r1")
        .await
        .expect("read")
        .expect("row");
    assert_eq!(row.status, LedgerStatus::Blocked);
}

#[tokio::test]
async fn integration_crash_after_publish_is_settled_by_reconciliation() {
    let workspace = IsolatedWorkspace::new();
    let store = workspace.open_store();
    store
        .upsert_posting_attempt("d3")
        .await
        .expect("prewrite");
    let permit = store
        .create_permit(Permit::new("d3", HashMap::new()))
        .await
        .expect("permit");
    store
        .link_permit("d3", &permit.permit_id)
        .await
        .expect("link");
    store
        .transition_permit(&permit.permit_id, PermitStatus::Approved, None, None)
        .await
        .expect("approve");
    let external_id = ExternalId::parse("8080").expect("id");
    store
        .transition_permit(&permit.permit_id, PermitStatus::Used, Some(&external_id), None)
        .await
        .expect("use");

    let report = audit_ledger(store.as_ref(), Duration::from_secs(60), Utc::now())
        .await
        .expect("audit");
    assert_eq!(report.unrecorded_posts.len(), 1);
    let sink = InMemoryAuditSink::new();
    let actions = repair_ledger(store.as_ref(), &report, &sink)
        .await
        .expect("repair");
    assert_eq!(
        actions,
        vec![RepairAction::FinalizedFromPermit {
            decision_id: "d3".to_string(),
            external_id: external_id.clone(),
        }]
    );

    let rig = rig(workspace.open_store(), settings());
    let rerun = rig.publish(&Decision::single("d3", "already out")).await;
    assert!(matches!(
        rerun.outcome,
        PublishOutcome::AlreadyTerminal {
            status: LedgerStatus::Posted,
            ..
        }
    ));
    assert_eq!(rig.poster.call_count(), 0);
}

#[tokio::test]
async fn integration_jsonl_audit_log_records_each_terminal_outcome() {
    let workspace = IsolatedWorkspace::new();
    let audit_path = workspace.root().join("audit").join("publish.jsonl");
    let (sink, writer) = JsonlAuditSink::spawn(&audit_path, AuditLogRotationPolicy::default());
    let Rig {
        coordinator,
        poster,
        ..
    } = rig(workspace.open_store(), settings());
    let coordinator = coordinator.with_audit_sink(Arc::new(sink));
    poster.script("a1", [PostOutcome::posted("101")]);

    for decision in [
        Decision::single("a1", "posted"),
        Decision::reply("a2", "talking to myself", "7", "@XPOSTER"),
    ] {
        let guard = coordinator.guards().issue(&decision.id, "integration", "job-2");
        coordinator.publish(&decision, Some(guard)).await;
    }
    drop(coordinator);

    assert_eq!(writer.finish().await.expect("writer"), 2);
    let lines = std::fs::read_to_string(&audit_path).expect("audit log");
    let events = lines
        .lines()
        .map(|line| serde_json::from_str::<serde_json::Value>(line).expect("json line"))
        .collect::<Vec<_>>();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0]["event_type"], "POST_SUCCESS");
    assert_eq!(events[0]["decision_id"], "a1");
    assert_eq!(events[1]["event_type"], "POST_BLOCKED");
    assert_eq!(events[1]["detail"]["reason"], "self_reply");
}
