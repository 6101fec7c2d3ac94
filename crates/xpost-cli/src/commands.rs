use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde::Serialize;
use xpost_access::GuardIssuer;
use xpost_core::{write_text_atomic, AuditLogRotationPolicy, PublishMetrics};
use xpost_pool::ResourcePool;
use xpost_runtime::{
    audit_ledger, repair_ledger, replay_fixture, AuditSink, AuditWriterHandle,
    ExecutionCoordinator, FixturePoster, FixtureSessionFactory, JsonlAuditSink, NoopAuditSink,
    PublishConfig, PublishFixture, ReconciliationReport, RepairAction, ReplaySummary,
};
use xpost_store::SqlitePublishStore;

use crate::cli_args::Cli;

/// Everything one invocation did, printed to stdout as JSON.
#[derive(Debug, Default, Serialize)]
pub(crate) struct RunSummary {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema_missing_columns: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replay: Option<ReplaySummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconciliation: Option<ReconciliationReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repairs: Option<Vec<RepairAction>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audit_lines_written: Option<usize>,
}

pub(crate) fn load_config(path: Option<&Path>) -> Result<PublishConfig> {
    match path {
        Some(path) => PublishConfig::load(path),
        None => {
            let mut config = PublishConfig::default();
            config.apply_env_overrides()?;
            config.validate()?;
            Ok(config)
        }
    }
}

pub(crate) async fn run_cli(cli: &Cli) -> Result<RunSummary> {
    if !cli.has_work() {
        bail!("nothing to do: pass --fixture, --check-schema or --reconcile");
    }
    let config = load_config(cli.config.as_deref())?;
    let store = Arc::new(
        SqlitePublishStore::new(&cli.db)
            .with_context(|| format!("failed to open publish store {}", cli.db.display()))?,
    );
    let mut summary = RunSummary::default();

    if cli.check_schema {
        let missing = store
            .verify_ledger_schema()
            .context("failed to inspect ledger schema")?;
        if !missing.is_empty() {
            bail!(
                "ledger table in {} is missing columns: {}",
                cli.db.display(),
                missing.join(", ")
            );
        }
        summary.schema_missing_columns = Some(missing);
    }

    let (sink, writer): (Arc<dyn AuditSink>, Option<AuditWriterHandle>) = match &cli.audit_log {
        Some(path) => {
            let (sink, handle) =
                JsonlAuditSink::spawn(path.clone(), AuditLogRotationPolicy::from_env());
            (Arc::new(sink), Some(handle))
        }
        None => (Arc::new(NoopAuditSink), None),
    };

    if let Some(fixture_path) = &cli.fixture {
        let fixture = PublishFixture::load(fixture_path)?;
        let metrics = Arc::new(PublishMetrics::new());
        let poster = Arc::new(FixturePoster::new());
        let pool = ResourcePool::new(
            FixtureSessionFactory::new(),
            config.pool_config(),
            Arc::clone(&metrics),
        )
        .context("failed to start session pool")?;
        let guards = Arc::new(GuardIssuer::new(
            config.guard_issuer_config(),
            Arc::clone(&metrics),
        ));
        let coordinator = ExecutionCoordinator::new(
            store.clone(),
            guards,
            pool,
            poster.clone(),
            Arc::clone(&metrics),
            config.coordinator_settings(),
            config.retry.clone(),
        )
        .with_audit_sink(Arc::clone(&sink))
        .with_composer(poster.clone());

        let replay = replay_fixture(&coordinator, &poster, &fixture, &cli.job_run_id).await;
        coordinator.pool().shutdown();
        tracing::info!(
            job_run_id = cli.job_run_id.as_str(),
            posted = replay.posted,
            blocked = replay.blocked,
            failed = replay.failed,
            "fixture replay finished"
        );
        summary.replay = Some(replay);
    }

    if cli.reconcile {
        let report = audit_ledger(
            store.as_ref(),
            Duration::from_secs(cli.stale_after_secs),
            Utc::now(),
        )
        .await
        .context("ledger audit failed")?;
        if cli.repair {
            let actions = repair_ledger(store.as_ref(), &report, sink.as_ref())
                .await
                .context("ledger repair failed")?;
            summary.repairs = Some(actions);
        }
        summary.reconciliation = Some(report);
    }

    if let Some(writer) = writer {
        summary.audit_lines_written = Some(writer.finish().await?);
    }

    if let Some(path) = &cli.summary_json_out {
        let rendered = serde_json::to_string_pretty(&summary)?;
        write_text_atomic(path, &rendered)
            .with_context(|| format!("failed to write summary {}", path.display()))?;
    }
    Ok(summary)
}
