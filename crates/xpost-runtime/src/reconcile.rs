//! Ledger reconciliation.
//!
//! [`audit_ledger`] cross-checks ledger rows against permits and reports
//! disagreements. [`repair_ledger`] resolves the ones that can be settled from
//! durable state alone. Neither ever invokes a poster.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use xpost_store::{PublishStore, StoreResult};
use xpost_types::{
    AuditEvent, AuditEventType, ExternalId, LedgerQuery, LedgerRow, LedgerStatus, Permit,
    PermitStatus,
};

use crate::audit::AuditSink;

const ORPHANED_ATTEMPT_REASON: &str = "orphaned_posting_attempt";

/// A used permit whose ledger row never reached `posted`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnrecordedPost {
    pub decision_id: String,
    pub permit_id: String,
    pub external_id: ExternalId,
    /// `None` when the ledger row is missing entirely.
    pub ledger_status: Option<LedgerStatus>,
}

/// A posted ledger row not backed by a matching used permit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnbackedPost {
    pub decision_id: String,
    pub external_id: Option<ExternalId>,
    pub permit_status: Option<PermitStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconciliationReport {
    pub checked_rows: usize,
    pub checked_permits: usize,
    /// `posting_attempt` rows older than the staleness window with no used permit.
    pub stale_attempts: Vec<LedgerRow>,
    pub unrecorded_posts: Vec<UnrecordedPost>,
    pub unbacked_posts: Vec<UnbackedPost>,
}

impl ReconciliationReport {
    pub fn is_clean(&self) -> bool {
        self.stale_attempts.is_empty()
            && self.unrecorded_posts.is_empty()
            && self.unbacked_posts.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RepairAction {
    FinalizedFromPermit {
        decision_id: String,
        external_id: ExternalId,
    },
    FailedOrphan {
        decision_id: String,
    },
    Skipped {
        decision_id: String,
        reason: String,
    },
}

/// Compares every ledger row with its permit as of `now`.
pub async fn audit_ledger(
    store: &dyn PublishStore,
    stale_after: Duration,
    now: DateTime<Utc>,
) -> StoreResult<ReconciliationReport> {
    let rows = store.query_ledger(LedgerQuery::default()).await?;
    let permits = store.list_permits().await?;
    let permits_by_decision = permits
        .iter()
        .map(|permit| (permit.decision_id.as_str(), permit))
        .collect::<HashMap<_, _>>();
    let rows_by_decision = rows
        .iter()
        .map(|row| (row.decision_id.as_str(), row))
        .collect::<HashMap<_, _>>();
    let cutoff = chrono::Duration::from_std(stale_after)
        .ok()
        .and_then(|window| now.checked_sub_signed(window));

    let mut report = ReconciliationReport {
        checked_rows: rows.len(),
        checked_permits: permits.len(),
        ..ReconciliationReport::default()
    };

    for permit in &permits {
        let (PermitStatus::Used, Some(external_id)) = (permit.status, &permit.external_id) else {
            continue;
        };
        let ledger_status = rows_by_decision
            .get(permit.decision_id.as_str())
            .map(|row| row.status);
        if ledger_status != Some(LedgerStatus::Posted) {
            report.unrecorded_posts.push(UnrecordedPost {
                decision_id: permit.decision_id.clone(),
                permit_id: permit.permit_id.clone(),
                external_id: external_id.clone(),
                ledger_status,
            });
        }
    }

    for row in &rows {
        let permit = permits_by_decision.get(row.decision_id.as_str()).copied();
        match row.status {
            LedgerStatus::Posted => {
                if !is_backed_by(row, permit) {
                    report.unbacked_posts.push(UnbackedPost {
                        decision_id: row.decision_id.clone(),
                        external_id: row.external_id.clone(),
                        permit_status: permit.map(|permit| permit.status),
                    });
                }
            }
            LedgerStatus::PostingAttempt => {
                let used = permit.is_some_and(|permit| permit.status == PermitStatus::Used);
                let stale = cutoff.is_some_and(|cutoff| row.updated_at < cutoff);
                if stale && !used {
                    report.stale_attempts.push(row.clone());
                }
            }
            LedgerStatus::Failed | LedgerStatus::Blocked => {}
        }
    }

    report
        .stale_attempts
        .sort_by(|left, right| left.decision_id.cmp(&right.decision_id));
    report
        .unrecorded_posts
        .sort_by(|left, right| left.decision_id.cmp(&right.decision_id));
    report
        .unbacked_posts
        .sort_by(|left, right| left.decision_id.cmp(&right.decision_id));

    tracing::info!(
        target: "xpost::reconciliation",
        checked_rows = report.checked_rows,
        checked_permits = report.checked_permits,
        stale = report.stale_attempts.len(),
        unrecorded = report.unrecorded_posts.len(),
        unbacked = report.unbacked_posts.len(),
        "ledger audit finished"
    );
    Ok(report)
}

fn is_backed_by(row: &LedgerRow, permit: Option<&Permit>) -> bool {
    permit.is_some_and(|permit| {
        permit.status == PermitStatus::Used && permit.external_id == row.external_id
    })
}

/// Settles unrecorded posts from their permits and fails stale orphans.
///
/// Unbacked posts are reported only; rows are re-read before each change so a
/// run that finished after the audit is left alone.
pub async fn repair_ledger(
    store: &dyn PublishStore,
    report: &ReconciliationReport,
    audit: &dyn AuditSink,
) -> StoreResult<Vec<RepairAction>> {
    let mut actions = Vec::new();

    for unrecorded in &report.unrecorded_posts {
        let decision_id = unrecorded.decision_id.as_str();
        let row = match store.get_ledger_row(decision_id).await? {
            Some(row) => row,
            None => store.upsert_posting_attempt(decision_id).await?,
        };
        if row.status != LedgerStatus::PostingAttempt {
            let reason = format!("ledger_terminal:{}", row.status.as_str());
            tracing::error!(
                target: "xpost::reconciliation",
                decision_id,
                external_id = unrecorded.external_id.as_str(),
                status = row.status.as_str(),
                "used permit conflicts with terminal ledger row; manual review required"
            );
            actions.push(RepairAction::Skipped {
                decision_id: decision_id.to_string(),
                reason,
            });
            continue;
        }

        store
            .mark_ledger_posted(decision_id, &unrecorded.external_id, &unrecorded.permit_id)
            .await?;
        record(
            store,
            audit,
            AuditEvent::new(AuditEventType::PostSuccess, decision_id)
                .with_external_id(unrecorded.external_id.clone())
                .with_detail(json!({
                    "permit_id": unrecorded.permit_id,
                    "repaired": true,
                })),
        )
        .await?;
        tracing::info!(
            target: "xpost::reconciliation",
            decision_id,
            external_id = unrecorded.external_id.as_str(),
            "finalized ledger row from used permit"
        );
        actions.push(RepairAction::FinalizedFromPermit {
            decision_id: decision_id.to_string(),
            external_id: unrecorded.external_id.clone(),
        });
    }

    for stale in &report.stale_attempts {
        let decision_id = stale.decision_id.as_str();
        let still_attempting = store
            .get_ledger_row(decision_id)
            .await?
            .is_some_and(|row| row.status == LedgerStatus::PostingAttempt);
        let permit = store.get_permit_for_decision(decision_id).await?;
        if !still_attempting || permit.as_ref().is_some_and(|p| p.status == PermitStatus::Used) {
            actions.push(RepairAction::Skipped {
                decision_id: decision_id.to_string(),
                reason: "state_changed".to_string(),
            });
            continue;
        }

        if let Some(permit) = permit.filter(|permit| !permit.status.is_terminal()) {
            store
                .transition_permit(
                    &permit.permit_id,
                    PermitStatus::Failed,
                    None,
                    Some(ORPHANED_ATTEMPT_REASON),
                )
                .await?;
        }
        store
            .mark_ledger_failed(decision_id, ORPHANED_ATTEMPT_REASON)
            .await?;
        record(
            store,
            audit,
            AuditEvent::new(AuditEventType::PostFailed, decision_id).with_detail(json!({
                "reason": ORPHANED_ATTEMPT_REASON,
                "repaired": true,
            })),
        )
        .await?;
        tracing::warn!(
            target: "xpost::reconciliation",
            decision_id,
            "failed orphaned posting attempt"
        );
        actions.push(RepairAction::FailedOrphan {
            decision_id: decision_id.to_string(),
        });
    }

    for unbacked in &report.unbacked_posts {
        tracing::error!(
            target: "xpost::reconciliation",
            decision_id = unbacked.decision_id.as_str(),
            permit_status = unbacked.permit_status.map(PermitStatus::as_str),
            "posted ledger row has no matching used permit; left for manual review"
        );
    }

    Ok(actions)
}

async fn record(
    store: &dyn PublishStore,
    audit: &dyn AuditSink,
    event: AuditEvent,
) -> StoreResult<()> {
    if store.record_audit_event(event.clone()).await? {
        audit.emit(&event);
    }
    Ok(())
}
