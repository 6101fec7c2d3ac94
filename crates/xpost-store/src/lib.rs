//! Durable state for the publish pipeline: permits, ledger rows and audit events.
//!
//! Every mutation goes through a monotonic transition. Both backends share the
//! transition helpers below so in-memory and SQLite semantics cannot drift.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use tokio::sync::RwLock;

mod sqlite;

pub use sqlite::{SqlitePublishStore, REQUIRED_LEDGER_COLUMNS};
pub use xpost_types::{
    AuditEvent, AuditEventType, ExternalId, ExternalIdError, LedgerQuery, LedgerRow, LedgerStatus,
    Permit, PermitStatus,
};

/// Result type for publish store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors returned by store implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("ledger row for decision '{0}' not found")]
    LedgerRowNotFound(String),
    #[error("permit '{0}' not found")]
    PermitNotFound(String),
    #[error("invalid ledger status transition: {from:?} -> {to:?}")]
    InvalidLedgerTransition { from: LedgerStatus, to: LedgerStatus },
    #[error("invalid permit status transition: {from:?} -> {to:?}")]
    InvalidPermitTransition { from: PermitStatus, to: PermitStatus },
    #[error("permit '{0}' cannot be marked used without an external id")]
    MissingExternalId(String),
    #[error(
        "decision '{decision_id}' already recorded external id '{existing}', refusing '{attempted}'"
    )]
    ExternalIdConflict {
        decision_id: String,
        existing: String,
        attempted: String,
    },
    #[error("injected storage fault: {0}")]
    Injected(String),
    #[error("invalid persisted value for '{field}': {value}")]
    InvalidPersistedValue { field: &'static str, value: String },
    #[error(transparent)]
    ExternalId(#[from] ExternalIdError),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Chrono(#[from] chrono::ParseError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Async store contract used by the permit registry, coordinator and reconciler.
#[async_trait]
pub trait PublishStore: Send + Sync {
    /// Inserts a `posting_attempt` row, or returns the existing row unchanged.
    async fn upsert_posting_attempt(&self, decision_id: &str) -> StoreResult<LedgerRow>;
    async fn get_ledger_row(&self, decision_id: &str) -> StoreResult<Option<LedgerRow>>;
    async fn link_permit(&self, decision_id: &str, permit_id: &str) -> StoreResult<()>;
    /// Finalizes a row; repeating with the same external id is a no-op.
    async fn mark_ledger_posted(
        &self,
        decision_id: &str,
        external_id: &ExternalId,
        permit_id: &str,
    ) -> StoreResult<LedgerRow>;
    async fn mark_ledger_failed(&self, decision_id: &str, reason: &str) -> StoreResult<LedgerRow>;
    async fn mark_ledger_blocked(&self, decision_id: &str, reason: &str)
        -> StoreResult<LedgerRow>;
    async fn query_ledger(&self, query: LedgerQuery) -> StoreResult<Vec<LedgerRow>>;

    /// Inserts `permit`, or returns the permit already held by its decision.
    async fn create_permit(&self, permit: Permit) -> StoreResult<Permit>;
    async fn get_permit(&self, permit_id: &str) -> StoreResult<Option<Permit>>;
    async fn get_permit_for_decision(&self, decision_id: &str) -> StoreResult<Option<Permit>>;
    async fn transition_permit(
        &self,
        permit_id: &str,
        next: PermitStatus,
        external_id: Option<&ExternalId>,
        reason: Option<&str>,
    ) -> StoreResult<Permit>;
    async fn list_permits(&self) -> StoreResult<Vec<Permit>>;

    /// Returns `false` when an event with the same type and decision already exists.
    async fn record_audit_event(&self, event: AuditEvent) -> StoreResult<bool>;
    async fn list_audit_events(&self, decision_id: Option<&str>) -> StoreResult<Vec<AuditEvent>>;
}

/// Applies a terminal ledger transition in place. Returns whether the row changed.
pub(crate) fn apply_ledger_transition(
    row: &mut LedgerRow,
    next: LedgerStatus,
    external_id: Option<&ExternalId>,
    permit_id: Option<&str>,
    reason: Option<&str>,
    now: DateTime<Utc>,
) -> StoreResult<bool> {
    if next == LedgerStatus::Posted {
        let Some(external_id) = external_id else {
            return Err(StoreError::MissingExternalId(row.decision_id.clone()));
        };
        if row.status == LedgerStatus::Posted {
            return match &row.external_id {
                Some(existing) if existing == external_id => Ok(false),
                existing => Err(StoreError::ExternalIdConflict {
                    decision_id: row.decision_id.clone(),
                    existing: existing
                        .as_ref()
                        .map(ToString::to_string)
                        .unwrap_or_default(),
                    attempted: external_id.to_string(),
                }),
            };
        }
    } else if row.status == next {
        return Ok(false);
    }

    if !row.status.can_transition_to(next) {
        return Err(StoreError::InvalidLedgerTransition {
            from: row.status,
            to: next,
        });
    }

    row.status = next;
    row.updated_at = now;
    if next == LedgerStatus::Posted {
        row.external_id = external_id.cloned();
        row.posted_at = Some(now);
        if let Some(permit_id) = permit_id {
            row.permit_id = Some(permit_id.to_string());
        }
    }
    if let Some(reason) = reason {
        row.skip_reason = Some(reason.to_string());
    }
    Ok(true)
}

/// Applies a permit transition in place. Returns whether the permit changed.
pub(crate) fn apply_permit_transition(
    permit: &mut Permit,
    next: PermitStatus,
    external_id: Option<&ExternalId>,
    reason: Option<&str>,
    now: DateTime<Utc>,
) -> StoreResult<bool> {
    if next == PermitStatus::Used {
        let Some(external_id) = external_id else {
            return Err(StoreError::MissingExternalId(permit.permit_id.clone()));
        };
        if permit.status == PermitStatus::Used {
            return match &permit.external_id {
                Some(existing) if existing == external_id => Ok(false),
                existing => Err(StoreError::ExternalIdConflict {
                    decision_id: permit.decision_id.clone(),
                    existing: existing
                        .as_ref()
                        .map(ToString::to_string)
                        .unwrap_or_default(),
                    attempted: external_id.to_string(),
                }),
            };
        }
    } else if permit.status == next {
        return Ok(false);
    }

    if !permit.status.can_transition_to(next) {
        return Err(StoreError::InvalidPermitTransition {
            from: permit.status,
            to: next,
        });
    }

    permit.status = next;
    permit.updated_at = now;
    if next == PermitStatus::Used {
        permit.external_id = external_id.cloned();
    }
    if let Some(reason) = reason {
        permit.reason = Some(reason.to_string());
    }
    Ok(true)
}

/// In-memory implementation for tests and local experimentation.
#[derive(Debug, Default)]
pub struct InMemoryPublishStore {
    inner: RwLock<StoreInner>,
}

#[derive(Debug, Default)]
struct StoreInner {
    ledger: HashMap<String, LedgerRow>,
    permits: HashMap<String, Permit>,
    permit_ids_by_decision: HashMap<String, String>,
    audit_events: Vec<AuditEvent>,
    audit_keys: HashSet<(AuditEventType, String)>,
}

impl InMemoryPublishStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PublishStore for InMemoryPublishStore {
    async fn upsert_posting_attempt(&self, decision_id: &str) -> StoreResult<LedgerRow> {
        let mut inner = self.inner.write().await;
        let row = inner
            .ledger
            .entry(decision_id.to_string())
            .or_insert_with(|| LedgerRow::posting_attempt(decision_id));
        Ok(row.clone())
    }

    async fn get_ledger_row(&self, decision_id: &str) -> StoreResult<Option<LedgerRow>> {
        let inner = self.inner.read().await;
        Ok(inner.ledger.get(decision_id).cloned())
    }

    async fn link_permit(&self, decision_id: &str, permit_id: &str) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let row = inner
            .ledger
            .get_mut(decision_id)
            .ok_or_else(|| StoreError::LedgerRowNotFound(decision_id.to_string()))?;
        if row.permit_id.as_deref() != Some(permit_id) {
            row.permit_id = Some(permit_id.to_string());
            row.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn mark_ledger_posted(
        &self,
        decision_id: &str,
        external_id: &ExternalId,
        permit_id: &str,
    ) -> StoreResult<LedgerRow> {
        let mut inner = self.inner.write().await;
        let row = inner
            .ledger
            .get_mut(decision_id)
            .ok_or_else(|| StoreError::LedgerRowNotFound(decision_id.to_string()))?;
        apply_ledger_transition(
            row,
            LedgerStatus::Posted,
            Some(external_id),
            Some(permit_id),
            None,
            Utc::now(),
        )?;
        Ok(row.clone())
    }

    async fn mark_ledger_failed(&self, decision_id: &str, reason: &str) -> StoreResult<LedgerRow> {
        let mut inner = self.inner.write().await;
        let row = inner
            .ledger
            .get_mut(decision_id)
            .ok_or_else(|| StoreError::LedgerRowNotFound(decision_id.to_string()))?;
        apply_ledger_transition(
            row,
            LedgerStatus::Failed,
            None,
            None,
            Some(reason),
            Utc::now(),
        )?;
        Ok(row.clone())
    }

    async fn mark_ledger_blocked(
        &self,
        decision_id: &str,
        reason: &str,
    ) -> StoreResult<LedgerRow> {
        let mut inner = self.inner.write().await;
        let row = inner
            .ledger
            .get_mut(decision_id)
            .ok_or_else(|| StoreError::LedgerRowNotFound(decision_id.to_string()))?;
        apply_ledger_transition(
            row,
            LedgerStatus::Blocked,
            None,
            None,
            Some(reason),
            Utc::now(),
        )?;
        Ok(row.clone())
    }

    async fn query_ledger(&self, query: LedgerQuery) -> StoreResult<Vec<LedgerRow>> {
        let inner = self.inner.read().await;
        let mut rows = inner
            .ledger
            .values()
            .filter(|row| query.matches(row))
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by(|left, right| {
            left.created_at
                .cmp(&right.created_at)
                .then_with(|| left.decision_id.cmp(&right.decision_id))
        });
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    async fn create_permit(&self, permit: Permit) -> StoreResult<Permit> {
        let mut inner = self.inner.write().await;
        if let Some(existing_id) = inner.permit_ids_by_decision.get(&permit.decision_id) {
            if let Some(existing) = inner.permits.get(existing_id) {
                return Ok(existing.clone());
            }
        }
        inner
            .permit_ids_by_decision
            .insert(permit.decision_id.clone(), permit.permit_id.clone());
        inner
            .permits
            .insert(permit.permit_id.clone(), permit.clone());
        Ok(permit)
    }

    async fn get_permit(&self, permit_id: &str) -> StoreResult<Option<Permit>> {
        let inner = self.inner.read().await;
        Ok(inner.permits.get(permit_id).cloned())
    }

    async fn get_permit_for_decision(&self, decision_id: &str) -> StoreResult<Option<Permit>> {
        let inner = self.inner.read().await;
        Ok(inner
            .permit_ids_by_decision
            .get(decision_id)
            .and_then(|permit_id| inner.permits.get(permit_id))
            .cloned())
    }

    async fn transition_permit(
        &self,
        permit_id: &str,
        next: PermitStatus,
        external_id: Option<&ExternalId>,
        reason: Option<&str>,
    ) -> StoreResult<Permit> {
        let mut inner = self.inner.write().await;
        let permit = inner
            .permits
            .get_mut(permit_id)
            .ok_or_else(|| StoreError::PermitNotFound(permit_id.to_string()))?;
        apply_permit_transition(permit, next, external_id, reason, Utc::now())?;
        Ok(permit.clone())
    }

    async fn list_permits(&self) -> StoreResult<Vec<Permit>> {
        let inner = self.inner.read().await;
        let mut permits = inner.permits.values().cloned().collect::<Vec<_>>();
        permits.sort_by(|left, right| left.created_at.cmp(&right.created_at));
        Ok(permits)
    }

    async fn record_audit_event(&self, event: AuditEvent) -> StoreResult<bool> {
        let mut inner = self.inner.write().await;
        let key = (event.event_type, event.decision_id.clone());
        if !inner.audit_keys.insert(key) {
            return Ok(false);
        }
        inner.audit_events.push(event);
        Ok(true)
    }

    async fn list_audit_events(&self, decision_id: Option<&str>) -> StoreResult<Vec<AuditEvent>> {
        let inner = self.inner.read().await;
        Ok(inner
            .audit_events
            .iter()
            .filter(|event| decision_id.map_or(true, |id| event.decision_id == id))
            .cloned()
            .collect())
    }
}
