//! Exactly-once execution of a single decision.
//!
//! A run moves through `Prewriting -> GateChecking -> Posting -> Updating` and
//! ends `Completed` or `Aborted`. Every failure is resolved here and reported as
//! a [`PublishReport`]; the ledger row always ends `posted`, `failed` or
//! `blocked`, except after a confirmed publish whose update could not be
//! recorded, which is left for reconciliation and never re-posted.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio::time::Instant;
use xpost_access::{
    Guard, GuardIssuer, GuardOperation, GuardRejection, PermitError, PermitRegistry,
};
use xpost_core::{lock_or_recover, PublishMetrics};
use xpost_pool::{ResourcePool, SessionFactory};
use xpost_store::PublishStore;
use xpost_types::{
    AuditEvent, AuditEventType, Decision, DecisionKind, ExternalId, LedgerStatus, Permit,
    PermitStatus,
};

use crate::audit::{AuditSink, NoopAuditSink};
use crate::config::PublishConfig;
use crate::gate::{check_reply_gates, GateViolation};
use crate::poster::{PostRequest, Poster, ThreadComposer};
use crate::retry::{classify_outcome, PostError, RetryController, RetryPolicy};
use crate::thread::{ThreadPublication, ThreadTransactionManager};

#[cfg(test)]
mod tests;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorSettings {
    pub account_handle: String,
    /// Hard bound on the posting stage of one run.
    pub run_deadline: Duration,
    pub update_retry_attempts: usize,
    pub update_retry_backoff: Duration,
    pub thread_max_attempts: usize,
    pub composer_enabled: bool,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        PublishConfig::default().coordinator_settings()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinatorStage {
    Prewriting,
    GateChecking,
    Posting,
    Updating,
    Completed,
    Aborted,
}

impl CoordinatorStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Prewriting => "prewriting",
            Self::GateChecking => "gate_checking",
            Self::Posting => "posting",
            Self::Updating => "updating",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
        }
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("prewrite failed: {0}")]
    PrewriteFailure(String),
    #[error(transparent)]
    Gate(#[from] GateViolation),
    #[error(transparent)]
    Guard(#[from] GuardRejection),
    #[error(transparent)]
    Permit(#[from] PermitError),
    #[error(transparent)]
    Post(#[from] PostError),
    #[error("another run for this decision is already in progress")]
    RunInProgress,
    #[error("run exceeded its {deadline_ms}ms deadline")]
    DeadlineExceeded { deadline_ms: u64 },
    #[error(
        "published as '{external_id}' but the ledger update failed; reconciliation needed: {message}"
    )]
    PostSucceededButLedgerUpdateFailed {
        external_id: ExternalId,
        message: String,
    },
}

impl PublishError {
    pub fn reason_code(&self) -> String {
        match self {
            Self::PrewriteFailure(_) => "prewrite_failure".to_string(),
            Self::Gate(violation) => violation.skip_reason().to_string(),
            Self::Guard(rejection) => rejection.skip_reason(),
            Self::Permit(error) => error.reason_code().to_string(),
            Self::Post(error) => error.reason_code().to_string(),
            Self::RunInProgress => "run_in_progress".to_string(),
            Self::DeadlineExceeded { .. } => "deadline_exceeded".to_string(),
            Self::PostSucceededButLedgerUpdateFailed { .. } => {
                "post_succeeded_but_ledger_update_failed".to_string()
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PublishOutcome {
    Posted {
        external_id: ExternalId,
    },
    /// The ledger row was already terminal; nothing was attempted.
    AlreadyTerminal {
        status: LedgerStatus,
        external_id: Option<ExternalId>,
    },
    Blocked {
        reason: String,
    },
    Failed {
        reason: String,
    },
    ReconciliationNeeded {
        external_id: ExternalId,
    },
}

impl PublishOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Posted { .. } => "posted",
            Self::AlreadyTerminal { .. } => "already_terminal",
            Self::Blocked { .. } => "blocked",
            Self::Failed { .. } => "failed",
            Self::ReconciliationNeeded { .. } => "reconciliation_needed",
        }
    }
}

/// Structured result of one coordinator run.
#[derive(Debug)]
pub struct PublishReport {
    pub decision_id: String,
    pub stage: CoordinatorStage,
    pub aborted_at: Option<CoordinatorStage>,
    pub outcome: PublishOutcome,
    pub error: Option<PublishError>,
    /// Poster attempts made by this run.
    pub attempts: usize,
    pub thread: Option<ThreadPublication>,
}

impl PublishReport {
    fn completed(
        decision_id: &str,
        outcome: PublishOutcome,
        attempts: usize,
        thread: Option<ThreadPublication>,
    ) -> Self {
        Self {
            decision_id: decision_id.to_string(),
            stage: CoordinatorStage::Completed,
            aborted_at: None,
            outcome,
            error: None,
            attempts,
            thread,
        }
    }

    fn aborted(
        decision_id: &str,
        at: CoordinatorStage,
        outcome: PublishOutcome,
        error: PublishError,
        attempts: usize,
    ) -> Self {
        Self {
            decision_id: decision_id.to_string(),
            stage: CoordinatorStage::Aborted,
            aborted_at: Some(at),
            outcome,
            error: Some(error),
            attempts,
            thread: None,
        }
    }

    pub fn is_posted(&self) -> bool {
        matches!(self.outcome, PublishOutcome::Posted { .. })
    }

    pub fn external_id(&self) -> Option<&ExternalId> {
        match &self.outcome {
            PublishOutcome::Posted { external_id }
            | PublishOutcome::ReconciliationNeeded { external_id } => Some(external_id),
            PublishOutcome::AlreadyTerminal { external_id, .. } => external_id.as_ref(),
            PublishOutcome::Blocked { .. } | PublishOutcome::Failed { .. } => None,
        }
    }

    pub fn reason_code(&self) -> Option<String> {
        self.error.as_ref().map(PublishError::reason_code)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Blocked,
    Failed,
}

enum Prewritten {
    Terminal {
        status: LedgerStatus,
        external_id: Option<ExternalId>,
    },
    Ready(Permit),
}

struct Posting {
    result: Result<ExternalId, PublishError>,
    attempts: usize,
    thread: Option<ThreadPublication>,
}

/// Fails with [`PostError::PermitAlreadyUsed`] once a permit is used, so no
/// further publish is attempted for its decision.
pub(crate) async fn ensure_permit_unused(
    permits: &PermitRegistry,
    permit_id: &str,
) -> Result<(), PostError> {
    match permits.get(permit_id).await {
        Ok(Some(permit)) => match permit.status {
            PermitStatus::Approved => Ok(()),
            PermitStatus::Used => Err(PostError::PermitAlreadyUsed),
            status => Err(PostError::InvalidState(format!(
                "permit '{permit_id}' is {}",
                status.as_str()
            ))),
        },
        Ok(None) => Err(PostError::InvalidState(format!(
            "permit '{permit_id}' does not exist"
        ))),
        Err(error) => Err(PostError::InvalidState(error.to_string())),
    }
}

/// Marks a decision as owned by one run; released on drop.
struct RunClaim<'a> {
    in_flight: &'a Mutex<HashSet<String>>,
    decision_id: String,
}

impl Drop for RunClaim<'_> {
    fn drop(&mut self) {
        lock_or_recover(self.in_flight).remove(&self.decision_id);
    }
}

/// Drives decisions through the exactly-once publish protocol.
pub struct ExecutionCoordinator<F: SessionFactory> {
    store: Arc<dyn PublishStore>,
    permits: PermitRegistry,
    guards: Arc<GuardIssuer>,
    pool: ResourcePool<F>,
    poster: Arc<dyn Poster<Session = F::Session>>,
    threads: ThreadTransactionManager<F>,
    audit: Arc<dyn AuditSink>,
    metrics: Arc<PublishMetrics>,
    settings: CoordinatorSettings,
    retry: RetryController,
    in_flight: Mutex<HashSet<String>>,
}

impl<F: SessionFactory> ExecutionCoordinator<F> {
    pub fn new(
        store: Arc<dyn PublishStore>,
        guards: Arc<GuardIssuer>,
        pool: ResourcePool<F>,
        poster: Arc<dyn Poster<Session = F::Session>>,
        metrics: Arc<PublishMetrics>,
        settings: CoordinatorSettings,
        retry_policy: RetryPolicy,
    ) -> Self {
        let threads = ThreadTransactionManager::new(
            pool.clone(),
            Arc::clone(&poster),
            retry_policy.clone(),
            settings.thread_max_attempts,
            Arc::clone(&metrics),
        );
        Self {
            permits: PermitRegistry::new(Arc::clone(&store)),
            store,
            guards,
            pool,
            poster,
            threads,
            audit: Arc::new(NoopAuditSink),
            retry: RetryController::new(retry_policy, Arc::clone(&metrics)),
            metrics,
            settings,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    /// Enables composer mode for threads unless disabled in the settings.
    pub fn with_composer(
        mut self,
        composer: Arc<dyn ThreadComposer<Session = F::Session>>,
    ) -> Self {
        if self.settings.composer_enabled {
            self.threads = self.threads.with_composer(composer);
        }
        self
    }

    pub fn store(&self) -> &Arc<dyn PublishStore> {
        &self.store
    }

    pub fn permits(&self) -> &PermitRegistry {
        &self.permits
    }

    pub fn guards(&self) -> &Arc<GuardIssuer> {
        &self.guards
    }

    pub fn pool(&self) -> &ResourcePool<F> {
        &self.pool
    }

    pub fn metrics(&self) -> &Arc<PublishMetrics> {
        &self.metrics
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.settings
    }

    /// Publishes `decision` at most once, authorized by `guard`.
    ///
    /// A second call for a decision whose run is still in progress returns
    /// without touching durable state.
    #[tracing::instrument(
        level = "debug",
        skip(self, decision, guard),
        fields(decision_id = %decision.id, kind = decision.kind.as_str())
    )]
    pub async fn publish(&self, decision: &Decision, guard: Option<Guard>) -> PublishReport {
        let decision_id = decision.id.as_str();
        let Some(_claim) = self.claim(decision_id) else {
            tracing::warn!(
                target: "xpost::coordinator",
                decision_id,
                "run already in progress; refusing concurrent publish"
            );
            let error = PublishError::RunInProgress;
            return PublishReport::aborted(
                decision_id,
                CoordinatorStage::Prewriting,
                PublishOutcome::Failed {
                    reason: error.reason_code(),
                },
                error,
                0,
            );
        };
        self.enter(decision_id, CoordinatorStage::Prewriting);
        let permit = match self.prewrite(decision).await {
            Ok(Prewritten::Ready(permit)) => permit,
            Ok(Prewritten::Terminal {
                status,
                external_id,
            }) => {
                tracing::info!(
                    target: "xpost::coordinator",
                    decision_id,
                    status = status.as_str(),
                    "ledger row already terminal; nothing to publish"
                );
                return PublishReport::completed(
                    decision_id,
                    PublishOutcome::AlreadyTerminal {
                        status,
                        external_id,
                    },
                    0,
                    None,
                );
            }
            Err(error) => {
                self.metrics.record_prewrite_failure();
                tracing::error!(
                    target: "xpost::coordinator",
                    decision_id,
                    "prewrite failed; poster will not be invoked: {error}"
                );
                return PublishReport::aborted(
                    decision_id,
                    CoordinatorStage::Prewriting,
                    PublishOutcome::Failed {
                        reason: error.reason_code(),
                    },
                    error,
                    0,
                );
            }
        };
        let permit_id = permit.permit_id.clone();

        match permit.status {
            PermitStatus::Used => {
                tracing::info!(
                    target: "xpost::coordinator",
                    decision_id,
                    permit_id = permit_id.as_str(),
                    "permit already used; finalizing ledger without posting"
                );
                return self.finalize_from_permit(decision_id, permit, 0).await;
            }
            PermitStatus::Failed => {
                let reason = permit
                    .reason
                    .clone()
                    .unwrap_or_else(|| "permit_failed".to_string());
                return self
                    .abort(
                        decision_id,
                        None,
                        Disposition::Failed,
                        reason,
                        PublishError::Permit(PermitError::Invalid {
                            permit_id,
                            status: PermitStatus::Failed,
                        }),
                        CoordinatorStage::Prewriting,
                        0,
                    )
                    .await;
            }
            PermitStatus::Pending | PermitStatus::Approved => {}
        }

        self.enter(decision_id, CoordinatorStage::GateChecking);
        let reply_to = match check_reply_gates(decision, &self.settings.account_handle) {
            Ok(reply_to) => reply_to,
            Err(violation) => {
                self.metrics.record_gate_block();
                return self
                    .abort(
                        decision_id,
                        Some(&permit_id),
                        Disposition::Blocked,
                        violation.skip_reason().to_string(),
                        PublishError::Gate(violation),
                        CoordinatorStage::GateChecking,
                        0,
                    )
                    .await;
            }
        };

        let mut guard = match self
            .guards
            .verify(guard, guard_operation(decision.kind), decision_id)
        {
            Ok(guard) => guard,
            Err(rejection) => {
                let disposition = if rejection.is_kill_switch() {
                    Disposition::Blocked
                } else {
                    Disposition::Failed
                };
                return self
                    .abort(
                        decision_id,
                        Some(&permit_id),
                        disposition,
                        rejection.skip_reason(),
                        PublishError::Guard(rejection),
                        CoordinatorStage::GateChecking,
                        0,
                    )
                    .await;
            }
        };
        guard.attach_permit(permit_id.as_str());

        if let Err(error) = self.approve_and_verify(&permit).await {
            return self
                .abort(
                    decision_id,
                    Some(&permit_id),
                    Disposition::Failed,
                    error.reason_code().to_string(),
                    PublishError::Permit(error),
                    CoordinatorStage::GateChecking,
                    0,
                )
                .await;
        }

        self.enter(decision_id, CoordinatorStage::Posting);
        let deadline = Instant::now() + self.settings.run_deadline;
        let posting = match decision.kind {
            DecisionKind::Thread => self.post_thread(decision, &permit_id, deadline).await,
            DecisionKind::Single | DecisionKind::Reply => {
                self.post_single(decision, reply_to, &permit_id, deadline)
                    .await
            }
        };

        match posting.result {
            Ok(external_id) => {
                self.update(
                    decision_id,
                    &permit_id,
                    external_id,
                    posting.attempts,
                    posting.thread,
                )
                .await
            }
            Err(PublishError::Post(PostError::PermitAlreadyUsed)) => {
                match self.permits.get(&permit_id).await {
                    Ok(Some(permit)) if permit.status == PermitStatus::Used => {
                        self.finalize_from_permit(decision_id, permit, posting.attempts)
                            .await
                    }
                    _ => {
                        self.abort(
                            decision_id,
                            Some(&permit_id),
                            Disposition::Failed,
                            PostError::PermitAlreadyUsed.reason_code().to_string(),
                            PublishError::Post(PostError::PermitAlreadyUsed),
                            CoordinatorStage::Posting,
                            posting.attempts,
                        )
                        .await
                    }
                }
            }
            Err(error) => {
                self.abort(
                    decision_id,
                    Some(&permit_id),
                    Disposition::Failed,
                    error.reason_code(),
                    error,
                    CoordinatorStage::Posting,
                    posting.attempts,
                )
                .await
            }
        }
    }

    fn claim(&self, decision_id: &str) -> Option<RunClaim<'_>> {
        if !lock_or_recover(&self.in_flight).insert(decision_id.to_string()) {
            return None;
        }
        Some(RunClaim {
            in_flight: &self.in_flight,
            decision_id: decision_id.to_string(),
        })
    }

    fn enter(&self, decision_id: &str, stage: CoordinatorStage) {
        tracing::debug!(
            target: "xpost::coordinator",
            decision_id,
            stage = stage.as_str(),
            "entering stage"
        );
    }

    async fn prewrite(&self, decision: &Decision) -> Result<Prewritten, PublishError> {
        let row = self
            .store
            .upsert_posting_attempt(&decision.id)
            .await
            .map_err(prewrite_failure)?;
        if row.status.is_terminal() {
            return Ok(Prewritten::Terminal {
                status: row.status,
                external_id: row.external_id,
            });
        }

        match self.attach_permit(decision, row.permit_id.as_deref()).await {
            Ok(permit) => Ok(Prewritten::Ready(permit)),
            Err(error) => {
                self.settle_partial_prewrite(&decision.id, &error).await;
                Err(error)
            }
        }
    }

    async fn attach_permit(
        &self,
        decision: &Decision,
        linked_permit_id: Option<&str>,
    ) -> Result<Permit, PublishError> {
        let metadata = HashMap::from([
            ("kind".to_string(), json!(decision.kind.as_str())),
            ("priority".to_string(), json!(decision.effective_priority())),
            (
                "segments".to_string(),
                json!(match decision.kind {
                    DecisionKind::Thread => decision.thread_segments().len(),
                    DecisionKind::Single | DecisionKind::Reply => 1,
                }),
            ),
        ]);
        let permit = self
            .permits
            .create(&decision.id, metadata)
            .await
            .map_err(prewrite_failure)?;
        if linked_permit_id != Some(permit.permit_id.as_str()) {
            self.store
                .link_permit(&decision.id, &permit.permit_id)
                .await
                .map_err(prewrite_failure)?;
        }
        Ok(permit)
    }

    /// Fails a freshly prewritten row whose permit could not be attached, so no
    /// `posting_attempt` row outlives its run. A used permit means an earlier run
    /// already published; that row is left for reconciliation.
    async fn settle_partial_prewrite(&self, decision_id: &str, error: &PublishError) {
        let reason = error.reason_code();
        match self.store.get_permit_for_decision(decision_id).await {
            Ok(Some(permit)) if permit.status == PermitStatus::Used => {
                tracing::warn!(
                    target: "xpost::reconciliation",
                    decision_id,
                    permit_id = permit.permit_id.as_str(),
                    "permit already used; leaving row for reconciliation"
                );
                return;
            }
            Ok(Some(permit)) if !permit.status.is_terminal() => {
                if let Err(permit_error) =
                    self.permits.mark_failed(&permit.permit_id, &reason).await
                {
                    tracing::warn!(
                        target: "xpost::coordinator",
                        decision_id,
                        "failed to mark permit failed after prewrite failure: {permit_error}"
                    );
                }
            }
            Ok(_) => {}
            Err(store_error) => {
                tracing::error!(
                    target: "xpost::coordinator",
                    decision_id,
                    "cannot read permit after prewrite failure; row left for reconciliation: {store_error}"
                );
                return;
            }
        }
        match self.store.mark_ledger_failed(decision_id, &reason).await {
            Ok(_) => self.metrics.record_decision_failed(),
            Err(ledger_error) => tracing::error!(
                target: "xpost::coordinator",
                decision_id,
                "failed to settle prewritten row: {ledger_error}"
            ),
        }
    }

    async fn approve_and_verify(&self, permit: &Permit) -> Result<Permit, PermitError> {
        if permit.status == PermitStatus::Pending {
            self.permits.approve(&permit.permit_id).await?;
        }
        self.permits.verify(&permit.permit_id).await
    }

    async fn post_single(
        &self,
        decision: &Decision,
        reply_to: Option<ExternalId>,
        permit_id: &str,
        deadline: Instant,
    ) -> Posting {
        let request = PostRequest {
            decision_id: decision.id.clone(),
            content: decision.content.clone(),
            reply_to,
        };
        let priority = decision.effective_priority();
        let confirmed = Mutex::new(None);
        let attempts_made = AtomicUsize::new(0);

        let this = self;
        let request = &request;
        let confirmed_ref = &confirmed;
        let attempts_ref = &attempts_made;
        let run = tokio::time::timeout_at(
            deadline,
            self.retry.run(&decision.id, move |attempt| {
                attempts_ref.store(attempt, Ordering::Relaxed);
                this.attempt_single(request, permit_id, priority, confirmed_ref)
            }),
        )
        .await;

        match run {
            Ok(run) => Posting {
                result: run.result.map_err(PublishError::Post),
                attempts: run.attempts,
                thread: None,
            },
            Err(_) => {
                let attempts = attempts_made.load(Ordering::Relaxed);
                let late = lock_or_recover(&confirmed).take();
                Posting {
                    result: late.ok_or_else(|| self.deadline_error()),
                    attempts,
                    thread: None,
                }
            }
        }
    }

    async fn attempt_single(
        &self,
        request: &PostRequest,
        permit_id: &str,
        priority: u8,
        confirmed: &Mutex<Option<ExternalId>>,
    ) -> Result<ExternalId, PostError> {
        ensure_permit_unused(&self.permits, permit_id).await?;
        let mut lease = self.pool.acquire(priority).await?;
        self.metrics.record_poster_invocation();
        let outcome = self.poster.submit(lease.session_mut(), request).await;
        let result = classify_outcome(&outcome);
        match &result {
            Ok(external_id) => {
                lease.mark_succeeded();
                *lock_or_recover(confirmed) = Some(external_id.clone());
            }
            Err(error) if error.taints_session() => lease.mark_failed(),
            Err(_) => lease.mark_succeeded(),
        }
        tracing::debug!(
            target: "xpost::coordinator",
            decision_id = request.decision_id.as_str(),
            slot = lease.slot(),
            success = result.is_ok(),
            "poster attempt finished"
        );
        result
    }

    async fn post_thread(
        &self,
        decision: &Decision,
        permit_id: &str,
        deadline: Instant,
    ) -> Posting {
        let progress = Mutex::new(None);
        let run = tokio::time::timeout_at(
            deadline,
            self.threads
                .publish_tracked(decision, Some((&self.permits, permit_id)), &progress),
        )
        .await;

        match run {
            Ok(run) => match run.result {
                Ok(publication) => Posting {
                    result: publication
                        .root_id()
                        .cloned()
                        .ok_or(PublishError::Post(PostError::MissingExternalId)),
                    attempts: run.attempts,
                    thread: Some(publication),
                },
                Err(error) => Posting {
                    result: Err(PublishError::Post(error)),
                    attempts: run.attempts,
                    thread: None,
                },
            },
            Err(_) => {
                let partial = lock_or_recover(&progress).take();
                let root = partial
                    .as_ref()
                    .and_then(ThreadPublication::root_id)
                    .cloned();
                Posting {
                    result: root.ok_or_else(|| self.deadline_error()),
                    attempts: usize::from(partial.is_some()),
                    thread: partial,
                }
            }
        }
    }

    fn deadline_error(&self) -> PublishError {
        PublishError::DeadlineExceeded {
            deadline_ms: u64::try_from(self.settings.run_deadline.as_millis()).unwrap_or(u64::MAX),
        }
    }

    async fn finalize_from_permit(
        &self,
        decision_id: &str,
        permit: Permit,
        attempts: usize,
    ) -> PublishReport {
        match permit.external_id {
            Some(external_id) => {
                self.update(decision_id, &permit.permit_id, external_id, attempts, None)
                    .await
            }
            None => {
                let error = PostError::InvalidState(format!(
                    "permit '{}' is used without an external id",
                    permit.permit_id
                ));
                self.abort(
                    decision_id,
                    None,
                    Disposition::Failed,
                    error.reason_code().to_string(),
                    PublishError::Post(error),
                    CoordinatorStage::Updating,
                    attempts,
                )
                .await
            }
        }
    }

    async fn update(
        &self,
        decision_id: &str,
        permit_id: &str,
        external_id: ExternalId,
        attempts: usize,
        thread: Option<ThreadPublication>,
    ) -> PublishReport {
        self.enter(decision_id, CoordinatorStage::Updating);
        let budget = self.settings.update_retry_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=budget {
            match self
                .apply_update(decision_id, permit_id, &external_id, attempts)
                .await
            {
                Ok(()) => {
                    self.metrics.record_decision_posted();
                    tracing::info!(
                        target: "xpost::coordinator",
                        decision_id,
                        external_id = external_id.as_str(),
                        attempts,
                        "decision published"
                    );
                    return PublishReport::completed(
                        decision_id,
                        PublishOutcome::Posted { external_id },
                        attempts,
                        thread,
                    );
                }
                Err(error) => {
                    tracing::warn!(
                        target: "xpost::coordinator",
                        decision_id,
                        attempt,
                        "ledger update after confirmed publish failed: {error:#}"
                    );
                    last_error = format!("{error:#}");
                    if attempt < budget {
                        let step = u32::try_from(attempt).unwrap_or(u32::MAX);
                        let backoff = self.settings.update_retry_backoff.saturating_mul(step);
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }

        self.metrics.record_reconciliation_needed();
        tracing::error!(
            target: "xpost::reconciliation",
            decision_id,
            permit_id,
            external_id = external_id.as_str(),
            "publish confirmed but ledger update failed; reconciliation needed: {last_error}"
        );
        self.record_audit_best_effort(
            AuditEvent::new(AuditEventType::ReconciliationNeeded, decision_id)
                .with_external_id(external_id.clone())
                .with_detail(json!({ "permit_id": permit_id, "error": last_error })),
        )
        .await;
        let mut report = PublishReport::aborted(
            decision_id,
            CoordinatorStage::Updating,
            PublishOutcome::ReconciliationNeeded {
                external_id: external_id.clone(),
            },
            PublishError::PostSucceededButLedgerUpdateFailed {
                external_id,
                message: last_error,
            },
            attempts,
        );
        report.thread = thread;
        report
    }

    /// Each step is idempotent so the whole sequence can be repeated safely.
    async fn apply_update(
        &self,
        decision_id: &str,
        permit_id: &str,
        external_id: &ExternalId,
        attempts: usize,
    ) -> anyhow::Result<()> {
        self.permits.mark_used(permit_id, external_id).await?;
        self.store
            .mark_ledger_posted(decision_id, external_id, permit_id)
            .await?;
        let event = AuditEvent::new(AuditEventType::PostSuccess, decision_id)
            .with_external_id(external_id.clone())
            .with_detail(json!({ "permit_id": permit_id, "attempts": attempts }));
        self.record_audit(event).await?;
        Ok(())
    }

    /// Records `event` once per `(event_type, decision_id)`; only a newly
    /// recorded event reaches the audit sink.
    async fn record_audit(&self, event: AuditEvent) -> xpost_store::StoreResult<bool> {
        let inserted = self.store.record_audit_event(event.clone()).await?;
        if inserted {
            self.audit.emit(&event);
        } else {
            self.metrics.record_audit_duplicate_suppressed();
        }
        Ok(inserted)
    }

    async fn record_audit_best_effort(&self, event: AuditEvent) {
        if let Err(error) = self.record_audit(event.clone()).await {
            tracing::warn!(
                target: "xpost::coordinator",
                decision_id = event.decision_id.as_str(),
                event_type = event.event_type.as_str(),
                "failed to persist audit event: {error}"
            );
            self.audit.emit(&event);
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn abort(
        &self,
        decision_id: &str,
        permit_id: Option<&str>,
        disposition: Disposition,
        reason: String,
        error: PublishError,
        stage: CoordinatorStage,
        attempts: usize,
    ) -> PublishReport {
        if let Some(permit_id) = permit_id {
            if let Err(permit_error) = self.permits.mark_failed(permit_id, &reason).await {
                tracing::warn!(
                    target: "xpost::coordinator",
                    decision_id,
                    permit_id,
                    "failed to mark permit failed: {permit_error}"
                );
            }
        }

        let (ledger, event_type, outcome) = match disposition {
            Disposition::Blocked => (
                self.store.mark_ledger_blocked(decision_id, &reason).await,
                AuditEventType::PostBlocked,
                PublishOutcome::Blocked {
                    reason: reason.clone(),
                },
            ),
            Disposition::Failed => (
                self.store.mark_ledger_failed(decision_id, &reason).await,
                AuditEventType::PostFailed,
                PublishOutcome::Failed {
                    reason: reason.clone(),
                },
            ),
        };
        if let Err(ledger_error) = ledger {
            tracing::error!(
                target: "xpost::coordinator",
                decision_id,
                reason = reason.as_str(),
                "failed to record terminal ledger status: {ledger_error}"
            );
        }
        if disposition == Disposition::Failed {
            self.metrics.record_decision_failed();
        }

        self.record_audit_best_effort(
            AuditEvent::new(event_type, decision_id).with_detail(json!({
                "reason": reason,
                "stage": stage.as_str(),
                "attempts": attempts,
            })),
        )
        .await;
        tracing::warn!(
            target: "xpost::coordinator",
            decision_id,
            stage = stage.as_str(),
            reason = reason.as_str(),
            "publish aborted: {error}"
        );
        PublishReport::aborted(decision_id, stage, outcome, error, attempts)
    }
}

fn prewrite_failure(error: impl std::fmt::Display) -> PublishError {
    PublishError::PrewriteFailure(error.to_string())
}

fn guard_operation(kind: DecisionKind) -> GuardOperation {
    match kind {
        DecisionKind::Single => GuardOperation::PostSingle,
        DecisionKind::Thread => GuardOperation::PostThread,
        DecisionKind::Reply => GuardOperation::PostReply,
    }
}
