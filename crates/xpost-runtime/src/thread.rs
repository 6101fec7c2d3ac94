//! Multi-segment publications: composer mode first, reply-chain fallback second.
//!
//! Every whole-operation attempt acquires fresh leases. A reply chain that has
//! posted its first segment is never retried, so a thread is published at most
//! once even when later segments fail.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use xpost_access::PermitRegistry;
use xpost_core::{lock_or_recover, PublishMetrics};
use xpost_pool::{ResourcePool, SessionFactory};
use xpost_types::{Decision, ExternalId, SegmentState, ThreadSegment};

use crate::coordinator::ensure_permit_unused;
use crate::poster::{
    ComposerOutcome, PostOutcome, PostRequest, Poster, ThreadComposer, ThreadRequest,
};
use crate::retry::{classify_outcome, PostError, RetryController, RetryPolicy, RetryRun};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadMode {
    Composer,
    ReplyChain,
}

/// Result of a thread publication. `external_ids` holds only captured ids, in
/// segment order, and may be shorter than `segments`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThreadPublication {
    pub mode: ThreadMode,
    pub external_ids: Vec<ExternalId>,
    pub segments: Vec<ThreadSegment>,
    pub chain_broken: bool,
    pub attempts: usize,
    pub composer_error: Option<String>,
}

impl ThreadPublication {
    fn new(mode: ThreadMode, segments: Vec<ThreadSegment>) -> Self {
        Self {
            mode,
            external_ids: Vec::new(),
            segments,
            chain_broken: false,
            attempts: 0,
            composer_error: None,
        }
    }

    /// Id of the first segment, which stands for the whole thread in the ledger.
    pub fn root_id(&self) -> Option<&ExternalId> {
        self.segments
            .first()
            .and_then(|segment| segment.external_id.as_ref())
    }

    fn last_known_id(&self) -> Option<&ExternalId> {
        self.segments
            .iter()
            .rev()
            .find_map(|segment| segment.external_id.as_ref())
    }

    fn record_posted(&mut self, index: usize, captured: Option<ExternalId>) {
        let parent = index
            .checked_sub(1)
            .and_then(|_| self.last_known_id().cloned());
        let Some(segment) = self.segments.get_mut(index) else {
            return;
        };
        advance(segment, SegmentState::Posted);
        segment.reply_to = parent.clone();
        match captured {
            Some(id) if parent.as_ref() != Some(&id) => {
                segment.external_id = Some(id.clone());
                self.external_ids.push(id);
            }
            Some(_) => {
                segment.failure = Some("captured id matches parent".to_string());
                self.chain_broken = true;
            }
            None => {
                segment.failure = Some("external id not captured".to_string());
                self.chain_broken = true;
            }
        }
    }
}

fn advance(segment: &mut ThreadSegment, next: SegmentState) -> bool {
    if segment.state.can_transition_to(next) {
        segment.state = next;
        true
    } else {
        false
    }
}

fn fresh_segments(contents: &[String]) -> Vec<ThreadSegment> {
    contents
        .iter()
        .enumerate()
        .map(|(index, content)| ThreadSegment::new(index, content.as_str()))
        .collect()
}

/// Publishes thread decisions through the shared pool.
pub struct ThreadTransactionManager<F: SessionFactory> {
    pool: ResourcePool<F>,
    poster: Arc<dyn Poster<Session = F::Session>>,
    composer: Option<Arc<dyn ThreadComposer<Session = F::Session>>>,
    retry: RetryController,
    metrics: Arc<PublishMetrics>,
}

impl<F: SessionFactory> ThreadTransactionManager<F> {
    /// `max_attempts` bounds whole-operation attempts; backoff follows `policy`.
    pub fn new(
        pool: ResourcePool<F>,
        poster: Arc<dyn Poster<Session = F::Session>>,
        policy: RetryPolicy,
        max_attempts: usize,
        metrics: Arc<PublishMetrics>,
    ) -> Self {
        let policy = RetryPolicy {
            max_additional_attempts: max_attempts.saturating_sub(1),
            ..policy
        };
        Self {
            pool,
            poster,
            composer: None,
            retry: RetryController::new(policy, Arc::clone(&metrics)),
            metrics,
        }
    }

    pub fn with_composer(
        mut self,
        composer: Arc<dyn ThreadComposer<Session = F::Session>>,
    ) -> Self {
        self.composer = Some(composer);
        self
    }

    pub fn has_composer(&self) -> bool {
        self.composer.is_some()
    }

    pub async fn publish(&self, decision: &Decision) -> RetryRun<ThreadPublication> {
        let progress = Mutex::new(None);
        self.publish_tracked(decision, None, &progress).await
    }

    /// Publishes `decision`, mirroring every posted segment into `progress` so a
    /// caller that abandons the future still learns what was published.
    pub(crate) async fn publish_tracked(
        &self,
        decision: &Decision,
        permit: Option<(&PermitRegistry, &str)>,
        progress: &Mutex<Option<ThreadPublication>>,
    ) -> RetryRun<ThreadPublication> {
        let contents = decision.thread_segments();
        let contents = contents.as_slice();
        let this = self;
        let mut run = self
            .retry
            .run(&decision.id, move |attempt| {
                this.attempt(decision, contents, permit, progress, attempt)
            })
            .await;
        if let Ok(publication) = run.result.as_mut() {
            publication.attempts = run.attempts;
        }
        run
    }

    async fn attempt(
        &self,
        decision: &Decision,
        contents: &[String],
        permit: Option<(&PermitRegistry, &str)>,
        progress: &Mutex<Option<ThreadPublication>>,
        attempt: usize,
    ) -> Result<ThreadPublication, PostError> {
        if let Some((permits, permit_id)) = permit {
            ensure_permit_unused(permits, permit_id).await?;
        }
        let priority = decision.effective_priority();

        let mut composer_error = None;
        if let Some(composer) = self.composer.as_ref() {
            match self
                .compose(composer.as_ref(), decision, contents, priority, progress)
                .await?
            {
                ComposeStep::Published(publication) => return Ok(publication),
                ComposeStep::Abandoned(error) => {
                    tracing::warn!(
                        target: "xpost::coordinator",
                        decision_id = decision.id.as_str(),
                        attempt,
                        "thread composer abandoned; falling back to reply chain: {error}"
                    );
                    composer_error = Some(error);
                }
            }
        }

        let mut publication = self
            .reply_chain(decision, contents, priority, progress)
            .await?;
        publication.composer_error = composer_error;
        Ok(publication)
    }

    async fn compose(
        &self,
        composer: &dyn ThreadComposer<Session = F::Session>,
        decision: &Decision,
        contents: &[String],
        priority: u8,
        progress: &Mutex<Option<ThreadPublication>>,
    ) -> Result<ComposeStep, PostError> {
        let mut lease = self.pool.acquire(priority).await?;
        self.metrics.record_poster_invocation();
        let request = ThreadRequest {
            decision_id: decision.id.clone(),
            segments: contents.to_vec(),
        };
        let outcome = composer.compose(lease.session_mut(), &request).await;

        match outcome {
            ComposerOutcome::Posted { external_ids } => {
                lease.mark_succeeded();
                drop(lease);
                let mut publication =
                    ThreadPublication::new(ThreadMode::Composer, fresh_segments(contents));
                for segment in publication.segments.iter_mut() {
                    advance(segment, SegmentState::Typed);
                    advance(segment, SegmentState::Verified);
                }
                for index in 0..contents.len() {
                    let captured = external_ids
                        .get(index)
                        .and_then(|raw| ExternalId::parse(raw).ok());
                    publication.record_posted(index, captured);
                }
                if publication.root_id().is_none() {
                    return Err(PostError::MissingExternalId);
                }
                *lock_or_recover(progress) = Some(publication.clone());
                Ok(ComposeStep::Published(publication))
            }
            ComposerOutcome::Abandoned {
                staged_segments,
                error,
            } => {
                let taints = classify_outcome(&PostOutcome::failed(error.as_str()))
                    .err()
                    .is_some_and(|classified| classified.taints_session());
                if taints {
                    lease.mark_failed();
                } else {
                    lease.mark_succeeded();
                }
                tracing::debug!(
                    decision_id = decision.id.as_str(),
                    staged_segments,
                    total_segments = contents.len(),
                    "composer staged segments before abandoning"
                );
                Ok(ComposeStep::Abandoned(error))
            }
        }
    }

    async fn reply_chain(
        &self,
        decision: &Decision,
        contents: &[String],
        priority: u8,
        progress: &Mutex<Option<ThreadPublication>>,
    ) -> Result<ThreadPublication, PostError> {
        let mut lease = self.pool.acquire(priority).await?;
        let mut publication =
            ThreadPublication::new(ThreadMode::ReplyChain, fresh_segments(contents));

        for (index, content) in contents.iter().enumerate() {
            let request = PostRequest {
                decision_id: decision.id.clone(),
                content: content.clone(),
                reply_to: publication.last_known_id().cloned(),
            };
            self.metrics.record_poster_invocation();
            let outcome = self.poster.submit(lease.session_mut(), &request).await;
            match classify_outcome(&outcome) {
                Ok(id) => publication.record_posted(index, Some(id)),
                Err(error) if index == 0 => {
                    if error.taints_session() {
                        lease.mark_failed();
                    }
                    return Err(error);
                }
                Err(PostError::MissingExternalId | PostError::MalformedExternalId(_)) => {
                    publication.record_posted(index, None);
                }
                Err(error) => {
                    if error.taints_session() {
                        lease.mark_failed();
                    }
                    if let Some(segment) = publication.segments.get_mut(index) {
                        segment.failure = Some(error.to_string());
                    }
                    publication.chain_broken = true;
                    tracing::warn!(
                        target: "xpost::coordinator",
                        decision_id = decision.id.as_str(),
                        segment = index,
                        reason_code = error.reason_code(),
                        "reply chain stopped after a segment failure"
                    );
                    break;
                }
            }
            *lock_or_recover(progress) = Some(publication.clone());
        }

        if publication.root_id().is_none() {
            // The root was submitted but its id was not captured; nothing can chain from it.
            return Err(PostError::MissingExternalId);
        }
        lease.mark_succeeded();
        Ok(publication)
    }
}

enum ComposeStep {
    Published(ThreadPublication),
    Abandoned(String),
}
