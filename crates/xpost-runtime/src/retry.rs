//! Error classification and bounded, backed-off re-invocation.
//!
//! [`next_step`] is a pure transition from (attempt, error) to the next action;
//! [`RetryController`] only executes it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use xpost_core::PublishMetrics;
use xpost_pool::PoolError;
use xpost_types::ExternalId;

use crate::poster::PostOutcome;

const RATE_LIMIT_MARKERS: &[&str] = &[
    "rate limit",
    "rate-limit",
    "ratelimit",
    "429",
    "too many requests",
];
const TIMEOUT_MARKERS: &[&str] = &["timeout", "timed out", "deadline"];
const SESSION_MARKERS: &[&str] = &[
    "navigation",
    "session",
    "target closed",
    "browser",
    "network",
    "connection",
    "detached",
];
const AUTHORIZATION_MARKERS: &[&str] = &[
    "unauthorized",
    "forbidden",
    "401",
    "403",
    "suspended",
    "locked account",
];

/// Classified publish failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PostError {
    #[error("poster timed out: {0}")]
    Timeout(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("transient session failure: {0}")]
    Session(String),
    #[error("poster reported failure: {0}")]
    Rejected(String),
    #[error("account is not authorized to publish: {0}")]
    Unauthorized(String),
    #[error("poster reported success without an external id")]
    MissingExternalId,
    #[error("poster returned malformed external id '{0}'")]
    MalformedExternalId(String),
    #[error("session pool unavailable: {0}")]
    PoolClosed(String),
    #[error("permit already used; refusing to publish again")]
    PermitAlreadyUsed,
    #[error("invalid publish state: {0}")]
    InvalidState(String),
    #[error("retry budget exhausted after {attempts} attempts: {last}")]
    BudgetExhausted { attempts: usize, last: Box<PostError> },
}

impl PostError {
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::RateLimited(_) | Self::Session(_) | Self::Rejected(_)
        )
    }

    /// Whether the session that produced this error should be discarded.
    pub fn taints_session(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Session(_))
    }

    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "poster_timeout",
            Self::RateLimited(_) => "rate_limited",
            Self::Session(_) => "transient_session_failure",
            Self::Rejected(_) => "poster_rejected",
            Self::Unauthorized(_) => "unauthorized",
            Self::MissingExternalId => "missing_external_id",
            Self::MalformedExternalId(_) => "malformed_external_id",
            Self::PoolClosed(_) => "pool_closed",
            Self::PermitAlreadyUsed => "permit_already_used",
            Self::InvalidState(_) => "invalid_state",
            Self::BudgetExhausted { .. } => "retry_budget_exhausted",
        }
    }
}

impl From<PoolError> for PostError {
    fn from(error: PoolError) -> Self {
        match error {
            PoolError::AcquireTimeout { .. } => Self::Timeout(error.to_string()),
            PoolError::SessionStart { .. } => Self::Session(error.to_string()),
            PoolError::Closed | PoolError::ZeroCapacity => Self::PoolClosed(error.to_string()),
        }
    }
}

/// Maps a raw poster outcome to a validated external id or a classified error.
pub fn classify_outcome(outcome: &PostOutcome) -> Result<ExternalId, PostError> {
    if outcome.success {
        let raw = outcome.external_id.as_deref().unwrap_or_default().trim();
        if raw.is_empty() {
            return Err(PostError::MissingExternalId);
        }
        return ExternalId::parse(raw).map_err(|_| PostError::MalformedExternalId(raw.to_string()));
    }

    let detail = outcome
        .error
        .clone()
        .unwrap_or_else(|| "poster reported failure without detail".to_string());
    let lowered = detail.to_ascii_lowercase();
    let mentions = |markers: &[&str]| markers.iter().any(|marker| lowered.contains(marker));

    if mentions(AUTHORIZATION_MARKERS) {
        Err(PostError::Unauthorized(detail))
    } else if mentions(RATE_LIMIT_MARKERS) {
        Err(PostError::RateLimited(detail))
    } else if mentions(TIMEOUT_MARKERS) {
        Err(PostError::Timeout(detail))
    } else if mentions(SESSION_MARKERS) {
        Err(PostError::Session(detail))
    } else {
        Err(PostError::Rejected(detail))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_additional_attempts: usize,
    pub standard_backoff_step_ms: u64,
    pub rate_limit_delays_ms: Vec<u64>,
    pub rate_limit_jitter_ratio: f64,
    pub rate_limit_floor_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_additional_attempts: 2,
            standard_backoff_step_ms: 2_000,
            rate_limit_delays_ms: vec![30_000, 60_000, 120_000],
            rate_limit_jitter_ratio: 0.3,
            rate_limit_floor_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    pub fn max_total_attempts(&self) -> usize {
        self.max_additional_attempts.saturating_add(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStep {
    RetryAfter(Duration),
    GiveUp,
}

/// Decides what follows failed attempt number `attempt` (1-based).
pub fn next_step(policy: &RetryPolicy, attempt: usize, error: &PostError, seed: &str) -> RetryStep {
    if !error.is_recoverable() || attempt > policy.max_additional_attempts {
        return RetryStep::GiveUp;
    }
    let delay_ms = match error {
        PostError::RateLimited(_) => rate_limit_delay_ms(policy, attempt, seed),
        _ => policy
            .standard_backoff_step_ms
            .saturating_mul(u64::try_from(attempt).unwrap_or(u64::MAX)),
    };
    RetryStep::RetryAfter(Duration::from_millis(delay_ms))
}

/// Rate-limit delay for `attempt`, widened by deterministic jitter and floored.
pub fn rate_limit_delay_ms(policy: &RetryPolicy, attempt: usize, seed: &str) -> u64 {
    let index = attempt.saturating_sub(1);
    let base = policy
        .rate_limit_delays_ms
        .get(index)
        .or_else(|| policy.rate_limit_delays_ms.last())
        .copied()
        .unwrap_or(policy.rate_limit_floor_ms);

    let ratio = policy.rate_limit_jitter_ratio.clamp(0.0, 1.0);
    let width = (base as f64 * ratio).round() as u64;
    let delay = if width == 0 {
        base
    } else {
        let mut hasher = Sha256::new();
        hasher.update(seed.as_bytes());
        hasher.update(attempt.to_le_bytes());
        let digest = hasher.finalize();
        let mut seed_bytes = [0_u8; 8];
        seed_bytes.copy_from_slice(&digest[..8]);
        let offset = u64::from_le_bytes(seed_bytes) % width.saturating_mul(2).saturating_add(1);
        base.saturating_sub(width).saturating_add(offset)
    };
    delay.max(policy.rate_limit_floor_ms)
}

/// Result of a retried operation and how many attempts it took.
#[derive(Debug)]
pub struct RetryRun<T> {
    pub result: Result<T, PostError>,
    pub attempts: usize,
}

#[derive(Debug, Clone)]
pub struct RetryController {
    policy: RetryPolicy,
    metrics: Arc<PublishMetrics>,
}

impl RetryController {
    pub fn new(policy: RetryPolicy, metrics: Arc<PublishMetrics>) -> Self {
        Self { policy, metrics }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Runs `operation` until it succeeds, fails fatally, or the budget is spent.
    ///
    /// `operation` receives the 1-based attempt number and must acquire its own
    /// session for each attempt. Exhausting the budget on a recoverable error
    /// returns [`PostError::BudgetExhausted`] wrapping the last error.
    pub async fn run<T, Op, Fut>(&self, seed: &str, mut operation: Op) -> RetryRun<T>
    where
        Op: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T, PostError>>,
    {
        let mut attempt = 0_usize;
        loop {
            attempt = attempt.saturating_add(1);
            let error = match operation(attempt).await {
                Ok(value) => {
                    return RetryRun {
                        result: Ok(value),
                        attempts: attempt,
                    }
                }
                Err(error) => error,
            };

            match next_step(&self.policy, attempt, &error, seed) {
                RetryStep::RetryAfter(delay) => {
                    self.metrics.record_retry_scheduled();
                    tracing::debug!(
                        seed,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        reason_code = error.reason_code(),
                        "scheduling publish retry"
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
                RetryStep::GiveUp => {
                    let error = if error.is_recoverable() {
                        PostError::BudgetExhausted {
                            attempts: attempt,
                            last: Box::new(error),
                        }
                    } else {
                        error
                    };
                    return RetryRun {
                        result: Err(error),
                        attempts: attempt,
                    };
                }
            }
        }
    }
}
