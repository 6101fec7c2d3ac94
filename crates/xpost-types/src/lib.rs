//! Shared data types for the xpost publish pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Upper bound on external id length; platform ids are 64-bit decimal strings.
pub const EXTERNAL_ID_MAX_LEN: usize = 32;

/// Error returned when a status transition is invalid.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StatusTransitionError {
    #[error("invalid {kind} transition: {from:?} -> {to:?}")]
    Invalid {
        kind: &'static str,
        from: String,
        to: String,
    },
}

/// Error returned when a raw string is not a well-formed external id.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExternalIdError {
    #[error("external id is empty")]
    Empty,
    #[error("external id '{0}' is not a numeric string")]
    NonNumeric(String),
    #[error("external id is {0} characters long (max {EXTERNAL_ID_MAX_LEN})")]
    TooLong(usize),
}

/// Validated identifier assigned by the platform to a published item.
///
/// Construction always goes through [`ExternalId::parse`], so holding one means
/// the value is a non-empty ASCII decimal string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ExternalId(String);

impl ExternalId {
    pub fn parse(raw: &str) -> Result<Self, ExternalIdError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ExternalIdError::Empty);
        }
        if trimmed.len() > EXTERNAL_ID_MAX_LEN {
            return Err(ExternalIdError::TooLong(trimmed.len()));
        }
        if !trimmed.bytes().all(|byte| byte.is_ascii_digit()) {
            return Err(ExternalIdError::NonNumeric(trimmed.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for ExternalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ExternalId {
    type Error = ExternalIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ExternalId> for String {
    fn from(value: ExternalId) -> Self {
        value.0
    }
}

/// Shape of a publish decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    Single,
    Thread,
    Reply,
}

impl DecisionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Thread => "thread",
            Self::Reply => "reply",
        }
    }

    /// Pool priority used when a decision does not carry its own.
    pub fn default_priority(self) -> u8 {
        match self {
            Self::Reply => 10,
            Self::Single => 20,
            Self::Thread => 30,
        }
    }
}

/// Unit of content scheduled for publishing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub id: String,
    pub kind: DecisionKind,
    pub content: String,
    /// Ordered thread parts; empty for single and reply decisions.
    #[serde(default)]
    pub segments: Vec<String>,
    #[serde(default)]
    pub target_id: Option<String>,
    #[serde(default)]
    pub target_author: Option<String>,
    #[serde(default)]
    pub root_id: Option<String>,
    #[serde(default)]
    pub priority: Option<u8>,
}

impl Decision {
    pub fn single(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: DecisionKind::Single,
            content: content.into(),
            segments: Vec::new(),
            target_id: None,
            target_author: None,
            root_id: None,
            priority: None,
        }
    }

    pub fn reply(
        id: impl Into<String>,
        content: impl Into<String>,
        target_id: impl Into<String>,
        target_author: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            kind: DecisionKind::Reply,
            content: content.into(),
            segments: Vec::new(),
            target_id: Some(target_id.into()),
            target_author: Some(target_author.into()),
            root_id: None,
            priority: None,
        }
    }

    /// Builds a thread decision; `content` is the segments joined by blank lines.
    pub fn thread<I, S>(id: impl Into<String>, segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments = segments.into_iter().map(Into::into).collect::<Vec<_>>();
        Self {
            id: id.into(),
            kind: DecisionKind::Thread,
            content: segments.join("\n\n"),
            segments,
            target_id: None,
            target_author: None,
            root_id: None,
            priority: None,
        }
    }

    pub fn with_root_id(mut self, root_id: impl Into<String>) -> Self {
        self.root_id = Some(root_id.into());
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn effective_priority(&self) -> u8 {
        self.priority.unwrap_or_else(|| self.kind.default_priority())
    }

    /// Segments to publish, treating a thread without explicit parts as one segment.
    pub fn thread_segments(&self) -> Vec<String> {
        if self.segments.is_empty() {
            vec![self.content.clone()]
        } else {
            self.segments.clone()
        }
    }
}

/// Lifecycle state of an idempotency permit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermitStatus {
    Pending,
    Approved,
    Used,
    Failed,
}

impl PermitStatus {
    /// Returns true when this status can transition to `next`.
    pub fn can_transition_to(self, next: Self) -> bool {
        if self == next {
            return true;
        }

        matches!(
            (self, next),
            (Self::Pending, Self::Approved)
                | (Self::Pending, Self::Failed)
                | (Self::Approved, Self::Used)
                | (Self::Approved, Self::Failed)
        )
    }

    /// Returns an error if transitioning to `next` is not allowed.
    pub fn ensure_transition(self, next: Self) -> Result<(), StatusTransitionError> {
        if self.can_transition_to(next) {
            return Ok(());
        }

        Err(StatusTransitionError::Invalid {
            kind: "permit_status",
            from: format!("{self:?}"),
            to: format!("{next:?}"),
        })
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Used | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Used => "used",
            Self::Failed => "failed",
        }
    }
}

/// Idempotency record guarding one decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Permit {
    pub permit_id: String,
    pub decision_id: String,
    pub status: PermitStatus,
    pub external_id: Option<ExternalId>,
    pub reason: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Permit {
    /// Creates a pending permit whose id is derived from the decision id.
    pub fn new(decision_id: impl Into<String>, metadata: HashMap<String, Value>) -> Self {
        let decision_id = decision_id.into();
        let now = Utc::now();
        Self {
            permit_id: permit_id_for_decision(&decision_id),
            decision_id,
            status: PermitStatus::Pending,
            external_id: None,
            reason: None,
            metadata,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Deterministic permit id so every backend mints the same id for a decision.
pub fn permit_id_for_decision(decision_id: &str) -> String {
    let digest = Sha256::digest(decision_id.as_bytes());
    let hex = digest
        .iter()
        .take(12)
        .map(|byte| format!("{byte:02x}"))
        .collect::<String>();
    format!("permit-{hex}")
}

/// Durable publish state of a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerStatus {
    PostingAttempt,
    Posted,
    Failed,
    Blocked,
}

impl LedgerStatus {
    /// Returns true when this status can transition to `next`.
    pub fn can_transition_to(self, next: Self) -> bool {
        if self == next {
            return true;
        }

        matches!(
            (self, next),
            (Self::PostingAttempt, Self::Posted)
                | (Self::PostingAttempt, Self::Failed)
                | (Self::PostingAttempt, Self::Blocked)
        )
    }

    /// Returns an error if transitioning to `next` is not allowed.
    pub fn ensure_transition(self, next: Self) -> Result<(), StatusTransitionError> {
        if self.can_transition_to(next) {
            return Ok(());
        }

        Err(StatusTransitionError::Invalid {
            kind: "ledger_status",
            from: format!("{self:?}"),
            to: format!("{next:?}"),
        })
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::PostingAttempt)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::PostingAttempt => "posting_attempt",
            Self::Posted => "posted",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
        }
    }
}

/// Persisted row of the publish ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerRow {
    pub decision_id: String,
    pub status: LedgerStatus,
    pub external_id: Option<ExternalId>,
    pub skip_reason: Option<String>,
    pub permit_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub posted_at: Option<DateTime<Utc>>,
}

impl LedgerRow {
    pub fn posting_attempt(decision_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            decision_id: decision_id.into(),
            status: LedgerStatus::PostingAttempt,
            external_id: None,
            skip_reason: None,
            permit_id: None,
            created_at: now,
            updated_at: now,
            posted_at: None,
        }
    }
}

/// Filter used when listing ledger rows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerQuery {
    pub statuses: Option<Vec<LedgerStatus>>,
    pub decision_ids: Option<Vec<String>>,
    pub updated_before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl LedgerQuery {
    pub fn matches(&self, row: &LedgerRow) -> bool {
        if let Some(statuses) = &self.statuses {
            if !statuses.contains(&row.status) {
                return false;
            }
        }
        if let Some(ids) = &self.decision_ids {
            if !ids.iter().any(|id| id == &row.decision_id) {
                return false;
            }
        }
        if let Some(cutoff) = self.updated_before {
            if row.updated_at >= cutoff {
                return false;
            }
        }
        true
    }
}

/// Progress of one part of a thread publication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentState {
    Pending,
    Typed,
    Verified,
    Posted,
}

impl SegmentState {
    pub fn can_transition_to(self, next: Self) -> bool {
        if self == next {
            return true;
        }

        matches!(
            (self, next),
            (Self::Pending, Self::Typed)
                | (Self::Typed, Self::Verified)
                | (Self::Verified, Self::Posted)
                | (Self::Pending, Self::Posted)
        )
    }

    pub fn ensure_transition(self, next: Self) -> Result<(), StatusTransitionError> {
        if self.can_transition_to(next) {
            return Ok(());
        }

        Err(StatusTransitionError::Invalid {
            kind: "segment_state",
            from: format!("{self:?}"),
            to: format!("{next:?}"),
        })
    }
}

/// One part of a multi-segment decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadSegment {
    pub index: usize,
    pub content: String,
    pub state: SegmentState,
    pub external_id: Option<ExternalId>,
    pub reply_to: Option<ExternalId>,
    pub failure: Option<String>,
}

impl ThreadSegment {
    pub fn new(index: usize, content: impl Into<String>) -> Self {
        Self {
            index,
            content: content.into(),
            state: SegmentState::Pending,
            external_id: None,
            reply_to: None,
            failure: None,
        }
    }
}

/// Audit event kinds; the pair `(event_type, decision_id)` is unique.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEventType {
    PostSuccess,
    PostFailed,
    PostBlocked,
    ReconciliationNeeded,
}

impl AuditEventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PostSuccess => "POST_SUCCESS",
            Self::PostFailed => "POST_FAILED",
            Self::PostBlocked => "POST_BLOCKED",
            Self::ReconciliationNeeded => "RECONCILIATION_NEEDED",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "POST_SUCCESS" => Some(Self::PostSuccess),
            "POST_FAILED" => Some(Self::PostFailed),
            "POST_BLOCKED" => Some(Self::PostBlocked),
            "RECONCILIATION_NEEDED" => Some(Self::ReconciliationNeeded),
            _ => None,
        }
    }
}

/// Append-only record of a publish outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_type: AuditEventType,
    pub decision_id: String,
    pub external_id: Option<ExternalId>,
    #[serde(default)]
    pub detail: Value,
    pub recorded_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(event_type: AuditEventType, decision_id: impl Into<String>) -> Self {
        Self {
            event_type,
            decision_id: decision_id.into(),
            external_id: None,
            detail: Value::Null,
            recorded_at: Utc::now(),
        }
    }

    pub fn with_external_id(mut self, external_id: ExternalId) -> Self {
        self.external_id = Some(external_id);
        self
    }

    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = detail;
        self
    }
}
