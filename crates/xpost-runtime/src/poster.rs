//! Contracts for the external publish action.
//!
//! Implementations drive the platform UI inside a pooled session. They make one
//! attempt per call and never retry; idempotency belongs to the coordinator.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use xpost_types::ExternalId;

/// One publish attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostRequest {
    pub decision_id: String,
    pub content: String,
    /// Item to reply to; `None` publishes a standalone post.
    pub reply_to: Option<ExternalId>,
}

/// Raw result reported by a [`Poster`]; classified by [`crate::classify_outcome`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostOutcome {
    pub success: bool,
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl PostOutcome {
    pub fn posted(external_id: impl Into<String>) -> Self {
        Self {
            success: true,
            external_id: Some(external_id.into()),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            external_id: None,
            error: Some(error.into()),
        }
    }
}

#[async_trait]
pub trait Poster: Send + Sync {
    type Session: Send;

    async fn submit(&self, session: &mut Self::Session, request: &PostRequest) -> PostOutcome;
}

/// All segments of a thread, staged together in one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadRequest {
    pub decision_id: String,
    pub segments: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ComposerOutcome {
    /// The thread was submitted. Ids are whatever could be captured, in order.
    Posted { external_ids: Vec<String> },
    /// Staging failed before submission; nothing was published.
    Abandoned { staged_segments: usize, error: String },
}

/// Optional capability that publishes a whole thread as one unit.
#[async_trait]
pub trait ThreadComposer: Send + Sync {
    type Session: Send;

    async fn compose(&self, session: &mut Self::Session, request: &ThreadRequest)
        -> ComposerOutcome;
}
