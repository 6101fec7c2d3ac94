//! Reply gates evaluated immediately before an irreversible publish.

use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;
use xpost_types::{Decision, DecisionKind, ExternalId};

const THREAD_MARKER_LITERALS: &[&str] = &[
    "🧵",
    "(cont)",
    "(cont.)",
    "(continued)",
    "continued below",
    "[thread]",
];

/// Gate violation; maps to a ledger `blocked` row and is never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GateViolation {
    #[error("reply has no target")]
    MissingReplyTarget,
    #[error("reply target '{0}' is not a valid external id")]
    MalformedReplyTarget(String),
    #[error("reply content contains thread marker '{0}'")]
    ThreadMarkersInReply(String),
    #[error("reply target '{target}' is not the conversation root '{root}'")]
    NonRootReplyTarget { target: String, root: String },
    #[error("reply target author '{0}' is the publishing account")]
    SelfReply(String),
    #[error("no publishing account handle is configured; self-replies cannot be ruled out")]
    MissingAccountHandle,
}

impl GateViolation {
    pub fn skip_reason(&self) -> &'static str {
        match self {
            Self::MissingReplyTarget => "missing_reply_target",
            Self::MalformedReplyTarget(_) => "malformed_reply_target",
            Self::ThreadMarkersInReply(_) => "thread_markers_in_reply",
            Self::NonRootReplyTarget { .. } => "non_root_reply_target",
            Self::SelfReply(_) => "self_reply",
            Self::MissingAccountHandle => "missing_account_handle",
        }
    }
}

/// Runs the reply gates in order. Non-reply decisions pass trivially.
///
/// Returns the validated reply target.
pub fn check_reply_gates(
    decision: &Decision,
    account_handle: &str,
) -> Result<Option<ExternalId>, GateViolation> {
    if decision.kind != DecisionKind::Reply {
        return Ok(None);
    }

    let target = decision
        .target_id
        .as_deref()
        .map(str::trim)
        .filter(|target| !target.is_empty())
        .ok_or(GateViolation::MissingReplyTarget)?;
    let target_id = ExternalId::parse(target)
        .map_err(|_| GateViolation::MalformedReplyTarget(target.to_string()))?;

    if let Some(marker) = contains_thread_marker(&decision.content) {
        return Err(GateViolation::ThreadMarkersInReply(marker));
    }

    if let Some(root) = decision
        .root_id
        .as_deref()
        .map(str::trim)
        .filter(|root| !root.is_empty())
    {
        if root != target_id.as_str() {
            return Err(GateViolation::NonRootReplyTarget {
                target: target_id.to_string(),
                root: root.to_string(),
            });
        }
    }

    let account = normalize_handle(account_handle);
    if account.is_empty() {
        return Err(GateViolation::MissingAccountHandle);
    }
    if let Some(author) = decision.target_author.as_deref() {
        if normalize_handle(author) == account {
            return Err(GateViolation::SelfReply(author.to_string()));
        }
    }

    Ok(Some(target_id))
}

/// Returns the first thread or continuation marker found in `content`.
pub fn contains_thread_marker(content: &str) -> Option<String> {
    let lowered = content.to_lowercase();
    if let Some(literal) = THREAD_MARKER_LITERALS
        .iter()
        .find(|literal| lowered.contains(*literal))
    {
        return Some((*literal).to_string());
    }
    numbered_marker_regex()
        .and_then(|regex| regex.find(content))
        .map(|found| found.as_str().trim().to_string())
}

fn numbered_marker_regex() -> Option<&'static Regex> {
    static NUMBERED: OnceLock<Option<Regex>> = OnceLock::new();
    NUMBERED
        .get_or_init(|| {
            Regex::new(r"(?m)^\s*\d{1,2}\s?/\s?\d{0,2}(?:\s|$)").ok()
        })
        .as_ref()
}

fn normalize_handle(handle: &str) -> String {
    handle.trim().trim_start_matches('@').to_ascii_lowercase()
}
