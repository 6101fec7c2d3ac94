//! Guard capabilities authorizing a single publish run.
//!
//! A [`Guard`] can only be minted by [`GuardIssuer::issue`]; its fields are private
//! and it is neither `Clone` nor constructible elsewhere. Verification checks
//! issuer identity and a per-issuer nonce, which makes a guard a tagged
//! capability rather than a cryptographic token.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use xpost_core::{
    is_older_than_ttl, lock_or_recover, system_clock, ClockFn, GuardRejectionRecord,
    PublishMetrics,
};

pub const DEFAULT_GUARD_TTL_MS: u64 = 60_000;

const UNKNOWN_CALLER: &str = "unknown";

/// Operator switches that stop publishing regardless of guard validity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KillSwitches {
    pub disable_all_posting: bool,
    pub disable_reply_posting: bool,
    pub drain_mode: bool,
}

impl KillSwitches {
    /// Name of the first switch blocking `operation`, if any.
    pub fn blocking_switch(&self, operation: GuardOperation) -> Option<&'static str> {
        if self.disable_all_posting {
            return Some("disable_all_posting");
        }
        if self.drain_mode {
            return Some("drain_mode");
        }
        if self.disable_reply_posting && operation == GuardOperation::PostReply {
            return Some("disable_reply_posting");
        }
        None
    }
}

/// Publish operation a guard is being verified for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardOperation {
    PostSingle,
    PostThread,
    PostReply,
}

impl GuardOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PostSingle => "post_single",
            Self::PostThread => "post_thread",
            Self::PostReply => "post_reply",
        }
    }
}

/// Typed reason a guard was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GuardRejection {
    #[error("kill switch '{switch}' is active")]
    KillSwitch { switch: &'static str },
    #[error("no guard was presented")]
    Missing,
    #[error("guard was not issued by this issuer")]
    Forged,
    #[error("guard was already consumed by another run")]
    AlreadyConsumed,
    #[error("guard was issued for decision '{presented}'")]
    DecisionMismatch { presented: String },
    #[error("guard expired: age {age_ms}ms exceeds ttl {ttl_ms}ms")]
    Expired { age_ms: u64, ttl_ms: u64 },
}

impl GuardRejection {
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::KillSwitch { .. } => "kill_switch",
            Self::Missing => "guard_missing",
            Self::Forged => "guard_forged",
            Self::AlreadyConsumed | Self::DecisionMismatch { .. } => "guard_invalid",
            Self::Expired { .. } => "guard_expired",
        }
    }

    /// Ledger skip reason: kill switches block, every other rejection fails.
    pub fn skip_reason(&self) -> String {
        match self {
            Self::KillSwitch { switch } => format!("kill_switch:{switch}"),
            other => other.reason_code().to_string(),
        }
    }

    pub fn is_kill_switch(&self) -> bool {
        matches!(self, Self::KillSwitch { .. })
    }
}

#[derive(Debug)]
struct IssuerIdentity;

/// Capability authorizing one publish run for one decision.
#[derive(Debug)]
pub struct Guard {
    decision_id: String,
    pipeline_source: String,
    job_run_id: String,
    issued_at_ms: u64,
    permit_id: Option<String>,
    issuer: Arc<IssuerIdentity>,
    nonce: u64,
}

impl Guard {
    pub fn decision_id(&self) -> &str {
        &self.decision_id
    }

    pub fn pipeline_source(&self) -> &str {
        &self.pipeline_source
    }

    pub fn job_run_id(&self) -> &str {
        &self.job_run_id
    }

    pub fn issued_at_ms(&self) -> u64 {
        self.issued_at_ms
    }

    pub fn permit_id(&self) -> Option<&str> {
        self.permit_id.as_deref()
    }

    /// Attaches the permit once it exists. Later calls keep the first id.
    pub fn attach_permit(&mut self, permit_id: impl Into<String>) {
        if self.permit_id.is_none() {
            self.permit_id = Some(permit_id.into());
        }
    }

    fn caller(&self) -> String {
        match (self.pipeline_source.is_empty(), self.job_run_id.is_empty()) {
            (true, true) => UNKNOWN_CALLER.to_string(),
            (false, true) => self.pipeline_source.clone(),
            (true, false) => self.job_run_id.clone(),
            (false, false) => format!("{}/{}", self.pipeline_source, self.job_run_id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardIssuerConfig {
    pub ttl_ms: u64,
    pub kill_switches: KillSwitches,
    /// Test-only override that accepts guards without checking them.
    pub test_bypass: bool,
}

impl Default for GuardIssuerConfig {
    fn default() -> Self {
        Self {
            ttl_ms: DEFAULT_GUARD_TTL_MS,
            kill_switches: KillSwitches::default(),
            test_bypass: false,
        }
    }
}

/// Nonces keyed to their guard's issue time. Entries past the TTL are pruned;
/// an expired guard is rejected on its timestamp alone.
#[derive(Debug, Default)]
struct NonceLedger {
    outstanding: HashMap<u64, u64>,
    consumed: HashMap<u64, u64>,
}

impl NonceLedger {
    fn prune(&mut self, now_ms: u64, ttl_ms: u64) {
        self.outstanding
            .retain(|_, issued_at_ms| !is_older_than_ttl(*issued_at_ms, now_ms, ttl_ms));
        self.consumed
            .retain(|_, issued_at_ms| !is_older_than_ttl(*issued_at_ms, now_ms, ttl_ms));
    }
}

/// Mints and verifies guards; each instance is its own trust domain.
pub struct GuardIssuer {
    identity: Arc<IssuerIdentity>,
    ttl_ms: u64,
    test_bypass: bool,
    kill_switches: Mutex<KillSwitches>,
    next_nonce: AtomicU64,
    nonces: Mutex<NonceLedger>,
    metrics: Arc<PublishMetrics>,
    clock: ClockFn,
}

impl std::fmt::Debug for GuardIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardIssuer")
            .field("ttl_ms", &self.ttl_ms)
            .field("test_bypass", &self.test_bypass)
            .field("kill_switches", &*lock_or_recover(&self.kill_switches))
            .finish()
    }
}

impl GuardIssuer {
    pub fn new(config: GuardIssuerConfig, metrics: Arc<PublishMetrics>) -> Self {
        Self::with_clock(config, metrics, system_clock())
    }

    pub fn with_clock(
        config: GuardIssuerConfig,
        metrics: Arc<PublishMetrics>,
        clock: ClockFn,
    ) -> Self {
        Self {
            identity: Arc::new(IssuerIdentity),
            ttl_ms: config.ttl_ms,
            test_bypass: config.test_bypass,
            kill_switches: Mutex::new(config.kill_switches),
            next_nonce: AtomicU64::new(1),
            nonces: Mutex::new(NonceLedger::default()),
            metrics,
            clock,
        }
    }

    pub fn ttl_ms(&self) -> u64 {
        self.ttl_ms
    }

    pub fn kill_switches(&self) -> KillSwitches {
        *lock_or_recover(&self.kill_switches)
    }

    pub fn set_kill_switches(&self, switches: KillSwitches) {
        *lock_or_recover(&self.kill_switches) = switches;
    }

    /// Mints a guard stamped with the current time. Never fails.
    pub fn issue(&self, decision_id: &str, pipeline_source: &str, job_run_id: &str) -> Guard {
        let nonce = self.next_nonce.fetch_add(1, Ordering::Relaxed);
        let issued_at_ms = (self.clock)();
        {
            let mut nonces = lock_or_recover(&self.nonces);
            nonces.prune(issued_at_ms, self.ttl_ms);
            nonces.outstanding.insert(nonce, issued_at_ms);
        }
        Guard {
            decision_id: decision_id.to_string(),
            pipeline_source: pipeline_source.to_string(),
            job_run_id: job_run_id.to_string(),
            issued_at_ms,
            permit_id: None,
            issuer: Arc::clone(&self.identity),
            nonce,
        }
    }

    /// Verifies and consumes `guard` for `operation`.
    ///
    /// Checks run in order: kill switch, presence, issuer identity, decision, prior
    /// consumption, then TTL. Every rejection is counted and recorded with the
    /// best-effort caller identity.
    pub fn verify(
        &self,
        guard: Option<Guard>,
        operation: GuardOperation,
        decision_id: &str,
    ) -> Result<Guard, GuardRejection> {
        let caller = guard
            .as_ref()
            .map(Guard::caller)
            .unwrap_or_else(|| UNKNOWN_CALLER.to_string());

        if let Some(switch) = self.kill_switches().blocking_switch(operation) {
            return Err(self.reject(
                GuardRejection::KillSwitch { switch },
                operation,
                &caller,
                decision_id,
            ));
        }

        if self.test_bypass {
            return Ok(self.bypass(guard, operation, &caller, decision_id));
        }

        let Some(guard) = guard else {
            return Err(self.reject(GuardRejection::Missing, operation, &caller, decision_id));
        };

        if !Arc::ptr_eq(&guard.issuer, &self.identity) {
            return Err(self.reject(GuardRejection::Forged, operation, &caller, decision_id));
        }

        if guard.decision_id != decision_id {
            let presented = guard.decision_id.clone();
            return Err(self.reject(
                GuardRejection::DecisionMismatch { presented },
                operation,
                &caller,
                decision_id,
            ));
        }

        let now_ms = (self.clock)();
        let expired = is_older_than_ttl(guard.issued_at_ms, now_ms, self.ttl_ms);
        {
            let mut nonces = lock_or_recover(&self.nonces);
            nonces.prune(now_ms, self.ttl_ms);
            if nonces.consumed.contains_key(&guard.nonce) {
                drop(nonces);
                return Err(self.reject(
                    GuardRejection::AlreadyConsumed,
                    operation,
                    &caller,
                    decision_id,
                ));
            }
            match nonces.outstanding.remove(&guard.nonce) {
                Some(issued_at_ms) => {
                    nonces.consumed.insert(guard.nonce, issued_at_ms);
                }
                // Pruned nonces belong to expired guards; the TTL check rejects them.
                None if expired => {}
                None => {
                    drop(nonces);
                    return Err(self.reject(
                        GuardRejection::Forged,
                        operation,
                        &caller,
                        decision_id,
                    ));
                }
            }
        }

        if expired {
            return Err(self.reject(
                GuardRejection::Expired {
                    age_ms: now_ms.saturating_sub(guard.issued_at_ms),
                    ttl_ms: self.ttl_ms,
                },
                operation,
                &caller,
                decision_id,
            ));
        }

        Ok(guard)
    }

    fn bypass(
        &self,
        guard: Option<Guard>,
        operation: GuardOperation,
        caller: &str,
        decision_id: &str,
    ) -> Guard {
        self.metrics.record_guard_test_bypass();
        tracing::warn!(
            target: "xpost::guard_bypass",
            operation = operation.as_str(),
            caller,
            decision_id,
            guard_present = guard.is_some(),
            "guard verification bypassed by test override"
        );
        match guard {
            Some(guard) => {
                let mut nonces = lock_or_recover(&self.nonces);
                nonces.outstanding.remove(&guard.nonce);
                nonces.consumed.insert(guard.nonce, guard.issued_at_ms);
                guard
            }
            None => self.issue(decision_id, "test_bypass", UNKNOWN_CALLER),
        }
    }

    fn reject(
        &self,
        rejection: GuardRejection,
        operation: GuardOperation,
        caller: &str,
        decision_id: &str,
    ) -> GuardRejection {
        self.metrics.record_guard_rejection(GuardRejectionRecord {
            operation: operation.as_str().to_string(),
            reason_code: rejection.reason_code().to_string(),
            caller: caller.to_string(),
            decision_id: Some(decision_id.to_string()),
            recorded_at_unix_ms: (self.clock)(),
        });
        tracing::warn!(
            target: "xpost::guard",
            operation = operation.as_str(),
            reason_code = rejection.reason_code(),
            caller,
            decision_id,
            "guard rejected: {rejection}"
        );
        rejection
    }
}
