//! Explicit counters shared by the publish pipeline.
//!
//! A single `PublishMetrics` is created by the host and handed to each component
//! as an `Arc`. Nothing in this crate keeps process-global state; tests build a
//! fresh registry or call [`PublishMetrics::reset`] between cases.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::Serialize;

const DEFAULT_REJECTION_LOG_CAPACITY: usize = 64;

/// One rejected guard verification, kept for audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GuardRejectionRecord {
    pub operation: String,
    pub reason_code: String,
    pub caller: String,
    pub decision_id: Option<String>,
    pub recorded_at_unix_ms: u64,
}

/// Serializable point-in-time copy of every counter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub guard_rejections: u64,
    pub guard_rejections_by_reason: BTreeMap<String, u64>,
    pub guard_test_bypasses: u64,
    pub prewrite_failures: u64,
    pub gate_blocks: u64,
    pub poster_invocations: u64,
    pub retries_scheduled: u64,
    pub pool_resets: u64,
    pub reconciliation_needed: u64,
    pub audit_duplicates_suppressed: u64,
    pub decisions_posted: u64,
    pub decisions_failed: u64,
    pub recent_guard_rejections: Vec<GuardRejectionRecord>,
}

#[derive(Debug)]
pub struct PublishMetrics {
    guard_rejections: AtomicU64,
    guard_test_bypasses: AtomicU64,
    prewrite_failures: AtomicU64,
    gate_blocks: AtomicU64,
    poster_invocations: AtomicU64,
    retries_scheduled: AtomicU64,
    pool_resets: AtomicU64,
    reconciliation_needed: AtomicU64,
    audit_duplicates_suppressed: AtomicU64,
    decisions_posted: AtomicU64,
    decisions_failed: AtomicU64,
    rejections_by_reason: Mutex<BTreeMap<String, u64>>,
    rejection_log: Mutex<VecDeque<GuardRejectionRecord>>,
    rejection_log_capacity: usize,
}

impl Default for PublishMetrics {
    fn default() -> Self {
        Self::with_rejection_log_capacity(DEFAULT_REJECTION_LOG_CAPACITY)
    }
}

impl PublishMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rejection_log_capacity(capacity: usize) -> Self {
        Self {
            guard_rejections: AtomicU64::new(0),
            guard_test_bypasses: AtomicU64::new(0),
            prewrite_failures: AtomicU64::new(0),
            gate_blocks: AtomicU64::new(0),
            poster_invocations: AtomicU64::new(0),
            retries_scheduled: AtomicU64::new(0),
            pool_resets: AtomicU64::new(0),
            reconciliation_needed: AtomicU64::new(0),
            audit_duplicates_suppressed: AtomicU64::new(0),
            decisions_posted: AtomicU64::new(0),
            decisions_failed: AtomicU64::new(0),
            rejections_by_reason: Mutex::new(BTreeMap::new()),
            rejection_log: Mutex::new(VecDeque::new()),
            rejection_log_capacity: capacity.max(1),
        }
    }

    /// Counts a guard rejection and keeps the caller identity in the bounded log.
    pub fn record_guard_rejection(&self, record: GuardRejectionRecord) {
        self.guard_rejections.fetch_add(1, Ordering::Relaxed);
        {
            let mut by_reason = lock_or_recover(&self.rejections_by_reason);
            *by_reason.entry(record.reason_code.clone()).or_insert(0) += 1;
        }
        let mut log = lock_or_recover(&self.rejection_log);
        while log.len() >= self.rejection_log_capacity {
            log.pop_front();
        }
        log.push_back(record);
    }

    pub fn record_guard_test_bypass(&self) {
        self.guard_test_bypasses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_prewrite_failure(&self) {
        self.prewrite_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_gate_block(&self) {
        self.gate_blocks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_poster_invocation(&self) {
        self.poster_invocations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry_scheduled(&self) {
        self.retries_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pool_reset(&self) {
        self.pool_resets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconciliation_needed(&self) {
        self.reconciliation_needed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_audit_duplicate_suppressed(&self) {
        self.audit_duplicates_suppressed
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decision_posted(&self) {
        self.decisions_posted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decision_failed(&self) {
        self.decisions_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn poster_invocations(&self) -> u64 {
        self.poster_invocations.load(Ordering::Relaxed)
    }

    pub fn guard_rejections(&self) -> u64 {
        self.guard_rejections.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            guard_rejections: self.guard_rejections.load(Ordering::Relaxed),
            guard_rejections_by_reason: lock_or_recover(&self.rejections_by_reason).clone(),
            guard_test_bypasses: self.guard_test_bypasses.load(Ordering::Relaxed),
            prewrite_failures: self.prewrite_failures.load(Ordering::Relaxed),
            gate_blocks: self.gate_blocks.load(Ordering::Relaxed),
            poster_invocations: self.poster_invocations.load(Ordering::Relaxed),
            retries_scheduled: self.retries_scheduled.load(Ordering::Relaxed),
            pool_resets: self.pool_resets.load(Ordering::Relaxed),
            reconciliation_needed: self.reconciliation_needed.load(Ordering::Relaxed),
            audit_duplicates_suppressed: self.audit_duplicates_suppressed.load(Ordering::Relaxed),
            decisions_posted: self.decisions_posted.load(Ordering::Relaxed),
            decisions_failed: self.decisions_failed.load(Ordering::Relaxed),
            recent_guard_rejections: lock_or_recover(&self.rejection_log)
                .iter()
                .cloned()
                .collect(),
        }
    }

    /// Zeroes every counter. Intended for test boundaries only.
    pub fn reset(&self) {
        for counter in [
            &self.guard_rejections,
            &self.guard_test_bypasses,
            &self.prewrite_failures,
            &self.gate_blocks,
            &self.poster_invocations,
            &self.retries_scheduled,
            &self.pool_resets,
            &self.reconciliation_needed,
            &self.audit_duplicates_suppressed,
            &self.decisions_posted,
            &self.decisions_failed,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        lock_or_recover(&self.rejections_by_reason).clear();
        lock_or_recover(&self.rejection_log).clear();
    }
}

/// Locks `mutex`, recovering the inner value if a previous holder panicked.
pub fn lock_or_recover<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
