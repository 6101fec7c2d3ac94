//! Foundational utilities shared across xpost crates.
//!
//! Provides clock helpers used for guard expiry, atomic file writes for harness
//! output, the rotating audit log writer, and the explicit metrics registry.

pub mod atomic_io;
pub mod audit_log;
pub mod metrics;
pub mod time_utils;

pub use atomic_io::write_text_atomic;
pub use audit_log::{rotated_audit_log_path, AuditLogRotationPolicy, AuditLogWriter};
pub use metrics::{lock_or_recover, GuardRejectionRecord, MetricsSnapshot, PublishMetrics};
pub use time_utils::{
    current_unix_timestamp, current_unix_timestamp_ms, is_older_than_ttl, system_clock, ClockFn,
};
