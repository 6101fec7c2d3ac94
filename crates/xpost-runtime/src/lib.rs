//! Exactly-once publish coordination.
//!
//! The [`ExecutionCoordinator`] drives a decision through prewrite, reply gates,
//! guard and permit verification, retried posting and the durable update.
//! Multi-segment decisions are delegated to the [`ThreadTransactionManager`].

pub mod audit;
pub mod config;
pub mod coordinator;
pub mod fixture;
pub mod gate;
pub mod poster;
pub mod reconcile;
pub mod retry;
pub mod thread;

pub use audit::{AuditSink, AuditWriterHandle, InMemoryAuditSink, JsonlAuditSink, NoopAuditSink};
pub use config::{PoolSettings, PublishConfig, ThreadSettings};
pub use coordinator::{
    CoordinatorSettings, CoordinatorStage, ExecutionCoordinator, PublishError, PublishOutcome,
    PublishReport,
};
pub use fixture::{
    replay_fixture, FixtureDecision, FixtureGuard, FixturePoster, FixtureSession,
    FixtureSessionFactory, PublishFixture, ReplayEntry, ReplaySummary,
};
pub use gate::{check_reply_gates, contains_thread_marker, GateViolation};
pub use poster::{ComposerOutcome, PostOutcome, PostRequest, Poster, ThreadComposer, ThreadRequest};
pub use reconcile::{
    audit_ledger, repair_ledger, ReconciliationReport, RepairAction, UnbackedPost, UnrecordedPost,
};
pub use retry::{
    classify_outcome, next_step, rate_limit_delay_ms, PostError, RetryController, RetryPolicy,
    RetryRun, RetryStep,
};
pub use thread::{ThreadMode, ThreadPublication, ThreadTransactionManager};
