//! Best-effort audit sinks. Emission never blocks or fails the publish path.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use xpost_core::{lock_or_recover, AuditLogRotationPolicy, AuditLogWriter};
use xpost_types::AuditEvent;

pub trait AuditSink: Send + Sync {
    fn emit(&self, event: &AuditEvent);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAuditSink;

impl AuditSink for NoopAuditSink {
    fn emit(&self, _event: &AuditEvent) {}
}

/// Keeps emitted events in memory; used by tests and the replay harness.
#[derive(Debug, Default)]
pub struct InMemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        lock_or_recover(&self.events).clone()
    }
}

impl AuditSink for InMemoryAuditSink {
    fn emit(&self, event: &AuditEvent) {
        lock_or_recover(&self.events).push(event.clone());
    }
}

type SharedSender = Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>;

/// Appends NDJSON audit records from a background task.
#[derive(Clone)]
pub struct JsonlAuditSink {
    path: PathBuf,
    sender: SharedSender,
}

/// Owns the background writer of a [`JsonlAuditSink`].
pub struct AuditWriterHandle {
    sender: SharedSender,
    task: JoinHandle<usize>,
}

impl JsonlAuditSink {
    /// Spawns the writer task. Must be called inside a tokio runtime.
    pub fn spawn(
        path: impl Into<PathBuf>,
        policy: AuditLogRotationPolicy,
    ) -> (Self, AuditWriterHandle) {
        let path = path.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let writer_path = path.clone();
        let task = tokio::spawn(async move {
            let mut written = 0_usize;
            let mut writer: Option<AuditLogWriter> = None;
            while let Some(line) = rx.recv().await {
                let appended = match writer.as_mut() {
                    Some(writer) => writer.append(&line),
                    None => AuditLogWriter::open(&writer_path, policy).and_then(|opened| {
                        writer.insert(opened).append(&line)
                    }),
                };
                match appended {
                    Ok(()) => written = written.saturating_add(1),
                    Err(error) => tracing::warn!(
                        path = %writer_path.display(),
                        "failed to append audit record: {error:#}"
                    ),
                }
            }
            written
        });
        let sender = Arc::new(Mutex::new(Some(tx)));
        (
            Self {
                path,
                sender: Arc::clone(&sender),
            },
            AuditWriterHandle { sender, task },
        )
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditSink for JsonlAuditSink {
    fn emit(&self, event: &AuditEvent) {
        let line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(error) => {
                tracing::warn!(
                    decision_id = event.decision_id.as_str(),
                    "failed to encode audit event: {error}"
                );
                return;
            }
        };
        let sender = lock_or_recover(&self.sender);
        match sender.as_ref() {
            Some(sender) if sender.send(line).is_ok() => {}
            _ => tracing::debug!(
                decision_id = event.decision_id.as_str(),
                event_type = event.event_type.as_str(),
                "audit writer closed; dropping event"
            ),
        }
    }
}

impl AuditWriterHandle {
    /// Closes the channel and waits for queued records to be written.
    ///
    /// Returns how many records the writer appended.
    pub async fn finish(self) -> Result<usize> {
        lock_or_recover(&self.sender).take();
        self.task.await.context("audit writer task failed")
    }
}
