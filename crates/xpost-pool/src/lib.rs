//! Fixed-capacity pool of long-lived automation sessions.
//!
//! Waiters are served lowest priority value first, then in arrival order.
//! A [`Lease`] returns its slot on drop, so every exit path releases it.
//! Consecutive failed leases trip a circuit breaker that discards every
//! session; sessions are then recreated lazily on their next lease.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;
use xpost_core::{lock_or_recover, PublishMetrics};

#[cfg(test)]
mod tests;

/// Creates and disposes of the sessions a pool lends out.
#[async_trait]
pub trait SessionFactory: Send + Sync + 'static {
    type Session: Send + 'static;

    async fn create_session(&self, slot: usize) -> anyhow::Result<Self::Session>;

    /// Called for sessions the pool discards after a failure or reset.
    fn discard_session(&self, _slot: usize, _session: Self::Session) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CircuitBreakerConfig {
    pub enabled: bool,
    pub failure_threshold: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolConfig {
    pub capacity: usize,
    pub breaker: CircuitBreakerConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: 1,
            breaker: CircuitBreakerConfig::default(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("session pool capacity must be greater than zero")]
    ZeroCapacity,
    #[error("timed out after {waited_ms}ms waiting for a pooled session")]
    AcquireTimeout { waited_ms: u64 },
    #[error("session pool was shut down")]
    Closed,
    #[error("failed to start session for slot {slot}: {message}")]
    SessionStart { slot: usize, message: String },
}

/// Point-in-time view of pool occupancy and breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub capacity: usize,
    pub idle: usize,
    pub leased: usize,
    pub waiting: usize,
    pub consecutive_failures: usize,
    pub generation: u64,
}

struct Slot<S> {
    index: usize,
    session: Option<S>,
    generation: u64,
}

struct Waiter<S> {
    priority: u8,
    seq: u64,
    sender: oneshot::Sender<Slot<S>>,
}

impl<S> PartialEq for Waiter<S> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl<S> Eq for Waiter<S> {}

impl<S> PartialOrd for Waiter<S> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<S> Ord for Waiter<S> {
    // BinaryHeap pops the greatest element; invert so the lowest (priority, seq) wins.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct PoolState<S> {
    idle: Vec<Slot<S>>,
    waiters: BinaryHeap<Waiter<S>>,
    next_seq: u64,
    leased: usize,
    consecutive_failures: usize,
    generation: u64,
    closed: bool,
}

struct PoolShared<F: SessionFactory> {
    factory: F,
    config: PoolConfig,
    state: Mutex<PoolState<F::Session>>,
    metrics: Arc<PublishMetrics>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LeaseOutcome {
    Unreported,
    Succeeded,
    Failed,
}

impl<F: SessionFactory> PoolShared<F> {
    fn release(&self, slot: Slot<F::Session>, outcome: LeaseOutcome) {
        let mut discarded = Vec::new();
        {
            let mut state = lock_or_recover(&self.state);
            state.leased = state.leased.saturating_sub(1);

            let Slot {
                index,
                mut session,
                generation,
            } = slot;

            match outcome {
                LeaseOutcome::Succeeded => state.consecutive_failures = 0,
                LeaseOutcome::Failed => {
                    if let Some(session) = session.take() {
                        discarded.push((index, session));
                    }
                    state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                    let threshold = self.config.breaker.failure_threshold.max(1);
                    if self.config.breaker.enabled && state.consecutive_failures >= threshold {
                        self.trip_breaker(&mut state, &mut discarded);
                    }
                }
                LeaseOutcome::Unreported => {}
            }

            if generation < state.generation {
                if let Some(session) = session.take() {
                    discarded.push((index, session));
                }
            }

            let slot = Slot {
                index,
                session,
                generation: state.generation,
            };
            if state.closed {
                if let Some(session) = slot.session {
                    discarded.push((index, session));
                }
            } else {
                hand_off_locked(&mut state, slot);
            }
        }

        for (index, session) in discarded {
            self.factory.discard_session(index, session);
        }
    }

    fn trip_breaker(
        &self,
        state: &mut PoolState<F::Session>,
        discarded: &mut Vec<(usize, F::Session)>,
    ) {
        state.generation = state.generation.saturating_add(1);
        let failures = state.consecutive_failures;
        state.consecutive_failures = 0;
        let generation = state.generation;
        for slot in state.idle.iter_mut() {
            if let Some(session) = slot.session.take() {
                discarded.push((slot.index, session));
            }
            slot.generation = generation;
        }
        self.metrics.record_pool_reset();
        tracing::warn!(
            target: "xpost::pool",
            consecutive_failures = failures,
            generation,
            "session pool circuit breaker tripped; recreating all sessions"
        );
    }
}

fn hand_off_locked<S>(state: &mut PoolState<S>, mut slot: Slot<S>) {
    while let Some(waiter) = state.waiters.pop() {
        match waiter.sender.send(slot) {
            Ok(()) => {
                state.leased = state.leased.saturating_add(1);
                return;
            }
            Err(returned) => slot = returned,
        }
    }
    state.idle.push(slot);
}

/// Pending acquisition; returns a slot that was handed over after cancellation.
struct PendingAcquire<F: SessionFactory> {
    shared: Arc<PoolShared<F>>,
    receiver: Option<oneshot::Receiver<Slot<F::Session>>>,
}

impl<F: SessionFactory> Drop for PendingAcquire<F> {
    fn drop(&mut self) {
        let Some(mut receiver) = self.receiver.take() else {
            return;
        };
        receiver.close();
        if let Ok(slot) = receiver.try_recv() {
            self.shared.release(slot, LeaseOutcome::Unreported);
        }
    }
}

/// Slot handed to an acquirer whose session is still starting; returned to the
/// pool if the start is cancelled.
struct StartingSlot<F: SessionFactory> {
    shared: Arc<PoolShared<F>>,
    index: usize,
    generation: u64,
    armed: bool,
}

impl<F: SessionFactory> StartingSlot<F> {
    fn disarm(&mut self) -> Slot<F::Session> {
        self.armed = false;
        Slot {
            index: self.index,
            session: None,
            generation: self.generation,
        }
    }
}

impl<F: SessionFactory> Drop for StartingSlot<F> {
    fn drop(&mut self) {
        if self.armed {
            let slot = self.disarm();
            self.shared.release(slot, LeaseOutcome::Unreported);
        }
    }
}

enum Acquisition<F: SessionFactory> {
    Ready(Slot<F::Session>),
    Queued(PendingAcquire<F>),
}

/// Shared handle to a pool of sessions produced by `F`.
pub struct ResourcePool<F: SessionFactory> {
    shared: Arc<PoolShared<F>>,
}

impl<F: SessionFactory> Clone for ResourcePool<F> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<F: SessionFactory> ResourcePool<F> {
    pub fn new(
        factory: F,
        config: PoolConfig,
        metrics: Arc<PublishMetrics>,
    ) -> Result<Self, PoolError> {
        if config.capacity == 0 {
            return Err(PoolError::ZeroCapacity);
        }
        let idle = (0..config.capacity)
            .rev()
            .map(|index| Slot {
                index,
                session: None,
                generation: 0,
            })
            .collect();
        Ok(Self {
            shared: Arc::new(PoolShared {
                factory,
                config,
                state: Mutex::new(PoolState {
                    idle,
                    waiters: BinaryHeap::new(),
                    next_seq: 0,
                    leased: 0,
                    consecutive_failures: 0,
                    generation: 0,
                    closed: false,
                }),
                metrics,
            }),
        })
    }

    pub fn config(&self) -> PoolConfig {
        self.shared.config
    }

    pub fn factory(&self) -> &F {
        &self.shared.factory
    }

    /// Waits for a free slot. Lower `priority` values are served first.
    pub async fn acquire(&self, priority: u8) -> Result<Lease<F>, PoolError> {
        let acquisition = {
            let mut state = lock_or_recover(&self.shared.state);
            if state.closed {
                return Err(PoolError::Closed);
            }
            let ready = if state.waiters.is_empty() {
                state.idle.pop()
            } else {
                None
            };
            match ready {
                Some(slot) => {
                    state.leased = state.leased.saturating_add(1);
                    Acquisition::Ready(slot)
                }
                None => {
                    let (sender, receiver) = oneshot::channel();
                    let seq = state.next_seq;
                    state.next_seq = state.next_seq.saturating_add(1);
                    state.waiters.push(Waiter {
                        priority,
                        seq,
                        sender,
                    });
                    Acquisition::Queued(PendingAcquire {
                        shared: Arc::clone(&self.shared),
                        receiver: Some(receiver),
                    })
                }
            }
        };

        let slot = match acquisition {
            Acquisition::Ready(slot) => slot,
            Acquisition::Queued(mut pending) => {
                let slot = match pending.receiver.as_mut() {
                    Some(receiver) => receiver.await.map_err(|_| PoolError::Closed)?,
                    None => return Err(PoolError::Closed),
                };
                pending.receiver = None;
                slot
            }
        };
        self.prepare_lease(slot).await
    }

    pub async fn acquire_with_timeout(
        &self,
        priority: u8,
        timeout: Duration,
    ) -> Result<Lease<F>, PoolError> {
        match tokio::time::timeout(timeout, self.acquire(priority)).await {
            Ok(result) => result,
            Err(_) => Err(PoolError::AcquireTimeout {
                waited_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }

    /// Rejects queued and future acquisitions and discards idle sessions.
    pub fn shutdown(&self) {
        let (waiters, idle) = {
            let mut state = lock_or_recover(&self.shared.state);
            state.closed = true;
            (
                std::mem::take(&mut state.waiters),
                std::mem::take(&mut state.idle),
            )
        };
        drop(waiters);
        for slot in idle {
            if let Some(session) = slot.session {
                self.shared.factory.discard_session(slot.index, session);
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        let state = lock_or_recover(&self.shared.state);
        PoolStats {
            capacity: self.shared.config.capacity,
            idle: state.idle.len(),
            leased: state.leased,
            waiting: state.waiters.len(),
            consecutive_failures: state.consecutive_failures,
            generation: state.generation,
        }
    }

    async fn prepare_lease(&self, slot: Slot<F::Session>) -> Result<Lease<F>, PoolError> {
        let Slot {
            index,
            session,
            generation,
        } = slot;
        let session = match session {
            Some(session) => session,
            None => {
                let mut starting = StartingSlot {
                    shared: Arc::clone(&self.shared),
                    index,
                    generation,
                    armed: true,
                };
                let created = self.shared.factory.create_session(index).await;
                let slot = starting.disarm();
                match created {
                    Ok(session) => session,
                    Err(error) => {
                        self.shared.release(slot, LeaseOutcome::Failed);
                        return Err(PoolError::SessionStart {
                            slot: index,
                            message: error.to_string(),
                        });
                    }
                }
            }
        };
        Ok(Lease {
            shared: Arc::clone(&self.shared),
            index,
            generation,
            session: Some(session),
            outcome: LeaseOutcome::Unreported,
        })
    }
}

/// Exclusive loan of one pooled session, returned to the pool on drop.
pub struct Lease<F: SessionFactory> {
    shared: Arc<PoolShared<F>>,
    index: usize,
    generation: u64,
    session: Option<F::Session>,
    outcome: LeaseOutcome,
}

impl<F: SessionFactory> std::fmt::Debug for Lease<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("slot", &self.index)
            .field("generation", &self.generation)
            .field("outcome", &self.outcome)
            .finish()
    }
}

impl<F: SessionFactory> Lease<F> {
    pub fn slot(&self) -> usize {
        self.index
    }

    pub fn session_mut(&mut self) -> &mut F::Session {
        match self.session.as_mut() {
            Some(session) => session,
            None => unreachable!("lease session is only taken on drop"),
        }
    }

    pub fn session(&self) -> &F::Session {
        match self.session.as_ref() {
            Some(session) => session,
            None => unreachable!("lease session is only taken on drop"),
        }
    }

    /// Marks the session unhealthy: it is discarded and counts toward the breaker.
    pub fn mark_failed(&mut self) {
        self.outcome = LeaseOutcome::Failed;
    }

    /// Marks the session healthy, resetting the consecutive failure count.
    pub fn mark_succeeded(&mut self) {
        self.outcome = LeaseOutcome::Succeeded;
    }
}

impl<F: SessionFactory> Drop for Lease<F> {
    fn drop(&mut self) {
        self.shared.release(
            Slot {
                index: self.index,
                session: self.session.take(),
                generation: self.generation,
            },
            self.outcome,
        );
    }
}
