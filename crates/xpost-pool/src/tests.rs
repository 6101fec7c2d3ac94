use super::{CircuitBreakerConfig, PoolConfig, PoolError, ResourcePool, SessionFactory};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use xpost_core::PublishMetrics;

#[derive(Debug)]
struct TestSession {
    serial: usize,
}

#[derive(Debug, Default)]
struct CountingFactory {
    created: AtomicUsize,
    discarded: AtomicUsize,
    failing_creates: AtomicUsize,
    create_delay_ms: AtomicU64,
}

#[async_trait]
impl SessionFactory for Arc<CountingFactory> {
    type Session = TestSession;

    async fn create_session(&self, _slot: usize) -> anyhow::Result<TestSession> {
        let delay_ms = self.create_delay_ms.load(Ordering::SeqCst);
        if delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
        if self
            .failing_creates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                remaining.checked_sub(1)
            })
            .is_ok()
        {
            anyhow::bail!("browser failed to launch");
        }
        let serial = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(TestSession { serial })
    }

    fn discard_session(&self, _slot: usize, _session: TestSession) {
        self.discarded.fetch_add(1, Ordering::SeqCst);
    }
}

fn pool(
    capacity: usize,
    failure_threshold: usize,
) -> (
    ResourcePool<Arc<CountingFactory>>,
    Arc<CountingFactory>,
    Arc<PublishMetrics>,
) {
    let factory = Arc::new(CountingFactory::default());
    let metrics = Arc::new(PublishMetrics::new());
    let pool = ResourcePool::new(
        Arc::clone(&factory),
        PoolConfig {
            capacity,
            breaker: CircuitBreakerConfig {
                enabled: true,
                failure_threshold,
            },
        },
        Arc::clone(&metrics),
    )
    .expect("pool");
    (pool, factory, metrics)
}

async fn wait_for_waiters(pool: &ResourcePool<Arc<CountingFactory>>, expected: usize) {
    for _ in 0..200 {
        if pool.stats().waiting == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("expected {expected} waiters, saw {}", pool.stats().waiting);
}

#[test]
fn unit_zero_capacity_is_rejected() {
    let result = ResourcePool::new(
        Arc::new(CountingFactory::default()),
        PoolConfig {
            capacity: 0,
            ..PoolConfig::default()
        },
        Arc::new(PublishMetrics::new()),
    );
    assert!(matches!(result, Err(PoolError::ZeroCapacity)));
}

#[tokio::test]
async fn unit_released_session_is_reused_by_next_lease() {
    let (pool, factory, _metrics) = pool(1, 3);
    {
        let mut lease = pool.acquire(10).await.expect("first lease");
        assert_eq!(lease.session_mut().serial, 1);
        lease.mark_succeeded();
    }
    let lease = pool.acquire(10).await.expect("second lease");
    assert_eq!(lease.session().serial, 1);
    assert_eq!(factory.created.load(Ordering::SeqCst), 1);
    assert_eq!(pool.stats().leased, 1);
    drop(lease);
    assert_eq!(pool.stats().idle, 1);
}

#[tokio::test]
async fn functional_waiters_are_served_by_priority_then_arrival() {
    let (pool, _factory, _metrics) = pool(1, 3);
    let held = pool.acquire(0).await.expect("held lease");
    let order = Arc::new(Mutex::new(Vec::new()));

    let mut handles = Vec::new();
    for (expected_waiters, (label, priority)) in
        [("reply", 10u8), ("thread-a", 30), ("single", 20), ("thread-b", 30)]
            .into_iter()
            .enumerate()
    {
        let waiter_pool = pool.clone();
        let order = Arc::clone(&order);
        handles.push(tokio::spawn(async move {
            let lease = waiter_pool.acquire(priority).await.expect("queued lease");
            order.lock().expect("order lock").push(label);
            tokio::time::sleep(Duration::from_millis(2)).await;
            drop(lease);
        }));
        wait_for_waiters(&pool, expected_waiters + 1).await;
    }

    drop(held);
    for handle in handles {
        handle.await.expect("join");
    }
    assert_eq!(
        *order.lock().expect("order lock"),
        vec!["reply", "single", "thread-a", "thread-b"]
    );
}

#[tokio::test]
async fn functional_breaker_trip_recreates_every_session() {
    let (pool, factory, metrics) = pool(2, 2);
    let mut first = pool.acquire(10).await.expect("first");
    let mut second = pool.acquire(10).await.expect("second");
    assert_eq!(factory.created.load(Ordering::SeqCst), 2);
    first.mark_failed();
    drop(first);
    assert_eq!(pool.stats().consecutive_failures, 1);
    second.mark_failed();
    drop(second);

    let stats = pool.stats();
    assert_eq!(stats.generation, 1);
    assert_eq!(stats.consecutive_failures, 0);
    assert_eq!(metrics.snapshot().pool_resets, 1);
    assert_eq!(factory.discarded.load(Ordering::SeqCst), 2);

    let lease = pool.acquire(10).await.expect("after reset");
    assert!(lease.session().serial > 2);
}

#[tokio::test]
async fn regression_stale_leased_session_is_discarded_after_reset() {
    let (pool, factory, metrics) = pool(2, 1);
    let healthy = pool.acquire(10).await.expect("healthy");
    let mut failing = pool.acquire(10).await.expect("failing");
    failing.mark_failed();
    drop(failing);
    assert_eq!(metrics.snapshot().pool_resets, 1);

    let healthy_serial = healthy.session().serial;
    drop(healthy);
    assert_eq!(factory.discarded.load(Ordering::SeqCst), 2);

    let first = pool.acquire(10).await.expect("first after reset");
    let second = pool.acquire(10).await.expect("second after reset");
    assert_ne!(first.session().serial, healthy_serial);
    assert_ne!(second.session().serial, healthy_serial);
}

#[tokio::test]
async fn unit_success_resets_consecutive_failures() {
    let (pool, _factory, metrics) = pool(1, 2);
    let mut lease = pool.acquire(10).await.expect("lease");
    lease.mark_failed();
    drop(lease);
    let mut lease = pool.acquire(10).await.expect("lease");
    lease.mark_succeeded();
    drop(lease);
    let mut lease = pool.acquire(10).await.expect("lease");
    lease.mark_failed();
    drop(lease);
    assert_eq!(metrics.snapshot().pool_resets, 0);
    assert_eq!(pool.stats().consecutive_failures, 1);
}

#[tokio::test]
async fn regression_timed_out_waiter_does_not_leak_slot() {
    let (pool, _factory, _metrics) = pool(1, 3);
    let held = pool.acquire(10).await.expect("held");
    let error = pool
        .acquire_with_timeout(5, Duration::from_millis(10))
        .await
        .expect_err("saturated pool");
    assert_eq!(error, PoolError::AcquireTimeout { waited_ms: 10 });
    drop(held);

    let stats = pool.stats();
    assert_eq!(stats.idle, 1);
    assert_eq!(stats.waiting, 0);
    pool.acquire_with_timeout(5, Duration::from_millis(100))
        .await
        .expect("slot is available again");
}

#[tokio::test]
async fn regression_cancelled_session_start_returns_slot() {
    let (pool, factory, metrics) = pool(1, 3);
    factory.create_delay_ms.store(200, Ordering::SeqCst);
    let error = pool
        .acquire_with_timeout(0, Duration::from_millis(20))
        .await
        .expect_err("session start outlives the timeout");
    assert_eq!(error, PoolError::AcquireTimeout { waited_ms: 20 });

    let stats = pool.stats();
    assert_eq!(stats.leased, 0);
    assert_eq!(stats.idle, 1);
    assert_eq!(stats.consecutive_failures, 0);
    assert_eq!(metrics.snapshot().pool_resets, 0);

    factory.create_delay_ms.store(0, Ordering::SeqCst);
    let lease = pool
        .acquire_with_timeout(0, Duration::from_millis(1000))
        .await
        .expect("slot is leasable again");
    assert_eq!(lease.slot(), 0);
    assert_eq!(factory.created.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn functional_session_start_failure_returns_slot() {
    let (pool, factory, _metrics) = pool(1, 3);
    factory.failing_creates.store(1, Ordering::SeqCst);
    let error = pool.acquire(10).await.expect_err("start failure");
    assert!(matches!(error, PoolError::SessionStart { slot: 0, .. }));
    assert_eq!(pool.stats().idle, 1);
    assert_eq!(pool.stats().consecutive_failures, 1);

    let lease = pool.acquire(10).await.expect("second start succeeds");
    assert_eq!(lease.session().serial, 1);
}

#[tokio::test]
async fn unit_shutdown_rejects_waiters_and_new_acquisitions() {
    let (pool, _factory, _metrics) = pool(1, 3);
    let held = pool.acquire(10).await.expect("held");
    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire(10).await.map(|_| ()) })
    };
    wait_for_waiters(&pool, 1).await;
    pool.shutdown();
    assert_eq!(waiter.await.expect("join"), Err(PoolError::Closed));
    assert!(matches!(pool.acquire(10).await, Err(PoolError::Closed)));
    drop(held);
    assert_eq!(pool.stats().idle, 0);
}
