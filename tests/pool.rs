//! End-to-end pool behavior over the public API.

use std::io;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use poolhouse::{AcquireError, Config, Connect, Lifecycle, Pool, PoolStatus, ReleaseError};

/// An in-memory backend that counts opens and closes and lets tests
/// break sessions while the pool holds them.
#[derive(Debug, Default)]
struct TestBackend {
    serial: AtomicUsize,
    closed: AtomicUsize,
    fail_connects: AtomicUsize,
    healthy_flags: Mutex<Vec<Arc<AtomicBool>>>,
}

#[derive(Debug)]
struct TestConn {
    serial: usize,
    healthy: Arc<AtomicBool>,
}

impl TestBackend {
    fn opened(&self) -> usize {
        self.serial.load(Ordering::SeqCst)
    }

    fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    fn fail_next_connects(&self, n: usize) {
        self.fail_connects.store(n, Ordering::SeqCst);
    }

    fn poison_all(&self) {
        for flag in self.healthy_flags.lock().unwrap().iter() {
            flag.store(false, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl Connect for TestBackend {
    type Connection = TestConn;
    type Error = io::Error;

    async fn connect(&self) -> io::Result<TestConn> {
        let scripted_failure = self
            .fail_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if scripted_failure {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "scripted connect failure",
            ));
        }
        let serial = self.serial.fetch_add(1, Ordering::SeqCst) + 1;
        let healthy = Arc::new(AtomicBool::new(true));
        self.healthy_flags.lock().unwrap().push(healthy.clone());
        Ok(TestConn { serial, healthy })
    }

    async fn probe(&self, conn: &mut TestConn) -> io::Result<()> {
        if conn.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "poisoned session"))
        }
    }

    fn close(&self, conn: TestConn) {
        drop(conn);
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

fn pool_with(configure: impl FnOnce(&mut Config)) -> Pool<TestBackend> {
    let _ = tracing_subscriber::fmt::try_init();
    let mut config = Config::default();
    config.min_size = 1;
    config.acquire_timeout = Duration::from_millis(500);
    configure(&mut config);
    Pool::new(TestBackend::default(), config).expect("valid config")
}

fn assert_counts(status: &PoolStatus, max_size: usize) {
    assert_eq!(
        status.idle + status.in_use,
        status.total,
        "idle and in-use must partition the total"
    );
    assert!(status.total <= max_size, "total exceeds the cap");
}

#[tokio::test]
async fn exhaustion_serves_the_cap_and_times_out_the_rest() {
    let pool = pool_with(|config| {
        config.max_size = 10;
    });

    let mut held = Vec::new();
    for _ in 0..10 {
        held.push(pool.acquire().await.unwrap());
    }
    assert_counts(&pool.status(), 10);
    assert_eq!(pool.status().in_use, 10);

    let timeout = Duration::from_millis(100);
    let started = Instant::now();
    let error = pool.acquire_timeout(timeout).await.unwrap_err();
    assert!(matches!(error, AcquireError::Timeout));
    assert!(
        started.elapsed() >= timeout,
        "timed out before the deadline"
    );

    // Releasing one connection makes the next acquire immediate, with no
    // new session opened.
    let opened = pool.connector().opened();
    drop(held.pop());
    let conn = pool.acquire().await.unwrap();
    assert_eq!(pool.connector().opened(), opened);
    drop(conn);
}

#[tokio::test]
async fn waiters_are_served_in_arrival_order() {
    let pool = pool_with(|config| {
        config.max_size = 1;
    });

    let held = pool.acquire().await.unwrap();

    let mut first = pin!(pool.acquire());
    assert!(futures_util::poll!(&mut first).is_pending());
    let mut second = pin!(pool.acquire());
    assert!(futures_util::poll!(&mut second).is_pending());
    assert_eq!(pool.status().waiting, 2);

    drop(held);

    let conn = first.await.unwrap();
    assert!(
        futures_util::poll!(&mut second).is_pending(),
        "the newer waiter must not be served first"
    );

    drop(conn);
    let conn = second.await.unwrap();
    drop(conn);

    assert_eq!(pool.connector().opened(), 1);
}

#[tokio::test]
async fn released_connections_are_reused_not_reopened() {
    let pool = pool_with(|config| {
        config.min_size = 2;
        config.max_size = 5;
    });
    pool.start().await.unwrap();
    assert_eq!(pool.connector().opened(), 2);

    let mut held = Vec::new();
    for _ in 0..5 {
        held.push(pool.acquire().await.unwrap());
    }
    assert_eq!(pool.connector().opened(), 5);
    assert_counts(&pool.status(), 5);

    held.clear();
    assert_eq!(pool.status().idle, 5);

    let conn = pool.acquire().await.unwrap();
    assert_eq!(
        pool.connector().opened(),
        5,
        "an existing connection should be re-used"
    );
    drop(conn);
}

#[tokio::test]
async fn burst_of_acquirers_respects_the_cap() {
    let pool = pool_with(|config| {
        config.max_size = 5;
        config.acquire_timeout = Duration::from_secs(2);
    });

    let mut tasks = Vec::new();
    for _ in 0..20 {
        let pool = pool.clone();
        tasks.push(tokio::spawn(async move {
            let conn = pool.acquire().await?;
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(conn);
            Ok::<_, AcquireError<io::Error>>(())
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert!(
        pool.connector().opened() <= 5,
        "burst must never open past max_size"
    );
    assert_counts(&pool.status(), 5);
}

#[tokio::test]
async fn shutdown_waits_for_leases_then_closes() {
    let pool = pool_with(|config| {
        config.max_size = 2;
    });
    pool.start().await.unwrap();

    let held = pool.acquire().await.unwrap();

    let shutdown = tokio::spawn({
        let pool = pool.clone();
        async move { pool.shutdown(Duration::from_secs(5)).await }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(pool.status().lifecycle, Lifecycle::Draining);

    let error = pool.acquire().await.unwrap_err();
    assert!(matches!(error, AcquireError::Closed));

    drop(held);
    tokio::time::timeout(Duration::from_secs(1), shutdown)
        .await
        .expect("shutdown must complete once the lease is released")
        .unwrap();

    let status = pool.status();
    assert_eq!(status.lifecycle, Lifecycle::Closed);
    assert_eq!(status.total, 0);
    assert_eq!(pool.connector().closed(), pool.connector().opened());
}

#[tokio::test]
async fn grace_expiry_revokes_outstanding_leases() {
    let pool = pool_with(|config| {
        config.max_size = 2;
    });

    let held = pool.acquire().await.unwrap();
    pool.shutdown(Duration::from_millis(50)).await;

    let after_shutdown = pool.status();
    assert_eq!(after_shutdown.lifecycle, Lifecycle::Closed);
    assert_eq!(after_shutdown.in_use, 0);

    // The stale guard reports the double release and leaves the counts
    // alone.
    let error = pool.release(held).unwrap_err();
    assert_eq!(error, ReleaseError::DoubleRelease);
    assert_eq!(pool.status(), after_shutdown);
    assert_eq!(pool.connector().closed(), 1);
}

#[tokio::test]
async fn unhealthy_idle_connections_are_replaced() {
    let pool = pool_with(|config| {
        config.max_size = 2;
        config.health_check_interval = Duration::from_millis(50);
    });
    pool.start().await.unwrap();
    assert_eq!(pool.connector().opened(), 1);

    pool.connector().poison_all();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let status = pool.status();
    assert_eq!(status.total, 1, "pool must hold its minimum size");
    assert_eq!(status.idle, 1);
    assert!(
        pool.connector().opened() >= 2,
        "a replacement should have been opened"
    );
    assert!(pool.connector().closed() >= 1, "the poisoned session closes");

    // The replacement is healthy and usable.
    let conn = pool.acquire().await.unwrap();
    assert!(conn.serial > 1);
    drop(conn);
}

#[tokio::test]
async fn idle_connections_above_the_minimum_are_reclaimed() {
    let pool = pool_with(|config| {
        config.max_size = 4;
        config.idle_lifetime = Duration::from_millis(100);
        config.health_check_interval = Duration::from_millis(50);
    });
    pool.start().await.unwrap();

    let mut held = Vec::new();
    for _ in 0..3 {
        held.push(pool.acquire().await.unwrap());
    }
    held.clear();
    assert_eq!(pool.status().idle, 3);

    tokio::time::sleep(Duration::from_millis(400)).await;

    let status = pool.status();
    assert_eq!(status.total, 1, "idle connections shrink back to min_size");
    assert!(pool.connector().closed() >= 2);
}

#[tokio::test]
async fn establishment_failure_is_recoverable() {
    let pool = pool_with(|config| {
        config.max_size = 2;
    });
    pool.connector().fail_next_connects(1);

    let error = pool.acquire().await.unwrap_err();
    assert!(matches!(error, AcquireError::Connect(_)));
    assert_eq!(pool.status().total, 0, "failed attempt must not be counted");

    let conn = pool.acquire().await.unwrap();
    assert_eq!(pool.status().total, 1);
    drop(conn);
}

#[tokio::test]
async fn detach_frees_capacity() {
    let pool = pool_with(|config| {
        config.max_size = 1;
    });

    let held = pool.acquire().await.unwrap();
    let conn = held.detach();
    assert_eq!(conn.serial, 1);
    assert_eq!(pool.status().total, 0);

    // The detached session no longer occupies the only slot.
    let replacement = pool.acquire().await.unwrap();
    assert_eq!(pool.connector().opened(), 2);
    drop(replacement);
}
