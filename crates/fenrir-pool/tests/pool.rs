//! Connection pool tests against the in-process mock server.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use fenrir_client::{Config, Error, TransactionState, TypeError};
use fenrir_pool::{ConnectionState, Pool, PoolConfig, PoolError};
use fenrir_testing::{MockColumn, MockResponse, MockServer};
use parking_lot::Mutex;

fn client_config(server: &MockServer) -> Config {
    fenrir_testing::init_tracing();
    Config::from_connection_string(&server.connection_string()).unwrap()
}

fn pool(server: &MockServer, min: u32, max: u32) -> Pool {
    Pool::new(
        client_config(server),
        PoolConfig::new().min_connections(min).max_connections(max),
    )
    .unwrap()
}

fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

// =============================================================================
// Startup
// =============================================================================

#[test]
fn test_startup_opens_min_connections() {
    let server = MockServer::builder().start().unwrap();
    let pool = pool(&server, 3, 5);

    let status = pool.get_stats();
    assert_eq!(status.available, 3);
    assert_eq!(status.in_use, 0);
    assert_eq!(status.total, 3);
    assert_eq!(status.max, 5);
    assert_eq!(server.accepted_count(), 3);
    assert_eq!(pool.metrics().connections_created, 3);
}

#[test]
fn test_startup_failure_is_reported() {
    let server = MockServer::builder().start().unwrap();
    server.reject_logins(true);

    let err = Pool::new(client_config(&server), PoolConfig::new().min_connections(2)).unwrap_err();
    assert!(matches!(err, PoolError::ConnectionCreation(_)), "{err:?}");
    assert!(err.is_connection_error());
    assert!(wait_for(|| server.connection_count() == 0));
}

#[test]
fn test_invalid_config_rejected() {
    let server = MockServer::builder().start().unwrap();

    let err = Pool::new(
        client_config(&server),
        PoolConfig::new().min_connections(3).max_connections(2),
    )
    .unwrap_err();
    assert!(matches!(err, PoolError::Configuration(_)));
    assert_eq!(server.accepted_count(), 0);
}

#[test]
fn test_builder_from_connection_string() {
    let server = MockServer::builder().start().unwrap();

    let pool = Pool::builder()
        .connection_string(server.connection_string())
        .min_connections(1)
        .max_connections(2)
        .build()
        .unwrap();

    assert_eq!(pool.status().available, 1);
    assert_eq!(pool.client_config().port, server.port());
}

// =============================================================================
// Acquire and Return
// =============================================================================

#[test]
fn test_exhausted_pool_scenario() {
    let server = MockServer::builder().start().unwrap();
    let pool = pool(&server, 2, 2);

    let first = pool.acquire(Duration::from_millis(100)).unwrap();
    let second = pool.acquire(Duration::from_millis(100)).unwrap();
    assert_ne!(first.metadata().id, second.metadata().id);

    let start = Instant::now();
    let err = pool.acquire(Duration::from_millis(100)).unwrap_err();
    let waited = start.elapsed();
    assert!(matches!(err, PoolError::AcquisitionTimeout(_)), "{err:?}");
    assert!(waited >= Duration::from_millis(100), "returned after {waited:?}");
    assert!(waited < Duration::from_millis(600), "returned after {waited:?}");

    // The timed-out attempt left no reservation behind.
    assert_eq!(pool.status().in_use, 2);
    assert_eq!(pool.status().total, 2);

    drop(first);
    let start = Instant::now();
    let third = pool.acquire(Duration::ZERO).unwrap();
    assert!(start.elapsed() < Duration::from_millis(100));
    assert!(third.is_connected());
    assert_eq!(server.accepted_count(), 2);
}

#[test]
fn test_connection_reused_after_return() {
    let server = MockServer::builder().start().unwrap();
    let pool = pool(&server, 1, 3);

    let pid = {
        let mut conn = pool.get().unwrap();
        assert_eq!(conn.execute("SELECT 1").unwrap().row_count(), 1);
        conn.backend_pid()
    };

    let conn = pool.get().unwrap();
    assert_eq!(conn.backend_pid(), pid);
    assert_eq!(conn.metadata().checkout_count, 2);
    assert_eq!(conn.metadata().state, ConnectionState::InUse);
    assert_eq!(server.accepted_count(), 1);
}

#[test]
fn test_grows_on_demand_up_to_max() {
    let server = MockServer::builder().start().unwrap();
    let pool = pool(&server, 0, 3);
    assert_eq!(pool.status().total, 0);

    let held: Vec<_> = (0..3)
        .map(|_| pool.acquire(Duration::from_millis(50)).unwrap())
        .collect();
    assert!(pool.status().is_at_capacity());
    assert!((pool.status().utilization() - 100.0).abs() < f64::EPSILON);
    assert!(pool.try_acquire().unwrap().is_none());

    drop(held);
    let status = pool.status();
    assert_eq!(status.available, 3);
    assert_eq!(status.in_use, 0);
}

#[test]
fn test_try_acquire() {
    let server = MockServer::builder().start().unwrap();
    let pool = pool(&server, 0, 1);

    let conn = pool.try_acquire().unwrap().expect("capacity available");
    assert!(pool.try_acquire().unwrap().is_none());
    drop(conn);
    assert!(pool.try_acquire().unwrap().is_some());
}

#[test]
fn test_waiter_wakes_on_return() {
    let server = MockServer::builder().start().unwrap();
    let pool = Arc::new(pool(&server, 1, 1));
    let held = pool.get().unwrap();

    let waiter = {
        let pool = Arc::clone(&pool);
        thread::spawn(move || {
            let start = Instant::now();
            let conn = pool.acquire(Duration::from_secs(5));
            (conn.map(|c| c.metadata().id), start.elapsed())
        })
    };

    thread::sleep(Duration::from_millis(50));
    let id = held.metadata().id;
    drop(held);

    let (acquired, waited) = waiter.join().unwrap();
    assert_eq!(acquired.unwrap(), id);
    assert!(waited < Duration::from_secs(2));
}

#[test]
fn test_open_transaction_rolled_back_on_return() {
    let server = MockServer::builder().start().unwrap();
    let pool = pool(&server, 1, 1);

    {
        let mut conn = pool.get().unwrap();
        conn.execute("BEGIN").unwrap();
        assert_eq!(conn.transaction_status(), TransactionState::InTransaction);
    }

    let conn = pool.get().unwrap();
    assert_eq!(conn.transaction_status(), TransactionState::Idle);
    assert!(server.queries().iter().any(|q| q == "ROLLBACK"));
    assert_eq!(server.accepted_count(), 1);
}

#[test]
fn test_broken_connection_not_returned() {
    let server = MockServer::builder()
        .with_response("SELECT crash()", MockResponse::disconnect())
        .start()
        .unwrap();
    let pool = pool(&server, 1, 1);

    {
        let mut conn = pool.get().unwrap();
        assert!(conn.execute("SELECT crash()").unwrap_err().is_connection_error());
    }

    let status = pool.status();
    assert_eq!(status.available, 0);
    assert_eq!(status.total, 0);
    assert_eq!(pool.metrics().connections_closed, 1);

    // The freed slot is refilled on the next acquire.
    let conn = pool.get().unwrap();
    assert!(conn.is_connected());
    assert_eq!(server.accepted_count(), 2);
}

#[test]
fn test_detach_frees_slot() {
    let server = MockServer::builder().start().unwrap();
    let pool = pool(&server, 1, 1);

    let mut conn = pool.get().unwrap().detach();
    assert_eq!(pool.status().total, 0);
    assert_eq!(conn.execute("SELECT 1").unwrap().row_count(), 1);

    // The detached connection no longer counts against max_connections.
    let pooled = pool.acquire(Duration::from_millis(100)).unwrap();
    assert_ne!(pooled.backend_pid(), conn.backend_pid());
    conn.close();
}

// =============================================================================
// Concurrency
// =============================================================================

#[test]
fn test_capacity_and_single_owner_under_contention() {
    let server = MockServer::builder().start().unwrap();
    let pool = Arc::new(pool(&server, 0, 4));
    let owners = Arc::new(Mutex::new(HashSet::new()));
    let peak = Arc::new(AtomicU32::new(0));

    let workers: Vec<_> = (0..12)
        .map(|_| {
            let pool = Arc::clone(&pool);
            let owners = Arc::clone(&owners);
            let peak = Arc::clone(&peak);
            thread::spawn(move || {
                for _ in 0..15 {
                    let mut conn = pool.acquire(Duration::from_secs(10)).unwrap();
                    let id = conn.metadata().id;
                    assert!(owners.lock().insert(id), "connection {id} handed out twice");

                    let status = pool.status();
                    assert!(status.total <= 4, "{status:?}");
                    assert!(status.in_use + status.available <= 4, "{status:?}");
                    peak.fetch_max(status.in_use, Ordering::SeqCst);

                    conn.execute("SELECT 1").unwrap();
                    assert!(owners.lock().remove(&id));
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }

    let status = pool.status();
    assert_eq!(status.in_use, 0);
    assert!(status.total <= 4);
    assert!(peak.load(Ordering::SeqCst) <= 4);
    assert!(server.accepted_count() <= 4);
    assert_eq!(pool.metrics().checkouts_successful, 12 * 15);
}

// =============================================================================
// Shutdown
// =============================================================================

#[test]
fn test_shutdown_wakes_blocked_waiter() {
    let server = MockServer::builder().start().unwrap();
    let pool = Arc::new(pool(&server, 1, 1));
    let held = pool.get().unwrap();

    let waiter = {
        let pool = Arc::clone(&pool);
        thread::spawn(move || {
            let start = Instant::now();
            (pool.acquire(Duration::from_secs(10)), start.elapsed())
        })
    };

    thread::sleep(Duration::from_millis(100));
    pool.shutdown();
    pool.shutdown();

    let (result, waited) = waiter.join().unwrap();
    assert!(matches!(result, Err(PoolError::PoolClosed)));
    assert!(waited < Duration::from_secs(2), "waited {waited:?}");
    assert!(pool.is_shutdown());

    // Returning after shutdown closes the connection and keeps counts straight.
    drop(held);
    let status = pool.status();
    assert_eq!(status.in_use, 0);
    assert_eq!(status.available, 0);
    assert!(wait_for(|| server.connection_count() == 0));
}

#[test]
fn test_acquire_after_shutdown_fails() {
    let server = MockServer::builder().start().unwrap();
    let pool = pool(&server, 2, 2);

    pool.shutdown();
    assert!(matches!(pool.get(), Err(PoolError::PoolClosed)));
    assert!(matches!(pool.try_acquire(), Err(PoolError::PoolClosed)));
    assert_eq!(pool.maintain(), 0);
    assert!(wait_for(|| server.connection_count() == 0));
}

#[test]
fn test_dropping_pool_closes_connections() {
    let server = MockServer::builder().start().unwrap();
    let pool = pool(&server, 2, 3);
    let held = pool.get().unwrap();

    drop(pool);
    assert!(wait_for(|| server.connection_count() == 1));

    drop(held);
    assert!(wait_for(|| server.connection_count() == 0));
}

// =============================================================================
// Maintenance
// =============================================================================

#[test]
fn test_maintain_health_check_only_touches_idle() {
    let server = MockServer::builder().start().unwrap();
    let pool = Pool::new(
        client_config(&server),
        PoolConfig::new()
            .min_connections(2)
            .max_connections(4)
            .health_check_query("SELECT 1"),
    )
    .unwrap();
    let held = pool.get().unwrap();
    // Acquiring validated the checked-out connection once.
    let before = pool.metrics().validations_performed;

    assert_eq!(pool.maintain(), 0);
    assert_eq!(
        server.queries().iter().filter(|q| *q == "SELECT 1").count(),
        1
    );

    let status = pool.status();
    assert_eq!(status.in_use, 1);
    assert_eq!(status.available, 1);
    assert_eq!(pool.metrics().validations_performed - before, 1);
    drop(held);
}

#[test]
fn test_maintain_replaces_dead_connections() {
    let server = MockServer::builder().start().unwrap();
    let pool = Pool::new(
        client_config(&server),
        PoolConfig::new()
            .min_connections(2)
            .max_connections(4)
            .health_check_query("SELECT 1"),
    )
    .unwrap();

    server.kill_connections();
    assert!(wait_for(|| server.connection_count() == 0));

    assert_eq!(pool.maintain(), 2);
    let status = pool.status();
    assert_eq!(status.available, 2);
    assert_eq!(status.total, 2);
    assert_eq!(server.accepted_count(), 4);
    assert_eq!(pool.metrics().validations_failed, 2);

    let mut conn = pool.get().unwrap();
    assert_eq!(conn.execute("SELECT 1").unwrap().row_count(), 1);
}

#[test]
fn test_maintain_restores_min_after_detach() {
    let server = MockServer::builder().start().unwrap();
    let pool = pool(&server, 2, 4);

    let a = pool.get().unwrap();
    let b = pool.get().unwrap();
    let detached = a.detach();
    drop(b);
    assert_eq!(pool.status().total, 1);

    assert_eq!(pool.maintain(), 0);
    let status = pool.status();
    assert!(status.in_use + status.available >= 2);
    assert_eq!(status.available, 2);
    drop(detached);
}

#[test]
fn test_maintain_retires_idle_connections_above_min() {
    let server = MockServer::builder().start().unwrap();
    let pool = Pool::new(
        client_config(&server),
        PoolConfig::new()
            .min_connections(1)
            .max_connections(3)
            .idle_timeout(Duration::from_millis(50)),
    )
    .unwrap();

    let held: Vec<_> = (0..3).map(|_| pool.get().unwrap()).collect();
    drop(held);
    assert_eq!(pool.status().available, 3);

    thread::sleep(Duration::from_millis(100));
    assert_eq!(pool.maintain(), 2);
    assert_eq!(pool.status().available, 1);
}

#[test]
fn test_maintain_retires_connections_past_lifetime() {
    let server = MockServer::builder().start().unwrap();
    let pool = Pool::new(
        client_config(&server),
        PoolConfig::new()
            .min_connections(1)
            .max_connections(2)
            .max_lifetime(Duration::from_millis(50)),
    )
    .unwrap();

    thread::sleep(Duration::from_millis(100));
    assert_eq!(pool.maintain(), 1);

    // Replaced to keep the floor.
    assert_eq!(pool.status().available, 1);
    assert_eq!(server.accepted_count(), 2);
}

// =============================================================================
// Retry Wrapper
// =============================================================================

#[test]
fn test_retry_reconnects_once_after_connection_loss() {
    let server = MockServer::builder()
        .with_response("SELECT 42", MockResponse::scalar_int(42))
        .start()
        .unwrap();
    let pool = pool(&server, 1, 1);
    let mut conn = pool.get().unwrap();
    let first_pid = conn.backend_pid();

    server.kill_connections();
    assert!(wait_for(|| server.connection_count() == 0));

    let mut calls = 0;
    let value: i32 = conn
        .execute_with_retry(
            |c| {
                calls += 1;
                c.execute("SELECT 42")?.get(0, 0)
            },
            2,
        )
        .unwrap();

    assert_eq!(value, 42);
    assert_eq!(calls, 2);
    assert_eq!(pool.metrics().resets_performed, 1);
    assert_ne!(conn.backend_pid(), first_pid);
    assert_eq!(server.accepted_count(), 2);
}

#[test]
fn test_retry_skips_server_errors() {
    let server = MockServer::builder()
        .with_response(
            "INSERT INTO users VALUES (1)",
            MockResponse::error("23505", "duplicate key value violates unique constraint"),
        )
        .start()
        .unwrap();
    let pool = pool(&server, 1, 1);
    let mut conn = pool.get().unwrap();

    let mut calls = 0;
    let err = conn
        .execute_with_retry(
            |c| {
                calls += 1;
                c.execute("INSERT INTO users VALUES (1)").map(|_| ())
            },
            3,
        )
        .unwrap_err();

    assert_eq!(calls, 1);
    assert_eq!(err.sql_state(), Some("23505"));
    assert!(!err.is_connection_error());
    assert_eq!(pool.metrics().resets_performed, 0);
    assert_eq!(server.accepted_count(), 1);
}

#[test]
fn test_retry_skips_undecodable_results() {
    const INSERT: &str = "INSERT INTO users (name) VALUES ('caf') RETURNING name";
    let server = MockServer::builder()
        .with_response(
            INSERT,
            MockResponse::raw_rows(
                vec![MockColumn::text("name")],
                vec![vec![Some(b"caf\xe9".to_vec())]],
                "INSERT 0 1",
            ),
        )
        .start()
        .unwrap();
    let pool = pool(&server, 1, 1);
    let mut conn = pool.get().unwrap();

    let err = conn
        .execute_with_retry(|c| c.execute(INSERT).map(|_| ()), 2)
        .unwrap_err();

    assert!(
        matches!(err, PoolError::Client(Error::Type(TypeError::InvalidEncoding(_)))),
        "{err:?}"
    );
    assert!(!err.is_connection_error());
    let inserts = server.queries().iter().filter(|q| q.as_str() == INSERT).count();
    assert_eq!(inserts, 1);
    assert_eq!(pool.metrics().resets_performed, 0);

    // The session read the whole reply and stays usable.
    assert!(conn.is_connected());
    assert_eq!(conn.execute("SELECT 1").unwrap().get::<i32>(0, 0).unwrap(), 1);
    assert_eq!(server.accepted_count(), 1);
}

#[test]
fn test_retries_exhausted() {
    let server = MockServer::builder().start().unwrap();
    let pool = pool(&server, 1, 1);
    let mut conn = pool.get().unwrap();

    let mut calls = 0;
    let err = conn
        .execute_with_retry(
            |_| -> fenrir_client::Result<()> {
                calls += 1;
                Err(Error::ConnectionClosed)
            },
            2,
        )
        .unwrap_err();

    assert_eq!(calls, 3);
    match err {
        PoolError::RetriesExhausted {
            attempts,
            last_error,
        } => {
            assert_eq!(attempts, 3);
            assert!(matches!(last_error, Error::ConnectionClosed));
        }
        other => panic!("expected RetriesExhausted, got {other:?}"),
    }
    assert_eq!(pool.metrics().resets_performed, 2);
}

#[test]
fn test_zero_retries_surfaces_error() {
    let server = MockServer::builder().start().unwrap();
    let pool = pool(&server, 1, 1);
    let mut conn = pool.get().unwrap();

    let err = conn
        .execute_with_retry(|_| -> fenrir_client::Result<()> { Err(Error::Timeout) }, 0)
        .unwrap_err();
    assert!(matches!(err, PoolError::Client(Error::Timeout)));
    assert_eq!(pool.metrics().resets_performed, 0);
}

// =============================================================================
// Async
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_async_acquire_and_execute() {
    let server = MockServer::builder()
        .with_response("SELECT 42", MockResponse::scalar_int(42))
        .start()
        .unwrap();
    let pool = Pool::new(
        client_config(&server),
        PoolConfig::new()
            .min_connections(0)
            .max_connections(2)
            .runtime(tokio::runtime::Handle::current()),
    )
    .unwrap();

    let mut conn = pool.get_async().await.unwrap();
    assert!(conn.runtime().is_some());
    let cursor = conn.async_execute("SELECT 42").await.unwrap();
    assert_eq!(cursor.get::<i32>(0, 0).unwrap(), 42);
    assert_eq!(pool.status().in_use, 1);
}

#[tokio::test]
async fn test_async_drop_rolls_back_on_blocking_pool() {
    let server = MockServer::builder().start().unwrap();
    let pool = pool(&server, 1, 1);

    {
        let mut conn = pool.acquire_async(Duration::from_secs(1)).await.unwrap();
        conn.execute("BEGIN").unwrap();
    }

    // The single slot comes back once the deferred rollback has run.
    let conn = pool.acquire_async(Duration::from_secs(5)).await.unwrap();
    assert_eq!(conn.transaction_status(), TransactionState::Idle);
    assert!(server.queries().iter().any(|q| q == "ROLLBACK"));
    assert_eq!(server.accepted_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_async_acquire_timeout() {
    let server = MockServer::builder().start().unwrap();
    let pool = pool(&server, 1, 1);
    let _held = pool.acquire_async(Duration::from_secs(1)).await.unwrap();

    let start = Instant::now();
    let err = pool
        .acquire_async(Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::AcquisitionTimeout(_)));
    assert!(start.elapsed() >= Duration::from_millis(100));
    assert_eq!(pool.status().in_use, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_async_waiter_sees_shutdown() {
    let server = MockServer::builder().start().unwrap();
    let pool = Arc::new(pool(&server, 1, 1));
    let held = pool.get_async().await.unwrap();

    let waiter = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move {
            let start = Instant::now();
            let result = pool.acquire_async(Duration::from_secs(10)).await;
            (result.map(|c| c.metadata().id), start.elapsed())
        })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    pool.shutdown();

    let (result, waited) = waiter.await.unwrap();
    assert!(matches!(result, Err(PoolError::PoolClosed)));
    assert!(waited < Duration::from_secs(2));
    drop(held);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_async_waiter_wakes_on_return() {
    let server = MockServer::builder().start().unwrap();
    let pool = Arc::new(pool(&server, 1, 1));
    let held = pool.get_async().await.unwrap();
    let id = held.metadata().id;

    let waiter = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move {
            pool.acquire_async(Duration::from_secs(5))
                .await
                .map(|c| c.metadata().id)
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    drop(held);
    assert_eq!(waiter.await.unwrap().unwrap(), id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_async_retry_after_connection_loss() {
    let server = MockServer::builder()
        .with_response("SELECT 42", MockResponse::scalar_int(42))
        .start()
        .unwrap();
    let pool = Pool::new(
        client_config(&server),
        PoolConfig::new()
            .min_connections(1)
            .max_connections(1)
            .runtime(tokio::runtime::Handle::current()),
    )
    .unwrap();
    let mut conn = pool.get_async().await.unwrap();

    server.kill_connections();
    let deadline = Instant::now() + Duration::from_secs(5);
    while server.connection_count() > 0 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let value: i32 = conn
        .execute_with_retry_async(
            |c| Box::pin(async move { c.async_execute("SELECT 42").await?.get::<i32>(0, 0) }),
            2,
        )
        .await
        .unwrap();

    assert_eq!(value, 42);
    assert_eq!(pool.metrics().resets_performed, 1);
    assert!(conn.is_connected());
}
