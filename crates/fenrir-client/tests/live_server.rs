//! Live PostgreSQL integration tests.
//!
//! These tests require a running PostgreSQL instance. They are ignored by
//! default and can be run with:
//!
//! ```bash
//! export FENRIR_TEST_URL="host=localhost user=postgres password=postgres dbname=postgres"
//! cargo test -p fenrir-client --test live_server -- --ignored
//! ```
//!
//! For CI/CD, use Docker:
//! ```bash
//! docker run -e POSTGRES_PASSWORD=postgres -p 5432:5432 postgres:16
//! ```

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use fenrir_client::{Config, Connection, TransactionState};

/// Helper to get test configuration from the environment.
fn get_test_config() -> Option<Config> {
    let conn_str = std::env::var("FENRIR_TEST_URL").ok()?;
    Config::from_connection_string(&conn_str).ok()
}

#[test]
#[ignore = "Requires PostgreSQL"]
fn test_basic_round_trip() {
    let config = get_test_config().expect("FENRIR_TEST_URL not set");
    let mut conn = Connection::connect_with(config).unwrap();

    let cursor = conn.execute("SELECT 42 AS answer, true AS flag").unwrap();
    assert_eq!(cursor.get_by_name::<i32>(0, "answer").unwrap(), 42);
    assert!(cursor.get_by_name::<bool>(0, "flag").unwrap());
    assert!(conn.server_parameter("server_version").is_some());
}

#[test]
#[ignore = "Requires PostgreSQL"]
fn test_constraint_violation_sql_state() {
    let config = get_test_config().expect("FENRIR_TEST_URL not set");
    let mut conn = Connection::connect_with(config).unwrap();

    conn.execute("CREATE TEMP TABLE fenrir_uniq (id int PRIMARY KEY)").unwrap();
    conn.execute("INSERT INTO fenrir_uniq VALUES (1)").unwrap();
    let err = conn.execute("INSERT INTO fenrir_uniq VALUES (1)").unwrap_err();

    assert!(err.is_server_error("23505"));
    assert!(!err.is_connection_error());
    assert!(conn.is_connected());
}

#[test]
#[ignore = "Requires PostgreSQL"]
fn test_params_and_prepared() {
    let config = get_test_config().expect("FENRIR_TEST_URL not set");
    let mut conn = Connection::connect_with(config).unwrap();

    let missing: Option<String> = None;
    let cursor = conn
        .execute_with_params("SELECT $1::text IS NULL, $2::int + 1", &[&missing, &41i32])
        .unwrap();
    assert!(cursor.get::<bool>(0, 0).unwrap());
    assert_eq!(cursor.get::<i32>(0, 1).unwrap(), 42);

    conn.prepare("fenrir_echo", "SELECT $1::text").unwrap();
    let cursor = conn.execute_prepared("fenrir_echo", &[&"it's"]).unwrap();
    assert_eq!(cursor.get::<String>(0, 0).unwrap(), "it's");
}

#[test]
#[ignore = "Requires PostgreSQL"]
fn test_transaction_status() {
    let config = get_test_config().expect("FENRIR_TEST_URL not set");
    let mut conn = Connection::connect_with(config).unwrap();

    conn.execute("BEGIN").unwrap();
    assert_eq!(conn.transaction_status(), TransactionState::InTransaction);
    assert!(conn.execute("SELECT 1/0").is_err());
    assert_eq!(conn.transaction_status(), TransactionState::InError);
    conn.execute("ROLLBACK").unwrap();
    assert_eq!(conn.transaction_status(), TransactionState::Idle);
}

#[tokio::test]
#[ignore = "Requires PostgreSQL"]
async fn test_async_round_trip() {
    let config = get_test_config()
        .expect("FENRIR_TEST_URL not set")
        .runtime(tokio::runtime::Handle::current());
    let mut conn = Connection::connect_with(config).unwrap();

    let cursor = conn.async_execute("SELECT pg_sleep(0.1), 7").await.unwrap();
    assert_eq!(cursor.get::<i32>(0, 1).unwrap(), 7);
}
