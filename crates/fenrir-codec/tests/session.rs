//! Session tests against the in-process mock server.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::time::Duration;

use fenrir_codec::{CodecError, ResultStatus, Session, SessionParams, SessionStatus, TransactionStatus};
use fenrir_testing::{AuthMode, MockColumn, MockResponse, MockServer};

fn params(server: &MockServer) -> SessionParams {
    SessionParams {
        host: server.host(),
        port: server.port(),
        user: "postgres".into(),
        database: Some("postgres".into()),
        password: None,
        connect_timeout: Duration::from_secs(5),
        application_name: Some("codec-tests".into()),
        client_encoding: Some("UTF8".into()),
        options: None,
    }
}

fn run(session: &mut Session) -> Vec<fenrir_codec::RawResult> {
    session.wait_blocking().unwrap();
    std::iter::from_fn(|| session.take_result()).collect()
}

#[test]
fn test_startup_records_server_state() {
    let server = MockServer::builder().start().unwrap();
    let session = Session::connect(params(&server)).unwrap();

    assert_eq!(session.status(), SessionStatus::Ok);
    assert!(session.is_ok());
    assert_eq!(session.transaction_status(), TransactionStatus::Idle);
    assert!(session.parameter("server_version").is_some());
    assert!(session.backend_key().is_some());
    assert!(!session.is_busy());
}

#[test]
fn test_password_authentication() {
    for auth in [
        AuthMode::Cleartext {
            password: "pw".into(),
        },
        AuthMode::Md5 {
            password: "pw".into(),
        },
    ] {
        let server = MockServer::builder().with_auth(auth).start().unwrap();

        let mut good = params(&server);
        good.password = Some("pw".into());
        assert!(Session::connect(good).is_ok());

        let mut missing = params(&server);
        missing.password = None;
        assert!(matches!(
            Session::connect(missing),
            Err(CodecError::Authentication(_))
        ));

        let mut wrong = params(&server);
        wrong.password = Some("nope".into());
        match Session::connect(wrong) {
            Err(CodecError::Server(db)) => assert_eq!(db.code, "28P01"),
            other => panic!("expected 28P01, got {other:?}"),
        }
    }
}

#[test]
fn test_connect_refused() {
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let result = Session::connect(SessionParams {
        host: "127.0.0.1".into(),
        port,
        user: "postgres".into(),
        database: None,
        password: None,
        connect_timeout: Duration::from_secs(2),
        application_name: None,
        client_encoding: None,
        options: None,
    });
    assert!(matches!(result, Err(CodecError::Io(_))));
}

#[test]
fn test_simple_query_results() {
    let server = MockServer::builder()
        .with_response(
            "SELECT id FROM t",
            MockResponse::rows(
                vec![MockColumn::int("id")],
                vec![vec![Some("1".into())], vec![None]],
            ),
        )
        .start()
        .unwrap();
    let mut session = Session::connect(params(&server)).unwrap();

    session.queue_query("SELECT id FROM t").unwrap();
    assert!(session.is_busy());
    let results = run(&mut session);

    assert_eq!(results.len(), 1);
    let result = &results[0];
    assert_eq!(result.status(), ResultStatus::TuplesOk);
    assert_eq!(result.columns()[0].name, "id");
    assert_eq!(result.rows(), &[vec![Some("1".to_string())], vec![None]]);
    assert_eq!(result.command_tag(), Some("SELECT 2"));
    assert!(!session.is_busy());
}

#[test]
fn test_empty_query() {
    let server = MockServer::builder().start().unwrap();
    let mut session = Session::connect(params(&server)).unwrap();

    session.queue_query("").unwrap();
    let results = run(&mut session);
    assert_eq!(results[0].status(), ResultStatus::EmptyQuery);
}

#[test]
fn test_busy_session_rejects_second_command() {
    let server = MockServer::builder().start().unwrap();
    let mut session = Session::connect(params(&server)).unwrap();

    session.queue_query("SELECT 1").unwrap();
    assert!(matches!(
        session.queue_query("SELECT 1"),
        Err(CodecError::Busy)
    ));
    assert_eq!(run(&mut session).len(), 1);
}

#[test]
fn test_extended_query_error_keeps_session() {
    let server = MockServer::builder()
        .with_response("SELECT nope", MockResponse::error("42703", "column does not exist"))
        .start()
        .unwrap();
    let mut session = Session::connect(params(&server)).unwrap();

    session.queue_query_params("SELECT nope", &[None]).unwrap();
    let results = run(&mut session);
    assert_eq!(results.len(), 1);
    assert!(results[0].is_error());
    assert_eq!(results[0].db_error().unwrap().code, "42703");

    assert!(session.is_ok());
    session.queue_query("SELECT 1").unwrap();
    assert!(!run(&mut session)[0].is_error());
}

#[test]
fn test_prepare_with_eviction() {
    let server = MockServer::builder().start().unwrap();
    let mut session = Session::connect(params(&server)).unwrap();

    session.queue_prepare("s1", "SELECT 1", &[]).unwrap();
    assert_eq!(run(&mut session)[0].status(), ResultStatus::CommandOk);

    session
        .queue_prepare("s2", "SELECT 1", &["s1".to_string()])
        .unwrap();
    assert_eq!(run(&mut session).len(), 1);

    // s1 was closed on the server.
    session.queue_query_prepared("s1", &[]).unwrap();
    let results = run(&mut session);
    assert_eq!(results[0].db_error().unwrap().code, "26000");

    session.queue_query_prepared("s2", &[]).unwrap();
    assert_eq!(run(&mut session)[0].rows().len(), 1);
}

#[test]
fn test_fatal_marks_session_bad() {
    let server = MockServer::builder()
        .with_response("SELECT die()", MockResponse::fatal("57P01", "terminating connection"))
        .start()
        .unwrap();
    let mut session = Session::connect(params(&server)).unwrap();

    session.queue_query("SELECT die()").unwrap();
    let err = session.wait_blocking().unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(session.status(), SessionStatus::Bad);

    // The FATAL error that preceded the hang-up is still collectable.
    let result = session.take_result().unwrap();
    assert_eq!(result.db_error().unwrap().severity, "FATAL");
    assert!(matches!(session.queue_query("SELECT 1"), Err(CodecError::Closed)));
}

#[test]
fn test_reset_reconnects() {
    let server = MockServer::builder().start().unwrap();
    let mut session = Session::connect(params(&server)).unwrap();
    let first_pid = session.backend_key().unwrap().process_id;

    session.reset().unwrap();
    assert!(session.is_ok());
    assert_ne!(session.backend_key().unwrap().process_id, first_pid);
    assert_eq!(server.accepted_count(), 2);
}

#[test]
fn test_close_is_idempotent() {
    let server = MockServer::builder().start().unwrap();
    let mut session = Session::connect(params(&server)).unwrap();

    session.close();
    session.close();
    assert_eq!(session.status(), SessionStatus::Bad);
    assert!(matches!(session.try_clone_stream(), Err(CodecError::Closed)));
}

#[test]
fn test_nonblocking_consume() {
    let server = MockServer::builder()
        .with_response(
            "SELECT later",
            MockResponse::scalar_int(5).delayed(Duration::from_millis(100)),
        )
        .start()
        .unwrap();
    let mut session = Session::connect(params(&server)).unwrap();

    session.set_nonblocking(true).unwrap();
    session.queue_query("SELECT later").unwrap();
    while !session.flush().unwrap() {}

    // Nothing has arrived yet; consuming must not block.
    session.consume_input().unwrap();
    assert!(session.is_busy());

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while session.is_busy() && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
        session.consume_input().unwrap();
    }
    assert!(!session.is_busy());
    assert_eq!(session.take_result().unwrap().rows()[0][0].as_deref(), Some("5"));
    session.set_nonblocking(false).unwrap();
}
