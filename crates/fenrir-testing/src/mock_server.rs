//! Mock PostgreSQL server for testing.
//!
//! Provides a lightweight server that speaks the PostgreSQL wire protocol
//! (version 3.0) well enough to test the client and pool without a real
//! database.
//!
//! ## Features
//!
//! - Trust, cleartext, and MD5 authentication
//! - Simple query protocol, including multi-result replies
//! - Extended query protocol with named and unnamed statements
//! - Canned responses keyed by SQL text, or computed from the parameters
//! - Fault injection: delays, errors, `FATAL` disconnects, refused logins,
//!   and killing every live session at once
//!
//! ## Example
//!
//! ```rust,ignore
//! use fenrir_testing::mock_server::{MockResponse, MockServer};
//!
//! let server = MockServer::builder()
//!     .with_response("SELECT 1", MockResponse::scalar_int(1))
//!     .start()?;
//!
//! // Connect a client to server.host():server.port()
//! ```

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use futures_util::StreamExt;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_util::codec::FramedRead;

use crate::frontend::{FrontendCodec, FrontendMessage};

/// Type OIDs used by the convenience constructors.
const INT4_OID: u32 = 23;
const INT8_OID: u32 = 20;
const TEXT_OID: u32 = 25;

/// Error type for mock server operations.
#[derive(Debug, Error)]
pub enum MockServerError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Server already stopped.
    #[error("Server already stopped")]
    Stopped,
}

/// Result type for mock server operations.
pub type Result<T> = std::result::Result<T, MockServerError>;

/// How the server authenticates logins.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AuthMode {
    /// Accept every login without a password.
    #[default]
    Trust,
    /// Ask for a cleartext password and compare it.
    Cleartext {
        /// Expected password.
        password: String,
    },
    /// Ask for an MD5-hashed password and compare it.
    Md5 {
        /// Expected password.
        password: String,
    },
}

/// Computes a response from the SQL text and the bound parameters.
pub type ResponseFn = Arc<dyn Fn(&str, &[Option<String>]) -> MockResponse + Send + Sync>;

/// Mock response configuration.
#[derive(Clone)]
pub enum MockResponse {
    /// Return rows.
    Rows {
        /// Column definitions.
        columns: Vec<MockColumn>,
        /// Row data as wire text; `None` is NULL.
        rows: Vec<Vec<Option<String>>>,
    },

    /// Return rows whose fields are sent as raw bytes, completing with the
    /// given tag (for example `INSERT 0 1` for `RETURNING`).
    RawRows {
        /// Column definitions.
        columns: Vec<MockColumn>,
        /// Field bytes as sent on the wire; `None` is NULL.
        rows: Vec<Vec<Option<Vec<u8>>>>,
        /// Command tag.
        tag: String,
    },

    /// Complete a command that returns no rows, with the given tag.
    Command(String),

    /// Answer with `EmptyQueryResponse`.
    Empty,

    /// Return an error. A `FATAL` severity also closes the connection.
    Error {
        /// Severity (`ERROR` or `FATAL`).
        severity: String,
        /// SQLSTATE code.
        code: String,
        /// Message text.
        message: String,
    },

    /// Several results for one simple query; stops at the first error.
    Multi(Vec<MockResponse>),

    /// Wait before producing the inner response.
    Delayed(Duration, Box<MockResponse>),

    /// Start a `COPY FROM STDIN` and wait for the client to end it.
    CopyIn,

    /// Drop the connection without replying.
    Disconnect,

    /// Compute the response per request.
    Custom(ResponseFn),
}

impl fmt::Debug for MockResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rows { columns, rows } => f
                .debug_struct("Rows")
                .field("columns", columns)
                .field("rows", rows)
                .finish(),
            Self::RawRows { columns, rows, tag } => f
                .debug_struct("RawRows")
                .field("columns", columns)
                .field("rows", rows)
                .field("tag", tag)
                .finish(),
            Self::Command(tag) => f.debug_tuple("Command").field(tag).finish(),
            Self::Empty => f.write_str("Empty"),
            Self::Error {
                severity,
                code,
                message,
            } => f
                .debug_struct("Error")
                .field("severity", severity)
                .field("code", code)
                .field("message", message)
                .finish(),
            Self::Multi(parts) => f.debug_tuple("Multi").field(parts).finish(),
            Self::Delayed(delay, inner) => f.debug_tuple("Delayed").field(delay).field(inner).finish(),
            Self::CopyIn => f.write_str("CopyIn"),
            Self::Disconnect => f.write_str("Disconnect"),
            Self::Custom(_) => f.debug_tuple("Custom").field(&"<fn>").finish(),
        }
    }
}

impl MockResponse {
    /// Create a single-row, single-column `int4` response.
    pub fn scalar_int(value: i32) -> Self {
        Self::rows(
            vec![MockColumn::new("?column?", INT4_OID)],
            vec![vec![Some(value.to_string())]],
        )
    }

    /// Create a single-row, single-column `int8` response.
    pub fn scalar_bigint(value: i64) -> Self {
        Self::rows(
            vec![MockColumn::new("?column?", INT8_OID)],
            vec![vec![Some(value.to_string())]],
        )
    }

    /// Create a single-row, single-column `text` response.
    pub fn scalar_string(value: impl Into<String>) -> Self {
        Self::rows(
            vec![MockColumn::new("?column?", TEXT_OID)],
            vec![vec![Some(value.into())]],
        )
    }

    /// Create a row response.
    pub fn rows(columns: Vec<MockColumn>, rows: Vec<Vec<Option<String>>>) -> Self {
        Self::Rows { columns, rows }
    }

    /// Create a row response from raw field bytes.
    pub fn raw_rows(
        columns: Vec<MockColumn>,
        rows: Vec<Vec<Option<Vec<u8>>>>,
        tag: impl Into<String>,
    ) -> Self {
        Self::RawRows {
            columns,
            rows,
            tag: tag.into(),
        }
    }

    /// Create a command completion with the given tag (`INSERT 0 3`, ...).
    pub fn command(tag: impl Into<String>) -> Self {
        Self::Command(tag.into())
    }

    /// Create an `EmptyQueryResponse`.
    pub fn empty() -> Self {
        Self::Empty
    }

    /// Create an `ERROR` response.
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            severity: "ERROR".into(),
            code: code.into(),
            message: message.into(),
        }
    }

    /// Create a `FATAL` response; the server closes the connection after it.
    pub fn fatal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            severity: "FATAL".into(),
            code: code.into(),
            message: message.into(),
        }
    }

    /// Create a multi-result response for a simple query.
    pub fn multi(parts: Vec<MockResponse>) -> Self {
        Self::Multi(parts)
    }

    /// Delay this response.
    #[must_use]
    pub fn delayed(self, delay: Duration) -> Self {
        Self::Delayed(delay, Box::new(self))
    }

    /// Create a response that starts `COPY FROM STDIN`.
    pub fn copy_in() -> Self {
        Self::CopyIn
    }

    /// Create a response that drops the connection.
    pub fn disconnect() -> Self {
        Self::Disconnect
    }

    /// Create a response computed from the SQL text and parameters.
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&str, &[Option<String>]) -> MockResponse + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(f))
    }
}

/// Column definition for mock responses.
#[derive(Debug, Clone)]
pub struct MockColumn {
    /// Column name.
    pub name: String,
    /// Type OID.
    pub type_oid: u32,
}

impl MockColumn {
    /// Create a column definition.
    pub fn new(name: impl Into<String>, type_oid: u32) -> Self {
        Self {
            name: name.into(),
            type_oid,
        }
    }

    /// Create an `int4` column.
    pub fn int(name: impl Into<String>) -> Self {
        Self::new(name, INT4_OID)
    }

    /// Create a `text` column.
    pub fn text(name: impl Into<String>) -> Self {
        Self::new(name, TEXT_OID)
    }
}

/// Configuration for the mock server.
pub struct MockServerConfig {
    /// Pre-configured responses keyed by trimmed SQL text.
    responses: HashMap<String, MockResponse>,
    /// Response for unmatched queries; a tag is synthesized when unset.
    default_response: Option<MockResponse>,
    /// Authentication method.
    auth: AuthMode,
    /// Parameters reported with `ParameterStatus` after login.
    parameters: Vec<(String, String)>,
}

/// Builder for [`MockServer`].
pub struct MockServerBuilder {
    config: MockServerConfig,
}

impl MockServerBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        let mut responses = HashMap::new();
        responses.insert("SELECT 1".to_string(), MockResponse::scalar_int(1));
        Self {
            config: MockServerConfig {
                responses,
                default_response: None,
                auth: AuthMode::Trust,
                parameters: vec![
                    ("server_version".into(), "16.0 (fenrir mock)".into()),
                    ("server_encoding".into(), "UTF8".into()),
                    ("client_encoding".into(), "UTF8".into()),
                    ("DateStyle".into(), "ISO, MDY".into()),
                    ("TimeZone".into(), "UTC".into()),
                    ("integer_datetimes".into(), "on".into()),
                    ("standard_conforming_strings".into(), "on".into()),
                ],
            },
        }
    }

    /// Add a response for a specific SQL text.
    pub fn with_response(mut self, sql: impl Into<String>, response: MockResponse) -> Self {
        self.config.responses.insert(sql.into().trim().to_string(), response);
        self
    }

    /// Set the default response for unmatched queries.
    pub fn with_default_response(mut self, response: MockResponse) -> Self {
        self.config.default_response = Some(response);
        self
    }

    /// Set the authentication method.
    pub fn with_auth(mut self, auth: AuthMode) -> Self {
        self.config.auth = auth;
        self
    }

    /// Report an extra (or overriding) server parameter after login.
    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        let value = value.into();
        match self.config.parameters.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = value,
            None => self.config.parameters.push((name, value)),
        }
        self
    }

    /// Build and start the mock server.
    pub fn start(self) -> Result<MockServer> {
        MockServer::start(self.config)
    }
}

impl Default for MockServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// State shared between the handle and the server thread.
struct Shared {
    config: MockServerConfig,
    active: AtomicUsize,
    accepted: AtomicUsize,
    reject_logins: AtomicBool,
    next_pid: AtomicI32,
    queries: Mutex<Vec<String>>,
    kill_tx: broadcast::Sender<()>,
}

/// A mock PostgreSQL server for testing.
///
/// The server runs on a dedicated thread with a single-threaded runtime and
/// listens on an ephemeral port of `127.0.0.1`. Dropping the handle stops
/// the server and closes every connection it holds.
pub struct MockServer {
    /// Server address.
    addr: SocketAddr,
    /// Shutdown signal sender.
    shutdown_tx: broadcast::Sender<()>,
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl MockServer {
    /// Create a new builder for the mock server.
    pub fn builder() -> MockServerBuilder {
        MockServerBuilder::new()
    }

    /// Start the mock server on an available port.
    pub fn start(config: MockServerConfig) -> Result<Self> {
        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let (kill_tx, _) = broadcast::channel(16);
        let shared = Arc::new(Shared {
            config,
            active: AtomicUsize::new(0),
            accepted: AtomicUsize::new(0),
            reject_logins: AtomicBool::new(false),
            next_pid: AtomicI32::new(10_000),
            queries: Mutex::new(Vec::new()),
            kill_tx,
        });

        let thread_shared = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name("fenrir-mock-server".into())
            .spawn(move || {
                runtime.block_on(async move {
                    match TcpListener::from_std(listener) {
                        Ok(listener) => accept_loop(listener, thread_shared, shutdown_rx).await,
                        Err(e) => tracing::error!("Failed to register listener: {}", e),
                    }
                });
                // Dropping the runtime here cancels every connection task.
            })?;

        tracing::debug!(%addr, "mock server listening");
        Ok(Self {
            addr,
            shutdown_tx,
            shared,
            thread: Some(thread),
        })
    }

    /// Get the server's listening address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Get the host string for connection configuration.
    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    /// Get the port number.
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// A `key=value` connection string pointing at this server.
    pub fn connection_string(&self) -> String {
        format!(
            "host={} port={} user=postgres dbname=postgres",
            self.host(),
            self.port()
        )
    }

    /// Number of sessions currently open.
    pub fn connection_count(&self) -> usize {
        self.shared.active.load(Ordering::SeqCst)
    }

    /// Number of TCP connections accepted since start.
    pub fn accepted_count(&self) -> usize {
        self.shared.accepted.load(Ordering::SeqCst)
    }

    /// SQL texts received so far (simple queries and parsed statements).
    pub fn queries(&self) -> Vec<String> {
        self.shared.queries.lock().clone()
    }

    /// Refuse (or accept again) new logins with a `FATAL` error.
    pub fn reject_logins(&self, reject: bool) {
        self.shared.reject_logins.store(reject, Ordering::SeqCst);
    }

    /// Terminate every live session the way an administrator would.
    ///
    /// Each session receives `FATAL 57P01` and is closed. The listener keeps
    /// accepting new connections.
    pub fn kill_connections(&self) {
        let _ = self.shared.kill_tx.send(());
    }

    /// Stop the server.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

impl fmt::Debug for MockServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockServer")
            .field("addr", &self.addr)
            .field("connections", &self.connection_count())
            .finish()
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.stop();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<Shared>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _peer_addr)) => {
                        shared.accepted.fetch_add(1, Ordering::SeqCst);
                        let kill_rx = shared.kill_tx.subscribe();
                        let shared = Arc::clone(&shared);
                        tokio::spawn(async move {
                            let _guard = ActiveGuard::new(&shared);
                            if let Err(e) = handle_connection(stream, &shared, kill_rx).await {
                                tracing::debug!("Connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("Accept error: {}", e);
                        break;
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                break;
            }
        }
    }
}

struct ActiveGuard<'a>(&'a Shared);

impl<'a> ActiveGuard<'a> {
    fn new(shared: &'a Shared) -> Self {
        shared.active.fetch_add(1, Ordering::SeqCst);
        Self(shared)
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

// What the connection loop should do after a message was handled.
enum Flow {
    Continue,
    Close,
}

// Per-connection protocol state.
struct Connection<'a> {
    shared: &'a Shared,
    writer: OwnedWriteHalf,
    out: BytesMut,
    statements: HashMap<String, String>,
    portal: Option<MockResponse>,
    // After an extended-protocol error, messages are skipped until Sync.
    skip_until_sync: bool,
    copy_in: bool,
    tx_status: u8,
}

/// Handle a single client connection.
async fn handle_connection(
    stream: TcpStream,
    shared: &Shared,
    mut kill_rx: broadcast::Receiver<()>,
) -> Result<()> {
    stream.set_nodelay(true)?;
    let (reader, writer) = stream.into_split();
    let mut frames = FramedRead::new(reader, FrontendCodec::new());
    let mut conn = Connection {
        shared,
        writer,
        out: BytesMut::new(),
        statements: HashMap::new(),
        portal: None,
        skip_until_sync: false,
        copy_in: false,
        tx_status: b'I',
    };

    // Step 1: startup and authentication
    let user = loop {
        match next_frame(&mut frames).await? {
            Some(FrontendMessage::SslRequest) => {
                conn.writer.write_all(b"N").await?;
            }
            Some(FrontendMessage::CancelRequest { process_id, .. }) => {
                tracing::debug!(process_id, "cancel request ignored");
                return Ok(());
            }
            Some(FrontendMessage::Startup { parameters }) => {
                break parameters
                    .iter()
                    .find(|(name, _)| name == "user")
                    .map(|(_, value)| value.clone())
                    .unwrap_or_default();
            }
            Some(other) => {
                return Err(MockServerError::Protocol(format!(
                    "Expected startup packet, got {other:?}"
                )));
            }
            None => return Ok(()),
        }
    };

    if shared.reject_logins.load(Ordering::SeqCst) {
        put_error(&mut conn.out, "FATAL", "53300", "sorry, too many clients already");
        conn.send().await?;
        return Ok(());
    }
    if !authenticate(&mut conn, &mut frames, &user).await? {
        return Ok(());
    }
    send_login_response(&mut conn).await?;

    // Step 2: queries until Terminate, EOF, or a kill
    loop {
        let message = tokio::select! {
            frame = next_frame(&mut frames) => frame?,
            _ = kill_rx.recv() => {
                put_error(
                    &mut conn.out,
                    "FATAL",
                    "57P01",
                    "terminating connection due to administrator command",
                );
                let _ = conn.send().await;
                return Ok(());
            }
        };
        let Some(message) = message else {
            return Ok(());
        };
        match conn.handle(message).await? {
            Flow::Continue => conn.send().await?,
            Flow::Close => {
                let _ = conn.send().await;
                return Ok(());
            }
        }
    }
}

async fn next_frame(
    frames: &mut FramedRead<tokio::net::tcp::OwnedReadHalf, FrontendCodec>,
) -> Result<Option<FrontendMessage>> {
    match frames.next().await {
        Some(Ok(message)) => Ok(Some(message)),
        Some(Err(e)) if e.kind() == std::io::ErrorKind::InvalidData => {
            Err(MockServerError::Protocol(e.to_string()))
        }
        Some(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionReset => Ok(None),
        Some(Err(e)) => Err(e.into()),
        None => Ok(None),
    }
}

// Returns false when the login was refused (the refusal has been sent).
async fn authenticate(
    conn: &mut Connection<'_>,
    frames: &mut FramedRead<tokio::net::tcp::OwnedReadHalf, FrontendCodec>,
    user: &str,
) -> Result<bool> {
    let expected = match &conn.shared.config.auth {
        AuthMode::Trust => return Ok(true),
        AuthMode::Cleartext { password } => {
            put_message(&mut conn.out, b'R', |b| b.put_i32(3));
            password.clone()
        }
        AuthMode::Md5 { password } => {
            let salt = [0x5a, 0x17, 0x3c, 0x01];
            put_message(&mut conn.out, b'R', |b| {
                b.put_i32(5);
                b.put_slice(&salt);
            });
            postgres_protocol::authentication::md5_hash(user.as_bytes(), password.as_bytes(), salt)
        }
    };
    conn.send().await?;

    let supplied = match next_frame(frames).await? {
        Some(FrontendMessage::Password(body)) => {
            let end = body.iter().position(|&b| b == 0).unwrap_or(body.len());
            String::from_utf8_lossy(&body[..end]).into_owned()
        }
        Some(other) => {
            return Err(MockServerError::Protocol(format!(
                "Expected password message, got {other:?}"
            )));
        }
        None => return Ok(false),
    };

    if supplied == expected {
        Ok(true)
    } else {
        put_error(
            &mut conn.out,
            "FATAL",
            "28P01",
            &format!("password authentication failed for user \"{user}\""),
        );
        conn.send().await?;
        Ok(false)
    }
}

async fn send_login_response(conn: &mut Connection<'_>) -> Result<()> {
    put_message(&mut conn.out, b'R', |b| b.put_i32(0));
    for (name, value) in &conn.shared.config.parameters {
        put_message(&mut conn.out, b'S', |b| {
            put_cstr(b, name);
            put_cstr(b, value);
        });
    }
    let pid = conn.shared.next_pid.fetch_add(1, Ordering::SeqCst);
    put_message(&mut conn.out, b'K', |b| {
        b.put_i32(pid);
        b.put_i32(pid.wrapping_mul(7919));
    });
    put_message(&mut conn.out, b'Z', |b| b.put_u8(b'I'));
    conn.send().await
}

impl Connection<'_> {
    async fn send(&mut self) -> Result<()> {
        if !self.out.is_empty() {
            self.writer.write_all(&self.out).await?;
            self.out.clear();
        }
        Ok(())
    }

    fn record(&self, sql: &str) {
        self.shared.queries.lock().push(sql.to_string());
    }

    async fn handle(&mut self, message: FrontendMessage) -> Result<Flow> {
        if self.copy_in {
            return Ok(self.handle_copy(message));
        }
        if self.skip_until_sync && !matches!(message, FrontendMessage::Sync | FrontendMessage::Terminate) {
            return Ok(Flow::Continue);
        }

        match message {
            FrontendMessage::Query(sql) => self.simple_query(&sql).await,
            FrontendMessage::Parse { name, query } => {
                self.record(&query);
                if let Some(MockResponse::Error {
                    severity,
                    code,
                    message,
                }) = self.parse_time_error(&query)
                {
                    return Ok(self.fail(&severity, &code, &message));
                }
                self.statements.insert(name, query);
                put_message(&mut self.out, b'1', |_| {});
                Ok(Flow::Continue)
            }
            FrontendMessage::Bind {
                statement, values, ..
            } => {
                let Some(sql) = self.statements.get(&statement).cloned() else {
                    let message = format!("prepared statement \"{statement}\" does not exist");
                    return Ok(self.fail("ERROR", "26000", &message));
                };
                let response = resolve(&self.shared.config, &sql, &values).await;
                self.portal = Some(response);
                put_message(&mut self.out, b'2', |_| {});
                Ok(Flow::Continue)
            }
            FrontendMessage::Describe { kind: b'S', .. } => {
                put_message(&mut self.out, b't', |b| b.put_i16(0));
                put_message(&mut self.out, b'n', |_| {});
                Ok(Flow::Continue)
            }
            FrontendMessage::Describe { .. } => {
                match &self.portal {
                    Some(MockResponse::Rows { columns, .. } | MockResponse::RawRows { columns, .. }) => {
                        put_row_description(&mut self.out, columns)
                    }
                    _ => put_message(&mut self.out, b'n', |_| {}),
                }
                Ok(Flow::Continue)
            }
            FrontendMessage::Execute { .. } => {
                let Some(response) = self.portal.take() else {
                    return Ok(self.fail("ERROR", "34000", "portal \"\" does not exist"));
                };
                let response = match response {
                    MockResponse::Multi(mut parts) if !parts.is_empty() => parts.remove(0),
                    other => other,
                };
                Ok(self.write_result(response, false))
            }
            FrontendMessage::Close { kind, name } => {
                if kind == b'S' {
                    self.statements.remove(&name);
                }
                put_message(&mut self.out, b'3', |_| {});
                Ok(Flow::Continue)
            }
            FrontendMessage::Sync => {
                self.skip_until_sync = false;
                self.portal = None;
                self.ready();
                Ok(Flow::Continue)
            }
            FrontendMessage::Flush | FrontendMessage::CopyData(_) | FrontendMessage::CopyDone => {
                Ok(Flow::Continue)
            }
            FrontendMessage::CopyFail(_) => Ok(Flow::Continue),
            FrontendMessage::Terminate => Ok(Flow::Close),
            other => Err(MockServerError::Protocol(format!(
                "Unexpected message after startup: {other:?}"
            ))),
        }
    }

    async fn simple_query(&mut self, sql: &str) -> Result<Flow> {
        self.record(sql);
        if sql.trim().is_empty() {
            put_message(&mut self.out, b'I', |_| {});
            self.ready();
            return Ok(Flow::Continue);
        }

        let response = resolve(&self.shared.config, sql, &[]).await;
        let parts = match response {
            MockResponse::Multi(parts) => parts,
            other => vec![other],
        };

        for part in parts {
            let part = unwrap_delays(part).await;
            if matches!(part, MockResponse::CopyIn) {
                // The reply continues once the client ends the copy.
                put_message(&mut self.out, b'G', |b| {
                    b.put_u8(0);
                    b.put_i16(0);
                });
                self.copy_in = true;
                return Ok(Flow::Continue);
            }
            let failed = matches!(part, MockResponse::Error { .. });
            if let Flow::Close = self.write_result(part, true) {
                return Ok(Flow::Close);
            }
            if failed {
                break;
            }
        }

        if !self.skip_until_sync {
            self.track_transaction(sql);
        }
        self.skip_until_sync = false;
        self.ready();
        Ok(Flow::Continue)
    }

    fn handle_copy(&mut self, message: FrontendMessage) -> Flow {
        match message {
            FrontendMessage::CopyData(_) => Flow::Continue,
            FrontendMessage::CopyDone => {
                self.copy_in = false;
                put_command_complete(&mut self.out, "COPY 0");
                self.ready();
                Flow::Continue
            }
            FrontendMessage::CopyFail(reason) => {
                self.copy_in = false;
                let message = format!("COPY from stdin failed: {reason}");
                put_error(&mut self.out, "ERROR", "57014", &message);
                self.ready();
                Flow::Continue
            }
            FrontendMessage::Terminate => Flow::Close,
            _ => Flow::Continue,
        }
    }

    fn write_result(&mut self, response: MockResponse, describe: bool) -> Flow {
        match response {
            MockResponse::Rows { columns, rows } => {
                if describe {
                    put_row_description(&mut self.out, &columns);
                }
                for row in &rows {
                    put_data_row(&mut self.out, row);
                }
                put_command_complete(&mut self.out, &format!("SELECT {}", rows.len()));
                Flow::Continue
            }
            MockResponse::RawRows { columns, rows, tag } => {
                if describe {
                    put_row_description(&mut self.out, &columns);
                }
                for row in &rows {
                    put_data_row(&mut self.out, row);
                }
                put_command_complete(&mut self.out, &tag);
                Flow::Continue
            }
            MockResponse::Command(tag) => {
                put_command_complete(&mut self.out, &tag);
                Flow::Continue
            }
            MockResponse::Empty => {
                put_message(&mut self.out, b'I', |_| {});
                Flow::Continue
            }
            MockResponse::Error {
                severity,
                code,
                message,
            } => self.fail(&severity, &code, &message),
            MockResponse::Disconnect => Flow::Close,
            // Delays and custom responses are resolved before this point;
            // nested multi-results and copies are not meaningful here.
            MockResponse::Multi(_)
            | MockResponse::Delayed(..)
            | MockResponse::Custom(_)
            | MockResponse::CopyIn => {
                put_error(&mut self.out, "ERROR", "0A000", "unsupported mock response");
                self.skip_until_sync = true;
                Flow::Continue
            }
        }
    }

    fn fail(&mut self, severity: &str, code: &str, message: &str) -> Flow {
        put_error(&mut self.out, severity, code, message);
        if severity == "FATAL" {
            return Flow::Close;
        }
        self.skip_until_sync = true;
        if self.tx_status == b'T' {
            self.tx_status = b'E';
        }
        Flow::Continue
    }

    fn ready(&mut self) {
        let status = self.tx_status;
        put_message(&mut self.out, b'Z', |b| b.put_u8(status));
    }

    fn track_transaction(&mut self, sql: &str) {
        let keyword = sql
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .trim_end_matches(';')
            .to_ascii_uppercase();
        match keyword.as_str() {
            "BEGIN" | "START" => self.tx_status = b'T',
            "COMMIT" | "END" | "ROLLBACK" | "ABORT" => self.tx_status = b'I',
            _ => {}
        }
    }

    // Statically configured errors surface at Parse, as syntax errors do.
    fn parse_time_error(&self, sql: &str) -> Option<MockResponse> {
        let config = &self.shared.config;
        let response = config
            .responses
            .get(sql.trim())
            .or(config.default_response.as_ref())?;
        match response {
            MockResponse::Error { .. } => Some(response.clone()),
            _ => None,
        }
    }
}

/// Find the response for `sql`, evaluating custom handlers and delays.
async fn resolve(config: &MockServerConfig, sql: &str, params: &[Option<String>]) -> MockResponse {
    let response = config
        .responses
        .get(sql.trim())
        .or(config.default_response.as_ref())
        .cloned()
        .unwrap_or_else(|| synthesize_tag(sql));
    let response = unwrap_delays(response).await;
    match response {
        MockResponse::Custom(f) => unwrap_delays(f(sql, params)).await,
        other => other,
    }
}

async fn unwrap_delays(mut response: MockResponse) -> MockResponse {
    while let MockResponse::Delayed(delay, inner) = response {
        tokio::time::sleep(delay).await;
        response = *inner;
    }
    response
}

// Unmatched statements complete with their leading keyword as the tag.
fn synthesize_tag(sql: &str) -> MockResponse {
    let keyword = sql
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .trim_end_matches(';')
        .to_ascii_uppercase();
    let tag = match keyword.as_str() {
        "INSERT" => "INSERT 0 0".to_string(),
        "UPDATE" | "DELETE" | "SELECT" | "MOVE" | "FETCH" | "COPY" => format!("{keyword} 0"),
        "START" => "START TRANSACTION".to_string(),
        _ => keyword,
    };
    MockResponse::Command(tag)
}

// =============================================================================
// Backend message encoding
// =============================================================================

fn put_message(buf: &mut BytesMut, tag: u8, body: impl FnOnce(&mut BytesMut)) {
    buf.put_u8(tag);
    let start = buf.len();
    buf.put_i32(0);
    body(buf);
    let len = (buf.len() - start) as i32;
    buf[start..start + 4].copy_from_slice(&len.to_be_bytes());
}

fn put_cstr(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

fn put_error(buf: &mut BytesMut, severity: &str, code: &str, message: &str) {
    put_message(buf, b'E', |b| {
        b.put_u8(b'S');
        put_cstr(b, severity);
        b.put_u8(b'V');
        put_cstr(b, severity);
        b.put_u8(b'C');
        put_cstr(b, code);
        b.put_u8(b'M');
        put_cstr(b, message);
        b.put_u8(0);
    });
}

fn put_row_description(buf: &mut BytesMut, columns: &[MockColumn]) {
    put_message(buf, b'T', |b| {
        b.put_i16(columns.len() as i16);
        for column in columns {
            put_cstr(b, &column.name);
            b.put_u32(0); // table oid
            b.put_i16(0); // attribute number
            b.put_u32(column.type_oid);
            b.put_i16(-1); // type size
            b.put_i32(-1); // type modifier
            b.put_i16(0); // text format
        }
    });
}

fn put_data_row<T: AsRef<[u8]>>(buf: &mut BytesMut, row: &[Option<T>]) {
    put_message(buf, b'D', |b| {
        b.put_i16(row.len() as i16);
        for field in row {
            match field {
                Some(value) => {
                    let bytes = value.as_ref();
                    b.put_i32(bytes.len() as i32);
                    b.put_slice(bytes);
                }
                None => b.put_i32(-1),
            }
        }
    });
}

fn put_command_complete(buf: &mut BytesMut, tag: &str) {
    put_message(buf, b'C', |b| put_cstr(b, tag));
}
