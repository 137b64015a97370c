//! PostgreSQL connection.
//!
//! A [`Connection`] owns one server session exclusively. It is either
//! connected or dead; a dead connection only accepts [`Connection::reset`],
//! [`Connection::close`], and the status accessors until it reconnects.
//!
//! Commands run on one of two paths with identical results:
//!
//! - `execute*` blocks the calling thread until the reply arrives.
//! - `async_execute*` suspends on socket readiness and requires a tokio
//!   runtime handle attached through [`Config::runtime`] or
//!   [`Connection::set_runtime`].
//!
//! ```rust,ignore
//! use fenrir_client::Connection;
//!
//! let mut conn = Connection::connect("host=localhost user=app dbname=app")?;
//! let cursor = conn.execute_with_params(
//!     "SELECT name FROM users WHERE id = $1",
//!     &[&42i32],
//! )?;
//! ```

use fenrir_codec::{CodecError, RawResult, Session};
use fenrir_types::ToSql;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::runtime::Handle;

use crate::config::Config;
use crate::cursor::ResultCursor;
use crate::error::{Error, Result};
use crate::state::{ConnectionStatus, TransactionState};
use crate::statement_cache::{PreparedStatement, StatementCache};
use crate::wait;

/// `last_error` text of a connection without a session.
const NO_CONNECTION: &str = "No connection";

/// A connection to a PostgreSQL server.
///
/// The connection is move-only: the underlying session cannot be shared,
/// so neither `Clone` nor `Copy` is implemented. Dropping it closes the
/// session.
pub struct Connection {
    session: Option<Session>,
    config: Config,
    runtime: Option<Handle>,
    statements: StatementCache,
    last_error: String,
}

impl Connection {
    /// Connect using a `key=value` connection string.
    pub fn connect(conn_str: &str) -> Result<Self> {
        let config = Config::from_connection_string(conn_str)?;
        Self::connect_with(config)
    }

    /// Connect using a structured configuration.
    ///
    /// The handshake runs to completion here; on failure the partially
    /// opened socket is closed before the error is returned.
    pub fn connect_with(config: Config) -> Result<Self> {
        config.validate()?;

        let session = Session::connect(config.to_session_params())
            .map_err(|e| Error::ConnectionFailed(e.to_string()))?;

        tracing::info!(
            host = %config.host,
            port = config.port,
            database = config.database.as_deref(),
            backend_pid = session.backend_key().map(|k| k.process_id),
            "connection established"
        );

        Ok(Self {
            session: Some(session),
            runtime: config.runtime.clone(),
            config,
            statements: StatementCache::default(),
            last_error: String::new(),
        })
    }

    /// Check if the session is open and healthy. Never fails.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.session.as_ref().is_some_and(Session::is_ok)
    }

    /// Connection status.
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        match &self.session {
            Some(session) => session.status().into(),
            None => ConnectionStatus::Bad,
        }
    }

    /// Transaction status last reported by the server.
    #[must_use]
    pub fn transaction_status(&self) -> TransactionState {
        self.session
            .as_ref()
            .map_or(TransactionState::Unknown, Session::transaction_status)
    }

    /// Text of the most recent error, or `"No connection"` after
    /// [`close`](Self::close).
    #[must_use]
    pub fn last_error(&self) -> &str {
        &self.last_error
    }

    /// Configured database name.
    #[must_use]
    pub fn database_name(&self) -> Option<&str> {
        self.config.database.as_deref()
    }

    /// Role the session logged in as.
    #[must_use]
    pub fn user_name(&self) -> Option<&str> {
        match &self.session {
            Some(session) => Some(session.params().user.as_str()),
            None => self.config.user.as_deref(),
        }
    }

    /// Server host.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.config.host
    }

    /// Server port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.config.port
    }

    /// A parameter the server reported, such as `server_version`.
    #[must_use]
    pub fn server_parameter(&self, name: &str) -> Option<&str> {
        self.session.as_ref()?.parameter(name)
    }

    /// Process ID of the server backend serving this connection.
    #[must_use]
    pub fn backend_pid(&self) -> Option<i32> {
        self.session
            .as_ref()?
            .backend_key()
            .map(|key| key.process_id)
    }

    /// The configuration this connection was opened with.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Prepared statements tracked for this session.
    #[must_use]
    pub fn statement_cache(&self) -> &StatementCache {
        &self.statements
    }

    /// Attach the runtime used by async operations.
    pub fn set_runtime(&mut self, runtime: Handle) {
        self.runtime = Some(runtime);
    }

    /// The runtime used by async operations, if attached.
    #[must_use]
    pub fn runtime(&self) -> Option<&Handle> {
        self.runtime.as_ref()
    }

    /// Execute command text, blocking until the reply arrives.
    ///
    /// The text may contain several statements; the first result is
    /// returned unless any statement failed, in which case that error is.
    pub fn execute(&mut self, sql: &str) -> Result<ResultCursor> {
        tracing::debug!(sql = sql, "executing command");
        let outcome = live(&mut self.session)
            .and_then(|session| wait::execute_blocking(session, |s| s.queue_query(sql)));
        self.finish(outcome)
    }

    /// Execute a single statement with `$n` parameters, blocking until the
    /// reply arrives.
    ///
    /// Values are sent separately from the command text, never spliced
    /// into it. `None` values are sent as NULL.
    pub fn execute_with_params(
        &mut self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<ResultCursor> {
        tracing::debug!(sql = sql, params_count = params.len(), "executing command");
        let outcome = wire_values(params).and_then(|values| {
            let session = live(&mut self.session)?;
            wait::execute_blocking(session, |s| s.queue_query_params(sql, &values))
        });
        self.finish(outcome)
    }

    /// Execute command text without blocking the calling thread.
    pub async fn async_execute(&mut self, sql: &str) -> Result<ResultCursor> {
        tracing::debug!(sql = sql, "executing command asynchronously");
        let outcome = self.run_async(|s| s.queue_query(sql)).await;
        self.finish(outcome)
    }

    /// Execute a single parameterized statement without blocking the
    /// calling thread.
    pub async fn async_execute_params(
        &mut self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<ResultCursor> {
        tracing::debug!(
            sql = sql,
            params_count = params.len(),
            "executing command asynchronously"
        );
        let outcome = match wire_values(params) {
            Ok(values) => {
                self.run_async(|s| s.queue_query_params(sql, &values))
                    .await
            }
            Err(e) => Err(e),
        };
        self.finish(outcome)
    }

    /// Prepare a named statement on the server.
    ///
    /// Preparing a name that already exists replaces it. When the statement
    /// cache is full, the least recently used statement is closed in the
    /// same round-trip.
    pub fn prepare(&mut self, name: &str, sql: &str) -> Result<()> {
        if let Err(e) = validate_identifier(name) {
            return Err(self.fail(e));
        }
        let evict = self.evictions_for(name);
        tracing::debug!(statement = name, evicting = ?evict, "preparing statement");

        let outcome = live(&mut self.session).and_then(|session| {
            wait::execute_blocking(session, |s| s.queue_prepare(name, sql, &evict))
        });
        self.finish_prepare(name, sql, &evict, outcome)
    }

    /// Prepare a named statement without blocking the calling thread.
    pub async fn async_prepare(&mut self, name: &str, sql: &str) -> Result<()> {
        if let Err(e) = validate_identifier(name) {
            return Err(self.fail(e));
        }
        let evict = self.evictions_for(name);
        tracing::debug!(statement = name, evicting = ?evict, "preparing statement asynchronously");

        let outcome = self
            .run_async(|s| s.queue_prepare(name, sql, &evict))
            .await;
        self.finish_prepare(name, sql, &evict, outcome)
    }

    /// Execute a statement prepared with [`prepare`](Self::prepare).
    pub fn execute_prepared(
        &mut self,
        name: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<ResultCursor> {
        tracing::debug!(statement = name, params_count = params.len(), "executing prepared statement");
        let outcome = wire_values(params).and_then(|values| {
            let session = live(&mut self.session)?;
            if self.statements.get(name).is_none() {
                return Err(Error::UnknownStatement(name.to_string()));
            }
            wait::execute_blocking(session, |s| s.queue_query_prepared(name, &values))
        });
        self.finish(outcome)
    }

    /// Execute a prepared statement without blocking the calling thread.
    pub async fn async_execute_prepared(
        &mut self,
        name: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<ResultCursor> {
        tracing::debug!(
            statement = name,
            params_count = params.len(),
            "executing prepared statement asynchronously"
        );
        let values = match wire_values(params) {
            Ok(values) => values,
            Err(e) => return Err(self.fail(e)),
        };
        if self.is_connected() && self.statements.get(name).is_none() {
            return Err(self.fail(Error::UnknownStatement(name.to_string())));
        }
        let outcome = self
            .run_async(|s| s.queue_query_prepared(name, &values))
            .await;
        self.finish(outcome)
    }

    /// Round-trip a trivial command. Never fails.
    pub fn ping(&mut self) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.execute("SELECT 1").is_ok()
    }

    /// Re-establish the session with the original parameters.
    ///
    /// Works on a dead or closed connection. Prepared statements do not
    /// survive and are forgotten.
    pub fn reset(&mut self) -> Result<()> {
        tracing::debug!(host = %self.config.host, port = self.config.port, "resetting connection");
        self.statements.clear();

        let outcome = match self.session.as_mut() {
            Some(session) => session.reset(),
            None => Session::connect(self.config.to_session_params()).map(|fresh| {
                self.session = Some(fresh);
            }),
        };

        match outcome {
            Ok(()) => {
                self.last_error.clear();
                tracing::info!(
                    host = %self.config.host,
                    port = self.config.port,
                    backend_pid = self.backend_pid(),
                    "connection reset"
                );
                Ok(())
            }
            Err(e) => Err(self.fail(Error::ConnectionFailed(e.to_string()))),
        }
    }

    /// Close the session. Safe to call repeatedly.
    pub fn close(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close();
            tracing::info!(host = %self.config.host, port = self.config.port, "connection closed");
        }
        self.statements.clear();
        self.last_error = NO_CONNECTION.to_string();
    }

    async fn run_async<F>(&mut self, queue: F) -> Result<RawResult>
    where
        F: FnOnce(&mut Session) -> std::result::Result<(), CodecError>,
    {
        let runtime = self.runtime.clone().ok_or_else(|| {
            Error::NotConfigured("async operations need a tokio runtime handle".into())
        })?;
        let session = live(&mut self.session)?;
        wait::execute_async(session, &runtime, queue).await
    }

    fn evictions_for(&self, name: &str) -> Vec<String> {
        // An existing statement of the same name is closed first, since the
        // server refuses to parse over it.
        if self.statements.contains(name) {
            return vec![name.to_string()];
        }
        self.statements
            .eviction_candidate(name)
            .map(|old| vec![old.to_string()])
            .unwrap_or_default()
    }

    fn finish_prepare(
        &mut self,
        name: &str,
        sql: &str,
        evicted: &[String],
        outcome: Result<RawResult>,
    ) -> Result<()> {
        if outcome.is_ok() || self.is_connected() {
            // The closes ran ahead of the parse, whatever its outcome.
            for old in evicted {
                self.statements.remove(old);
            }
        }
        match outcome {
            Ok(_) => {
                self.statements.insert(PreparedStatement::new(name, sql));
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    fn finish(&mut self, outcome: Result<RawResult>) -> Result<ResultCursor> {
        match outcome {
            Ok(result) => Ok(ResultCursor::new(result)),
            Err(e) => Err(self.fail(e)),
        }
    }

    fn fail(&mut self, err: Error) -> Error {
        // Keep the reason the session died rather than overwriting it.
        if !matches!(err, Error::NotConnected) {
            self.last_error = err.to_string();
        }
        err
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("database", &self.config.database)
            .field("status", &self.status())
            .field("async", &self.runtime.is_some())
            .field("prepared_statements", &self.statements.len())
            .finish()
    }
}

// Borrow the session only if it is usable.
fn live(session: &mut Option<Session>) -> Result<&mut Session> {
    match session {
        Some(session) if session.is_ok() => Ok(session),
        _ => Err(Error::NotConnected),
    }
}

fn wire_values(params: &[&(dyn ToSql + Sync)]) -> Result<Vec<Option<String>>> {
    params
        .iter()
        .map(|param| param.to_wire_text().map_err(Error::from))
        .collect()
}

/// Validate a prepared statement name.
fn validate_identifier(name: &str) -> Result<()> {
    // Compile-time constant pattern.
    #[allow(clippy::unwrap_used)]
    static IDENTIFIER_RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$").unwrap());

    if name.is_empty() {
        return Err(Error::InvalidIdentifier(
            "identifier cannot be empty".into(),
        ));
    }

    if !IDENTIFIER_RE.is_match(name) {
        return Err(Error::InvalidIdentifier(format!(
            "invalid identifier '{name}': must start with a letter or underscore, \
             contain only alphanumerics and underscores, and be 1-63 characters"
        )));
    }

    Ok(())
}
