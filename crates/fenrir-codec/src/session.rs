//! The native session handle.
//!
//! A [`Session`] owns one TCP connection to the server and exposes the
//! primitives the client layer is built from:
//!
//! - queue a command (`queue_*`) and push it out with [`Session::flush`]
//! - pull whatever input is available with [`Session::consume_input`]
//! - ask whether the reply is complete with [`Session::is_busy`]
//! - collect completed results with [`Session::take_result`]
//!
//! [`Session::wait_blocking`] composes these for the blocking path. The
//! async path drives the same primitives from socket readiness events.
//! The handle is move-only; dropping it sends `Terminate` and closes the
//! socket.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use postgres_protocol::IsNull;
use postgres_protocol::message::backend::Message;
use postgres_protocol::message::frontend;
use tokio_util::codec::Decoder;

use crate::codec::BackendCodec;
use crate::error::CodecError;
use crate::reply::{CommandKind, DbError, RawResult, ReplyAssembler};

const READ_CHUNK: usize = 8 * 1024;

/// Parameters needed to open a session.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionParams {
    /// Host name or address.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Role to log in as.
    pub user: String,
    /// Database to connect to; the server defaults it to the user name.
    pub database: Option<String>,
    /// Password, if the server asks for one.
    pub password: Option<String>,
    /// Bound on TCP connect plus startup; zero waits indefinitely.
    pub connect_timeout: Duration,
    /// Reported in `pg_stat_activity.application_name`.
    pub application_name: Option<String>,
    /// Client-side character encoding.
    pub client_encoding: Option<String>,
    /// Extra command-line options sent at startup (`-c key=value ...`).
    pub options: Option<String>,
}

impl std::fmt::Debug for SessionParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionParams")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("database", &self.database)
            .field("password", &self.password.as_ref().map(|_| "********"))
            .field("connect_timeout", &self.connect_timeout)
            .field("application_name", &self.application_name)
            .field("client_encoding", &self.client_encoding)
            .field("options", &self.options)
            .finish()
    }
}

/// Transport status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Startup completed and the transport is healthy.
    Ok,
    /// The transport failed or the session was closed.
    Bad,
}

/// Transaction status reported with each `ReadyForQuery`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Not in a transaction block.
    Idle,
    /// In a transaction block.
    InTransaction,
    /// In a failed transaction block; commands are rejected until rollback.
    InError,
    /// No status has been reported yet.
    Unknown,
}

impl TransactionStatus {
    fn from_byte(b: u8) -> Self {
        match b {
            b'I' => Self::Idle,
            b'T' => Self::InTransaction,
            b'E' => Self::InError,
            _ => Self::Unknown,
        }
    }
}

/// Key for out-of-band cancellation requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendKey {
    /// Server process ID.
    pub process_id: i32,
    /// Secret key.
    pub secret_key: i32,
}

/// A live session with the server.
#[derive(Debug)]
pub struct Session {
    pub(crate) params: SessionParams,
    stream: Option<TcpStream>,
    read_buf: BytesMut,
    pub(crate) write_buf: BytesMut,
    codec: BackendCodec,
    status: SessionStatus,
    tx_status: TransactionStatus,
    pub(crate) server_params: HashMap<String, String>,
    pub(crate) backend_key: Option<BackendKey>,
    assembler: ReplyAssembler,
    last_error: String,
    nonblocking: bool,
}

impl Session {
    /// Open a TCP connection and complete startup.
    ///
    /// On failure the socket is closed before the error is returned.
    pub fn connect(params: SessionParams) -> Result<Self, CodecError> {
        tracing::debug!(host = %params.host, port = params.port, "opening session");

        let stream = open_stream(&params)?;
        let mut session = Self {
            params,
            stream: Some(stream),
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            write_buf: BytesMut::new(),
            codec: BackendCodec::new(),
            status: SessionStatus::Bad,
            tx_status: TransactionStatus::Unknown,
            server_params: HashMap::new(),
            backend_key: None,
            assembler: ReplyAssembler::new(),
            last_error: String::new(),
            nonblocking: false,
        };

        crate::startup::handshake(&mut session)?;
        session.status = SessionStatus::Ok;

        tracing::debug!(
            backend_pid = session.backend_key.map(|k| k.process_id),
            server_version = session.server_params.get("server_version").map(String::as_str),
            "session ready"
        );
        Ok(session)
    }

    /// Parameters this session was opened with.
    #[must_use]
    pub fn params(&self) -> &SessionParams {
        &self.params
    }

    /// Transport status.
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// Check that the socket is open and the transport is healthy.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.stream.is_some() && self.status == SessionStatus::Ok
    }

    /// Transaction status from the last `ReadyForQuery`.
    #[must_use]
    pub fn transaction_status(&self) -> TransactionStatus {
        self.tx_status
    }

    /// A run-time parameter reported by the server (`server_version`, ...).
    #[must_use]
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.server_params.get(name).map(String::as_str)
    }

    /// Cancellation key, if the server sent one.
    #[must_use]
    pub fn backend_key(&self) -> Option<BackendKey> {
        self.backend_key
    }

    /// Text of the most recent failure.
    #[must_use]
    pub fn last_error(&self) -> &str {
        &self.last_error
    }

    /// Check if a queued command is still awaiting its reply.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.assembler.in_flight() > 0
    }

    /// Check if queued output has not been written yet.
    #[must_use]
    pub fn has_pending_output(&self) -> bool {
        !self.write_buf.is_empty()
    }

    /// Whether the socket is in non-blocking mode.
    #[must_use]
    pub fn is_nonblocking(&self) -> bool {
        self.nonblocking
    }

    /// Switch the socket between blocking and non-blocking mode.
    pub fn set_nonblocking(&mut self, nonblocking: bool) -> Result<(), CodecError> {
        if self.nonblocking == nonblocking {
            return Ok(());
        }
        let stream = self.stream.as_ref().ok_or(CodecError::Closed)?;
        stream.set_nonblocking(nonblocking)?;
        self.nonblocking = nonblocking;
        Ok(())
    }

    /// Duplicate the socket handle so it can be registered with a reactor.
    ///
    /// The duplicate shares blocking mode and readiness with the original.
    pub fn try_clone_stream(&self) -> Result<TcpStream, CodecError> {
        let stream = self.stream.as_ref().ok_or(CodecError::Closed)?;
        Ok(stream.try_clone()?)
    }

    /// Queue a simple-protocol query. The text may hold several statements.
    pub fn queue_query(&mut self, sql: &str) -> Result<(), CodecError> {
        self.ensure_idle()?;
        let mark = self.write_buf.len();
        if let Err(e) = frontend::query(sql, &mut self.write_buf) {
            self.write_buf.truncate(mark);
            return Err(e.into());
        }
        self.assembler.begin(CommandKind::Simple);
        tracing::trace!(len = sql.len(), "queued simple query");
        Ok(())
    }

    /// Queue an extended-protocol execution of `sql` with text parameters.
    ///
    /// `None` values are sent as NULL.
    pub fn queue_query_params(&mut self, sql: &str, values: &[Option<String>]) -> Result<(), CodecError> {
        self.ensure_idle()?;
        let mark = self.write_buf.len();
        let result = frontend::parse("", sql, std::iter::empty(), &mut self.write_buf)
            .map_err(CodecError::from)
            .and_then(|()| self.write_execute("", values));
        if let Err(e) = result {
            self.write_buf.truncate(mark);
            return Err(e);
        }
        self.assembler.begin(CommandKind::Extended);
        tracing::trace!(len = sql.len(), params = values.len(), "queued parameterized query");
        Ok(())
    }

    /// Queue preparation of a named statement.
    ///
    /// Statements listed in `evict` are closed on the server in the same
    /// round-trip, before the new one is parsed.
    pub fn queue_prepare(&mut self, name: &str, sql: &str, evict: &[String]) -> Result<(), CodecError> {
        self.ensure_idle()?;
        let mark = self.write_buf.len();
        let result = (|| -> Result<(), CodecError> {
            for old in evict {
                frontend::close(b'S', old, &mut self.write_buf)?;
            }
            frontend::parse(name, sql, std::iter::empty(), &mut self.write_buf)?;
            frontend::sync(&mut self.write_buf);
            Ok(())
        })();
        if let Err(e) = result {
            self.write_buf.truncate(mark);
            return Err(e);
        }
        self.assembler.begin(CommandKind::Prepare);
        tracing::trace!(statement = name, evicted = evict.len(), "queued prepare");
        Ok(())
    }

    /// Queue execution of a previously prepared statement.
    pub fn queue_query_prepared(&mut self, name: &str, values: &[Option<String>]) -> Result<(), CodecError> {
        self.ensure_idle()?;
        let mark = self.write_buf.len();
        if let Err(e) = self.write_execute(name, values) {
            self.write_buf.truncate(mark);
            return Err(e);
        }
        self.assembler.begin(CommandKind::Extended);
        tracing::trace!(statement = name, params = values.len(), "queued prepared execution");
        Ok(())
    }

    // Bind + Describe + Execute + Sync against `statement` ("" = unnamed).
    fn write_execute(&mut self, statement: &str, values: &[Option<String>]) -> Result<(), CodecError> {
        let bound = frontend::bind(
            "",
            statement,
            std::iter::empty(),
            values.iter(),
            |value, buf| match value {
                Some(text) => {
                    buf.put_slice(text.as_bytes());
                    Ok(IsNull::No)
                }
                None => Ok(IsNull::Yes),
            },
            Some(0),
            &mut self.write_buf,
        );
        match bound {
            Ok(()) => {}
            Err(frontend::BindError::Conversion(e)) => {
                return Err(CodecError::Protocol(format!("parameter conversion failed: {e}")));
            }
            Err(frontend::BindError::Serialization(e)) => return Err(e.into()),
        }
        frontend::describe(b'P', "", &mut self.write_buf)?;
        frontend::execute("", 0, &mut self.write_buf)?;
        frontend::sync(&mut self.write_buf);
        Ok(())
    }

    fn ensure_idle(&self) -> Result<(), CodecError> {
        if !self.is_ok() {
            return Err(CodecError::Closed);
        }
        if self.is_busy() {
            return Err(CodecError::Busy);
        }
        Ok(())
    }

    /// Write queued output.
    ///
    /// Returns `Ok(true)` once everything is written. In non-blocking mode
    /// `Ok(false)` means the socket is full and the caller should wait for
    /// writability before calling again.
    pub fn flush(&mut self) -> Result<bool, CodecError> {
        while !self.write_buf.is_empty() {
            let Some(stream) = self.stream.as_mut() else {
                return Err(CodecError::Closed);
            };
            match stream.write(&self.write_buf) {
                Ok(0) => return Err(self.fail(CodecError::ConnectionClosed)),
                Ok(n) => self.write_buf.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(self.fail(CodecError::Io(e))),
            }
        }
        Ok(true)
    }

    /// Read whatever input is available and fold it into results.
    ///
    /// In non-blocking mode this reads until the socket would block. In
    /// blocking mode it performs exactly one read. On transport failure the
    /// session is marked bad; results that arrived before the failure (for
    /// instance a `FATAL` error) stay collectable.
    pub fn consume_input(&mut self) -> Result<(), CodecError> {
        loop {
            match self.read_some() {
                Ok(Some(_)) if self.nonblocking => continue,
                Ok(_) => break,
                Err(e) => {
                    let _ = self.process_messages();
                    return Err(self.fail(e));
                }
            }
        }
        self.process_messages()
    }

    /// Flush queued output and block until every queued command has replied.
    pub fn wait_blocking(&mut self) -> Result<(), CodecError> {
        self.set_nonblocking(false)?;
        self.flush()?;
        while self.is_busy() {
            self.consume_input()?;
            // Copy-in refusal queues output mid-reply.
            if self.has_pending_output() {
                self.flush()?;
            }
        }
        Ok(())
    }

    /// Pop the oldest completed result.
    pub fn take_result(&mut self) -> Option<RawResult> {
        self.assembler.take()
    }

    /// Close the current socket and open a new session with the same
    /// parameters.
    pub fn reset(&mut self) -> Result<(), CodecError> {
        tracing::debug!(host = %self.params.host, port = self.params.port, "resetting session");
        self.close();
        match Self::connect(self.params.clone()) {
            Ok(fresh) => {
                *self = fresh;
                Ok(())
            }
            Err(e) => {
                self.last_error = e.to_string();
                Err(e)
            }
        }
    }

    /// Send `Terminate` and close the socket. Safe to call repeatedly.
    pub fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let mut buf = BytesMut::new();
            frontend::terminate(&mut buf);
            // Best effort: the server may already be gone.
            let _ = stream.set_nonblocking(false);
            if let Err(e) = stream.write_all(&buf) {
                tracing::debug!(error = %e, "failed to send terminate");
            }
            let _ = stream.shutdown(Shutdown::Both);
            tracing::debug!(host = %self.params.host, port = self.params.port, "session closed");
        }
        self.status = SessionStatus::Bad;
        self.nonblocking = false;
        self.read_buf.clear();
        self.write_buf.clear();
        self.assembler.clear();
    }

    /// Read one message during startup, blocking up to the I/O timeout.
    pub(crate) fn read_message_blocking(&mut self) -> Result<Message, CodecError> {
        loop {
            if let Some(message) = self.codec.decode(&mut self.read_buf)? {
                return Ok(message);
            }
            if self.read_some()?.is_none() {
                return Err(CodecError::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "timeout expired",
                )));
            }
        }
    }

    pub(crate) fn set_io_timeout(&mut self, timeout: Option<Duration>) -> Result<(), CodecError> {
        let stream = self.stream.as_ref().ok_or(CodecError::Closed)?;
        stream.set_read_timeout(timeout)?;
        stream.set_write_timeout(timeout)?;
        Ok(())
    }

    // `Ok(None)` means the read would block (or timed out).
    fn read_some(&mut self) -> Result<Option<usize>, CodecError> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(CodecError::Closed);
        };
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => return Err(CodecError::ConnectionClosed),
                Ok(n) => {
                    self.read_buf.extend_from_slice(&chunk[..n]);
                    return Ok(Some(n));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) if e.kind() == io::ErrorKind::TimedOut => return Ok(None),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(CodecError::Io(e)),
            }
        }
    }

    fn process_messages(&mut self) -> Result<(), CodecError> {
        loop {
            match self.codec.decode(&mut self.read_buf) {
                Ok(Some(message)) => {
                    if let Err(e) = self.handle(message) {
                        return Err(self.fail(e));
                    }
                }
                Ok(None) => return Ok(()),
                Err(e) => return Err(self.fail(e)),
            }
        }
    }

    fn handle(&mut self, message: Message) -> Result<(), CodecError> {
        match message {
            Message::RowDescription(body) => self.assembler.row_description(&body)?,
            Message::DataRow(body) => self.assembler.data_row(&body)?,
            Message::CommandComplete(body) => {
                let tag = body.tag().map_err(|e| CodecError::Protocol(e.to_string()))?;
                self.assembler.command_complete(tag);
            }
            Message::EmptyQueryResponse => self.assembler.empty_query(),
            Message::ErrorResponse(body) => {
                let err = DbError::parse(&mut body.fields())
                    .map_err(|e| CodecError::Protocol(e.to_string()))?;
                tracing::debug!(code = %err.code, severity = %err.severity, "server error");
                self.last_error = err.to_string();
                if err.is_fatal() {
                    self.status = SessionStatus::Bad;
                }
                self.assembler.error(err);
            }
            Message::ParseComplete => self.assembler.parse_complete(),
            Message::BindComplete
            | Message::CloseComplete
            | Message::NoData
            | Message::PortalSuspended
            | Message::ParameterDescription(_) => {}
            Message::ReadyForQuery(body) => {
                self.tx_status = TransactionStatus::from_byte(body.status());
                self.assembler.ready()?;
            }
            Message::ParameterStatus(body) => self.record_parameter(&body)?,
            Message::NoticeResponse(body) => log_notice(&mut body.fields()),
            Message::NotificationResponse(body) => {
                tracing::debug!(
                    process_id = body.process_id(),
                    channel = body.channel().unwrap_or("<invalid>"),
                    "asynchronous notification ignored"
                );
            }
            Message::CopyInResponse(_) => {
                // Refuse; the server answers with an error and ReadyForQuery.
                frontend::copy_fail("COPY FROM STDIN is not supported", &mut self.write_buf)?;
            }
            Message::CopyOutResponse(_) | Message::CopyData(_) | Message::CopyDone => {}
            // CopyBothResponse ('W') is rejected by postgres-protocol's parser
            // before reaching here; the enum has no variant for it.
            Message::BackendKeyData(body) => {
                self.backend_key = Some(BackendKey {
                    process_id: body.process_id(),
                    secret_key: body.secret_key(),
                });
            }
            _ => return Err(CodecError::UnexpectedMessage("authentication request after startup")),
        }
        Ok(())
    }

    pub(crate) fn record_parameter(
        &mut self,
        body: &postgres_protocol::message::backend::ParameterStatusBody,
    ) -> Result<(), CodecError> {
        let name = body.name().map_err(|e| CodecError::Protocol(e.to_string()))?;
        let value = body.value().map_err(|e| CodecError::Protocol(e.to_string()))?;
        tracing::trace!(name, value, "server parameter");
        self.server_params.insert(name.to_owned(), value.to_owned());
        Ok(())
    }

    pub(crate) fn set_transaction_status(&mut self, status: u8) {
        self.tx_status = TransactionStatus::from_byte(status);
    }

    // Mark the transport unusable. In-flight commands will never reply, but
    // completed results stay queued.
    fn fail(&mut self, err: CodecError) -> CodecError {
        if err.is_fatal() {
            self.status = SessionStatus::Bad;
            self.assembler.abandon_in_flight();
        }
        self.last_error = err.to_string();
        err
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

pub(crate) fn log_notice(fields: &mut postgres_protocol::message::backend::ErrorFields<'_>) {
    match DbError::parse(fields) {
        Ok(notice) => tracing::debug!(
            severity = %notice.severity,
            code = %notice.code,
            message = %notice.message,
            "server notice"
        ),
        Err(e) => tracing::debug!(error = %e, "unparseable server notice"),
    }
}

fn open_stream(params: &SessionParams) -> Result<TcpStream, CodecError> {
    let mut last_err = None;
    for addr in (params.host.as_str(), params.port).to_socket_addrs()? {
        let attempt = if params.connect_timeout.is_zero() {
            TcpStream::connect(addr)
        } else {
            TcpStream::connect_timeout(&addr, params.connect_timeout)
        };
        match attempt {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                tracing::trace!(%addr, "tcp connection established");
                return Ok(stream);
            }
            Err(e) => {
                tracing::debug!(%addr, error = %e, "tcp connect attempt failed");
                last_err = Some(e);
            }
        }
    }
    Err(CodecError::Io(last_err.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("could not resolve host \"{}\"", params.host),
        )
    })))
}
