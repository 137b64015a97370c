//! Reply assembly.
//!
//! Backend messages for one command arrive as a sequence (row description,
//! data rows, command completion, or an error). [`ReplyAssembler`] folds
//! those events into whole [`RawResult`]s and queues them until the caller
//! collects them. A result is queued only once complete, so no caller ever
//! observes a half-received reply.

use std::collections::VecDeque;
use std::fmt;
use std::io;

use fallible_iterator::FallibleIterator;
use postgres_protocol::message::backend::{DataRowBody, ErrorFields, RowDescriptionBody};

use crate::error::CodecError;

/// Outcome class of one result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultStatus {
    /// The command text was empty.
    EmptyQuery,
    /// A command that returns no rows completed.
    CommandOk,
    /// A row-returning command completed.
    TuplesOk,
    /// The server reported an error.
    Error,
    /// The command completed but a field was not valid UTF-8 text; the
    /// rows were dropped.
    Undecodable,
}

/// Structured error reported by the server.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DbError {
    /// Severity (`ERROR`, `FATAL`, `PANIC`, ...), never localized.
    pub severity: String,
    /// Five-character SQLSTATE code.
    pub code: String,
    /// Primary human-readable message.
    pub message: String,
    /// Optional secondary detail.
    pub detail: Option<String>,
    /// Optional suggestion.
    pub hint: Option<String>,
    /// Cursor position into the command text, 1-based.
    pub position: Option<u32>,
    /// Call-stack context.
    pub where_: Option<String>,
    /// Schema of the object involved.
    pub schema: Option<String>,
    /// Table of the object involved.
    pub table: Option<String>,
    /// Column of the object involved.
    pub column: Option<String>,
    /// Constraint that was violated.
    pub constraint: Option<String>,
}

impl DbError {
    /// Build from the fields of an `ErrorResponse` or `NoticeResponse`.
    pub fn parse(fields: &mut ErrorFields<'_>) -> io::Result<Self> {
        let mut err = Self::default();
        let mut localized_severity = None;

        while let Some(field) = fields.next()? {
            let value = String::from_utf8_lossy(field.value_bytes()).into_owned();
            match field.type_() {
                b'S' => localized_severity = Some(value),
                b'V' => err.severity = value,
                b'C' => err.code = value,
                b'M' => err.message = value,
                b'D' => err.detail = Some(value),
                b'H' => err.hint = Some(value),
                b'P' => err.position = value.parse().ok(),
                b'W' => err.where_ = Some(value),
                b's' => err.schema = Some(value),
                b't' => err.table = Some(value),
                b'c' => err.column = Some(value),
                b'n' => err.constraint = Some(value),
                _ => {}
            }
        }

        // Servers before 9.6 only send the localized severity.
        if err.severity.is_empty() {
            err.severity = localized_severity.unwrap_or_else(|| "ERROR".to_owned());
        }
        Ok(err)
    }

    /// Check if the server is terminating the session with this error.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        self.severity == "FATAL" || self.severity == "PANIC"
    }
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.severity, self.message)?;
        if let Some(detail) = &self.detail {
            write!(f, "\nDETAIL: {detail}")?;
        }
        if let Some(hint) = &self.hint {
            write!(f, "\nHINT: {hint}")?;
        }
        Ok(())
    }
}

impl std::error::Error for DbError {}

/// Description of one result column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDesc {
    /// Column name (or alias).
    pub name: String,
    /// Type OID.
    pub type_oid: u32,
    /// OID of the source table, 0 if not a plain column reference.
    pub table_oid: u32,
    /// Attribute number in the source table, 0 if none.
    pub column_id: i16,
    /// Type modifier (e.g. `varchar(n)` length).
    pub type_modifier: i32,
    /// Format code; always 0 (text) for results this crate requests.
    pub format: i16,
}

/// One field value as wire text; `None` is SQL NULL.
pub type Field = Option<String>;

/// A complete reply to one command: the native result handle.
#[derive(Debug, Clone, PartialEq)]
pub struct RawResult {
    status: ResultStatus,
    columns: Vec<ColumnDesc>,
    rows: Vec<Vec<Field>>,
    command_tag: Option<String>,
    error: Option<DbError>,
    decode_error: Option<String>,
}

impl RawResult {
    fn error(err: DbError) -> Self {
        Self {
            status: ResultStatus::Error,
            columns: Vec::new(),
            rows: Vec::new(),
            command_tag: None,
            error: Some(err),
            decode_error: None,
        }
    }

    fn command_ok(tag: Option<String>) -> Self {
        Self {
            status: ResultStatus::CommandOk,
            columns: Vec::new(),
            rows: Vec::new(),
            command_tag: tag,
            error: None,
            decode_error: None,
        }
    }

    fn undecodable(columns: Vec<ColumnDesc>, tag: Option<String>, reason: String) -> Self {
        Self {
            status: ResultStatus::Undecodable,
            columns,
            rows: Vec::new(),
            command_tag: tag,
            error: None,
            decode_error: Some(reason),
        }
    }

    /// Outcome class.
    #[must_use]
    pub fn status(&self) -> ResultStatus {
        self.status
    }

    /// Check if this result carries a server error.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.status == ResultStatus::Error
    }

    /// Column descriptions (empty unless rows were returned).
    #[must_use]
    pub fn columns(&self) -> &[ColumnDesc] {
        &self.columns
    }

    /// All rows.
    #[must_use]
    pub fn rows(&self) -> &[Vec<Field>] {
        &self.rows
    }

    /// Command tag, e.g. `INSERT 0 3` or `SELECT 1`.
    #[must_use]
    pub fn command_tag(&self) -> Option<&str> {
        self.command_tag.as_deref()
    }

    /// The server error, if this is an error result.
    #[must_use]
    pub fn db_error(&self) -> Option<&DbError> {
        self.error.as_ref()
    }

    /// Why the rows of an [`ResultStatus::Undecodable`] result were dropped.
    #[must_use]
    pub fn decode_error(&self) -> Option<&str> {
        self.decode_error.as_deref()
    }

    /// Take the server error out of an error result.
    #[must_use]
    pub fn into_db_error(self) -> Option<DbError> {
        self.error
    }

    /// Build a row-returning result directly.
    #[must_use]
    pub fn from_rows(columns: Vec<ColumnDesc>, rows: Vec<Vec<Field>>, tag: Option<String>) -> Self {
        Self {
            status: ResultStatus::TuplesOk,
            columns,
            rows,
            command_tag: tag,
            error: None,
            decode_error: None,
        }
    }
}

/// How replies for one queued command should be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Simple query protocol: zero or more statements.
    Simple,
    /// Extended protocol execution of an unnamed or named statement.
    Extended,
    /// Preparation of a named statement; `ParseComplete` is the result.
    Prepare,
}

/// Folds backend events into complete results.
#[derive(Debug, Default)]
pub struct ReplyAssembler {
    kinds: VecDeque<CommandKind>,
    columns: Option<Vec<ColumnDesc>>,
    rows: Vec<Vec<Field>>,
    // First undecodable field of the reply being assembled.
    decode_error: Option<String>,
    completed: VecDeque<RawResult>,
}

impl ReplyAssembler {
    /// Create an empty assembler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a queued command; replies are interpreted in send order.
    pub fn begin(&mut self, kind: CommandKind) {
        self.kinds.push_back(kind);
    }

    /// Number of commands still awaiting their `ReadyForQuery`.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.kinds.len()
    }

    /// Handle a `RowDescription`.
    pub fn row_description(&mut self, body: &RowDescriptionBody) -> Result<(), CodecError> {
        let mut columns = Vec::new();
        let mut fields = body.fields();
        while let Some(field) = fields.next().map_err(protocol)? {
            columns.push(ColumnDesc {
                name: field.name().to_owned(),
                type_oid: field.type_oid(),
                table_oid: field.table_oid(),
                column_id: field.column_id(),
                type_modifier: field.type_modifier(),
                format: field.format(),
            });
        }
        self.columns = Some(columns);
        self.rows.clear();
        self.decode_error = None;
        Ok(())
    }

    /// Handle a `DataRow`.
    ///
    /// A field that is not valid UTF-8 does not fail the session: the rest
    /// of the reply is still read and the result completes as
    /// [`ResultStatus::Undecodable`].
    pub fn data_row(&mut self, body: &DataRowBody) -> Result<(), CodecError> {
        let width = match &self.columns {
            Some(columns) => columns.len(),
            None => return Err(CodecError::UnexpectedMessage("DataRow without RowDescription")),
        };

        let buf = body.buffer();
        let mut row = Vec::with_capacity(width);
        let mut ranges = body.ranges();
        while let Some(range) = ranges.next().map_err(protocol)? {
            let field = match range {
                Some(range) => {
                    let bytes = buf.get(range).ok_or_else(|| {
                        CodecError::Protocol("field range outside row buffer".into())
                    })?;
                    match std::str::from_utf8(bytes) {
                        Ok(text) => Some(text.to_owned()),
                        Err(e) => {
                            if self.decode_error.is_none() {
                                self.decode_error = Some(format!(
                                    "field {} of row {} is not valid UTF-8: {e}",
                                    row.len(),
                                    self.rows.len()
                                ));
                            }
                            None
                        }
                    }
                }
                None => None,
            };
            row.push(field);
        }

        if row.len() != width {
            return Err(CodecError::Protocol(format!(
                "row has {} fields but {} columns were described",
                row.len(),
                width
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    /// Handle a `CommandComplete`.
    pub fn command_complete(&mut self, tag: &str) {
        let tag = Some(tag.to_owned());
        let rows = std::mem::take(&mut self.rows);
        let result = match (self.columns.take(), self.decode_error.take()) {
            (Some(columns), Some(reason)) => RawResult::undecodable(columns, tag, reason),
            (Some(columns), None) => RawResult::from_rows(columns, rows, tag),
            (None, _) => RawResult::command_ok(tag),
        };
        self.completed.push_back(result);
    }

    /// Handle an `EmptyQueryResponse`.
    pub fn empty_query(&mut self) {
        self.columns = None;
        self.rows.clear();
        self.decode_error = None;
        self.completed.push_back(RawResult {
            status: ResultStatus::EmptyQuery,
            columns: Vec::new(),
            rows: Vec::new(),
            command_tag: None,
            error: None,
            decode_error: None,
        });
    }

    /// Handle an `ErrorResponse`; any partial rows are discarded.
    pub fn error(&mut self, err: DbError) {
        self.columns = None;
        self.rows.clear();
        self.decode_error = None;
        self.completed.push_back(RawResult::error(err));
    }

    /// Handle a `ParseComplete`.
    pub fn parse_complete(&mut self) {
        if self.kinds.front() == Some(&CommandKind::Prepare) {
            self.completed.push_back(RawResult::command_ok(None));
        }
    }

    /// Handle a `ReadyForQuery`: the front command has fully replied.
    pub fn ready(&mut self) -> Result<(), CodecError> {
        if self.kinds.pop_front().is_none() {
            return Err(CodecError::UnexpectedMessage("ReadyForQuery with no command in flight"));
        }
        // A description without completion (e.g. an aborted portal) is dropped.
        self.columns = None;
        self.rows.clear();
        self.decode_error = None;
        Ok(())
    }

    /// Pop the oldest completed result.
    pub fn take(&mut self) -> Option<RawResult> {
        self.completed.pop_front()
    }

    /// Check if any completed result is waiting.
    #[must_use]
    pub fn has_completed(&self) -> bool {
        !self.completed.is_empty()
    }

    /// Stop waiting on in-flight commands (the transport is gone), keeping
    /// results that already completed.
    pub fn abandon_in_flight(&mut self) {
        self.kinds.clear();
        self.columns = None;
        self.rows.clear();
        self.decode_error = None;
    }

    /// Forget all in-flight and queued state.
    pub fn clear(&mut self) {
        self.kinds.clear();
        self.columns = None;
        self.rows.clear();
        self.decode_error = None;
        self.completed.clear();
    }
}

fn protocol(e: io::Error) -> CodecError {
    CodecError::Protocol(e.to_string())
}
