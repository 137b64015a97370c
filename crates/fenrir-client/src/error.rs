//! Client error types.

use fenrir_codec::CodecError;
use fenrir_types::TypeError;
use thiserror::Error;

/// Errors that can occur during client operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The session could not be established (initial connect or reconnect).
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// An operation was attempted on a dead or closed connection.
    #[error("connection is not established")]
    NotConnected,

    /// An async operation was attempted without an attached runtime.
    #[error("not configured: {0}")]
    NotConfigured(String),

    /// Transport-level desynchronization or failure while awaiting a reply.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server executed the command and reported failure.
    #[error("{severity}: {message} (SQLSTATE {code})")]
    Server {
        /// SQLSTATE code, e.g. `23505` for a unique violation.
        code: String,
        /// Primary message.
        message: String,
        /// Severity (`ERROR`, `FATAL`, ...).
        severity: String,
        /// Optional detail text.
        detail: Option<String>,
        /// Optional hint text.
        hint: Option<String>,
    },

    /// The server closed the connection.
    #[error("connection closed")]
    ConnectionClosed,

    /// A network operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// Invalid configuration or connection string.
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid identifier (potential SQL injection attempt).
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// A prepared statement name that was never prepared on this session.
    #[error("unknown prepared statement: {0}")]
    UnknownStatement(String),

    /// No column with the requested name.
    #[error("column not found: {0}")]
    ColumnNotFound(String),

    /// Column index past the end of the row.
    #[error("column index {index} out of range ({count} columns)")]
    ColumnIndexOutOfRange {
        /// Requested index.
        index: usize,
        /// Number of columns.
        count: usize,
    },

    /// Row index past the end of the result.
    #[error("row index {index} out of range ({count} rows)")]
    RowIndexOutOfRange {
        /// Requested index.
        index: usize,
        /// Number of rows.
        count: usize,
    },

    /// Type conversion error.
    #[error("type error: {0}")]
    Type(#[from] TypeError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Session-layer error not covered by a more specific variant.
    #[error("codec error: {0}")]
    Codec(CodecError),
}

impl From<CodecError> for Error {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::ConnectionClosed => Self::ConnectionClosed,
            CodecError::Closed => Self::NotConnected,
            CodecError::Io(e) if e.kind() == std::io::ErrorKind::TimedOut => Self::Timeout,
            CodecError::Io(e) => Self::Io(e),
            CodecError::Protocol(msg) => Self::Protocol(msg),
            CodecError::UnexpectedMessage(what) => Self::Protocol(format!("unexpected message: {what}")),
            CodecError::Server(db) => Self::Server {
                code: db.code,
                message: db.message,
                severity: db.severity,
                detail: db.detail,
                hint: db.hint,
            },
            other => Self::Codec(other),
        }
    }
}

impl Error {
    /// Check if this error means the connection itself is unusable.
    ///
    /// These are the errors the pool's retry wrapper recovers from by
    /// reconnecting. A server error is connection-level only when its
    /// severity is `FATAL` or `PANIC`, since the server ends the session.
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        match self {
            Self::ConnectionFailed(_)
            | Self::NotConnected
            | Self::Protocol(_)
            | Self::ConnectionClosed
            | Self::Timeout
            | Self::Io(_) => true,
            Self::Server { severity, .. } => severity == "FATAL" || severity == "PANIC",
            Self::Codec(e) => e.is_fatal(),
            _ => false,
        }
    }

    /// Check if this error is transient and may succeed on retry.
    ///
    /// Besides connection-level errors this includes server errors whose
    /// SQLSTATE marks them as retryable: serialization failures, deadlocks,
    /// connection exceptions, and resource exhaustion.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        if self.is_connection_error() {
            return true;
        }
        match self.sql_state() {
            Some(code) => {
                code.starts_with("08")
                    || code.starts_with("53")
                    || code.starts_with("57P")
                    || code == "40001"
                    || code == "40P01"
            }
            None => false,
        }
    }

    /// Check if this is a server error with the given SQLSTATE.
    #[must_use]
    pub fn is_server_error(&self, sql_state: &str) -> bool {
        matches!(self, Self::Server { code, .. } if code == sql_state)
    }

    /// Get the SQLSTATE if this is a server error.
    #[must_use]
    pub fn sql_state(&self) -> Option<&str> {
        match self {
            Self::Server { code, .. } => Some(code),
            _ => None,
        }
    }

    /// Get the severity if this is a server error.
    #[must_use]
    pub fn severity(&self) -> Option<&str> {
        match self {
            Self::Server { severity, .. } => Some(severity),
            _ => None,
        }
    }

    pub(crate) fn server(db: fenrir_codec::DbError) -> Self {
        CodecError::Server(db).into()
    }
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use fenrir_codec::DbError;

    fn server_error(severity: &str, code: &str) -> Error {
        Error::server(DbError {
            severity: severity.into(),
            code: code.into(),
            message: "boom".into(),
            ..DbError::default()
        })
    }

    #[test]
    fn test_server_error_display_carries_sql_state() {
        let err = server_error("ERROR", "23505");
        assert_eq!(err.to_string(), "ERROR: boom (SQLSTATE 23505)");
        assert_eq!(err.sql_state(), Some("23505"));
        assert!(err.is_server_error("23505"));
        assert!(!err.is_server_error("23503"));
    }

    #[test]
    fn test_logical_errors_are_not_connection_errors() {
        assert!(!server_error("ERROR", "23505").is_connection_error());
        assert!(!Error::ColumnNotFound("x".into()).is_connection_error());
        assert!(!Error::NotConfigured("runtime".into()).is_connection_error());
    }

    #[test]
    fn test_fatal_server_error_is_connection_error() {
        assert!(server_error("FATAL", "57P01").is_connection_error());
    }

    #[test]
    fn test_codec_mapping() {
        assert!(matches!(
            Error::from(CodecError::ConnectionClosed),
            Error::ConnectionClosed
        ));
        assert!(matches!(Error::from(CodecError::Closed), Error::NotConnected));
        let timeout = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        assert!(matches!(Error::from(CodecError::Io(timeout)), Error::Timeout));
        assert!(matches!(
            Error::from(CodecError::Protocol("bad".into())),
            Error::Protocol(_)
        ));
        let busy = Error::from(CodecError::Busy);
        assert!(matches!(busy, Error::Codec(CodecError::Busy)));
        assert!(!busy.is_connection_error());
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::Timeout.is_transient());
        assert!(server_error("ERROR", "40001").is_transient());
        assert!(server_error("ERROR", "40P01").is_transient());
        assert!(server_error("FATAL", "53300").is_transient());
        assert!(!server_error("ERROR", "42601").is_transient());
        assert!(!Error::Config("bad".into()).is_transient());
    }
}
