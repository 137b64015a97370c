//! Codec error types.

use thiserror::Error;

use crate::reply::DbError;

/// Errors raised by the session layer.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Transport-level I/O failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The server closed the connection.
    #[error("server closed the connection unexpectedly")]
    ConnectionClosed,

    /// The byte stream could not be interpreted.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server sent a message that is not valid in the current phase.
    #[error("unexpected message: {0}")]
    UnexpectedMessage(&'static str),

    /// Authentication could not be completed.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The server rejected the session during startup.
    #[error("{0}")]
    Server(DbError),

    /// A command was queued while the previous one is still in flight.
    #[error("another command is already in progress")]
    Busy,

    /// The session handle has been closed.
    #[error("session is closed")]
    Closed,
}

impl CodecError {
    /// Check if this error means the transport is unusable.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Io(_)
            | Self::ConnectionClosed
            | Self::Protocol(_)
            | Self::UnexpectedMessage(_)
            | Self::Closed => true,
            Self::Server(db) => db.is_fatal(),
            Self::Authentication(_) | Self::Busy => false,
        }
    }
}
