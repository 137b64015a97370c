//! Connection and wait states.
//!
//! A [`Connection`](crate::Connection) is either usable or dead; there is no
//! half-open state observable from outside, because startup completes inside
//! construction. The async wait loop tracks its own progress with
//! [`WaitState`].
//!
//! ## Wait State Transitions
//!
//! ```text
//! Sending -> AwaitingReadable (request fully written)
//! AwaitingReadable -> AwaitingReadable (partial reply consumed)
//! AwaitingReadable -> Draining (reply fully buffered)
//! Draining -> Done (result collected, extras discarded)
//! any -> Failed (transport error)
//! ```

use std::fmt;

use fenrir_codec::{SessionStatus, TransactionStatus};

/// Whether a connection can be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// The session is established and the transport is healthy.
    Ok,
    /// The session failed, was terminated by the server, or was closed.
    Bad,
}

impl From<SessionStatus> for ConnectionStatus {
    fn from(status: SessionStatus) -> Self {
        match status {
            SessionStatus::Ok => Self::Ok,
            SessionStatus::Bad => Self::Bad,
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => f.write_str("ok"),
            Self::Bad => f.write_str("bad"),
        }
    }
}

/// Server-side transaction state, as last reported by the server.
pub type TransactionState = TransactionStatus;

/// Progress of one async command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitState {
    /// Writing the request; waits on writability when the socket is full.
    Sending,
    /// Request written; waiting for the socket to become readable.
    AwaitingReadable,
    /// Reply complete; collecting the result and discarding any extras.
    Draining,
    /// Finished with a result (which may carry a server error).
    Done,
    /// Finished with a transport failure.
    Failed,
}

impl WaitState {
    /// Check if the wait loop has finished.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl Default for WaitState {
    fn default() -> Self {
        Self::Sending
    }
}
