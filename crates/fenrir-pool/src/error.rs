//! Pool error types.

use thiserror::Error;

/// Errors that can occur during pool operations.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Failed to acquire a connection within the timeout.
    #[error("connection acquisition timeout after {0:?}")]
    AcquisitionTimeout(std::time::Duration),

    /// Pool is shut down.
    #[error("pool is closed")]
    PoolClosed,

    /// Connection creation failed.
    #[error("failed to create connection: {0}")]
    ConnectionCreation(String),

    /// Connection is unhealthy.
    #[error("connection health check failed: {0}")]
    UnhealthyConnection(String),

    /// Connection reset failed.
    #[error("connection reset failed: {0}")]
    ResetFailed(String),

    /// Pool configuration error.
    #[error("pool configuration error: {0}")]
    Configuration(String),

    /// A retried operation kept failing with connection-level errors.
    #[error("operation failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        /// Number of times the operation ran.
        attempts: u32,
        /// Error from the final attempt.
        #[source]
        last_error: fenrir_client::Error,
    },

    /// Error from the connection itself.
    #[error(transparent)]
    Client(#[from] fenrir_client::Error),
}

impl PoolError {
    /// Check if this error means a connection could not be reached or used.
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        match self {
            Self::ConnectionCreation(_)
            | Self::UnhealthyConnection(_)
            | Self::ResetFailed(_)
            | Self::RetriesExhausted { .. } => true,
            Self::Client(e) => e.is_connection_error(),
            Self::AcquisitionTimeout(_) | Self::PoolClosed | Self::Configuration(_) => false,
        }
    }

    /// Get the SQLSTATE code when the server rejected the command.
    #[must_use]
    pub fn sql_state(&self) -> Option<&str> {
        match self {
            Self::Client(e) => e.sql_state(),
            _ => None,
        }
    }
}
