//! Connection lifecycle management.
//!
//! Per-connection bookkeeping the pool keeps alongside each [`Connection`],
//! plus the health check `maintain` runs against idle connections.

use std::time::{Duration, Instant};

use fenrir_client::Connection;

/// Health check result with timing information.
#[derive(Debug, Clone)]
pub struct HealthCheckResult {
    /// Whether the health check passed.
    pub healthy: bool,
    /// Time taken to complete the health check.
    pub latency: Duration,
    /// Error message if unhealthy.
    pub error: Option<String>,
}

impl HealthCheckResult {
    /// Create a successful health check result.
    pub fn healthy(latency: Duration) -> Self {
        Self {
            healthy: true,
            latency,
            error: None,
        }
    }

    /// Create a failed health check result.
    pub fn unhealthy(latency: Duration, error: impl Into<String>) -> Self {
        Self {
            healthy: false,
            latency,
            error: Some(error.into()),
        }
    }
}

/// Run `query` on `conn`, or only inspect its status when there is none.
pub(crate) fn check_health(conn: &mut Connection, query: Option<&str>) -> HealthCheckResult {
    let start = Instant::now();
    if !conn.is_connected() {
        return HealthCheckResult::unhealthy(start.elapsed(), "connection is not established");
    }
    match query {
        None => HealthCheckResult::healthy(start.elapsed()),
        Some(sql) => match conn.execute(sql) {
            Ok(_) => HealthCheckResult::healthy(start.elapsed()),
            Err(e) => HealthCheckResult::unhealthy(start.elapsed(), e.to_string()),
        },
    }
}

/// Connection state tracked by the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Connection is idle and available for use.
    Idle,
    /// Connection is currently in use.
    InUse,
    /// Connection is being health-checked.
    Checking,
    /// Connection is being reset.
    Resetting,
    /// Connection is closed and should be removed.
    Closed,
}

impl ConnectionState {
    /// Check if the connection is available for checkout.
    #[must_use]
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Idle)
    }

    /// Check if the connection is currently busy.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::InUse | Self::Checking | Self::Resetting)
    }

    /// Check if the connection should be removed from the pool.
    #[must_use]
    pub fn should_remove(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// Metadata about a pooled connection.
#[derive(Debug, Clone)]
pub struct ConnectionMetadata {
    /// Unique identifier for this connection within its pool.
    pub id: u64,
    /// When the connection was created.
    pub created_at: Instant,
    /// When the connection was last checked out or returned.
    pub last_used_at: Instant,
    /// When the connection was last health-checked.
    pub last_checked_at: Option<Instant>,
    /// Number of times the connection has been checked out.
    pub checkout_count: u64,
    /// Current state of the connection.
    pub state: ConnectionState,
}

impl ConnectionMetadata {
    /// Create metadata for a new connection.
    pub fn new(id: u64) -> Self {
        let now = Instant::now();
        Self {
            id,
            created_at: now,
            last_used_at: now,
            last_checked_at: None,
            checkout_count: 0,
            state: ConnectionState::Idle,
        }
    }

    /// Check if the connection has exceeded its maximum lifetime.
    #[must_use]
    pub fn is_expired(&self, max_lifetime: Duration) -> bool {
        self.created_at.elapsed() > max_lifetime
    }

    /// Check if the connection has been idle too long.
    #[must_use]
    pub fn is_idle_expired(&self, idle_timeout: Duration) -> bool {
        self.last_used_at.elapsed() > idle_timeout
    }

    /// Mark the connection as checked out.
    pub fn mark_checkout(&mut self) {
        self.last_used_at = Instant::now();
        self.checkout_count += 1;
        self.state = ConnectionState::InUse;
    }

    /// Mark the connection as returned to idle.
    pub fn mark_checkin(&mut self) {
        self.last_used_at = Instant::now();
        self.state = ConnectionState::Idle;
    }

    /// Mark the connection as health-checked.
    pub fn mark_health_check(&mut self) {
        self.last_checked_at = Some(Instant::now());
    }
}

/// A connection owned by the pool together with its metadata.
pub(crate) struct PoolEntry {
    pub(crate) conn: Connection,
    pub(crate) meta: ConnectionMetadata,
}

impl PoolEntry {
    pub(crate) fn new(conn: Connection, id: u64) -> Self {
        Self {
            conn,
            meta: ConnectionMetadata::new(id),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_state_availability() {
        assert!(ConnectionState::Idle.is_available());
        assert!(!ConnectionState::InUse.is_available());
        assert!(!ConnectionState::Checking.is_available());
    }

    #[test]
    fn test_connection_state_busy() {
        assert!(!ConnectionState::Idle.is_busy());
        assert!(ConnectionState::InUse.is_busy());
        assert!(ConnectionState::Checking.is_busy());
        assert!(ConnectionState::Resetting.is_busy());
        assert!(!ConnectionState::Closed.is_busy());
    }

    #[test]
    fn test_connection_state_should_remove() {
        assert!(!ConnectionState::Idle.should_remove());
        assert!(!ConnectionState::InUse.should_remove());
        assert!(ConnectionState::Closed.should_remove());
    }

    #[test]
    fn test_connection_metadata_lifecycle() {
        let mut meta = ConnectionMetadata::new(7);
        assert_eq!(meta.id, 7);
        assert_eq!(meta.checkout_count, 0);
        assert_eq!(meta.state, ConnectionState::Idle);
        assert!(meta.last_checked_at.is_none());

        meta.mark_checkout();
        meta.mark_checkin();
        meta.mark_checkout();
        assert_eq!(meta.checkout_count, 2);
        assert_eq!(meta.state, ConnectionState::InUse);

        meta.mark_health_check();
        assert!(meta.last_checked_at.is_some());
    }

    #[test]
    fn test_connection_metadata_expiry() {
        let mut meta = ConnectionMetadata::new(1);
        meta.created_at -= Duration::from_secs(2);
        meta.last_used_at -= Duration::from_secs(1);

        assert!(meta.is_expired(Duration::from_secs(1)));
        assert!(!meta.is_expired(Duration::from_secs(60)));
        assert!(meta.is_idle_expired(Duration::from_millis(500)));
        assert!(!meta.is_idle_expired(Duration::from_secs(60)));
    }

    #[test]
    fn test_health_check_result_constructors() {
        let ok = HealthCheckResult::healthy(Duration::from_millis(5));
        assert!(ok.healthy);
        assert!(ok.error.is_none());

        let bad = HealthCheckResult::unhealthy(Duration::from_millis(1000), "timeout");
        assert!(!bad.healthy);
        assert_eq!(bad.error.as_deref(), Some("timeout"));
    }
}
