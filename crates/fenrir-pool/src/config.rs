//! Pool configuration.

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;

/// Default number of connections established at startup and kept by `maintain`.
pub const DEFAULT_MIN_CONNECTIONS: u32 = 2;

/// Default upper bound on open connections.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;

/// Configuration for the connection pool.
///
/// This struct is marked `#[non_exhaustive]` to allow adding new fields
/// in future minor versions without breaking changes. Use the builder
/// pattern methods or [`Default::default()`] to construct instances.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct PoolConfig {
    /// Minimum number of connections to maintain.
    pub min_connections: u32,

    /// Maximum number of connections allowed, idle and checked out combined.
    pub max_connections: u32,

    /// Time `get`/`get_async` wait for a connection before timing out.
    pub connection_timeout: Duration,

    /// Time a connection can be idle before `maintain` closes it.
    ///
    /// Connections are only closed for idleness while more than
    /// `min_connections` remain.
    pub idle_timeout: Duration,

    /// Maximum lifetime of a connection.
    pub max_lifetime: Duration,

    /// Whether to check an idle connection before handing it out.
    ///
    /// A connection that reports itself disconnected is reset, and replaced
    /// with a fresh one when the reset fails.
    pub validate_on_acquire: bool,

    /// Query `maintain` runs on every idle connection.
    ///
    /// Without one, `maintain` relies on the connection's own status. The
    /// query should be lightweight, e.g. `SELECT 1`.
    pub health_check_query: Option<Arc<str>>,

    /// Runtime attached to every connection the pool creates, enabling
    /// their `async_*` operations.
    pub runtime: Option<Handle>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: DEFAULT_MIN_CONNECTIONS,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            connection_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(300),
            max_lifetime: Duration::from_secs(1800),
            validate_on_acquire: true,
            health_check_query: None,
            runtime: None,
        }
    }
}

impl PoolConfig {
    /// Create a new pool configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the minimum number of connections.
    #[must_use]
    pub fn min_connections(mut self, count: u32) -> Self {
        self.min_connections = count;
        self
    }

    /// Set the maximum number of connections.
    #[must_use]
    pub fn max_connections(mut self, count: u32) -> Self {
        self.max_connections = count;
        self
    }

    /// Set the connection acquisition timeout.
    #[must_use]
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Set the idle connection timeout.
    #[must_use]
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the maximum connection lifetime.
    #[must_use]
    pub fn max_lifetime(mut self, lifetime: Duration) -> Self {
        self.max_lifetime = lifetime;
        self
    }

    /// Enable or disable validating idle connections on acquire.
    #[must_use]
    pub fn validate_on_acquire(mut self, enabled: bool) -> Self {
        self.validate_on_acquire = enabled;
        self
    }

    /// Set a health check query for `maintain`.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use fenrir_pool::PoolConfig;
    ///
    /// // Check the server can still run queries
    /// let config = PoolConfig::new().health_check_query("SELECT 1");
    ///
    /// // Check a schema is still reachable
    /// let config = PoolConfig::new()
    ///     .health_check_query("SELECT 1 FROM pg_namespace WHERE nspname = 'app'");
    /// ```
    #[must_use]
    pub fn health_check_query(mut self, query: impl Into<Arc<str>>) -> Self {
        self.health_check_query = Some(query.into());
        self
    }

    /// Attach a tokio runtime to every connection the pool creates.
    #[must_use]
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), crate::error::PoolError> {
        if self.max_connections == 0 {
            return Err(crate::error::PoolError::Configuration(
                "max_connections must be greater than 0".into(),
            ));
        }
        if self.min_connections > self.max_connections {
            return Err(crate::error::PoolError::Configuration(
                "min_connections cannot be greater than max_connections".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PoolConfig::default();
        assert_eq!(config.min_connections, 2);
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.connection_timeout, Duration::from_secs(5));
        assert_eq!(config.idle_timeout, Duration::from_secs(300));
        assert!(config.validate_on_acquire);
        assert!(config.health_check_query.is_none());
        assert!(config.runtime.is_none());
    }

    #[test]
    fn test_config_builder_methods() {
        let config = PoolConfig::new()
            .min_connections(5)
            .max_connections(50)
            .connection_timeout(Duration::from_secs(60))
            .idle_timeout(Duration::from_secs(120))
            .max_lifetime(Duration::from_secs(3600))
            .validate_on_acquire(false)
            .health_check_query(String::from("SELECT version()"));

        assert_eq!(config.min_connections, 5);
        assert_eq!(config.max_connections, 50);
        assert_eq!(config.connection_timeout, Duration::from_secs(60));
        assert_eq!(config.idle_timeout, Duration::from_secs(120));
        assert_eq!(config.max_lifetime, Duration::from_secs(3600));
        assert!(!config.validate_on_acquire);
        assert_eq!(config.health_check_query.as_deref(), Some("SELECT version()"));
    }

    #[test]
    fn test_config_validation_success() {
        let config = PoolConfig::new().min_connections(1).max_connections(10);

        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation_min_greater_than_max() {
        let config = PoolConfig::new().min_connections(20).max_connections(10);

        let result = config.validate();
        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("min_connections cannot be greater than max_connections")
        );
    }

    #[test]
    fn test_config_validation_zero_max() {
        let config = PoolConfig::new().min_connections(0).max_connections(0);

        let result = config.validate();
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("max_connections must be greater than 0")
        );
    }

    #[test]
    fn test_config_equal_min_max() {
        let config = PoolConfig::new().min_connections(5).max_connections(5);

        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn test_runtime_handle_attached() {
        let config = PoolConfig::new().runtime(Handle::current());
        assert!(config.runtime.is_some());
    }
}
