//! # fenrir-pool
//!
//! Connection pool for the fenrir PostgreSQL client.
//!
//! ## Features
//!
//! - **Bounded capacity**: checked-out plus idle connections never exceed
//!   `max_connections`
//! - **Blocking and async acquire**: with a deadline, and prompt failure
//!   once the pool shuts down
//! - **Validation on acquire**: dead idle connections are reset or replaced
//! - **Externally driven maintenance**: `maintain()` retires expired or
//!   unhealthy idle connections and restores `min_connections`
//! - **Retry wrapper**: `PooledConnection::execute_with_retry` reconnects
//!   after connection-level failures, never after server rejections
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::time::Duration;
//!
//! use fenrir_pool::Pool;
//!
//! let pool = Pool::builder()
//!     .connection_string("host=localhost user=app dbname=app")
//!     .min_connections(2)
//!     .max_connections(10)
//!     .build()?;
//!
//! let mut conn = pool.acquire(Duration::from_secs(1))?;
//! let total: i64 = conn.execute_with_retry(
//!     |c| c.execute("SELECT count(*) FROM orders")?.get(0, 0),
//!     2,
//! )?;
//!
//! // Run periodically from your own timer.
//! let discarded = pool.maintain();
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod pool;

pub use config::PoolConfig;
pub use error::PoolError;
pub use lifecycle::{ConnectionMetadata, ConnectionState, HealthCheckResult};
pub use pool::{Pool, PoolBuilder, PoolMetrics, PoolStatus, PooledConnection};
