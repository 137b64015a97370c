//! Connection pool implementation.
//!
//! All bookkeeping (the idle set, the checked-out count, reservations and
//! the shutdown flag) lives in one [`PoolState`] behind a single mutex.
//! Handshakes, resets and health checks run after the lock is released,
//! with the slot they occupy already reserved, so `active + idle` never
//! exceeds `max_connections` and no network I/O happens under the lock.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use fenrir_client::{Config, Connection, TransactionState};
use futures_util::future::BoxFuture;
use parking_lot::{Condvar, Mutex};
use tokio::sync::Notify;

use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::lifecycle::{ConnectionMetadata, ConnectionState, PoolEntry, check_health};

/// A connection pool for PostgreSQL.
///
/// The pool manages a set of [`Connection`]s, providing connection reuse,
/// validation on checkout, and lifecycle management.
///
/// The pool is safe to share between threads (wrap it in an [`Arc`]).
/// Dropping it shuts it down; connections still checked out are closed
/// when their handles are dropped.
///
/// # Example
///
/// ```rust,ignore
/// use fenrir_client::Config;
/// use fenrir_pool::{Pool, PoolConfig};
///
/// let pool = Pool::new(
///     Config::from_connection_string("host=localhost user=app dbname=app")?,
///     PoolConfig::new().min_connections(2).max_connections(20),
/// )?;
///
/// let mut conn = pool.acquire(std::time::Duration::from_secs(1))?;
/// let cursor = conn.execute("SELECT 1")?;
/// // `conn` returns to the pool when dropped.
/// ```
pub struct Pool {
    inner: Arc<PoolInner>,
}

pub(crate) struct PoolInner {
    /// Parameters for every connection the pool opens.
    client_config: Config,

    /// Pool configuration.
    config: PoolConfig,

    /// Idle set, counters and shutdown flag.
    state: Mutex<PoolState>,

    /// Wakes blocking acquirers.
    available: Condvar,

    /// Wakes suspended acquirers.
    notify: Notify,

    /// Counter for generating connection IDs.
    next_connection_id: AtomicU64,

    /// When the pool was created.
    created_at: Instant,

    /// Pool metrics.
    metrics: Mutex<PoolMetricsInner>,
}

struct PoolState {
    /// Connections available for checkout, most recently returned last.
    idle: VecDeque<PoolEntry>,
    /// Connections checked out, plus slots reserved for an acquire in progress.
    active: u32,
    /// Slots held by maintenance: connections being health-checked or opened.
    pending: u32,
    shutdown: bool,
}

impl PoolState {
    fn total(&self) -> u32 {
        self.active + self.idle.len() as u32 + self.pending
    }
}

/// Internal metrics tracking.
#[derive(Debug, Default)]
struct PoolMetricsInner {
    connections_created: u64,
    connections_closed: u64,
    checkouts_successful: u64,
    checkouts_failed: u64,
    validations_performed: u64,
    validations_failed: u64,
    resets_performed: u64,
    resets_failed: u64,
}

/// What a successful reservation hands to the checkout step.
enum Reserved {
    Idle(PoolEntry),
    Create,
}

impl Pool {
    /// Create a new pool builder.
    #[must_use]
    pub fn builder() -> PoolBuilder {
        PoolBuilder::new()
    }

    /// Create a pool and eagerly open `min_connections` connections.
    ///
    /// Startup is all-or-nothing: if any connection fails, the ones already
    /// opened are closed and the error is returned.
    pub fn new(client_config: Config, config: PoolConfig) -> Result<Self, PoolError> {
        config.validate()?;
        client_config
            .validate()
            .map_err(|e| PoolError::Configuration(e.to_string()))?;

        let inner = Arc::new(PoolInner {
            client_config,
            config,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                active: 0,
                pending: 0,
                shutdown: false,
            }),
            available: Condvar::new(),
            notify: Notify::new(),
            next_connection_id: AtomicU64::new(1),
            created_at: Instant::now(),
            metrics: Mutex::new(PoolMetricsInner::default()),
        });

        let min = inner.config.min_connections;
        let mut entries = Vec::with_capacity(min as usize);
        for _ in 0..min {
            // On failure `entries` is dropped, closing what was opened.
            entries.push(inner.connect()?);
        }
        inner.state.lock().idle.extend(entries);

        tracing::info!(
            host = %inner.client_config.host,
            port = inner.client_config.port,
            min = inner.config.min_connections,
            max = inner.config.max_connections,
            "connection pool created"
        );

        Ok(Self { inner })
    }

    /// Create a pool from a `key=value` connection string.
    pub fn from_connection_string(conn_str: &str, config: PoolConfig) -> Result<Self, PoolError> {
        let client_config = Config::from_connection_string(conn_str)
            .map_err(|e| PoolError::Configuration(e.to_string()))?;
        Self::new(client_config, config)
    }

    /// Get a connection, blocking up to `timeout`.
    ///
    /// Returns an idle connection if one exists, opens a new one if the
    /// pool is below capacity, and otherwise waits until a connection is
    /// returned or the pool shuts down.
    pub fn acquire(&self, timeout: Duration) -> Result<PooledConnection, PoolError> {
        let deadline = Instant::now().checked_add(timeout);

        let reserved = {
            let mut state = self.inner.state.lock();
            loop {
                match self.inner.reserve(&mut state) {
                    Ok(Some(reserved)) => break reserved,
                    Ok(None) => {}
                    Err(e) => {
                        drop(state);
                        self.inner.record(|m| m.checkouts_failed += 1);
                        return Err(e);
                    }
                }

                match deadline {
                    Some(deadline) if Instant::now() >= deadline => {
                        drop(state);
                        tracing::debug!(timeout_ms = timeout.as_millis() as u64, "acquire timed out");
                        self.inner.record(|m| m.checkouts_failed += 1);
                        return Err(PoolError::AcquisitionTimeout(timeout));
                    }
                    Some(deadline) => {
                        self.inner.available.wait_until(&mut state, deadline);
                    }
                    None => self.inner.available.wait(&mut state),
                }
            }
        };

        self.inner.checkout(reserved)
    }

    /// Get a connection, suspending up to `timeout`.
    ///
    /// Waiting does not block the calling thread. Opening or resetting a
    /// connection runs on tokio's blocking thread pool.
    pub async fn acquire_async(&self, timeout: Duration) -> Result<PooledConnection, PoolError> {
        let deadline = tokio::time::Instant::now().checked_add(timeout);

        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register before inspecting the state so a return in between
            // is not missed.
            notified.as_mut().enable();

            let reserved = {
                let mut state = self.inner.state.lock();
                self.inner.reserve(&mut state)
            };
            match reserved {
                Ok(Some(reserved)) => return self.inner.checkout_async(reserved).await,
                Ok(None) => {}
                Err(e) => {
                    self.inner.record(|m| m.checkouts_failed += 1);
                    return Err(e);
                }
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        tracing::debug!(timeout_ms = timeout.as_millis() as u64, "acquire timed out");
                        self.inner.record(|m| m.checkouts_failed += 1);
                        return Err(PoolError::AcquisitionTimeout(timeout));
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Get a connection using the configured `connection_timeout`.
    pub fn get(&self) -> Result<PooledConnection, PoolError> {
        self.acquire(self.inner.config.connection_timeout)
    }

    /// Async [`get`](Self::get).
    pub async fn get_async(&self) -> Result<PooledConnection, PoolError> {
        self.acquire_async(self.inner.config.connection_timeout).await
    }

    /// Get a connection without waiting.
    ///
    /// Returns `Ok(None)` when the pool is at capacity.
    pub fn try_acquire(&self) -> Result<Option<PooledConnection>, PoolError> {
        let reserved = {
            let mut state = self.inner.state.lock();
            self.inner.reserve(&mut state)
        };
        match reserved {
            Ok(Some(reserved)) => self.inner.checkout(reserved).map(Some),
            Ok(None) => Ok(None),
            Err(e) => {
                self.inner.record(|m| m.checkouts_failed += 1);
                Err(e)
            }
        }
    }

    /// Sweep the idle set and restore `min_connections`.
    ///
    /// Only idle connections are inspected. A connection is discarded when
    /// it reports itself disconnected, has outlived `max_lifetime`, has been
    /// idle past `idle_timeout` while more than `min_connections` remain, or
    /// fails the configured health check query. Fresh connections then
    /// bring the pool back to `min_connections`.
    ///
    /// Returns the number of discarded connections.
    pub fn maintain(&self) -> usize {
        let inner = &self.inner;
        let config = &inner.config;

        let (expired, checking) = {
            let mut state = inner.state.lock();
            if state.shutdown {
                return 0;
            }

            let floor = config.min_connections as usize;
            let mut remaining = state.total() as usize;
            let mut kept = VecDeque::with_capacity(state.idle.len());
            let mut expired = Vec::new();
            for entry in std::mem::take(&mut state.idle) {
                let retire = !entry.conn.is_connected()
                    || entry.meta.is_expired(config.max_lifetime)
                    || (remaining > floor && entry.meta.is_idle_expired(config.idle_timeout));
                if retire {
                    remaining -= 1;
                    expired.push(entry);
                } else {
                    kept.push_back(entry);
                }
            }

            let checking: Vec<PoolEntry> = if config.health_check_query.is_some() {
                state.pending += kept.len() as u32;
                kept.into_iter().collect()
            } else {
                state.idle = kept;
                Vec::new()
            };
            (expired, checking)
        };

        let mut discarded = expired.len();
        if !expired.is_empty() {
            inner.wake_all();
        }
        for entry in expired {
            inner.discard(entry, "expired or disconnected");
        }

        if !checking.is_empty() {
            let checked = checking.len() as u32;
            let mut healthy = Vec::with_capacity(checking.len());
            for mut entry in checking {
                entry.meta.state = ConnectionState::Checking;
                let result = check_health(&mut entry.conn, config.health_check_query.as_deref());
                entry.meta.mark_health_check();
                inner.record(|m| {
                    m.validations_performed += 1;
                    if !result.healthy {
                        m.validations_failed += 1;
                    }
                });
                if result.healthy {
                    tracing::trace!(
                        connection_id = entry.meta.id,
                        latency_us = result.latency.as_micros() as u64,
                        "health check passed"
                    );
                    entry.meta.state = ConnectionState::Idle;
                    healthy.push(entry);
                } else {
                    tracing::debug!(
                        connection_id = entry.meta.id,
                        error = result.error.as_deref().unwrap_or_default(),
                        "health check failed"
                    );
                    discarded += 1;
                    inner.discard(entry, "health check failed");
                }
            }

            let rejected = {
                let mut state = inner.state.lock();
                state.pending -= checked;
                if state.shutdown {
                    healthy
                } else {
                    state.idle.extend(healthy);
                    Vec::new()
                }
            };
            inner.wake_all();
            for entry in rejected {
                inner.discard(entry, "pool shutdown");
            }
        }

        let created = inner.replenish();

        tracing::info!(
            discarded,
            created,
            idle = self.status().available,
            "pool maintenance complete"
        );
        discarded
    }

    /// Shut the pool down.
    ///
    /// Closes every idle connection and wakes all waiters, which then fail
    /// with [`PoolError::PoolClosed`]. Checked-out connections are closed
    /// when returned. Safe to call repeatedly.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    /// Check if the pool is shut down.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.inner.state.lock().shutdown
    }

    /// Get the current pool status.
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        let state = self.inner.state.lock();
        PoolStatus {
            available: state.idle.len() as u32,
            in_use: state.active,
            total: state.total(),
            max: self.inner.config.max_connections,
        }
    }

    /// Snapshot of the pool's counts. Same as [`status`](Self::status).
    #[must_use]
    pub fn get_stats(&self) -> PoolStatus {
        self.status()
    }

    /// Get pool metrics.
    #[must_use]
    pub fn metrics(&self) -> PoolMetrics {
        let inner = self.inner.metrics.lock();
        PoolMetrics {
            connections_created: inner.connections_created,
            connections_closed: inner.connections_closed,
            checkouts_successful: inner.checkouts_successful,
            checkouts_failed: inner.checkouts_failed,
            validations_performed: inner.validations_performed,
            validations_failed: inner.validations_failed,
            resets_performed: inner.resets_performed,
            resets_failed: inner.resets_failed,
            uptime: self.inner.created_at.elapsed(),
        }
    }

    /// Get the pool configuration.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Get the parameters new connections are opened with.
    #[must_use]
    pub fn client_config(&self) -> &Config {
        &self.inner.client_config
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("status", &self.status())
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl PoolInner {
    /// Claim an idle connection or a slot for a new one.
    ///
    /// `Ok(None)` means the pool is at capacity.
    fn reserve(&self, state: &mut PoolState) -> Result<Option<Reserved>, PoolError> {
        if state.shutdown {
            return Err(PoolError::PoolClosed);
        }
        if let Some(entry) = state.idle.pop_back() {
            state.active += 1;
            return Ok(Some(Reserved::Idle(entry)));
        }
        if state.total() < self.config.max_connections {
            state.active += 1;
            return Ok(Some(Reserved::Create));
        }
        Ok(None)
    }

    /// Turn a reservation into a handle, validating or opening the
    /// connection. The slot is released if this fails.
    fn checkout(self: &Arc<Self>, reserved: Reserved) -> Result<PooledConnection, PoolError> {
        let reservation = Reservation::new(Arc::clone(self));
        let outcome = match reserved {
            Reserved::Idle(entry) => self.validate(entry),
            Reserved::Create => self.connect(),
        };
        match outcome {
            Ok(entry) => {
                self.record(|m| m.checkouts_successful += 1);
                tracing::trace!(connection_id = entry.meta.id, "connection checked out");
                Ok(reservation.complete(entry))
            }
            Err(e) => {
                self.record(|m| m.checkouts_failed += 1);
                Err(e)
            }
        }
    }

    async fn checkout_async(
        self: &Arc<Self>,
        reserved: Reserved,
    ) -> Result<PooledConnection, PoolError> {
        let needs_io = match &reserved {
            Reserved::Idle(entry) => self.config.validate_on_acquire && !entry.conn.is_connected(),
            Reserved::Create => true,
        };
        if !needs_io {
            return self.checkout(reserved);
        }

        let inner = Arc::clone(self);
        tokio::task::spawn_blocking(move || inner.checkout(reserved))
            .await
            .map_err(|e| PoolError::ConnectionCreation(format!("connection task failed: {e}")))?
    }

    /// Check an idle connection before handing it out.
    ///
    /// A disconnected connection is reset, and replaced with a fresh one if
    /// the reset fails. The replacement reuses the caller's slot.
    fn validate(&self, mut entry: PoolEntry) -> Result<PoolEntry, PoolError> {
        if !self.config.validate_on_acquire {
            return Ok(entry);
        }
        self.record(|m| m.validations_performed += 1);
        if entry.conn.is_connected() {
            return Ok(entry);
        }
        self.record(|m| m.validations_failed += 1);

        tracing::debug!(connection_id = entry.meta.id, "idle connection is disconnected, resetting");
        entry.meta.state = ConnectionState::Resetting;
        match entry.conn.reset() {
            Ok(()) => {
                self.record(|m| m.resets_performed += 1);
                entry.meta.state = ConnectionState::Idle;
                Ok(entry)
            }
            Err(e) => {
                self.record(|m| m.resets_failed += 1);
                tracing::debug!(
                    connection_id = entry.meta.id,
                    error = %e,
                    "reset failed, replacing connection"
                );
                self.discard(entry, "reset failed");
                self.connect()
            }
        }
    }

    /// Open a new connection. The caller must hold a slot for it.
    fn connect(&self) -> Result<PoolEntry, PoolError> {
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(connection_id = id, "opening pooled connection");

        let mut conn = Connection::connect_with(self.client_config.clone())
            .map_err(|e| PoolError::ConnectionCreation(e.to_string()))?;
        if let Some(runtime) = &self.config.runtime {
            conn.set_runtime(runtime.clone());
        }

        self.record(|m| m.connections_created += 1);
        Ok(PoolEntry::new(conn, id))
    }

    /// Open connections until `min_connections` is reached again.
    ///
    /// Stops at the first failure. Returns the number opened.
    fn replenish(&self) -> usize {
        let deficit = {
            let mut state = self.state.lock();
            if state.shutdown {
                return 0;
            }
            let deficit = self.config.min_connections.saturating_sub(state.total());
            state.pending += deficit;
            deficit
        };

        let mut created = 0;
        for opened in 0..deficit {
            let outcome = self.connect();
            let mut state = self.state.lock();
            match outcome {
                Ok(entry) if !state.shutdown => {
                    state.pending -= 1;
                    state.idle.push_back(entry);
                    drop(state);
                    self.wake_one();
                    created += 1;
                }
                Ok(entry) => {
                    state.pending -= 1;
                    drop(state);
                    self.discard(entry, "pool shutdown");
                }
                Err(e) => {
                    // Give back this slot and every one not yet used.
                    state.pending -= deficit - opened;
                    drop(state);
                    self.wake_all();
                    tracing::warn!(error = %e, "failed to restore minimum connections");
                    break;
                }
            }
        }
        created
    }

    /// Take back a connection from a dropped handle.
    fn return_connection(&self, mut entry: PoolEntry) {
        if needs_rollback(&entry.conn) {
            tracing::debug!(connection_id = entry.meta.id, "rolling back open transaction");
            if let Err(e) = entry.conn.execute("ROLLBACK") {
                tracing::warn!(connection_id = entry.meta.id, error = %e, "rollback on return failed");
                entry.meta.state = ConnectionState::Closed;
            }
        }

        let reusable = entry.conn.is_connected()
            && !entry.meta.state.should_remove()
            && !entry.meta.is_expired(self.config.max_lifetime);

        let rejected = {
            let mut state = self.state.lock();
            state.active = state.active.saturating_sub(1);
            if reusable && !state.shutdown {
                entry.meta.mark_checkin();
                tracing::trace!(connection_id = entry.meta.id, "connection returned to pool");
                state.idle.push_back(entry);
                None
            } else {
                Some(entry)
            }
        };

        // Wake a waiter either way: it can reuse the connection or open a
        // replacement in the freed slot.
        self.wake_one();
        if let Some(entry) = rejected {
            self.discard(entry, "not reusable");
        }
    }

    /// Free a slot without returning a connection to the idle set.
    fn release_slot(&self) {
        {
            let mut state = self.state.lock();
            state.active = state.active.saturating_sub(1);
        }
        self.wake_one();
    }

    fn shutdown(&self) {
        let drained: Vec<PoolEntry> = {
            let mut state = self.state.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            state.idle.drain(..).collect()
        };
        self.wake_all();

        let closed = drained.len();
        for entry in drained {
            self.discard(entry, "pool shutdown");
        }
        tracing::info!(closed, "connection pool shut down");
    }

    /// Close a connection the pool no longer keeps. Never touches the lock.
    fn discard(&self, mut entry: PoolEntry, reason: &'static str) {
        tracing::debug!(connection_id = entry.meta.id, reason, "closing pooled connection");
        entry.meta.state = ConnectionState::Closed;
        entry.conn.close();
        self.record(|m| m.connections_closed += 1);
    }

    fn wake_one(&self) {
        self.available.notify_one();
        self.notify.notify_one();
    }

    fn wake_all(&self) {
        self.available.notify_all();
        self.notify.notify_waiters();
    }

    fn record(&self, update: impl FnOnce(&mut PoolMetricsInner)) {
        update(&mut self.metrics.lock());
    }
}

/// A reserved slot that is given back unless it becomes a handle.
struct Reservation {
    pool: Option<Arc<PoolInner>>,
}

impl Reservation {
    fn new(pool: Arc<PoolInner>) -> Self {
        Self { pool: Some(pool) }
    }

    fn complete(mut self, mut entry: PoolEntry) -> PooledConnection {
        entry.meta.mark_checkout();
        match self.pool.take() {
            Some(pool) => PooledConnection {
                entry: Some(entry),
                pool,
                released: false,
            },
            None => unreachable!("reservation completed twice"),
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.release_slot();
        }
    }
}

/// Builder for creating a connection pool.
///
/// # Example
///
/// ```rust,ignore
/// let pool = Pool::builder()
///     .connection_string("host=localhost user=app dbname=app")
///     .max_connections(20)
///     .build()?;
/// ```
#[derive(Debug, Default)]
pub struct PoolBuilder {
    client_config: Option<Config>,
    connection_string: Option<String>,
    pool_config: PoolConfig,
}

impl PoolBuilder {
    /// Create a new pool builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the parameters for the pool's connections.
    #[must_use]
    pub fn client_config(mut self, config: Config) -> Self {
        self.client_config = Some(config);
        self
    }

    /// Set the pool's connections from a `key=value` connection string.
    ///
    /// Parsed by [`build`](Self::build); takes precedence over
    /// [`client_config`](Self::client_config).
    #[must_use]
    pub fn connection_string(mut self, conn_str: impl Into<String>) -> Self {
        self.connection_string = Some(conn_str.into());
        self
    }

    /// Set the pool configuration.
    #[must_use]
    pub fn pool_config(mut self, config: PoolConfig) -> Self {
        self.pool_config = config;
        self
    }

    /// Set the minimum number of connections.
    #[must_use]
    pub fn min_connections(mut self, count: u32) -> Self {
        self.pool_config.min_connections = count;
        self
    }

    /// Set the maximum number of connections.
    #[must_use]
    pub fn max_connections(mut self, count: u32) -> Self {
        self.pool_config.max_connections = count;
        self
    }

    /// Set the connection acquisition timeout.
    #[must_use]
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.pool_config.connection_timeout = timeout;
        self
    }

    /// Set the idle connection timeout.
    #[must_use]
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.pool_config.idle_timeout = timeout;
        self
    }

    /// Set the maximum connection lifetime.
    #[must_use]
    pub fn max_lifetime(mut self, lifetime: Duration) -> Self {
        self.pool_config.max_lifetime = lifetime;
        self
    }

    /// Enable or disable validating idle connections on acquire.
    #[must_use]
    pub fn validate_on_acquire(mut self, enabled: bool) -> Self {
        self.pool_config.validate_on_acquire = enabled;
        self
    }

    /// Set a health check query for `maintain`.
    #[must_use]
    pub fn health_check_query(mut self, query: impl Into<Arc<str>>) -> Self {
        self.pool_config.health_check_query = Some(query.into());
        self
    }

    /// Attach a tokio runtime to every connection the pool creates.
    #[must_use]
    pub fn runtime(mut self, runtime: tokio::runtime::Handle) -> Self {
        self.pool_config.runtime = Some(runtime);
        self
    }

    /// Build the pool.
    pub fn build(self) -> Result<Pool, PoolError> {
        let client_config = match (self.connection_string, self.client_config) {
            (Some(conn_str), _) => Config::from_connection_string(&conn_str)
                .map_err(|e| PoolError::Configuration(e.to_string()))?,
            (None, Some(config)) => config,
            (None, None) => Config::default(),
        };
        Pool::new(client_config, self.pool_config)
    }
}

/// Status information about the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Number of idle connections available.
    pub available: u32,
    /// Number of connections currently in use.
    pub in_use: u32,
    /// Total number of connections, including ones being opened or checked.
    pub total: u32,
    /// Maximum allowed connections.
    pub max: u32,
}

impl PoolStatus {
    /// Calculate the utilization percentage.
    #[must_use]
    pub fn utilization(&self) -> f64 {
        if self.max == 0 {
            return 0.0;
        }
        (self.in_use as f64 / self.max as f64) * 100.0
    }

    /// Check if the pool is at capacity.
    #[must_use]
    pub fn is_at_capacity(&self) -> bool {
        self.total >= self.max
    }
}

/// Metrics collected from the pool.
#[derive(Debug, Clone)]
pub struct PoolMetrics {
    /// Total connections created since pool start.
    pub connections_created: u64,
    /// Total connections closed since pool start.
    pub connections_closed: u64,
    /// Successful connection checkouts.
    pub checkouts_successful: u64,
    /// Failed connection checkouts (timeouts, pool closed, etc.).
    pub checkouts_failed: u64,
    /// Validations and health checks performed.
    pub validations_performed: u64,
    /// Validations and health checks that failed.
    pub validations_failed: u64,
    /// Connection resets performed.
    pub resets_performed: u64,
    /// Connection resets that failed.
    pub resets_failed: u64,
    /// Time since pool creation.
    pub uptime: Duration,
}

impl PoolMetrics {
    /// Calculate checkout success rate (0.0 to 1.0).
    #[must_use]
    pub fn checkout_success_rate(&self) -> f64 {
        let total = self.checkouts_successful + self.checkouts_failed;
        if total == 0 {
            return 1.0;
        }
        self.checkouts_successful as f64 / total as f64
    }

    /// Calculate validation success rate (0.0 to 1.0).
    #[must_use]
    pub fn validation_success_rate(&self) -> f64 {
        if self.validations_performed == 0 {
            return 1.0;
        }
        let successful = self.validations_performed - self.validations_failed;
        successful as f64 / self.validations_performed as f64
    }

    /// Calculate reset success rate (0.0 to 1.0).
    #[must_use]
    pub fn reset_success_rate(&self) -> f64 {
        let total = self.resets_performed + self.resets_failed;
        if total == 0 {
            return 1.0;
        }
        self.resets_performed as f64 / total as f64
    }
}

/// A connection retrieved from the pool.
///
/// Dereferences to [`Connection`]. When dropped, the connection is returned
/// to the pool; an open transaction is rolled back first, and a connection
/// that is no longer usable is closed instead.
///
/// The rollback is a blocking round-trip. When the handle is dropped inside
/// a tokio runtime it runs on the blocking thread pool, so the slot becomes
/// available again only once the rollback has finished.
pub struct PooledConnection {
    entry: Option<PoolEntry>,
    pool: Arc<PoolInner>,
    /// Set once the slot has been given back without a connection.
    released: bool,
}

impl PooledConnection {
    /// Get the connection metadata.
    #[must_use]
    pub fn metadata(&self) -> &ConnectionMetadata {
        &self.entry().meta
    }

    /// Detach the connection from the pool.
    ///
    /// The slot is freed immediately and the caller owns the connection.
    pub fn detach(mut self) -> Connection {
        self.released = true;
        self.pool.release_slot();
        match self.entry.take() {
            Some(entry) => {
                tracing::debug!(connection_id = entry.meta.id, "connection detached from pool");
                entry.conn
            }
            None => unreachable!("pooled connection used after release"),
        }
    }

    /// Run `operation`, reconnecting and retrying on connection-level
    /// failures.
    ///
    /// An error counts as connection-level when
    /// [`fenrir_client::Error::is_connection_error`] says so or when the
    /// connection reports itself disconnected afterwards. Such failures
    /// trigger a reconnect (first `reset()`, then a brand-new connection)
    /// and another attempt, up to `max_retries` re-executions. Any other
    /// error, a server rejection included, is returned at once.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let count: i64 = conn.execute_with_retry(
    ///     |c| c.execute("SELECT count(*) FROM jobs")?.get(0, 0),
    ///     2,
    /// )?;
    /// ```
    pub fn execute_with_retry<T, F>(&mut self, mut operation: F, max_retries: u32) -> Result<T, PoolError>
    where
        F: FnMut(&mut Connection) -> fenrir_client::Result<T>,
    {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let err = match operation(&mut self.entry_mut().conn) {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            let err = self.should_retry(err, attempts, max_retries)?;
            tracing::warn!(
                connection_id = self.entry().meta.id,
                attempt = attempts,
                error = %err,
                "connection-level failure, reconnecting"
            );
            let pool = Arc::clone(&self.pool);
            reconnect(&pool, self.entry_mut());
        }
    }

    /// Async [`execute_with_retry`](Self::execute_with_retry).
    ///
    /// `operation` returns a boxed future borrowing the connection.
    /// Reconnects run on tokio's blocking thread pool.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let rows = conn
    ///     .execute_with_retry_async(
    ///         |c| Box::pin(async move { Ok(c.async_execute("SELECT 1").await?.row_count()) }),
    ///         2,
    ///     )
    ///     .await?;
    /// ```
    pub async fn execute_with_retry_async<T, F>(
        &mut self,
        mut operation: F,
        max_retries: u32,
    ) -> Result<T, PoolError>
    where
        F: for<'c> FnMut(&'c mut Connection) -> BoxFuture<'c, fenrir_client::Result<T>>,
    {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let err = match operation(&mut self.entry_mut().conn).await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            let err = self.should_retry(err, attempts, max_retries)?;
            tracing::warn!(
                connection_id = self.entry().meta.id,
                attempt = attempts,
                error = %err,
                "connection-level failure, reconnecting"
            );

            let Some(mut entry) = self.entry.take() else {
                unreachable!("pooled connection used after release");
            };
            let pool = Arc::clone(&self.pool);
            match tokio::task::spawn_blocking(move || {
                reconnect(&pool, &mut entry);
                entry
            })
            .await
            {
                Ok(entry) => self.entry = Some(entry),
                Err(e) => {
                    self.released = true;
                    self.pool.release_slot();
                    return Err(PoolError::ConnectionCreation(format!(
                        "reconnect task failed: {e}"
                    )));
                }
            }
        }
    }

    /// Decide whether a failed attempt is retried.
    ///
    /// Hands the error back when a retry should follow.
    fn should_retry(
        &self,
        err: fenrir_client::Error,
        attempts: u32,
        max_retries: u32,
    ) -> Result<fenrir_client::Error, PoolError> {
        let connection_level = err.is_connection_error() || !self.entry().conn.is_connected();
        if !connection_level {
            return Err(PoolError::Client(err));
        }
        if attempts > max_retries {
            if max_retries == 0 {
                return Err(PoolError::Client(err));
            }
            return Err(PoolError::RetriesExhausted {
                attempts,
                last_error: err,
            });
        }
        Ok(err)
    }

    fn entry(&self) -> &PoolEntry {
        match &self.entry {
            Some(entry) => entry,
            None => unreachable!("pooled connection used after release"),
        }
    }

    fn entry_mut(&mut self) -> &mut PoolEntry {
        match &mut self.entry {
            Some(entry) => entry,
            None => unreachable!("pooled connection used after release"),
        }
    }
}

/// Bring a checked-out connection back: reset it, or swap in a brand-new
/// connection when the reset fails. The slot stays with the caller.
fn reconnect(pool: &PoolInner, entry: &mut PoolEntry) {
    entry.meta.state = ConnectionState::Resetting;
    match entry.conn.reset() {
        Ok(()) => {
            pool.record(|m| m.resets_performed += 1);
            tracing::debug!(connection_id = entry.meta.id, "connection reset");
        }
        Err(e) => {
            pool.record(|m| m.resets_failed += 1);
            tracing::debug!(
                connection_id = entry.meta.id,
                error = %e,
                "reset failed, opening a new connection"
            );
            match pool.connect() {
                Ok(mut fresh) => {
                    fresh.meta.mark_checkout();
                    let stale = std::mem::replace(entry, fresh);
                    pool.discard(stale, "replaced after failed reset");
                }
                Err(e) => {
                    tracing::warn!(connection_id = entry.meta.id, error = %e, "reconnect failed");
                }
            }
        }
    }
    entry.meta.state = ConnectionState::InUse;
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.entry().conn
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        &mut self.entry_mut().conn
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("metadata", &self.entry.as_ref().map(|e| &e.meta))
            .finish_non_exhaustive()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        match self.entry.take() {
            Some(entry) if needs_rollback(&entry.conn) => {
                let deferred = DeferredReturn {
                    pool: Arc::clone(&self.pool),
                    entry: Some(entry),
                };
                match tokio::runtime::Handle::try_current() {
                    // A task dropped unrun still returns through `deferred`.
                    Ok(handle) => drop(handle.spawn_blocking(move || drop(deferred))),
                    Err(_) => drop(deferred),
                }
            }
            Some(entry) => self.pool.return_connection(entry),
            // A cancelled async reconnect took the connection with it.
            None if !self.released => self.pool.release_slot(),
            None => {}
        }
    }
}

fn needs_rollback(conn: &Connection) -> bool {
    conn.is_connected()
        && matches!(
            conn.transaction_status(),
            TransactionState::InTransaction | TransactionState::InError
        )
}

/// Returns a connection to its pool when dropped, wherever that happens.
struct DeferredReturn {
    pool: Arc<PoolInner>,
    entry: Option<PoolEntry>,
}

impl Drop for DeferredReturn {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.take() {
            self.pool.return_connection(entry);
        }
    }
}
