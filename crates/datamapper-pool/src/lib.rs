//! Connection pooling for datamapper using asupersync.
//!
//! The pool hands out [`PooledConnection`]s that return themselves to the
//! idle list when dropped. Acquisition never blocks: when every slot is in
//! use the caller gets a retryable `Pool(Exhausted)` error.

use datamapper_core::error::{PoolError, PoolErrorKind};
use datamapper_core::{Connection, Driver, Error};
use asupersync::{Cx, Outcome};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Connection pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Connections opened by [`Pool::warm_up`]
    pub min_connections: usize,
    /// Maximum number of connections allowed
    pub max_connections: usize,
    /// Idle connections older than this are closed on checkout (ms)
    pub idle_timeout_ms: u64,
    /// Connections older than this are closed on checkout (ms)
    pub max_lifetime_ms: u64,
    /// Ping idle connections before giving them out
    pub test_on_checkout: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 1,
            max_connections: 10,
            idle_timeout_ms: 600_000,   // 10 minutes
            max_lifetime_ms: 1_800_000, // 30 minutes
            test_on_checkout: true,
        }
    }
}

impl PoolConfig {
    /// Create a new pool configuration with the given max connections.
    pub fn new(max_connections: usize) -> Self {
        Self {
            max_connections,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn min_connections(mut self, n: usize) -> Self {
        self.min_connections = n;
        self
    }

    #[must_use]
    pub fn idle_timeout(mut self, ms: u64) -> Self {
        self.idle_timeout_ms = ms;
        self
    }

    #[must_use]
    pub fn max_lifetime(mut self, ms: u64) -> Self {
        self.max_lifetime_ms = ms;
        self
    }

    #[must_use]
    pub fn test_on_checkout(mut self, enabled: bool) -> Self {
        self.test_on_checkout = enabled;
        self
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.max_connections == 0 || self.min_connections > self.max_connections {
            return Err(Error::Pool(PoolError {
                kind: PoolErrorKind::Config,
                message: format!(
                    "invalid pool bounds: min {} / max {}",
                    self.min_connections, self.max_connections
                ),
                source: None,
            }));
        }
        Ok(())
    }
}

/// Pool statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Total number of connections (active + idle)
    pub total_connections: usize,
    /// Number of idle connections
    pub idle_connections: usize,
    /// Number of checked-out connections
    pub active_connections: usize,
    /// Connections opened over the pool's life
    pub opened: u64,
    /// Connections closed over the pool's life
    pub closed: u64,
}

struct Idle<C> {
    conn: C,
    created_at: Instant,
    idle_since: Instant,
}

struct PoolInner<D: Driver> {
    driver: D,
    config: PoolConfig,
    idle: Mutex<Vec<Idle<D::Conn>>>,
    total: AtomicUsize,
    opened: AtomicU64,
    closed_count: AtomicU64,
    closed: AtomicBool,
}

impl<D: Driver> PoolInner<D> {
    fn release(&self, conn: D::Conn, created_at: Instant) {
        if self.closed.load(Ordering::Acquire) || conn.in_transaction() {
            if conn.in_transaction() {
                tracing::warn!("Discarding pooled connection with an open transaction");
            }
            self.discard(conn);
            return;
        }
        match self.idle.lock() {
            Ok(mut idle) => idle.push(Idle {
                conn,
                created_at,
                idle_since: Instant::now(),
            }),
            Err(_) => self.discard(conn),
        }
    }

    fn discard(&self, conn: D::Conn) {
        drop(conn);
        self.total.fetch_sub(1, Ordering::AcqRel);
        self.closed_count.fetch_add(1, Ordering::Relaxed);
    }

    fn expired(&self, idle: &Idle<D::Conn>) -> bool {
        idle.created_at.elapsed() > Duration::from_millis(self.config.max_lifetime_ms)
            || idle.idle_since.elapsed() > Duration::from_millis(self.config.idle_timeout_ms)
    }

    fn pop_idle(&self) -> Option<Idle<D::Conn>> {
        self.idle.lock().ok().and_then(|mut idle| idle.pop())
    }
}

/// A bounded pool of driver connections.
///
/// Cloning a pool is cheap; clones share the same connections.
pub struct Pool<D: Driver> {
    inner: Arc<PoolInner<D>>,
}

impl<D: Driver> Clone for Pool<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: Driver> std::fmt::Debug for Pool<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("driver", &self.inner.driver.name())
            .field("stats", &self.stats())
            .finish()
    }
}

impl<D: Driver> Pool<D> {
    /// Create a new connection pool.
    pub fn new(driver: D, config: PoolConfig) -> Result<Self, Error> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(PoolInner {
                driver,
                config,
                idle: Mutex::new(Vec::new()),
                total: AtomicUsize::new(0),
                opened: AtomicU64::new(0),
                closed_count: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn driver(&self) -> &D {
        &self.inner.driver
    }

    /// Get the current pool statistics.
    pub fn stats(&self) -> PoolStats {
        let total = self.inner.total.load(Ordering::Acquire);
        let idle = self.inner.idle.lock().map(|i| i.len()).unwrap_or(0);
        PoolStats {
            total_connections: total,
            idle_connections: idle,
            active_connections: total.saturating_sub(idle),
            opened: self.inner.opened.load(Ordering::Relaxed),
            closed: self.inner.closed_count.load(Ordering::Relaxed),
        }
    }

    /// Check if the pool is at capacity.
    pub fn at_capacity(&self) -> bool {
        self.inner.total.load(Ordering::Acquire) >= self.inner.config.max_connections
    }

    /// Open connections until `min_connections` exist.
    pub async fn warm_up(&self, cx: &Cx) -> Outcome<(), Error> {
        // Hold every checkout so idle connections are not handed back out.
        let mut held = Vec::new();
        while self.inner.total.load(Ordering::Acquire) < self.inner.config.min_connections {
            match self.acquire(cx).await {
                Outcome::Ok(conn) => held.push(conn),
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        drop(held);
        Outcome::Ok(())
    }

    /// Check out a connection.
    ///
    /// Reuses a healthy idle connection when one exists, otherwise opens a
    /// new one while under `max_connections`.
    #[tracing::instrument(level = "trace", skip(self, cx), fields(driver = self.inner.driver.name()))]
    pub async fn acquire(&self, cx: &Cx) -> Outcome<PooledConnection<D>, Error> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Outcome::Err(pool_error(PoolErrorKind::Closed, "pool is closed"));
        }

        while let Some(idle) = self.inner.pop_idle() {
            if self.inner.expired(&idle) {
                tracing::debug!("Closing expired idle connection");
                self.inner.discard(idle.conn);
                continue;
            }
            if self.inner.config.test_on_checkout {
                match idle.conn.ping(cx).await {
                    Outcome::Ok(()) => {}
                    Outcome::Err(e) => {
                        tracing::debug!(error = %e, "Idle connection failed ping");
                        self.inner.discard(idle.conn);
                        continue;
                    }
                    Outcome::Cancelled(r) => {
                        self.inner.release(idle.conn, idle.created_at);
                        return Outcome::Cancelled(r);
                    }
                    Outcome::Panicked(p) => {
                        self.inner.discard(idle.conn);
                        return Outcome::Panicked(p);
                    }
                }
            }
            return Outcome::Ok(PooledConnection {
                conn: Some(idle.conn),
                created_at: idle.created_at,
                pool: Arc::clone(&self.inner),
            });
        }

        // Reserve a slot before connecting so concurrent acquires respect the bound.
        let reserved = self
            .inner
            .total
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.inner.config.max_connections).then_some(n + 1)
            });
        if reserved.is_err() {
            return Outcome::Err(pool_error(
                PoolErrorKind::Exhausted,
                format!(
                    "all {} connections are in use",
                    self.inner.config.max_connections
                ),
            ));
        }

        match self.inner.driver.connect(cx).await {
            Outcome::Ok(conn) => {
                self.inner.opened.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(total = self.inner.total.load(Ordering::Relaxed), "Opened connection");
                Outcome::Ok(PooledConnection {
                    conn: Some(conn),
                    created_at: Instant::now(),
                    pool: Arc::clone(&self.inner),
                })
            }
            Outcome::Err(e) => {
                self.inner.total.fetch_sub(1, Ordering::AcqRel);
                Outcome::Err(e)
            }
            Outcome::Cancelled(r) => {
                self.inner.total.fetch_sub(1, Ordering::AcqRel);
                Outcome::Cancelled(r)
            }
            Outcome::Panicked(p) => {
                self.inner.total.fetch_sub(1, Ordering::AcqRel);
                Outcome::Panicked(p)
            }
        }
    }

    /// Close the pool: idle connections are dropped now, checked-out ones on return.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let drained: Vec<_> = self
            .inner
            .idle
            .lock()
            .map(|mut idle| idle.drain(..).collect())
            .unwrap_or_default();
        for idle in drained {
            self.inner.discard(idle.conn);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

fn pool_error(kind: PoolErrorKind, message: impl Into<String>) -> Error {
    Error::Pool(PoolError {
        kind,
        message: message.into(),
        source: None,
    })
}

/// A connection borrowed from the pool.
///
/// Dropping it returns the connection to the idle list, unless a
/// transaction is still open, in which case the connection is closed.
pub struct PooledConnection<D: Driver> {
    conn: Option<D::Conn>,
    created_at: Instant,
    pool: Arc<PoolInner<D>>,
}

impl<D: Driver> PooledConnection<D> {
    /// Close the connection instead of returning it to the pool.
    pub fn detach(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.discard(conn);
        }
    }
}

impl<D: Driver> std::ops::Deref for PooledConnection<D> {
    type Target = D::Conn;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl<D: Driver> Drop for PooledConnection<D> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn, self.created_at);
        }
    }
}

impl<D: Driver> std::fmt::Debug for PooledConnection<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("age", &self.created_at.elapsed())
            .finish_non_exhaustive()
    }
}
