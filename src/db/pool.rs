//! Bounded connection pool for one configured target.
//!
//! # Design Decisions
//!
//! - **`Semaphore` for capacity**: a checkout holds one connection permit and
//!   one query slot. Waiters queue fairly on the semaphores and give up when
//!   `acquire_timeout` elapses.
//! - **`std::sync::Mutex` for pool state**: the idle set and counters are only
//!   touched in short synchronous sections, never across an await point.
//! - **RAII [`PooledConnection`]**: `release`/`discard` are explicit. Dropping
//!   the guard without either means the operation was cancelled, so the
//!   session is treated as Broken.
//! - **`Weak` reaper**: the background task exits once the pool is dropped or
//!   closed.
//! - **`CancellationToken` for shutdown**: when a drain outlives its grace
//!   period the token fires, and every bounded operation still holding a
//!   session fails with a connection error so the session is discarded.
//!
//! # Capacity
//!
//! A new session is only opened by a permit holder that found the idle set
//! empty, and a returned session re-enters the idle set before its permit is
//! released. Together this keeps `total <= max_connections`.

use crate::config::RetryPolicy;
use crate::db::driver::{Driver, DriverConnection};
use crate::error::{DbError, DbResult};
use crate::models::{HealthStatus, PoolConfig, PoolState, PoolStatus};
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long a forced shutdown waits for interrupted work to hand back its
/// sessions.
const FORCE_CLOSE_WAIT: Duration = Duration::from_secs(1);

/// Bookkeeping for one session.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionMeta {
    pub id: u64,
    pub created_at: Instant,
    pub last_used: Instant,
}

struct IdleConnection {
    conn: Box<dyn DriverConnection>,
    meta: ConnectionMeta,
}

struct PoolInner {
    /// LIFO: the most recently used session is handed out first.
    idle: VecDeque<IdleConnection>,
    /// Idle + checked out + being opened.
    total: u32,
    checked_out: u32,
    state: PoolState,
    health: HealthStatus,
    broken_total: u64,
}

/// Result of a health probe against a pool.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    Success(Duration),
    Failure(String),
    /// The pool was saturated or closing; nothing was learned.
    Skipped,
}

pub struct Pool {
    config: PoolConfig,
    driver: Arc<dyn Driver>,
    retry: RetryPolicy,
    inner: Mutex<PoolInner>,
    connection_slots: Arc<Semaphore>,
    query_slots: Arc<Semaphore>,
    waiting: AtomicU32,
    /// Signalled whenever a checked-out session comes back.
    returned: Notify,
    /// Fired when in-flight work must give up its sessions.
    shutdown: CancellationToken,
    next_id: AtomicU64,
    created_at: Instant,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("Pool")
            .field("id", &self.config.id)
            .field("db_type", &self.config.db_type)
            .field("state", &inner.state)
            .field("total", &inner.total)
            .field("checked_out", &inner.checked_out)
            .finish_non_exhaustive()
    }
}

impl Pool {
    /// Validate the configuration, establish `min_connections` sessions and
    /// start the reaper.
    ///
    /// Nothing is left behind on failure: sessions opened so far are closed.
    pub async fn open(
        config: PoolConfig,
        driver: Arc<dyn Driver>,
        retry: RetryPolicy,
    ) -> DbResult<Arc<Self>> {
        config.validate()?;
        if driver.kind() != config.db_type {
            return Err(DbError::config(format!(
                "Driver for {} cannot serve a {} pool",
                driver.kind(),
                config.db_type
            )));
        }

        let sizing = &config.sizing;
        let pool = Arc::new(Self {
            connection_slots: Arc::new(Semaphore::new(permit_count(sizing.max_connections))),
            query_slots: Arc::new(Semaphore::new(permit_count(
                sizing.effective_max_concurrent(),
            ))),
            inner: Mutex::new(PoolInner {
                // Grows on demand: max_connections is a ceiling, not a size hint
                idle: VecDeque::new(),
                total: 0,
                checked_out: 0,
                state: PoolState::Active,
                health: HealthStatus::healthy(),
                broken_total: 0,
            }),
            waiting: AtomicU32::new(0),
            returned: Notify::new(),
            shutdown: CancellationToken::new(),
            next_id: AtomicU64::new(1),
            created_at: Instant::now(),
            reaper: Mutex::new(None),
            config,
            driver,
            retry,
        });

        let min = pool.config.sizing.min_connections;
        let mut established = Vec::with_capacity(min as usize);
        for _ in 0..min {
            match pool.open_connection().await {
                Ok(conn) => established.push(conn),
                Err(e) => {
                    for conn in established {
                        conn.close().await;
                    }
                    return Err(e);
                }
            }
        }

        {
            let mut inner = pool.lock();
            for conn in established {
                let meta = pool.new_meta();
                inner.idle.push_back(IdleConnection { conn, meta });
                inner.total += 1;
            }
        }

        let weak = Arc::downgrade(&pool);
        let interval = pool.config.sizing.reap_interval;
        let handle = tokio::spawn(async move {
            Self::reap_task(weak, interval).await;
        });
        *pool.reaper.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        info!(
            pool_id = %pool.config.id,
            db_type = %pool.config.db_type,
            target = %pool.config.connection.masked(pool.config.db_type),
            min_connections = min,
            max_connections = pool.config.sizing.max_connections,
            "Pool created"
        );
        Ok(pool)
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    pub fn state(&self) -> PoolState {
        self.lock().state
    }

    pub fn checked_out(&self) -> u32 {
        self.lock().checked_out
    }

    /// A token that fires when in-flight work on this pool must stop.
    pub fn shutdown_signal(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn new_meta(&self) -> ConnectionMeta {
        let now = Instant::now();
        ConnectionMeta {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            created_at: now,
            last_used: now,
        }
    }

    /// Whether an idle session should be closed instead of reused.
    ///
    /// Sessions past `max_lifetime` always go. Sessions past `idle_timeout`
    /// go only while `total` stays above `min_connections`. Checkout and the
    /// reaper both apply this rule.
    fn should_retire(&self, meta: &ConnectionMeta, now: Instant, total: u32) -> bool {
        let sizing = &self.config.sizing;
        let too_old = now.saturating_duration_since(meta.created_at) >= sizing.max_lifetime;
        let too_idle = now.saturating_duration_since(meta.last_used) >= sizing.idle_timeout;
        too_old || (too_idle && total > sizing.min_connections)
    }

    // =========================================================================
    // Checkout
    // =========================================================================

    /// Check out a session, waiting at most `timeout` for capacity.
    ///
    /// Idle sessions are reused; a new one is opened only when none is idle
    /// and the pool is below `max_connections`.
    pub async fn checkout(self: &Arc<Self>, timeout: Duration) -> DbResult<PooledConnection> {
        if !self.state().accepts_checkouts() {
            return Err(DbError::pool_closed(self.id()));
        }

        let start = Instant::now();
        let deadline = start + timeout;

        let permits = {
            let _waiting = WaitingGuard::new(&self.waiting);
            let acquire = async {
                let query = Arc::clone(&self.query_slots).acquire_owned().await?;
                let connection = Arc::clone(&self.connection_slots).acquire_owned().await?;
                Ok::<_, tokio::sync::AcquireError>(Permits {
                    _query: query,
                    _connection: connection,
                })
            };
            match tokio::time::timeout_at(deadline, acquire).await {
                Ok(Ok(permits)) => permits,
                Ok(Err(_)) => return Err(DbError::pool_closed(self.id())),
                Err(_) => {
                    debug!(pool_id = %self.id(), waited_ms = timeout.as_millis() as u64, "Checkout timed out");
                    return Err(DbError::pool_exhausted(self.id(), start.elapsed()));
                }
            }
        };

        let mut permits = Some(permits);
        loop {
            let (candidate, retired) = {
                let mut inner = self.lock();
                if !inner.state.accepts_checkouts() {
                    return Err(DbError::pool_closed(self.id()));
                }
                let now = Instant::now();
                let mut retired = Vec::new();
                let candidate = loop {
                    match inner.idle.pop_back() {
                        Some(idle) if self.should_retire(&idle.meta, now, inner.total) => {
                            inner.total -= 1;
                            retired.push(idle);
                        }
                        Some(idle) => break Some(idle),
                        None => {
                            inner.total += 1;
                            break None;
                        }
                    }
                };
                inner.checked_out += 1;
                (candidate, retired)
            };
            for idle in retired {
                debug!(pool_id = %self.id(), connection_id = idle.meta.id, "Idle session expired");
                close_in_background(idle.conn);
            }

            let Some(permit_set) = permits.take() else {
                return Err(DbError::internal("checkout lost its permits"));
            };

            match candidate {
                Some(IdleConnection { conn, meta }) => {
                    let mut guard = PooledConnection::new(conn, meta, Arc::clone(self), permit_set);
                    if self.config.sizing.test_before_acquire {
                        let remaining = deadline.saturating_duration_since(Instant::now());
                        if !guard.probe(remaining).await {
                            warn!(pool_id = %self.id(), connection_id = meta.id, "Idle session failed probe, discarding");
                            permits = guard.discard_keep_permits();
                            continue;
                        }
                    }
                    return Ok(guard);
                }
                None => {
                    let reservation = Reservation::new(self, true);
                    return match tokio::time::timeout_at(deadline, self.open_connection()).await {
                        Ok(Ok(conn)) => {
                            reservation.commit();
                            let meta = self.new_meta();
                            debug!(pool_id = %self.id(), connection_id = meta.id, "Opened new session");
                            Ok(PooledConnection::new(conn, meta, Arc::clone(self), permit_set))
                        }
                        Ok(Err(e)) => Err(e),
                        Err(_) => Err(DbError::timeout("connection acquire", timeout)),
                    };
                }
            }
        }
    }

    /// Open one session, retrying transient failures with exponential backoff.
    async fn open_connection(&self) -> DbResult<Box<dyn DriverConnection>> {
        let mut attempt = 1;
        loop {
            match self.driver.connect(&self.config).await {
                Ok(conn) => return Ok(conn),
                Err(e) if e.is_retryable() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        pool_id = %self.id(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Connection attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    // =========================================================================
    // Return paths
    // =========================================================================

    fn return_idle(&self, conn: Box<dyn DriverConnection>, mut meta: ConnectionMeta) {
        let leftover = {
            let mut inner = self.lock();
            inner.checked_out = inner.checked_out.saturating_sub(1);
            if inner.state == PoolState::Closed {
                inner.total = inner.total.saturating_sub(1);
                Some(conn)
            } else {
                meta.last_used = Instant::now();
                inner.idle.push_back(IdleConnection { conn, meta });
                None
            }
        };
        self.returned.notify_waiters();
        if let Some(conn) = leftover {
            close_in_background(conn);
        }
    }

    fn return_broken(&self, conn: Box<dyn DriverConnection>, meta: ConnectionMeta) {
        {
            let mut inner = self.lock();
            inner.checked_out = inner.checked_out.saturating_sub(1);
            inner.total = inner.total.saturating_sub(1);
            inner.broken_total += 1;
        }
        warn!(pool_id = %self.id(), connection_id = meta.id, "Session discarded as broken");
        self.returned.notify_waiters();
        close_in_background(conn);
    }

    // =========================================================================
    // Background reclamation
    // =========================================================================

    async fn reap_task(weak_pool: Weak<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;

            // Try to upgrade weak reference - exit if pool was dropped
            let Some(pool) = weak_pool.upgrade() else {
                return;
            };
            if pool.state() == PoolState::Closed {
                return;
            }

            pool.reap().await;
            pool.replenish().await;

            // Drop strong reference before sleeping to allow pool deallocation
            drop(pool);
        }
    }

    /// Close idle sessions past `max_lifetime`, and past `idle_timeout` while
    /// the pool holds more than `min_connections`.
    pub async fn reap(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<IdleConnection> = {
            let mut inner = self.lock();
            let mut kept = VecDeque::with_capacity(inner.idle.len());
            let mut expired = Vec::new();
            while let Some(idle) = inner.idle.pop_front() {
                if self.should_retire(&idle.meta, now, inner.total) {
                    inner.total -= 1;
                    expired.push(idle);
                } else {
                    kept.push_back(idle);
                }
            }
            inner.idle = kept;
            expired
        };

        let count = expired.len();
        if count > 0 {
            debug!(pool_id = %self.id(), closed = count, "Reaped expired sessions");
        }
        for idle in expired {
            idle.conn.close().await;
        }
        count
    }

    /// Bring the pool back up to `min_connections` when capacity allows.
    pub async fn replenish(&self) {
        loop {
            let Ok(_permit) = Arc::clone(&self.connection_slots).try_acquire_owned() else {
                return;
            };
            let reservation = {
                let mut inner = self.lock();
                if !inner.state.accepts_checkouts()
                    || inner.total >= self.config.sizing.min_connections
                {
                    return;
                }
                inner.total += 1;
                Reservation::new(self, false)
            };

            match self.open_connection().await {
                Ok(conn) => {
                    reservation.commit();
                    let meta = self.new_meta();
                    let leftover = {
                        let mut inner = self.lock();
                        if inner.state == PoolState::Closed {
                            inner.total = inner.total.saturating_sub(1);
                            Some(conn)
                        } else {
                            inner.idle.push_back(IdleConnection { conn, meta });
                            None
                        }
                    };
                    if let Some(conn) = leftover {
                        conn.close().await;
                        return;
                    }
                }
                Err(e) => {
                    warn!(pool_id = %self.id(), error = %e, "Failed to replenish pool");
                    return;
                }
            }
        }
    }

    // =========================================================================
    // Health
    // =========================================================================

    /// Run a bounded health probe through a normal checkout.
    pub async fn probe(self: &Arc<Self>, timeout: Duration) -> ProbeOutcome {
        let start = Instant::now();
        let mut conn = match self.checkout(timeout).await {
            Ok(conn) => conn,
            Err(DbError::PoolExhausted { .. } | DbError::PoolClosed { .. }) => {
                return ProbeOutcome::Skipped;
            }
            Err(e) => return ProbeOutcome::Failure(e.to_string()),
        };

        let remaining = timeout.saturating_sub(start.elapsed());
        if conn.probe(remaining).await {
            conn.release();
            ProbeOutcome::Success(start.elapsed())
        } else {
            conn.discard();
            ProbeOutcome::Failure(format!(
                "probe did not succeed within {}ms",
                timeout.as_millis()
            ))
        }
    }

    /// Record the monitor's view of this pool and flip Active/Degraded.
    pub fn record_health(&self, health: HealthStatus) {
        let mut inner = self.lock();
        if inner.state.accepts_checkouts() {
            inner.state = if health.healthy {
                PoolState::Active
            } else {
                PoolState::Degraded
            };
        }
        inner.health = health;
    }

    pub fn health(&self) -> HealthStatus {
        self.lock().health.clone()
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Stop accepting checkouts. Waiters are woken and fail with `PoolClosed`.
    ///
    /// Returns false if the pool was already draining or closed.
    pub fn begin_drain(&self) -> bool {
        let first = {
            let mut inner = self.lock();
            if !inner.state.accepts_checkouts() {
                false
            } else {
                inner.state = PoolState::Draining;
                true
            }
        };
        self.query_slots.close();
        self.connection_slots.close();
        first
    }

    /// Drain the pool: stop new checkouts, wait up to `grace` for in-flight
    /// work to return its sessions, then close everything.
    ///
    /// Work still running when the grace period ends is interrupted through
    /// the shutdown signal; its sessions are discarded as they come back.
    pub async fn drain(&self, grace: Duration) {
        self.begin_drain();

        let in_flight = self.wait_for_returns(Instant::now() + grace).await;
        if in_flight > 0 {
            warn!(
                pool_id = %self.id(),
                in_flight,
                "Drain grace period elapsed, interrupting in-flight work"
            );
            self.shutdown.cancel();
            let stuck = self.wait_for_returns(Instant::now() + FORCE_CLOSE_WAIT).await;
            if stuck > 0 {
                warn!(pool_id = %self.id(), stuck, "Sessions still checked out at close");
            }
        }

        self.close().await;
    }

    /// Wait until nothing is checked out or `deadline` passes. Returns the
    /// number of sessions still out.
    async fn wait_for_returns(&self, deadline: Instant) -> u32 {
        loop {
            let notified = self.returned.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let in_flight = self.lock().checked_out;
            if in_flight == 0 {
                return 0;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.lock().checked_out;
            }
        }
    }

    async fn close(&self) {
        self.shutdown.cancel();
        if let Some(handle) = self
            .reaper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }

        let idle: Vec<IdleConnection> = {
            let mut inner = self.lock();
            inner.state = PoolState::Closed;
            let idle: Vec<_> = inner.idle.drain(..).collect();
            inner.total = inner.total.saturating_sub(idle.len() as u32);
            idle
        };

        for conn in idle {
            conn.conn.close().await;
        }
        info!(pool_id = %self.id(), "Pool closed");
    }

    /// Live snapshot of counts and state.
    pub fn status(&self) -> PoolStatus {
        let inner = self.lock();
        PoolStatus {
            pool_id: self.config.id.clone(),
            db_type: self.config.db_type,
            state: inner.state,
            health: inner.health.clone(),
            total_connections: inner.total,
            idle_connections: inner.idle.len() as u32,
            checked_out: inner.checked_out,
            waiting: self.waiting.load(Ordering::Relaxed),
            min_connections: self.config.sizing.min_connections,
            max_connections: self.config.sizing.max_connections,
            broken_total: inner.broken_total,
            uptime: self.created_at.elapsed(),
        }
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        if let Some(handle) = self
            .reaper
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

/// Semaphore size for a configured limit. Limits past what tokio can count
/// are clamped.
fn permit_count(limit: u32) -> usize {
    (limit as usize).min(Semaphore::MAX_PERMITS)
}

fn close_in_background(conn: Box<dyn DriverConnection>) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(conn.close());
        }
        // No runtime left: dropping the session closes its socket
        Err(_) => drop(conn),
    }
}

// =============================================================================
// Guards
// =============================================================================

struct Permits {
    _query: OwnedSemaphorePermit,
    _connection: OwnedSemaphorePermit,
}

/// Counts a waiter for the lifetime of the guard.
struct WaitingGuard<'a>(&'a AtomicU32);

impl<'a> WaitingGuard<'a> {
    fn new(counter: &'a AtomicU32) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// A slot counted in `total` while its session is being opened. Undone on
/// failure or cancellation.
struct Reservation<'a> {
    pool: &'a Pool,
    checked_out: bool,
    armed: bool,
}

impl<'a> Reservation<'a> {
    fn new(pool: &'a Pool, checked_out: bool) -> Self {
        Self {
            pool,
            checked_out,
            armed: true,
        }
    }

    fn commit(mut self) {
        self.armed = false;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        {
            let mut inner = self.pool.lock();
            inner.total = inner.total.saturating_sub(1);
            if self.checked_out {
                inner.checked_out = inner.checked_out.saturating_sub(1);
            }
        }
        self.pool.returned.notify_waiters();
    }
}

/// A checked-out session.
///
/// Call [`release`](Self::release) when the session is healthy and
/// [`discard`](Self::discard) when it is not. Dropping the guard without
/// either marks the session Broken: the operation using it was cancelled and
/// its protocol state is unknown.
pub struct PooledConnection {
    conn: Option<Box<dyn DriverConnection>>,
    meta: ConnectionMeta,
    pool: Arc<Pool>,
    permits: Option<Permits>,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("pool_id", &self.pool.id())
            .field("connection_id", &self.meta.id)
            .finish_non_exhaustive()
    }
}

impl PooledConnection {
    fn new(
        conn: Box<dyn DriverConnection>,
        meta: ConnectionMeta,
        pool: Arc<Pool>,
        permits: Permits,
    ) -> Self {
        Self {
            conn: Some(conn),
            meta,
            pool,
            permits: Some(permits),
        }
    }

    pub fn id(&self) -> u64 {
        self.meta.id
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    /// The owning pool's shutdown signal.
    pub fn shutdown_signal(&self) -> CancellationToken {
        self.pool.shutdown_signal()
    }

    /// Return the session to the idle set.
    pub fn release(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.return_idle(conn, self.meta);
        }
    }

    /// Close the session and count it as broken.
    pub fn discard(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.return_broken(conn, self.meta);
        }
    }

    /// Release or discard depending on whether `result` left the session in
    /// a known state.
    pub fn finish<T>(self, result: &DbResult<T>) {
        match result {
            Err(e) if e.poisons_connection() => self.discard(),
            _ => self.release(),
        }
    }

    fn discard_keep_permits(mut self) -> Option<Permits> {
        if let Some(conn) = self.conn.take() {
            self.pool.return_broken(conn, self.meta);
        }
        self.permits.take()
    }
}

impl Deref for PooledConnection {
    type Target = dyn DriverConnection;

    fn deref(&self) -> &Self::Target {
        self.conn
            .as_deref()
            .expect("session is present until the guard is consumed")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn
            .as_deref_mut()
            .expect("session is present until the guard is consumed")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            debug!(
                pool_id = %self.pool.id(),
                connection_id = self.meta.id,
                "Session dropped mid-operation"
            );
            self.pool.return_broken(conn, self.meta);
        }
        // Permits drop after the session is accounted for
    }
}
