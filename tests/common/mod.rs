//! Shared fixtures for integration tests.
//!
//! [`MemoryDriver`] is a scripted in-process engine. It lets tests control
//! connect failures, probe failures and statement latency without a real
//! backend. Statements are interpreted as small commands:
//!
//! - `SLEEP <ms>` waits before answering
//! - `FAIL` returns a statement error (session stays usable)
//! - `BREAK` returns a connection error (session is poisoned)
//! - `WHOAMI` returns the session id in a single `session` column
//! - `ROWS <n>` returns `n` rows; when streamed they are produced lazily
//! - `SELECT 1` is the liveness probe

#![allow(dead_code)]

use async_trait::async_trait;
use dbpool::config::{DeploymentMode, HealthConfig, ManagerOptions, RetryPolicy};
use dbpool::db::driver::{Driver, DriverConnection, DriverRegistry, PROBE_SQL};
use dbpool::db::types::{RawRow, RawValue};
use dbpool::models::{
    Column, ColumnType, ConnectionParams, DatabaseType, PoolConfig, QueryParam, TableResult,
};
use dbpool::{DbError, DbResult, PoolManager};
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Knobs and counters shared by every session of a [`MemoryDriver`].
#[derive(Debug, Default)]
pub struct Script {
    pub connects: AtomicU32,
    /// The next N connect attempts fail with a connection error.
    pub failing_connects: AtomicU32,
    /// Pools whose sessions fail the liveness probe.
    failing_liveness: Mutex<HashSet<String>>,
    pub rows_produced: AtomicU64,
    pub closed: AtomicU32,
    next_session: AtomicU64,
}

impl Script {
    pub fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn fail_next_connects(&self, n: u32) {
        self.failing_connects.store(n, Ordering::SeqCst);
    }

    pub fn set_liveness_fails(&self, pool_id: &str, fails: bool) {
        let mut failing = self.failing_liveness.lock().unwrap();
        if fails {
            failing.insert(pool_id.to_string());
        } else {
            failing.remove(pool_id);
        }
    }

    fn liveness_fails(&self, pool_id: &str) -> bool {
        self.failing_liveness.lock().unwrap().contains(pool_id)
    }

    pub fn rows_produced(&self) -> u64 {
        self.rows_produced.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryDriver {
    pub script: Arc<Script>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry that serves SQLite-typed pools from this driver.
    pub fn registry(&self) -> DriverRegistry {
        let mut registry = DriverRegistry::empty();
        registry.register(Arc::new(self.clone()));
        registry
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    fn kind(&self) -> DatabaseType {
        DatabaseType::SQLite
    }

    async fn connect(&self, config: &PoolConfig) -> DbResult<Box<dyn DriverConnection>> {
        self.script.connects.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .script
            .failing_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(DbError::connection("connection refused", "Check the server"));
        }
        let id = self.script.next_session.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Box::new(MemorySession {
            id,
            pool_id: config.id.clone(),
            script: Arc::clone(&self.script),
        }))
    }
}

#[derive(Debug)]
pub struct MemorySession {
    id: u64,
    pool_id: String,
    script: Arc<Script>,
}

enum Command {
    Sleep(u64),
    Fail,
    Break,
    WhoAmI,
    Rows(u64),
    Probe,
    Other,
}

fn parse(sql: &str) -> Command {
    let mut words = sql.split_whitespace();
    let head = words.next().unwrap_or_default().to_ascii_uppercase();
    let arg = words.next().and_then(|w| w.parse::<u64>().ok()).unwrap_or(0);
    match head.as_str() {
        "SLEEP" => Command::Sleep(arg),
        "FAIL" => Command::Fail,
        "BREAK" => Command::Break,
        "WHOAMI" => Command::WhoAmI,
        "ROWS" => Command::Rows(arg),
        _ if sql.trim().eq_ignore_ascii_case(PROBE_SQL) => Command::Probe,
        _ => Command::Other,
    }
}

fn int_row(name: &str, value: i64) -> RawRow {
    RawRow {
        columns: vec![Column::new(name, ColumnType::Integer, "INTEGER")],
        values: vec![RawValue::I64(value)],
    }
}

fn statement_error() -> DbError {
    DbError::query("scripted failure", None, "Fix the statement")
}

fn broken_error() -> DbError {
    DbError::connection("server closed the connection", "Retry the operation")
}

impl MemorySession {
    async fn run(&self, sql: &str) -> DbResult<Vec<RawRow>> {
        match parse(sql) {
            Command::Sleep(ms) => {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(vec![int_row("slept", ms as i64)])
            }
            Command::Fail => Err(statement_error()),
            Command::Break => Err(broken_error()),
            Command::WhoAmI => Ok(vec![int_row("session", self.id as i64)]),
            Command::Rows(n) => {
                self.script.rows_produced.fetch_add(n, Ordering::SeqCst);
                Ok((0..n as i64).map(|i| int_row("n", i)).collect())
            }
            Command::Probe if self.script.liveness_fails(&self.pool_id) => {
                Err(broken_error())
            }
            Command::Probe => Ok(vec![int_row("1", 1)]),
            Command::Other => Ok(Vec::new()),
        }
    }
}

#[async_trait]
impl DriverConnection for MemorySession {
    async fn query(&mut self, sql: &str, _params: &[QueryParam]) -> DbResult<Vec<RawRow>> {
        self.run(sql).await
    }

    async fn execute(&mut self, sql: &str, _params: &[QueryParam]) -> DbResult<u64> {
        match parse(sql) {
            Command::Other | Command::WhoAmI => Ok(1),
            Command::Probe => self.run(sql).await.map(|_| 0),
            _ => self.run(sql).await.map(|rows| rows.len() as u64),
        }
    }

    fn fetch_stream<'a>(
        &'a mut self,
        sql: &'a str,
        _params: &'a [QueryParam],
    ) -> BoxStream<'a, DbResult<RawRow>> {
        match parse(sql) {
            Command::Rows(n) => {
                let script = Arc::clone(&self.script);
                stream::iter(0..n as i64)
                    .map(move |i| {
                        script.rows_produced.fetch_add(1, Ordering::SeqCst);
                        Ok(int_row("n", i))
                    })
                    .boxed()
            }
            Command::Fail => stream::iter([Err(statement_error())]).boxed(),
            Command::Break => stream::iter([Err(broken_error())]).boxed(),
            _ => stream::once(self.run(sql))
                .flat_map(|result| match result {
                    Ok(rows) => stream::iter(rows.into_iter().map(Ok).collect::<Vec<_>>()),
                    Err(e) => stream::iter(vec![Err(e)]),
                })
                .boxed(),
        }
    }

    async fn close(self: Box<Self>) {
        self.script.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Pool config served by [`MemoryDriver`]. Idle sessions are not probed on
/// checkout so session identity stays observable.
pub fn memory_pool(id: &str, min: u32, max: u32) -> PoolConfig {
    let mut config = PoolConfig::new(id, DatabaseType::SQLite, ConnectionParams::sqlite(id))
        .with_sizing(min, max)
        .with_acquire_timeout(Duration::from_millis(500))
        .with_query_timeout(Duration::from_secs(5));
    config.sizing.test_before_acquire = false;
    config
}

/// Manager options with fast health checks and no connect retries.
pub fn fast_options(mode: DeploymentMode) -> ManagerOptions {
    ManagerOptions::new(
        mode,
        HealthConfig::new(Duration::from_millis(100), Duration::from_millis(50), 2, 2),
        RetryPolicy::no_retry(),
    )
    .with_drain_grace(Duration::from_secs(2))
}

pub fn memory_manager(driver: &MemoryDriver, mode: DeploymentMode) -> PoolManager {
    PoolManager::with_drivers(fast_options(mode), driver.registry()).unwrap()
}

/// The session id reported by a `WHOAMI` result.
pub fn session_of(table: &TableResult) -> i64 {
    table.rows[0][0].as_i64().unwrap()
}
