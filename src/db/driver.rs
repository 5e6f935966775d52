//! Driver capability interface.
//!
//! A [`Driver`] knows how to open sessions to one kind of engine; a
//! [`DriverConnection`] is one open session. Pools and the executor only ever
//! talk to these traits, so adding an engine means registering another driver
//! in a [`DriverRegistry`].

use crate::db::types::{RawRow, rows_to_table};
use crate::error::{DbError, DbResult};
use crate::models::{DatabaseType, PoolConfig, QueryParam, Statement, TableResult};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Statement used to check that a session is alive.
pub const PROBE_SQL: &str = "SELECT 1";

/// Factory for sessions of one database kind.
#[async_trait]
pub trait Driver: Send + Sync + std::fmt::Debug {
    fn kind(&self) -> DatabaseType;

    /// Open one session to the configured target.
    ///
    /// Fails with `Config` when the parameters cannot be turned into connect
    /// options and with `Connection` when the backend cannot be reached.
    async fn connect(&self, config: &PoolConfig) -> DbResult<Box<dyn DriverConnection>>;

    /// Convert decoded rows into the uniform table format.
    fn to_table(&self, rows: Vec<RawRow>, elapsed: Duration) -> TableResult {
        rows_to_table(rows, elapsed)
    }
}

/// One open backend session.
#[async_trait]
pub trait DriverConnection: Send + std::fmt::Debug {
    async fn query(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<Vec<RawRow>>;

    /// Run a statement and return the affected-row count.
    async fn execute(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<u64>;

    /// Lazily fetch rows; the stream only talks to the backend when polled.
    fn fetch_stream<'a>(
        &'a mut self,
        sql: &'a str,
        params: &'a [QueryParam],
    ) -> BoxStream<'a, DbResult<RawRow>>;

    async fn begin(&mut self) -> DbResult<()> {
        self.execute("BEGIN", &[]).await.map(|_| ())
    }

    async fn commit(&mut self) -> DbResult<()> {
        self.execute("COMMIT", &[]).await.map(|_| ())
    }

    async fn rollback(&mut self) -> DbResult<()> {
        self.execute("ROLLBACK", &[]).await.map(|_| ())
    }

    /// Run all statements atomically.
    ///
    /// On the first failure everything is rolled back and the error names the
    /// failing index and how many statements succeeded before it. If the
    /// rollback itself fails the session is unusable and a `Connection` error
    /// is returned instead.
    async fn transact(&mut self, statements: &[Statement]) -> DbResult<Vec<u64>> {
        self.begin().await?;

        let mut affected = Vec::with_capacity(statements.len());
        for (index, statement) in statements.iter().enumerate() {
            match self.execute(&statement.sql, &statement.params).await {
                Ok(rows) => affected.push(rows),
                Err(e) => {
                    debug!(index, error = %e, "Statement failed, rolling back");
                    if let Err(rollback_err) = self.rollback().await {
                        warn!(error = %rollback_err, "Rollback failed");
                        return Err(DbError::connection(
                            format!(
                                "rollback after statement {index} failed: {rollback_err} (cause: {e})"
                            ),
                            "The session was discarded; retry the transaction",
                        ));
                    }
                    if e.poisons_connection() {
                        return Err(e);
                    }
                    return Err(DbError::transaction_failed(index, affected.len(), e.to_string()));
                }
            }
        }

        self.commit().await?;
        Ok(affected)
    }

    /// Time-bounded liveness check. Never fails, only reports.
    async fn probe(&mut self, timeout: Duration) -> bool {
        matches!(
            tokio::time::timeout(timeout, self.execute(PROBE_SQL, &[])).await,
            Ok(Ok(_))
        )
    }

    /// Close the session gracefully.
    async fn close(self: Box<Self>);
}

/// Maps each database kind to the driver that serves it.
#[derive(Debug, Clone, Default)]
pub struct DriverRegistry {
    drivers: HashMap<DatabaseType, Arc<dyn Driver>>,
}

impl DriverRegistry {
    /// A registry without any drivers.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A registry with the built-in drivers for every supported engine.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(crate::db::drivers::SqliteDriver));
        registry.register(Arc::new(crate::db::drivers::PostgresDriver));
        registry.register(Arc::new(crate::db::drivers::MySqlDriver));
        registry.register(Arc::new(crate::db::drivers::MssqlDriver));
        registry
    }

    /// Register a driver for its kind, replacing any previous one.
    pub fn register(&mut self, driver: Arc<dyn Driver>) -> Option<Arc<dyn Driver>> {
        self.drivers.insert(driver.kind(), driver)
    }

    pub fn get(&self, kind: DatabaseType) -> DbResult<Arc<dyn Driver>> {
        self.drivers
            .get(&kind)
            .cloned()
            .ok_or_else(|| DbError::config(format!("No driver registered for {kind}")))
    }
}
