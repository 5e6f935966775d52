//! Transaction registry for interactive transactions.
//!
//! An interactive transaction keeps one session checked out from its pool
//! between calls. Statements tagged with the transaction id run on that
//! session until `commit` or `rollback` ends it. A background sweeper rolls
//! back transactions that outlive their timeout.
//!
//! A transaction cannot outlive its pool's willingness to serve: once the
//! pool starts draining, further statements and commits are refused and the
//! transaction is rolled back.

use crate::db::executor::bounded;
use crate::db::pool::{Pool, PooledConnection};
use crate::error::{DbError, DbResult};
use crate::models::{QueryParam, TableResult};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

struct ActiveTransaction {
    pool: Arc<Pool>,
    started: Instant,
    started_at: DateTime<Utc>,
    timeout: Duration,
    /// `None` once the transaction has ended.
    conn: Mutex<Option<PooledConnection>>,
}

impl ActiveTransaction {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.started) >= self.timeout
    }

    fn pool_id(&self) -> &str {
        self.pool.id()
    }

    fn pool_accepts_work(&self) -> bool {
        self.pool.state().accepts_checkouts()
    }
}

/// Metadata about an active transaction (for listing without consuming).
#[derive(Debug, Clone, Serialize)]
pub struct TransactionMetadata {
    pub transaction_id: String,
    pub pool_id: String,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
    pub timeout: Duration,
}

pub struct TransactionRegistry {
    transactions: DashMap<String, Arc<ActiveTransaction>>,
    default_timeout: Duration,
    max_timeout: Duration,
    sweeper: StdMutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for TransactionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionRegistry")
            .field("active", &self.transactions.len())
            .field("default_timeout", &self.default_timeout)
            .field("max_timeout", &self.max_timeout)
            .finish_non_exhaustive()
    }
}

impl TransactionRegistry {
    pub fn new(default_timeout: Duration, max_timeout: Duration) -> Self {
        Self {
            transactions: DashMap::new(),
            default_timeout: default_timeout.min(max_timeout),
            max_timeout,
            sweeper: StdMutex::new(None),
        }
    }

    /// Start the background task that rolls back expired transactions.
    ///
    /// The task holds a weak reference and stops once the registry is gone.
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration) {
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(Self::sweep_task(weak, interval));
        if let Some(previous) = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle)
        {
            previous.abort();
        }
    }

    async fn sweep_task(weak: Weak<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(registry) = weak.upgrade() else {
                return;
            };
            registry.sweep_expired().await;
        }
    }

    /// Check out a session from `pool` and open a transaction on it.
    ///
    /// `timeout` defaults to the registry default and is capped at the
    /// configured maximum.
    pub async fn begin(&self, pool: &Arc<Pool>, timeout: Option<Duration>) -> DbResult<String> {
        let timeout = timeout
            .map(|t| t.min(self.max_timeout))
            .unwrap_or(self.default_timeout);

        let mut conn = pool.checkout(pool.config().sizing.acquire_timeout).await?;
        let limit = pool.config().timeouts.query_timeout;
        let signal = pool.shutdown_signal();
        if let Err(e) = bounded(&signal, limit, "begin", conn.begin()).await {
            if e.poisons_connection() {
                conn.discard();
            } else {
                conn.release();
            }
            return Err(e);
        }

        let transaction_id = generate_transaction_id();
        self.transactions.insert(
            transaction_id.clone(),
            Arc::new(ActiveTransaction {
                pool: Arc::clone(pool),
                started: Instant::now(),
                started_at: Utc::now(),
                timeout,
                conn: Mutex::new(Some(conn)),
            }),
        );

        info!(
            transaction_id = %transaction_id,
            pool_id = %pool.id(),
            timeout_ms = timeout.as_millis() as u64,
            "Transaction started"
        );
        Ok(transaction_id)
    }

    /// Run a row-returning statement inside a transaction.
    pub async fn query(
        &self,
        transaction_id: &str,
        pool_id: &str,
        sql: &str,
        params: &[QueryParam],
        timeout: Option<Duration>,
    ) -> DbResult<TableResult> {
        let entry = self.entry(transaction_id, pool_id).await?;
        let mut guard = entry.conn.lock().await;
        let conn = Self::session(&mut guard, transaction_id)?;

        let limit = timeout.unwrap_or(conn.pool().config().timeouts.query_timeout);
        let signal = conn.shutdown_signal();
        let start = Instant::now();
        let result = bounded(&signal, limit, "query", conn.query(sql, params)).await;
        let driver = Arc::clone(conn.pool().driver());
        self.check_poisoned(transaction_id, &mut guard, &result);

        debug!(transaction_id = %transaction_id, sql = %sql, "Queried in transaction");
        Ok(driver.to_table(result?, start.elapsed()))
    }

    /// Run a write statement inside a transaction.
    pub async fn execute(
        &self,
        transaction_id: &str,
        pool_id: &str,
        sql: &str,
        params: &[QueryParam],
        timeout: Option<Duration>,
    ) -> DbResult<u64> {
        let entry = self.entry(transaction_id, pool_id).await?;
        let mut guard = entry.conn.lock().await;
        let conn = Self::session(&mut guard, transaction_id)?;

        let limit = timeout.unwrap_or(conn.pool().config().timeouts.query_timeout);
        let signal = conn.shutdown_signal();
        let result = bounded(&signal, limit, "execute", conn.execute(sql, params)).await;
        self.check_poisoned(transaction_id, &mut guard, &result);

        let rows_affected = result?;
        debug!(
            transaction_id = %transaction_id,
            sql = %sql,
            rows_affected,
            "Executed in transaction"
        );
        Ok(rows_affected)
    }

    /// Commit and return the session to its pool.
    ///
    /// A rejected commit rolls the transaction back; the transaction is over
    /// either way.
    pub async fn commit(&self, transaction_id: &str) -> DbResult<()> {
        let mut conn = self.take(transaction_id).await?;
        let limit = conn.pool().config().timeouts.query_timeout;
        let signal = conn.shutdown_signal();

        match bounded(&signal, limit, "commit", conn.commit()).await {
            Ok(()) => {
                conn.release();
                info!(transaction_id = %transaction_id, "Transaction committed");
                Ok(())
            }
            Err(e) if e.poisons_connection() => {
                conn.discard();
                Err(e)
            }
            Err(e) => {
                warn!(transaction_id = %transaction_id, error = %e, "Commit rejected, rolling back");
                match bounded(&signal, limit, "rollback", conn.rollback()).await {
                    Ok(()) => conn.release(),
                    Err(_) => conn.discard(),
                }
                Err(e)
            }
        }
    }

    /// Roll back and return the session to its pool.
    pub async fn rollback(&self, transaction_id: &str) -> DbResult<()> {
        let mut conn = self.take(transaction_id).await?;
        let limit = conn.pool().config().timeouts.query_timeout;
        let signal = conn.shutdown_signal();

        let result = bounded(&signal, limit, "rollback", conn.rollback()).await;
        match &result {
            Ok(()) => {
                conn.release();
                info!(transaction_id = %transaction_id, "Transaction rolled back");
            }
            // A session whose rollback failed is in an unknown state
            Err(_) => conn.discard(),
        }
        result
    }

    /// Roll back every transaction past its timeout. Returns how many ended.
    pub async fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<String> = self
            .transactions
            .iter()
            .filter(|entry| entry.value().is_expired(now))
            .map(|entry| entry.key().clone())
            .collect();

        let mut swept = 0;
        for id in expired {
            if let Some((_, entry)) = self.transactions.remove(&id) {
                warn!(
                    transaction_id = %id,
                    pool_id = %entry.pool_id(),
                    "Rolling back expired transaction"
                );
                Self::abandon(&entry).await;
                swept += 1;
            }
        }
        swept
    }

    /// Roll back every transaction held on `pool_id`.
    pub async fn abort_pool(&self, pool_id: &str) -> usize {
        let ids: Vec<String> = self
            .transactions
            .iter()
            .filter(|entry| entry.value().pool_id() == pool_id)
            .map(|entry| entry.key().clone())
            .collect();

        let mut aborted = 0;
        for id in ids {
            if let Some((_, entry)) = self.transactions.remove(&id) {
                debug!(transaction_id = %id, pool_id = %pool_id, "Aborting transaction of removed pool");
                Self::abandon(&entry).await;
                aborted += 1;
            }
        }
        aborted
    }

    /// Roll back everything and stop the sweeper.
    pub async fn close_all(&self) {
        if let Some(handle) = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
        let ids: Vec<String> = self.transactions.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, entry)) = self.transactions.remove(&id) {
                Self::abandon(&entry).await;
            }
        }
    }

    /// List all active transactions with their metadata.
    pub fn list_all(&self) -> Vec<TransactionMetadata> {
        let now = Instant::now();
        let mut list: Vec<_> = self
            .transactions
            .iter()
            .map(|entry| TransactionMetadata {
                transaction_id: entry.key().clone(),
                pool_id: entry.pool_id().to_string(),
                started_at: entry.started_at,
                elapsed: now.saturating_duration_since(entry.started),
                timeout: entry.timeout,
            })
            .collect();
        list.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        list
    }

    /// Get the number of active transactions.
    pub fn count(&self) -> usize {
        self.transactions.len()
    }

    /// Look up a live transaction bound to `pool_id`, ending it if expired.
    async fn entry(&self, transaction_id: &str, pool_id: &str) -> DbResult<Arc<ActiveTransaction>> {
        let entry = self
            .transactions
            .get(transaction_id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| DbError::transaction_context("Transaction not found", transaction_id))?;

        if entry.pool_id() != pool_id {
            return Err(DbError::transaction_context(
                format!("Transaction belongs to pool '{}'", entry.pool_id()),
                transaction_id,
            ));
        }
        if !entry.pool_accepts_work() {
            if self.transactions.remove(transaction_id).is_some() {
                warn!(
                    transaction_id = %transaction_id,
                    pool_id = %pool_id,
                    "Pool is closing, rolling back transaction"
                );
                Self::abandon(&entry).await;
            }
            return Err(DbError::pool_closed(pool_id));
        }
        if entry.is_expired(Instant::now()) {
            if self.transactions.remove(transaction_id).is_some() {
                Self::abandon(&entry).await;
            }
            return Err(DbError::transaction_context(
                "Transaction has expired and was rolled back",
                transaction_id,
            ));
        }
        Ok(entry)
    }

    fn session<'g>(
        guard: &'g mut MutexGuard<'_, Option<PooledConnection>>,
        transaction_id: &str,
    ) -> DbResult<&'g mut PooledConnection> {
        guard.as_mut().ok_or_else(|| {
            DbError::transaction_context("Transaction is no longer active", transaction_id)
        })
    }

    /// A failure that leaves the session in an unknown state ends the
    /// transaction: the session is discarded, which rolls it back.
    fn check_poisoned<T>(
        &self,
        transaction_id: &str,
        guard: &mut MutexGuard<'_, Option<PooledConnection>>,
        result: &DbResult<T>,
    ) {
        if let Err(e) = result {
            if e.poisons_connection() {
                warn!(transaction_id = %transaction_id, error = %e, "Transaction session broke, aborting");
                if let Some(conn) = guard.take() {
                    conn.discard();
                }
                self.transactions.remove(transaction_id);
            }
        }
    }

    /// Remove a transaction and hand over its session for the final
    /// statement. A transaction whose pool is closing is rolled back instead.
    async fn take(&self, transaction_id: &str) -> DbResult<PooledConnection> {
        let (_, entry) = self
            .transactions
            .remove(transaction_id)
            .ok_or_else(|| DbError::transaction_context("Transaction not found", transaction_id))?;
        if !entry.pool_accepts_work() {
            warn!(
                transaction_id = %transaction_id,
                pool_id = %entry.pool_id(),
                "Pool is closing, rolling back transaction"
            );
            Self::abandon(&entry).await;
            return Err(DbError::pool_closed(entry.pool_id()));
        }
        let conn = entry.conn.lock().await.take();
        conn.ok_or_else(|| {
            DbError::transaction_context("Transaction is no longer active", transaction_id)
        })
    }

    /// Best-effort rollback of an entry already removed from the map.
    async fn abandon(entry: &ActiveTransaction) {
        let Some(mut conn) = entry.conn.lock().await.take() else {
            return;
        };
        let limit = conn.pool().config().timeouts.query_timeout;
        let signal = conn.shutdown_signal();
        match bounded(&signal, limit, "rollback", conn.rollback()).await {
            Ok(()) => conn.release(),
            Err(_) => conn.discard(),
        }
    }
}

impl Drop for TransactionRegistry {
    fn drop(&mut self) {
        if let Some(handle) = self
            .sweeper
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

/// Generate a unique transaction ID.
fn generate_transaction_id() -> String {
    format!("tx_{}", uuid::Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::db::drivers::SqliteDriver;
    use crate::models::{ConnectionParams, DatabaseType, PoolConfig, Value};

    async fn pool() -> Arc<Pool> {
        let config =
            PoolConfig::new("txp", DatabaseType::SQLite, ConnectionParams::sqlite(":memory:"))
                .with_sizing(1, 1)
                .with_acquire_timeout(Duration::from_millis(100));
        let pool = Pool::open(config, Arc::new(SqliteDriver), RetryPolicy::no_retry())
            .await
            .unwrap();
        let mut conn = pool.checkout(Duration::from_secs(1)).await.unwrap();
        conn.execute("CREATE TABLE t (id INTEGER PRIMARY KEY)", &[])
            .await
            .unwrap();
        conn.release();
        pool
    }

    fn registry() -> TransactionRegistry {
        TransactionRegistry::new(Duration::from_secs(60), Duration::from_secs(300))
    }

    async fn count(registry: &TransactionRegistry, tx: &str) -> i64 {
        let table = registry
            .query(tx, "txp", "SELECT COUNT(*) AS n FROM t", &[], None)
            .await
            .unwrap();
        table.get(0, "n").and_then(Value::as_i64).unwrap()
    }

    #[test]
    fn test_transaction_id_format() {
        let id = generate_transaction_id();
        assert!(id.starts_with("tx_"));
        assert_eq!(id.len(), 3 + 32); // "tx_" + 32 hex chars
    }

    #[test]
    fn test_default_timeout_capped_by_maximum() {
        let registry = TransactionRegistry::new(Duration::from_secs(600), Duration::from_secs(300));
        assert_eq!(registry.default_timeout, Duration::from_secs(300));
    }

    #[tokio::test]
    async fn test_transaction_not_found() {
        let registry = registry();
        let err = registry.commit("tx_nonexistent").await.unwrap_err();
        assert!(matches!(err, DbError::TransactionContext { .. }));
    }

    #[tokio::test]
    async fn test_rollback_discards_writes() {
        let pool = pool().await;
        let registry = registry();
        let tx = registry.begin(&pool, None).await.unwrap();
        assert_eq!(pool.status().checked_out, 1);

        registry
            .execute(&tx, "txp", "INSERT INTO t (id) VALUES (1)", &[], None)
            .await
            .unwrap();
        assert_eq!(count(&registry, &tx).await, 1);
        registry.rollback(&tx).await.unwrap();
        assert_eq!(pool.status().checked_out, 0);

        let tx = registry.begin(&pool, None).await.unwrap();
        assert_eq!(count(&registry, &tx).await, 0);
        registry.commit(&tx).await.unwrap();
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn test_query_error_keeps_transaction_open() {
        let pool = pool().await;
        let registry = registry();
        let tx = registry.begin(&pool, None).await.unwrap();
        registry
            .execute(&tx, "txp", "INSERT INTO t (id) VALUES (1)", &[], None)
            .await
            .unwrap();
        let err = registry
            .execute(&tx, "txp", "INSERT INTO t (id) VALUES (1)", &[], None)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Query { .. }));
        registry.commit(&tx).await.unwrap();
        assert_eq!(pool.status().broken_total, 0);
    }

    #[tokio::test]
    async fn test_wrong_pool_is_rejected() {
        let pool = pool().await;
        let registry = registry();
        let tx = registry.begin(&pool, None).await.unwrap();
        let err = registry
            .execute(&tx, "other", "SELECT 1", &[], None)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::TransactionContext { .. }));
        registry.rollback(&tx).await.unwrap();
    }

    #[tokio::test]
    async fn test_sweeper_rolls_back_expired() {
        let pool = pool().await;
        let registry = TransactionRegistry::new(Duration::from_millis(20), Duration::from_secs(1));
        let tx = registry.begin(&pool, None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert_eq!(registry.sweep_expired().await, 1);
        assert_eq!(registry.count(), 0);
        assert_eq!(pool.status().checked_out, 0);
        assert!(registry.rollback(&tx).await.is_err());
    }

    #[tokio::test]
    async fn test_draining_pool_refuses_statements_and_commit() {
        let pool = pool().await;
        let registry = registry();
        let tx = registry.begin(&pool, None).await.unwrap();
        registry
            .execute(&tx, "txp", "INSERT INTO t (id) VALUES (1)", &[], None)
            .await
            .unwrap();

        assert!(pool.begin_drain());
        let err = registry
            .execute(&tx, "txp", "INSERT INTO t (id) VALUES (2)", &[], None)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::PoolClosed { .. }));
        assert_eq!(registry.count(), 0);
        assert_eq!(pool.status().checked_out, 0);

        let err = registry.commit(&tx).await.unwrap_err();
        assert!(matches!(err, DbError::TransactionContext { .. }));
    }

    #[tokio::test]
    async fn test_commit_on_draining_pool_rolls_back() {
        let pool = pool().await;
        let registry = registry();
        let tx = registry.begin(&pool, None).await.unwrap();
        assert!(pool.begin_drain());

        let err = registry.commit(&tx).await.unwrap_err();
        assert!(matches!(err, DbError::PoolClosed { .. }));
        assert_eq!(registry.count(), 0);
        assert_eq!(pool.status().checked_out, 0);
    }

    #[tokio::test]
    async fn test_list_all_reports_pool() {
        let pool = pool().await;
        let registry = registry();
        let tx = registry.begin(&pool, Some(Duration::from_secs(900))).await.unwrap();
        let list = registry.list_all();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].transaction_id, tx);
        assert_eq!(list[0].pool_id, "txp");
        assert_eq!(list[0].timeout, Duration::from_secs(300));
        assert_eq!(registry.abort_pool("txp").await, 1);
    }
}
