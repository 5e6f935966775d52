//! Pool manager: the public entry point.
//!
//! Owns the pool registry, metrics, health monitor, failover controller and
//! interactive transactions, and routes every request through the failover
//! policy before it reaches a pool.
//!
//! # Design Decisions
//!
//! - **Routing before checkout**: the failover controller keeps its own
//!   health view, so choosing a pool never takes a pool lock.
//! - **Transactions are pinned**: statements inside an interactive
//!   transaction always run on the session it holds, regardless of policy.
//! - **Feeds are optional**: standalone mode uses only the local monitor.
//!   Attaching discovery or remote health there is a configuration error.

use crate::config::{DeploymentMode, ManagerOptions};
use crate::db::driver::DriverRegistry;
use crate::db::executor::{QueryExecutor, RowStream};
use crate::db::registry::PoolRegistry;
use crate::db::transaction_registry::{TransactionMetadata, TransactionRegistry};
use crate::error::{DbError, DbResult};
use crate::failover::{DiscoveryFeed, FailoverController, FailoverPolicy};
use crate::health::{HealthEvent, HealthFeed, HealthMonitor};
use crate::metrics::{MetricsCollector, MetricsSnapshot, PoolMetrics};
use crate::models::{
    ExecuteResult, PoolConfig, PoolInfo, PoolStatus, QueryParam, QueryRequest, Statement,
    TableResult, TransactionResult,
};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How often expired interactive transactions are swept.
const TRANSACTION_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

pub struct PoolManager {
    options: ManagerOptions,
    registry: Arc<PoolRegistry>,
    metrics: MetricsCollector,
    health: Arc<HealthMonitor>,
    failover: Arc<FailoverController>,
    transactions: Arc<TransactionRegistry>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for PoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolManager")
            .field("mode", &self.options.deployment_mode)
            .field("registry", &self.registry)
            .field("transactions", &self.transactions)
            .finish_non_exhaustive()
    }
}

impl PoolManager {
    /// Create a manager with the built-in drivers.
    ///
    /// Must be called inside a Tokio runtime: background tasks start here.
    pub fn new(options: ManagerOptions) -> DbResult<Self> {
        Self::with_drivers(options, DriverRegistry::builtin())
    }

    /// Create a manager with a custom set of drivers.
    pub fn with_drivers(options: ManagerOptions, drivers: DriverRegistry) -> DbResult<Self> {
        options.validate()?;

        let registry = Arc::new(PoolRegistry::new(drivers, options.retry.clone()));
        let health = Arc::new(HealthMonitor::new(options.health.clone()));
        let failover = Arc::new(FailoverController::default());
        let transactions = Arc::new(TransactionRegistry::new(
            options.transaction_timeout,
            options.max_transaction_timeout,
        ));
        transactions.start_sweeper(TRANSACTION_SWEEP_INTERVAL);

        let manager = Self {
            options,
            registry,
            metrics: MetricsCollector::new(),
            health,
            failover,
            transactions,
            tasks: Mutex::new(Vec::new()),
        };
        let local = manager.health.subscribe();
        manager.spawn(forward_health(local, Arc::clone(&manager.failover)));

        info!(mode = %manager.options.deployment_mode, "Pool manager started");
        Ok(manager)
    }

    pub fn options(&self) -> &ManagerOptions {
        &self.options
    }

    fn spawn(&self, task: impl std::future::Future<Output = ()> + Send + 'static) {
        let handle = tokio::spawn(task);
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
    }

    // =========================================================================
    // Pool lifecycle
    // =========================================================================

    /// Validate, connect `min_connections` sessions and register the pool.
    pub async fn create_pool(&self, config: PoolConfig) -> DbResult<PoolInfo> {
        let pool = self.registry.create(config).await?;
        self.metrics.register(pool.id());
        self.health.start_monitor(&pool);

        let status = pool.status();
        Ok(PoolInfo {
            pool_id: pool.id().to_string(),
            db_type: pool.config().db_type,
            target: pool.config().connection.masked(pool.config().db_type),
            connections: status.total_connections,
        })
    }

    /// Drain and unregister a pool.
    ///
    /// Work already running gets the configured drain grace to finish and is
    /// interrupted after it; work submitted after removal began is rejected.
    /// Interactive transactions on the pool are rolled back as removal starts.
    pub async fn remove_pool(&self, pool_id: &str) -> DbResult<()> {
        let pool = self.registry.begin_remove(pool_id)?;
        self.health.stop_monitor(pool_id);

        // Open transactions hold sessions the drain would otherwise wait on
        let (aborted, ()) = tokio::join!(
            self.transactions.abort_pool(pool_id),
            self.registry.finish_remove(&pool, self.options.drain_grace),
        );
        if aborted > 0 {
            warn!(%pool_id, aborted, "Rolled back transactions of removed pool");
        }
        self.metrics.unregister(pool_id);
        self.failover.forget(pool_id);
        info!(%pool_id, "Pool removed");
        Ok(())
    }

    /// Registered pool ids, sorted.
    pub fn list_pools(&self) -> Vec<String> {
        self.registry.ids()
    }

    pub fn get_status(&self, pool_id: &str) -> DbResult<PoolStatus> {
        Ok(self.registry.get(pool_id)?.status())
    }

    pub fn get_metrics(&self, pool_id: &str) -> DbResult<MetricsSnapshot> {
        let pool = self.registry.get(pool_id)?;
        Ok(self.metrics_for(pool_id).snapshot(&pool.status()))
    }

    /// Probe a pool now. Never fails: unknown pools are reported unhealthy.
    pub async fn health_check(&self, pool_id: &str) -> bool {
        match self.registry.get(pool_id) {
            Ok(pool) => self.health.check_now(&pool).await,
            Err(_) => false,
        }
    }

    // =========================================================================
    // Statements
    // =========================================================================

    pub async fn query(
        &self,
        pool_id: &str,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<TableResult> {
        self.executor(pool_id)?.query(sql, params, None).await
    }

    /// Run a query with per-request options, including transaction binding.
    pub async fn query_request(&self, request: &QueryRequest) -> DbResult<TableResult> {
        let Some(transaction_id) = &request.transaction_id else {
            return self
                .executor(&request.pool_id)?
                .query(&request.sql, &request.params, request.timeout)
                .await;
        };

        let metrics = self.metrics.get(&request.pool_id);
        if let Some(metrics) = &metrics {
            metrics.issued();
        }
        let start = Instant::now();
        let result = self
            .transactions
            .query(
                transaction_id,
                &request.pool_id,
                &request.sql,
                &request.params,
                request.timeout,
            )
            .await;
        if let Some(metrics) = metrics {
            metrics.record_outcome(Some(start.elapsed()), result.is_ok());
        }
        result
    }

    pub async fn execute(
        &self,
        pool_id: &str,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<ExecuteResult> {
        self.executor(pool_id)?.execute(sql, params, None).await
    }

    /// Run a write with per-request options, including transaction binding.
    pub async fn execute_request(&self, request: &QueryRequest) -> DbResult<ExecuteResult> {
        let Some(transaction_id) = &request.transaction_id else {
            return self
                .executor(&request.pool_id)?
                .execute(&request.sql, &request.params, request.timeout)
                .await;
        };

        let metrics = self.metrics.get(&request.pool_id);
        if let Some(metrics) = &metrics {
            metrics.issued();
        }
        let start = Instant::now();
        let result = self
            .transactions
            .execute(
                transaction_id,
                &request.pool_id,
                &request.sql,
                &request.params,
                request.timeout,
            )
            .await;
        if let Some(metrics) = metrics {
            metrics.record_outcome(Some(start.elapsed()), result.is_ok());
        }
        Ok(ExecuteResult::new(result?, start.elapsed()))
    }

    /// Run statements atomically on one session.
    pub async fn execute_transaction(
        &self,
        pool_id: &str,
        statements: &[Statement],
    ) -> DbResult<TransactionResult> {
        self.executor(pool_id)?
            .execute_transaction(statements, None)
            .await
    }

    /// Run independent statements and report each outcome.
    ///
    /// Only an unknown pool fails the whole call.
    pub async fn execute_batch(
        &self,
        pool_id: &str,
        statements: &[Statement],
    ) -> DbResult<Vec<DbResult<ExecuteResult>>> {
        Ok(self
            .executor(pool_id)?
            .execute_batch(statements, None)
            .await)
    }

    /// Stream a query's rows in chunks of `chunk_size`.
    pub async fn query_stream(
        &self,
        pool_id: &str,
        sql: &str,
        params: &[QueryParam],
        chunk_size: usize,
    ) -> DbResult<RowStream> {
        self.executor(pool_id)?
            .query_stream(sql, params, chunk_size, None)
            .await
    }

    // =========================================================================
    // Interactive transactions
    // =========================================================================

    /// Open a transaction that holds one session of `pool_id` until it ends.
    pub async fn begin_transaction(
        &self,
        pool_id: &str,
        timeout: Option<Duration>,
    ) -> DbResult<String> {
        let pool = self.registry.get(pool_id)?;
        self.transactions.begin(&pool, timeout).await
    }

    pub async fn commit_transaction(&self, transaction_id: &str) -> DbResult<()> {
        self.transactions.commit(transaction_id).await
    }

    pub async fn rollback_transaction(&self, transaction_id: &str) -> DbResult<()> {
        self.transactions.rollback(transaction_id).await
    }

    pub fn list_transactions(&self) -> Vec<TransactionMetadata> {
        self.transactions.list_all()
    }

    // =========================================================================
    // Failover and feeds
    // =========================================================================

    pub fn set_failover_policy(&self, policy: FailoverPolicy) -> DbResult<()> {
        self.failover.set_policy(policy)
    }

    pub fn failover_policy(&self) -> FailoverPolicy {
        self.failover.policy()
    }

    /// The pool a request for `pool_id` would be served by right now.
    pub fn route(&self, pool_id: &str) -> String {
        self.failover.route(pool_id, self.registry.as_ref())
    }

    /// Local health transitions.
    pub fn subscribe_health(&self) -> broadcast::Receiver<HealthEvent> {
        self.health.subscribe()
    }

    /// Poll `feed` for pool ids that extend load-balanced membership.
    pub fn attach_discovery(&self, feed: Arc<dyn DiscoveryFeed>) -> DbResult<()> {
        if !self.options.deployment_mode.uses_discovery() {
            return Err(DbError::config(format!(
                "discovery feeds are not available in {} mode",
                self.options.deployment_mode
            )));
        }
        let failover = Arc::clone(&self.failover);
        let interval = self.options.discovery_interval;
        self.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match feed.pool_ids().await {
                    Ok(ids) => {
                        debug!(discovered = ids.len(), "Discovery feed polled");
                        failover.set_discovered(ids);
                    }
                    Err(e) => warn!(error = %e, "Discovery feed failed"),
                }
            }
        });
        info!("Discovery feed attached");
        Ok(())
    }

    /// Merge health events from an external source into failover decisions.
    pub fn attach_remote_health(&self, feed: Arc<dyn HealthFeed>) -> DbResult<()> {
        if self.options.deployment_mode != DeploymentMode::FullDistributed {
            return Err(DbError::config(format!(
                "remote health feeds are not available in {} mode",
                self.options.deployment_mode
            )));
        }
        let events = feed.subscribe();
        self.spawn(forward_health(events, Arc::clone(&self.failover)));
        info!("Remote health feed attached");
        Ok(())
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Stop background work, roll back open transactions and drain every
    /// pool.
    pub async fn shutdown(&self) {
        info!(pools = self.registry.len(), "Shutting down pool manager");
        self.health.stop_all();
        for handle in self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            handle.abort();
        }
        self.transactions.close_all().await;
        for id in self.registry.ids() {
            self.metrics.unregister(&id);
        }
        self.registry.close_all(self.options.drain_grace).await;
        info!("Pool manager stopped");
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    /// Executor for the pool that currently serves `pool_id`.
    fn executor(&self, pool_id: &str) -> DbResult<QueryExecutor> {
        let target = self.failover.route(pool_id, self.registry.as_ref());
        if target != pool_id {
            debug!(requested = %pool_id, routed = %target, "Request rerouted");
        }
        let pool = self.registry.get(&target)?;
        Ok(QueryExecutor::new(pool, self.metrics_for(&target)))
    }

    fn metrics_for(&self, pool_id: &str) -> Arc<PoolMetrics> {
        self.metrics
            .get(pool_id)
            .unwrap_or_else(|| self.metrics.register(pool_id))
    }
}

impl Drop for PoolManager {
    fn drop(&mut self) {
        for handle in self
            .tasks
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            handle.abort();
        }
    }
}

/// Feed health transitions into the failover controller until the source
/// closes.
async fn forward_health(
    mut events: broadcast::Receiver<HealthEvent>,
    failover: Arc<FailoverController>,
) {
    loop {
        match events.recv().await {
            Ok(event) => failover.observe(&event),
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Health events dropped, failover view may lag");
            }
            Err(RecvError::Closed) => return,
        }
    }
}
