//! Query execution engine.
//!
//! Every operation checks a session out of its pool with the pool's
//! `acquire_timeout`, bounds the backend call with the query timeout and hands
//! the session back on every exit path:
//!
//! - success and clean server-side rejections return it to the idle set;
//! - timeouts, I/O failures and decode failures discard it;
//! - cancellation (the future being dropped) discards it through the
//!   [`PooledConnection`] guard;
//! - a pool shutdown signal interrupts the call and discards it.
//!
//! Streaming keeps the session checked out in a producer task that only reads
//! the next chunk when the consumer asks for it.

use crate::db::driver::Driver;
use crate::db::pool::{Pool, PooledConnection};
use crate::db::types::RawRow;
use crate::error::{DbError, DbResult};
use crate::metrics::PoolMetrics;
use crate::models::{ExecuteResult, QueryParam, Statement, TableResult, TransactionResult};
use futures_util::stream::{BoxStream, Stream};
use futures_util::StreamExt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Runs statements against one pool and records their metrics.
#[derive(Debug, Clone)]
pub struct QueryExecutor {
    pool: Arc<Pool>,
    metrics: Arc<PoolMetrics>,
}

impl QueryExecutor {
    pub fn new(pool: Arc<Pool>, metrics: Arc<PoolMetrics>) -> Self {
        Self { pool, metrics }
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    /// Run a row-returning statement.
    pub async fn query(
        &self,
        sql: &str,
        params: &[QueryParam],
        timeout: Option<Duration>,
    ) -> DbResult<TableResult> {
        debug!(pool_id = %self.pool.id(), sql = %sql, params = params.len(), "Executing query");
        self.metrics.issued();
        let mut conn = self.acquire().await?;

        let limit = self.query_timeout(timeout);
        let start = Instant::now();
        let signal = self.pool.shutdown_signal();
        let result = bounded(&signal, limit, "query", conn.query(sql, params)).await;
        self.settle(conn, &result, start);

        let rows = result?;
        Ok(self.pool.driver().to_table(rows, start.elapsed()))
    }

    /// Run a write statement and report the affected-row count.
    pub async fn execute(
        &self,
        sql: &str,
        params: &[QueryParam],
        timeout: Option<Duration>,
    ) -> DbResult<ExecuteResult> {
        debug!(pool_id = %self.pool.id(), sql = %sql, params = params.len(), "Executing statement");
        self.metrics.issued();
        let mut conn = self.acquire().await?;

        let limit = self.query_timeout(timeout);
        let start = Instant::now();
        let signal = self.pool.shutdown_signal();
        let result = bounded(&signal, limit, "execute", conn.execute(sql, params)).await;
        self.settle(conn, &result, start);

        Ok(ExecuteResult::new(result?, start.elapsed()))
    }

    /// Run all statements on one session, all or nothing.
    ///
    /// The timeout bounds the whole transaction. When it elapses the session
    /// is discarded, which makes the backend roll back.
    pub async fn execute_transaction(
        &self,
        statements: &[Statement],
        timeout: Option<Duration>,
    ) -> DbResult<TransactionResult> {
        if statements.is_empty() {
            return Ok(TransactionResult::new(Vec::new(), Duration::ZERO));
        }
        debug!(pool_id = %self.pool.id(), statements = statements.len(), "Executing transaction");
        self.metrics.issued();
        let mut conn = self.acquire().await?;

        let limit = self.query_timeout(timeout);
        let start = Instant::now();
        let signal = self.pool.shutdown_signal();
        let result = bounded(&signal, limit, "transaction", conn.transact(statements)).await;
        self.settle(conn, &result, start);

        if let Err(DbError::Transaction { failed_index, .. }) = &result {
            warn!(pool_id = %self.pool.id(), failed_index, "Transaction rolled back");
        }
        Ok(TransactionResult::new(result?, start.elapsed()))
    }

    /// Run independent statements in order and report each outcome.
    ///
    /// A failing statement does not stop the batch. The session is reused
    /// across statements until a failure leaves it in an unknown state, in
    /// which case the next statement checks out a fresh one.
    pub async fn execute_batch(
        &self,
        statements: &[Statement],
        timeout: Option<Duration>,
    ) -> Vec<DbResult<ExecuteResult>> {
        let limit = self.query_timeout(timeout);
        let signal = self.pool.shutdown_signal();
        let mut outcomes = Vec::with_capacity(statements.len());
        let mut held: Option<PooledConnection> = None;

        for (index, statement) in statements.iter().enumerate() {
            self.metrics.issued();
            let mut conn = match held.take() {
                Some(conn) => conn,
                None => match self.acquire().await {
                    Ok(conn) => conn,
                    Err(e) => {
                        outcomes.push(Err(e));
                        continue;
                    }
                },
            };

            let start = Instant::now();
            let result = bounded(
                &signal,
                limit,
                "batch statement",
                conn.execute(&statement.sql, &statement.params),
            )
            .await;
            self.metrics
                .record_outcome(Some(start.elapsed()), result.is_ok());

            match &result {
                Err(e) if e.poisons_connection() => {
                    debug!(pool_id = %self.pool.id(), index, error = %e, "Batch statement broke its session");
                    conn.discard();
                }
                Err(e) => {
                    debug!(pool_id = %self.pool.id(), index, error = %e, "Batch statement failed");
                    held = Some(conn);
                }
                Ok(_) => held = Some(conn),
            }
            outcomes.push(result.map(|rows| ExecuteResult::new(rows, start.elapsed())));
        }

        if let Some(conn) = held {
            conn.release();
        }
        outcomes
    }

    /// Start a lazily evaluated query.
    ///
    /// The session is checked out before this returns, so pool exhaustion is
    /// reported here. Rows are fetched `chunk_size` at a time and only when
    /// the consumer asks for the next chunk.
    pub async fn query_stream(
        &self,
        sql: &str,
        params: &[QueryParam],
        chunk_size: usize,
        timeout: Option<Duration>,
    ) -> DbResult<RowStream> {
        if chunk_size == 0 {
            return Err(DbError::invalid_input("chunk_size must be at least 1"));
        }
        debug!(pool_id = %self.pool.id(), sql = %sql, chunk_size, "Starting query stream");
        self.metrics.issued();
        let conn = self.acquire().await?;

        let (requests, receiver) = mpsc::channel(1);
        let producer = StreamProducer {
            conn,
            sql: sql.to_string(),
            params: params.to_vec(),
            chunk_size,
            limit: self.query_timeout(timeout),
            metrics: Arc::clone(&self.metrics),
        };
        tokio::spawn(producer.run(receiver));

        Ok(RowStream {
            pool_id: self.pool.id().to_string(),
            requests,
            finished: false,
        })
    }

    /// Check out a session, counting a failed checkout as a failed operation.
    async fn acquire(&self) -> DbResult<PooledConnection> {
        let start = Instant::now();
        match self
            .pool
            .checkout(self.pool.config().sizing.acquire_timeout)
            .await
        {
            Ok(conn) => {
                self.metrics.record_acquire(start.elapsed());
                Ok(conn)
            }
            Err(e) => {
                self.metrics.record_outcome(None, false);
                Err(e)
            }
        }
    }

    fn settle<T>(&self, conn: PooledConnection, result: &DbResult<T>, started: Instant) {
        self.metrics
            .record_outcome(Some(started.elapsed()), result.is_ok());
        if let Err(e) = result {
            debug!(pool_id = %self.pool.id(), connection_id = conn.id(), error = %e, "Operation failed");
        }
        conn.finish(result);
    }

    fn query_timeout(&self, requested: Option<Duration>) -> Duration {
        requested.unwrap_or(self.pool.config().timeouts.query_timeout)
    }
}

/// Bound a backend call. An elapsed timer becomes a `Timeout` error and a
/// fired shutdown signal a `Connection` error; both mark the session as
/// broken.
pub(crate) async fn bounded<T>(
    signal: &CancellationToken,
    limit: Duration,
    operation: &str,
    fut: impl Future<Output = DbResult<T>>,
) -> DbResult<T> {
    tokio::select! {
        biased;
        _ = signal.cancelled() => Err(interrupted(operation)),
        result = tokio::time::timeout(limit, fut) => match result {
            Ok(result) => result,
            Err(_) => Err(DbError::timeout(operation, limit)),
        },
    }
}

fn interrupted(operation: &str) -> DbError {
    DbError::connection(
        format!("{operation} interrupted: the pool is shutting down"),
        "The pool was removed while the operation ran; retry against another pool",
    )
}

// =============================================================================
// Streaming
// =============================================================================

type ChunkReply = oneshot::Sender<DbResult<Option<TableResult>>>;

/// Pull-driven handle on a running query.
///
/// Finite and not restartable: once it yields `None` or an error, every later
/// call yields `None`. Dropping it before the end discards the session, since
/// the backend may still be sending rows.
#[derive(Debug)]
pub struct RowStream {
    pool_id: String,
    requests: mpsc::Sender<ChunkReply>,
    finished: bool,
}

impl RowStream {
    pub fn pool_id(&self) -> &str {
        &self.pool_id
    }

    /// Fetch the next chunk, or `None` once the result set is exhausted.
    pub async fn next_chunk(&mut self) -> DbResult<Option<TableResult>> {
        if self.finished {
            return Ok(None);
        }
        let (reply, response) = oneshot::channel();
        if self.requests.send(reply).await.is_err() {
            self.finished = true;
            return Ok(None);
        }
        match response.await {
            Ok(Ok(Some(chunk))) => Ok(Some(chunk)),
            Ok(Ok(None)) => {
                self.finished = true;
                Ok(None)
            }
            Ok(Err(e)) => {
                self.finished = true;
                Err(e)
            }
            Err(_) => {
                self.finished = true;
                Err(DbError::internal("stream producer stopped unexpectedly"))
            }
        }
    }

    /// Adapt into a `Stream` of chunks that ends after the first error.
    pub fn into_stream(self) -> impl Stream<Item = DbResult<TableResult>> + Send {
        futures_util::stream::unfold(self, |mut stream| async move {
            match stream.next_chunk().await {
                Ok(Some(chunk)) => Some((Ok(chunk), stream)),
                Ok(None) => None,
                Err(e) => Some((Err(e), stream)),
            }
        })
    }
}

enum StreamEnd {
    Exhausted,
    Abandoned,
    Failed { poisoned: bool },
    /// The pool shut down between chunks.
    Interrupted,
}

struct StreamProducer {
    conn: PooledConnection,
    sql: String,
    params: Vec<QueryParam>,
    chunk_size: usize,
    limit: Duration,
    metrics: Arc<PoolMetrics>,
}

impl StreamProducer {
    async fn run(mut self, mut requests: mpsc::Receiver<ChunkReply>) {
        let started = Instant::now();
        let driver: Arc<dyn Driver> = Arc::clone(self.conn.pool().driver());
        let signal = self.conn.shutdown_signal();

        let end = {
            let mut rows = self.conn.fetch_stream(&self.sql, &self.params);
            let mut exhausted = false;
            loop {
                let next = tokio::select! {
                    biased;
                    _ = signal.cancelled() => break StreamEnd::Interrupted,
                    next = requests.recv() => next,
                };
                let Some(reply) = next else {
                    break if exhausted {
                        StreamEnd::Exhausted
                    } else {
                        StreamEnd::Abandoned
                    };
                };
                if exhausted {
                    let _ = reply.send(Ok(None));
                    break StreamEnd::Exhausted;
                }

                let chunk_start = Instant::now();
                let chunk = fill(&mut rows, self.chunk_size);
                match bounded(&signal, self.limit, "stream chunk", chunk).await {
                    Ok((batch, done)) => {
                        exhausted = done;
                        if batch.is_empty() {
                            let _ = reply.send(Ok(None));
                            break StreamEnd::Exhausted;
                        }
                        let table = driver.to_table(batch, chunk_start.elapsed());
                        let _ = reply.send(Ok(Some(table)));
                    }
                    Err(e) => {
                        let poisoned = e.poisons_connection();
                        let _ = reply.send(Err(e));
                        break StreamEnd::Failed { poisoned };
                    }
                }
            }
        };

        let pool_id = self.conn.pool().id().to_string();
        match end {
            StreamEnd::Exhausted => {
                self.metrics.record_outcome(Some(started.elapsed()), true);
                self.conn.release();
            }
            StreamEnd::Abandoned => {
                debug!(pool_id = %pool_id, "Stream dropped before exhaustion, discarding session");
                self.metrics.record_outcome(Some(started.elapsed()), true);
                self.conn.discard();
            }
            StreamEnd::Failed { poisoned } => {
                self.metrics.record_outcome(Some(started.elapsed()), false);
                if poisoned {
                    self.conn.discard();
                } else {
                    self.conn.release();
                }
            }
            StreamEnd::Interrupted => {
                debug!(pool_id = %pool_id, "Pool shutting down, discarding stream session");
                self.metrics.record_outcome(Some(started.elapsed()), false);
                self.conn.discard();
                // The consumer learns on its next request
                if let Some(reply) = requests.recv().await {
                    let _ = reply.send(Err(DbError::pool_closed(pool_id)));
                }
            }
        }
    }
}

/// Read up to `size` rows. The flag is set once the source is exhausted.
async fn fill(
    rows: &mut BoxStream<'_, DbResult<RawRow>>,
    size: usize,
) -> DbResult<(Vec<RawRow>, bool)> {
    let mut batch = Vec::with_capacity(size);
    while batch.len() < size {
        match rows.next().await {
            Some(row) => batch.push(row?),
            None => return Ok((batch, true)),
        }
    }
    Ok((batch, false))
}
