//! Metrics collector: per-pool counters, latency histograms and gauges.
//!
//! Every update is a relaxed atomic operation, so recording never blocks and
//! taking a snapshot never blocks recorders. Gauges are read from the live
//! pool when the snapshot is taken.

use crate::models::PoolStatus;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Upper bounds of the latency buckets, in microseconds. A final bucket
/// catches everything above the last bound.
pub const LATENCY_BOUNDS_US: [u64; 11] = [
    100, 250, 500, 1_000, 2_500, 5_000, 10_000, 50_000, 250_000, 1_000_000, 10_000_000,
];

const BUCKETS: usize = LATENCY_BOUNDS_US.len() + 1;

/// Lock-free fixed-bucket latency histogram.
#[derive(Debug)]
pub struct LatencyHistogram {
    buckets: [AtomicU64; BUCKETS],
    sum_us: AtomicU64,
    max_us: AtomicU64,
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            sum_us: AtomicU64::new(0),
            max_us: AtomicU64::new(0),
        }
    }
}

impl LatencyHistogram {
    pub fn record(&self, latency: Duration) {
        let us = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        let idx = LATENCY_BOUNDS_US
            .iter()
            .position(|bound| us <= *bound)
            .unwrap_or(BUCKETS - 1);
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.sum_us.fetch_add(us, Ordering::Relaxed);
        self.max_us.fetch_max(us, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> HistogramSnapshot {
        let counts: Vec<u64> = self
            .buckets
            .iter()
            .map(|b| b.load(Ordering::Relaxed))
            .collect();
        HistogramSnapshot {
            bounds_us: LATENCY_BOUNDS_US.to_vec(),
            count: counts.iter().sum(),
            counts,
            sum_us: self.sum_us.load(Ordering::Relaxed),
            max_us: self.max_us.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistogramSnapshot {
    pub bounds_us: Vec<u64>,
    /// One entry per bound plus the overflow bucket.
    pub counts: Vec<u64>,
    pub count: u64,
    pub sum_us: u64,
    pub max_us: u64,
}

impl HistogramSnapshot {
    pub fn mean(&self) -> Option<Duration> {
        (self.count > 0).then(|| Duration::from_micros(self.sum_us / self.count))
    }

    /// Upper bound of the bucket holding the `q` quantile (0.0..=1.0).
    /// The overflow bucket reports the observed maximum.
    pub fn percentile(&self, q: f64) -> Option<Duration> {
        if self.count == 0 {
            return None;
        }
        let rank = ((q.clamp(0.0, 1.0) * self.count as f64).ceil() as u64).max(1);
        let mut seen = 0;
        for (idx, count) in self.counts.iter().enumerate() {
            seen += count;
            if seen >= rank {
                let bound = self.bounds_us.get(idx).copied().unwrap_or(self.max_us);
                return Some(Duration::from_micros(bound.min(self.max_us)));
            }
        }
        Some(Duration::from_micros(self.max_us))
    }
}

/// Counters and histograms of one pool.
#[derive(Debug)]
pub struct PoolMetrics {
    issued: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    acquire_latency: LatencyHistogram,
    query_latency: LatencyHistogram,
    started_at: Instant,
}

impl Default for PoolMetrics {
    fn default() -> Self {
        Self {
            issued: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            acquire_latency: LatencyHistogram::default(),
            query_latency: LatencyHistogram::default(),
            started_at: Instant::now(),
        }
    }
}

impl PoolMetrics {
    /// Count an operation as issued. Call before checkout.
    pub fn issued(&self) {
        self.issued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_acquire(&self, latency: Duration) {
        self.acquire_latency.record(latency);
    }

    /// Count the outcome of an issued operation. Latency is only recorded for
    /// operations that reached the backend.
    pub fn record_outcome(&self, latency: Option<Duration>, ok: bool) {
        if let Some(latency) = latency {
            self.query_latency.record(latency);
        }
        if ok {
            self.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Point-in-time copy combined with the pool's live gauges.
    pub fn snapshot(&self, status: &PoolStatus) -> MetricsSnapshot {
        // Outcomes are loaded before `issued` so issued >= succeeded + failed
        let succeeded = self.succeeded.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let issued = self.issued.load(Ordering::Relaxed);
        let query_latency = self.query_latency.snapshot();
        let acquire_latency = self.acquire_latency.snapshot();

        let completed = succeeded + failed;
        let error_rate = if completed > 0 {
            failed as f64 / completed as f64
        } else {
            0.0
        };
        let elapsed = self.started_at.elapsed().as_secs_f64();
        let queries_per_second = if elapsed > 0.0 {
            completed as f64 / elapsed
        } else {
            0.0
        };

        MetricsSnapshot {
            pool_id: status.pool_id.clone(),
            taken_at: Utc::now(),
            queries_issued: issued,
            queries_succeeded: succeeded,
            queries_failed: failed,
            error_rate,
            mean_query_latency: query_latency.mean(),
            p50_query_latency: query_latency.percentile(0.50),
            p99_query_latency: query_latency.percentile(0.99),
            queries_per_second,
            acquire_latency,
            query_latency,
            active_connections: status.checked_out,
            idle_connections: status.idle_connections,
            total_connections: status.total_connections,
            waiting: status.waiting,
            utilization: status.utilization(),
        }
    }
}

/// Read-only copy of a pool's metrics.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub pool_id: String,
    pub taken_at: DateTime<Utc>,
    pub queries_issued: u64,
    pub queries_succeeded: u64,
    pub queries_failed: u64,
    pub error_rate: f64,
    pub mean_query_latency: Option<Duration>,
    pub p50_query_latency: Option<Duration>,
    pub p99_query_latency: Option<Duration>,
    pub queries_per_second: f64,
    pub acquire_latency: HistogramSnapshot,
    pub query_latency: HistogramSnapshot,
    pub active_connections: u32,
    pub idle_connections: u32,
    pub total_connections: u32,
    pub waiting: u32,
    /// Checked-out sessions over `max_connections`.
    pub utilization: f64,
}

/// Metrics of all registered pools.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    pools: DashMap<String, Arc<PoolMetrics>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pool, returning its (possibly existing) metrics.
    pub fn register(&self, pool_id: &str) -> Arc<PoolMetrics> {
        let metrics = self
            .pools
            .entry(pool_id.to_string())
            .or_insert_with(|| Arc::new(PoolMetrics::default()));
        debug!(%pool_id, "registered for metrics collection");
        Arc::clone(metrics.value())
    }

    pub fn unregister(&self, pool_id: &str) {
        if self.pools.remove(pool_id).is_some() {
            debug!(%pool_id, "unregistered from metrics collection");
        }
    }

    pub fn get(&self, pool_id: &str) -> Option<Arc<PoolMetrics>> {
        self.pools.get(pool_id).map(|m| Arc::clone(m.value()))
    }
}
