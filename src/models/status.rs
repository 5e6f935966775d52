//! Pool state, health and status snapshots.

use crate::models::DatabaseType;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

/// Lifecycle state of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolState {
    Active,
    Degraded,
    Draining,
    Closed,
}

impl PoolState {
    /// Whether new checkouts are accepted.
    pub fn accepts_checkouts(&self) -> bool {
        matches!(self, Self::Active | Self::Degraded)
    }
}

impl std::fmt::Display for PoolState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Degraded => "degraded",
            Self::Draining => "draining",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Latest health picture of a pool, as maintained by the health monitor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub last_check: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_latency: Option<Duration>,
    pub last_error: Option<String>,
}

impl HealthStatus {
    /// A freshly created pool proved `min` connections and starts healthy.
    pub fn healthy() -> Self {
        Self {
            healthy: true,
            last_check: None,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_latency: None,
            last_error: None,
        }
    }
}

impl Default for HealthStatus {
    fn default() -> Self {
        Self::healthy()
    }
}

/// Live counts and state of one pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub pool_id: String,
    pub db_type: DatabaseType,
    pub state: PoolState,
    pub health: HealthStatus,
    pub total_connections: u32,
    pub idle_connections: u32,
    pub checked_out: u32,
    pub waiting: u32,
    pub min_connections: u32,
    pub max_connections: u32,
    /// Connections discarded as Broken since the pool was created.
    pub broken_total: u64,
    pub uptime: Duration,
}

impl PoolStatus {
    /// Fraction of the pool's capacity currently checked out.
    pub fn utilization(&self) -> f64 {
        if self.max_connections == 0 {
            return 0.0;
        }
        self.checked_out as f64 / self.max_connections as f64
    }
}
