//! Failover controller: decides which pool serves a request.
//!
//! The controller keeps its own view of pool health, fed by [`HealthEvent`]s,
//! so routing never takes a pool lock. Three policies are supported:
//!
//! - [`FailoverPolicy::LocalOnly`] always serves the requested pool.
//! - [`FailoverPolicy::ActiveStandby`] moves traffic for the primary to the
//!   backup once the primary has been unhealthy for `switch_threshold`
//!   without interruption, and moves it back once the primary has been
//!   healthy for `recovery_threshold` without interruption.
//! - [`FailoverPolicy::LoadBalanced`] spreads traffic over the healthy
//!   members of a set. Discovered pool ids extend the set.

use crate::db::registry::LoadSource;
use crate::error::{DbError, DbResult};
use crate::health::{HealthEvent, HealthFeed};
use async_trait::async_trait;
use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalanceAlgorithm {
    #[default]
    RoundRobin,
    LeastConnections,
    Random,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FailoverPolicy {
    #[default]
    LocalOnly,
    ActiveStandby {
        primary: String,
        backup: String,
        switch_threshold: Duration,
        recovery_threshold: Duration,
    },
    LoadBalanced {
        pools: Vec<String>,
        algorithm: LoadBalanceAlgorithm,
    },
}

impl FailoverPolicy {
    pub fn active_standby(
        primary: impl Into<String>,
        backup: impl Into<String>,
        switch_threshold: Duration,
        recovery_threshold: Duration,
    ) -> Self {
        Self::ActiveStandby {
            primary: primary.into(),
            backup: backup.into(),
            switch_threshold,
            recovery_threshold,
        }
    }

    pub fn load_balanced(pools: Vec<String>, algorithm: LoadBalanceAlgorithm) -> Self {
        Self::LoadBalanced { pools, algorithm }
    }

    pub fn validate(&self) -> DbResult<()> {
        match self {
            Self::LocalOnly => Ok(()),
            Self::ActiveStandby {
                primary, backup, ..
            } => {
                if primary.is_empty() || backup.is_empty() {
                    return Err(DbError::config("standby pool ids cannot be empty"));
                }
                if primary == backup {
                    return Err(DbError::config(format!(
                        "pool '{primary}' cannot be its own standby"
                    )));
                }
                Ok(())
            }
            Self::LoadBalanced { pools, .. } => {
                if pools.iter().any(String::is_empty) {
                    return Err(DbError::config("load-balanced pool ids cannot be empty"));
                }
                Ok(())
            }
        }
    }
}

/// Source of pool ids known to other nodes, polled in coordinated modes.
#[async_trait]
pub trait DiscoveryFeed: Send + Sync {
    async fn pool_ids(&self) -> DbResult<Vec<String>>;
}

/// Feed used in standalone mode: discovers nothing and never reports health.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopFeed;

#[async_trait]
impl DiscoveryFeed for NoopFeed {
    async fn pool_ids(&self) -> DbResult<Vec<String>> {
        Ok(Vec::new())
    }
}

impl HealthFeed for NoopFeed {
    fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        // The sender is dropped at once, so receivers see a closed channel
        broadcast::channel(1).1
    }
}

#[derive(Debug, Clone, Copy)]
struct HealthMark {
    healthy: bool,
    since: Instant,
}

#[derive(Debug)]
pub struct FailoverController {
    policy: RwLock<FailoverPolicy>,
    marks: DashMap<String, HealthMark>,
    /// Whether ActiveStandby currently serves the backup.
    standby_engaged: Mutex<bool>,
    discovered: RwLock<Vec<String>>,
    cursor: AtomicUsize,
}

impl Default for FailoverController {
    fn default() -> Self {
        Self::new(FailoverPolicy::LocalOnly)
    }
}

impl FailoverController {
    pub fn new(policy: FailoverPolicy) -> Self {
        Self {
            policy: RwLock::new(policy),
            marks: DashMap::new(),
            standby_engaged: Mutex::new(false),
            discovered: RwLock::new(Vec::new()),
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn policy(&self) -> FailoverPolicy {
        self.policy
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the policy. Standby state starts over.
    pub fn set_policy(&self, policy: FailoverPolicy) -> DbResult<()> {
        policy.validate()?;
        info!(policy = ?policy, "Failover policy updated");
        *self.policy.write().unwrap_or_else(PoisonError::into_inner) = policy;
        *self.standby_engaged.lock().unwrap_or_else(PoisonError::into_inner) = false;
        Ok(())
    }

    /// Apply a health transition. Repeated events with the same flag keep the
    /// original timestamp, so the continuous-duration clock is not reset.
    pub fn observe(&self, event: &HealthEvent) {
        let now = Instant::now();
        let mut entry = self.marks.entry(event.pool_id.clone()).or_insert(HealthMark {
            healthy: true,
            since: now,
        });
        if entry.healthy != event.healthy {
            debug!(pool_id = %event.pool_id, healthy = event.healthy, "Failover observed health change");
            *entry = HealthMark {
                healthy: event.healthy,
                since: now,
            };
        }
    }

    /// Unknown pools count as healthy.
    pub fn is_healthy(&self, pool_id: &str) -> bool {
        self.marks.get(pool_id).is_none_or(|mark| mark.healthy)
    }

    /// Drop everything known about a removed pool.
    pub fn forget(&self, pool_id: &str) {
        self.marks.remove(pool_id);
    }

    pub fn set_discovered(&self, ids: Vec<String>) {
        *self.discovered.write().unwrap_or_else(PoisonError::into_inner) = ids;
    }

    pub fn discovered(&self) -> Vec<String> {
        self.discovered
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Pick the pool that serves a request for `requested`.
    pub fn route(&self, requested: &str, load: &dyn LoadSource) -> String {
        let policy = self.policy();
        match policy {
            FailoverPolicy::LocalOnly => requested.to_string(),
            FailoverPolicy::ActiveStandby {
                primary,
                backup,
                switch_threshold,
                recovery_threshold,
            } => {
                if requested != primary {
                    return requested.to_string();
                }
                if self.standby_active(&primary, switch_threshold, recovery_threshold) {
                    backup
                } else {
                    primary
                }
            }
            FailoverPolicy::LoadBalanced { pools, algorithm } => {
                let mut members = pools;
                for id in self.discovered() {
                    if !members.contains(&id) {
                        members.push(id);
                    }
                }
                if !members.iter().any(|id| id == requested) {
                    return requested.to_string();
                }
                self.balance(requested, &members, algorithm, load)
            }
        }
    }

    /// Evaluate the standby hysteresis for `primary`.
    fn standby_active(&self, primary: &str, switch: Duration, recovery: Duration) -> bool {
        let mark = self.marks.get(primary).map(|m| *m);
        let mut engaged = self
            .standby_engaged
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(mark) = mark else {
            return *engaged;
        };

        let held_for = mark.since.elapsed();
        if !*engaged && !mark.healthy && held_for >= switch {
            warn!(
                pool_id = %primary,
                degraded_ms = held_for.as_millis() as u64,
                "Primary degraded past switch threshold, routing to standby"
            );
            *engaged = true;
        } else if *engaged && mark.healthy && held_for >= recovery {
            info!(
                pool_id = %primary,
                healthy_ms = held_for.as_millis() as u64,
                "Primary recovered, routing back"
            );
            *engaged = false;
        }
        *engaged
    }

    fn balance(
        &self,
        requested: &str,
        members: &[String],
        algorithm: LoadBalanceAlgorithm,
        load: &dyn LoadSource,
    ) -> String {
        let candidates: Vec<(&String, u32)> = members
            .iter()
            .filter(|id| self.is_healthy(id))
            .filter_map(|id| load.load(id).map(|active| (id, active)))
            .collect();

        if candidates.is_empty() {
            warn!(pool_id = %requested, "No healthy pool to balance over, using requested pool");
            return requested.to_string();
        }

        let picked = match algorithm {
            LoadBalanceAlgorithm::RoundRobin => {
                let n = self.cursor.fetch_add(1, Ordering::Relaxed);
                candidates[n % candidates.len()].0
            }
            LoadBalanceAlgorithm::LeastConnections => {
                // First minimum wins, which keeps ties in configured order
                let mut best = candidates[0];
                for candidate in &candidates[1..] {
                    if candidate.1 < best.1 {
                        best = *candidate;
                    }
                }
                best.0
            }
            LoadBalanceAlgorithm::Random => {
                let idx = rand::thread_rng().gen_range(0..candidates.len());
                candidates[idx].0
            }
        };
        picked.clone()
    }
}
