//! Health monitoring for pools.
//!
//! A background task per pool probes it on a fixed interval and runs the
//! outcome through a [`HealthTracker`]. Crossing the failure threshold marks
//! the pool Degraded; crossing the recovery threshold marks it Active again.
//! Every transition is published as a [`HealthEvent`] for the failover
//! controller.
//!
//! # Architecture
//!
//! ```text
//! HealthMonitor
//!   ├── Per-pool background task (holds a Weak<Pool>)
//!   │   ├── Pool::probe() → ProbeOutcome
//!   │   ├── HealthTracker (consecutive failures/successes)
//!   │   └── Pool::record_health()
//!   └── broadcast::Sender<HealthEvent> → failover controller
//! ```
//!
//! Probe outcomes never reach query callers.

use crate::config::HealthConfig;
use crate::db::pool::{Pool, ProbeOutcome};
use crate::models::HealthStatus;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 256;

/// Health transition of one pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthEvent {
    pub pool_id: String,
    pub healthy: bool,
    pub at: DateTime<Utc>,
}

impl HealthEvent {
    pub fn new(pool_id: impl Into<String>, healthy: bool) -> Self {
        Self {
            pool_id: pool_id.into(),
            healthy,
            at: Utc::now(),
        }
    }
}

/// A source of health transitions.
///
/// The local monitor is one; in full-distributed deployments remote
/// observers publish through the same interface.
pub trait HealthFeed: Send + Sync {
    fn subscribe(&self) -> broadcast::Receiver<HealthEvent>;
}

/// Tracks consecutive probe results for a single pool.
#[derive(Debug)]
pub struct HealthTracker {
    status: HealthStatus,
    failure_threshold: u32,
    recovery_threshold: u32,
}

impl HealthTracker {
    /// Pools start healthy: creation proved `min` connections.
    pub fn new(config: &HealthConfig) -> Self {
        Self::with_thresholds(config.failure_threshold, config.recovery_threshold)
    }

    pub fn with_thresholds(failure_threshold: u32, recovery_threshold: u32) -> Self {
        Self {
            status: HealthStatus::healthy(),
            failure_threshold: failure_threshold.max(1),
            recovery_threshold: recovery_threshold.max(1),
        }
    }

    /// Record a probe outcome. Returns the new health flag when it changed.
    ///
    /// A skipped probe (saturated or closing pool) changes nothing.
    pub fn record(&mut self, outcome: &ProbeOutcome) -> Option<bool> {
        let was_healthy = self.status.healthy;
        match outcome {
            ProbeOutcome::Success(latency) => {
                self.status.consecutive_failures = 0;
                self.status.consecutive_successes += 1;
                self.status.last_latency = Some(*latency);
                self.status.last_error = None;
                if self.status.consecutive_successes >= self.recovery_threshold {
                    self.status.healthy = true;
                }
            }
            ProbeOutcome::Failure(error) => {
                self.status.consecutive_successes = 0;
                self.status.consecutive_failures += 1;
                self.status.last_error = Some(error.clone());
                if self.status.consecutive_failures >= self.failure_threshold {
                    self.status.healthy = false;
                }
            }
            ProbeOutcome::Skipped => return None,
        }
        self.status.last_check = Some(Utc::now());
        (self.status.healthy != was_healthy).then_some(self.status.healthy)
    }

    pub fn status(&self) -> &HealthStatus {
        &self.status
    }

    pub fn is_healthy(&self) -> bool {
        self.status.healthy
    }
}

/// Per-pool monitor state.
struct MonitorSlot {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

/// Manages health monitors for all registered pools.
pub struct HealthMonitor {
    config: HealthConfig,
    events: broadcast::Sender<HealthEvent>,
    monitors: DashMap<String, MonitorSlot>,
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("config", &self.config)
            .field("monitors", &self.monitors.len())
            .finish()
    }
}

impl HealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            events,
            monitors: DashMap::new(),
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Start monitoring a pool, replacing any monitor already running for
    /// the same id.
    pub fn start_monitor(&self, pool: &Arc<Pool>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let weak = Arc::downgrade(pool);
        let config = self.config.clone();
        let events = self.events.clone();

        let handle = tokio::spawn(run_health_loop(weak, config, events, shutdown_rx));

        if let Some(old) = self.monitors.insert(
            pool.id().to_string(),
            MonitorSlot {
                handle,
                shutdown_tx,
            },
        ) {
            let _ = old.shutdown_tx.send(true);
            old.handle.abort();
        }
        debug!(pool_id = %pool.id(), interval_ms = self.config.interval.as_millis() as u64, "Health monitor started");
    }

    pub fn stop_monitor(&self, pool_id: &str) {
        if let Some((_, slot)) = self.monitors.remove(pool_id) {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            debug!(%pool_id, "Health monitor stopped");
        }
    }

    /// Stop all monitors (for graceful shutdown).
    pub fn stop_all(&self) {
        let ids: Vec<String> = self.monitors.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.stop_monitor(&id);
        }
        info!("All health monitors stopped");
    }

    pub fn is_monitoring(&self, pool_id: &str) -> bool {
        self.monitors.contains_key(pool_id)
    }

    /// Publish an event on behalf of another source.
    pub fn publish(&self, event: HealthEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    /// Probe immediately without touching the tracked counters.
    ///
    /// A skipped probe reports the last known health of a pool that still
    /// accepts work.
    pub async fn check_now(&self, pool: &Arc<Pool>) -> bool {
        match pool.probe(self.config.probe_timeout).await {
            ProbeOutcome::Success(_) => true,
            ProbeOutcome::Failure(error) => {
                debug!(pool_id = %pool.id(), %error, "On-demand health check failed");
                false
            }
            ProbeOutcome::Skipped => pool.state().accepts_checkouts() && pool.health().healthy,
        }
    }
}

impl HealthFeed for HealthMonitor {
    fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.events.subscribe()
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        for entry in self.monitors.iter() {
            entry.value().handle.abort();
        }
    }
}

/// The health check loop for a single pool.
async fn run_health_loop(
    pool: Weak<Pool>,
    config: HealthConfig,
    events: broadcast::Sender<HealthEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tracker = HealthTracker::new(&config);

    loop {
        tokio::select! {
            _ = tokio::time::sleep(config.interval) => {
                let Some(pool) = pool.upgrade() else {
                    return;
                };
                if !pool.state().accepts_checkouts() {
                    return;
                }

                let outcome = pool.probe(config.probe_timeout).await;
                let changed = tracker.record(&outcome);
                if matches!(outcome, ProbeOutcome::Skipped) {
                    continue;
                }
                pool.record_health(tracker.status().clone());

                if let Some(healthy) = changed {
                    if healthy {
                        info!(pool_id = %pool.id(), "Pool recovered");
                    } else {
                        warn!(
                            pool_id = %pool.id(),
                            failures = tracker.status().consecutive_failures,
                            error = tracker.status().last_error.as_deref().unwrap_or(""),
                            "Pool degraded"
                        );
                    }
                    let _ = events.send(HealthEvent::new(pool.id(), healthy));
                }
            }
            _ = shutdown.changed() => {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn failure() -> ProbeOutcome {
        ProbeOutcome::Failure("refused".into())
    }

    fn success() -> ProbeOutcome {
        ProbeOutcome::Success(Duration::from_millis(2))
    }

    #[test]
    fn test_tracker_starts_healthy() {
        let tracker = HealthTracker::with_thresholds(3, 2);
        assert!(tracker.is_healthy());
        assert_eq!(tracker.status().consecutive_failures, 0);
    }

    #[test]
    fn test_failure_threshold() {
        let mut tracker = HealthTracker::with_thresholds(3, 2);
        assert_eq!(tracker.record(&failure()), None);
        assert_eq!(tracker.record(&failure()), None);
        assert_eq!(tracker.record(&failure()), Some(false));
        assert_eq!(tracker.record(&failure()), None);
        assert_eq!(tracker.status().consecutive_failures, 4);
        assert_eq!(tracker.status().last_error.as_deref(), Some("refused"));
    }

    #[test]
    fn test_recovery_threshold() {
        let mut tracker = HealthTracker::with_thresholds(1, 2);
        assert_eq!(tracker.record(&failure()), Some(false));
        assert_eq!(tracker.record(&success()), None);
        assert!(!tracker.is_healthy());
        assert_eq!(tracker.record(&success()), Some(true));
        assert_eq!(tracker.status().last_latency, Some(Duration::from_millis(2)));
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let mut tracker = HealthTracker::with_thresholds(2, 1);
        tracker.record(&failure());
        tracker.record(&success());
        assert_eq!(tracker.record(&failure()), None);
        assert!(tracker.is_healthy());
    }

    #[test]
    fn test_skipped_probe_changes_nothing() {
        let mut tracker = HealthTracker::with_thresholds(1, 1);
        assert_eq!(tracker.record(&ProbeOutcome::Skipped), None);
        assert!(tracker.status().last_check.is_none());
    }

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let monitor = HealthMonitor::new(HealthConfig::new(
            Duration::from_secs(1),
            Duration::from_millis(100),
            1,
            1,
        ));
        let mut rx = monitor.subscribe();
        monitor.publish(HealthEvent::new("remote", false));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.pool_id, "remote");
        assert!(!event.healthy);
    }
}
