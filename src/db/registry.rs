//! Pool registry: maps pool ids to live pools.
//!
//! # Design Decisions
//!
//! - **`DashMap` of per-id cells**: lookups are concurrent and mutations lock
//!   only the id's shard; there is no registry-wide mutex.
//! - **`OnceCell` per id**: the cell is inserted first to reserve the id, so a
//!   concurrent `create` with the same id fails fast with a config error while
//!   the first one is still connecting.
//! - **No map guard across await points**: cells are cloned out of the map
//!   before any I/O.

use crate::config::RetryPolicy;
use crate::db::driver::DriverRegistry;
use crate::db::pool::Pool;
use crate::error::{DbError, DbResult};
use crate::models::PoolConfig;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// Synchronous view of per-pool load, used by least-connections balancing.
pub trait LoadSource: Send + Sync {
    /// Checked-out sessions of `pool_id`, or `None` if it is not registered.
    fn load(&self, pool_id: &str) -> Option<u32>;
}

pub struct PoolRegistry {
    drivers: DriverRegistry,
    retry: RetryPolicy,
    pools: DashMap<String, Arc<OnceCell<Arc<Pool>>>>,
}

impl std::fmt::Debug for PoolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolRegistry")
            .field("pools", &self.pools.len())
            .finish_non_exhaustive()
    }
}

impl PoolRegistry {
    pub fn new(drivers: DriverRegistry, retry: RetryPolicy) -> Self {
        Self {
            drivers,
            retry,
            pools: DashMap::new(),
        }
    }

    /// Validate, connect and register a pool.
    ///
    /// The id is reserved before connecting and released again if the pool
    /// cannot be established, so a failed create leaves no trace.
    pub async fn create(&self, config: PoolConfig) -> DbResult<Arc<Pool>> {
        config.validate()?;
        let driver = self.drivers.get(config.db_type)?;
        let id = config.id.clone();

        let cell = match self.pools.entry(id.clone()) {
            Entry::Occupied(_) => {
                return Err(DbError::config(format!("Pool '{id}' already exists")));
            }
            Entry::Vacant(vacant) => {
                let cell = Arc::new(OnceCell::new());
                vacant.insert(Arc::clone(&cell));
                cell
            }
        };

        match Pool::open(config, driver, self.retry.clone()).await {
            Ok(pool) => {
                if cell.set(Arc::clone(&pool)).is_err() {
                    return Err(DbError::internal(format!("Pool '{id}' initialized twice")));
                }
                Ok(pool)
            }
            Err(e) => {
                self.pools
                    .remove_if(&id, |_, existing| Arc::ptr_eq(existing, &cell));
                debug!(pool_id = %id, error = %e, "Pool creation failed, id released");
                Err(e)
            }
        }
    }

    /// Look up an initialized pool.
    pub fn get(&self, pool_id: &str) -> DbResult<Arc<Pool>> {
        self.pools
            .get(pool_id)
            .and_then(|cell| cell.get().cloned())
            .ok_or_else(|| DbError::pool_not_found(pool_id))
    }

    /// Drain a pool and unregister it.
    ///
    /// Checkouts are rejected from the moment removal starts; in-flight work
    /// gets `grace` to finish. A pool that is already being removed is
    /// reported as not found.
    pub async fn remove(&self, pool_id: &str, grace: Duration) -> DbResult<()> {
        let pool = self.begin_remove(pool_id)?;
        self.finish_remove(&pool, grace).await;
        Ok(())
    }

    /// First half of [`remove`](Self::remove): stop checkouts and hand back
    /// the pool so callers can wind down work bound to it while it drains.
    pub fn begin_remove(&self, pool_id: &str) -> DbResult<Arc<Pool>> {
        let pool = self.get(pool_id)?;
        if !pool.begin_drain() {
            return Err(DbError::pool_not_found(pool_id));
        }
        info!(pool_id = %pool_id, "Removing pool");
        Ok(pool)
    }

    /// Second half of [`remove`](Self::remove): drain and unregister.
    pub async fn finish_remove(&self, pool: &Arc<Pool>, grace: Duration) {
        debug!(pool_id = %pool.id(), grace_ms = grace.as_millis() as u64, "Draining pool");
        pool.drain(grace).await;
        self.pools.remove_if(pool.id(), |_, cell| {
            cell.get().is_some_and(|p| Arc::ptr_eq(p, pool))
        });
    }

    /// Ids of initialized pools, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .pools
            .iter()
            .filter(|entry| entry.value().get().is_some())
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }

    /// Snapshot of initialized pools.
    pub fn pools(&self) -> Vec<Arc<Pool>> {
        self.pools
            .iter()
            .filter_map(|entry| entry.value().get().cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    /// Drain and unregister every pool.
    pub async fn close_all(&self, grace: Duration) {
        // Collect under shard locks, drain outside them
        let pools = self.pools();
        for pool in &pools {
            pool.begin_drain();
        }
        futures_util::future::join_all(pools.iter().map(|pool| pool.drain(grace))).await;
        self.pools.clear();
    }
}

impl LoadSource for PoolRegistry {
    fn load(&self, pool_id: &str) -> Option<u32> {
        self.get(pool_id).ok().map(|pool| pool.checked_out())
    }
}
