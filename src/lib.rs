//! dbpool Library
//!
//! Multi-backend database connection pooling (SQLite, PostgreSQL, MySQL and
//! SQL Server) with health monitoring, failover routing, streaming results
//! and per-pool metrics. [`PoolManager`] is the entry point.

pub mod config;
pub mod db;
pub mod error;
pub mod failover;
pub mod health;
pub mod manager;
pub mod metrics;
pub mod models;

pub use config::{Config, ManagerOptions};
pub use error::{DbError, DbResult};
pub use failover::{FailoverPolicy, LoadBalanceAlgorithm};
pub use manager::PoolManager;
