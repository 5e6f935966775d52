//! Data models for the pool manager.
//!
//! This module re-exports all model types used throughout the crate.

pub mod connection;
pub mod query;
pub mod status;
pub mod table;

// Re-export commonly used types
pub use connection::{
    ConnectionParams, DatabaseType, PoolConfig, PoolInfo, PoolSizing, SslMode, SslOptions,
    TimeoutConfig,
};
pub use query::{
    DEFAULT_CHUNK_SIZE, ExecuteResult, QueryParam, QueryRequest, Statement, TransactionResult,
};
pub use status::{HealthStatus, PoolState, PoolStatus};
pub use table::{Column, ColumnType, TableResult, Value};
