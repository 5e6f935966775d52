//! Database abstraction layer.
//!
//! This module provides database access functionality:
//! - Driver capability traits and the kind-to-driver registry
//! - sqlx-backed drivers for SQLite, PostgreSQL and MySQL, and a tiberius
//!   driver for SQL Server
//! - Bounded connection pools and the pool registry
//! - Query execution, streaming and interactive transactions
//! - Type mappings into the uniform table format

pub mod driver;
pub mod drivers;
pub mod executor;
#[macro_use]
pub mod macros;
pub mod params;
pub mod pool;
pub mod registry;
pub mod transaction_registry;
pub mod types;

pub use driver::{Driver, DriverConnection, DriverRegistry};
pub use executor::{QueryExecutor, RowStream};
pub use pool::{Pool, PooledConnection, ProbeOutcome};
pub use registry::{LoadSource, PoolRegistry};
pub use transaction_registry::{TransactionMetadata, TransactionRegistry};
