//! Error types for the pool manager.
//!
//! This module defines all error types using `thiserror` for ergonomic error handling.
//! Variants carry enough context for callers to decide between backing off,
//! fixing their input, or giving up.

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Invalid configuration: {message}")]
    Config { message: String },

    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Query failed: {message}")]
    Query {
        message: String,
        /// e.g., "42P01" for undefined table
        sql_state: Option<String>,
        suggestion: String,
    },

    #[error("Timeout: {operation} exceeded {elapsed_ms}ms")]
    Timeout { operation: String, elapsed_ms: u64 },

    #[error(
        "Transaction rolled back: statement {failed_index} failed after {succeeded} succeeded: {message}"
    )]
    Transaction {
        failed_index: usize,
        succeeded: usize,
        message: String,
    },

    #[error("Pool '{pool_id}' exhausted: no connection available within {waited_ms}ms")]
    PoolExhausted { pool_id: String, waited_ms: u64 },

    #[error("Pool not found: {pool_id}")]
    PoolNotFound { pool_id: String },

    #[error("Pool '{pool_id}' is closed or draining")]
    PoolClosed { pool_id: String },

    #[error("Transaction error: {message} (transaction: {transaction_id})")]
    TransactionContext {
        message: String,
        transaction_id: String,
    },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a query error with optional SQL state.
    pub fn query(
        message: impl Into<String>,
        sql_state: Option<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Query {
            message: message.into(),
            sql_state,
            suggestion: suggestion.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    /// Statement `failed_index` failed and the whole transaction was rolled back.
    pub fn transaction_failed(
        failed_index: usize,
        succeeded: usize,
        message: impl Into<String>,
    ) -> Self {
        Self::Transaction {
            failed_index,
            succeeded,
            message: message.into(),
        }
    }

    pub fn pool_exhausted(pool_id: impl Into<String>, waited: Duration) -> Self {
        Self::PoolExhausted {
            pool_id: pool_id.into(),
            waited_ms: waited.as_millis() as u64,
        }
    }

    pub fn pool_not_found(pool_id: impl Into<String>) -> Self {
        Self::PoolNotFound {
            pool_id: pool_id.into(),
        }
    }

    pub fn pool_closed(pool_id: impl Into<String>) -> Self {
        Self::PoolClosed {
            pool_id: pool_id.into(),
        }
    }

    /// Create an error tied to an interactive transaction.
    pub fn transaction_context(
        message: impl Into<String>,
        transaction_id: impl Into<String>,
    ) -> Self {
        Self::TransactionContext {
            message: message.into(),
            transaction_id: transaction_id.into(),
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::Query { suggestion, .. } => Some(suggestion),
            Self::PoolExhausted { .. } => Some("Back off and retry, or raise max_connections"),
            _ => None,
        }
    }

    /// Check if this error is retryable.
    ///
    /// Only transient connection failures qualify; statements are never
    /// retried because they may not be idempotent.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout { .. })
    }

    /// Whether the connection that produced this error is in an unknown state
    /// and must be discarded instead of returned to the idle set.
    pub fn poisons_connection(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::Timeout { .. } | Self::Internal { .. }
        )
    }
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::config(msg.to_string()),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                DbError::query(
                    db_err.message(),
                    code,
                    "Check the SQL syntax and referenced objects",
                )
            }
            sqlx::Error::RowNotFound => DbError::query(
                "No rows returned",
                None,
                "Verify the query conditions match existing data",
            ),
            sqlx::Error::PoolTimedOut => {
                DbError::timeout("connection acquire", Duration::default())
            }
            sqlx::Error::PoolClosed => {
                DbError::connection("Connection is closed", "Reconnect to the database")
            }
            sqlx::Error::Io(io_err) => DbError::connection(
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            sqlx::Error::Tls(tls_err) => DbError::connection(
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => DbError::connection(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::TypeNotFound { type_name } => DbError::query(
                format!("Type not found: {}", type_name),
                None,
                "Check the types referenced by the statement",
            ),
            sqlx::Error::ColumnNotFound(col) => DbError::query(
                format!("Column not found: {}", col),
                None,
                "Check the column names referenced by the statement",
            ),
            sqlx::Error::ColumnIndexOutOfBounds { index, len } => DbError::internal(format!(
                "Column index {} out of bounds (len: {})",
                index, len
            )),
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => DbError::internal(format!("Decode error: {}", source)),
            sqlx::Error::WorkerCrashed => DbError::connection(
                "Database worker crashed",
                "The connection will be replaced on next checkout",
            ),
            _ => DbError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

/// Convert SQL Server driver errors to DbError.
impl From<tiberius::error::Error> for DbError {
    fn from(err: tiberius::error::Error) -> Self {
        use tiberius::error::Error as TdsError;
        match err {
            TdsError::Server(token) => DbError::query(
                token.message(),
                Some(token.code().to_string()),
                "Check the SQL syntax and referenced objects",
            ),
            TdsError::Io { message, .. } => DbError::connection(
                format!("I/O error: {message}"),
                "Check network connectivity and database server status",
            ),
            TdsError::Tls(msg) => DbError::connection(
                format!("TLS error: {msg}"),
                "Verify TLS configuration or set trust_server_certificate=true",
            ),
            TdsError::Routing { host, port } => DbError::connection(
                format!("Server redirected the session to {host}:{port}"),
                "Connect to the routed address directly",
            ),
            TdsError::Conversion(msg) => DbError::query(
                format!("Conversion error: {msg}"),
                None,
                "Check parameter and column types",
            ),
            other => DbError::connection(
                format!("Protocol error: {other}"),
                "Check database server compatibility",
            ),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;
