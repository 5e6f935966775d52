//! Query-related data models.
//!
//! This module defines types for SQL query requests and results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::time::Duration;

/// Default number of rows per chunk for streamed queries.
pub const DEFAULT_CHUNK_SIZE: usize = 500;

/// A parameter value for parameterized queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryParam {
    /// NULL value
    Null,
    /// Boolean value
    Bool(bool),
    /// Integer value (stored as i64 for maximum range)
    Int(i64),
    /// Floating point value
    Float(f64),
    /// UTC timestamp
    Timestamp(DateTime<Utc>),
    /// String value
    String(String),
    /// Binary data (base64 encoded in JSON)
    #[serde(with = "base64_bytes")]
    Bytes(Vec<u8>),
    /// Structured JSON document
    Json(JsonValue),
}

impl QueryParam {
    /// Check if this parameter is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get the type name of this parameter for debugging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Timestamp(_) => "timestamp",
            Self::String(_) => "string",
            Self::Bytes(_) => "bytes",
            Self::Json(_) => "json",
        }
    }
}

impl From<i64> for QueryParam {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for QueryParam {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for QueryParam {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for QueryParam {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for QueryParam {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<DateTime<Utc>> for QueryParam {
    fn from(v: DateTime<Utc>) -> Self {
        Self::Timestamp(v)
    }
}

impl<T: Into<QueryParam>> From<Option<T>> for QueryParam {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Self::Null)
    }
}

/// Custom serialization for binary data as base64.
mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        STANDARD.encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

/// One statement with its positional parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    pub sql: String,
    #[serde(default)]
    pub params: Vec<QueryParam>,
}

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    pub fn with_param(mut self, param: impl Into<QueryParam>) -> Self {
        self.params.push(param.into());
        self
    }
}

impl From<&str> for Statement {
    fn from(sql: &str) -> Self {
        Self::new(sql)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    pub pool_id: String,
    pub sql: String,
    #[serde(default)]
    pub params: Vec<QueryParam>,
    /// Overrides the pool's query timeout.
    #[serde(default)]
    pub timeout: Option<Duration>,
    /// Run on the connection held by this interactive transaction.
    #[serde(default)]
    pub transaction_id: Option<String>,
}

impl QueryRequest {
    /// Create a new query request with default options.
    pub fn new(pool_id: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            pool_id: pool_id.into(),
            sql: sql.into(),
            params: Vec::new(),
            timeout: None,
            transaction_id: None,
        }
    }

    /// Add a parameter to this query.
    pub fn with_param(mut self, param: impl Into<QueryParam>) -> Self {
        self.params.push(param.into());
        self
    }

    /// Set the timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Bind this request to an open transaction.
    pub fn in_transaction(mut self, transaction_id: impl Into<String>) -> Self {
        self.transaction_id = Some(transaction_id.into());
        self
    }
}

/// Outcome of a single write statement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecuteResult {
    pub rows_affected: u64,
    pub execution_time_ms: u64,
}

impl ExecuteResult {
    pub fn new(rows_affected: u64, execution_time: Duration) -> Self {
        Self {
            rows_affected,
            execution_time_ms: execution_time.as_millis() as u64,
        }
    }
}

/// Outcome of an atomic multi-statement transaction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionResult {
    /// Affected rows per statement, in submission order.
    pub rows_affected: Vec<u64>,
    pub execution_time_ms: u64,
}

impl TransactionResult {
    pub fn new(rows_affected: Vec<u64>, execution_time: Duration) -> Self {
        Self {
            rows_affected,
            execution_time_ms: execution_time.as_millis() as u64,
        }
    }

    pub fn total_rows_affected(&self) -> u64 {
        self.rows_affected.iter().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_request_builder() {
        let req = QueryRequest::new("main", "SELECT * FROM t WHERE id = ?")
            .with_param(42i64)
            .with_timeout(Duration::from_secs(5));
        assert_eq!(req.params, vec![QueryParam::Int(42)]);
        assert_eq!(req.timeout, Some(Duration::from_secs(5)));
        assert!(req.transaction_id.is_none());
    }

    #[test]
    fn test_option_param_becomes_null() {
        let p: QueryParam = None::<i64>.into();
        assert!(p.is_null());
        let p: QueryParam = Some("x").into();
        assert_eq!(p.type_name(), "string");
    }

    #[test]
    fn test_bytes_param_serializes_as_base64() {
        let json = serde_json::to_string(&QueryParam::Bytes(vec![1, 2, 3])).unwrap();
        assert_eq!(json, "\"AQID\"");
    }

    #[test]
    fn test_statement_from_str() {
        let s: Statement = "DELETE FROM t".into();
        assert!(s.params.is_empty());
        assert_eq!(s.with_param(1i64).params.len(), 1);
    }
}
