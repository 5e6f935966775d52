//! Connection-related data models.
//!
//! This module defines the pool configuration value handed to the manager:
//! which engine, how to reach it, and how the pool is sized.

use crate::config::{
    DEFAULT_ACQUIRE_TIMEOUT_SECS, DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_IDLE_TIMEOUT_SECS,
    DEFAULT_MAX_CONNECTIONS, DEFAULT_MAX_CONNECTIONS_SQLITE, DEFAULT_MAX_LIFETIME_SECS,
    DEFAULT_MIN_CONNECTIONS, DEFAULT_QUERY_TIMEOUT_SECS, DEFAULT_REAP_INTERVAL_SECS,
};
use crate::error::{DbError, DbResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Supported database types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    PostgreSQL,
    /// Includes MariaDB
    MySQL,
    SQLite,
    /// Microsoft SQL Server
    MSSQL,
}

impl DatabaseType {
    /// Parse database type from a connection string.
    pub fn from_connection_string(connection_string: &str) -> Option<Self> {
        let lower = connection_string.to_lowercase();
        if lower.starts_with("postgres://") || lower.starts_with("postgresql://") {
            Some(Self::PostgreSQL)
        } else if lower.starts_with("mysql://") || lower.starts_with("mariadb://") {
            Some(Self::MySQL)
        } else if lower.starts_with("sqlite://") || lower.starts_with("sqlite:") {
            Some(Self::SQLite)
        } else if lower.starts_with("mssql://") || lower.starts_with("sqlserver://") {
            Some(Self::MSSQL)
        } else {
            None
        }
    }

    /// Get the display name for this database type.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::PostgreSQL => "PostgreSQL",
            Self::MySQL => "MySQL",
            Self::SQLite => "SQLite",
            Self::MSSQL => "SQL Server",
        }
    }

    /// Get the default port for this database type.
    pub fn default_port(&self) -> Option<u16> {
        match self {
            Self::PostgreSQL => Some(5432),
            Self::MySQL => Some(3306),
            Self::SQLite => None,
            Self::MSSQL => Some(1433),
        }
    }

    /// Whether connections go over the network (and therefore need a host).
    pub fn is_networked(&self) -> bool {
        !matches!(self, Self::SQLite)
    }
}

impl std::fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// TLS negotiation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SslMode {
    Disable,
    #[default]
    Prefer,
    Require,
    VerifyCa,
    VerifyFull,
}

impl std::str::FromStr for SslMode {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "disable" | "disabled" => Ok(Self::Disable),
            "prefer" | "preferred" => Ok(Self::Prefer),
            "require" | "required" => Ok(Self::Require),
            "verify-ca" => Ok(Self::VerifyCa),
            "verify-full" | "verify-identity" => Ok(Self::VerifyFull),
            other => Err(DbError::config(format!("Unknown SSL mode: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SslOptions {
    pub mode: SslMode,
    pub root_cert: Option<PathBuf>,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
    /// SQL Server only: accept the server certificate without validation.
    #[serde(default)]
    pub trust_server_certificate: bool,
}

/// How to reach the backend. For SQLite, `database` is the file path.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct ConnectionParams {
    pub host: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    /// Contains sensitive data - never log
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub database: String,
    #[serde(default)]
    pub ssl: SslOptions,
    pub application_name: Option<String>,
    /// SQLite only: create the database file when missing.
    #[serde(default)]
    pub create_if_missing: bool,
}

impl ConnectionParams {
    /// Parameters for a SQLite database file.
    pub fn sqlite(path: impl Into<String>) -> Self {
        Self {
            database: path.into(),
            create_if_missing: true,
            ..Self::default()
        }
    }

    /// Parameters for a networked server.
    pub fn server(host: impl Into<String>, port: Option<u16>, database: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            database: database.into(),
            ..Self::default()
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: Option<String>) -> Self {
        self.username = Some(username.into());
        self.password = password;
        self
    }

    /// Display-safe target description (credentials masked).
    pub fn masked(&self, db_type: DatabaseType) -> String {
        if !db_type.is_networked() {
            return format!("sqlite:{}", self.database);
        }
        let user = match (&self.username, &self.password) {
            (Some(u), Some(_)) => format!("{u}:****@"),
            (Some(u), None) => format!("{u}@"),
            _ => String::new(),
        };
        let port = self
            .port
            .or(db_type.default_port())
            .map(|p| format!(":{p}"))
            .unwrap_or_default();
        format!("{}{}{}/{}", user, self.host, port, self.database)
    }
}

impl std::fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionParams")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "****"))
            .field("database", &self.database)
            .field("ssl", &self.ssl)
            .field("application_name", &self.application_name)
            .field("create_if_missing", &self.create_if_missing)
            .finish()
    }
}

/// Pool sizing and connection lifetime limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSizing {
    pub min_connections: u32,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
    /// Cap on in-flight operations; defaults to `max_connections`.
    pub max_concurrent: Option<u32>,
    /// Probe idle connections before handing them out.
    pub test_before_acquire: bool,
    /// How often expired connections are reclaimed.
    pub reap_interval: Duration,
}

impl PoolSizing {
    /// Sizing defaults for the given engine. SQLite gets a single writer.
    pub fn for_database(db_type: DatabaseType) -> Self {
        let max_connections = match db_type {
            DatabaseType::SQLite => DEFAULT_MAX_CONNECTIONS_SQLITE,
            _ => DEFAULT_MAX_CONNECTIONS,
        };
        Self {
            min_connections: DEFAULT_MIN_CONNECTIONS,
            max_connections,
            acquire_timeout: Duration::from_secs(DEFAULT_ACQUIRE_TIMEOUT_SECS),
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            max_lifetime: Duration::from_secs(DEFAULT_MAX_LIFETIME_SECS),
            max_concurrent: None,
            test_before_acquire: true,
            reap_interval: Duration::from_secs(DEFAULT_REAP_INTERVAL_SECS),
        }
    }

    pub fn effective_max_concurrent(&self) -> u32 {
        self.max_concurrent.unwrap_or(self.max_connections)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    pub query_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            query_timeout: Duration::from_secs(DEFAULT_QUERY_TIMEOUT_SECS),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
        }
    }
}

/// Complete configuration for one named pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub id: String,
    pub db_type: DatabaseType,
    pub connection: ConnectionParams,
    pub sizing: PoolSizing,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

impl PoolConfig {
    /// Create a configuration with sizing defaults for the engine.
    pub fn new(id: impl Into<String>, db_type: DatabaseType, connection: ConnectionParams) -> Self {
        Self {
            id: id.into(),
            db_type,
            connection,
            sizing: PoolSizing::for_database(db_type),
            timeouts: TimeoutConfig::default(),
        }
    }

    pub fn with_sizing(mut self, min_connections: u32, max_connections: u32) -> Self {
        self.sizing.min_connections = min_connections;
        self.sizing.max_connections = max_connections;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.sizing.acquire_timeout = timeout;
        self
    }

    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.query_timeout = timeout;
        self
    }

    /// Check every invariant. Nothing is created when this fails.
    pub fn validate(&self) -> DbResult<()> {
        if self.id.is_empty() {
            return Err(DbError::config("Pool ID cannot be empty"));
        }
        if !self
            .id
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
        {
            return Err(DbError::config(format!(
                "Pool ID contains invalid characters: {}",
                self.id
            )));
        }

        let sizing = &self.sizing;
        if sizing.max_connections == 0 {
            return Err(DbError::config("max_connections must be greater than 0"));
        }
        if sizing.min_connections > sizing.max_connections {
            return Err(DbError::config(format!(
                "min_connections ({}) cannot exceed max_connections ({})",
                sizing.min_connections, sizing.max_connections
            )));
        }
        if sizing.max_concurrent == Some(0) {
            return Err(DbError::config("max_concurrent must be greater than 0"));
        }
        for (name, value) in [
            ("acquire_timeout", sizing.acquire_timeout),
            ("idle_timeout", sizing.idle_timeout),
            ("max_lifetime", sizing.max_lifetime),
            ("reap_interval", sizing.reap_interval),
            ("query_timeout", self.timeouts.query_timeout),
            ("connect_timeout", self.timeouts.connect_timeout),
        ] {
            if value.is_zero() {
                return Err(DbError::config(format!("{name} must be greater than 0")));
            }
        }

        if self.db_type.is_networked() && self.connection.host.is_empty() {
            return Err(DbError::config(format!(
                "{} requires a host",
                self.db_type.display_name()
            )));
        }
        if self.db_type == DatabaseType::SQLite && self.connection.database.is_empty() {
            return Err(DbError::config("SQLite requires a database file path"));
        }
        Ok(())
    }
}

/// Information about a pool, returned after successful creation.
#[derive(Debug, Clone, Serialize)]
pub struct PoolInfo {
    pub pool_id: String,
    pub db_type: DatabaseType,
    pub target: String,
    pub connections: u32,
}
