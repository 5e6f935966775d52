//! MySQL/MariaDB driver.

use super::establish;
use crate::db::driver::{Driver, DriverConnection};
use crate::db::params::bind_mysql_param;
use crate::db::types::{RawDecimal, RawRow, RawValue, column_for};
use crate::error::{DbError, DbResult};
use crate::impl_driver_session;
use crate::models::{Column, ColumnType, DatabaseType, PoolConfig, SslMode};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use sqlx::mysql::{MySqlConnectOptions, MySqlRow, MySqlSslMode};
use sqlx::{Column as _, ConnectOptions, Row, TypeInfo, ValueRef};

#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlDriver;

impl MySqlDriver {
    pub fn connect_options(config: &PoolConfig) -> MySqlConnectOptions {
        let params = &config.connection;
        let mut options = MySqlConnectOptions::new()
            .host(&params.host)
            .database(&params.database)
            .charset("utf8mb4")
            .ssl_mode(ssl_mode(params.ssl.mode));

        if let Some(port) = params.port {
            options = options.port(port);
        }
        if let Some(username) = &params.username {
            options = options.username(username);
        }
        if let Some(password) = &params.password {
            options = options.password(password);
        }
        if let Some(cert) = &params.ssl.root_cert {
            options = options.ssl_ca(cert);
        }
        if let Some(cert) = &params.ssl.client_cert {
            options = options.ssl_client_cert(cert);
        }
        if let Some(key) = &params.ssl.client_key {
            options = options.ssl_client_key(key);
        }
        options
    }
}

fn ssl_mode(mode: SslMode) -> MySqlSslMode {
    match mode {
        SslMode::Disable => MySqlSslMode::Disabled,
        SslMode::Prefer => MySqlSslMode::Preferred,
        SslMode::Require => MySqlSslMode::Required,
        SslMode::VerifyCa => MySqlSslMode::VerifyCa,
        SslMode::VerifyFull => MySqlSslMode::VerifyIdentity,
    }
}

#[async_trait]
impl Driver for MySqlDriver {
    fn kind(&self) -> DatabaseType {
        DatabaseType::MySQL
    }

    async fn connect(&self, config: &PoolConfig) -> DbResult<Box<dyn DriverConnection>> {
        let options = Self::connect_options(config);
        let conn = establish(config, options.connect()).await?;
        Ok(Box::new(MySqlSession::new(conn)))
    }
}

impl_driver_session!(
    MySqlSession,
    sqlx::MySqlConnection,
    sqlx::MySql,
    bind_mysql_param,
    decode_row
);

fn decode_row(row: &MySqlRow) -> DbResult<RawRow> {
    let columns: Vec<_> = row
        .columns()
        .iter()
        .map(|col| column_for(col.name(), col.type_info().name(), DatabaseType::MySQL))
        .collect();
    let values = row
        .columns()
        .iter()
        .zip(&columns)
        .map(|(col, meta)| decode_column(row, col.ordinal(), col.type_info().name(), meta))
        .collect::<DbResult<Vec<_>>>()?;
    Ok(RawRow { columns, values })
}

/// Decode one cell. Anything no typed decoder accepts is read as the raw
/// length-prefixed bytes MySQL sends for non-numeric types; a value that
/// cannot be read either way is an error rather than a silent NULL.
fn decode_column(
    row: &MySqlRow,
    idx: usize,
    type_name: &str,
    column: &Column,
) -> DbResult<RawValue> {
    if row.try_get_raw(idx)?.is_null() {
        return Ok(RawValue::Null);
    }
    let value = match column.column_type {
        ColumnType::Decimal => row.try_get::<RawDecimal, _>(idx).ok().map(|v| RawValue::Decimal(v.0)),
        ColumnType::Integer => decode_integer(row, idx),
        ColumnType::Boolean => row.try_get::<bool, _>(idx).ok().map(RawValue::Bool),
        ColumnType::Float => decode_float(row, idx),
        ColumnType::Binary => row.try_get::<Vec<u8>, _>(idx).ok().map(RawValue::Bytes),
        // MySQL JSON type should be decoded as serde_json::Value directly
        ColumnType::Json => row
            .try_get::<serde_json::Value, _>(idx)
            .ok()
            .map(RawValue::Json),
        ColumnType::Timestamp => decode_timestamp(row, idx),
        ColumnType::Date => row.try_get::<NaiveDate, _>(idx).ok().map(RawValue::Date),
        ColumnType::Time => row.try_get::<NaiveTime, _>(idx).ok().map(RawValue::Time),
        ColumnType::Uuid | ColumnType::Text | ColumnType::Unknown => {
            row.try_get::<String, _>(idx).ok().map(RawValue::Text)
        }
    };
    if let Some(value) = value {
        return Ok(value);
    }

    // Numeric and temporal values travel in fixed binary layouts; only the
    // rest is safe to read as bytes
    let byte_encoded = matches!(
        column.column_type,
        ColumnType::Uuid | ColumnType::Text | ColumnType::Unknown | ColumnType::Json
    );
    if byte_encoded {
        if let Ok(bytes) = row.try_get_unchecked::<Vec<u8>, _>(idx) {
            return Ok(match String::from_utf8(bytes) {
                Ok(text) => RawValue::Text(text),
                Err(e) => RawValue::Bytes(e.into_bytes()),
            });
        }
    }
    Err(DbError::query(
        format!("Cannot decode column '{}' of MySQL type {type_name}", column.name),
        None,
        format!("Cast the column to a character type, e.g. CAST({} AS CHAR)", column.name),
    ))
}

fn decode_integer(row: &MySqlRow, idx: usize) -> Option<RawValue> {
    // Try signed types
    if let Ok(v) = row.try_get::<i8, _>(idx) {
        return Some(RawValue::I8(v));
    }
    if let Ok(v) = row.try_get::<i16, _>(idx) {
        return Some(RawValue::I16(v));
    }
    if let Ok(v) = row.try_get::<i32, _>(idx) {
        return Some(RawValue::I32(v));
    }
    if let Ok(v) = row.try_get::<i64, _>(idx) {
        return Some(RawValue::I64(v));
    }
    // Try unsigned types
    if let Ok(v) = row.try_get::<u8, _>(idx) {
        return Some(RawValue::U8(v));
    }
    if let Ok(v) = row.try_get::<u16, _>(idx) {
        return Some(RawValue::U16(v));
    }
    if let Ok(v) = row.try_get::<u32, _>(idx) {
        return Some(RawValue::U32(v));
    }
    if let Ok(v) = row.try_get::<u64, _>(idx) {
        return Some(RawValue::U64(v));
    }
    None
}

fn decode_float(row: &MySqlRow, idx: usize) -> Option<RawValue> {
    if let Ok(v) = row.try_get::<f64, _>(idx) {
        return Some(RawValue::F64(v));
    }
    row.try_get::<f32, _>(idx).ok().map(RawValue::F32)
}

/// TIMESTAMP columns are stored in UTC; DATETIME has no zone.
fn decode_timestamp(row: &MySqlRow, idx: usize) -> Option<RawValue> {
    if let Ok(v) = row.try_get::<DateTime<Utc>, _>(idx) {
        return Some(RawValue::TimestampUtc(v));
    }
    row.try_get::<NaiveDateTime, _>(idx)
        .ok()
        .map(RawValue::NaiveTimestamp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ConnectionParams;

    #[test]
    fn test_ssl_mode_mapping() {
        assert!(matches!(ssl_mode(SslMode::Prefer), MySqlSslMode::Preferred));
        assert!(matches!(ssl_mode(SslMode::VerifyFull), MySqlSslMode::VerifyIdentity));
    }

    /// Runs only when TEST_MYSQL_URL is set.
    #[tokio::test]
    async fn test_live_mysql_integer_widths() {
        let Ok(url) = std::env::var("TEST_MYSQL_URL") else {
            return;
        };
        let config = PoolConfig::from_url("my", &url).unwrap();
        let mut session = MySqlDriver.connect(&config).await.unwrap();
        let rows = session
            .query(
                "SELECT CAST(7 AS UNSIGNED) AS a, CAST(1.50 AS DECIMAL(5,2)) AS b, NULL AS c",
                &[],
            )
            .await
            .unwrap();
        let values = &rows[0].values;
        assert_eq!(values[0].clone().widen(), crate::models::Value::Int(7));
        assert_eq!(values[1], RawValue::Decimal("1.50".into()));
        assert_eq!(values[2], RawValue::Null);
        session.close().await;
    }

    /// Runs only when TEST_MYSQL_URL is set.
    #[tokio::test]
    async fn test_live_mysql_untyped_values_keep_their_bytes() {
        let Ok(url) = std::env::var("TEST_MYSQL_URL") else {
            return;
        };
        let config = PoolConfig::from_url("my", &url).unwrap();
        let mut session = MySqlDriver.connect(&config).await.unwrap();
        let rows = session
            .query("SELECT ST_GeomFromText('POINT(1 1)') AS g", &[])
            .await
            .unwrap();
        assert!(matches!(rows[0].values[0], RawValue::Bytes(_)), "got {:?}", rows[0].values[0]);
        session.close().await;
    }

    #[test]
    fn test_connect_options_build() {
        let params = ConnectionParams::server("localhost", None, "shop");
        let config = PoolConfig::new("my", DatabaseType::MySQL, params);
        let _ = MySqlDriver::connect_options(&config);
    }
}
