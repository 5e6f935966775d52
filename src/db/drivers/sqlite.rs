//! SQLite driver.
//!
//! SQLite is dynamically typed: declared column types are only hints, so
//! values are decoded by their storage class unless the declared type asks for
//! something richer (booleans, dates, JSON).

use super::establish;
use crate::db::driver::{Driver, DriverConnection};
use crate::db::params::bind_sqlite_param;
use crate::db::types::{RawRow, RawValue, column_for};
use crate::error::{DbError, DbResult};
use crate::impl_driver_session;
use crate::models::{ColumnType, DatabaseType, PoolConfig};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use sqlx::sqlite::{SqliteConnectOptions, SqliteRow};
use sqlx::{Column as _, ConnectOptions, Row, TypeInfo, ValueRef};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDriver;

impl SqliteDriver {
    pub fn connect_options(config: &PoolConfig) -> DbResult<SqliteConnectOptions> {
        let path = config.connection.database.as_str();
        let options = if path == ":memory:" {
            SqliteConnectOptions::from_str("sqlite::memory:")
                .map_err(|e| DbError::config(format!("Invalid SQLite options: {e}")))?
        } else {
            SqliteConnectOptions::new().filename(path)
        };
        Ok(options.create_if_missing(config.connection.create_if_missing))
    }
}

#[async_trait]
impl Driver for SqliteDriver {
    fn kind(&self) -> DatabaseType {
        DatabaseType::SQLite
    }

    async fn connect(&self, config: &PoolConfig) -> DbResult<Box<dyn DriverConnection>> {
        let options = Self::connect_options(config)?;
        let conn = establish(config, options.connect()).await?;
        Ok(Box::new(SqliteSession::new(conn)))
    }
}

impl_driver_session!(
    SqliteSession,
    sqlx::SqliteConnection,
    sqlx::Sqlite,
    bind_sqlite_param,
    decode_row
);

fn decode_row(row: &SqliteRow) -> DbResult<RawRow> {
    let columns: Vec<_> = row
        .columns()
        .iter()
        .map(|col| column_for(col.name(), col.type_info().name(), DatabaseType::SQLite))
        .collect();
    let values = columns
        .iter()
        .enumerate()
        .map(|(idx, col)| decode_column(row, idx, col.column_type))
        .collect::<DbResult<Vec<_>>>()?;
    Ok(RawRow { columns, values })
}

fn decode_column(row: &SqliteRow, idx: usize, category: ColumnType) -> DbResult<RawValue> {
    let raw = row.try_get_raw(idx)?;
    if raw.is_null() {
        return Ok(RawValue::Null);
    }
    let storage = raw.type_info().name().to_ascii_uppercase();

    let hinted = match category {
        ColumnType::Boolean => row.try_get::<bool, _>(idx).ok().map(RawValue::Bool),
        ColumnType::Timestamp => decode_timestamp(row, idx),
        ColumnType::Date => row.try_get::<NaiveDate, _>(idx).ok().map(RawValue::Date),
        ColumnType::Time => row.try_get::<NaiveTime, _>(idx).ok().map(RawValue::Time),
        ColumnType::Json => row
            .try_get::<String, _>(idx)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .map(RawValue::Json),
        ColumnType::Decimal => decode_storage(row, idx, &storage)?.map(|v| match v {
            RawValue::I64(i) => RawValue::Decimal(i.to_string()),
            RawValue::F64(f) => RawValue::Decimal(f.to_string()),
            RawValue::Text(s) => RawValue::Decimal(s),
            other => other,
        }),
        _ => None,
    };

    match hinted {
        Some(value) => Ok(value),
        None => decode_storage(row, idx, &storage)?.ok_or_else(|| {
            DbError::query(
                format!("Cannot decode column {idx} with SQLite storage class {storage}"),
                None,
                "Cast the column to TEXT in the query",
            )
        }),
    }
}

fn decode_timestamp(row: &SqliteRow, idx: usize) -> Option<RawValue> {
    if let Ok(v) = row.try_get::<NaiveDateTime, _>(idx) {
        return Some(RawValue::NaiveTimestamp(v));
    }
    row.try_get::<DateTime<FixedOffset>, _>(idx)
        .ok()
        .map(RawValue::TimestampTz)
}

/// Decode by storage class (INTEGER, REAL, TEXT, BLOB).
fn decode_storage(row: &SqliteRow, idx: usize, storage: &str) -> DbResult<Option<RawValue>> {
    let value = match storage {
        "INTEGER" => RawValue::I64(row.try_get::<i64, _>(idx)?),
        "REAL" => RawValue::F64(row.try_get::<f64, _>(idx)?),
        "BLOB" => RawValue::Bytes(row.try_get::<Vec<u8>, _>(idx)?),
        "TEXT" => RawValue::Text(row.try_get::<String, _>(idx)?),
        _ => return Ok(None),
    };
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ConnectionParams;

    fn config_for(path: &str) -> PoolConfig {
        PoolConfig::new("lite", DatabaseType::SQLite, ConnectionParams::sqlite(path))
    }

    #[tokio::test]
    async fn test_memory_session_query_and_execute() {
        let mut session = SqliteDriver.connect(&config_for(":memory:")).await.unwrap();
        session
            .execute(
                "CREATE TABLE t (id INTEGER, score REAL, name TEXT, flag BOOLEAN, seen DATETIME)",
                &[],
            )
            .await
            .unwrap();
        let affected = session
            .execute(
                "INSERT INTO t VALUES (?, ?, ?, ?, ?)",
                &[1i64.into(), 2.5f64.into(), "x".into(), true.into(), "2024-01-02 03:04:05".into()],
            )
            .await
            .unwrap();
        assert_eq!(affected, 1);

        let rows = session.query("SELECT * FROM t", &[]).await.unwrap();
        assert_eq!(rows.len(), 1);
        let values = &rows[0].values;
        assert_eq!(values[0], RawValue::I64(1));
        assert_eq!(values[1], RawValue::F64(2.5));
        assert_eq!(values[2], RawValue::Text("x".into()));
        assert_eq!(values[3], RawValue::Bool(true));
        assert!(matches!(values[4], RawValue::NaiveTimestamp(_)));
        session.close().await;
    }

    #[tokio::test]
    async fn test_expression_columns_decode_by_storage() {
        let mut session = SqliteDriver.connect(&config_for(":memory:")).await.unwrap();
        let rows = session
            .query("SELECT 1 AS a, 'b' AS b, NULL AS c, 1.5 AS d", &[])
            .await
            .unwrap();
        assert_eq!(
            rows[0].values,
            vec![
                RawValue::I64(1),
                RawValue::Text("b".into()),
                RawValue::Null,
                RawValue::F64(1.5)
            ]
        );
    }

    #[tokio::test]
    async fn test_probe_live_session() {
        let mut session = SqliteDriver.connect(&config_for(":memory:")).await.unwrap();
        assert!(session.probe(std::time::Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_missing_file_without_create_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.db");
        let mut config = config_for(path.to_str().unwrap());
        config.connection.create_if_missing = false;
        let err = SqliteDriver.connect(&config).await.unwrap_err();
        assert!(matches!(err, DbError::Connection { .. }));
    }
}
