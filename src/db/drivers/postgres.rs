//! PostgreSQL driver.

use super::establish;
use crate::db::driver::{Driver, DriverConnection};
use crate::db::params::bind_postgres_param;
use crate::db::types::{RawDecimal, RawRow, RawValue, column_for};
use crate::error::{DbError, DbResult};
use crate::impl_driver_session;
use crate::models::{Column, ColumnType, DatabaseType, PoolConfig, SslMode};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::types::PgInterval;
use sqlx::postgres::{
    PgConnectOptions, PgRow, PgSslMode, PgTypeKind, PgValueFormat, PgValueRef,
};
use sqlx::types::BigDecimal;
use sqlx::{Column as _, ConnectOptions, Decode, Postgres, Row, Type, TypeInfo, ValueRef};
use std::net::IpAddr;

#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDriver;

impl PostgresDriver {
    pub fn connect_options(config: &PoolConfig) -> PgConnectOptions {
        let params = &config.connection;
        let mut options = PgConnectOptions::new()
            .host(&params.host)
            .database(&params.database)
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
            options = options.ssl_root_cert(cert);
        }
        if let Some(cert) = &params.ssl.client_cert {
            options = options.ssl_client_cert(cert);
        }
        if let Some(key) = &params.ssl.client_key {
            options = options.ssl_client_key(key);
        }
        if let Some(name) = &params.application_name {
            options = options.application_name(name);
        }
        options
    }
}

fn ssl_mode(mode: SslMode) -> PgSslMode {
    match mode {
        SslMode::Disable => PgSslMode::Disable,
        SslMode::Prefer => PgSslMode::Prefer,
        SslMode::Require => PgSslMode::Require,
        SslMode::VerifyCa => PgSslMode::VerifyCa,
        SslMode::VerifyFull => PgSslMode::VerifyFull,
    }
}

#[async_trait]
impl Driver for PostgresDriver {
    fn kind(&self) -> DatabaseType {
        DatabaseType::PostgreSQL
    }

    async fn connect(&self, config: &PoolConfig) -> DbResult<Box<dyn DriverConnection>> {
        let options = Self::connect_options(config);
        let conn = establish(config, options.connect()).await?;
        Ok(Box::new(PgSession::new(conn)))
    }
}

impl_driver_session!(
    PgSession,
    sqlx::PgConnection,
    sqlx::Postgres,
    bind_postgres_param,
    decode_row
);

fn decode_row(row: &PgRow) -> DbResult<RawRow> {
    let columns: Vec<_> = row
        .columns()
        .iter()
        .map(|col| column_for(col.name(), col.type_info().name(), DatabaseType::PostgreSQL))
        .collect();
    let values = row
        .columns()
        .iter()
        .zip(&columns)
        .map(|(col, meta)| decode_column(row, col.ordinal(), col.type_info().name(), meta))
        .collect::<DbResult<Vec<_>>>()?;
    Ok(RawRow { columns, values })
}

/// Decode one cell. Values no typed decoder accepts fall back to their text
/// form; a value that has none is an error rather than a silent NULL.
fn decode_column(row: &PgRow, idx: usize, type_name: &str, column: &Column) -> DbResult<RawValue> {
    let raw = row.try_get_raw(idx)?;
    if raw.is_null() {
        return Ok(RawValue::Null);
    }
    let value = match column.column_type {
        ColumnType::Decimal => row.try_get::<RawDecimal, _>(idx).ok().map(|v| RawValue::Decimal(v.0)),
        ColumnType::Integer => decode_integer(row, idx),
        ColumnType::Boolean => row.try_get::<bool, _>(idx).ok().map(RawValue::Bool),
        ColumnType::Float => decode_float(row, idx),
        ColumnType::Binary => row.try_get::<Vec<u8>, _>(idx).ok().map(RawValue::Bytes),
        ColumnType::Json if is_array_type(type_name) => decode_array(row, idx).map(RawValue::Json),
        ColumnType::Json => row
            .try_get::<serde_json::Value, _>(idx)
            .ok()
            .map(RawValue::Json),
        ColumnType::Uuid => row
            .try_get::<sqlx::types::Uuid, _>(idx)
            .ok()
            .map(RawValue::Uuid),
        ColumnType::Timestamp => decode_timestamp(row, idx),
        ColumnType::Date => row.try_get::<NaiveDate, _>(idx).ok().map(RawValue::Date),
        ColumnType::Time => row.try_get::<NaiveTime, _>(idx).ok().map(RawValue::Time),
        ColumnType::Text | ColumnType::Unknown => row.try_get::<String, _>(idx).ok().map(RawValue::Text),
    };
    if let Some(value) = value {
        return Ok(value);
    }

    match raw.format() {
        PgValueFormat::Text => raw
            .as_str()
            .map(|text| RawValue::Text(text.to_string()))
            .map_err(|_| undecodable(&column.name, type_name)),
        PgValueFormat::Binary => {
            decode_binary_text(row, idx, &raw).ok_or_else(|| undecodable(&column.name, type_name))
        }
    }
}

/// Binary values of types without a typed decoder that still have a
/// well-defined text rendering.
fn decode_binary_text(row: &PgRow, idx: usize, raw: &PgValueRef<'_>) -> Option<RawValue> {
    let info = raw.type_info();
    let name = info.name().to_ascii_lowercase();
    let text = match name.as_str() {
        "interval" => row.try_get::<PgInterval, _>(idx).ok().map(|v| format_interval(&v))?,
        "inet" | "cidr" => format_inet(raw.as_bytes().ok()?)?,
        "money" => format_money(raw.as_bytes().ok()?)?,
        "xml" | "citext" | "name" | "bpchar" => std::str::from_utf8(raw.as_bytes().ok()?).ok()?.to_string(),
        _ if matches!(info.kind(), PgTypeKind::Enum(_)) => {
            std::str::from_utf8(raw.as_bytes().ok()?).ok()?.to_string()
        }
        _ => return None,
    };
    Some(RawValue::Text(text))
}

fn undecodable(column: &str, type_name: &str) -> DbError {
    DbError::query(
        format!("Cannot decode column '{column}' of PostgreSQL type {type_name}"),
        None,
        format!("Cast the column to text in the query, e.g. {column}::text"),
    )
}

fn is_array_type(type_name: &str) -> bool {
    type_name.ends_with("[]") || type_name.starts_with('_')
}

fn decode_integer(row: &PgRow, idx: usize) -> Option<RawValue> {
    if let Ok(v) = row.try_get::<i16, _>(idx) {
        return Some(RawValue::I16(v));
    }
    if let Ok(v) = row.try_get::<i32, _>(idx) {
        return Some(RawValue::I32(v));
    }
    if let Ok(v) = row.try_get::<i64, _>(idx) {
        return Some(RawValue::I64(v));
    }
    None
}

fn decode_float(row: &PgRow, idx: usize) -> Option<RawValue> {
    if let Ok(v) = row.try_get::<f64, _>(idx) {
        return Some(RawValue::F64(v));
    }
    row.try_get::<f32, _>(idx).ok().map(RawValue::F32)
}

fn decode_timestamp(row: &PgRow, idx: usize) -> Option<RawValue> {
    if let Ok(v) = row.try_get::<DateTime<Utc>, _>(idx) {
        return Some(RawValue::TimestampUtc(v));
    }
    row.try_get::<NaiveDateTime, _>(idx)
        .ok()
        .map(RawValue::NaiveTimestamp)
}

/// Arrays become JSON arrays; NULL elements stay `null`.
fn decode_array(row: &PgRow, idx: usize) -> Option<JsonValue> {
    array_of::<i16>(row, idx, JsonValue::from)
        .or_else(|| array_of::<i32>(row, idx, JsonValue::from))
        .or_else(|| array_of::<i64>(row, idx, JsonValue::from))
        .or_else(|| array_of::<f32>(row, idx, JsonValue::from))
        .or_else(|| array_of::<f64>(row, idx, JsonValue::from))
        .or_else(|| array_of::<bool>(row, idx, JsonValue::from))
        .or_else(|| array_of::<String>(row, idx, JsonValue::from))
        .or_else(|| array_of::<BigDecimal>(row, idx, |v| JsonValue::String(v.to_plain_string())))
        .or_else(|| array_of::<sqlx::types::Uuid>(row, idx, |v| JsonValue::String(v.to_string())))
        .or_else(|| array_of::<JsonValue>(row, idx, |v| v))
        .or_else(|| array_of::<DateTime<Utc>>(row, idx, |v| JsonValue::String(v.to_rfc3339())))
        .or_else(|| {
            array_of::<NaiveDateTime>(row, idx, |v| JsonValue::String(v.and_utc().to_rfc3339()))
        })
        .or_else(|| array_of::<NaiveDate>(row, idx, |v| JsonValue::String(v.to_string())))
}

fn array_of<T>(row: &PgRow, idx: usize, to_json: impl Fn(T) -> JsonValue) -> Option<JsonValue>
where
    for<'r> Vec<Option<T>>: Decode<'r, Postgres> + Type<Postgres>,
{
    let items = row.try_get::<Vec<Option<T>>, _>(idx).ok()?;
    Some(JsonValue::Array(
        items
            .into_iter()
            .map(|item| item.map_or(JsonValue::Null, &to_json))
            .collect(),
    ))
}

/// Render an interval the way PostgreSQL's default `IntervalStyle` does,
/// e.g. `1 year 2 mons 3 days 04:05:06`.
fn format_interval(interval: &PgInterval) -> String {
    fn unit(value: i32, name: &str, plural: &str) -> Option<String> {
        match value {
            0 => None,
            1 | -1 => Some(format!("{value} {name}")),
            _ => Some(format!("{value} {plural}")),
        }
    }

    let mut parts: Vec<String> = [
        unit(interval.months / 12, "year", "years"),
        unit(interval.months % 12, "mon", "mons"),
        unit(interval.days, "day", "days"),
    ]
    .into_iter()
    .flatten()
    .collect();

    if interval.microseconds != 0 || parts.is_empty() {
        let sign = if interval.microseconds < 0 { "-" } else { "" };
        let micros = interval.microseconds.unsigned_abs();
        let seconds = micros / 1_000_000;
        let mut clock = format!(
            "{sign}{:02}:{:02}:{:02}",
            seconds / 3600,
            seconds / 60 % 60,
            seconds % 60
        );
        let fraction = micros % 1_000_000;
        if fraction > 0 {
            let digits = format!("{fraction:06}");
            clock.push('.');
            clock.push_str(digits.trim_end_matches('0'));
        }
        parts.push(clock);
    }
    parts.join(" ")
}

/// Binary `inet`/`cidr`: family, prefix bits, cidr flag, length, address.
fn format_inet(bytes: &[u8]) -> Option<String> {
    let [family, bits, is_cidr, len, address @ ..] = bytes else {
        return None;
    };
    if address.len() != usize::from(*len) {
        return None;
    }
    let (ip, full) = match (*family, address) {
        (2, &[a, b, c, d]) => (IpAddr::from([a, b, c, d]), 32),
        (3, address) => (IpAddr::from(<[u8; 16]>::try_from(address).ok()?), 128),
        _ => return None,
    };
    if *is_cidr != 0 || *bits != full {
        Some(format!("{ip}/{bits}"))
    } else {
        Some(ip.to_string())
    }
}

/// Binary `money` is an i64 count of cents.
fn format_money(bytes: &[u8]) -> Option<String> {
    let cents = i64::from_be_bytes(bytes.try_into().ok()?);
    let sign = if cents < 0 { "-" } else { "" };
    let cents = cents.unsigned_abs();
    Some(format!("{sign}{}.{:02}", cents / 100, cents % 100))
}
