//! Database-agnostic type mappings.
//!
//! This module provides utilities for mapping between database-specific types
//! and the uniform [`TableResult`] format.
//!
//! # Architecture
//!
//! Type conversion uses a two-phase approach:
//! 1. Drivers decode each cell into a [`RawValue`] that keeps the engine's
//!    native width (`i16`, `f32`, naive timestamps, ...), guided by
//!    [`categorize_type`].
//! 2. [`rows_to_table`] normalizes those into [`Value`]s with explicit rules:
//!    - every integer width widens to `i64`; `u64` values above `i64::MAX`
//!      become exact decimals
//!    - `f32` widens to `f64` through its shortest decimal form, so `0.1f32`
//!      stays `0.1`
//!    - offset timestamps convert to UTC; naive timestamps are taken as UTC
//!    - NULL stays at its row/column position

use crate::models::{Column, ColumnType, DatabaseType, TableResult, Value};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::mysql::{MySqlTypeInfo, MySqlValueRef};
use sqlx::postgres::{PgTypeInfo, PgValueFormat, PgValueRef};
use sqlx::types::BigDecimal;
use sqlx::{Decode, Type, TypeInfo};
use std::time::Duration;

// =============================================================================
// Raw driver values
// =============================================================================

/// A cell as decoded by a driver, before normalization.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Null,
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    Decimal(String),
    Text(String),
    Bytes(Vec<u8>),
    Json(JsonValue),
    Uuid(uuid::Uuid),
    NaiveTimestamp(NaiveDateTime),
    TimestampTz(DateTime<FixedOffset>),
    TimestampUtc(DateTime<Utc>),
    Date(NaiveDate),
    Time(NaiveTime),
}

impl RawValue {
    /// Apply the widening and UTC rules.
    pub fn widen(self) -> Value {
        match self {
            RawValue::Null => Value::Null,
            RawValue::Bool(v) => Value::Bool(v),
            RawValue::I8(v) => Value::Int(v.into()),
            RawValue::I16(v) => Value::Int(v.into()),
            RawValue::I32(v) => Value::Int(v.into()),
            RawValue::I64(v) => Value::Int(v),
            RawValue::U8(v) => Value::Int(v.into()),
            RawValue::U16(v) => Value::Int(v.into()),
            RawValue::U32(v) => Value::Int(v.into()),
            RawValue::U64(v) => match i64::try_from(v) {
                Ok(v) => Value::Int(v),
                Err(_) => Value::Decimal(v.to_string()),
            },
            RawValue::F32(v) => Value::Float(v.to_string().parse().unwrap_or(f64::from(v))),
            RawValue::F64(v) => Value::Float(v),
            RawValue::Decimal(v) => Value::Decimal(v),
            RawValue::Text(v) => Value::Text(v),
            RawValue::Bytes(v) => Value::Bytes(v),
            RawValue::Json(v) => Value::Json(v),
            RawValue::Uuid(v) => Value::Text(v.to_string()),
            RawValue::NaiveTimestamp(v) => Value::Timestamp(v.and_utc()),
            RawValue::TimestampTz(v) => Value::Timestamp(v.with_timezone(&Utc)),
            RawValue::TimestampUtc(v) => Value::Timestamp(v),
            RawValue::Date(v) => Value::Date(v),
            RawValue::Time(v) => Value::Time(v),
        }
    }
}

impl From<Value> for RawValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => RawValue::Null,
            Value::Bool(v) => RawValue::Bool(v),
            Value::Int(v) => RawValue::I64(v),
            Value::Float(v) => RawValue::F64(v),
            Value::Decimal(v) => RawValue::Decimal(v),
            Value::Text(v) => RawValue::Text(v),
            Value::Bytes(v) => RawValue::Bytes(v),
            Value::Json(v) => RawValue::Json(v),
            Value::Timestamp(v) => RawValue::TimestampUtc(v),
            Value::Date(v) => RawValue::Date(v),
            Value::Time(v) => RawValue::Time(v),
        }
    }
}

/// One decoded row with the column metadata it was decoded against.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRow {
    pub columns: Vec<Column>,
    pub values: Vec<RawValue>,
}

// =============================================================================
// Decimal Type Support
// =============================================================================

/// Wrapper type for raw DECIMAL/NUMERIC values as strings.
/// This preserves the exact database representation.
#[derive(Debug)]
pub struct RawDecimal(pub String);

impl Type<sqlx::MySql> for RawDecimal {
    fn type_info() -> MySqlTypeInfo {
        <String as Type<sqlx::MySql>>::type_info()
    }

    fn compatible(ty: &MySqlTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name.contains("decimal") || name.contains("numeric")
    }
}

impl<'r> Decode<'r, sqlx::MySql> for RawDecimal {
    fn decode(value: MySqlValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as Decode<sqlx::MySql>>::decode(value)?;
        Ok(RawDecimal(s.to_string()))
    }
}

impl Type<sqlx::Postgres> for RawDecimal {
    fn type_info() -> PgTypeInfo {
        <String as Type<sqlx::Postgres>>::type_info()
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name.contains("numeric") || name.contains("decimal")
    }
}

/// Binary NUMERIC header: ndigits, weight, sign, dscale (all 16-bit).
const PG_NUMERIC_NAN: u16 = 0xC000;
const PG_NUMERIC_POS_INF: u16 = 0xD000;
const PG_NUMERIC_NEG_INF: u16 = 0xF000;

impl<'r> Decode<'r, sqlx::Postgres> for RawDecimal {
    fn decode(value: PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        if matches!(value.format(), PgValueFormat::Text) {
            return Ok(RawDecimal(value.as_str()?.to_string()));
        }

        let bytes = value.as_bytes()?;
        let word = |at: usize| bytes.get(at..at + 2).map(|w| u16::from_be_bytes([w[0], w[1]]));
        match word(4) {
            Some(PG_NUMERIC_NAN) => return Ok(RawDecimal("NaN".into())),
            Some(PG_NUMERIC_POS_INF) => return Ok(RawDecimal("Infinity".into())),
            Some(PG_NUMERIC_NEG_INF) => return Ok(RawDecimal("-Infinity".into())),
            _ => {}
        }
        let scale = word(6).ok_or("truncated NUMERIC value")?;
        let decimal = <BigDecimal as Decode<sqlx::Postgres>>::decode(value)?;
        Ok(RawDecimal(decimal.with_scale(i64::from(scale)).to_plain_string()))
    }
}

// =============================================================================
// Row conversion
// =============================================================================

/// Normalize driver rows into a table.
///
/// Columns come from the first row. A column the driver could not classify
/// takes the type of its first non-null value.
pub fn rows_to_table(rows: Vec<RawRow>, execution_time: Duration) -> TableResult {
    let mut iter = rows.into_iter();
    let Some(first) = iter.next() else {
        return TableResult {
            execution_time_ms: execution_time.as_millis() as u64,
            ..TableResult::empty()
        };
    };

    let mut columns = first.columns;
    let mut table_rows = Vec::with_capacity(iter.size_hint().0 + 1);
    table_rows.push(first.values.into_iter().map(RawValue::widen).collect::<Vec<_>>());
    table_rows.extend(iter.map(|row| {
        row.values
            .into_iter()
            .map(RawValue::widen)
            .collect::<Vec<_>>()
    }));

    for (idx, column) in columns.iter_mut().enumerate() {
        if column.column_type != ColumnType::Unknown {
            continue;
        }
        if let Some(inferred) = table_rows
            .iter()
            .filter_map(|r| r.get(idx))
            .find_map(ColumnType::of)
        {
            column.column_type = inferred;
        }
    }

    TableResult {
        columns,
        rows: table_rows,
        execution_time_ms: execution_time.as_millis() as u64,
    }
}

/// Turn a table back into driver-shaped rows (already widened).
pub fn table_to_rows(table: &TableResult) -> Vec<RawRow> {
    table
        .rows
        .iter()
        .map(|row| RawRow {
            columns: table.columns.clone(),
            values: row.iter().cloned().map(RawValue::from).collect(),
        })
        .collect()
}

// =============================================================================
// Type Classification
// =============================================================================

/// Classify a database type name into a logical column type.
pub fn categorize_type(type_name: &str, db: DatabaseType) -> ColumnType {
    let lower = type_name.to_lowercase();

    // PostgreSQL arrays ("INT4[]", or "_name" for types sqlx has no name for)
    if lower.ends_with("[]") || (db == DatabaseType::PostgreSQL && lower.starts_with('_')) {
        return ColumnType::Json;
    }

    if db == DatabaseType::MSSQL {
        match lower.as_str() {
            "bit" => return ColumnType::Boolean,
            "money" | "smallmoney" => return ColumnType::Decimal,
            "uniqueidentifier" => return ColumnType::Uuid,
            "image" => return ColumnType::Binary,
            "xml" | "sql_variant" => return ColumnType::Text,
            _ => {}
        }
    }

    // Decimal/Numeric - check first as it overlaps with "numeric" in float checks
    if lower.contains("decimal") || lower.contains("numeric") {
        // SQLite's NUMERIC is actually a float
        if db == DatabaseType::SQLite && lower == "numeric" {
            return ColumnType::Float;
        }
        return ColumnType::Decimal;
    }

    // Date/time before integers: "interval" and "point" contain "int"
    if lower.contains("timestamp") || lower.contains("datetime") {
        return ColumnType::Timestamp;
    }
    if lower == "date" {
        return ColumnType::Date;
    }
    if lower == "time" || lower == "timetz" {
        return ColumnType::Time;
    }
    if lower.starts_with("interval") || lower.contains("point") {
        return ColumnType::Text;
    }

    // Boolean (MySQL reports TINYINT(1) as BOOLEAN)
    if lower == "bool" || lower == "boolean" {
        return ColumnType::Boolean;
    }

    // Integer types
    if lower.contains("int") || lower.contains("serial") || lower.contains("tiny") {
        return ColumnType::Integer;
    }

    // Float types
    if lower.contains("float") || lower.contains("double") || lower == "real" {
        return ColumnType::Float;
    }

    // JSON types
    if lower == "json" || lower == "jsonb" {
        return ColumnType::Json;
    }

    // UUID (PostgreSQL)
    if lower == "uuid" {
        return ColumnType::Uuid;
    }

    // Binary types
    if lower.contains("blob") || lower.contains("binary") || lower == "bytea" {
        return ColumnType::Binary;
    }

    if lower.contains("char") || lower.contains("text") || lower == "string" || lower == "enum" {
        return ColumnType::Text;
    }

    // SQLite NULL-typed expressions and anything exotic
    ColumnType::Unknown
}

// =============================================================================
// Type Normalization
// =============================================================================

/// Normalize a database type name to a more consistent format.
pub fn normalize_type_name(type_name: &str) -> String {
    let lower = type_name.to_lowercase();

    match lower.as_str() {
        // Integers
        "int4" | "integer" | "int" => "integer".to_string(),
        "int8" | "bigint" | "bigserial" => "bigint".to_string(),
        "int2" | "smallint" => "smallint".to_string(),
        "tinyint" | "tiny" => "tinyint".to_string(),
        // Text
        "varchar" | "character varying" | "text" | "string" => "text".to_string(),
        "char" | "character" | "bpchar" => "char".to_string(),
        // Boolean
        "bool" | "boolean" => "boolean".to_string(),
        // Float
        "float4" | "real" | "float" => "real".to_string(),
        "float8" | "double precision" | "double" => "double".to_string(),
        // Binary
        "bytea" | "blob" | "binary" | "varbinary" => "binary".to_string(),
        // Date/Time
        "timestamp" | "timestamptz" | "datetime" => "timestamp".to_string(),
        "date" => "date".to_string(),
        "time" | "timetz" => "time".to_string(),
        // JSON
        "json" | "jsonb" => "json".to_string(),
        // UUID
        "uuid" => "uuid".to_string(),
        // Default
        _ => lower,
    }
}

/// Column metadata for a driver-reported type name.
pub fn column_for(name: &str, type_name: &str, db: DatabaseType) -> Column {
    Column::new(name, categorize_type(type_name, db), normalize_type_name(type_name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_categorize_type_integer() {
        assert_eq!(categorize_type("INT", DatabaseType::MySQL), ColumnType::Integer);
        assert_eq!(
            categorize_type("BIGINT", DatabaseType::PostgreSQL),
            ColumnType::Integer
        );
        assert_eq!(categorize_type("TINYINT", DatabaseType::MySQL), ColumnType::Integer);
        assert_eq!(
            categorize_type("SERIAL", DatabaseType::PostgreSQL),
            ColumnType::Integer
        );
    }

    #[test]
    fn test_categorize_type_decimal() {
        assert_eq!(categorize_type("DECIMAL", DatabaseType::MySQL), ColumnType::Decimal);
        assert_eq!(
            categorize_type("NUMERIC", DatabaseType::PostgreSQL),
            ColumnType::Decimal
        );
        // SQLite NUMERIC is a float
        assert_eq!(categorize_type("numeric", DatabaseType::SQLite), ColumnType::Float);
    }

    #[test]
    fn test_categorize_type_temporal() {
        assert_eq!(
            categorize_type("TIMESTAMPTZ", DatabaseType::PostgreSQL),
            ColumnType::Timestamp
        );
        assert_eq!(categorize_type("DATETIME", DatabaseType::SQLite), ColumnType::Timestamp);
        assert_eq!(categorize_type("DATE", DatabaseType::MySQL), ColumnType::Date);
        assert_eq!(categorize_type("TIME", DatabaseType::MySQL), ColumnType::Time);
        assert_eq!(
            categorize_type("INTERVAL", DatabaseType::PostgreSQL),
            ColumnType::Text
        );
    }

    #[test]
    fn test_categorize_type_misc() {
        assert_eq!(categorize_type("jsonb", DatabaseType::PostgreSQL), ColumnType::Json);
        assert_eq!(categorize_type("BOOLEAN", DatabaseType::MySQL), ColumnType::Boolean);
        assert_eq!(categorize_type("VARCHAR", DatabaseType::MySQL), ColumnType::Text);
        assert_eq!(categorize_type("NULL", DatabaseType::SQLite), ColumnType::Unknown);
    }

    #[test]
    fn test_categorize_arrays_before_element_type() {
        assert_eq!(categorize_type("INT4[]", DatabaseType::PostgreSQL), ColumnType::Json);
        assert_eq!(categorize_type("NUMERIC[]", DatabaseType::PostgreSQL), ColumnType::Json);
        assert_eq!(categorize_type("_int4", DatabaseType::PostgreSQL), ColumnType::Json);
        assert_eq!(categorize_type("INET", DatabaseType::PostgreSQL), ColumnType::Unknown);
    }

    #[test]
    fn test_categorize_sql_server_types() {
        let mssql = DatabaseType::MSSQL;
        assert_eq!(categorize_type("bit", mssql), ColumnType::Boolean);
        assert_eq!(categorize_type("money", mssql), ColumnType::Decimal);
        assert_eq!(categorize_type("uniqueidentifier", mssql), ColumnType::Uuid);
        assert_eq!(categorize_type("datetime2", mssql), ColumnType::Timestamp);
        assert_eq!(categorize_type("datetimeoffset", mssql), ColumnType::Timestamp);
        assert_eq!(categorize_type("nvarchar", mssql), ColumnType::Text);
        assert_eq!(categorize_type("varbinary", mssql), ColumnType::Binary);
        // BIT is a bit field elsewhere
        assert_eq!(categorize_type("BIT", DatabaseType::MySQL), ColumnType::Unknown);
    }

    #[test]
    fn test_normalize_type_name() {
        assert_eq!(normalize_type_name("INT4"), "integer");
        assert_eq!(normalize_type_name("VARCHAR"), "text");
        assert_eq!(normalize_type_name("FLOAT8"), "double");
        assert_eq!(normalize_type_name("BYTEA"), "binary");
        assert_eq!(normalize_type_name("TIMESTAMPTZ"), "timestamp");
    }

    #[test]
    fn test_integer_widening() {
        assert_eq!(RawValue::I16(-7).widen(), Value::Int(-7));
        assert_eq!(RawValue::U32(u32::MAX).widen(), Value::Int(u32::MAX as i64));
        assert_eq!(RawValue::U64(42).widen(), Value::Int(42));
        assert_eq!(
            RawValue::U64(u64::MAX).widen(),
            Value::Decimal("18446744073709551615".to_string())
        );
    }

    #[test]
    fn test_float_widening_keeps_decimal_form() {
        assert_eq!(RawValue::F32(0.1).widen(), Value::Float(0.1));
        assert_eq!(RawValue::F64(2.5).widen(), Value::Float(2.5));
    }

    #[test]
    fn test_timestamps_normalize_to_utc() {
        let offset = FixedOffset::east_opt(2 * 3600).unwrap();
        let local = offset.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let expected = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        assert_eq!(RawValue::TimestampTz(local).widen(), Value::Timestamp(expected));

        let naive = expected.naive_utc();
        assert_eq!(RawValue::NaiveTimestamp(naive).widen(), Value::Timestamp(expected));
    }

    #[test]
    fn test_empty_rows_make_empty_table() {
        let table = rows_to_table(Vec::new(), Duration::from_millis(3));
        assert!(table.columns.is_empty());
        assert!(table.rows.is_empty());
        assert_eq!(table.execution_time_ms, 3);
    }

    #[test]
    fn test_unknown_column_type_inferred_from_values() {
        let columns = vec![Column::new("x", ColumnType::Unknown, "null")];
        let rows = vec![
            RawRow {
                columns: columns.clone(),
                values: vec![RawValue::Null],
            },
            RawRow {
                columns,
                values: vec![RawValue::I32(5)],
            },
        ];
        let table = rows_to_table(rows, Duration::ZERO);
        assert_eq!(table.columns[0].column_type, ColumnType::Integer);
        assert_eq!(table.rows, vec![vec![Value::Null], vec![Value::Int(5)]]);
    }

    #[test]
    fn test_round_trip_preserves_shape() {
        let columns = vec![
            column_for("id", "INT4", DatabaseType::PostgreSQL),
            column_for("score", "FLOAT4", DatabaseType::PostgreSQL),
            column_for("name", "TEXT", DatabaseType::PostgreSQL),
            column_for("seen_at", "TIMESTAMP", DatabaseType::PostgreSQL),
            column_for("note", "TEXT", DatabaseType::PostgreSQL),
        ];
        let ts = NaiveDate::from_ymd_opt(2023, 12, 31)
            .unwrap()
            .and_hms_opt(23, 59, 58)
            .unwrap();
        let rows = vec![
            RawRow {
                columns: columns.clone(),
                values: vec![
                    RawValue::I32(1),
                    RawValue::F32(1.25),
                    RawValue::Text("alpha".into()),
                    RawValue::NaiveTimestamp(ts),
                    RawValue::Null,
                ],
            },
            RawRow {
                columns: columns.clone(),
                values: vec![
                    RawValue::I32(2),
                    RawValue::Null,
                    RawValue::Null,
                    RawValue::Null,
                    RawValue::Text("beta".into()),
                ],
            },
        ];

        let table = rows_to_table(rows, Duration::ZERO);
        let again = rows_to_table(table_to_rows(&table), Duration::ZERO);

        assert_eq!(again, table);
        let names: Vec<_> = again.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["id", "score", "name", "seen_at", "note"]);
        assert_eq!(again.rows[0][3], Value::Timestamp(ts.and_utc()));
        assert!(again.rows[0][4].is_null());
        assert!(again.rows[1][1].is_null() && again.rows[1][2].is_null());
    }
}
