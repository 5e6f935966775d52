//! Integration tests for the uniform table format over SQLite.

use chrono::{TimeZone, Utc};
use dbpool::PoolManager;
use dbpool::config::{DeploymentMode, HealthConfig, ManagerOptions, RetryPolicy};
use dbpool::models::{
    ColumnType, ConnectionParams, DatabaseType, PoolConfig, QueryParam, QueryRequest, Value,
};
use std::time::Duration;
use tempfile::NamedTempFile;

async fn manager_with_file(temp_file: &NamedTempFile) -> PoolManager {
    let options = ManagerOptions::new(
        DeploymentMode::Standalone,
        HealthConfig::new(Duration::from_secs(30), Duration::from_secs(2), 3, 2),
        RetryPolicy::no_retry(),
    );
    let manager = PoolManager::new(options).unwrap();
    let path = temp_file.path().to_str().unwrap();
    let config = PoolConfig::new("db", DatabaseType::SQLite, ConnectionParams::sqlite(path));
    manager.create_pool(config).await.unwrap();
    manager
}

#[tokio::test]
async fn test_values_round_trip_through_table() {
    let temp_file = NamedTempFile::new().unwrap();
    let manager = manager_with_file(&temp_file).await;

    manager
        .execute(
            "db",
            "CREATE TABLE readings (id INTEGER, score REAL, label TEXT, ok BOOLEAN, \
             taken_at TIMESTAMP, payload BLOB, note TEXT)",
            &[],
        )
        .await
        .unwrap();

    let taken_at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap();
    let insert = QueryRequest::new(
        "db",
        "INSERT INTO readings VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .with_param(7i64)
    .with_param(2.5f64)
    .with_param("north")
    .with_param(true)
    .with_param(taken_at)
    .with_param(QueryParam::Bytes(vec![0xde, 0xad]))
    .with_param(QueryParam::Null);
    let written = manager.execute_request(&insert).await.unwrap();
    assert_eq!(written.rows_affected, 1);

    let table = manager
        .query("db", "SELECT * FROM readings", &[])
        .await
        .unwrap();

    let names: Vec<&str> = table.columns.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(
        names,
        vec!["id", "score", "label", "ok", "taken_at", "payload", "note"]
    );
    assert_eq!(table.columns[0].column_type, ColumnType::Integer);
    assert_eq!(table.columns[1].column_type, ColumnType::Float);
    assert_eq!(table.columns[4].column_type, ColumnType::Timestamp);

    assert_eq!(table.rows.len(), 1);
    let row = &table.rows[0];
    assert_eq!(row[0], Value::Int(7));
    assert_eq!(row[1], Value::Float(2.5));
    assert_eq!(row[2], Value::Text("north".into()));
    assert_eq!(row[3], Value::Bool(true));
    assert_eq!(row[4].as_timestamp(), Some(taken_at));
    assert_eq!(row[5], Value::Bytes(vec![0xde, 0xad]));
    assert!(row[6].is_null());

    manager.shutdown().await;
}

#[tokio::test]
async fn test_nulls_keep_their_position() {
    let temp_file = NamedTempFile::new().unwrap();
    let manager = manager_with_file(&temp_file).await;

    manager
        .execute("db", "CREATE TABLE pairs (a INTEGER, b TEXT)", &[])
        .await
        .unwrap();
    for (a, b) in [(Some(1i64), None), (None, Some("x")), (Some(3), Some("y"))] {
        let a = a.map(QueryParam::from).unwrap_or(QueryParam::Null);
        let b = b.map(QueryParam::from).unwrap_or(QueryParam::Null);
        manager
            .execute("db", "INSERT INTO pairs (a, b) VALUES (?, ?)", &[a, b])
            .await
            .unwrap();
    }

    let table = manager
        .query("db", "SELECT a, b FROM pairs ORDER BY rowid", &[])
        .await
        .unwrap();

    assert_eq!(
        table.rows,
        vec![
            vec![Value::Int(1), Value::Null],
            vec![Value::Null, Value::Text("x".into())],
            vec![Value::Int(3), Value::Text("y".into())],
        ]
    );
    manager.shutdown().await;
}

#[tokio::test]
async fn test_empty_result_has_no_rows() {
    let temp_file = NamedTempFile::new().unwrap();
    let manager = manager_with_file(&temp_file).await;

    manager
        .execute("db", "CREATE TABLE empty (id INTEGER)", &[])
        .await
        .unwrap();
    let table = manager
        .query("db", "SELECT id FROM empty", &[])
        .await
        .unwrap();

    assert!(table.rows.is_empty());
    manager.shutdown().await;
}
