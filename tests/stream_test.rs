//! Integration tests for chunked result streaming.

mod common;

use common::{MemoryDriver, memory_manager, memory_pool};
use dbpool::DbError;
use dbpool::config::DeploymentMode;
use dbpool::models::{ConnectionParams, DatabaseType, PoolConfig, QueryParam, Value};
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;

#[tokio::test(start_paused = true)]
async fn test_rows_are_fetched_only_on_demand() {
    let driver = MemoryDriver::new();
    let manager = memory_manager(&driver, DeploymentMode::Standalone);
    manager.create_pool(memory_pool("main", 1, 1)).await.unwrap();

    let mut stream = manager.query_stream("main", "ROWS 10", &[], 3).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(driver.script.rows_produced(), 0);

    let first = stream.next_chunk().await.unwrap().unwrap();
    assert_eq!(first.rows.len(), 3);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(driver.script.rows_produced(), 3);

    let mut sizes = vec![first.rows.len()];
    while let Some(chunk) = stream.next_chunk().await.unwrap() {
        sizes.push(chunk.rows.len());
    }
    assert_eq!(sizes, vec![3, 3, 3, 1]);

    // Finished streams stay finished
    assert!(stream.next_chunk().await.unwrap().is_none());

    tokio::time::sleep(Duration::from_millis(10)).await;
    let status = manager.get_status("main").unwrap();
    assert_eq!(status.checked_out, 0);
    assert_eq!(status.broken_total, 0);

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_dropping_stream_early_discards_session() {
    let driver = MemoryDriver::new();
    let manager = memory_manager(&driver, DeploymentMode::Standalone);
    manager.create_pool(memory_pool("main", 1, 1)).await.unwrap();

    let mut stream = manager.query_stream("main", "ROWS 100", &[], 10).await.unwrap();
    stream.next_chunk().await.unwrap().unwrap();
    assert_eq!(manager.get_status("main").unwrap().checked_out, 1);

    drop(stream);
    tokio::time::sleep(Duration::from_millis(10)).await;

    let status = manager.get_status("main").unwrap();
    assert_eq!(status.checked_out, 0);
    assert_eq!(status.broken_total, 1);
    assert_eq!(driver.script.rows_produced(), 10);

    // The pool opens a fresh session for the next caller
    assert!(manager.query("main", "WHOAMI", &[]).await.is_ok());
    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_stream_error_ends_stream() {
    let driver = MemoryDriver::new();
    let manager = memory_manager(&driver, DeploymentMode::Standalone);
    manager.create_pool(memory_pool("main", 1, 1)).await.unwrap();

    let mut stream = manager.query_stream("main", "FAIL", &[], 5).await.unwrap();
    let err = stream.next_chunk().await.unwrap_err();
    assert!(matches!(err, DbError::Query { .. }));
    assert!(stream.next_chunk().await.unwrap().is_none());

    tokio::time::sleep(Duration::from_millis(10)).await;
    let status = manager.get_status("main").unwrap();
    assert_eq!(status.checked_out, 0);
    assert_eq!(status.broken_total, 0);

    let metrics = manager.get_metrics("main").unwrap();
    assert_eq!(metrics.queries_failed, 1);
    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_stream_checks_out_before_returning() {
    let driver = MemoryDriver::new();
    let manager = Arc::new(memory_manager(&driver, DeploymentMode::Standalone));
    manager.create_pool(memory_pool("main", 1, 1)).await.unwrap();

    let busy = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.query("main", "SLEEP 2000", &[]).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    let err = manager
        .query_stream("main", "ROWS 5", &[], 2)
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::PoolExhausted { .. }), "got {err:?}");

    busy.await.unwrap().unwrap();
    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_zero_chunk_size_rejected() {
    let driver = MemoryDriver::new();
    let manager = memory_manager(&driver, DeploymentMode::Standalone);
    manager.create_pool(memory_pool("main", 1, 1)).await.unwrap();

    let err = manager
        .query_stream("main", "ROWS 5", &[], 0)
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::InvalidInput { .. }));
    assert_eq!(manager.get_status("main").unwrap().checked_out, 0);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_stream_over_sqlite_file() {
    let temp_file = NamedTempFile::new().unwrap();
    let db_path = temp_file.path().to_str().unwrap().to_string();
    let manager = dbpool::PoolManager::new(common::fast_options(DeploymentMode::Standalone)).unwrap();
    let config = PoolConfig::new("db", DatabaseType::SQLite, ConnectionParams::sqlite(db_path))
        .with_sizing(1, 1);
    manager.create_pool(config).await.unwrap();

    manager
        .execute("db", "CREATE TABLE nums (n INTEGER)", &[])
        .await
        .unwrap();
    for n in 1..=5i64 {
        manager
            .execute("db", "INSERT INTO nums (n) VALUES (?)", &[QueryParam::from(n)])
            .await
            .unwrap();
    }

    let stream = manager
        .query_stream("db", "SELECT n FROM nums ORDER BY n", &[], 2)
        .await
        .unwrap();
    let chunks: Vec<_> = stream.into_stream().collect().await;

    let sizes: Vec<usize> = chunks
        .iter()
        .map(|c| c.as_ref().unwrap().rows.len())
        .collect();
    assert_eq!(sizes, vec![2, 2, 1]);

    let values: Vec<Value> = chunks
        .into_iter()
        .flat_map(|c| c.unwrap().rows)
        .map(|mut row| row.remove(0))
        .collect();
    assert_eq!(values, (1..=5).map(Value::Int).collect::<Vec<_>>());

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_removing_pool_ends_open_stream() {
    let driver = MemoryDriver::new();
    let manager = memory_manager(&driver, DeploymentMode::Standalone);
    manager.create_pool(memory_pool("main", 1, 1)).await.unwrap();

    let mut stream = manager.query_stream("main", "ROWS 100", &[], 10).await.unwrap();
    stream.next_chunk().await.unwrap().unwrap();

    // The open stream holds the only session past the 2s drain grace
    manager.remove_pool("main").await.unwrap();

    let err = stream.next_chunk().await.unwrap_err();
    assert!(matches!(err, DbError::PoolClosed { .. }), "got {err:?}");

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(driver.script.closed.load(std::sync::atomic::Ordering::SeqCst), 1);
    manager.shutdown().await;
}
