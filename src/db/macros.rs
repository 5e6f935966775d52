//! Session macros for reducing code duplication.
//!
//! The sqlx-backed sessions differ only in their connection type, their
//! parameter binder and their row decoder. This macro generates the shared
//! [`DriverConnection`](crate::db::driver::DriverConnection) implementation
//! while keeping each backend module linear to read.

/// Generate a driver session type wrapping one sqlx connection.
///
/// # Example
///
/// ```ignore
/// impl_driver_session!(SqliteSession, sqlx::SqliteConnection, sqlx::Sqlite, bind_sqlite_param, decode_row);
/// ```
#[macro_export]
macro_rules! impl_driver_session {
    ($session:ident, $conn:ty, $db:ty, $bind:path, $decode:path) => {
        #[derive(Debug)]
        pub struct $session {
            conn: $conn,
        }

        impl $session {
            pub fn new(conn: $conn) -> Self {
                Self { conn }
            }
        }

        #[async_trait::async_trait]
        impl $crate::db::driver::DriverConnection for $session {
            async fn query(
                &mut self,
                sql: &str,
                params: &[$crate::models::QueryParam],
            ) -> $crate::error::DbResult<Vec<$crate::db::types::RawRow>> {
                // When params is empty, use raw SQL to avoid prepared statement issues
                let rows = if params.is_empty() {
                    sqlx::Executor::fetch_all(&mut self.conn, sql).await?
                } else {
                    let mut query = sqlx::query::<$db>(sql);
                    for param in params {
                        query = $bind(query, param);
                    }
                    query.fetch_all(&mut self.conn).await?
                };
                rows.iter().map($decode).collect()
            }

            async fn execute(
                &mut self,
                sql: &str,
                params: &[$crate::models::QueryParam],
            ) -> $crate::error::DbResult<u64> {
                let result = if params.is_empty() {
                    sqlx::Executor::execute(&mut self.conn, sql).await?
                } else {
                    let mut query = sqlx::query::<$db>(sql);
                    for param in params {
                        query = $bind(query, param);
                    }
                    query.execute(&mut self.conn).await?
                };
                Ok(result.rows_affected())
            }

            fn fetch_stream<'a>(
                &'a mut self,
                sql: &'a str,
                params: &'a [$crate::models::QueryParam],
            ) -> futures_util::stream::BoxStream<
                'a,
                $crate::error::DbResult<$crate::db::types::RawRow>,
            > {
                use futures_util::StreamExt;
                let stream = if params.is_empty() {
                    sqlx::Executor::fetch(&mut self.conn, sql)
                } else {
                    let mut query = sqlx::query::<$db>(sql);
                    for param in params {
                        query = $bind(query, param);
                    }
                    query.fetch(&mut self.conn)
                };
                stream
                    .map(|row| {
                        row.map_err($crate::error::DbError::from)
                            .and_then(|r| $decode(&r))
                    })
                    .boxed()
            }

            async fn probe(&mut self, timeout: std::time::Duration) -> bool {
                matches!(
                    tokio::time::timeout(timeout, sqlx::Connection::ping(&mut self.conn)).await,
                    Ok(Ok(()))
                )
            }

            async fn close(self: Box<Self>) {
                if let Err(e) = sqlx::Connection::close(self.conn).await {
                    tracing::debug!(error = %e, "Error while closing session");
                }
            }
        }
    };
}

pub use impl_driver_session;
