//! PostgreSQL database client implementation.
//!
//! Provides the `PostgresClient` struct that implements the `DatabaseClient`
//! trait over one dedicated sqlx connection. The backend pid is recorded at
//! connect time so a running statement can be cancelled from a side channel.

use crate::config::ConnectionConfig;
use crate::db::{
    map_sqlx_error, Column, ColumnInfo, DatabaseClient, EngineKind, ExecutionLimits,
    ExecutionResult, ForeignKey, ResultCollector, Row, Schema, Table, Value,
};
use crate::error::{CopilotError, Result};
use async_trait::async_trait;
use futures::TryStreamExt;
use sqlx::postgres::{PgConnection, PgRow};
use sqlx::{Column as SqlxColumn, Connection, Either, Executor, Row as SqlxRow, TypeInfo};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Maximum number of connection retry attempts.
const MAX_RETRY_ATTEMPTS: u32 = 3;

/// Base delay between retry attempts (doubles each retry).
const RETRY_BASE_DELAY_MS: u64 = 500;

/// PostgreSQL database client.
#[derive(Debug)]
pub struct PostgresClient {
    conn: Mutex<Option<PgConnection>>,
    conn_str: String,
    backend_pid: i32,
}

impl PostgresClient {
    pub async fn connect(config: &ConnectionConfig, password: Option<&str>) -> Result<Self> {
        let conn_str = config.to_connection_string(password)?;

        let mut last_error = None;
        let mut delay = Duration::from_millis(RETRY_BASE_DELAY_MS);

        for attempt in 1..=MAX_RETRY_ATTEMPTS {
            debug!(attempt, max = MAX_RETRY_ATTEMPTS, "Postgres connection attempt");

            match PgConnection::connect(&conn_str).await {
                Ok(mut conn) => {
                    let backend_pid: i32 = sqlx::query_scalar("SELECT pg_backend_pid()")
                        .fetch_one(&mut conn)
                        .await
                        .map_err(map_sqlx_error)?;
                    debug!(backend_pid, "Connected to PostgreSQL");
                    return Ok(Self {
                        conn: Mutex::new(Some(conn)),
                        conn_str,
                        backend_pid,
                    });
                }
                Err(e) => {
                    let transient = is_transient_error(&e);
                    last_error = Some(e);

                    if attempt < MAX_RETRY_ATTEMPTS && transient {
                        warn!(
                            attempt,
                            "Connection attempt failed (transient error), retrying in {:?}", delay
                        );
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    } else {
                        break;
                    }
                }
            }
        }

        Err(match last_error {
            Some(e) => map_connection_error(e, config),
            None => CopilotError::connect_failed("no connection attempt was made"),
        })
    }

    pub fn backend_pid(&self) -> i32 {
        self.backend_pid
    }

    fn closed() -> CopilotError {
        CopilotError::connect_failed("handle is closed")
    }

    async fn fetch_tables(conn: &mut PgConnection) -> Result<Vec<Table>> {
        let columns: Vec<(String, String, String, String)> = sqlx::query_as(
            r#"
            SELECT
                c.table_name::text,
                c.column_name::text,
                c.data_type::text,
                c.is_nullable::text
            FROM information_schema.columns c
            JOIN information_schema.tables t
                ON t.table_name = c.table_name AND t.table_schema = c.table_schema
            WHERE c.table_schema = 'public' AND t.table_type = 'BASE TABLE'
            ORDER BY c.table_name, c.ordinal_position
            "#,
        )
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| CopilotError::engine(format!("Failed to fetch columns: {e}")))?;

        let primary_keys: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT kcu.table_name::text, kcu.column_name::text
            FROM information_schema.table_constraints tc
            JOIN information_schema.key_column_usage kcu
                ON tc.constraint_name = kcu.constraint_name
                AND tc.table_schema = kcu.table_schema
            WHERE tc.table_schema = 'public' AND tc.constraint_type = 'PRIMARY KEY'
            ORDER BY kcu.table_name, kcu.ordinal_position
            "#,
        )
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| CopilotError::engine(format!("Failed to fetch primary keys: {e}")))?;

        let mut tables: Vec<Table> = Vec::new();
        for (table_name, name, data_type, is_nullable) in columns {
            if tables.last().map(|t| t.name != table_name).unwrap_or(true) {
                tables.push(Table::new(table_name.clone()));
            }
            if let Some(table) = tables.last_mut() {
                let mut column = Column::new(name, data_type);
                column.is_nullable = is_nullable == "YES";
                table.columns.push(column);
            }
        }
        for (table_name, column) in primary_keys {
            if let Some(table) = tables.iter_mut().find(|t| t.name == table_name) {
                table.primary_key.push(column);
            }
        }

        Ok(tables)
    }

    async fn fetch_foreign_keys(conn: &mut PgConnection) -> Result<Vec<ForeignKey>> {
        let rows: Vec<(String, String, String, String, String)> = sqlx::query_as(
            r#"
            SELECT
                tc.constraint_name::text,
                kcu.table_name::text AS from_table,
                kcu.column_name::text AS from_column,
                ccu.table_name::text AS to_table,
                ccu.column_name::text AS to_column
            FROM information_schema.table_constraints tc
            JOIN information_schema.key_column_usage kcu
                ON tc.constraint_name = kcu.constraint_name
                AND tc.table_schema = kcu.table_schema
            JOIN information_schema.constraint_column_usage ccu
                ON tc.constraint_name = ccu.constraint_name
                AND tc.table_schema = ccu.table_schema
            WHERE tc.table_schema = 'public'
                AND tc.constraint_type = 'FOREIGN KEY'
            ORDER BY tc.constraint_name, kcu.ordinal_position
            "#,
        )
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| CopilotError::engine(format!("Failed to fetch foreign keys: {e}")))?;

        let mut keys: Vec<(String, ForeignKey)> = Vec::new();
        for (constraint, from_table, from_column, to_table, to_column) in rows {
            match keys.last_mut() {
                Some((name, fk)) if *name == constraint => {
                    fk.from_columns.push(from_column);
                    fk.to_columns.push(to_column);
                }
                _ => keys.push((
                    constraint,
                    ForeignKey {
                        from_table,
                        from_columns: vec![from_column],
                        to_table,
                        to_columns: vec![to_column],
                    },
                )),
            }
        }

        Ok(keys.into_iter().map(|(_, fk)| fk).collect())
    }
}

#[async_trait]
impl DatabaseClient for PostgresClient {
    fn engine(&self) -> EngineKind {
        EngineKind::Postgres
    }

    async fn execute(&self, query: &str, limits: &ExecutionLimits) -> Result<ExecutionResult> {
        let start = Instant::now();
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or_else(Self::closed)?;
        let mut collector = ResultCollector::new(*limits);

        {
            let mut stream = (&mut *conn).fetch_many(sqlx::raw_sql(query));
            while let Some(item) = stream.try_next().await.map_err(map_sqlx_error)? {
                match item {
                    Either::Left(done) => {
                        if !collector.has_columns() {
                            collector.add_affected(done.rows_affected());
                        }
                    }
                    Either::Right(row) => {
                        if !collector.has_columns() {
                            collector.set_columns(column_info(&row));
                        }
                        if !collector.push(convert_row(&row)) {
                            break;
                        }
                    }
                }
            }
        }

        if collector.is_truncated() {
            warn!(
                max_rows = limits.max_rows,
                max_bytes = limits.max_bytes,
                "Result truncated"
            );
        }

        Ok(collector.finish(start.elapsed()))
    }

    async fn ping(&self) -> Result<()> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or_else(Self::closed)?;
        conn.ping().await.map_err(map_sqlx_error)
    }

    async fn cancel(&self) -> Result<()> {
        // The handle's own connection is busy; cancel over a side connection.
        let mut side = PgConnection::connect(&self.conn_str)
            .await
            .map_err(|e| CopilotError::connect_failed(e.to_string()))?;
        let cancelled: bool = sqlx::query_scalar("SELECT pg_cancel_backend($1)")
            .bind(self.backend_pid)
            .fetch_one(&mut side)
            .await
            .map_err(map_sqlx_error)?;
        debug!(backend_pid = self.backend_pid, cancelled, "Requested backend cancel");
        let _ = side.close().await;
        Ok(())
    }

    async fn introspect_schema(&self) -> Result<Schema> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or_else(Self::closed)?;
        let tables = Self::fetch_tables(conn).await?;
        let foreign_keys = Self::fetch_foreign_keys(conn).await?;
        Ok(Schema {
            tables,
            foreign_keys,
        })
    }

    async fn close(&self) -> Result<()> {
        if let Some(conn) = self.conn.lock().await.take() {
            if let Err(e) = conn.close().await {
                debug!(error = %e, "Connection already unusable at close");
            }
        }
        Ok(())
    }
}

fn column_info(row: &PgRow) -> Vec<ColumnInfo> {
    row.columns()
        .iter()
        .map(|col| ColumnInfo::new(col.name(), col.type_info().name()))
        .collect()
}

/// Converts a sqlx PgRow to our Row type.
fn convert_row(row: &PgRow) -> Row {
    row.columns()
        .iter()
        .enumerate()
        .map(|(i, col)| convert_value(row, i, col.type_info().name()))
        .collect()
}

/// Converts a single column value from a PgRow to our Value type.
fn convert_value(row: &PgRow, index: usize, type_name: &str) -> Value {
    match type_name.to_uppercase().as_str() {
        "BOOL" | "BOOLEAN" => row
            .try_get::<Option<bool>, _>(index)
            .ok()
            .flatten()
            .map(Value::Bool)
            .unwrap_or(Value::Null),

        "INT2" | "SMALLINT" => row
            .try_get::<Option<i16>, _>(index)
            .ok()
            .flatten()
            .map(|v| Value::Int(v as i64))
            .unwrap_or(Value::Null),

        "INT4" | "INT" | "INTEGER" => row
            .try_get::<Option<i32>, _>(index)
            .ok()
            .flatten()
            .map(|v| Value::Int(v as i64))
            .unwrap_or(Value::Null),

        "INT8" | "BIGINT" => row
            .try_get::<Option<i64>, _>(index)
            .ok()
            .flatten()
            .map(Value::Int)
            .unwrap_or(Value::Null),

        "FLOAT4" | "REAL" => row
            .try_get::<Option<f32>, _>(index)
            .ok()
            .flatten()
            .map(|v| Value::Float(v as f64))
            .unwrap_or(Value::Null),

        "FLOAT8" | "DOUBLE PRECISION" => row
            .try_get::<Option<f64>, _>(index)
            .ok()
            .flatten()
            .map(Value::Float)
            .unwrap_or(Value::Null),

        "BYTEA" => row
            .try_get::<Option<Vec<u8>>, _>(index)
            .ok()
            .flatten()
            .map(Value::Bytes)
            .unwrap_or(Value::Null),

        "JSON" | "JSONB" => row
            .try_get::<Option<serde_json::Value>, _>(index)
            .ok()
            .flatten()
            .map(Value::Json)
            .unwrap_or(Value::Null),

        // For all other types, try to get as string
        _ => row
            .try_get_unchecked::<Option<String>, _>(index)
            .ok()
            .flatten()
            .map(Value::String)
            .unwrap_or(Value::Null),
    }
}

/// Determines if an error is transient and worth retrying.
fn is_transient_error(error: &sqlx::Error) -> bool {
    let error_str = error.to_string().to_lowercase();

    if error_str.contains("password authentication failed")
        || error_str.contains("authentication failed")
        || error_str.contains("does not exist")
    {
        return false;
    }

    error_str.contains("connection refused")
        || error_str.contains("timed out")
        || error_str.contains("temporarily unavailable")
        || error_str.contains("connection reset")
        || error_str.contains("broken pipe")
}

/// Maps sqlx connection errors to user-facing messages.
fn map_connection_error(error: sqlx::Error, config: &ConnectionConfig) -> CopilotError {
    let host = config.host.as_deref().unwrap_or("localhost");
    let port = config.port_or_default();
    let user = config.user.as_deref().unwrap_or("unknown");
    let database = config.database.as_deref().unwrap_or("unknown");

    let error_str = error.to_string().to_lowercase();

    if error_str.contains("connection refused") || error_str.contains("could not connect") {
        CopilotError::connect_failed(format!(
            "Cannot connect to {host}:{port}. Check that the server is running."
        ))
    } else if error_str.contains("authentication failed") {
        CopilotError::connect_failed(format!(
            "Authentication failed for user '{user}'. Check your credentials."
        ))
    } else if error_str.contains("does not exist") && error_str.contains("database") {
        CopilotError::connect_failed(format!("Database '{database}' does not exist."))
    } else if error_str.contains("timed out") || error_str.contains("timeout") {
        CopilotError::connect_failed(format!("Connection to {host}:{port} timed out."))
    } else {
        CopilotError::connect_failed(error.to_string())
    }
}
