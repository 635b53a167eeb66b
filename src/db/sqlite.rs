//! SQLite database client implementation.
//!
//! One sqlx `SqliteConnection` per handle. SQLite has no server to signal, so
//! cancellation is a no-op: the gateway drops the execution future instead.

use crate::config::ConnectionConfig;
use crate::db::{
    map_sqlx_error, Column, ColumnInfo, DatabaseClient, EngineKind, ExecutionLimits,
    ExecutionResult, ForeignKey, ResultCollector, Row, Schema, Table, Value,
};
use crate::error::{CopilotError, Result};
use async_trait::async_trait;
use futures::TryStreamExt;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteRow};
use sqlx::{
    Column as SqlxColumn, ConnectOptions, Connection, Either, Executor, Row as SqlxRow, TypeInfo,
    ValueRef,
};
use std::str::FromStr;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug)]
pub struct SqliteClient {
    conn: Mutex<Option<SqliteConnection>>,
}

impl SqliteClient {
    /// Opens an existing database file described by `config`.
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        let url = config.to_connection_string(None)?;
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(|e| CopilotError::config(format!("Invalid SQLite path: {e}")))?;
        Self::from_options(options).await
    }

    /// Opens a connection from explicit options.
    ///
    /// This is primarily useful for testing, e.g. with `create_if_missing`.
    pub async fn from_options(options: SqliteConnectOptions) -> Result<Self> {
        let conn = options
            .connect()
            .await
            .map_err(|e| CopilotError::connect_failed(e.to_string()))?;
        debug!("Opened SQLite connection");
        Ok(Self {
            conn: Mutex::new(Some(conn)),
        })
    }

    fn closed() -> CopilotError {
        CopilotError::connect_failed("handle is closed")
    }
}

#[async_trait]
impl DatabaseClient for SqliteClient {
    fn engine(&self) -> EngineKind {
        EngineKind::Sqlite
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
                            collector.set_columns(
                                row.columns()
                                    .iter()
                                    .map(|c| ColumnInfo::new(c.name(), c.type_info().name()))
                                    .collect(),
                            );
                        }
                        if !collector.push(convert_row(&row)) {
                            break;
                        }
                    }
                }
            }
        }

        Ok(collector.finish(start.elapsed()))
    }

    async fn ping(&self) -> Result<()> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or_else(Self::closed)?;
        conn.ping().await.map_err(map_sqlx_error)
    }

    async fn cancel(&self) -> Result<()> {
        Ok(())
    }

    async fn introspect_schema(&self) -> Result<Schema> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or_else(Self::closed)?;

        let names: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| CopilotError::engine(format!("Failed to fetch tables: {e}")))?;

        let mut schema = Schema::default();
        for name in names {
            // (cid, name, type, notnull, dflt_value, pk)
            let columns: Vec<(i64, String, String, i64, Option<String>, i64)> =
                sqlx::query_as("SELECT cid, name, type, \"notnull\", dflt_value, pk FROM pragma_table_info(?)")
                    .bind(&name)
                    .fetch_all(&mut *conn)
                    .await
                    .map_err(|e| {
                        CopilotError::engine(format!("Failed to fetch columns for {name}: {e}"))
                    })?;

            let mut table = Table::new(name.clone());
            let mut pk: Vec<(i64, String)> = Vec::new();
            for (_, column, data_type, not_null, _, pk_index) in columns {
                let mut col = Column::new(column.clone(), data_type);
                col.is_nullable = not_null == 0;
                table.columns.push(col);
                if pk_index > 0 {
                    pk.push((pk_index, column));
                }
            }
            pk.sort();
            table.primary_key = pk.into_iter().map(|(_, c)| c).collect();

            // (id, seq, table, from, to)
            let fks: Vec<(i64, i64, String, String, Option<String>)> = sqlx::query_as(
                "SELECT id, seq, \"table\", \"from\", \"to\" FROM pragma_foreign_key_list(?) ORDER BY id, seq",
            )
            .bind(&name)
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| {
                CopilotError::engine(format!("Failed to fetch foreign keys for {name}: {e}"))
            })?;

            let mut current: Option<(i64, ForeignKey)> = None;
            for (id, _, to_table, from, to) in fks {
                match current.as_mut() {
                    Some((current_id, fk)) if *current_id == id => {
                        fk.from_columns.push(from);
                        fk.to_columns.extend(to);
                    }
                    _ => {
                        if let Some((_, fk)) = current.take() {
                            schema.foreign_keys.push(fk);
                        }
                        current = Some((
                            id,
                            ForeignKey {
                                from_table: name.clone(),
                                from_columns: vec![from],
                                to_table,
                                to_columns: to.into_iter().collect(),
                            },
                        ));
                    }
                }
            }
            if let Some((_, fk)) = current {
                schema.foreign_keys.push(fk);
            }

            schema.tables.push(table);
        }

        Ok(schema)
    }

    async fn close(&self) -> Result<()> {
        if let Some(conn) = self.conn.lock().await.take() {
            conn.close().await.map_err(map_sqlx_error)?;
        }
        Ok(())
    }
}

/// Converts a row by the storage class of each value; SQLite columns are
/// dynamically typed, so the declared type is only a hint.
fn convert_row(row: &SqliteRow) -> Row {
    (0..row.columns().len())
        .map(|i| {
            let storage = match row.try_get_raw(i) {
                Ok(raw) if raw.is_null() => return Value::Null,
                Ok(raw) => raw.type_info().name().to_uppercase(),
                Err(_) => return Value::Null,
            };
            match storage.as_str() {
                "INTEGER" | "BOOLEAN" => row.try_get::<i64, _>(i).map(Value::Int),
                "REAL" => row.try_get::<f64, _>(i).map(Value::Float),
                "BLOB" => row.try_get::<Vec<u8>, _>(i).map(Value::Bytes),
                _ => row.try_get::<String, _>(i).map(Value::String),
            }
            .unwrap_or(Value::Null)
        })
        .collect()
}
