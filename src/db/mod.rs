//! Database abstraction layer.
//!
//! Provides a trait-based interface over the supported engines. Every pooled
//! handle is one `DatabaseClient`, wrapping a single live session so that an
//! in-flight operation can be cancelled on the engine side.

mod mock;
mod mongo;
mod postgres;
mod schema;
mod sqlite;
mod types;

pub use mock::{MockDatabaseClient, MockStats};
pub use mongo::MongoClient;
pub use postgres::PostgresClient;
pub use schema::{Column, ForeignKey, Schema, Table};
pub use sqlite::SqliteClient;
pub use types::{ColumnInfo, ExecutionLimits, ExecutionResult, ResultCollector, Row, Value};

use crate::config::ConnectionConfig;
use crate::error::{CopilotError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Supported database engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    #[default]
    Postgres,
    Sqlite,
    #[serde(rename = "mongodb", alias = "mongo")]
    Mongo,
}

impl EngineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Sqlite => "sqlite",
            Self::Mongo => "mongodb",
        }
    }

    /// Parses an engine from a name or URL scheme.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "postgres" | "postgresql" => Some(Self::Postgres),
            "sqlite" | "sqlite3" => Some(Self::Sqlite),
            "mongo" | "mongodb" => Some(Self::Mongo),
            _ => None,
        }
    }

    /// Returns the default port for this engine (0 for file-based engines).
    pub fn default_port(&self) -> u16 {
        match self {
            Self::Postgres => 5432,
            Self::Sqlite => 0,
            Self::Mongo => 27017,
        }
    }

    pub fn url_scheme(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Sqlite => "sqlite",
            Self::Mongo => "mongodb",
        }
    }

    /// Whether queries for this engine are SQL text, as opposed to command documents.
    pub fn is_sql(&self) -> bool {
        matches!(self, Self::Postgres | Self::Sqlite)
    }

    /// Language tag the AI is asked to use for fenced query blocks.
    pub fn query_language(&self) -> &'static str {
        if self.is_sql() {
            "sql"
        } else {
            "json"
        }
    }
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dials a single session for the given configuration and resolved password.
///
/// This is the central factory function for database handles.
pub async fn connect(
    config: &ConnectionConfig,
    password: Option<&str>,
) -> Result<Box<dyn DatabaseClient>> {
    let config = config.normalized()?;
    match config.engine {
        EngineKind::Postgres => Ok(Box::new(PostgresClient::connect(&config, password).await?)),
        EngineKind::Sqlite => Ok(Box::new(SqliteClient::connect(&config).await?)),
        EngineKind::Mongo => Ok(Box::new(MongoClient::connect(&config, password).await?)),
    }
}

/// Trait defining the interface for database handles.
///
/// All database operations are async and return Results with CopilotError.
#[async_trait]
pub trait DatabaseClient: Send + Sync {
    fn engine(&self) -> EngineKind;

    /// Executes query text, collecting at most `limits` worth of rows.
    ///
    /// The caller enforces `limits.timeout`; engines that support a server-side
    /// deadline should apply it as well.
    async fn execute(&self, query: &str, limits: &ExecutionLimits) -> Result<ExecutionResult>;

    /// Lightweight liveness probe.
    async fn ping(&self) -> Result<()>;

    /// Best-effort cancellation of whatever this handle is currently running.
    async fn cancel(&self) -> Result<()>;

    /// Introspects the database schema.
    async fn introspect_schema(&self) -> Result<Schema>;

    /// Closes the database connection.
    async fn close(&self) -> Result<()>;
}

/// Maps a sqlx error raised while executing a statement.
///
/// Database errors keep the engine message; transport failures become
/// `ConnectFailed` so the handle is discarded.
pub(crate) fn map_sqlx_error(error: sqlx::Error) -> CopilotError {
    match error {
        sqlx::Error::Database(db_error) => {
            let mut message = db_error.message().to_string();
            if let Some(pg_error) = db_error.try_downcast_ref::<sqlx::postgres::PgDatabaseError>()
            {
                if let Some(detail) = pg_error.detail() {
                    message.push_str("\n  DETAIL: ");
                    message.push_str(detail);
                }
                if let Some(hint) = pg_error.hint() {
                    message.push_str("\n  HINT: ");
                    message.push_str(hint);
                }
            }
            CopilotError::engine(message)
        }
        sqlx::Error::Io(e) => CopilotError::connect_failed(format!("connection lost: {e}")),
        sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut | sqlx::Error::WorkerCrashed => {
            CopilotError::connect_failed(error.to_string())
        }
        other => CopilotError::engine(other.to_string()),
    }
}
