//! Mock database client for testing.
//!
//! Behaves like a live handle: it records what it was asked to run, can be
//! slowed down or made to fail, and exposes counters for cancels and closes.

use super::{
    ColumnInfo, DatabaseClient, EngineKind, ExecutionLimits, ExecutionResult, ResultCollector,
    Schema, Value,
};
use crate::error::{CopilotError, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Observable side effects of a mock handle.
#[derive(Debug, Default)]
pub struct MockStats {
    pub executed: AtomicUsize,
    pub cancelled: AtomicUsize,
    pub closed: AtomicBool,
    queries: Mutex<Vec<String>>,
}

impl MockStats {
    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().map(|q| q.clone()).unwrap_or_default()
    }
}

/// A mock database client that returns predefined results.
#[derive(Debug, Clone)]
pub struct MockDatabaseClient {
    engine: EngineKind,
    schema: Schema,
    delay: Duration,
    rows: usize,
    failure: Option<CopilotError>,
    healthy: Arc<AtomicBool>,
    stats: Arc<MockStats>,
}

impl MockDatabaseClient {
    /// Creates a new mock database client with an empty schema.
    pub fn new() -> Self {
        Self {
            engine: EngineKind::Postgres,
            schema: Schema::default(),
            delay: Duration::ZERO,
            rows: 1,
            failure: None,
            healthy: Arc::new(AtomicBool::new(true)),
            stats: Arc::new(MockStats::default()),
        }
    }

    pub fn with_schema(mut self, schema: Schema) -> Self {
        self.schema = schema;
        self
    }

    /// Every execution sleeps this long before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Number of rows returned for read queries.
    pub fn with_rows(mut self, rows: usize) -> Self {
        self.rows = rows;
        self
    }

    /// Every execution fails with this error.
    pub fn failing(mut self, error: CopilotError) -> Self {
        self.failure = Some(error);
        self
    }

    /// Shares a health flag; `ping` fails while it is false.
    pub fn with_health(mut self, healthy: Arc<AtomicBool>) -> Self {
        self.healthy = healthy;
        self
    }

    pub fn stats(&self) -> Arc<MockStats> {
        Arc::clone(&self.stats)
    }

    fn is_read(query: &str) -> bool {
        let upper = query.trim_start().to_uppercase();
        upper.starts_with("SELECT")
            || upper.starts_with("WITH")
            || upper.starts_with("{\"FIND\"")
            || upper.starts_with("{\"AGGREGATE\"")
    }
}

impl Default for MockDatabaseClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DatabaseClient for MockDatabaseClient {
    fn engine(&self) -> EngineKind {
        self.engine
    }

    async fn execute(&self, query: &str, limits: &ExecutionLimits) -> Result<ExecutionResult> {
        let start = Instant::now();
        self.stats.executed.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut queries) = self.stats.queries.lock() {
            queries.push(query.to_string());
        }

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(error) = &self.failure {
            return Err(error.clone());
        }

        if Self::is_read(query) {
            let mut collector = ResultCollector::new(*limits);
            collector.set_columns(vec![
                ColumnInfo::new("id", "int8"),
                ColumnInfo::new("result", "text"),
            ]);
            for i in 0..self.rows {
                let row = vec![
                    Value::Int(i as i64 + 1),
                    Value::String(format!("Mock result for: {query}")),
                ];
                if !collector.push(row) {
                    break;
                }
            }
            Ok(collector.finish(start.elapsed()))
        } else {
            Ok(ExecutionResult::affected(1).with_execution_time(start.elapsed()))
        }
    }

    async fn ping(&self) -> Result<()> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CopilotError::connect_failed("mock handle is unhealthy"))
        }
    }

    async fn cancel(&self) -> Result<()> {
        self.stats.cancelled.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn introspect_schema(&self) -> Result<Schema> {
        Ok(self.schema.clone())
    }

    async fn close(&self) -> Result<()> {
        self.stats.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
