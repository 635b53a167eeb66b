//! Query result types.
//!
//! Defines the structures used to represent query results from any engine,
//! plus the row/byte budget every engine applies while collecting rows.

use base64::Engine as _;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Represents the result of executing a query.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    /// Column metadata for the result set.
    pub columns: Vec<ColumnInfo>,

    /// Rows of data.
    pub rows: Vec<Row>,

    /// Rows inserted, updated or deleted, when the engine reports it.
    pub affected_rows: Option<u64>,

    /// Time taken to execute the query.
    #[serde(rename = "durationMs", serialize_with = "duration_ms")]
    pub execution_time: Duration,

    /// Whether rows were dropped because a row or byte cap was hit.
    pub truncated: bool,
}

impl ExecutionResult {
    /// Creates a query result with the given columns and rows.
    pub fn with_data(columns: Vec<ColumnInfo>, rows: Vec<Row>) -> Self {
        Self {
            columns,
            rows,
            ..Self::default()
        }
    }

    /// Creates a result for a statement that returned no rows.
    pub fn affected(count: u64) -> Self {
        Self {
            affected_rows: Some(count),
            ..Self::default()
        }
    }

    /// Sets the execution time.
    pub fn with_execution_time(mut self, duration: Duration) -> Self {
        self.execution_time = duration;
        self
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Returns true if the result set is empty.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// One-line description used in prompts and logs.
    pub fn summary(&self) -> String {
        let mut summary = match self.affected_rows {
            Some(n) if self.rows.is_empty() => format!("{n} row(s) affected"),
            _ => format!(
                "{} row(s), columns: {}",
                self.rows.len(),
                self.columns
                    .iter()
                    .map(|c| c.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        };
        if self.truncated {
            summary.push_str(" (truncated)");
        }
        summary
    }
}

fn duration_ms<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_millis() as u64)
}

/// Metadata about a column in a result set.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ColumnInfo {
    /// Column name.
    pub name: String,

    /// Column data type, as reported by the engine.
    pub data_type: String,
}

impl ColumnInfo {
    /// Creates a new column info with the given name and type.
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
        }
    }
}

/// A row of data from a query result.
pub type Row = Vec<Value>;

/// Represents a single value from a database query.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Value {
    /// NULL value.
    #[default]
    Null,

    /// Boolean value.
    Bool(bool),

    /// Signed integer (up to i64).
    Int(i64),

    /// Floating point number.
    Float(f64),

    /// Text/string value.
    String(String),

    /// Binary data.
    Bytes(Vec<u8>),

    /// Structured data (JSON columns, nested documents).
    Json(serde_json::Value),
}

impl Value {
    /// Returns true if this value is NULL.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Attempts to convert the value to a string representation.
    pub fn to_display_string(&self) -> String {
        match self {
            Value::Null => "NULL".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::String(s) => s.clone(),
            Value::Bytes(b) => format!("<{} bytes>", b.len()),
            Value::Json(v) => v.to_string(),
        }
    }

    /// Rough in-memory size, used for the result byte cap.
    pub fn estimated_size(&self) -> usize {
        match self {
            Value::Null | Value::Bool(_) => 1,
            Value::Int(_) | Value::Float(_) => 8,
            Value::String(s) => s.len(),
            Value::Bytes(b) => b.len(),
            Value::Json(v) => v.to_string().len(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_display_string())
    }
}

/// Values serialize as plain JSON scalars; bytes become base64 strings.
impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_none(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(i) => serializer.serialize_i64(*i),
            Value::Float(f) => serializer.serialize_f64(*f),
            Value::String(s) => serializer.serialize_str(s),
            Value::Bytes(b) => {
                serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(b))
            }
            Value::Json(v) => v.serialize(serializer),
        }
    }
}

// Conversion implementations for common types
impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl<T> From<Option<T>> for Value
where
    T: Into<Value>,
{
    fn from(v: Option<T>) -> Self {
        match v {
            Some(val) => val.into(),
            None => Value::Null,
        }
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => n.as_f64().map(Value::Float).unwrap_or(Value::Null),
            },
            other => Value::Json(other),
        }
    }
}

/// Caps applied to a single execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionLimits {
    pub max_rows: usize,
    pub max_bytes: usize,
    pub timeout: Duration,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            max_rows: 1000,
            max_bytes: 4 * 1024 * 1024,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Accumulates rows until either cap is reached.
///
/// Engines push rows as they stream in and stop fetching once `push` returns
/// false; the resulting `ExecutionResult` carries the truncation flag.
#[derive(Debug)]
pub struct ResultCollector {
    limits: ExecutionLimits,
    columns: Vec<ColumnInfo>,
    rows: Vec<Row>,
    bytes: usize,
    truncated: bool,
    affected_rows: Option<u64>,
}

impl ResultCollector {
    pub fn new(limits: ExecutionLimits) -> Self {
        Self {
            limits,
            columns: Vec::new(),
            rows: Vec::new(),
            bytes: 0,
            truncated: false,
            affected_rows: None,
        }
    }

    pub fn has_columns(&self) -> bool {
        !self.columns.is_empty()
    }

    pub fn set_columns(&mut self, columns: Vec<ColumnInfo>) {
        self.columns = columns;
    }

    pub fn add_affected(&mut self, count: u64) {
        *self.affected_rows.get_or_insert(0) += count;
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// Adds a row. Returns false once the result is full and the caller
    /// should stop fetching.
    pub fn push(&mut self, row: Row) -> bool {
        if self.truncated {
            return false;
        }
        let size: usize = row.iter().map(Value::estimated_size).sum();
        if self.rows.len() >= self.limits.max_rows || self.bytes + size > self.limits.max_bytes {
            self.truncated = true;
            return false;
        }
        self.bytes += size;
        self.rows.push(row);
        true
    }

    /// Marks the result truncated without a row in hand, e.g. when a cursor
    /// reports more batches.
    pub fn mark_truncated(&mut self) {
        self.truncated = true;
    }

    pub fn finish(self, execution_time: Duration) -> ExecutionResult {
        ExecutionResult {
            columns: self.columns,
            rows: self.rows,
            affected_rows: self.affected_rows,
            execution_time,
            truncated: self.truncated,
        }
    }
}
