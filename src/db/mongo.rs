//! MongoDB client implementation.
//!
//! Query text for this engine is a JSON command document, run verbatim with
//! `runCommand` against the configured database, e.g.
//! `{"find": "orders", "filter": {"status": "open"}}`. Each handle tags its
//! commands with a `comment` so that `cancel` can find and kill them.

use crate::config::ConnectionConfig;
use crate::db::{
    Column, ColumnInfo, DatabaseClient, EngineKind, ExecutionLimits, ExecutionResult,
    ResultCollector, Row, Schema, Table, Value,
};
use crate::error::{CopilotError, Result};
use crate::safety::document::{command_name, parse_command};
use async_trait::async_trait;
use bson::{doc, Bson, Document};
use mongodb::options::ClientOptions;
use mongodb::{Client, Database};
use std::time::Instant;
use tracing::{debug, warn};

/// Read commands that accept a server-side `maxTimeMS`.
const DEADLINE_COMMANDS: &[&str] = &["find", "aggregate", "count", "distinct"];

#[derive(Debug)]
pub struct MongoClient {
    client: Client,
    db: Database,
    tag: String,
}

impl MongoClient {
    pub async fn connect(config: &ConnectionConfig, password: Option<&str>) -> Result<Self> {
        let database = config.database.clone().unwrap_or_else(|| "test".to_string());
        let uri = config.to_connection_string(password)?;

        let mut options = ClientOptions::parse(&uri)
            .await
            .map_err(|e| CopilotError::connect_failed(e.to_string()))?;
        options.app_name = Some("db-copilot".to_string());

        let client = Client::with_options(options)
            .map_err(|e| CopilotError::connect_failed(e.to_string()))?;
        let db = client.database(&database);

        // The driver connects lazily; ping so bad credentials fail here.
        db.run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| CopilotError::connect_failed(e.to_string()))?;
        debug!(database = %database, "Connected to MongoDB");

        Ok(Self {
            client,
            db,
            tag: format!("db-copilot:{}", uuid::Uuid::new_v4()),
        })
    }

    async fn kill_cursor(&self, collection: &str, cursor_id: i64) {
        let command = doc! { "killCursors": collection, "cursors": [cursor_id] };
        if let Err(e) = self.db.run_command(command).await {
            debug!(error = %e, "killCursors failed");
        }
    }
}

#[async_trait]
impl DatabaseClient for MongoClient {
    fn engine(&self) -> EngineKind {
        EngineKind::Mongo
    }

    async fn execute(&self, query: &str, limits: &ExecutionLimits) -> Result<ExecutionResult> {
        let start = Instant::now();
        let command = prepare_command(parse_command(query)?, &self.tag, limits);
        let name = command_name(&command).unwrap_or_default().to_string();
        let collection = command.get_str(&name).ok().map(String::from);

        let response = self
            .db
            .run_command(command)
            .await
            .map_err(map_mongo_error)?;

        let mut collector = ResultCollector::new(*limits);

        if let Ok(cursor) = response.get_document("cursor") {
            let batch: Vec<Document> = cursor
                .get_array("firstBatch")
                .map(|docs| docs.iter().filter_map(|d| d.as_document().cloned()).collect())
                .unwrap_or_default();
            collect_documents(&mut collector, &batch);

            let cursor_id = cursor.get_i64("id").unwrap_or(0);
            if cursor_id != 0 {
                collector.mark_truncated();
                if let Some(collection) = &collection {
                    self.kill_cursor(collection, cursor_id).await;
                }
            }
        } else if let Ok(values) = response.get_array("values") {
            collector.set_columns(vec![ColumnInfo::new("value", "")]);
            for value in values {
                if !collector.push(vec![convert_bson(value)]) {
                    break;
                }
            }
        } else if name == "count" {
            collector.set_columns(vec![ColumnInfo::new("n", "long")]);
            collector.push(vec![response.get("n").map(convert_bson).unwrap_or(Value::Null)]);
        } else if let Some(n) = affected_count(&response) {
            collector.add_affected(n);
        } else {
            let mut response = response;
            response.remove("ok");
            collect_documents(&mut collector, &[response]);
        }

        Ok(collector.finish(start.elapsed()))
    }

    async fn ping(&self) -> Result<()> {
        self.db
            .run_command(doc! { "ping": 1 })
            .await
            .map(|_| ())
            .map_err(map_mongo_error)
    }

    async fn cancel(&self) -> Result<()> {
        let admin = self.client.database("admin");
        let ops = admin
            .run_command(doc! { "currentOp": 1, "command.comment": self.tag.as_str() })
            .await
            .map_err(map_mongo_error)?;

        for op in ops.get_array("inprog").map(|a| a.as_slice()).unwrap_or(&[]) {
            let Some(opid) = op.as_document().and_then(|d| d.get("opid")).cloned() else {
                continue;
            };
            if let Err(e) = admin.run_command(doc! { "killOp": 1, "op": opid }).await {
                warn!(error = %e, "killOp failed");
            }
        }
        Ok(())
    }

    async fn introspect_schema(&self) -> Result<Schema> {
        let names = self
            .db
            .list_collection_names()
            .await
            .map_err(map_mongo_error)?;

        let mut schema = Schema::default();
        for name in names {
            let sample = self
                .db
                .collection::<Document>(&name)
                .find_one(doc! {})
                .await
                .map_err(map_mongo_error)?;

            let columns = sample
                .map(|doc| {
                    doc.iter()
                        .map(|(key, value)| Column::new(key.clone(), bson_type_name(value)))
                        .collect()
                })
                .unwrap_or_default();
            schema.tables.push(
                Table::new(name)
                    .with_columns(columns)
                    .with_primary_key(vec!["_id".to_string()]),
            );
        }
        schema.tables.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(schema)
    }

    async fn close(&self) -> Result<()> {
        self.client.clone().shutdown().await;
        Ok(())
    }
}

/// Adds the handle tag and per-execution limits to a command.
fn prepare_command(mut command: Document, tag: &str, limits: &ExecutionLimits) -> Document {
    let name = command_name(&command).unwrap_or_default().to_string();

    if DEADLINE_COMMANDS.contains(&name.as_str()) && !command.contains_key("maxTimeMS") {
        command.insert("maxTimeMS", limits.timeout.as_millis() as i64);
    }
    let batch = limits.max_rows.min(i32::MAX as usize) as i32;
    match name.as_str() {
        "find" if !command.contains_key("batchSize") => {
            command.insert("batchSize", batch);
        }
        "aggregate" => {
            let mut cursor = command.get_document("cursor").cloned().unwrap_or_default();
            if !cursor.contains_key("batchSize") {
                cursor.insert("batchSize", batch);
            }
            command.insert("cursor", cursor);
        }
        _ => {}
    }
    if !command.contains_key("comment") {
        command.insert("comment", tag);
    }
    command
}

/// Flattens documents into rows, with columns in order of first appearance.
fn collect_documents(collector: &mut ResultCollector, docs: &[Document]) {
    let mut keys: Vec<String> = Vec::new();
    for doc in docs {
        for key in doc.keys() {
            if !keys.contains(key) {
                keys.push(key.clone());
            }
        }
    }
    collector.set_columns(keys.iter().map(|k| ColumnInfo::new(k.as_str(), "")).collect());

    for doc in docs {
        let row: Row = keys
            .iter()
            .map(|k| doc.get(k).map(convert_bson).unwrap_or(Value::Null))
            .collect();
        if !collector.push(row) {
            break;
        }
    }
}

/// Rows touched by a write command, if the response is one.
fn affected_count(response: &Document) -> Option<u64> {
    if let Ok(modified) = response.get_i32("nModified") {
        return Some(modified.max(0) as u64);
    }
    match response.get("n") {
        Some(Bson::Int32(n)) => Some((*n).max(0) as u64),
        Some(Bson::Int64(n)) => Some((*n).max(0) as u64),
        _ => None,
    }
}

fn convert_bson(value: &Bson) -> Value {
    match value {
        Bson::Null | Bson::Undefined => Value::Null,
        Bson::Boolean(b) => Value::Bool(*b),
        Bson::Int32(i) => Value::Int(*i as i64),
        Bson::Int64(i) => Value::Int(*i),
        Bson::Double(f) => Value::Float(*f),
        Bson::String(s) => Value::String(s.clone()),
        Bson::ObjectId(oid) => Value::String(oid.to_hex()),
        Bson::DateTime(dt) => Value::String(
            dt.try_to_rfc3339_string()
                .unwrap_or_else(|_| dt.timestamp_millis().to_string()),
        ),
        Bson::Binary(bin) => Value::Bytes(bin.bytes.clone()),
        Bson::Document(_) | Bson::Array(_) => Value::Json(value.clone().into_relaxed_extjson()),
        other => Value::String(other.to_string()),
    }
}

fn bson_type_name(value: &Bson) -> &'static str {
    match value {
        Bson::Double(_) => "double",
        Bson::String(_) => "string",
        Bson::Document(_) => "object",
        Bson::Array(_) => "array",
        Bson::Binary(_) => "binData",
        Bson::ObjectId(_) => "objectId",
        Bson::Boolean(_) => "bool",
        Bson::DateTime(_) => "date",
        Bson::Null => "null",
        Bson::Int32(_) => "int",
        Bson::Int64(_) => "long",
        Bson::Decimal128(_) => "decimal",
        _ => "",
    }
}

fn map_mongo_error(error: mongodb::error::Error) -> CopilotError {
    use mongodb::error::ErrorKind;

    match *error.kind {
        ErrorKind::Command(ref command) => {
            // MaxTimeMSExpired
            if command.code == 50 {
                CopilotError::engine_timeout(command.message.clone())
            } else {
                CopilotError::engine(command.message.clone())
            }
        }
        ErrorKind::Io(_)
        | ErrorKind::ServerSelection { .. }
        | ErrorKind::ConnectionPoolCleared { .. } => CopilotError::connect_failed(error.to_string()),
        _ => CopilotError::engine(error.to_string()),
    }
}
