//! Classification of document-store commands.
//!
//! A query for a document engine is a JSON command document whose first key
//! names the command, e.g. `{"find": "orders", "filter": {"status": "open"}}`.

use bson::{Bson, Document};

use crate::error::{CopilotError, Result};

use super::{ClassificationResult, SafetyLevel, StatementType};

const READ_COMMANDS: &[&str] = &[
    "find",
    "count",
    "distinct",
    "listCollections",
    "listIndexes",
    "collStats",
    "dbStats",
    "ping",
    "explain",
    "buildInfo",
    "serverStatus",
];

const MUTATING_COMMANDS: &[&str] = &["insert", "update", "create", "createIndexes"];

const DESTRUCTIVE_COMMANDS: &[&str] = &[
    "delete",
    "drop",
    "dropDatabase",
    "dropIndexes",
    "renameCollection",
];

/// Aggregation stages that write their output somewhere.
const WRITING_STAGES: &[&str] = &["$out", "$merge"];

/// Parses command text into an ordered document.
pub fn parse_command(text: &str) -> Result<Document> {
    let trimmed = text.trim();
    if !trimmed.starts_with('{') {
        return Err(CopilotError::syntax(
            "expected a JSON command document, e.g. {\"find\": \"collection\"}",
        ));
    }
    let document: Document = serde_json::from_str(trimmed)
        .map_err(|e| CopilotError::syntax(format!("invalid command document: {e}")))?;
    if document.is_empty() {
        return Err(CopilotError::syntax("empty command document"));
    }
    Ok(document)
}

/// The command name is the first key of the document.
pub fn command_name(command: &Document) -> Option<&str> {
    command.keys().next().map(String::as_str)
}

pub fn classify_command(command: &Document) -> Result<ClassificationResult> {
    let name = command_name(command)
        .ok_or_else(|| CopilotError::syntax("empty command document"))?
        .to_string();

    let level = match name.as_str() {
        "aggregate" => {
            if pipeline_writes(command) {
                SafetyLevel::Mutating
            } else {
                SafetyLevel::Safe
            }
        }
        "findAndModify" => {
            if command.get_bool("remove").unwrap_or(false) {
                SafetyLevel::Destructive
            } else {
                SafetyLevel::Mutating
            }
        }
        n if READ_COMMANDS.contains(&n) => SafetyLevel::Safe,
        n if MUTATING_COMMANDS.contains(&n) => SafetyLevel::Mutating,
        n if DESTRUCTIVE_COMMANDS.contains(&n) => SafetyLevel::Destructive,
        // Unknown commands are never run without confirmation
        _ => SafetyLevel::Destructive,
    };

    Ok(ClassificationResult::new(level, StatementType::Command(name)))
}

pub fn classify_command_text(text: &str) -> Result<ClassificationResult> {
    classify_command(&parse_command(text)?)
}

fn pipeline_writes(command: &Document) -> bool {
    let Ok(pipeline) = command.get_array("pipeline") else {
        return false;
    };
    pipeline.iter().any(|stage| match stage {
        Bson::Document(stage) => stage.keys().any(|k| WRITING_STAGES.contains(&k.as_str())),
        _ => false,
    })
}
