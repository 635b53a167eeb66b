//! Query safety classification module.
//!
//! Classifies query text for a given engine as safe (read-only), mutating or
//! destructive. The gateway uses the classification to decide which triggers
//! may run a query; unparseable input is rejected outright.

pub mod document;
mod parser;

pub use parser::SqlClassifier;

use crate::db::EngineKind;
use crate::error::{CopilotError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Safety level classification, ordered from least to most dangerous.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyLevel {
    /// Read-only queries (SELECT, EXPLAIN, SHOW, find).
    Safe,
    /// Data modification (INSERT, UPDATE, insert/update commands).
    Mutating,
    /// Data loss or schema changes (DELETE, DROP, ALTER, drop commands).
    Destructive,
}

impl SafetyLevel {
    pub fn is_read_only(&self) -> bool {
        matches!(self, Self::Safe)
    }
}

impl fmt::Display for SafetyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Safe => write!(f, "Safe"),
            Self::Mutating => write!(f, "Mutating"),
            Self::Destructive => write!(f, "Destructive"),
        }
    }
}

/// The kind of statement detected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatementType {
    Select,
    Insert,
    Update,
    Delete,
    Drop,
    Truncate,
    Alter,
    Create,
    Grant,
    Revoke,
    Explain,
    Show,
    Merge,
    /// SELECT calling a function known to have side effects.
    SideEffect(String),
    /// Document-store command, by name.
    Command(String),
    /// Multiple statements detected; contains the most dangerous type.
    Multiple(Box<StatementType>),
    Unknown,
}

impl fmt::Display for StatementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Select => write!(f, "SELECT"),
            Self::Insert => write!(f, "INSERT"),
            Self::Update => write!(f, "UPDATE"),
            Self::Delete => write!(f, "DELETE"),
            Self::Drop => write!(f, "DROP"),
            Self::Truncate => write!(f, "TRUNCATE"),
            Self::Alter => write!(f, "ALTER"),
            Self::Create => write!(f, "CREATE"),
            Self::Grant => write!(f, "GRANT"),
            Self::Revoke => write!(f, "REVOKE"),
            Self::Explain => write!(f, "EXPLAIN"),
            Self::Show => write!(f, "SHOW"),
            Self::Merge => write!(f, "MERGE"),
            Self::SideEffect(function) => write!(f, "SELECT {function}()"),
            Self::Command(name) => write!(f, "{name}"),
            Self::Multiple(inner) => write!(f, "Multiple ({inner})"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Result of classifying a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassificationResult {
    pub level: SafetyLevel,
    pub statement_type: StatementType,
}

impl ClassificationResult {
    pub fn new(level: SafetyLevel, statement_type: StatementType) -> Self {
        Self {
            level,
            statement_type,
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.level.is_read_only()
    }

    /// Keeps whichever of the two is more dangerous; ties keep `self`.
    pub(crate) fn max(self, other: Self) -> Self {
        if other.level > self.level {
            other
        } else {
            self
        }
    }
}

/// Classifies query text for the given engine.
///
/// Fails with `SyntaxRejected` if the text cannot be parsed for that engine.
pub fn classify(engine: EngineKind, query: &str) -> Result<ClassificationResult> {
    if query.trim().is_empty() {
        return Err(CopilotError::syntax("empty query"));
    }
    match engine {
        EngineKind::Postgres | EngineKind::Sqlite => SqlClassifier::for_engine(engine).classify(query),
        EngineKind::Mongo => document::classify_command_text(query),
    }
}
