//! Database schema snapshots.
//!
//! Introspected structure of a target database, rendered into the AI prompt
//! when a chat shares its schema.

use serde::{Deserialize, Serialize};

/// Represents the structure of one database.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Schema {
    /// Tables, or collections for document stores.
    pub tables: Vec<Table>,

    /// Foreign key relationships between tables.
    pub foreign_keys: Vec<ForeignKey>,
}

impl Schema {
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Renders the schema as compact text for the system prompt.
    pub fn format_for_prompt(&self) -> String {
        let mut out = String::from("Database Schema:\n");

        for table in &self.tables {
            out.push_str(&format!("\n{}\n", table.name));
            for column in &table.columns {
                out.push_str(&format!("  - {}", column.name));
                if !column.data_type.is_empty() {
                    out.push_str(&format!(": {}", column.data_type));
                }

                let mut notes = Vec::new();
                if table.primary_key.contains(&column.name) {
                    notes.push("PK".to_string());
                }
                if !column.is_nullable {
                    notes.push("NOT NULL".to_string());
                }
                for fk in self.foreign_keys_from(&table.name, &column.name) {
                    let target = fk.to_columns.first().map(String::as_str).unwrap_or("");
                    notes.push(format!("FK -> {}.{}", fk.to_table, target));
                }
                if !notes.is_empty() {
                    out.push_str(&format!(" ({})", notes.join(", ")));
                }
                out.push('\n');
            }
        }

        out
    }

    fn foreign_keys_from<'a>(
        &'a self,
        table: &'a str,
        column: &'a str,
    ) -> impl Iterator<Item = &'a ForeignKey> + 'a {
        self.foreign_keys.iter().filter(move |fk| {
            fk.from_table == table && fk.from_columns.iter().any(|c| c == column)
        })
    }
}

/// Represents a table or collection.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Table {
    pub name: String,

    pub columns: Vec<Column>,

    /// Column names that form the primary key.
    pub primary_key: Vec<String>,
}

impl Table {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_columns(mut self, columns: Vec<Column>) -> Self {
        self.columns = columns;
        self
    }

    pub fn with_primary_key(mut self, columns: Vec<String>) -> Self {
        self.primary_key = columns;
        self
    }
}

/// Represents a column, or a sampled document field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Column {
    pub name: String,

    /// Engine-reported type; empty when unknown.
    pub data_type: String,

    pub is_nullable: bool,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            is_nullable: true,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.is_nullable = false;
        self
    }
}

/// Represents a foreign key relationship.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ForeignKey {
    pub from_table: String,
    pub from_columns: Vec<String>,
    pub to_table: String,
    pub to_columns: Vec<String>,
}
