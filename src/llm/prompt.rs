//! Prompt construction for LLM requests.
//!
//! The system prompt is engine-specific. Database contents (schema and query
//! results) are only included when the chat shares them with the AI.

use crate::db::{EngineKind, Schema};
use crate::llm::types::Message;
use crate::store::{self, QueryProposal};

/// Maximum number of prior result summaries included in the prompt.
const MAX_RESULT_SUMMARIES: usize = 5;

const SQL_INSTRUCTIONS: &str = r#"INSTRUCTIONS:
- Generate only valid {dialect} SQL
- Use appropriate JOINs based on foreign keys
- Limit results to 100 rows unless the user specifies otherwise
- Prefer read-only queries; writes always wait for the user's confirmation

OUTPUT FORMAT:
Wrap each query in a ```sql code block, or call the propose_query tool.
Put explanations before or after the code block."#;

const DOCUMENT_INSTRUCTIONS: &str = r#"INSTRUCTIONS:
- Express every query as a MongoDB database command document in JSON,
  e.g. {"find": "orders", "filter": {"status": "open"}, "limit": 100}
- Use "aggregate" with a "pipeline" for grouping and joins
- Prefer read-only commands; writes always wait for the user's confirmation

OUTPUT FORMAT:
Wrap each command in a ```json code block, or call the propose_query tool.
Put explanations before or after the code block."#;

/// What the prompt may reveal about the user's data.
#[derive(Debug, Default)]
pub struct PromptContext<'a> {
    pub schema: Option<&'a Schema>,
    pub results: &'a [QueryProposal],
}

/// Builds the system prompt for the given engine.
pub fn build_system_prompt(engine: EngineKind, context: &PromptContext<'_>) -> String {
    let mut prompt = match engine {
        EngineKind::Postgres => format!(
            "You are a database assistant for a PostgreSQL database.\n\n{}",
            SQL_INSTRUCTIONS.replace("{dialect}", "PostgreSQL")
        ),
        EngineKind::Sqlite => format!(
            "You are a database assistant for a SQLite database.\n\n{}",
            SQL_INSTRUCTIONS.replace("{dialect}", "SQLite")
        ),
        EngineKind::Mongo => format!(
            "You are a database assistant for a MongoDB database.\n\n{DOCUMENT_INSTRUCTIONS}"
        ),
    };

    if let Some(schema) = context.schema.filter(|s| !s.is_empty()) {
        prompt.push_str("\n\nDATABASE SCHEMA:\n");
        prompt.push_str(&schema.format_for_prompt());
    }

    let summaries: Vec<String> = context
        .results
        .iter()
        .rev()
        .filter_map(|p| {
            p.result_summary
                .as_ref()
                .map(|summary| format!("- {}\n  -> {summary}", p.query.replace('\n', " ")))
        })
        .take(MAX_RESULT_SUMMARIES)
        .collect();
    if !summaries.is_empty() {
        prompt.push_str("\n\nRECENT QUERY RESULTS:\n");
        for summary in summaries.into_iter().rev() {
            prompt.push_str(&summary);
            prompt.push('\n');
        }
    }

    prompt
}

/// Builds the complete message list: system prompt, then the chat history.
pub fn build_messages(
    engine: EngineKind,
    context: &PromptContext<'_>,
    history: &[store::Message],
) -> Vec<Message> {
    let mut messages = Vec::with_capacity(history.len() + 1);
    messages.push(Message::system(build_system_prompt(engine, context)));
    messages.extend(history.iter().filter(|m| !m.content.is_empty()).map(|m| {
        match m.role {
            store::Role::User => Message::user(m.content.clone()),
            store::Role::Assistant => Message::assistant(m.content.clone()),
        }
    }));
    messages
}
