//! LLM tool definitions for function calling.
//!
//! The model may propose a query either as a fenced block in its prose or by
//! calling `propose_query`; both end up as the same proposal.

use crate::error::{CopilotError, Result};
use serde::{Deserialize, Serialize};

pub const PROPOSE_QUERY: &str = "propose_query";

/// Tool definition for LLM function calling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Arguments of the `propose_query` tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposeQueryInput {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
}

impl ProposeQueryInput {
    pub fn parse(arguments: &str) -> Result<Self> {
        let input: Self = serde_json::from_str(arguments).map_err(|e| {
            CopilotError::ai_unavailable(format!("malformed {PROPOSE_QUERY} arguments: {e}"))
        })?;
        if input.query.trim().is_empty() {
            return Err(CopilotError::ai_unavailable(format!(
                "{PROPOSE_QUERY} called without a query"
            )));
        }
        Ok(input)
    }
}

/// Returns the tool definitions available to the LLM.
pub fn get_tool_definitions() -> Vec<ToolDefinition> {
    vec![ToolDefinition {
        name: PROPOSE_QUERY.to_string(),
        description: "Propose a query to run against the user's database. Read-only queries may \
                      run automatically; anything that writes waits for the user."
            .to_string(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "The complete query text: SQL, or a JSON command document for MongoDB"
                },
                "explanation": {
                    "type": "string",
                    "description": "One sentence on what the query returns (optional)"
                }
            },
            "required": ["query"]
        }),
    }]
}
