//! Mock LLM client for testing.
//!
//! Answers either from a fixed script of chunks, delays and failures, or from
//! canned responses chosen by patterns in the last user message.

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{CopilotError, Result};
use crate::llm::types::{LlmChunk, Message, Role, ToolCall};
use crate::llm::LlmClient;

/// Characters per chunk when a canned text response is streamed.
const CHUNK_CHARS: usize = 10;

/// One step of a scripted response.
#[derive(Debug, Clone)]
pub enum MockStep {
    Chunk(LlmChunk),
    /// Waits before the next step.
    Delay(Duration),
    /// Ends the stream with this error.
    Fail(CopilotError),
    /// Never produces another chunk.
    Stall,
}

impl MockStep {
    pub fn text(content: impl Into<String>) -> Self {
        Self::Chunk(LlmChunk::Text(content.into()))
    }

    pub fn tool_call(name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self::Chunk(LlmChunk::ToolCall(ToolCall {
            id: "mock_tool_call".to_string(),
            name: name.into(),
            arguments: arguments.into(),
        }))
    }
}

/// Mock LLM client that returns canned responses.
#[derive(Debug, Clone, Default)]
pub struct MockLlmClient {
    script: Option<Vec<MockStep>>,
    /// Custom response mappings (pattern -> response).
    custom_responses: Vec<(String, String)>,
    open_failure: Option<CopilotError>,
    requests: Arc<Mutex<Vec<Vec<Message>>>>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every request replays exactly these steps.
    pub fn scripted(steps: Vec<MockStep>) -> Self {
        Self {
            script: Some(steps),
            ..Self::default()
        }
    }

    /// When the input contains `pattern`, the mock streams `response`.
    pub fn with_response(
        mut self,
        pattern: impl Into<String>,
        response: impl Into<String>,
    ) -> Self {
        self.custom_responses.push((pattern.into(), response.into()));
        self
    }

    /// Opening the stream fails with this error.
    pub fn failing_open(mut self, error: CopilotError) -> Self {
        self.open_failure = Some(error);
        self
    }

    /// Message lists this client has been asked to answer, in order.
    pub fn requests(&self) -> Vec<Vec<Message>> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    fn mock_response(&self, input: &str) -> String {
        let input_lower = input.to_lowercase();

        for (pattern, response) in &self.custom_responses {
            if input_lower.contains(&pattern.to_lowercase()) {
                return response.clone();
            }
        }

        if input_lower.contains("all users") || input_lower.contains("show users") {
            return "Here are all users:\n```sql\nSELECT * FROM users;\n```\n".to_string();
        }

        if input_lower.contains("count") && input_lower.contains("orders") {
            return "Counting orders:\n```sql\nSELECT COUNT(*) FROM orders;\n```\n".to_string();
        }

        if input_lower.contains("delete") && input_lower.contains("user") {
            return "This removes the user:\n```sql\nDELETE FROM users WHERE id = 1;\n```\n"
                .to_string();
        }

        "I don't understand that question. Could you please rephrase it?".to_string()
    }

    fn extract_user_input(messages: &[Message]) -> String {
        messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.clone())
            .unwrap_or_default()
    }

    fn steps_for(&self, messages: &[Message]) -> Vec<MockStep> {
        if let Some(script) = &self.script {
            return script.clone();
        }
        let response = self.mock_response(&Self::extract_user_input(messages));
        response
            .chars()
            .collect::<Vec<_>>()
            .chunks(CHUNK_CHARS)
            .map(|c| MockStep::text(c.iter().collect::<String>()))
            .collect()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn stream_chunks(
        &self,
        messages: &[Message],
    ) -> Result<BoxStream<'static, Result<LlmChunk>>> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(messages.to_vec());
        }
        if let Some(error) = &self.open_failure {
            return Err(error.clone());
        }

        let steps: VecDeque<MockStep> = self.steps_for(messages).into();

        let chunks = stream::unfold(Some(steps), move |state| async move {
            let mut steps = state?;
            loop {
                match steps.pop_front()? {
                    MockStep::Delay(delay) => tokio::time::sleep(delay).await,
                    MockStep::Stall => futures::future::pending::<()>().await,
                    MockStep::Fail(error) => return Some((Err(error), None)),
                    MockStep::Chunk(chunk) => return Some((Ok(chunk), Some(steps))),
                }
            }
        });

        Ok(chunks.boxed())
    }
}
