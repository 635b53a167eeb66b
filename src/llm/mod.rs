//! LLM integration.
//!
//! The AI service is an opaque producer of chunks. `LlmClient` is the seam;
//! OpenAI and a scripted mock are the implementations.

pub mod factory;
pub mod mock;
pub mod openai;
pub mod parser;
pub mod prompt;
pub mod tools;
pub mod types;

pub use factory::create_client;
pub use mock::{MockLlmClient, MockStep};
pub use openai::{OpenAiClient, OpenAiConfig};
pub use parser::{ResponseSegmenter, Segment};
pub use prompt::{build_messages, build_system_prompt, PromptContext};
pub use tools::{get_tool_definitions, ProposeQueryInput, ToolDefinition, PROPOSE_QUERY};
pub use types::{LlmChunk, Message, Role, ToolCall};

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::str::FromStr;

use crate::error::Result;

/// Trait for LLM clients.
///
/// Implementations must be thread-safe (Send + Sync) to support async operations.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Opens a streaming completion for the given messages.
    ///
    /// The returned stream is lazy, finite and cannot be restarted; a retry
    /// needs a fresh call. Failing to open it is `AiServiceUnavailable`.
    async fn stream_chunks(
        &self,
        messages: &[Message],
    ) -> Result<BoxStream<'static, Result<LlmChunk>>>;
}

/// LLM provider type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LlmProvider {
    #[default]
    OpenAi,
    /// Mock client for testing (no API key required)
    Mock,
}

impl LlmProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Mock => "mock",
        }
    }
}

impl FromStr for LlmProvider {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "mock" => Ok(Self::Mock),
            _ => Err(format!("Unknown LLM provider: {s}")),
        }
    }
}

impl std::fmt::Display for LlmProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
