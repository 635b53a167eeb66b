//! OpenAI LLM client implementation.
//!
//! Streams chat completions over server-sent events, reassembling tool calls
//! whose arguments arrive in fragments.

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{CopilotError, Result};
use crate::llm::tools::{get_tool_definitions, ToolDefinition};
use crate::llm::types::{LlmChunk, Message, ToolCall};
use crate::llm::LlmClient;

/// Timeout for establishing the connection. The body is unbounded; the
/// orchestrator applies its own per-chunk deadline.
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// OpenAI API base URL.
const OPENAI_API_URL: &str = "https://api.openai.com/v1";

/// Maximum number of attempts to open the stream.
const MAX_RETRY_ATTEMPTS: u32 = 3;

/// Base delay for exponential backoff (milliseconds).
const RETRY_BASE_DELAY_MS: u64 = 1000;

/// OpenAI client configuration.
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    /// Model to use (e.g., "gpt-5", "gpt-5-mini").
    pub model: String,
    /// API root, for compatible gateways.
    pub base_url: String,
    pub connect_timeout_secs: u64,
}

impl OpenAiConfig {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            base_url: OPENAI_API_URL.to_string(),
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

/// OpenAI LLM client.
#[derive(Debug, Clone)]
pub struct OpenAiClient {
    config: OpenAiConfig,
    client: Client,
}

impl OpenAiClient {
    pub fn new(config: OpenAiConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .map_err(|e| CopilotError::config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self { config, client })
    }

    fn convert_messages(messages: &[Message]) -> Vec<OpenAiMessage> {
        messages
            .iter()
            .map(|m| OpenAiMessage {
                role: m.role.as_str().to_string(),
                content: m.content.clone(),
            })
            .collect()
    }

    fn convert_tools(tools: Vec<ToolDefinition>) -> Vec<OpenAiTool> {
        tools
            .into_iter()
            .map(|t| OpenAiTool {
                kind: "function",
                function: OpenAiFunction {
                    name: t.name,
                    description: t.description,
                    parameters: t.parameters,
                },
            })
            .collect()
    }

    /// Parses an API error response and returns (error, is_retryable).
    fn parse_error(status: reqwest::StatusCode, body: &str) -> (CopilotError, bool) {
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return (
                CopilotError::ai_unavailable("Authentication failed. Check OPENAI_API_KEY."),
                false,
            );
        }

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return (CopilotError::ai_unavailable("Rate limited by OpenAI."), true);
        }

        let is_retryable = status.is_server_error();

        if let Ok(error_response) = serde_json::from_str::<OpenAiErrorResponse>(body) {
            return (
                CopilotError::ai_unavailable(format!(
                    "OpenAI API error: {}",
                    error_response.error.message
                )),
                is_retryable,
            );
        }

        (
            CopilotError::ai_unavailable(format!("OpenAI API error ({status}): {body}")),
            is_retryable,
        )
    }

    fn map_request_error(error: &reqwest::Error) -> (CopilotError, bool) {
        if error.is_timeout() {
            (CopilotError::ai_timeout("OpenAI request timed out"), true)
        } else if error.is_connect() {
            (
                CopilotError::ai_unavailable("Failed to connect to OpenAI API"),
                true,
            )
        } else {
            (
                CopilotError::ai_unavailable(format!("Request failed: {error}")),
                false,
            )
        }
    }

    /// Sends the request, retrying transient failures with exponential backoff.
    async fn open(&self, request: &OpenAiRequest) -> Result<reqwest::Response> {
        let mut delay = Duration::from_millis(RETRY_BASE_DELAY_MS);
        let mut attempt = 1;

        loop {
            debug!(attempt, max = MAX_RETRY_ATTEMPTS, "OpenAI stream request");

            let (error, is_retryable) = match self
                .client
                .post(self.config.completions_url())
                .bearer_auth(&self.config.api_key)
                .json(request)
                .send()
                .await
            {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    Self::parse_error(status, &body)
                }
                Err(e) => Self::map_request_error(&e),
            };

            if !is_retryable || attempt >= MAX_RETRY_ATTEMPTS {
                return Err(error);
            }
            warn!(attempt, delay_ms = delay.as_millis() as u64, error = %error, "Retrying OpenAI request");
            tokio::time::sleep(delay).await;
            delay *= 2;
            attempt += 1;
        }
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn stream_chunks(
        &self,
        messages: &[Message],
    ) -> Result<BoxStream<'static, Result<LlmChunk>>> {
        let request = OpenAiRequest {
            model: self.config.model.clone(),
            messages: Self::convert_messages(messages),
            tools: Self::convert_tools(get_tool_definitions()),
            stream: true,
        };

        let response = self.open(&request).await?;
        let bytes = response.bytes_stream().boxed();

        let chunks = stream::unfold(
            (bytes, SseDecoder::default(), false),
            |(mut bytes, mut decoder, finished)| async move {
                if finished {
                    return None;
                }
                match bytes.next().await {
                    Some(Ok(data)) => {
                        let items = decoder.feed(&data);
                        let failed = items.iter().any(|r| r.is_err());
                        Some((items, (bytes, decoder, failed)))
                    }
                    Some(Err(e)) => {
                        let error =
                            CopilotError::ai_unavailable(format!("OpenAI stream dropped: {e}"));
                        Some((vec![Err(error)], (bytes, decoder, true)))
                    }
                    None => Some((decoder.finish(), (bytes, decoder, true))),
                }
            },
        )
        .flat_map(stream::iter);

        Ok(chunks.boxed())
    }
}

/// A tool call whose arguments are still arriving.
#[derive(Debug, Default)]
struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
}

/// Incremental decoder for the completion event stream.
///
/// Bytes may split lines anywhere, so incomplete lines are buffered.
#[derive(Debug, Default)]
struct SseDecoder {
    buffer: String,
    tool_calls: BTreeMap<u32, PartialToolCall>,
    done: bool,
}

impl SseDecoder {
    fn feed(&mut self, data: &[u8]) -> Vec<Result<LlmChunk>> {
        self.buffer.push_str(&String::from_utf8_lossy(data));
        let mut out = Vec::new();

        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            let line = line.trim();

            if line.is_empty() || line.starts_with(':') || self.done {
                continue;
            }
            let Some(data) = line.strip_prefix("data:").map(str::trim_start) else {
                continue;
            };
            if data == "[DONE]" {
                self.done = true;
                out.extend(self.flush_tool_calls().into_iter().map(Ok));
                continue;
            }

            match serde_json::from_str::<OpenAiStreamEvent>(data) {
                Ok(event) => self.apply(event, &mut out),
                Err(e) => {
                    out.push(Err(CopilotError::ai_unavailable(format!(
                        "malformed OpenAI stream event: {e}"
                    ))));
                    break;
                }
            }
        }
        out
    }

    fn apply(&mut self, event: OpenAiStreamEvent, out: &mut Vec<Result<LlmChunk>>) {
        for choice in event.choices {
            if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
                out.push(Ok(LlmChunk::Text(content)));
            }
            for fragment in choice.delta.tool_calls.unwrap_or_default() {
                let call = self.tool_calls.entry(fragment.index).or_default();
                if let Some(id) = fragment.id {
                    call.id = id;
                }
                if let Some(function) = fragment.function {
                    if let Some(name) = function.name {
                        call.name.push_str(&name);
                    }
                    if let Some(arguments) = function.arguments {
                        call.arguments.push_str(&arguments);
                    }
                }
            }
            if choice.finish_reason.as_deref() == Some("tool_calls") {
                out.extend(self.flush_tool_calls().into_iter().map(Ok));
            }
        }
    }

    fn flush_tool_calls(&mut self) -> Vec<LlmChunk> {
        std::mem::take(&mut self.tool_calls)
            .into_values()
            .map(|call| {
                LlmChunk::ToolCall(ToolCall {
                    id: call.id,
                    name: call.name,
                    arguments: call.arguments,
                })
            })
            .collect()
    }

    /// Called when the body ends. A stream that ends before `[DONE]` was cut off.
    fn finish(&mut self) -> Vec<Result<LlmChunk>> {
        if self.done {
            return Vec::new();
        }
        vec![Err(CopilotError::ai_unavailable(
            "OpenAI stream ended unexpectedly",
        ))]
    }
}

// OpenAI API types

#[derive(Debug, Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<OpenAiTool>,
    stream: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAiMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct OpenAiTool {
    #[serde(rename = "type")]
    kind: &'static str,
    function: OpenAiFunction,
}

#[derive(Debug, Serialize)]
struct OpenAiFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamEvent {
    #[serde(default)]
    choices: Vec<OpenAiStreamChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChoice {
    delta: OpenAiDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiDelta {
    content: Option<String>,
    tool_calls: Option<Vec<OpenAiToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct OpenAiToolCallDelta {
    index: u32,
    id: Option<String>,
    function: Option<OpenAiFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct OpenAiFunctionDelta {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiErrorResponse {
    error: OpenAiError,
}

#[derive(Debug, Deserialize)]
struct OpenAiError {
    message: String,
}
