//! Error types for the copilot.
//!
//! Defines the main error enum used throughout the service. Each variant maps
//! to one attributable failure reason so that stream events and HTTP responses
//! can carry a stable code alongside the human-readable message.

use thiserror::Error;

/// Main error type for copilot operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CopilotError {
    /// No pooled handle became available within the acquire timeout.
    #[error("Connection pool exhausted: {0}")]
    PoolExhausted(String),

    /// Dialing the external database failed or timed out.
    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    /// The query text could not be parsed for its engine.
    #[error("Syntax rejected: {0}")]
    SyntaxRejected(String),

    /// A mutating statement was blocked for the requesting trigger.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Query execution exceeded the gateway timeout.
    #[error("Query timed out: {0}")]
    EngineTimeout(String),

    /// Engine-native failure; the message is the engine's, verbatim.
    #[error("{0}")]
    EngineError(String),

    /// The chat already has a non-terminal stream session.
    #[error("Chat {0} is already streaming")]
    AlreadyStreaming(String),

    /// Cancel was requested but nothing is streaming.
    #[error("No active stream for chat {0}")]
    NoActiveStream(String),

    /// The AI service could not be reached or failed mid-stream.
    #[error("AI service unavailable: {0}")]
    AiServiceUnavailable(String),

    /// The AI service stopped producing chunks within the chunk timeout.
    #[error("AI service timed out: {0}")]
    AiTimeout(String),

    /// The operation was abandoned because its session was cancelled.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// A state machine rejected a transition.
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// A referenced record does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The caller does not own the referenced record.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// The request was malformed.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Configuration errors (invalid config file, missing required fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal application errors (unexpected states, bugs, etc.)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CopilotError {
    pub fn pool_exhausted(msg: impl Into<String>) -> Self {
        Self::PoolExhausted(msg.into())
    }

    pub fn connect_failed(msg: impl Into<String>) -> Self {
        Self::ConnectFailed(msg.into())
    }

    pub fn syntax(msg: impl Into<String>) -> Self {
        Self::SyntaxRejected(msg.into())
    }

    pub fn permission_denied(msg: impl Into<String>) -> Self {
        Self::PermissionDenied(msg.into())
    }

    pub fn engine_timeout(msg: impl Into<String>) -> Self {
        Self::EngineTimeout(msg.into())
    }

    pub fn engine(msg: impl Into<String>) -> Self {
        Self::EngineError(msg.into())
    }

    pub fn ai_unavailable(msg: impl Into<String>) -> Self {
        Self::AiServiceUnavailable(msg.into())
    }

    pub fn ai_timeout(msg: impl Into<String>) -> Self {
        Self::AiTimeout(msg.into())
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    pub fn invalid_transition(msg: impl Into<String>) -> Self {
        Self::InvalidTransition(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    /// Creates a configuration error with the given message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Creates an internal error with the given message.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Returns the error category as a string for display purposes.
    pub fn category(&self) -> &'static str {
        match self {
            Self::PoolExhausted(_) | Self::ConnectFailed(_) => "Connection Error",
            Self::SyntaxRejected(_) | Self::PermissionDenied(_) => "Safety Error",
            Self::EngineTimeout(_) | Self::EngineError(_) => "Query Error",
            Self::AlreadyStreaming(_) | Self::NoActiveStream(_) | Self::InvalidTransition(_) => {
                "Stream Error"
            }
            Self::AiServiceUnavailable(_) | Self::AiTimeout(_) => "AI Error",
            Self::Cancelled(_) => "Cancelled",
            Self::NotFound(_) | Self::Forbidden(_) | Self::BadRequest(_) => "Request Error",
            Self::Config(_) => "Configuration Error",
            Self::Internal(_) => "Internal Error",
        }
    }

    /// Stable machine-readable code, used in stream events and API bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::PoolExhausted(_) => "pool_exhausted",
            Self::ConnectFailed(_) => "connect_failed",
            Self::SyntaxRejected(_) => "syntax_rejected",
            Self::PermissionDenied(_) => "permission_denied",
            Self::EngineTimeout(_) => "engine_timeout",
            Self::EngineError(_) => "engine_error",
            Self::AlreadyStreaming(_) => "already_streaming",
            Self::NoActiveStream(_) => "no_active_stream",
            Self::AiServiceUnavailable(_) => "ai_service_unavailable",
            Self::AiTimeout(_) => "ai_timeout",
            Self::Cancelled(_) => "cancelled",
            Self::InvalidTransition(_) => "invalid_transition",
            Self::NotFound(_) => "not_found",
            Self::Forbidden(_) => "forbidden",
            Self::BadRequest(_) => "bad_request",
            Self::Config(_) => "config",
            Self::Internal(_) => "internal",
        }
    }

    /// Whether a pooled handle that produced this error should be discarded
    /// instead of returned to the free-list.
    pub fn poisons_handle(&self) -> bool {
        matches!(
            self,
            Self::EngineTimeout(_) | Self::Cancelled(_) | Self::ConnectFailed(_)
        )
    }
}

/// Result type alias using CopilotError.
pub type Result<T> = std::result::Result<T, CopilotError>;
