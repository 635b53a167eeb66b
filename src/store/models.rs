//! Records kept by the chat store.

use super::CredentialRef;
use crate::config::ConnectionConfig;
use crate::db::EngineKind;
use crate::error::{CopilotError, Result};
use crate::safety::{ClassificationResult, SafetyLevel};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub type ConnectionId = String;
pub type ChatId = String;
pub type MessageId = String;
pub type ProposalId = String;

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// One external database a user has attached.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub id: ConnectionId,
    pub owner: String,
    pub name: String,
    /// Target description without any secret.
    pub config: ConnectionConfig,
    #[serde(skip_serializing, default)]
    pub credentials: CredentialRef,
}

impl Connection {
    /// Builds a record from a connection config, moving any password source
    /// out of the config and into `credentials`.
    pub fn from_config(
        id: impl Into<String>,
        owner: impl Into<String>,
        name: impl Into<String>,
        config: &ConnectionConfig,
    ) -> Result<Self> {
        let mut config = config.normalized()?;
        let credentials = config.credentials();
        config.password = None;
        config.password_env = None;
        config.keyring = None;
        Ok(Self {
            id: id.into(),
            owner: owner.into(),
            name: name.into(),
            config,
            credentials,
        })
    }

    pub fn engine(&self) -> EngineKind {
        self.config.engine
    }
}

/// A conversation scoped to one connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: ChatId,
    pub owner: String,
    pub connection_id: ConnectionId,
    pub auto_execute: bool,
    pub share_with_ai: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Chat {
    pub fn new(owner: impl Into<String>, connection_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            owner: owner.into(),
            connection_id: connection_id.into(),
            auto_execute: false,
            share_with_ai: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_auto_execute(mut self, auto_execute: bool) -> Self {
        self.auto_execute = auto_execute;
        self
    }

    pub fn with_share_with_ai(mut self, share_with_ai: bool) -> Self {
        self.share_with_ai = share_with_ai;
        self
    }

    /// Fails with `Forbidden` unless `user` owns the chat.
    pub fn ensure_owner(&self, user: &str) -> Result<()> {
        if self.owner == user {
            Ok(())
        } else {
            Err(CopilotError::forbidden(format!(
                "chat {} belongs to another user",
                self.id
            )))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// How an assistant message ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Completion {
    Complete,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion: Option<Completion>,
    pub created_at: DateTime<Utc>,
    /// Filled in by the store when messages are listed.
    #[serde(default)]
    pub proposals: Vec<QueryProposal>,
}

impl Message {
    pub fn user(chat_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            chat_id: chat_id.into(),
            role: Role::User,
            content: content.into(),
            session_id: None,
            completion: None,
            created_at: Utc::now(),
            proposals: Vec::new(),
        }
    }

    pub fn assistant(
        id: impl Into<String>,
        chat_id: impl Into<String>,
        session_id: impl Into<String>,
        content: impl Into<String>,
        completion: Completion,
    ) -> Self {
        Self {
            id: id.into(),
            chat_id: chat_id.into(),
            role: Role::Assistant,
            content: content.into(),
            session_id: Some(session_id.into()),
            completion: Some(completion),
            created_at: Utc::now(),
            proposals: Vec::new(),
        }
    }
}

/// Execution status of a proposal.
///
/// `Proposed` is the only non-final status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProposalStatus {
    Proposed,
    AutoExecuted,
    UserExecuted,
    Rejected,
    Failed,
}

impl ProposalStatus {
    pub fn is_final(&self) -> bool {
        !matches!(self, Self::Proposed)
    }

    /// Returns the new status if moving from `self` to `next` is allowed.
    pub fn transition(self, next: ProposalStatus) -> Result<ProposalStatus> {
        if self == Self::Proposed && next != Self::Proposed {
            Ok(next)
        } else {
            Err(CopilotError::invalid_transition(format!(
                "proposal cannot move from {self} to {next}"
            )))
        }
    }
}

impl fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Proposed => "proposed",
            Self::AutoExecuted => "auto-executed",
            Self::UserExecuted => "user-executed",
            Self::Rejected => "rejected",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Classification as recorded on a proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposalClassification {
    pub read_only: bool,
    pub level: SafetyLevel,
    pub statement: String,
}

impl From<&ClassificationResult> for ProposalClassification {
    fn from(result: &ClassificationResult) -> Self {
        Self {
            read_only: result.is_read_only(),
            level: result.level,
            statement: result.statement_type.to_string(),
        }
    }
}

/// An AI-suggested statement and what became of it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryProposal {
    pub id: ProposalId,
    pub message_id: MessageId,
    pub chat_id: ChatId,
    pub connection_id: ConnectionId,
    pub query: String,
    pub language: String,
    /// `None` when the text could not be parsed for the engine.
    pub classification: Option<ProposalClassification>,
    pub status: ProposalStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl QueryProposal {
    pub fn new(
        message_id: impl Into<String>,
        chat: &Chat,
        query: impl Into<String>,
        language: impl Into<String>,
        classification: Option<ProposalClassification>,
    ) -> Self {
        Self {
            id: new_id(),
            message_id: message_id.into(),
            chat_id: chat.id.clone(),
            connection_id: chat.connection_id.clone(),
            query: query.into(),
            language: language.into(),
            classification,
            status: ProposalStatus::Proposed,
            result_summary: None,
            error: None,
            created_at: Utc::now(),
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.classification
            .as_ref()
            .map(|c| c.read_only)
            .unwrap_or(false)
    }
}

/// Final outcome applied to a proposal together with its status change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProposalOutcome {
    Executed(String),
    Failed(String),
    None,
}
