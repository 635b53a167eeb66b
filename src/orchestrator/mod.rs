//! AI response orchestration.
//!
//! `Orchestrator` is the service the HTTP layer talks to. It owns the shared
//! collaborators (store, LLM, pool, gateway, registry), starts one
//! [`runner::SessionRunner`] task per posted message, and handles the
//! user-triggered proposal operations.

mod runner;

use crate::db::ExecutionResult;
use crate::error::{CopilotError, Result};
use crate::gateway::{QueryGateway, Trigger};
use crate::llm::LlmClient;
use crate::pool::PoolManager;
use crate::store::{
    Chat, ChatStore, Connection, CredentialRef, Message, ProposalOutcome, ProposalStatus,
    QueryProposal,
};
use crate::stream::{self, EventSubscription, StreamRegistry, StreamSession};
use dashmap::DashSet;
use runner::SessionRunner;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Options for a new chat.
#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    pub auto_execute: bool,
    pub share_with_ai: bool,
}

#[derive(Clone)]
pub struct Orchestrator {
    store: Arc<dyn ChatStore>,
    llm: Arc<dyn LlmClient>,
    pool: Arc<PoolManager>,
    gateway: QueryGateway,
    registry: StreamRegistry,
    /// Proposals with a user-triggered execution in flight.
    executing: Arc<DashSet<String>>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn ChatStore>,
        llm: Arc<dyn LlmClient>,
        pool: Arc<PoolManager>,
        gateway: QueryGateway,
        registry: StreamRegistry,
    ) -> Self {
        Self {
            store,
            llm,
            pool,
            gateway,
            registry,
            executing: Arc::new(DashSet::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn ChatStore> {
        &self.store
    }

    pub fn registry(&self) -> &StreamRegistry {
        &self.registry
    }

    pub fn pool(&self) -> &Arc<PoolManager> {
        &self.pool
    }

    async fn owned_chat(&self, user: &str, chat_id: &str) -> Result<Chat> {
        let chat = self.store.get_chat(chat_id).await?;
        chat.ensure_owner(user)?;
        Ok(chat)
    }

    async fn owned_connection(&self, user: &str, connection_id: &str) -> Result<Connection> {
        let connection = self.store.get_connection(connection_id).await?;
        if connection.owner != user {
            return Err(CopilotError::forbidden(format!(
                "connection {connection_id} belongs to another user"
            )));
        }
        Ok(connection)
    }

    pub async fn create_chat(
        &self,
        user: &str,
        connection_id: &str,
        options: ChatOptions,
    ) -> Result<Chat> {
        self.owned_connection(user, connection_id).await?;
        let chat = Chat::new(user, connection_id)
            .with_auto_execute(options.auto_execute)
            .with_share_with_ai(options.share_with_ai);
        let chat = self.store.create_chat(chat).await?;
        info!(chat_id = %chat.id, connection_id, "Chat created");
        Ok(chat)
    }

    pub async fn list_messages(&self, user: &str, chat_id: &str) -> Result<Vec<Message>> {
        self.owned_chat(user, chat_id).await?;
        self.store.list_messages(chat_id).await
    }

    /// Persists the user's message and starts streaming the AI response.
    ///
    /// Fails with `AlreadyStreaming` (and persists nothing) while the chat has
    /// a non-terminal session.
    pub async fn post_message(
        &self,
        user: &str,
        chat_id: &str,
        content: &str,
    ) -> Result<(Message, Arc<StreamSession>)> {
        if content.trim().is_empty() {
            return Err(CopilotError::bad_request("message content is empty"));
        }
        let chat = self.owned_chat(user, chat_id).await?;
        let session = self.registry.start(chat_id)?;

        let message = match self.store.append_message(Message::user(chat_id, content)).await {
            Ok(message) => message,
            Err(e) => {
                let _ = self.registry.fail(&session, &e);
                return Err(e);
            }
        };

        let runner = SessionRunner::new(self.clone(), chat, session.clone());
        tokio::spawn(runner.run());
        Ok((message, session))
    }

    pub async fn cancel(&self, user: &str, chat_id: &str) -> Result<Arc<StreamSession>> {
        self.owned_chat(user, chat_id).await?;
        self.registry.cancel(chat_id)
    }

    pub async fn subscribe(
        &self,
        user: &str,
        chat_id: &str,
        after_sequence: u64,
    ) -> Result<EventSubscription> {
        self.owned_chat(user, chat_id).await?;
        stream::subscribe(&self.registry, chat_id, after_sequence)
    }

    /// Runs a proposal on the user's behalf. Writes need `confirmed`.
    pub async fn execute_proposal(
        &self,
        user: &str,
        chat_id: &str,
        proposal_id: &str,
        confirmed: bool,
    ) -> Result<(QueryProposal, ExecutionResult)> {
        self.owned_chat(user, chat_id).await?;
        let proposal = self.chat_proposal(chat_id, proposal_id).await?;
        if proposal.status.is_final() {
            return Err(CopilotError::invalid_transition(format!(
                "proposal {proposal_id} is already {}",
                proposal.status
            )));
        }
        let Some(_claim) = ExecutionClaim::acquire(&self.executing, proposal_id) else {
            return Err(CopilotError::invalid_transition(format!(
                "proposal {proposal_id} is already executing"
            )));
        };
        self.run_user_execution(&proposal, confirmed).await
    }

    async fn run_user_execution(
        &self,
        proposal: &QueryProposal,
        confirmed: bool,
    ) -> Result<(QueryProposal, ExecutionResult)> {
        let connection = self.store.get_connection(&proposal.connection_id).await?;
        let result = self
            .gateway
            .run(
                &self.pool,
                &connection,
                &proposal.query,
                Trigger::User { confirmed },
                &CancellationToken::new(),
            )
            .await;

        match result {
            Ok(result) => {
                let updated = self
                    .store
                    .update_proposal(
                        &proposal.id,
                        ProposalStatus::UserExecuted,
                        ProposalOutcome::Executed(result.summary()),
                    )
                    .await?;
                info!(
                    chat_id = %proposal.chat_id,
                    proposal_id = %proposal.id,
                    "Proposal executed by user"
                );
                Ok((updated, result))
            }
            Err(e) => {
                // Retryable refusals leave the proposal open
                if !matches!(
                    e,
                    CopilotError::PermissionDenied(_)
                        | CopilotError::PoolExhausted(_)
                        | CopilotError::ConnectFailed(_)
                ) {
                    self.store
                        .update_proposal(
                            &proposal.id,
                            ProposalStatus::Failed,
                            ProposalOutcome::Failed(e.to_string()),
                        )
                        .await?;
                }
                Err(e)
            }
        }
    }

    pub async fn reject_proposal(
        &self,
        user: &str,
        chat_id: &str,
        proposal_id: &str,
    ) -> Result<QueryProposal> {
        self.owned_chat(user, chat_id).await?;
        self.chat_proposal(chat_id, proposal_id).await?;
        self.store
            .update_proposal(proposal_id, ProposalStatus::Rejected, ProposalOutcome::None)
            .await
    }

    /// Re-runs a read-only query to feed a visualization.
    pub async fn execute_visualization(
        &self,
        user: &str,
        connection_id: &str,
        query: &str,
    ) -> Result<ExecutionResult> {
        let connection = self.owned_connection(user, connection_id).await?;
        self.gateway
            .run(
                &self.pool,
                &connection,
                query,
                Trigger::Visualization,
                &CancellationToken::new(),
            )
            .await
    }

    /// Replaces a connection's credentials and drops its pooled handles.
    pub async fn rotate_credentials(
        &self,
        user: &str,
        connection_id: &str,
        credentials: CredentialRef,
    ) -> Result<()> {
        self.owned_connection(user, connection_id).await?;
        self.store
            .rotate_credentials(connection_id, credentials)
            .await?;
        self.pool.evict(connection_id).await;
        Ok(())
    }

    async fn chat_proposal(&self, chat_id: &str, proposal_id: &str) -> Result<QueryProposal> {
        let proposal = self.store.get_proposal(proposal_id).await?;
        if proposal.chat_id != chat_id {
            warn!(chat_id, proposal_id, "Proposal requested through another chat");
            return Err(CopilotError::not_found(format!("proposal {proposal_id}")));
        }
        Ok(proposal)
    }
}

/// Marks a proposal as executing until dropped, including when the caller
/// abandons the request mid-flight.
struct ExecutionClaim {
    executing: Arc<DashSet<String>>,
    proposal_id: String,
}

impl ExecutionClaim {
    fn acquire(executing: &Arc<DashSet<String>>, proposal_id: &str) -> Option<Self> {
        if !executing.insert(proposal_id.to_string()) {
            return None;
        }
        Some(Self {
            executing: executing.clone(),
            proposal_id: proposal_id.to_string(),
        })
    }
}

impl Drop for ExecutionClaim {
    fn drop(&mut self) {
        self.executing.remove(&self.proposal_id);
    }
}
