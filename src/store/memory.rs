//! In-memory chat store.

use super::{
    Chat, ChatStore, Connection, CredentialRef, Message, ProposalOutcome, ProposalStatus,
    QueryProposal,
};
use crate::error::{CopilotError, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct Tables {
    connections: HashMap<String, Connection>,
    chats: HashMap<String, Chat>,
    messages: Vec<Message>,
    proposals: Vec<QueryProposal>,
}

/// Keeps every record in process memory. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChatStore for MemoryStore {
    async fn create_connection(&self, connection: Connection) -> Result<Connection> {
        let mut tables = self.tables.write().await;
        if tables.connections.contains_key(&connection.id) {
            return Err(CopilotError::bad_request(format!(
                "connection {} already exists",
                connection.id
            )));
        }
        tables
            .connections
            .insert(connection.id.clone(), connection.clone());
        Ok(connection)
    }

    async fn get_connection(&self, id: &str) -> Result<Connection> {
        self.tables
            .read()
            .await
            .connections
            .get(id)
            .cloned()
            .ok_or_else(|| CopilotError::not_found(format!("connection {id}")))
    }

    async fn rotate_credentials(&self, id: &str, credentials: CredentialRef) -> Result<()> {
        let mut tables = self.tables.write().await;
        let connection = tables
            .connections
            .get_mut(id)
            .ok_or_else(|| CopilotError::not_found(format!("connection {id}")))?;
        connection.credentials = credentials;
        Ok(())
    }

    async fn create_chat(&self, chat: Chat) -> Result<Chat> {
        let mut tables = self.tables.write().await;
        if !tables.connections.contains_key(&chat.connection_id) {
            return Err(CopilotError::not_found(format!(
                "connection {}",
                chat.connection_id
            )));
        }
        tables.chats.insert(chat.id.clone(), chat.clone());
        Ok(chat)
    }

    async fn get_chat(&self, id: &str) -> Result<Chat> {
        self.tables
            .read()
            .await
            .chats
            .get(id)
            .cloned()
            .ok_or_else(|| CopilotError::not_found(format!("chat {id}")))
    }

    async fn append_message(&self, message: Message) -> Result<Message> {
        let mut tables = self.tables.write().await;
        let chat = tables
            .chats
            .get_mut(&message.chat_id)
            .ok_or_else(|| CopilotError::not_found(format!("chat {}", message.chat_id)))?;
        chat.updated_at = Utc::now();
        tables.messages.push(message.clone());
        Ok(message)
    }

    async fn list_messages(&self, chat_id: &str) -> Result<Vec<Message>> {
        let tables = self.tables.read().await;
        if !tables.chats.contains_key(chat_id) {
            return Err(CopilotError::not_found(format!("chat {chat_id}")));
        }
        Ok(tables
            .messages
            .iter()
            .filter(|m| m.chat_id == chat_id)
            .map(|m| {
                let mut message = m.clone();
                message.proposals = tables
                    .proposals
                    .iter()
                    .filter(|p| p.message_id == m.id)
                    .cloned()
                    .collect();
                message
            })
            .collect())
    }

    async fn save_proposal(&self, proposal: QueryProposal) -> Result<QueryProposal> {
        let mut tables = self.tables.write().await;
        if !tables.chats.contains_key(&proposal.chat_id) {
            return Err(CopilotError::not_found(format!("chat {}", proposal.chat_id)));
        }
        tables.proposals.push(proposal.clone());
        Ok(proposal)
    }

    async fn get_proposal(&self, id: &str) -> Result<QueryProposal> {
        self.tables
            .read()
            .await
            .proposals
            .iter()
            .find(|p| p.id == id)
            .cloned()
            .ok_or_else(|| CopilotError::not_found(format!("proposal {id}")))
    }

    async fn update_proposal(
        &self,
        id: &str,
        status: ProposalStatus,
        outcome: ProposalOutcome,
    ) -> Result<QueryProposal> {
        let mut tables = self.tables.write().await;
        let proposal = tables
            .proposals
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| CopilotError::not_found(format!("proposal {id}")))?;

        proposal.status = proposal.status.transition(status)?;
        match outcome {
            ProposalOutcome::Executed(summary) => proposal.result_summary = Some(summary),
            ProposalOutcome::Failed(error) => proposal.error = Some(error),
            ProposalOutcome::None => {}
        }
        Ok(proposal.clone())
    }

    async fn list_proposals(&self, chat_id: &str) -> Result<Vec<QueryProposal>> {
        Ok(self
            .tables
            .read()
            .await
            .proposals
            .iter()
            .filter(|p| p.chat_id == chat_id)
            .cloned()
            .collect())
    }
}
