//! Chat, message and proposal records.
//!
//! Persistence of these records is an external collaborator; `ChatStore` is
//! the seam and `MemoryStore` the in-process implementation used by the
//! binary and the tests.

mod credentials;
mod memory;
mod models;

pub use credentials::CredentialRef;
pub use memory::MemoryStore;
pub use models::{
    new_id, Chat, ChatId, Completion, Connection, ConnectionId, Message, MessageId,
    ProposalClassification, ProposalId, ProposalOutcome, ProposalStatus, QueryProposal, Role,
};

use crate::error::Result;
use async_trait::async_trait;

#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn create_connection(&self, connection: Connection) -> Result<Connection>;

    async fn get_connection(&self, id: &str) -> Result<Connection>;

    /// Replaces the credentials of a connection. Callers are expected to evict
    /// pooled handles for it afterwards.
    async fn rotate_credentials(&self, id: &str, credentials: CredentialRef) -> Result<()>;

    async fn create_chat(&self, chat: Chat) -> Result<Chat>;

    async fn get_chat(&self, id: &str) -> Result<Chat>;

    /// Appends a message to its chat and bumps the chat's `updated_at`.
    async fn append_message(&self, message: Message) -> Result<Message>;

    /// Messages of a chat in creation order, each with its proposals attached.
    async fn list_messages(&self, chat_id: &str) -> Result<Vec<Message>>;

    async fn save_proposal(&self, proposal: QueryProposal) -> Result<QueryProposal>;

    async fn get_proposal(&self, id: &str) -> Result<QueryProposal>;

    /// Moves a proposal to `status`, recording the outcome.
    ///
    /// Fails with `InvalidTransition` if the proposal already has a final status.
    async fn update_proposal(
        &self,
        id: &str,
        status: ProposalStatus,
        outcome: ProposalOutcome,
    ) -> Result<QueryProposal>;

    /// Proposals of a chat in creation order.
    async fn list_proposals(&self, chat_id: &str) -> Result<Vec<QueryProposal>>;
}
