//! Dialing of new handles.

use crate::db::{self, DatabaseClient};
use crate::error::Result;
use crate::store::ChatStore;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Creates a fresh handle for a connection id.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, connection_id: &str) -> Result<Arc<dyn DatabaseClient>>;
}

/// Resolves the connection record and its credentials through the chat store,
/// then dials the engine.
pub struct EngineConnector {
    store: Arc<dyn ChatStore>,
}

impl EngineConnector {
    pub fn new(store: Arc<dyn ChatStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Connector for EngineConnector {
    async fn connect(&self, connection_id: &str) -> Result<Arc<dyn DatabaseClient>> {
        let connection = self.store.get_connection(connection_id).await?;
        let credentials = connection.credentials.clone();
        // Keyring lookups block on the OS secret service
        let password = tokio::task::spawn_blocking(move || credentials.resolve())
            .await
            .map_err(|e| crate::error::CopilotError::internal(format!("credential task: {e}")))??;

        debug!(
            connection_id,
            target = %connection.config.display_string(),
            "Dialing database"
        );
        let client = db::connect(&connection.config, password.as_deref()).await?;
        Ok(Arc::from(client))
    }
}
