//! Service assembly.
//!
//! Wires the chat store, LLM client, connection pool, gateway and stream
//! registry into one [`Orchestrator`], seeds the configured connections, and
//! runs the HTTP server until shutdown.

use crate::api::{self, AppState};
use crate::config::{Config, ConnectionConfig};
use crate::error::{CopilotError, Result};
use crate::gateway::QueryGateway;
use crate::llm::{self, LlmClient};
use crate::orchestrator::Orchestrator;
use crate::pool::{Connector, EngineConnector, PoolManager};
use crate::store::{ChatStore, Connection, MemoryStore};
use crate::stream::StreamRegistry;
use axum::Router;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Owner assigned to configured connections that do not name one.
pub const DEFAULT_OWNER: &str = "local";

pub struct App {
    config: Config,
    state: Arc<AppState>,
    pool: Arc<PoolManager>,
}

impl App {
    /// Builds the service from configuration alone: in-memory store, the
    /// configured LLM provider and real engine connections.
    pub async fn from_config(config: Config) -> Result<Self> {
        let store: Arc<dyn ChatStore> = Arc::new(MemoryStore::new());
        let llm = llm::create_client(&config.llm)?;
        let connector = Arc::new(EngineConnector::new(store.clone()));
        Self::build(config, store, llm, connector).await
    }

    /// Builds the service from explicit collaborators.
    pub async fn build(
        config: Config,
        store: Arc<dyn ChatStore>,
        llm: Arc<dyn LlmClient>,
        connector: Arc<dyn Connector>,
    ) -> Result<Self> {
        config.validate()?;
        let seeded = seed_connections(store.as_ref(), &config).await?;
        if seeded > 0 {
            info!(count = seeded, "Seeded configured connections");
        }

        let pool = Arc::new(PoolManager::new(connector, config.pool.clone()));
        let orchestrator = Orchestrator::new(
            store,
            llm,
            pool.clone(),
            QueryGateway::new(config.gateway.clone()),
            StreamRegistry::new(config.stream.clone()),
        );

        Ok(Self {
            config,
            state: Arc::new(AppState::new(orchestrator)),
            pool,
        })
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    pub fn router(&self) -> Router {
        api::build_router(self.state.clone(), &self.config.server)
    }

    /// Serves HTTP until `shutdown` fires, then stops the pool health checker.
    pub async fn serve(self, shutdown: CancellationToken) -> Result<()> {
        let addr = self.config.server.bind_address();
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| CopilotError::config(format!("Failed to bind {addr}: {e}")))?;

        let checker = self.pool.spawn_health_checker(shutdown.child_token());
        info!(%addr, "Server listening");

        let signal = shutdown.clone();
        let served = axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { signal.cancelled().await })
            .await;

        shutdown.cancel();
        let _ = checker.await;
        served.map_err(|e| CopilotError::internal(format!("server error: {e}")))?;
        info!("Server stopped");
        Ok(())
    }
}

/// Registers every `[connections.<name>]` entry under its name.
async fn seed_connections(store: &dyn ChatStore, config: &Config) -> Result<usize> {
    let mut names: Vec<&String> = config.connections.keys().collect();
    names.sort();
    for name in &names {
        let connection = connection_record(name, &config.connections[*name])?;
        info!(
            connection_id = %connection.id,
            owner = %connection.owner,
            target = %connection.config.display_string(),
            "Registering connection"
        );
        store.create_connection(connection).await?;
    }
    Ok(names.len())
}

fn connection_record(name: &str, config: &ConnectionConfig) -> Result<Connection> {
    let mut config = config.normalized()?;
    config.apply_env_defaults();
    let owner = config
        .owner
        .clone()
        .unwrap_or_else(|| DEFAULT_OWNER.to_string());
    Connection::from_config(name, owner, name, &config)
}
