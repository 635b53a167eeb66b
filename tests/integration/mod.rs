//! Shared harness for the integration tests.

pub mod api_test;
pub mod orchestrator_test;
pub mod pool_test;
pub mod postgres_test;
pub mod sqlite_test;

use async_trait::async_trait;
use db_copilot::app::App;
use db_copilot::config::{Config, ConnectionConfig};
use db_copilot::db::{DatabaseClient, EngineKind, MockDatabaseClient};
use db_copilot::error::Result;
use db_copilot::llm::MockLlmClient;
use db_copilot::orchestrator::{ChatOptions, Orchestrator};
use db_copilot::pool::Connector;
use db_copilot::store::{Chat, ChatStore, Connection, MemoryStore};
use db_copilot::stream::{Delivery, StreamEvent};
use futures::StreamExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub const OWNER: &str = "alice";
pub const CONNECTION: &str = "primary";

/// Hands out clones of one mock client and counts dials.
pub struct MockConnector {
    client: MockDatabaseClient,
    pub dials: AtomicUsize,
}

impl MockConnector {
    pub fn new(client: MockDatabaseClient) -> Self {
        Self {
            client,
            dials: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, _connection_id: &str) -> Result<Arc<dyn DatabaseClient>> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(self.client.clone()))
    }
}

/// Builds an app whose only connection, owned by [`OWNER`], is served by `db`.
pub async fn app_with(llm: MockLlmClient, db: MockDatabaseClient, config: Config) -> App {
    let store: Arc<dyn ChatStore> = Arc::new(MemoryStore::new());
    let target = ConnectionConfig {
        engine: EngineKind::Postgres,
        host: Some("localhost".into()),
        database: Some("app".into()),
        user: Some("app".into()),
        ..ConnectionConfig::default()
    };
    store
        .create_connection(Connection::from_config(CONNECTION, OWNER, "Primary", &target).unwrap())
        .await
        .unwrap();
    App::build(config, store, Arc::new(llm), Arc::new(MockConnector::new(db)))
        .await
        .unwrap()
}

pub async fn new_chat(orchestrator: &Orchestrator, auto_execute: bool, share_with_ai: bool) -> Chat {
    orchestrator
        .create_chat(
            OWNER,
            CONNECTION,
            ChatOptions {
                auto_execute,
                share_with_ai,
            },
        )
        .await
        .unwrap()
}

/// Follows the chat's stream from `after` until the terminal event.
pub async fn collect_events(orchestrator: &Orchestrator, chat_id: &str, after: u64) -> Vec<StreamEvent> {
    let mut subscription = orchestrator.subscribe(OWNER, chat_id, after).await.unwrap();
    let mut events = Vec::new();
    while let Some(delivery) = subscription.next().await {
        match delivery {
            Delivery::Event(event) => events.push(event),
            Delivery::Lagged { oldest_available } => {
                panic!("listener lagged, oldest available {oldest_available}")
            }
        }
    }
    events
}

pub fn names(events: &[StreamEvent]) -> Vec<&'static str> {
    events.iter().map(|e| e.kind.name()).collect()
}
