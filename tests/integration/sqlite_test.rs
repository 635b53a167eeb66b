//! A full chat turn against a real SQLite file.

use super::{collect_events, names};
use db_copilot::app::App;
use db_copilot::config::{Config, ConnectionConfig};
use db_copilot::db::{DatabaseClient, EngineKind, ExecutionLimits, SqliteClient, Value};
use db_copilot::llm::MockLlmClient;
use db_copilot::orchestrator::ChatOptions;
use db_copilot::pool::EngineConnector;
use db_copilot::store::{ChatStore, MemoryStore, ProposalStatus};
use db_copilot::stream::EventKind;
use sqlx::sqlite::SqliteConnectOptions;
use std::sync::Arc;
use tempfile::TempDir;

const OWNER: &str = "local";

/// Creates a small database file and returns its directory guard and path.
async fn seeded_database() -> (TempDir, String) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shop.db");
    let client = SqliteClient::from_options(
        SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true),
    )
    .await
    .unwrap();
    client
        .execute(
            "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL);
             INSERT INTO users (name) VALUES ('ada'), ('grace'), ('linus');",
            &ExecutionLimits::default(),
        )
        .await
        .unwrap();
    client.close().await.unwrap();
    (dir, path.to_string_lossy().into_owned())
}

async fn sqlite_app(path: &str, llm: MockLlmClient) -> App {
    let mut config = Config::default();
    config.connections.insert(
        "shop".into(),
        ConnectionConfig {
            engine: EngineKind::Sqlite,
            database: Some(path.to_string()),
            ..ConnectionConfig::default()
        },
    );
    let store: Arc<dyn ChatStore> = Arc::new(MemoryStore::new());
    let connector = Arc::new(EngineConnector::new(store.clone()));
    App::build(config, store, Arc::new(llm), connector)
        .await
        .unwrap()
}

/// Scenario: Auto-executed query on SQLite
/// Given a chat on a SQLite file with auto-execute on
/// When the AI proposes a count
/// Then the result event carries the real count
#[tokio::test]
async fn test_auto_executed_query_reads_real_rows() {
    let (_dir, path) = seeded_database().await;
    let llm = MockLlmClient::new().with_response(
        "how many",
        "Counting:\n```sql\nSELECT count(*) AS n FROM users;\n```\n",
    );
    let app = sqlite_app(&path, llm).await;
    let orchestrator = &app.state().orchestrator;
    let chat = orchestrator
        .create_chat(
            OWNER,
            "shop",
            ChatOptions {
                auto_execute: true,
                share_with_ai: true,
            },
        )
        .await
        .unwrap();

    orchestrator
        .post_message(OWNER, &chat.id, "how many users are there?")
        .await
        .unwrap();
    let events = collect_events(orchestrator, &chat.id, 0).await;

    assert_eq!(names(&events).last(), Some(&"stream_completed"));
    let result = events
        .iter()
        .find_map(|e| match &e.kind {
            EventKind::QueryResult { result, .. } => Some(result.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(result.columns[0].name, "n");
    assert_eq!(result.rows, vec![vec![Value::Int(3)]]);

    let proposals = orchestrator.store().list_proposals(&chat.id).await.unwrap();
    assert_eq!(proposals[0].status, ProposalStatus::AutoExecuted);
}

#[tokio::test]
async fn test_confirmed_write_then_visualization() {
    let (_dir, path) = seeded_database().await;
    let llm = MockLlmClient::new();
    let app = sqlite_app(&path, llm).await;
    let orchestrator = &app.state().orchestrator;
    let chat = orchestrator
        .create_chat(OWNER, "shop", ChatOptions::default())
        .await
        .unwrap();

    orchestrator
        .post_message(OWNER, &chat.id, "delete user 1")
        .await
        .unwrap();
    collect_events(orchestrator, &chat.id, 0).await;
    let proposal = orchestrator.store().list_proposals(&chat.id).await.unwrap()[0].clone();

    let (updated, result) = orchestrator
        .execute_proposal(OWNER, &chat.id, &proposal.id, true)
        .await
        .unwrap();
    assert_eq!(updated.status, ProposalStatus::UserExecuted);
    assert_eq!(result.affected_rows, Some(1));

    let remaining = orchestrator
        .execute_visualization(OWNER, "shop", "SELECT name FROM users ORDER BY id")
        .await
        .unwrap();
    assert_eq!(
        remaining.rows,
        vec![
            vec![Value::String("grace".into())],
            vec![Value::String("linus".into())],
        ]
    );
}

#[tokio::test]
async fn test_engine_error_is_reported_verbatim() {
    let (_dir, path) = seeded_database().await;
    let app = sqlite_app(&path, MockLlmClient::new()).await;
    let err = app
        .state()
        .orchestrator
        .execute_visualization(OWNER, "shop", "SELECT * FROM missing_table")
        .await
        .unwrap_err();
    assert_eq!(err.code(), "engine_error");
    assert!(err.to_string().contains("no such table: missing_table"));
}
