//! Gateway behavior against a live PostgreSQL server.
//!
//! These tests need DATABASE_URL; they skip themselves when it is unset.

use async_trait::async_trait;
use db_copilot::config::{ConnectionConfig, GatewayConfig, PoolConfig};
use db_copilot::db::{DatabaseClient, PostgresClient, Value};
use db_copilot::error::Result;
use db_copilot::gateway::{QueryGateway, Trigger};
use db_copilot::pool::{Connector, PoolManager};
use db_copilot::store::Connection;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn test_config() -> Option<ConnectionConfig> {
    let url = std::env::var("DATABASE_URL").ok()?;
    ConnectionConfig::from_connection_string(&url).ok()
}

/// Dials the configured server with the password from the URL.
struct UrlConnector(ConnectionConfig);

#[async_trait]
impl Connector for UrlConnector {
    async fn connect(&self, _connection_id: &str) -> Result<Arc<dyn DatabaseClient>> {
        let client = PostgresClient::connect(&self.0, self.0.password.as_deref()).await?;
        Ok(Arc::new(client))
    }
}

fn setup(config: ConnectionConfig, timeout_ms: u64) -> (PoolManager, QueryGateway, Connection) {
    let connection = Connection::from_config("pg", "alice", "Postgres", &config).unwrap();
    let pool = PoolManager::new(Arc::new(UrlConnector(config)), PoolConfig::default());
    let gateway = QueryGateway::new(GatewayConfig {
        timeout_ms,
        ..GatewayConfig::default()
    });
    (pool, gateway, connection)
}

#[tokio::test]
async fn test_select_through_gateway() {
    let Some(config) = test_config() else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };
    let (pool, gateway, connection) = setup(config, 5_000);

    let result = gateway
        .run(
            &pool,
            &connection,
            "SELECT 1::int4 AS one, 'x'::text AS label",
            Trigger::Auto,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(result.columns.len(), 2);
    assert_eq!(result.rows, vec![vec![Value::Int(1), Value::String("x".into())]]);
    assert_eq!(result.affected_rows, None);
    assert_eq!(pool.stats("pg").idle, 1);
}

#[tokio::test]
async fn test_slow_query_times_out_and_is_discarded() {
    let Some(config) = test_config() else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };
    let (pool, gateway, connection) = setup(config, 200);

    let err = gateway
        .run(
            &pool,
            &connection,
            "SELECT pg_sleep(5)",
            Trigger::Auto,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert_eq!(err.code(), "engine_timeout");
    assert_eq!(pool.stats("pg").live, 0);
}

#[tokio::test]
async fn test_engine_error_keeps_handle() {
    let Some(config) = test_config() else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };
    let (pool, gateway, connection) = setup(config, 5_000);

    let err = gateway
        .run(
            &pool,
            &connection,
            "SELECT * FROM copilot_table_that_does_not_exist",
            Trigger::Auto,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert_eq!(err.code(), "engine_error");
    assert!(err.to_string().contains("does not exist"));
    assert_eq!(pool.stats("pg").idle, 1);
}

#[tokio::test]
async fn test_unconfirmed_write_never_reaches_server() {
    let Some(config) = test_config() else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };
    let (pool, gateway, connection) = setup(config, 5_000);

    let err = gateway
        .run(
            &pool,
            &connection,
            "DROP TABLE copilot_table_that_does_not_exist",
            Trigger::User { confirmed: false },
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert_eq!(err.code(), "permission_denied");
    assert_eq!(pool.stats("pg").live, 0);
}
