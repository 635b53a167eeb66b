//! Pool limits under concurrent gateway traffic.

use super::MockConnector;
use async_trait::async_trait;
use db_copilot::config::{ConnectionConfig, GatewayConfig, PoolConfig};
use db_copilot::db::{
    DatabaseClient, EngineKind, ExecutionLimits, ExecutionResult, MockDatabaseClient, Schema,
};
use db_copilot::error::{CopilotError, Result};
use db_copilot::gateway::{QueryGateway, Trigger};
use db_copilot::pool::{Connector, PoolManager};
use db_copilot::store::Connection;
use futures::future::join_all;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Tracks how many executions overlap across every handle it dials.
#[derive(Default)]
struct Occupancy {
    live: AtomicUsize,
    running: AtomicUsize,
    peak: AtomicUsize,
}

struct SlowClient {
    occupancy: Arc<Occupancy>,
}

#[async_trait]
impl DatabaseClient for SlowClient {
    fn engine(&self) -> EngineKind {
        EngineKind::Postgres
    }

    async fn execute(&self, _query: &str, _limits: &ExecutionLimits) -> Result<ExecutionResult> {
        let now = self.occupancy.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.occupancy.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.occupancy.running.fetch_sub(1, Ordering::SeqCst);
        Ok(ExecutionResult::default())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn cancel(&self) -> Result<()> {
        Ok(())
    }

    async fn introspect_schema(&self) -> Result<Schema> {
        Ok(Schema::default())
    }

    async fn close(&self) -> Result<()> {
        self.occupancy.live.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

struct SlowConnector(Arc<Occupancy>);

#[async_trait]
impl Connector for SlowConnector {
    async fn connect(&self, _connection_id: &str) -> Result<Arc<dyn DatabaseClient>> {
        self.0.live.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(SlowClient {
            occupancy: self.0.clone(),
        }))
    }
}

fn connection() -> Connection {
    let config = ConnectionConfig {
        engine: EngineKind::Postgres,
        host: Some("localhost".into()),
        database: Some("app".into()),
        ..ConnectionConfig::default()
    };
    Connection::from_config("primary", "alice", "Primary", &config).unwrap()
}

fn pool_config(max_handles: usize, acquire_timeout_ms: u64) -> PoolConfig {
    PoolConfig {
        max_handles,
        acquire_timeout_ms,
        ..PoolConfig::default()
    }
}

/// Scenario: More queries than handles
/// Given a pool capped at two handles per connection
/// When six read-only queries run at once
/// Then every query succeeds and no more than two handles ever exist
#[tokio::test(start_paused = true)]
async fn test_concurrent_queries_respect_handle_cap() {
    let occupancy = Arc::new(Occupancy::default());
    let pool = PoolManager::new(
        Arc::new(SlowConnector(occupancy.clone())),
        pool_config(2, 5_000),
    );
    let gateway = QueryGateway::new(GatewayConfig::default());
    let connection = connection();
    let cancel = CancellationToken::new();

    let runs = (0..6).map(|_| {
        gateway.run(&pool, &connection, "SELECT 1", Trigger::Auto, &cancel)
    });
    let outcomes = join_all(runs).await;

    assert!(outcomes.iter().all(|o| o.is_ok()));
    assert_eq!(occupancy.peak.load(Ordering::SeqCst), 2);
    assert!(occupancy.live.load(Ordering::SeqCst) <= 2);

    let stats = pool.stats("primary");
    assert!(stats.live <= 2);
    assert_eq!(stats.in_use, 0);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_pool_times_out() {
    let connector = Arc::new(MockConnector::new(MockDatabaseClient::new()));
    let pool = PoolManager::new(connector.clone(), pool_config(1, 100));

    let held = pool.acquire("primary").await.unwrap();
    let err = pool.acquire("primary").await.unwrap_err();
    assert!(matches!(err, CopilotError::PoolExhausted(_)));
    assert_eq!(connector.dials.load(Ordering::SeqCst), 1);

    // The freed handle is reused rather than dialed again
    pool.release(held).await;
    let again = pool.acquire("primary").await.unwrap();
    assert_eq!(connector.dials.load(Ordering::SeqCst), 1);
    pool.release(again).await;
}

#[tokio::test(start_paused = true)]
async fn test_timed_out_query_frees_its_slot() {
    let db = MockDatabaseClient::new().with_delay(Duration::from_secs(10));
    let stats = db.stats();
    let connector = Arc::new(MockConnector::new(db));
    let pool = PoolManager::new(connector.clone(), pool_config(1, 1_000));
    let gateway = QueryGateway::new(GatewayConfig {
        timeout_ms: 200,
        ..GatewayConfig::default()
    });
    let connection = connection();
    let cancel = CancellationToken::new();

    let err = gateway
        .run(&pool, &connection, "SELECT pg_sleep(10)", Trigger::Auto, &cancel)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "engine_timeout");
    assert_eq!(stats.cancelled.load(Ordering::SeqCst), 1);

    // The timed-out handle was discarded, so the next run dials a fresh one
    let _ = gateway
        .run(&pool, &connection, "SELECT 1", Trigger::Auto, &cancel)
        .await;
    assert_eq!(connector.dials.load(Ordering::SeqCst), 2);
    assert_eq!(pool.stats("primary").in_use, 0);
}
