//! Per-connection handle pools.

use super::Connector;
use crate::config::PoolConfig;
use crate::db::DatabaseClient;
use crate::error::{CopilotError, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// A live handle checked out of the pool.
///
/// Holds one permit of its key's semaphore for as long as it is alive, so the
/// number of live handles per key never exceeds `max_handles`.
pub struct PooledHandle {
    connection_id: String,
    client: Arc<dyn DatabaseClient>,
    generation: u64,
    key: Arc<KeyPool>,
    _permit: OwnedSemaphorePermit,
}

impl PooledHandle {
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn client(&self) -> &dyn DatabaseClient {
        self.client.as_ref()
    }
}

impl std::fmt::Debug for PooledHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledHandle")
            .field("connection_id", &self.connection_id)
            .field("generation", &self.generation)
            .finish()
    }
}

/// Counters for one connection's pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub live: usize,
    pub idle: usize,
    pub in_use: usize,
}

pub(super) struct IdleHandle {
    pub(super) client: Arc<dyn DatabaseClient>,
    pub(super) since: Instant,
    pub(super) generation: u64,
}

#[derive(Default)]
pub(super) struct KeyState {
    pub(super) idle: Vec<IdleHandle>,
    pub(super) generation: u64,
}

pub(super) struct KeyPool {
    pub(super) permits: Arc<Semaphore>,
    state: Mutex<KeyState>,
}

impl KeyPool {
    fn new(max_handles: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_handles)),
            state: Mutex::new(KeyState::default()),
        }
    }

    /// Locks the free-list. Critical sections never await, so a poisoned lock
    /// still holds consistent data.
    pub(super) fn lock(&self) -> MutexGuard<'_, KeyState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Owns the live handles of every connection, keyed by connection id.
pub struct PoolManager {
    connector: Arc<dyn Connector>,
    pub(super) config: PoolConfig,
    keys: Mutex<HashMap<String, Arc<KeyPool>>>,
}

impl PoolManager {
    pub fn new(connector: Arc<dyn Connector>, config: PoolConfig) -> Self {
        Self {
            connector,
            config,
            keys: Mutex::new(HashMap::new()),
        }
    }

    fn key(&self, connection_id: &str) -> Arc<KeyPool> {
        let mut keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            keys.entry(connection_id.to_string())
                .or_insert_with(|| Arc::new(KeyPool::new(self.config.max_handles))),
        )
    }

    pub(super) fn all_keys(&self) -> Vec<(String, Arc<KeyPool>)> {
        let keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        keys.iter()
            .map(|(id, key)| (id.clone(), Arc::clone(key)))
            .collect()
    }

    /// Checks out a handle for `connection_id`, dialing a new one if no idle
    /// handle of the current generation exists.
    ///
    /// Waits up to `acquire_timeout` for a free slot (`PoolExhausted`
    /// otherwise); dialing is bounded by `connect_timeout`.
    pub async fn acquire(&self, connection_id: &str) -> Result<PooledHandle> {
        let key = self.key(connection_id);

        let permit = tokio::time::timeout(
            self.config.acquire_timeout(),
            Arc::clone(&key.permits).acquire_owned(),
        )
        .await
        .map_err(|_| {
            CopilotError::pool_exhausted(format!(
                "no handle for connection {connection_id} within {}ms",
                self.config.acquire_timeout_ms
            ))
        })?
        .map_err(|_| CopilotError::internal("pool semaphore closed"))?;

        let (reused, stale, generation) = {
            let mut state = key.lock();
            let generation = state.generation;
            let mut stale = Vec::new();
            let mut reused = None;
            while let Some(idle) = state.idle.pop() {
                if idle.generation == generation {
                    reused = Some(idle.client);
                    break;
                }
                stale.push(idle.client);
            }
            (reused, stale, generation)
        };

        for client in stale {
            let _ = client.close().await;
        }

        let client = match reused {
            Some(client) => {
                debug!(connection_id, "Reusing idle handle");
                client
            }
            None => self.dial(connection_id).await?,
        };

        Ok(PooledHandle {
            connection_id: connection_id.to_string(),
            client,
            generation,
            key,
            _permit: permit,
        })
    }

    async fn dial(&self, connection_id: &str) -> Result<Arc<dyn DatabaseClient>> {
        let start = Instant::now();
        let client = tokio::time::timeout(
            self.config.connect_timeout(),
            self.connector.connect(connection_id),
        )
        .await
        .map_err(|_| {
            CopilotError::connect_failed(format!(
                "connecting to {connection_id} timed out after {}ms",
                self.config.connect_timeout_ms
            ))
        })??;
        info!(
            connection_id,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Opened database handle"
        );
        Ok(client)
    }

    /// Returns a healthy handle to the free-list.
    ///
    /// Handles from an older generation are closed instead.
    pub async fn release(&self, handle: PooledHandle) {
        let PooledHandle {
            client,
            generation,
            key,
            _permit,
            connection_id,
        } = handle;

        let client = {
            let mut state = key.lock();
            if generation == state.generation {
                state.idle.push(IdleHandle {
                    client,
                    since: Instant::now(),
                    generation,
                });
                None
            } else {
                Some(client)
            }
        };
        if let Some(client) = client {
            debug!(connection_id = %connection_id, "Closing handle from an older generation");
            let _ = client.close().await;
        }
    }

    /// Discards a handle after a failure and forces reconnection for every
    /// idle handle dialed before it.
    pub async fn invalidate(&self, handle: PooledHandle) {
        {
            let mut state = handle.key.lock();
            if state.generation == handle.generation {
                state.generation += 1;
            }
        }
        warn!(connection_id = %handle.connection_id, "Invalidated database handle");
        let _ = handle.client.close().await;
    }

    /// Drops every idle handle of a connection, e.g. after credential rotation.
    pub async fn evict(&self, connection_id: &str) {
        let key = self.key(connection_id);
        let idle = {
            let mut state = key.lock();
            state.generation += 1;
            std::mem::take(&mut state.idle)
        };
        info!(connection_id, evicted = idle.len(), "Evicted pooled handles");
        for handle in idle {
            let _ = handle.client.close().await;
        }
    }

    pub fn stats(&self, connection_id: &str) -> PoolStats {
        let key = self.key(connection_id);
        let idle = key.lock().idle.len();
        let in_use = self
            .config
            .max_handles
            .saturating_sub(key.permits.available_permits());
        PoolStats {
            live: idle + in_use,
            idle,
            in_use,
        }
    }
}
