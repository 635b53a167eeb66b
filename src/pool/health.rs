//! Background eviction of idle and broken handles.

use super::manager::{IdleHandle, KeyPool};
use super::PoolManager;
use crate::error::CopilotError;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

impl PoolManager {
    /// Spawns the health-check ticker. It runs until `shutdown` fires.
    pub fn spawn_health_checker(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        let period = pool.config.health_check_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => {
                        info!("Pool health checker stopped");
                        break;
                    }
                    _ = ticker.tick() => pool.check_health().await,
                }
            }
        })
    }

    /// Runs one pass over every key: closes handles idle beyond the TTL or
    /// from an older generation, then pings the rest.
    pub async fn check_health(&self) {
        for (connection_id, key) in self.all_keys() {
            let expired = self.take_expired(&key);
            if !expired.is_empty() {
                debug!(
                    connection_id = %connection_id,
                    count = expired.len(),
                    "Closing expired idle handles"
                );
            }
            for handle in expired {
                let _ = handle.client.close().await;
            }
            self.probe_idle(&connection_id, &key).await;
        }
    }

    fn take_expired(&self, key: &KeyPool) -> Vec<IdleHandle> {
        let ttl = self.config.idle_ttl();
        let mut state = key.lock();
        let generation = state.generation;
        let (keep, expired): (Vec<_>, Vec<_>) = std::mem::take(&mut state.idle)
            .into_iter()
            .partition(|h| h.generation == generation && h.since.elapsed() < ttl);
        state.idle = keep;
        expired
    }

    /// Pings idle handles one at a time. Each probe holds a permit, so a handle
    /// being probed still counts against `max_handles`.
    async fn probe_idle(&self, connection_id: &str, key: &Arc<KeyPool>) {
        let count = key.lock().idle.len();
        for _ in 0..count {
            let Ok(_permit) = Arc::clone(&key.permits).try_acquire_owned() else {
                // Saturated: every slot is busy, nothing is idle long enough to matter
                return;
            };
            // Oldest first
            let handle = {
                let mut state = key.lock();
                if state.idle.is_empty() {
                    return;
                }
                state.idle.remove(0)
            };

            let probe = tokio::time::timeout(self.config.connect_timeout(), handle.client.ping());
            let alive = match probe.await {
                Ok(result) => result,
                Err(_) => Err(CopilotError::connect_failed("liveness probe timed out")),
            };
            match alive {
                Ok(()) => {
                    {
                        let mut state = key.lock();
                        if handle.generation == state.generation {
                            state.idle.push(handle);
                            continue;
                        }
                    }
                    let _ = handle.client.close().await;
                }
                Err(e) => {
                    warn!(connection_id, error = %e, "Idle handle failed liveness probe");
                    let _ = handle.client.close().await;
                }
            }
        }
    }
}
