use super::{EventKind, StreamSession, StreamState};
use crate::config::StreamConfig;
use crate::error::{CopilotError, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// At most one non-terminal session per chat.
///
/// Terminal sessions stay registered for a grace period so that late
/// listeners can still replay the tail of the stream.
#[derive(Debug, Clone)]
pub struct StreamRegistry {
    sessions: Arc<DashMap<String, Arc<StreamSession>>>,
    config: StreamConfig,
}

impl StreamRegistry {
    pub fn new(config: StreamConfig) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Registers a new session for the chat and moves it to `Streaming`.
    ///
    /// The check and the insert happen under the map's shard lock, so of two
    /// concurrent starts exactly one succeeds.
    pub fn start(&self, chat_id: &str) -> Result<Arc<StreamSession>> {
        let session = Arc::new(StreamSession::new(chat_id, self.config.event_buffer));
        match self.sessions.entry(chat_id.to_string()) {
            Entry::Occupied(mut entry) => {
                if !entry.get().is_terminal() {
                    return Err(CopilotError::AlreadyStreaming(chat_id.to_string()));
                }
                entry.insert(session.clone());
            }
            Entry::Vacant(entry) => {
                entry.insert(session.clone());
            }
        }
        session.begin()?;
        info!(chat_id, session_id = session.id(), "Stream session started");
        Ok(session)
    }

    /// Current (or recently finished) session for the chat.
    pub fn get(&self, chat_id: &str) -> Option<Arc<StreamSession>> {
        self.sessions.get(chat_id).map(|s| s.value().clone())
    }

    /// Requests cancellation of the chat's active session.
    pub fn cancel(&self, chat_id: &str) -> Result<Arc<StreamSession>> {
        let session = self
            .get(chat_id)
            .ok_or_else(|| CopilotError::NoActiveStream(chat_id.to_string()))?;
        if !session.request_cancel() {
            return Err(CopilotError::NoActiveStream(chat_id.to_string()));
        }
        info!(chat_id, session_id = session.id(), "Stream cancellation requested");
        Ok(session)
    }

    pub fn complete(&self, session: &Arc<StreamSession>) -> Result<u64> {
        let seq = session.finish(StreamState::Completed, |_| EventKind::StreamCompleted)?;
        self.schedule_eviction(session);
        Ok(seq)
    }

    pub fn fail(&self, session: &Arc<StreamSession>, error: &CopilotError) -> Result<u64> {
        warn!(
            chat_id = session.chat_id(),
            session_id = session.id(),
            code = error.code(),
            "Stream session failed: {error}"
        );
        let seq = session.finish(StreamState::Failed, |_| EventKind::StreamFailed {
            code: error.code().to_string(),
            reason: error.to_string(),
        })?;
        self.schedule_eviction(session);
        Ok(seq)
    }

    pub fn mark_cancelled(&self, session: &Arc<StreamSession>) -> Result<u64> {
        let seq = session.finish(StreamState::Cancelled, |last| {
            EventKind::StreamCancelled {
                last_sequence: last,
            }
        })?;
        info!(
            chat_id = session.chat_id(),
            session_id = session.id(),
            last_sequence = seq - 1,
            "Stream session cancelled"
        );
        self.schedule_eviction(session);
        Ok(seq)
    }

    /// Number of sessions that have not reached a terminal state.
    pub fn active_count(&self) -> usize {
        self.sessions.iter().filter(|s| !s.is_terminal()).count()
    }

    fn schedule_eviction(&self, session: &Arc<StreamSession>) {
        let sessions = self.sessions.clone();
        let session = session.clone();
        let grace = self.config.terminal_grace();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            // A newer session may have replaced this one in the meantime.
            let removed = sessions
                .remove_if(session.chat_id(), |_, current| Arc::ptr_eq(current, &session))
                .is_some();
            if removed {
                debug!(session_id = session.id(), "Evicted terminal stream session");
            }
        });
    }
}
