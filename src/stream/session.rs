//! Per-chat stream session: state machine, cancellation flag and event log.

use super::{EventKind, StreamEvent};
use crate::error::{CopilotError, Result};
use crate::store::new_id;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Lifecycle of a session. Terminal states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    Pending,
    Streaming,
    Completed,
    Cancelled,
    Failed,
}

impl StreamState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }

    fn can_move_to(&self, next: StreamState) -> bool {
        match (self, next) {
            (Self::Pending, Self::Streaming) => true,
            (Self::Pending | Self::Streaming, next) => next.is_terminal(),
            _ => false,
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: StreamState,
    events: VecDeque<StreamEvent>,
    next_seq: u64,
    /// Set once the producer has decided how the session ends.
    sealed: bool,
}

/// What a reader sees when it asks for events after some sequence number.
#[derive(Debug)]
pub(crate) enum Backlog {
    Events {
        events: Vec<StreamEvent>,
        /// No further events will be appended.
        closed: bool,
    },
    /// The requested offset fell out of the ring.
    Lagged { oldest_available: u64 },
}

/// The live orchestration of one AI response within a chat.
#[derive(Debug)]
pub struct StreamSession {
    id: String,
    chat_id: String,
    capacity: usize,
    inner: Mutex<Inner>,
    cancel: CancellationToken,
    cancel_requested: AtomicBool,
    notify: watch::Sender<u64>,
}

impl StreamSession {
    pub fn new(chat_id: impl Into<String>, capacity: usize) -> Self {
        let (notify, _) = watch::channel(0);
        Self {
            id: new_id(),
            chat_id: chat_id.into(),
            capacity: capacity.max(1),
            inner: Mutex::new(Inner {
                state: StreamState::Pending,
                events: VecDeque::new(),
                next_seq: 1,
                sealed: false,
            }),
            cancel: CancellationToken::new(),
            cancel_requested: AtomicBool::new(false),
            notify,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> StreamState {
        self.lock().state
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// Sequence number of the last appended event, 0 if none.
    pub fn last_sequence(&self) -> u64 {
        self.lock().next_seq - 1
    }

    /// `Pending -> Streaming`.
    pub fn begin(&self) -> Result<()> {
        let mut inner = self.lock();
        Self::transition(&mut inner, StreamState::Streaming)
    }

    fn transition(inner: &mut Inner, next: StreamState) -> Result<()> {
        if !inner.state.can_move_to(next) {
            return Err(CopilotError::invalid_transition(format!(
                "stream session cannot move from {:?} to {next:?}",
                inner.state
            )));
        }
        inner.state = next;
        Ok(())
    }

    fn append(&self, inner: &mut Inner, kind: EventKind) -> u64 {
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.events.push_back(StreamEvent {
            seq,
            session_id: self.id.clone(),
            chat_id: self.chat_id.clone(),
            kind,
        });
        while inner.events.len() > self.capacity {
            inner.events.pop_front();
        }
        seq
    }

    /// Appends a non-terminal event and returns its sequence number.
    ///
    /// Sequence assignment and appending happen under one lock, so readers
    /// never observe a gap.
    pub fn emit(&self, kind: EventKind) -> Result<u64> {
        if kind.is_terminal() {
            return Err(CopilotError::internal(
                "terminal events are emitted by finishing the session",
            ));
        }
        let seq = {
            let mut inner = self.lock();
            if inner.state.is_terminal() {
                return Err(CopilotError::invalid_transition(format!(
                    "session {} already ended",
                    self.id
                )));
            }
            self.append(&mut inner, kind)
        };
        self.notify.send_replace(seq);
        Ok(seq)
    }

    /// Moves to a terminal state and appends the matching terminal event.
    ///
    /// `make_event` receives the last sequence delivered before this one.
    pub(crate) fn finish(
        &self,
        state: StreamState,
        make_event: impl FnOnce(u64) -> EventKind,
    ) -> Result<u64> {
        let seq = {
            let mut inner = self.lock();
            Self::transition(&mut inner, state)?;
            let last = inner.next_seq - 1;
            self.append(&mut inner, make_event(last))
        };
        self.notify.send_replace(seq);
        Ok(seq)
    }

    /// Sets the cancellation flag. Returns false if it was already set or the
    /// session is ending.
    pub fn request_cancel(&self) -> bool {
        {
            let inner = self.lock();
            if inner.state.is_terminal()
                || inner.sealed
                || self.cancel_requested.swap(true, Ordering::SeqCst)
            {
                return false;
            }
        }
        self.cancel.cancel();
        true
    }

    /// Stops accepting cancel requests and reports whether one was accepted.
    ///
    /// An accepted cancel is never retracted: the producer must then end the
    /// session as cancelled.
    pub(crate) fn seal(&self) -> bool {
        let mut inner = self.lock();
        inner.sealed = true;
        self.cancel_requested.load(Ordering::SeqCst)
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub(crate) fn watch(&self) -> watch::Receiver<u64> {
        self.notify.subscribe()
    }

    /// Events with a sequence number greater than `after`.
    pub(crate) fn backlog_after(&self, after: u64) -> Backlog {
        let inner = self.lock();
        if let Some(oldest) = inner.events.front().map(|e| e.seq) {
            if oldest > after.saturating_add(1) {
                return Backlog::Lagged {
                    oldest_available: oldest,
                };
            }
        }
        Backlog::Events {
            events: inner
                .events
                .iter()
                .filter(|e| e.seq > after)
                .cloned()
                .collect(),
            closed: inner.state.is_terminal(),
        }
    }
}
