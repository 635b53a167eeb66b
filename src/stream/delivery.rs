//! Ordered, resumable delivery of session events to listeners.

use super::session::Backlog;
use super::{StreamEvent, StreamRegistry, StreamSession};
use crate::error::{CopilotError, Result};
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::watch;

/// What a listener receives.
#[derive(Debug, Clone)]
pub enum Delivery {
    Event(StreamEvent),
    /// Events between the requested offset and `oldest_available` are gone.
    /// Delivery resumes from `oldest_available`.
    Lagged { oldest_available: u64 },
}

pub type EventSubscription = BoxStream<'static, Delivery>;

struct Cursor {
    session: Arc<StreamSession>,
    changes: watch::Receiver<u64>,
    after: u64,
    pending: VecDeque<StreamEvent>,
    closed: bool,
}

/// Subscribes to the chat's session, replaying every event with a sequence
/// number greater than `after_seq`. The stream ends after the terminal event.
pub fn subscribe(
    registry: &StreamRegistry,
    chat_id: &str,
    after_seq: u64,
) -> Result<EventSubscription> {
    let session = registry
        .get(chat_id)
        .ok_or_else(|| CopilotError::NoActiveStream(chat_id.to_string()))?;
    Ok(subscribe_session(session, after_seq))
}

pub(crate) fn subscribe_session(session: Arc<StreamSession>, after_seq: u64) -> EventSubscription {
    let cursor = Cursor {
        changes: session.watch(),
        session,
        after: after_seq,
        pending: VecDeque::new(),
        closed: false,
    };

    stream::unfold(cursor, |mut cursor| async move {
        loop {
            if let Some(event) = cursor.pending.pop_front() {
                cursor.after = event.seq;
                return Some((Delivery::Event(event), cursor));
            }
            if cursor.closed {
                return None;
            }

            // Mark the current value seen before reading, so an append that
            // lands after the read still wakes us.
            cursor.changes.borrow_and_update();
            match cursor.session.backlog_after(cursor.after) {
                Backlog::Lagged { oldest_available } => {
                    cursor.after = oldest_available - 1;
                    return Some((Delivery::Lagged { oldest_available }, cursor));
                }
                Backlog::Events { events, closed } => {
                    cursor.closed = closed;
                    if !events.is_empty() || closed {
                        cursor.pending.extend(events);
                        continue;
                    }
                }
            }

            if cursor.changes.changed().await.is_err() {
                // Session dropped; drain whatever is left once more.
                cursor.closed = true;
                if let Backlog::Events { events, .. } = cursor.session.backlog_after(cursor.after) {
                    cursor.pending.extend(events);
                }
            }
        }
    })
    .boxed()
}
