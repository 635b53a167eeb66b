//! Events emitted by a stream session.

use crate::db::ExecutionResult;
use crate::store::QueryProposal;
use serde::Serialize;
use std::sync::Arc;

/// One sequenced event. `seq` is strictly increasing and gap-free within its
/// session, starting at 1.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamEvent {
    pub seq: u64,
    pub session_id: String,
    pub chat_id: String,
    #[serde(flatten)]
    pub kind: EventKind,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum EventKind {
    TextDelta {
        text: String,
    },
    QueryProposed {
        proposal: QueryProposal,
    },
    QueryResult {
        proposal_id: String,
        result: Arc<ExecutionResult>,
    },
    QueryFailed {
        proposal_id: String,
        code: String,
        reason: String,
    },
    StreamCompleted,
    StreamCancelled {
        /// Sequence of the last event delivered before cancellation took effect.
        last_sequence: u64,
    },
    StreamFailed {
        code: String,
        reason: String,
    },
}

impl EventKind {
    /// Name used as the SSE `event:` field.
    pub fn name(&self) -> &'static str {
        match self {
            Self::TextDelta { .. } => "text_delta",
            Self::QueryProposed { .. } => "query_proposed",
            Self::QueryResult { .. } => "query_result",
            Self::QueryFailed { .. } => "query_failed",
            Self::StreamCompleted => "stream_completed",
            Self::StreamCancelled { .. } => "stream_cancelled",
            Self::StreamFailed { .. } => "stream_failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::StreamCompleted | Self::StreamCancelled { .. } | Self::StreamFailed { .. }
        )
    }
}
