//! Server-Sent Events delivery of stream sessions.

use super::auth::CurrentUser;
use super::error::ApiResult;
use super::AppState;
use crate::stream::Delivery;
use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::sse::{Event, KeepAlive, Sse},
};
use futures::stream::{Stream, StreamExt};
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamQuery {
    pub after_sequence: Option<u64>,
}

/// `afterSequence` wins over `Last-Event-ID`; both absent means from the start.
fn resume_point(query: &StreamQuery, headers: &HeaderMap) -> u64 {
    query
        .after_sequence
        .or_else(|| {
            headers
                .get("last-event-id")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse().ok())
        })
        .unwrap_or(0)
}

fn to_event(delivery: Delivery) -> Event {
    match delivery {
        Delivery::Event(event) => match serde_json::to_string(&event) {
            Ok(data) => Event::default()
                .id(event.seq.to_string())
                .event(event.kind.name())
                .data(data),
            Err(e) => Event::default()
                .event("error")
                .data(format!("failed to encode event {}: {e}", event.seq)),
        },
        Delivery::Lagged { oldest_available } => Event::default().event("lagged").data(
            serde_json::json!({ "oldestAvailable": oldest_available }).to_string(),
        ),
    }
}

/// `GET /chats/{id}/stream`
pub async fn stream_events(
    State(state): State<Arc<AppState>>,
    user: CurrentUser,
    Path(chat_id): Path<String>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let after = resume_point(&query, &headers);
    let subscription = state
        .orchestrator
        .subscribe(user.id(), &chat_id, after)
        .await?;
    debug!(chat_id = %chat_id, after, "SSE listener attached");

    let events = subscription.map(|delivery| Ok::<Event, Infallible>(to_event(delivery)));
    Ok(Sse::new(events).keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL)))
}
