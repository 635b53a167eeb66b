//! HTTP surface.

pub mod auth;
pub mod error;
pub mod handlers;
pub mod sse;

pub use auth::{CurrentUser, USER_HEADER};
pub use error::{ApiError, ApiResult};

use crate::config::ServerConfig;
use crate::orchestrator::Orchestrator;
use axum::{
    http::{HeaderValue, Method},
    routing::{get, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

pub struct AppState {
    pub orchestrator: Orchestrator,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self { orchestrator }
    }
}

pub fn build_router(state: Arc<AppState>, server: &ServerConfig) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/chats", post(handlers::create_chat))
        .route(
            "/chats/{chat_id}/messages",
            get(handlers::list_messages).post(handlers::post_message),
        )
        .route("/chats/{chat_id}/stream", get(sse::stream_events))
        .route("/chats/{chat_id}/stream/cancel", post(handlers::cancel_stream))
        .route(
            "/chats/{chat_id}/proposals/{proposal_id}/execute",
            post(handlers::execute_proposal),
        )
        .route(
            "/chats/{chat_id}/proposals/{proposal_id}/reject",
            post(handlers::reject_proposal),
        )
        .route(
            "/visualizations/execute",
            post(handlers::execute_visualization),
        )
        .route(
            "/connections/{connection_id}/credentials",
            put(handlers::rotate_credentials),
        )
        .layer(build_cors_layer(&server.cors_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn build_cors_layer(origins: &[String]) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
        .allow_headers(Any);

    if origins.is_empty() || origins.iter().any(|o| o == "*") {
        cors.allow_origin(Any)
    } else {
        let parsed: Vec<HeaderValue> = origins
            .iter()
            .filter_map(|o| o.parse::<HeaderValue>().ok())
            .collect();
        cors.allow_origin(parsed)
    }
}
