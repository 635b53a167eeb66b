//! JSON request handlers.

use super::auth::CurrentUser;
use super::error::ApiResult;
use super::AppState;
use crate::db::ExecutionResult;
use crate::orchestrator::ChatOptions;
use crate::store::{Chat, CredentialRef, Message, QueryProposal};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub active_streams: usize,
}

/// `GET /health`
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        active_streams: state.orchestrator.registry().active_count(),
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateChatRequest {
    pub connection_id: String,
    #[serde(default)]
    pub auto_execute: bool,
    #[serde(default)]
    pub share_with_ai: bool,
}

/// `POST /chats`
pub async fn create_chat(
    State(state): State<Arc<AppState>>,
    user: CurrentUser,
    Json(req): Json<CreateChatRequest>,
) -> ApiResult<(StatusCode, Json<Chat>)> {
    let options = ChatOptions {
        auto_execute: req.auto_execute,
        share_with_ai: req.share_with_ai,
    };
    let chat = state
        .orchestrator
        .create_chat(user.id(), &req.connection_id, options)
        .await?;
    Ok((StatusCode::CREATED, Json(chat)))
}

/// `GET /chats/{id}/messages`
pub async fn list_messages(
    State(state): State<Arc<AppState>>,
    user: CurrentUser,
    Path(chat_id): Path<String>,
) -> ApiResult<Json<Vec<Message>>> {
    let messages = state.orchestrator.list_messages(user.id(), &chat_id).await?;
    Ok(Json(messages))
}

#[derive(Debug, Deserialize)]
pub struct PostMessageRequest {
    pub content: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PostMessageResponse {
    pub message: Message,
    pub session_id: String,
}

/// `POST /chats/{id}/messages`
///
/// Returns as soon as the stream has started; the response itself arrives
/// over `GET /chats/{id}/stream`.
pub async fn post_message(
    State(state): State<Arc<AppState>>,
    user: CurrentUser,
    Path(chat_id): Path<String>,
    Json(req): Json<PostMessageRequest>,
) -> ApiResult<(StatusCode, Json<PostMessageResponse>)> {
    let (message, session) = state
        .orchestrator
        .post_message(user.id(), &chat_id, &req.content)
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(PostMessageResponse {
            message,
            session_id: session.id().to_string(),
        }),
    ))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelResponse {
    pub session_id: String,
    pub cancel_requested: bool,
}

/// `POST /chats/{id}/stream/cancel`
pub async fn cancel_stream(
    State(state): State<Arc<AppState>>,
    user: CurrentUser,
    Path(chat_id): Path<String>,
) -> ApiResult<(StatusCode, Json<CancelResponse>)> {
    let session = state.orchestrator.cancel(user.id(), &chat_id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(CancelResponse {
            session_id: session.id().to_string(),
            cancel_requested: true,
        }),
    ))
}

#[derive(Debug, Default, Deserialize)]
pub struct ExecuteProposalRequest {
    /// Acknowledges that the statement writes.
    #[serde(default)]
    pub confirm: bool,
}

#[derive(Debug, Serialize)]
pub struct ExecuteProposalResponse {
    pub proposal: QueryProposal,
    pub result: ExecutionResult,
}

/// `POST /chats/{id}/proposals/{pid}/execute`
pub async fn execute_proposal(
    State(state): State<Arc<AppState>>,
    user: CurrentUser,
    Path((chat_id, proposal_id)): Path<(String, String)>,
    Json(req): Json<ExecuteProposalRequest>,
) -> ApiResult<Json<ExecuteProposalResponse>> {
    let (proposal, result) = state
        .orchestrator
        .execute_proposal(user.id(), &chat_id, &proposal_id, req.confirm)
        .await?;
    Ok(Json(ExecuteProposalResponse { proposal, result }))
}

/// `POST /chats/{id}/proposals/{pid}/reject`
pub async fn reject_proposal(
    State(state): State<Arc<AppState>>,
    user: CurrentUser,
    Path((chat_id, proposal_id)): Path<(String, String)>,
) -> ApiResult<Json<QueryProposal>> {
    let proposal = state
        .orchestrator
        .reject_proposal(user.id(), &chat_id, &proposal_id)
        .await?;
    Ok(Json(proposal))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisualizationRequest {
    pub connection_id: String,
    pub query: String,
}

/// `POST /visualizations/execute`
pub async fn execute_visualization(
    State(state): State<Arc<AppState>>,
    user: CurrentUser,
    Json(req): Json<VisualizationRequest>,
) -> ApiResult<Json<ExecutionResult>> {
    let result = state
        .orchestrator
        .execute_visualization(user.id(), &req.connection_id, &req.query)
        .await?;
    Ok(Json(result))
}

/// `PUT /connections/{id}/credentials`
pub async fn rotate_credentials(
    State(state): State<Arc<AppState>>,
    user: CurrentUser,
    Path(connection_id): Path<String>,
    Json(credentials): Json<CredentialRef>,
) -> ApiResult<StatusCode> {
    state
        .orchestrator
        .rotate_credentials(user.id(), &connection_id, credentials)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
