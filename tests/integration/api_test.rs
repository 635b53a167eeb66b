//! HTTP surface driven through the router with `tower::ServiceExt::oneshot`.

use super::{app_with, CONNECTION, OWNER};
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use db_copilot::api::USER_HEADER;
use db_copilot::app::App;
use db_copilot::config::Config;
use db_copilot::db::MockDatabaseClient;
use db_copilot::llm::{MockLlmClient, MockStep};
use serde_json::{json, Value};
use tower::ServiceExt;

async fn mock_app() -> App {
    app_with(MockLlmClient::new(), MockDatabaseClient::new(), Config::default()).await
}

fn request(method: &str, uri: &str, user: Option<&str>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(user) = user {
        builder = builder.header(USER_HEADER, user);
    }
    match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into()))
    };
    (status, body)
}

async fn create_chat(router: &Router, auto_execute: bool) -> String {
    let (status, body) = send(
        router,
        request(
            "POST",
            "/chats",
            Some(OWNER),
            Some(json!({ "connectionId": CONNECTION, "autoExecute": auto_execute })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    body["id"].as_str().unwrap().to_string()
}

async fn stream_body(router: &Router, chat_id: &str, last_event_id: Option<&str>) -> String {
    let mut builder = Request::builder()
        .uri(format!("/chats/{chat_id}/stream"))
        .header(USER_HEADER, OWNER);
    if let Some(id) = last_event_id {
        builder = builder.header("last-event-id", id);
    }
    let response = router
        .clone()
        .oneshot(builder.body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE].to_str().unwrap(),
        "text/event-stream"
    );
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

fn sse_field<'a>(body: &'a str, field: &str) -> Vec<&'a str> {
    body.lines()
        .filter_map(|line| line.strip_prefix(field))
        .filter_map(|rest| rest.strip_prefix(':'))
        .map(str::trim)
        .collect()
}

fn sse_ids(body: &str) -> Vec<u64> {
    sse_field(body, "id")
        .into_iter()
        .filter_map(|id| id.parse().ok())
        .collect()
}

#[tokio::test]
async fn test_health() {
    let router = mock_app().await.router();
    let (status, body) = send(&router, request("GET", "/health", None, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["activeStreams"], 0);
}

#[tokio::test]
async fn test_missing_user_is_unauthenticated() {
    let router = mock_app().await.router();
    let (status, body) = send(
        &router,
        request("POST", "/chats", None, Some(json!({ "connectionId": CONNECTION }))),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "unauthenticated");
}

#[tokio::test]
async fn test_other_users_chat_is_forbidden() {
    let router = mock_app().await.router();
    let chat_id = create_chat(&router, false).await;

    let (status, body) = send(
        &router,
        request("GET", &format!("/chats/{chat_id}/messages"), Some("mallory"), None),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "forbidden");

    let (status, _) = send(
        &router,
        request("GET", "/chats/unknown/messages", Some(OWNER), None),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_second_message_while_streaming_conflicts() {
    let llm = MockLlmClient::scripted(vec![MockStep::text("working on it"), MockStep::Stall]);
    let app = app_with(llm, MockDatabaseClient::new(), Config::default()).await;
    let router = app.router();
    let chat_id = create_chat(&router, false).await;
    let uri = format!("/chats/{chat_id}/messages");

    let (status, body) = send(
        &router,
        request("POST", &uri, Some(OWNER), Some(json!({ "content": "first" }))),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert!(body["sessionId"].is_string());
    assert_eq!(body["message"]["role"], "user");

    let (status, body) = send(
        &router,
        request("POST", &uri, Some(OWNER), Some(json!({ "content": "second" }))),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "already_streaming");

    let (status, body) = send(
        &router,
        request("POST", &format!("/chats/{chat_id}/stream/cancel"), Some(OWNER), None),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["cancelRequested"], true);

    let body = stream_body(&router, &chat_id, None).await;
    assert_eq!(sse_field(&body, "event").last(), Some(&"stream_cancelled"));
}

#[tokio::test]
async fn test_cancel_without_stream_conflicts() {
    let router = mock_app().await.router();
    let chat_id = create_chat(&router, false).await;
    let (status, body) = send(
        &router,
        request("POST", &format!("/chats/{chat_id}/stream/cancel"), Some(OWNER), None),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "no_active_stream");
}

#[tokio::test]
async fn test_sse_stream_and_resume() {
    let router = mock_app().await.router();
    let chat_id = create_chat(&router, true).await;
    let (status, _) = send(
        &router,
        request(
            "POST",
            &format!("/chats/{chat_id}/messages"),
            Some(OWNER),
            Some(json!({ "content": "show all users" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let full = stream_body(&router, &chat_id, None).await;
    let events = sse_field(&full, "event");
    assert!(events.contains(&"query_proposed"));
    assert!(events.contains(&"query_result"));
    assert_eq!(events.last(), Some(&"stream_completed"));
    let ids = sse_ids(&full);
    assert_eq!(ids.first(), Some(&1));
    assert!(ids.windows(2).all(|w| w[1] == w[0] + 1));

    let resumed = stream_body(&router, &chat_id, Some("2")).await;
    let resumed_ids = sse_ids(&resumed);
    assert_eq!(resumed_ids.first(), Some(&3));
    assert_eq!(resumed_ids.last(), ids.last());
}

#[tokio::test]
async fn test_stream_without_session_conflicts() {
    let router = mock_app().await.router();
    let chat_id = create_chat(&router, false).await;
    let (status, body) = send(
        &router,
        request("GET", &format!("/chats/{chat_id}/stream"), Some(OWNER), None),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "no_active_stream");
}

#[tokio::test]
async fn test_proposal_execution_needs_confirmation() {
    let app = mock_app().await;
    let router = app.router();
    let chat_id = create_chat(&router, true).await;
    send(
        &router,
        request(
            "POST",
            &format!("/chats/{chat_id}/messages"),
            Some(OWNER),
            Some(json!({ "content": "delete user 1" })),
        ),
    )
    .await;
    stream_body(&router, &chat_id, None).await;

    let (_, messages) = send(
        &router,
        request("GET", &format!("/chats/{chat_id}/messages"), Some(OWNER), None),
    )
    .await;
    let proposal_id = messages[1]["proposals"][0]["id"].as_str().unwrap().to_string();
    let uri = format!("/chats/{chat_id}/proposals/{proposal_id}/execute");

    let (status, body) = send(&router, request("POST", &uri, Some(OWNER), Some(json!({})))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "permission_denied");

    let (status, body) = send(
        &router,
        request("POST", &uri, Some(OWNER), Some(json!({ "confirm": true }))),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["proposal"]["status"], "user-executed");
    assert_eq!(body["result"]["affectedRows"], 1);

    let (status, body) = send(
        &router,
        request("POST", &format!("/chats/{chat_id}/proposals/{proposal_id}/reject"), Some(OWNER), None),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "invalid_transition");
}

#[tokio::test]
async fn test_visualization_is_read_only() {
    let router = mock_app().await.router();
    let (status, body) = send(
        &router,
        request(
            "POST",
            "/visualizations/execute",
            Some(OWNER),
            Some(json!({ "connectionId": CONNECTION, "query": "SELECT region, sum(total) FROM orders GROUP BY region" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["rows"].is_array());

    let (status, body) = send(
        &router,
        request(
            "POST",
            "/visualizations/execute",
            Some(OWNER),
            Some(json!({ "connectionId": CONNECTION, "query": "DROP TABLE orders" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "permission_denied");

    let (status, body) = send(
        &router,
        request(
            "POST",
            "/visualizations/execute",
            Some(OWNER),
            Some(json!({ "connectionId": CONNECTION, "query": "SELEC nonsense" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "syntax_rejected");
}

#[tokio::test]
async fn test_rotate_credentials() {
    let router = mock_app().await.router();
    let uri = format!("/connections/{CONNECTION}/credentials");

    let (status, _) = send(
        &router,
        request("PUT", &uri, Some(OWNER), Some(json!({ "source": "env", "value": "PRIMARY_DB_PASSWORD" }))),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = send(
        &router,
        request("PUT", &uri, Some("mallory"), Some(json!({ "source": "env", "value": "X" }))),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}
