//! End-to-end chat turns through the orchestrator with a mock LLM and engine.

use super::{app_with, collect_events, names, new_chat, OWNER};
use db_copilot::config::{Config, StreamConfig};
use db_copilot::db::{Column, MockDatabaseClient, Schema, Table};
use db_copilot::error::CopilotError;
use db_copilot::llm::{MockLlmClient, MockStep, PROPOSE_QUERY};
use db_copilot::orchestrator::Orchestrator;
use db_copilot::store::{Completion, ProposalStatus, Role};
use db_copilot::stream::{Delivery, EventKind, StreamEvent};
use futures::future::join_all;
use futures::StreamExt;
use std::sync::atomic::Ordering;
use std::time::Duration;

fn assert_gap_free(events: &[StreamEvent], first: u64) {
    for (offset, event) in events.iter().enumerate() {
        assert_eq!(event.seq, first + offset as u64, "sequence gap at {offset}");
    }
}

/// Scenario: Read-only proposal with auto-execute on
/// Given a chat with auto-execute enabled
/// When the AI proposes a SELECT
/// Then the proposal is executed and its result streamed before completion
#[tokio::test]
async fn test_select_is_auto_executed() {
    let db = MockDatabaseClient::new().with_rows(3);
    let stats = db.stats();
    let app = app_with(MockLlmClient::new(), db, Config::default()).await;
    let orchestrator = &app.state().orchestrator;
    let chat = new_chat(orchestrator, true, false).await;

    orchestrator
        .post_message(OWNER, &chat.id, "show all users")
        .await
        .unwrap();
    let events = collect_events(orchestrator, &chat.id, 0).await;

    assert_gap_free(&events, 1);
    let kinds = names(&events);
    let proposed = kinds.iter().position(|k| *k == "query_proposed").unwrap();
    let result = kinds.iter().position(|k| *k == "query_result").unwrap();
    assert!(proposed < result);
    assert_eq!(kinds.last(), Some(&"stream_completed"));
    assert_eq!(stats.executed.load(Ordering::SeqCst), 1);

    let proposals = orchestrator.store().list_proposals(&chat.id).await.unwrap();
    assert_eq!(proposals.len(), 1);
    assert_eq!(proposals[0].status, ProposalStatus::AutoExecuted);
    assert_eq!(proposals[0].query, "SELECT * FROM users;");
    assert!(proposals[0].result_summary.is_some());

    let messages = orchestrator.list_messages(OWNER, &chat.id).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].role, Role::Assistant);
    assert_eq!(messages[1].completion, Some(Completion::Complete));
    assert!(messages[1].content.contains("SELECT * FROM users;"));
}

/// Scenario: Mutating proposal with auto-execute on
/// Given a chat with auto-execute enabled
/// When the AI proposes a DELETE
/// Then nothing runs and the proposal waits for the user
#[tokio::test]
async fn test_delete_is_never_auto_executed() {
    let db = MockDatabaseClient::new();
    let stats = db.stats();
    let app = app_with(MockLlmClient::new(), db, Config::default()).await;
    let orchestrator = &app.state().orchestrator;
    let chat = new_chat(orchestrator, true, false).await;

    orchestrator
        .post_message(OWNER, &chat.id, "delete user 1")
        .await
        .unwrap();
    let events = collect_events(orchestrator, &chat.id, 0).await;

    let kinds = names(&events);
    assert!(kinds.contains(&"query_proposed"));
    assert!(!kinds.contains(&"query_result"));
    assert!(!kinds.contains(&"query_failed"));
    assert_eq!(kinds.last(), Some(&"stream_completed"));
    assert_eq!(stats.executed.load(Ordering::SeqCst), 0);

    let proposals = orchestrator.store().list_proposals(&chat.id).await.unwrap();
    assert_eq!(proposals[0].status, ProposalStatus::Proposed);
    assert_eq!(proposals[0].classification.as_ref().map(|c| c.read_only), Some(false));
}

#[tokio::test]
async fn test_auto_execute_off_only_proposes() {
    let db = MockDatabaseClient::new();
    let stats = db.stats();
    let app = app_with(MockLlmClient::new(), db, Config::default()).await;
    let orchestrator = &app.state().orchestrator;
    let chat = new_chat(orchestrator, false, false).await;

    orchestrator
        .post_message(OWNER, &chat.id, "show all users")
        .await
        .unwrap();
    let kinds = names(&collect_events(orchestrator, &chat.id, 0).await);
    assert!(kinds.contains(&"query_proposed"));
    assert!(!kinds.contains(&"query_result"));
    assert_eq!(stats.executed.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_failed_auto_execution_keeps_streaming() {
    let failure = CopilotError::engine("relation \"users\" does not exist");
    let db = MockDatabaseClient::new().failing(failure);
    let app = app_with(MockLlmClient::new(), db, Config::default()).await;
    let orchestrator = &app.state().orchestrator;
    let chat = new_chat(orchestrator, true, false).await;

    orchestrator
        .post_message(OWNER, &chat.id, "show all users")
        .await
        .unwrap();
    let events = collect_events(orchestrator, &chat.id, 0).await;

    let failed = events
        .iter()
        .find_map(|e| match &e.kind {
            EventKind::QueryFailed { code, reason, .. } => Some((code.clone(), reason.clone())),
            _ => None,
        })
        .unwrap();
    assert_eq!(failed.0, "engine_error");
    assert!(failed.1.contains("does not exist"));
    assert_eq!(names(&events).last(), Some(&"stream_completed"));

    let proposals = orchestrator.store().list_proposals(&chat.id).await.unwrap();
    assert_eq!(proposals[0].status, ProposalStatus::Failed);
}

#[tokio::test]
async fn test_tool_call_proposal() {
    let llm = MockLlmClient::scripted(vec![MockStep::tool_call(
        PROPOSE_QUERY,
        r#"{"query":"SELECT id FROM orders","explanation":"Listing order ids."}"#,
    )]);
    let app = app_with(llm, MockDatabaseClient::new(), Config::default()).await;
    let orchestrator = &app.state().orchestrator;
    let chat = new_chat(orchestrator, false, false).await;

    orchestrator
        .post_message(OWNER, &chat.id, "list orders")
        .await
        .unwrap();
    let events = collect_events(orchestrator, &chat.id, 0).await;

    assert_eq!(names(&events), vec!["text_delta", "query_proposed", "stream_completed"]);
    match &events[1].kind {
        EventKind::QueryProposed { proposal } => {
            assert_eq!(proposal.query, "SELECT id FROM orders");
            assert_eq!(proposal.language, "sql");
        }
        other => panic!("unexpected event {other:?}"),
    }
}

/// Scenario: Concurrent sends on one chat
/// Given a chat whose AI stream never finishes
/// When several messages are posted at once
/// Then exactly one starts a stream and the rest are refused
#[tokio::test]
async fn test_concurrent_posts_start_one_stream() {
    let llm = MockLlmClient::scripted(vec![MockStep::text("thinking"), MockStep::Stall]);
    let app = app_with(llm, MockDatabaseClient::new(), Config::default()).await;
    let orchestrator = &app.state().orchestrator;
    let chat = new_chat(orchestrator, false, false).await;

    let attempts = (0..8).map(|i| {
        let orchestrator = orchestrator.clone();
        let chat_id = chat.id.clone();
        async move {
            orchestrator
                .post_message(OWNER, &chat_id, &format!("question {i}"))
                .await
        }
    });
    let outcomes = join_all(attempts).await;

    let started = outcomes.iter().filter(|o| o.is_ok()).count();
    assert_eq!(started, 1);
    for outcome in outcomes.iter().filter_map(|o| o.as_ref().err()) {
        assert_eq!(outcome.code(), "already_streaming");
    }
    // Refused sends persist nothing
    let messages = orchestrator.list_messages(OWNER, &chat.id).await.unwrap();
    assert_eq!(messages.len(), 1);

    orchestrator.cancel(OWNER, &chat.id).await.unwrap();
}

#[tokio::test]
async fn test_resume_after_sequence() {
    let app = app_with(MockLlmClient::new(), MockDatabaseClient::new(), Config::default()).await;
    let orchestrator = &app.state().orchestrator;
    let chat = new_chat(orchestrator, true, false).await;

    orchestrator
        .post_message(OWNER, &chat.id, "show all users")
        .await
        .unwrap();
    let full = collect_events(orchestrator, &chat.id, 0).await;
    assert!(full.len() > 3);

    let resumed = collect_events(orchestrator, &chat.id, 3).await;
    assert_gap_free(&resumed, 4);
    assert_eq!(resumed.len(), full.len() - 3);
    assert_eq!(names(&resumed), names(&full[3..]));
}

/// Scenario: Cancel mid-stream
/// Given an AI response that pauses after three chunks
/// When the user cancels
/// Then the stream ends with stream_cancelled naming the last delivered sequence
/// And later chunks are never delivered
#[tokio::test(start_paused = true)]
async fn test_cancel_after_three_chunks() {
    let llm = MockLlmClient::scripted(vec![
        MockStep::text("one "),
        MockStep::text("two "),
        MockStep::text("three "),
        MockStep::Delay(Duration::from_secs(5)),
        MockStep::text("four"),
    ]);
    let app = app_with(llm, MockDatabaseClient::new(), Config::default()).await;
    let orchestrator = &app.state().orchestrator;
    let chat = new_chat(orchestrator, false, false).await;

    orchestrator
        .post_message(OWNER, &chat.id, "count to four")
        .await
        .unwrap();

    let mut subscription = orchestrator.subscribe(OWNER, &chat.id, 0).await.unwrap();
    let mut received = Vec::new();
    while received.len() < 3 {
        match subscription.next().await {
            Some(Delivery::Event(event)) => received.push(event),
            other => panic!("unexpected delivery {other:?}"),
        }
    }
    orchestrator.cancel(OWNER, &chat.id).await.unwrap();

    let rest = collect_events(orchestrator, &chat.id, 3).await;
    assert_eq!(rest.len(), 1);
    match &rest[0].kind {
        EventKind::StreamCancelled { last_sequence } => assert_eq!(*last_sequence, 3),
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(rest[0].seq, 4);

    let messages = orchestrator.list_messages(OWNER, &chat.id).await.unwrap();
    assert_eq!(messages[1].completion, Some(Completion::Cancelled));
    assert_eq!(messages[1].content, "one two three ");

    // A second cancel finds nothing to stop
    let err = orchestrator.cancel(OWNER, &chat.id).await.unwrap_err();
    assert_eq!(err.code(), "no_active_stream");
}

#[tokio::test]
async fn test_ai_open_failure_fails_stream() {
    let llm = MockLlmClient::new().failing_open(CopilotError::ai_unavailable("503 from provider"));
    let app = app_with(llm, MockDatabaseClient::new(), Config::default()).await;
    let orchestrator = &app.state().orchestrator;
    let chat = new_chat(orchestrator, false, false).await;

    orchestrator
        .post_message(OWNER, &chat.id, "hello")
        .await
        .unwrap();
    let events = collect_events(orchestrator, &chat.id, 0).await;

    assert_eq!(events.len(), 1);
    match &events[0].kind {
        EventKind::StreamFailed { code, .. } => assert_eq!(code, "ai_service_unavailable"),
        other => panic!("unexpected event {other:?}"),
    }
    let messages = orchestrator.list_messages(OWNER, &chat.id).await.unwrap();
    assert_eq!(messages[1].completion, Some(Completion::Failed));

    // The chat accepts a new message once the failed stream is terminal
    orchestrator
        .post_message(OWNER, &chat.id, "hello again")
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_silent_ai_times_out() {
    let llm = MockLlmClient::scripted(vec![MockStep::text("partial"), MockStep::Stall]);
    let config = Config {
        stream: StreamConfig {
            chunk_timeout_ms: 200,
            ..StreamConfig::default()
        },
        ..Config::default()
    };
    let app = app_with(llm, MockDatabaseClient::new(), config).await;
    let orchestrator = &app.state().orchestrator;
    let chat = new_chat(orchestrator, false, false).await;

    orchestrator
        .post_message(OWNER, &chat.id, "hello")
        .await
        .unwrap();
    let events = collect_events(orchestrator, &chat.id, 0).await;

    assert_eq!(names(&events), vec!["text_delta", "stream_failed"]);
    match &events[1].kind {
        EventKind::StreamFailed { code, .. } => assert_eq!(code, "ai_timeout"),
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn test_schema_shared_only_when_enabled() {
    let mut orders = Table::new("orders");
    orders.columns.push(Column::new("id", "integer"));
    let schema = Schema {
        tables: vec![orders],
        ..Schema::default()
    };
    let llm = MockLlmClient::new();
    let app = app_with(
        llm.clone(),
        MockDatabaseClient::new().with_schema(schema),
        Config::default(),
    )
    .await;
    let orchestrator = &app.state().orchestrator;

    let private = new_chat(orchestrator, false, false).await;
    orchestrator.post_message(OWNER, &private.id, "hi").await.unwrap();
    collect_events(orchestrator, &private.id, 0).await;

    let shared = new_chat(orchestrator, false, true).await;
    orchestrator.post_message(OWNER, &shared.id, "hi").await.unwrap();
    collect_events(orchestrator, &shared.id, 0).await;

    let requests = llm.requests();
    assert_eq!(requests.len(), 2);
    let mentions_orders = |messages: &[db_copilot::llm::Message]| {
        messages.iter().any(|m| m.content.contains("orders"))
    };
    assert!(!mentions_orders(&requests[0]));
    assert!(mentions_orders(&requests[1]));
}

/// Follows the stream until the first proposal and returns its id.
async fn first_proposal_id(orchestrator: &Orchestrator, chat_id: &str) -> String {
    let mut subscription = orchestrator.subscribe(OWNER, chat_id, 0).await.unwrap();
    while let Some(delivery) = subscription.next().await {
        if let Delivery::Event(StreamEvent {
            kind: EventKind::QueryProposed { proposal },
            ..
        }) = delivery
        {
            return proposal.id;
        }
    }
    panic!("stream ended without a proposal");
}

/// Scenario: Rejection while auto-execution runs
/// Given a chat with auto-execute on and a slow database
/// When the user rejects the proposal before the query returns
/// Then the rejection stands, no result is streamed and the stream completes
#[tokio::test(start_paused = true)]
async fn test_rejection_during_auto_execution_stands() {
    let db = MockDatabaseClient::new().with_delay(Duration::from_millis(300));
    let app = app_with(MockLlmClient::new(), db, Config::default()).await;
    let orchestrator = &app.state().orchestrator;
    let chat = new_chat(orchestrator, true, false).await;

    orchestrator
        .post_message(OWNER, &chat.id, "show all users")
        .await
        .unwrap();
    let proposal_id = first_proposal_id(orchestrator, &chat.id).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let rejected = orchestrator
        .reject_proposal(OWNER, &chat.id, &proposal_id)
        .await
        .unwrap();
    assert_eq!(rejected.status, ProposalStatus::Rejected);

    let kinds = names(&collect_events(orchestrator, &chat.id, 0).await);
    assert!(!kinds.contains(&"query_result"));
    assert!(!kinds.contains(&"stream_failed"));
    assert_eq!(kinds.last(), Some(&"stream_completed"));

    let proposals = orchestrator.store().list_proposals(&chat.id).await.unwrap();
    assert_eq!(proposals[0].status, ProposalStatus::Rejected);
    let messages = orchestrator.list_messages(OWNER, &chat.id).await.unwrap();
    assert_eq!(messages[1].completion, Some(Completion::Complete));
}

/// Scenario: Cancel while an auto-executed query runs
/// Given a chat with auto-execute on and a slow database
/// When the user cancels after the proposal is announced
/// Then the engine is asked to cancel, no result is streamed
/// And the proposal stays open for a manual run
#[tokio::test(start_paused = true)]
async fn test_cancel_during_auto_execution() {
    let db = MockDatabaseClient::new().with_delay(Duration::from_secs(10));
    let stats = db.stats();
    let app = app_with(MockLlmClient::new(), db, Config::default()).await;
    let orchestrator = &app.state().orchestrator;
    let chat = new_chat(orchestrator, true, false).await;

    orchestrator
        .post_message(OWNER, &chat.id, "show all users")
        .await
        .unwrap();
    first_proposal_id(orchestrator, &chat.id).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    orchestrator.cancel(OWNER, &chat.id).await.unwrap();

    let events = collect_events(orchestrator, &chat.id, 0).await;
    let kinds = names(&events);
    assert!(!kinds.contains(&"query_result"));
    assert!(!kinds.contains(&"query_failed"));
    assert_eq!(kinds.iter().filter(|k| **k == "stream_cancelled").count(), 1);
    assert_eq!(kinds.last(), Some(&"stream_cancelled"));
    assert_eq!(stats.cancelled.load(Ordering::SeqCst), 1);

    let proposals = orchestrator.store().list_proposals(&chat.id).await.unwrap();
    assert_eq!(proposals[0].status, ProposalStatus::Proposed);
    let messages = orchestrator.list_messages(OWNER, &chat.id).await.unwrap();
    assert_eq!(messages[1].completion, Some(Completion::Cancelled));
}

/// Scenario: Abandoned user execution
/// Given a proposal whose execution request is dropped before the query returns
/// When the user executes it again
/// Then the second request runs instead of reporting it as already executing
#[tokio::test(start_paused = true)]
async fn test_abandoned_execution_can_be_retried() {
    let db = MockDatabaseClient::new().with_delay(Duration::from_millis(300));
    let app = app_with(MockLlmClient::new(), db, Config::default()).await;
    let orchestrator = &app.state().orchestrator;
    let chat = new_chat(orchestrator, false, false).await;

    orchestrator
        .post_message(OWNER, &chat.id, "show all users")
        .await
        .unwrap();
    collect_events(orchestrator, &chat.id, 0).await;
    let proposal = orchestrator.store().list_proposals(&chat.id).await.unwrap()[0].clone();

    let abandoned = tokio::time::timeout(
        Duration::from_millis(50),
        orchestrator.execute_proposal(OWNER, &chat.id, &proposal.id, false),
    )
    .await;
    assert!(abandoned.is_err());

    tokio::time::sleep(Duration::from_millis(500)).await;
    let (updated, result) = orchestrator
        .execute_proposal(OWNER, &chat.id, &proposal.id, false)
        .await
        .unwrap();
    assert_eq!(updated.status, ProposalStatus::UserExecuted);
    assert!(result.row_count() > 0);
}
