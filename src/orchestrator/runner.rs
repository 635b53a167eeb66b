//! Drives one stream session from the first AI chunk to its terminal event.

use super::Orchestrator;
use crate::db::Schema;
use crate::error::{CopilotError, Result};
use crate::gateway::Trigger;
use crate::llm::{
    build_messages, LlmChunk, PromptContext, ProposeQueryInput, ResponseSegmenter, Segment,
    ToolCall, PROPOSE_QUERY,
};
use crate::safety;
use crate::store::{
    new_id, Chat, Completion, Connection, Message, ProposalClassification, ProposalOutcome,
    ProposalStatus, QueryProposal,
};
use crate::stream::{EventKind, StreamSession};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How the AI stream ended when nothing failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ending {
    Exhausted,
    Cancelled,
}

pub(super) struct SessionRunner {
    deps: Orchestrator,
    chat: Chat,
    session: Arc<StreamSession>,
    cancel: CancellationToken,
    /// Id of the assistant message this session produces.
    message_id: String,
    content: String,
    proposals: usize,
}

impl SessionRunner {
    pub(super) fn new(deps: Orchestrator, chat: Chat, session: Arc<StreamSession>) -> Self {
        let cancel = session.cancellation_token();
        Self {
            deps,
            chat,
            session,
            cancel,
            message_id: new_id(),
            content: String::new(),
            proposals: 0,
        }
    }

    pub(super) async fn run(mut self) {
        let start = Instant::now();
        let outcome = self.drive().await;
        self.finish(outcome, start).await;
    }

    async fn drive(&mut self) -> Result<Ending> {
        let connection = self.deps.store.get_connection(&self.chat.connection_id).await?;
        let engine = connection.engine();
        let history = self.deps.store.list_messages(&self.chat.id).await?;

        let (schema, results) = if self.chat.share_with_ai {
            (
                self.load_schema(&connection).await,
                self.deps.store.list_proposals(&self.chat.id).await?,
            )
        } else {
            (None, Vec::new())
        };
        let context = PromptContext {
            schema: schema.as_ref(),
            results: &results,
        };
        let messages = build_messages(engine, &context, &history);

        let opened = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Ok(Ending::Cancelled),
            opened = self.deps.llm.stream_chunks(&messages) => opened,
        };
        let mut chunks = opened.map_err(|e| match e {
            CopilotError::AiServiceUnavailable(_) => e,
            other => CopilotError::ai_unavailable(other.to_string()),
        })?;

        let chunk_timeout = self.deps.registry.config().chunk_timeout();
        let mut segmenter = ResponseSegmenter::for_engine(engine);
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(Ending::Cancelled),
                next = tokio::time::timeout(chunk_timeout, chunks.next()) => next,
            };
            let chunk = match next {
                Err(_) => {
                    return Err(CopilotError::ai_timeout(format!(
                        "no chunk within {}ms",
                        chunk_timeout.as_millis()
                    )))
                }
                Ok(None) => break,
                Ok(Some(chunk)) => chunk?,
            };

            match chunk {
                LlmChunk::Text(text) => {
                    for segment in segmenter.push(&text) {
                        if self.handle_segment(segment, &connection).await? == Ending::Cancelled {
                            return Ok(Ending::Cancelled);
                        }
                    }
                }
                LlmChunk::ToolCall(call) => {
                    if self.handle_tool_call(call, &connection).await? == Ending::Cancelled {
                        return Ok(Ending::Cancelled);
                    }
                }
            }
        }

        for segment in segmenter.finish() {
            if self.handle_segment(segment, &connection).await? == Ending::Cancelled {
                return Ok(Ending::Cancelled);
            }
        }
        Ok(Ending::Exhausted)
    }

    /// Schema for the prompt. Failures only cost the AI some context.
    async fn load_schema(&self, connection: &Connection) -> Option<Schema> {
        let handle = match self.deps.pool.acquire(&connection.id).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(connection_id = %connection.id, error = %e, "Schema unavailable for prompt");
                return None;
            }
        };
        let schema = handle.client().introspect_schema().await;
        match schema {
            Ok(schema) => {
                self.deps.pool.release(handle).await;
                Some(schema)
            }
            Err(e) => {
                warn!(connection_id = %connection.id, error = %e, "Schema introspection failed");
                if e.poisons_handle() {
                    self.deps.pool.invalidate(handle).await;
                } else {
                    self.deps.pool.release(handle).await;
                }
                None
            }
        }
    }

    fn emit(&self, kind: EventKind) -> Result<u64> {
        self.session.emit(kind)
    }

    async fn handle_segment(
        &mut self,
        segment: Segment,
        connection: &Connection,
    ) -> Result<Ending> {
        match segment {
            Segment::Prose(text) => {
                self.content.push_str(&text);
                self.emit(EventKind::TextDelta { text })?;
                Ok(Ending::Exhausted)
            }
            Segment::Query { language, text } => {
                self.content.push_str(&format!("```{language}\n{text}\n```"));
                self.propose(text, language, connection).await
            }
        }
    }

    async fn handle_tool_call(
        &mut self,
        call: ToolCall,
        connection: &Connection,
    ) -> Result<Ending> {
        if call.name != PROPOSE_QUERY {
            warn!(
                chat_id = %self.chat.id,
                tool = %call.name,
                "Ignoring call to unknown tool"
            );
            return Ok(Ending::Exhausted);
        }
        let input = ProposeQueryInput::parse(&call.arguments)?;
        if let Some(explanation) = input.explanation.filter(|e| !e.trim().is_empty()) {
            let text = format!("{explanation}\n");
            self.content.push_str(&text);
            self.emit(EventKind::TextDelta { text })?;
        }
        let language = connection.engine().query_language().to_string();
        self.propose(input.query, language, connection).await
    }

    /// Persists a proposal, announces it, and runs it when the chat allows.
    async fn propose(
        &mut self,
        query: String,
        language: String,
        connection: &Connection,
    ) -> Result<Ending> {
        let classification = safety::classify(connection.engine(), &query);
        let proposal = QueryProposal::new(
            self.message_id.as_str(),
            &self.chat,
            query,
            language,
            classification.as_ref().ok().map(ProposalClassification::from),
        );
        let proposal = self.deps.store.save_proposal(proposal).await?;
        self.proposals += 1;
        self.emit(EventKind::QueryProposed {
            proposal: proposal.clone(),
        })?;

        if !self.chat.auto_execute {
            return Ok(Ending::Exhausted);
        }
        match classification {
            Err(e) => {
                self.record_failure(&proposal, &e).await?;
                Ok(Ending::Exhausted)
            }
            Ok(c) if !c.is_read_only() => {
                debug!(
                    proposal_id = %proposal.id,
                    level = %c.level,
                    "Proposal waits for user confirmation"
                );
                Ok(Ending::Exhausted)
            }
            Ok(_) => self.auto_execute(&proposal, connection).await,
        }
    }

    async fn auto_execute(
        &mut self,
        proposal: &QueryProposal,
        connection: &Connection,
    ) -> Result<Ending> {
        let result = self
            .deps
            .gateway
            .run(
                &self.deps.pool,
                connection,
                &proposal.query,
                Trigger::Auto,
                &self.cancel,
            )
            .await;

        if self.cancel.is_cancelled() {
            // The session is going away; whatever came back is discarded and
            // the proposal stays open for a manual run.
            debug!(proposal_id = %proposal.id, "Discarding auto-execution after cancel");
            return Ok(Ending::Cancelled);
        }

        match result {
            Ok(result) => {
                let outcome = ProposalOutcome::Executed(result.summary());
                if self.settle(proposal, ProposalStatus::AutoExecuted, outcome).await? {
                    self.emit(EventKind::QueryResult {
                        proposal_id: proposal.id.clone(),
                        result: Arc::new(result),
                    })?;
                }
            }
            Err(e) => self.record_failure(proposal, &e).await?,
        }
        Ok(Ending::Exhausted)
    }

    async fn record_failure(&self, proposal: &QueryProposal, error: &CopilotError) -> Result<()> {
        warn!(
            chat_id = %self.chat.id,
            proposal_id = %proposal.id,
            code = error.code(),
            "Auto-execution failed: {error}"
        );
        let outcome = ProposalOutcome::Failed(error.to_string());
        if self.settle(proposal, ProposalStatus::Failed, outcome).await? {
            self.emit(EventKind::QueryFailed {
                proposal_id: proposal.id.clone(),
                code: error.code().to_string(),
                reason: error.to_string(),
            })?;
        }
        Ok(())
    }

    /// Records the automatic outcome. Returns false when the user already
    /// executed or rejected the proposal; their decision stands and the
    /// automatic outcome is dropped.
    async fn settle(
        &self,
        proposal: &QueryProposal,
        status: ProposalStatus,
        outcome: ProposalOutcome,
    ) -> Result<bool> {
        match self
            .deps
            .store
            .update_proposal(&proposal.id, status, outcome)
            .await
        {
            Ok(_) => Ok(true),
            Err(CopilotError::InvalidTransition(reason)) => {
                info!(
                    chat_id = %self.chat.id,
                    proposal_id = %proposal.id,
                    "Dropping automatic outcome: {reason}"
                );
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Persists the assistant message, then emits the terminal event.
    async fn finish(self, outcome: Result<Ending>, start: Instant) {
        // An accepted cancel outranks whatever the producer reached.
        let cancelled = self.session.seal();
        let completion = match &outcome {
            _ if cancelled => Completion::Cancelled,
            Ok(Ending::Exhausted) => Completion::Complete,
            Ok(Ending::Cancelled) => Completion::Cancelled,
            Err(_) => Completion::Failed,
        };

        let message = Message::assistant(
            self.message_id.as_str(),
            self.chat.id.as_str(),
            self.session.id(),
            self.content,
            completion,
        );
        if let Err(e) = self.deps.store.append_message(message).await {
            error!(chat_id = %self.chat.id, error = %e, "Failed to persist assistant message");
        }

        let registry = &self.deps.registry;
        let finished = match (completion, outcome) {
            (Completion::Complete, _) => registry.complete(&self.session),
            (Completion::Cancelled, _) => registry.mark_cancelled(&self.session),
            (Completion::Failed, Err(e)) => registry.fail(&self.session, &e),
            (Completion::Failed, Ok(_)) => registry.fail(
                &self.session,
                &CopilotError::internal("stream failed without an error"),
            ),
        };
        if let Err(e) = finished {
            error!(session_id = self.session.id(), error = %e, "Failed to end stream session");
        }

        info!(
            chat_id = %self.chat.id,
            session_id = self.session.id(),
            completion = ?completion,
            proposals = self.proposals,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Stream session finished"
        );
    }
}
