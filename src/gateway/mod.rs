//! Query execution gateway.
//!
//! Every query that reaches an external database goes through here: it is
//! classified for its engine, checked against the trigger that asked for it,
//! and executed under a deadline with best-effort engine-side cancellation.

use crate::config::GatewayConfig;
use crate::db::{EngineKind, ExecutionLimits, ExecutionResult};
use crate::error::{CopilotError, Result};
use crate::pool::{PoolManager, PooledHandle};
use crate::safety::{self, ClassificationResult};
use crate::store::Connection;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const ABANDONED: &str = "query abandoned by its session";

/// Who asked for an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// The orchestrator, on behalf of a chat with auto-execute on.
    Auto,
    /// An explicit user request; `confirmed` acknowledges a write.
    User { confirmed: bool },
    /// Re-running a query to feed a visualization.
    Visualization,
}

impl Trigger {
    fn allows(&self, classification: &ClassificationResult) -> bool {
        match self {
            Self::Auto | Self::Visualization => classification.is_read_only(),
            Self::User { confirmed } => classification.is_read_only() || *confirmed,
        }
    }
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::User { .. } => write!(f, "user"),
            Self::Visualization => write!(f, "visualization"),
        }
    }
}

/// Uniform execution contract over the supported engines.
#[derive(Debug, Clone, Default)]
pub struct QueryGateway {
    config: GatewayConfig,
}

impl QueryGateway {
    pub fn new(config: GatewayConfig) -> Self {
        Self { config }
    }

    pub fn limits(&self) -> ExecutionLimits {
        ExecutionLimits {
            max_rows: self.config.max_rows,
            max_bytes: self.config.max_bytes,
            timeout: self.config.timeout(),
        }
    }

    /// Classifies `query` and checks it against `trigger`.
    ///
    /// Writes are never allowed for `Auto` or `Visualization`, and need
    /// `confirmed` for `User`.
    pub fn authorize(
        &self,
        engine: EngineKind,
        query: &str,
        trigger: Trigger,
    ) -> Result<ClassificationResult> {
        let classification = safety::classify(engine, query)?;
        if !trigger.allows(&classification) {
            return Err(CopilotError::permission_denied(format!(
                "{} statement ({}) requires explicit user confirmation",
                classification.level, classification.statement_type
            )));
        }
        Ok(classification)
    }

    /// Classifies, authorizes and runs `query` on `handle`.
    ///
    /// Firing `cancel` asks the engine to stop and yields `Cancelled`. Either
    /// way the handle must be invalidated when the error `poisons_handle`.
    pub async fn execute(
        &self,
        handle: &PooledHandle,
        query: &str,
        trigger: Trigger,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult> {
        let classification = self.authorize(handle.client().engine(), query, trigger)?;
        self.execute_authorized(handle, query, &classification, cancel)
            .await
    }

    async fn execute_authorized(
        &self,
        handle: &PooledHandle,
        query: &str,
        classification: &ClassificationResult,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult> {
        let client = handle.client();
        let limits = self.limits();
        let start = Instant::now();

        let execution = tokio::time::timeout(limits.timeout, client.execute(query, &limits));
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                cancel_on_engine(handle).await;
                Err(CopilotError::cancelled(ABANDONED))
            }
            res = execution => match res {
                Ok(result) => result,
                Err(_) => {
                    cancel_on_engine(handle).await;
                    Err(CopilotError::engine_timeout(format!(
                        "query exceeded {}ms",
                        self.config.timeout_ms
                    )))
                }
            }
        };

        let elapsed_ms = start.elapsed().as_millis() as u64;
        match outcome {
            Ok(mut result) => {
                if classification.is_read_only() {
                    result.affected_rows = None;
                }
                info!(
                    connection_id = handle.connection_id(),
                    statement = %classification.statement_type,
                    rows = result.row_count(),
                    truncated = result.truncated,
                    elapsed_ms,
                    "Query executed"
                );
                Ok(result)
            }
            Err(e) => {
                debug!(
                    connection_id = handle.connection_id(),
                    code = e.code(),
                    elapsed_ms,
                    "Query failed"
                );
                Err(e)
            }
        }
    }

    /// Authorizes, acquires a pooled handle for `connection`, executes, and
    /// returns or invalidates the handle depending on the outcome.
    pub async fn run(
        &self,
        pool: &PoolManager,
        connection: &Connection,
        query: &str,
        trigger: Trigger,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult> {
        let classification = self.authorize(connection.engine(), query, trigger)?;
        let handle = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CopilotError::cancelled(ABANDONED)),
            handle = pool.acquire(&connection.id) => handle?,
        };
        let result = self
            .execute_authorized(&handle, query, &classification, cancel)
            .await;
        match &result {
            Err(e) if e.poisons_handle() => pool.invalidate(handle).await,
            _ => pool.release(handle).await,
        }
        result
    }
}

async fn cancel_on_engine(handle: &PooledHandle) {
    if let Err(e) = handle.client().cancel().await {
        warn!(connection_id = handle.connection_id(), error = %e, "Engine cancel failed");
    }
}
