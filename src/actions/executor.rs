//! Runs one action's sub-action sequence to completion or first fatal
//! failure.
//!
//! The executor owns no scheduling: the coordinator hands it an immutable
//! action snapshot and a cancellation token, and it walks the sub-action
//! list strictly in order. Before each step the parameters are
//! interpolated against the variable store, vault, and trigger payload.
//! Recoverable handler failures are retried with bounded backoff; fatal
//! failures stop the run with later steps skipped. Side effects already
//! performed are never rolled back.

use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::actions::handlers::{HandlerEnv, HandlerRegistry};
use crate::actions::types::{Action, SubAction};
use crate::error::HandlerError;
use crate::interpolate::Interpolator;
use crate::metrics;
use crate::retry::{retry_with_backoff, RetryDecision, RetryOutcome, RetryPolicy};
use crate::vault::VaultStore;

/// Matched-event context carried into a run.
#[derive(Debug, Clone)]
pub struct TriggerContext {
    /// Which event source fired (chat, channel_points, voice, schedule,
    /// webhook, manual).
    pub source: String,
    /// Raw event payload, exposed to interpolation as `${event:...}`.
    pub payload: serde_json::Value,
}

impl TriggerContext {
    pub fn new(source: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            source: source.into(),
            payload,
        }
    }
}

/// Terminal (or in-flight) state of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Succeeded,
    Failed,
    Cancelled,
    /// Dropped by the coordinator's queue-depth backpressure.
    Rejected,
}

/// One in-flight or completed run.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRecord {
    pub action_id: Uuid,
    pub action_name: String,
    /// Per-action event-arrival sequence number.
    pub sequence: u64,
    pub trigger_source: String,
    pub started_at: i64,
    pub completed_at: Option<i64>,
    pub status: ExecutionStatus,
    /// Position of the last attempted sub-action, if any step was reached.
    pub step_index: Option<usize>,
    pub error: Option<String>,
}

impl ExecutionRecord {
    pub fn new(action: &Action, sequence: u64, trigger_source: &str) -> Self {
        Self {
            action_id: action.id,
            action_name: action.name.clone(),
            sequence,
            trigger_source: trigger_source.to_string(),
            started_at: chrono::Utc::now().timestamp(),
            completed_at: None,
            status: ExecutionStatus::Running,
            step_index: None,
            error: None,
        }
    }

    pub fn mark_succeeded(mut self, step_index: Option<usize>) -> Self {
        self.completed_at = Some(chrono::Utc::now().timestamp());
        self.status = ExecutionStatus::Succeeded;
        self.step_index = step_index;
        self
    }

    pub fn mark_failed(mut self, step_index: usize, error: String) -> Self {
        self.completed_at = Some(chrono::Utc::now().timestamp());
        self.status = ExecutionStatus::Failed;
        self.step_index = Some(step_index);
        self.error = Some(error);
        self
    }

    pub fn mark_cancelled(mut self, step_index: Option<usize>) -> Self {
        self.completed_at = Some(chrono::Utc::now().timestamp());
        self.status = ExecutionStatus::Cancelled;
        self.step_index = step_index;
        self
    }

    pub fn mark_rejected(mut self, detail: String) -> Self {
        self.completed_at = Some(chrono::Utc::now().timestamp());
        self.status = ExecutionStatus::Rejected;
        self.error = Some(detail);
        self
    }
}

/// Sub-action sequence runner.
pub struct ActionExecutor {
    env: Arc<HandlerEnv>,
    vault: Arc<VaultStore>,
    registry: Arc<HandlerRegistry>,
    retry: RetryPolicy,
}

impl ActionExecutor {
    pub fn new(
        env: Arc<HandlerEnv>,
        vault: Arc<VaultStore>,
        registry: Arc<HandlerRegistry>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            env,
            vault,
            registry,
            retry,
        }
    }

    /// Run the action snapshot's sub-actions in list order.
    ///
    /// Cancellation is checked at every sub-action boundary; handlers are
    /// not interrupted mid-flight.
    pub async fn execute(
        &self,
        action: &Action,
        ctx: &TriggerContext,
        sequence: u64,
        cancel: &CancellationToken,
    ) -> ExecutionRecord {
        let record = ExecutionRecord::new(action, sequence, &ctx.source);
        let mut last_attempted: Option<usize> = None;

        for (index, step) in action.sub_actions.iter().enumerate() {
            if cancel.is_cancelled() {
                return record.mark_cancelled(last_attempted);
            }
            last_attempted = Some(index);

            let step = match self.interpolate_step(step, ctx).await {
                Ok(step) => step,
                Err(e) => {
                    return record.mark_failed(index, format!("interpolation failed: {}", e));
                }
            };

            let kind = step.kind();
            let Some(handler) = self.registry.get(kind) else {
                // Store validation guarantees a handler exists; reaching
                // this branch means the stored record and the registry
                // disagree, which is a data-integrity bug, not transient.
                return record.mark_failed(
                    index,
                    format!("no handler registered for sub-action kind '{}'", kind),
                );
            };

            let action_name = action.name.as_str();
            let outcome = retry_with_backoff(
                &self.retry,
                cancel,
                |_attempt| handler.run(&step, &self.env, cancel),
                |result| match result {
                    Err(HandlerError::Recoverable {
                        reason,
                        retry_after,
                        ..
                    }) => RetryDecision::Retry {
                        reason: *reason,
                        retry_after: *retry_after,
                    },
                    _ => RetryDecision::DoNotRetry,
                },
                |info| {
                    metrics::record_sub_action_retry(
                        &kind.to_string(),
                        info.reason.as_str(),
                        info.delay,
                    );
                    eprintln!(
                        "[executor] action '{}' step {} ({}): attempt {} failed, retrying in {:?}",
                        action_name, index, kind, info.attempt, info.delay
                    );
                },
            )
            .await;

            match outcome {
                RetryOutcome::Done(Ok(())) => {}
                RetryOutcome::Done(Err(e)) => {
                    return record.mark_failed(index, e.to_string());
                }
                RetryOutcome::Interrupted => {
                    return record.mark_cancelled(Some(index));
                }
            }
        }

        record.mark_succeeded(last_attempted)
    }

    /// Substitute `${...}` placeholders throughout one sub-action's
    /// parameters, preserving its kind tag.
    async fn interpolate_step(
        &self,
        step: &SubAction,
        ctx: &TriggerContext,
    ) -> anyhow::Result<SubAction> {
        let interp = Interpolator::new(&self.env.variables, &self.vault, &ctx.payload);
        let raw = serde_json::to_value(step)?;
        let expanded = interp.expand_value(&raw).await?;
        Ok(serde_json::from_value(expanded)?)
    }
}
