//! Completion poller for remote workflow executions.
//!
//! Each attempt lists the workflow's executions and looks up the handle's
//! own execution by name. Recency is never used to pick the execution for a
//! handle; only [`CompletionPoller::adopt_latest`] looks at "newest", and
//! only to build a handle for an execution started elsewhere.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::adapters::{ApiError, WorkflowService};
use crate::domain::{
    ExecutionHandle, ExecutionState, ExecutionSummary, PollOutcome, PollResult, RunContext,
};

use super::retry::RetryPolicy;

/// Poll loop settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollSettings {
    #[serde(default = "default_interval")]
    pub interval_seconds: u64,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_interval() -> u64 {
    5
}
fn default_max_attempts() -> u32 {
    150
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval_seconds: default_interval(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl PollSettings {
    /// Defaults for control plane operations: every 5 seconds, up to 10 minutes
    pub fn operations() -> Self {
        Self {
            interval_seconds: 5,
            max_attempts: 120,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }
}

#[derive(Debug, Error)]
pub enum PollError {
    #[error("Failed to query executions of workflow '{workflow}': {source}")]
    Api {
        workflow: String,
        #[source]
        source: ApiError,
    },
}

/// One listing, indexed by execution name and id
#[derive(Debug, Clone, Default)]
pub struct ExecutionIndex {
    executions: Vec<ExecutionSummary>,
    by_name: HashMap<String, usize>,
    by_id: HashMap<String, usize>,
}

impl ExecutionIndex {
    /// `executions` must be newest first, as the list endpoint returns them
    pub fn new(executions: Vec<ExecutionSummary>) -> Self {
        let mut by_name = HashMap::with_capacity(executions.len());
        let mut by_id = HashMap::with_capacity(executions.len());
        for (i, execution) in executions.iter().enumerate() {
            by_name.entry(execution.name.clone()).or_insert(i);
            if let Some(id) = execution.name.rsplit('/').next() {
                by_id.entry(id.to_string()).or_insert(i);
            }
        }
        Self {
            executions,
            by_name,
            by_id,
        }
    }

    /// The execution a handle refers to
    pub fn get(&self, handle: &ExecutionHandle) -> Option<&ExecutionSummary> {
        self.by_name
            .get(&handle.execution_name)
            .or_else(|| self.by_id.get(&handle.execution_id))
            .map(|&i| &self.executions[i])
    }

    pub fn latest(&self) -> Option<&ExecutionSummary> {
        self.executions.first()
    }

    pub fn len(&self) -> usize {
        self.executions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executions.is_empty()
    }
}

/// Polls executions until they reach a terminal state
pub struct CompletionPoller {
    service: Arc<dyn WorkflowService>,
    retry: RetryPolicy,
}

impl CompletionPoller {
    pub fn new(service: Arc<dyn WorkflowService>, retry: RetryPolicy) -> Self {
        Self { service, retry }
    }

    async fn list(&self, ctx: &RunContext, workflow: &str) -> Result<ExecutionIndex, PollError> {
        let executions = self
            .retry
            .run(&format!("list {}", workflow), |_| {
                self.service.list_executions(ctx, workflow)
            })
            .await
            .map_err(|source| PollError::Api {
                workflow: workflow.to_string(),
                source,
            })?;
        Ok(ExecutionIndex::new(executions))
    }

    /// Fetch execution detail for diagnostics. A failed describe does not
    /// hide the failure itself; its error becomes the diagnostics.
    async fn describe(&self, handle: &ExecutionHandle) -> serde_json::Value {
        let result = self
            .retry
            .run(&format!("describe {}", handle.execution_id), |_| {
                self.service.describe_execution(&handle.execution_name)
            })
            .await;

        match result {
            Ok(detail) => detail,
            Err(e) => {
                warn!(execution = %handle.execution_name, error = %e, "Could not describe failed execution");
                json!({ "execution": handle.execution_name, "describe_error": e.to_string() })
            }
        }
    }

    /// One poll attempt.
    ///
    /// `current` is the last state observed for the handle; an observation
    /// that would move backwards is treated as a stale read and ignored.
    pub async fn poll_once(
        &self,
        ctx: &RunContext,
        handle: &ExecutionHandle,
        current: ExecutionState,
    ) -> Result<PollResult, PollError> {
        let index = self.list(ctx, &handle.workflow).await?;

        let observed = match index.get(handle) {
            Some(execution) => ExecutionState::from_remote(&execution.state).unwrap_or_else(|| {
                warn!(state = %execution.state, "Unknown execution state, treating as pending");
                ExecutionState::Pending
            }),
            None => {
                debug!(execution = %handle.execution_name, listed = index.len(), "Execution not listed yet");
                ExecutionState::Pending
            }
        };

        let state = if current.can_transition_to(observed) {
            observed
        } else {
            warn!(%current, %observed, "Ignoring out-of-order execution state");
            current
        };

        if state == ExecutionState::Failed {
            let diagnostics = self.describe(handle).await;
            return Ok(PollResult {
                state,
                diagnostics: Some(diagnostics),
            });
        }

        Ok(PollResult::pending(state))
    }

    /// Poll until SUCCEEDED, FAILED, or `max_attempts` polls have been made.
    ///
    /// Sleeps `interval` between attempts, never after the last one.
    #[instrument(skip(self, ctx, handle), fields(workflow = %handle.workflow, execution_id = %handle.execution_id))]
    pub async fn await_completion(
        &self,
        ctx: &RunContext,
        handle: &ExecutionHandle,
        interval: Duration,
        max_attempts: u32,
    ) -> Result<PollOutcome, PollError> {
        let max_attempts = max_attempts.max(1);
        let mut state = ExecutionState::Pending;

        for attempt in 1..=max_attempts {
            let result = self.poll_once(ctx, handle, state).await?;
            state = result.state;

            match state {
                ExecutionState::Succeeded => {
                    info!(attempt, "Workflow execution succeeded");
                    return Ok(PollOutcome::Succeeded { attempts: attempt });
                }
                ExecutionState::Failed => {
                    let diagnostics = result.diagnostics.unwrap_or(serde_json::Value::Null);
                    error!(attempt, %diagnostics, "Workflow execution failed");
                    return Ok(PollOutcome::Failed {
                        attempts: attempt,
                        diagnostics,
                    });
                }
                ExecutionState::Pending | ExecutionState::Running => {
                    debug!(attempt, max_attempts, %state, "Workflow execution still pending");
                    if attempt < max_attempts {
                        tokio::time::sleep(interval).await;
                    }
                }
            }
        }

        warn!(max_attempts, last_state = %state, "Polling budget exhausted; outcome unknown");
        Ok(PollOutcome::TimedOut {
            attempts: max_attempts,
            last_state: state,
        })
    }

    /// Build a handle for the newest execution of a workflow started outside
    /// this orchestrator, waiting for one to appear.
    pub async fn adopt_latest(
        &self,
        ctx: &RunContext,
        workflow: &str,
        interval: Duration,
        max_attempts: u32,
    ) -> Result<Option<ExecutionHandle>, PollError> {
        let max_attempts = max_attempts.max(1);

        for attempt in 1..=max_attempts {
            let index = self.list(ctx, workflow).await?;
            if let Some(latest) = index.latest() {
                let started_at = latest.start_time.unwrap_or_else(chrono::Utc::now);
                if let Some(handle) = ExecutionHandle::from_name(workflow, &latest.name, started_at) {
                    info!(workflow, execution_id = %handle.execution_id, "Adopted latest execution");
                    return Ok(Some(handle));
                }
            }
            if attempt < max_attempts {
                tokio::time::sleep(interval).await;
            }
        }

        Ok(None)
    }
}
