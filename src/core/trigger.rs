//! Workflow trigger: renders parameters and starts a remote execution.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use tracing::{info, instrument};

use crate::adapters::{ApiError, WorkflowService};
use crate::domain::{ExecutionHandle, ResourceIdentity, RunContext};

use super::template::{self, TemplateError, TemplateScope};

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("Workflow '{workflow}' parameters: {source}")]
    Template {
        workflow: String,
        #[source]
        source: TemplateError,
    },

    #[error("Failed to start workflow '{workflow}': {source}")]
    Api {
        workflow: String,
        #[source]
        source: ApiError,
    },

    #[error("Start response for workflow '{workflow}' has no execution name: {body}")]
    MissingExecutionName { workflow: String, body: String },
}

/// Starts named workflows
pub struct WorkflowTrigger {
    service: Arc<dyn WorkflowService>,
}

impl WorkflowTrigger {
    pub fn new(service: Arc<dyn WorkflowService>) -> Self {
        Self { service }
    }

    /// Render workflow parameters into the argument object the workflow
    /// receives
    pub fn render_argument(
        ctx: &RunContext,
        workflow: &str,
        parameters: &BTreeMap<String, Value>,
        identities: &BTreeMap<String, ResourceIdentity>,
    ) -> Result<Value, TriggerError> {
        let scope = TemplateScope::new(ctx, identities);
        let object = parameters
            .iter()
            .map(|(k, v)| Ok((k.clone(), template::render_value(v, &scope)?)))
            .collect::<Result<serde_json::Map<_, _>, TemplateError>>()
            .map_err(|source| TriggerError::Template {
                workflow: workflow.to_string(),
                source,
            })?;

        Ok(Value::Object(object))
    }

    /// Start an execution with an already-rendered argument.
    ///
    /// Made exactly once, even for transient errors: the start call is not
    /// idempotent and a failure may come after the execution was created.
    #[instrument(skip(self, ctx, argument), fields(project = %ctx.project_id, region = %ctx.region))]
    pub async fn start(
        &self,
        ctx: &RunContext,
        workflow: &str,
        argument: &Value,
    ) -> Result<ExecutionHandle, TriggerError> {
        let body = self
            .service
            .start_execution(ctx, workflow, argument)
            .await
            .map_err(|source| TriggerError::Api {
                workflow: workflow.to_string(),
                source,
            })?;

        let handle = parse_start_response(workflow, &body)?;
        info!(execution_id = %handle.execution_id, "Workflow execution started");
        Ok(handle)
    }

    /// Render parameters and start an execution
    pub async fn trigger(
        &self,
        ctx: &RunContext,
        workflow: &str,
        parameters: &BTreeMap<String, Value>,
        identities: &BTreeMap<String, ResourceIdentity>,
    ) -> Result<ExecutionHandle, TriggerError> {
        let argument = Self::render_argument(ctx, workflow, parameters, identities)?;
        self.start(ctx, workflow, &argument).await
    }
}

/// Build a handle from the execution-start response body
pub fn parse_start_response(workflow: &str, body: &Value) -> Result<ExecutionHandle, TriggerError> {
    let started_at = body["startTime"]
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    body["name"]
        .as_str()
        .and_then(|name| ExecutionHandle::from_name(workflow, name, started_at))
        .ok_or_else(|| TriggerError::MissingExecutionName {
            workflow: workflow.to_string(),
            body: body.to_string(),
        })
}
