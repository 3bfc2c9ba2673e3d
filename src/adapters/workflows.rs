//! Workflow Executions API client.
//!
//! Endpoints:
//! - start:    POST {base}/projects/{p}/locations/{r}/workflows/{w}/executions
//! - list:     GET  {base}/projects/{p}/locations/{r}/workflows/{w}/executions
//! - describe: GET  {base}/{execution name}
//!
//! Auth: Bearer token

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::domain::{ExecutionSummary, RunContext};

use super::gcp::{ApiEndpoints, GoogleApiClient, RequestBody};
use super::{ApiError, WorkflowService};

/// List response from the executions endpoint
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListExecutionsResponse {
    #[serde(default)]
    executions: Vec<RawExecution>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawExecution {
    name: String,
    #[serde(default)]
    state: String,
    start_time: Option<DateTime<Utc>>,
}

/// Decode a list response, newest execution first
pub fn parse_execution_list(body: Value) -> Result<Vec<ExecutionSummary>, ApiError> {
    if body.is_null() {
        return Ok(Vec::new());
    }

    let response: ListExecutionsResponse = serde_json::from_value(body)
        .map_err(|e| ApiError::MalformedResponse(format!("execution list: {}", e)))?;

    let mut executions: Vec<ExecutionSummary> = response
        .executions
        .into_iter()
        .map(|e| ExecutionSummary {
            name: e.name,
            state: e.state,
            start_time: e.start_time,
        })
        .collect();

    // `None` sorts below any timestamp, so undated entries go last
    executions.sort_by(|a, b| b.start_time.cmp(&a.start_time));
    Ok(executions)
}

/// Workflow Executions REST client
pub struct WorkflowsClient {
    client: GoogleApiClient,
    endpoints: ApiEndpoints,
}

impl WorkflowsClient {
    pub fn new(client: GoogleApiClient, endpoints: ApiEndpoints) -> Self {
        Self { client, endpoints }
    }

    /// Execution collection URL for a workflow
    pub fn executions_url(&self, ctx: &RunContext, workflow: &str) -> String {
        self.endpoints.url(
            "workflowexecutions",
            &format!(
                "v1/projects/{}/locations/{}/workflows/{}/executions",
                ctx.project_id, ctx.region, workflow
            ),
        )
    }
}

#[async_trait]
impl WorkflowService for WorkflowsClient {
    async fn start_execution(
        &self,
        ctx: &RunContext,
        workflow: &str,
        argument: &Value,
    ) -> Result<Value, ApiError> {
        // The API takes the argument as a JSON-encoded string
        let body = json!({ "argument": argument.to_string() });

        self.client
            .send(
                Method::POST,
                &self.executions_url(ctx, workflow),
                &[],
                Some(RequestBody::Json(body)),
                &format!("execution of workflow '{}'", workflow),
            )
            .await
    }

    async fn list_executions(
        &self,
        ctx: &RunContext,
        workflow: &str,
    ) -> Result<Vec<ExecutionSummary>, ApiError> {
        let query = [("orderBy".to_string(), "startTime desc".to_string())];
        let body = self
            .client
            .send(
                Method::GET,
                &self.executions_url(ctx, workflow),
                &query,
                None,
                workflow,
            )
            .await?;

        parse_execution_list(body)
    }

    async fn describe_execution(&self, execution_name: &str) -> Result<Value, ApiError> {
        let url = self
            .endpoints
            .url("workflowexecutions", &format!("v1/{}", execution_name));

        self.client
            .send(Method::GET, &url, &[], None, execution_name)
            .await
    }
}
