//! In-memory fakes of the control plane and the workflow service.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde_json::{json, Value};

use lakehouse_deploy::adapters::{ApiError, ControlPlane, WorkflowService};
use lakehouse_deploy::core::{
    Orchestrator, PollSettings, ReadinessGate, RetryClassifier, RetryPolicy,
};
use lakehouse_deploy::domain::{
    ExecutionSummary, InstanceSummary, Operation, ResourceSpec, RunContext,
};

pub const SUBNET_DRAINING: &str =
    "The subnetwork resource 'projects/p1/regions/r1/subnetworks/lakehouse-subnet' is already being used";

/// Retry policy over the built-in table with a one-minute fixed delay
pub fn builtin_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new(
        Arc::new(RetryClassifier::builtin().unwrap()),
        max_attempts,
        Duration::from_secs(60),
    )
}

pub fn ctx() -> RunContext {
    RunContext::new("p1", "r1", "r1-a")
}

/// A create the fake finishes only after some status reads
struct FakeOperation {
    resource: String,
    remaining_polls: u32,
    error: Option<String>,
}

/// Control plane that remembers what it created
#[derive(Default)]
pub struct FakeControlPlane {
    /// Spec names in call order (retries included)
    calls: Mutex<Vec<String>>,
    /// Rendered specs of successful creates
    created: Mutex<Vec<ResourceSpec>>,
    existing: Mutex<HashSet<String>>,
    /// Scripted failures per spec name, consumed one per call
    failures: Mutex<HashMap<String, VecDeque<(u16, String)>>>,
    /// Spec names whose create returns an operation: (polls until done, error)
    slow: Mutex<HashMap<String, (u32, Option<String>)>>,
    operations: Mutex<HashMap<String, FakeOperation>>,
    operation_polls: Mutex<HashMap<String, u32>>,
    /// Instance counts returned by successive listings; the last one sticks
    instance_counts: Mutex<VecDeque<usize>>,
    instance_failures: Mutex<VecDeque<(u16, String)>>,
    instance_lists: Mutex<u32>,
}

impl FakeControlPlane {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail(&self, resource: &str, status: u16, message: &str) {
        self.failures
            .lock()
            .unwrap()
            .entry(resource.to_string())
            .or_default()
            .push_back((status, message.to_string()));
    }

    /// Create `resource` through an operation that is done after `polls`
    /// status reads. Until then, every other create is refused as not ready.
    pub fn complete_after(&self, resource: &str, polls: u32) {
        self.slow
            .lock()
            .unwrap()
            .insert(resource.to_string(), (polls, None));
    }

    /// Like [`complete_after`], the operation then finishing with an error
    pub fn fail_operation(&self, resource: &str, polls: u32, message: &str) {
        self.slow
            .lock()
            .unwrap()
            .insert(resource.to_string(), (polls, Some(message.to_string())));
    }

    pub fn operation_polls(&self, resource: &str) -> u32 {
        self.operation_polls
            .lock()
            .unwrap()
            .get(resource)
            .copied()
            .unwrap_or_default()
    }

    pub fn script_instances(&self, counts: &[usize]) {
        *self.instance_counts.lock().unwrap() = counts.iter().copied().collect();
    }

    pub fn fail_next_instances(&self, status: u16, message: &str) {
        self.instance_failures
            .lock()
            .unwrap()
            .push_back((status, message.to_string()));
    }

    pub fn instance_lists(&self) -> u32 {
        *self.instance_lists.lock().unwrap()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, resource: &str) -> usize {
        self.calls().iter().filter(|c| *c == resource).count()
    }

    pub fn created(&self) -> Vec<ResourceSpec> {
        self.created.lock().unwrap().clone()
    }

    pub fn created_names(&self) -> Vec<String> {
        self.created().into_iter().map(|s| s.name).collect()
    }
}

#[async_trait]
impl ControlPlane for FakeControlPlane {
    async fn realize(
        &self,
        ctx: &RunContext,
        spec: &ResourceSpec,
    ) -> Result<Option<Operation>, ApiError> {
        self.calls.lock().unwrap().push(spec.name.clone());

        let not_ready = self
            .operations
            .lock()
            .unwrap()
            .values()
            .find(|op| op.remaining_polls > 0)
            .map(|op| op.resource.clone());
        if let Some(resource) = not_ready {
            return Err(ApiError::Status {
                status: 400,
                message: format!(
                    "The resource 'projects/{}/global/networks/{}' is not ready",
                    ctx.project_id, resource
                ),
            });
        }

        let scripted = self
            .failures
            .lock()
            .unwrap()
            .get_mut(&spec.name)
            .and_then(|q| q.pop_front());
        if let Some((status, message)) = scripted {
            return Err(ApiError::Status { status, message });
        }

        if !self.existing.lock().unwrap().insert(spec.name.clone()) {
            return Err(ApiError::AlreadyExists {
                resource: spec.resource_id().to_string(),
            });
        }

        self.created.lock().unwrap().push(spec.clone());

        let Some((polls, error)) = self.slow.lock().unwrap().get(&spec.name).cloned() else {
            return Ok(None);
        };
        let name = format!("operation-{}", spec.name);
        self.operations.lock().unwrap().insert(
            name.clone(),
            FakeOperation {
                resource: spec.name.clone(),
                remaining_polls: polls,
                error,
            },
        );
        Ok(Some(Operation::pending(
            name.clone(),
            format!("https://fake.test/operations/{}", name),
        )))
    }

    async fn operation(&self, operation: &Operation) -> Result<Operation, ApiError> {
        let mut operations = self.operations.lock().unwrap();
        let fake = operations
            .get_mut(&operation.name)
            .ok_or_else(|| ApiError::Status {
                status: 404,
                message: format!("operation {} not found", operation.name),
            })?;

        *self
            .operation_polls
            .lock()
            .unwrap()
            .entry(fake.resource.clone())
            .or_default() += 1;

        fake.remaining_polls = fake.remaining_polls.saturating_sub(1);
        if fake.remaining_polls > 0 {
            return Ok(operation.clone());
        }
        Ok(operation.clone().finished(fake.error.clone()))
    }

    async fn list_instances(&self, ctx: &RunContext) -> Result<Vec<InstanceSummary>, ApiError> {
        *self.instance_lists.lock().unwrap() += 1;

        if let Some((status, message)) = self.instance_failures.lock().unwrap().pop_front() {
            return Err(ApiError::Status { status, message });
        }

        let mut counts = self.instance_counts.lock().unwrap();
        let count = if counts.len() > 1 {
            counts.pop_front().unwrap_or_default()
        } else {
            counts.front().copied().unwrap_or_default()
        };

        Ok((0..count)
            .map(|i| InstanceSummary {
                name: format!("instance-{}", i),
                zone: ctx.zone.clone(),
                status: "RUNNING".to_string(),
            })
            .collect())
    }
}

struct FakeExecution {
    workflow: String,
    name: String,
    started: i64,
    /// Remote states returned by successive listings; the last one sticks
    states: VecDeque<String>,
}

/// Workflow service whose executions walk through scripted states
#[derive(Default)]
pub struct FakeWorkflowService {
    executions: Mutex<Vec<FakeExecution>>,
    /// States given to the next execution of each workflow
    scripts: Mutex<HashMap<String, Vec<String>>>,
    starts: Mutex<Vec<(String, Value)>>,
    list_calls: Mutex<HashMap<String, u32>>,
    describe_calls: Mutex<Vec<String>>,
    list_failures: Mutex<VecDeque<(u16, String)>>,
    start_failures: Mutex<VecDeque<(u16, String)>>,
}

impl FakeWorkflowService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Script the states the next started execution of `workflow` reports
    pub fn script(&self, workflow: &str, states: &[&str]) {
        self.scripts.lock().unwrap().insert(
            workflow.to_string(),
            states.iter().map(|s| s.to_string()).collect(),
        );
    }

    /// Replace the remaining states of every execution of `workflow`
    pub fn rescript_running(&self, workflow: &str, states: &[&str]) {
        for execution in self.executions.lock().unwrap().iter_mut() {
            if execution.workflow == workflow {
                execution.states = states.iter().map(|s| s.to_string()).collect();
            }
        }
    }

    /// An execution started outside the orchestrator
    pub fn seed_execution(&self, ctx: &RunContext, workflow: &str, id: &str, states: &[&str]) -> String {
        let name = execution_name(ctx, workflow, id);
        let mut executions = self.executions.lock().unwrap();
        let started = executions.len() as i64;
        executions.push(FakeExecution {
            workflow: workflow.to_string(),
            name: name.clone(),
            started,
            states: states.iter().map(|s| s.to_string()).collect(),
        });
        name
    }

    pub fn fail_next_list(&self, status: u16, message: &str) {
        self.list_failures
            .lock()
            .unwrap()
            .push_back((status, message.to_string()));
    }

    /// The next start call is recorded, then fails
    pub fn fail_next_start(&self, status: u16, message: &str) {
        self.start_failures
            .lock()
            .unwrap()
            .push_back((status, message.to_string()));
    }

    pub fn starts(&self) -> Vec<(String, Value)> {
        self.starts.lock().unwrap().clone()
    }

    pub fn started_workflows(&self) -> Vec<String> {
        self.starts().into_iter().map(|(w, _)| w).collect()
    }

    pub fn list_calls(&self, workflow: &str) -> u32 {
        self.list_calls
            .lock()
            .unwrap()
            .get(workflow)
            .copied()
            .unwrap_or_default()
    }

    pub fn describe_calls(&self) -> Vec<String> {
        self.describe_calls.lock().unwrap().clone()
    }
}

fn execution_name(ctx: &RunContext, workflow: &str, id: &str) -> String {
    format!(
        "projects/{}/locations/{}/workflows/{}/executions/{}",
        ctx.project_id, ctx.region, workflow, id
    )
}

#[async_trait]
impl WorkflowService for FakeWorkflowService {
    async fn start_execution(
        &self,
        ctx: &RunContext,
        workflow: &str,
        argument: &Value,
    ) -> Result<Value, ApiError> {
        self.starts
            .lock()
            .unwrap()
            .push((workflow.to_string(), argument.clone()));

        if let Some((status, message)) = self.start_failures.lock().unwrap().pop_front() {
            return Err(ApiError::Status { status, message });
        }

        let states = self
            .scripts
            .lock()
            .unwrap()
            .get(workflow)
            .cloned()
            .unwrap_or_else(|| vec!["SUCCEEDED".to_string()]);

        let mut executions = self.executions.lock().unwrap();
        let started = executions.len() as i64;
        let name = execution_name(ctx, workflow, &format!("exec-{}", started));
        executions.push(FakeExecution {
            workflow: workflow.to_string(),
            name: name.clone(),
            started,
            states: states.into_iter().collect(),
        });

        Ok(json!({ "name": name, "state": "ACTIVE" }))
    }

    async fn list_executions(
        &self,
        _ctx: &RunContext,
        workflow: &str,
    ) -> Result<Vec<ExecutionSummary>, ApiError> {
        *self
            .list_calls
            .lock()
            .unwrap()
            .entry(workflow.to_string())
            .or_default() += 1;

        if let Some((status, message)) = self.list_failures.lock().unwrap().pop_front() {
            return Err(ApiError::Status { status, message });
        }

        let mut executions = self.executions.lock().unwrap();
        let mut listed: Vec<ExecutionSummary> = executions
            .iter_mut()
            .filter(|e| e.workflow == workflow)
            .map(|e| {
                let state = if e.states.len() > 1 {
                    e.states.pop_front().unwrap_or_default()
                } else {
                    e.states.front().cloned().unwrap_or_default()
                };
                ExecutionSummary {
                    name: e.name.clone(),
                    state,
                    start_time: Some(Utc.timestamp_opt(1_700_000_000 + e.started, 0).unwrap()),
                }
            })
            .collect();
        listed.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        Ok(listed)
    }

    async fn describe_execution(&self, execution_name: &str) -> Result<Value, ApiError> {
        self.describe_calls
            .lock()
            .unwrap()
            .push(execution_name.to_string());
        Ok(json!({
            "name": execution_name,
            "state": "FAILED",
            "error": { "payload": "Step copy_each failed: permission denied" },
        }))
    }
}

/// Orchestrator over the fakes, without readiness waits
pub fn orchestrator(
    control_plane: &Arc<FakeControlPlane>,
    workflows: &Arc<FakeWorkflowService>,
    polling: PollSettings,
) -> Orchestrator {
    Orchestrator::new(
        control_plane.clone(),
        workflows.clone(),
        builtin_retry(3),
        ReadinessGate::disabled(),
        polling,
    )
}
