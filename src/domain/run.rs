//! Deployment run state and reconstruction from events.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::context::RunContext;
use super::events::{Event, EventType, Stage};
use super::execution::ExecutionHandle;
use super::resource::ResourceIdentity;

/// Payload of the `RunStarted` event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStartedData {
    pub plan: String,
    pub context: RunContext,
}

/// A deployment run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentRun {
    /// Unique identifier for this run
    pub id: Uuid,

    /// Name of the deployment plan being applied
    pub plan_name: String,

    /// Project and location of the run (absent only in a corrupt log)
    pub context: Option<RunContext>,

    /// Current state of the run
    pub state: RunState,

    pub started_at: DateTime<Utc>,

    pub completed_at: Option<DateTime<Utc>>,

    /// Realized resources keyed by spec name
    pub resources: BTreeMap<String, ResourceIdentity>,

    /// Workflow progress keyed by workflow name
    pub workflows: BTreeMap<String, WorkflowRecord>,
}

/// What the run log knows about one workflow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub status: WorkflowStatus,

    pub handle: Option<ExecutionHandle>,

    /// Idempotency key of the trigger
    pub trigger_key: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Triggered,
    Succeeded,
    Failed,
    TimedOut,
}

impl DeploymentRun {
    /// Create a new run
    pub fn new(plan_name: String, context: RunContext) -> Self {
        Self {
            id: context.run_id,
            plan_name,
            context: Some(context),
            state: RunState::Running,
            started_at: Utc::now(),
            completed_at: None,
            resources: BTreeMap::new(),
            workflows: BTreeMap::new(),
        }
    }

    /// Reconstruct run state from a sequence of events
    pub fn from_events(events: &[Event]) -> Option<Self> {
        let first_event = events.first()?;

        let mut run = Self {
            id: first_event.run_id,
            plan_name: String::new(),
            context: None,
            state: RunState::Running,
            started_at: first_event.timestamp,
            completed_at: None,
            resources: BTreeMap::new(),
            workflows: BTreeMap::new(),
        };

        for event in events {
            run.apply_event(event);
        }

        Some(run)
    }

    /// Apply a single event to update run state
    pub fn apply_event(&mut self, event: &Event) {
        match event.event_type {
            EventType::RunStarted => {
                self.state = RunState::Running;
                self.started_at = event.timestamp;
                self.completed_at = None;
                if let Some(data) = event
                    .data
                    .clone()
                    .and_then(|d| serde_json::from_value::<RunStartedData>(d).ok())
                {
                    self.plan_name = data.plan;
                    self.context = Some(data.context);
                }
            }
            EventType::RunCompleted => {
                self.state = RunState::Completed;
                self.completed_at = Some(event.timestamp);
            }
            EventType::RunFailed => {
                self.state = RunState::Failed {
                    stage: event.stage.unwrap_or(Stage::Provision),
                    error: event.error.clone().unwrap_or_default(),
                };
                self.completed_at = Some(event.timestamp);
            }
            EventType::RunInconclusive => {
                let attempts = event
                    .data
                    .as_ref()
                    .and_then(|d| d.get("attempts"))
                    .and_then(|a| a.as_u64())
                    .unwrap_or_default() as u32;
                self.state = RunState::Inconclusive {
                    workflow: event.subject.clone().unwrap_or_default(),
                    attempts,
                };
                self.completed_at = Some(event.timestamp);
            }
            EventType::ResourceRealized => {
                if let Some(identity) = event
                    .data
                    .clone()
                    .and_then(|d| serde_json::from_value::<ResourceIdentity>(d).ok())
                {
                    self.resources.insert(identity.spec_name.clone(), identity);
                }
            }
            EventType::GateWaited => {}
            EventType::WorkflowTriggered => {
                if let Some(ref workflow) = event.subject {
                    let handle = event
                        .data
                        .clone()
                        .and_then(|d| serde_json::from_value::<ExecutionHandle>(d).ok());
                    self.workflows.insert(
                        workflow.clone(),
                        WorkflowRecord {
                            status: WorkflowStatus::Triggered,
                            handle,
                            trigger_key: Some(event.idempotency_key.clone()),
                        },
                    );
                }
            }
            EventType::WorkflowSucceeded => self.set_workflow_status(event, WorkflowStatus::Succeeded),
            EventType::WorkflowFailed => self.set_workflow_status(event, WorkflowStatus::Failed),
            EventType::WorkflowTimedOut => self.set_workflow_status(event, WorkflowStatus::TimedOut),
        }
    }

    fn set_workflow_status(&mut self, event: &Event, status: WorkflowStatus) {
        if let Some(ref workflow) = event.subject {
            self.workflows
                .entry(workflow.clone())
                .and_modify(|record| record.status = status)
                .or_insert(WorkflowRecord {
                    status,
                    handle: None,
                    trigger_key: None,
                });
        }
    }

    /// Check if the run is still in progress
    pub fn is_running(&self) -> bool {
        matches!(self.state, RunState::Running)
    }

    /// Check if the run has completed (successfully or not)
    pub fn is_finished(&self) -> bool {
        !self.is_running()
    }

    pub fn workflow_status(&self, workflow: &str) -> Option<WorkflowStatus> {
        self.workflows.get(workflow).map(|r| r.status)
    }
}

/// State of a deployment run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum RunState {
    /// Currently executing
    Running,

    /// All stages finished successfully
    Completed,

    /// A stage failed
    Failed { stage: Stage, error: String },

    /// A workflow did not reach a terminal state within the poll budget
    Inconclusive { workflow: String, attempts: u32 },
}

impl Default for RunState {
    fn default() -> Self {
        Self::Running
    }
}

impl RunState {
    /// Short label for listings
    pub fn label(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed { .. } => "failed",
            Self::Inconclusive { .. } => "inconclusive",
        }
    }
}
