//! Event types for the deployment run log.
//!
//! All state changes are recorded as immutable events in an append-only log.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single event in the append-only run log.
///
/// Events are the source of truth for run state. The current state of any run
/// can be reconstructed by replaying its events in order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier for this event
    pub id: Uuid,

    /// When this event occurred (ISO 8601)
    pub timestamp: DateTime<Utc>,

    /// The run this event belongs to
    pub run_id: Uuid,

    /// Resource or workflow name (if applicable)
    pub subject: Option<String>,

    /// Type of event
    pub event_type: EventType,

    /// Stage of the deployment this event belongs to
    pub stage: Option<Stage>,

    /// Idempotency key; for triggers: "{run_id}:{workflow}:{argument_hash}"
    pub idempotency_key: String,

    /// Human-readable summary (NO secrets)
    pub payload_summary: String,

    /// Time taken in milliseconds
    pub duration_ms: Option<u64>,

    /// Error message if failed
    pub error: Option<String>,

    /// Structured payload (resource identity, execution handle, diagnostics)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Event {
    /// Create a new event with the current timestamp
    pub fn new(
        run_id: Uuid,
        subject: Option<String>,
        event_type: EventType,
        idempotency_key: String,
        payload_summary: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            run_id,
            subject,
            event_type,
            stage: event_type.default_stage(),
            idempotency_key,
            payload_summary,
            duration_ms: None,
            error: None,
            data: None,
        }
    }

    pub fn with_stage(mut self, stage: Stage) -> Self {
        self.stage = Some(stage);
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_error(mut self, error: String) -> Self {
        self.error = Some(error);
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Types of events that can occur during a deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A new run has started (data: plan name + run context)
    RunStarted,

    /// Every stage finished successfully
    RunCompleted,

    /// A stage failed; the run halted
    RunFailed,

    /// A workflow poll timed out; outcome unknown
    RunInconclusive,

    /// A resource was created or found to already exist (data: identity)
    ResourceRealized,

    /// A readiness gate wait finished
    GateWaited,

    /// A workflow execution was started (data: execution handle)
    WorkflowTriggered,

    /// A workflow execution reached SUCCEEDED
    WorkflowSucceeded,

    /// A workflow execution reached FAILED (data: diagnostics)
    WorkflowFailed,

    /// Polling budget exhausted for a workflow execution
    WorkflowTimedOut,
}

impl EventType {
    fn default_stage(&self) -> Option<Stage> {
        match self {
            Self::ResourceRealized => Some(Stage::Provision),
            Self::WorkflowTriggered => Some(Stage::Trigger),
            Self::WorkflowSucceeded | Self::WorkflowFailed | Self::WorkflowTimedOut => {
                Some(Stage::Poll)
            }
            _ => None,
        }
    }
}

/// Deployment stage, reported when a run halts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Provision,
    Trigger,
    Poll,
    Settle,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Provision => "provision",
            Self::Trigger => "trigger",
            Self::Poll => "poll",
            Self::Settle => "settle",
        };
        f.write_str(s)
    }
}
