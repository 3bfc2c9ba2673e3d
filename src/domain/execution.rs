//! Remote workflow executions: handles, states and poll results.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifies one in-flight invocation of a named workflow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionHandle {
    /// Workflow name (e.g. "copy-data")
    pub workflow: String,

    /// Short execution id (last segment of `execution_name`)
    pub execution_id: String,

    /// Full resource name:
    /// `projects/{p}/locations/{r}/workflows/{w}/executions/{id}`
    pub execution_name: String,

    pub started_at: DateTime<Utc>,
}

impl ExecutionHandle {
    /// Build a handle from a full execution resource name
    pub fn from_name(workflow: &str, execution_name: &str, started_at: DateTime<Utc>) -> Option<Self> {
        let execution_id = execution_name.rsplit('/').next().filter(|id| !id.is_empty())?;
        Some(Self {
            workflow: workflow.to_string(),
            execution_id: execution_id.to_string(),
            execution_name: execution_name.to_string(),
            started_at,
        })
    }
}

/// Lifecycle of an execution. Moves only forward:
/// Pending -> Running -> {Succeeded | Failed}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl ExecutionState {
    /// Map the Workflow Executions API `state` field.
    ///
    /// Returns `None` for values this crate does not know about.
    pub fn from_remote(state: &str) -> Option<Self> {
        match state {
            "STATE_UNSPECIFIED" | "QUEUED" | "PENDING" => Some(Self::Pending),
            "ACTIVE" | "RUNNING" => Some(Self::Running),
            "SUCCEEDED" => Some(Self::Succeeded),
            "FAILED" | "CANCELLED" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Running => 1,
            Self::Succeeded | Self::Failed => 2,
        }
    }

    /// Whether moving from `self` to `next` respects monotonicity.
    /// Staying put is allowed for non-terminal states.
    pub fn can_transition_to(&self, next: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        next.rank() >= self.rank()
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// One entry of the execution-list endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub name: String,

    /// Raw remote state, e.g. "ACTIVE"
    pub state: String,

    pub start_time: Option<DateTime<Utc>>,
}

/// Result of a single poll attempt
#[derive(Debug, Clone, PartialEq)]
pub struct PollResult {
    pub state: ExecutionState,

    /// Execution detail fetched from the describe endpoint, only on FAILED
    pub diagnostics: Option<serde_json::Value>,
}

impl PollResult {
    pub fn pending(state: ExecutionState) -> Self {
        Self {
            state,
            diagnostics: None,
        }
    }
}

/// Result of a whole poll loop
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Succeeded { attempts: u32 },

    Failed {
        attempts: u32,
        diagnostics: serde_json::Value,
    },

    /// Attempts exhausted while still non-terminal. The execution may
    /// still be running; this is neither success nor failure.
    TimedOut {
        attempts: u32,
        last_state: ExecutionState,
    },
}

impl PollOutcome {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Succeeded { attempts }
            | Self::Failed { attempts, .. }
            | Self::TimedOut { attempts, .. } => *attempts,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }
}
