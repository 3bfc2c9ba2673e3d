//! Domain types for the deployment orchestrator.
//!
//! This module contains the core data structures:
//! - Resources: Specs and the identities they produce
//! - Executions: Remote workflow handles and states
//! - Operations: Asynchronous creates and instance listings
//! - Events: Immutable records of state changes
//! - Run: Deployment run state

pub mod context;
pub mod events;
pub mod execution;
pub mod operation;
pub mod resource;
pub mod run;

// Re-export commonly used types
pub use context::RunContext;
pub use events::{Event, EventType, Stage};
pub use execution::{
    ExecutionHandle, ExecutionState, ExecutionSummary, PollOutcome, PollResult,
};
pub use operation::{InstanceSummary, Operation};
pub use resource::{Realization, ResourceIdentity, ResourceKind, ResourceSpec};
pub use run::{DeploymentRun, RunStartedData, RunState, WorkflowRecord, WorkflowStatus};
