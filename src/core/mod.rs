//! Core orchestration logic.
//!
//! This module contains:
//! - Classifier / Retry: Transient-error table and the retry loop around it
//! - Provisioner: Dependency-ordered resource realization
//! - Gate: Fixed readiness waits
//! - Drain: Waiting for compute instances to go away before teardown
//! - Trigger / Poller: Remote workflow executions
//! - EventStore: Append-only run log
//! - Plan: Deployment plan definitions and loading
//! - Orchestrator: Main execution engine

pub mod classifier;
pub mod drain;
pub mod event_store;
pub mod gate;
pub mod orchestrator;
pub mod plan;
pub mod poller;
pub mod provisioner;
pub mod retry;
pub mod template;
pub mod trigger;

// Re-export commonly used types
pub use classifier::{Classification, PatternTable, RetryClassifier, TransientPattern};
pub use drain::{DrainOutcome, DrainSettings, InstanceDrain};
pub use event_store::{generate_idempotency_key, hash_input, EventStore};
pub use gate::{ReadinessGate, ReadinessSettings};
pub use orchestrator::Orchestrator;
pub use plan::{DeploymentPlan, PlanError, WorkflowSpec};
pub use poller::{CompletionPoller, ExecutionIndex, PollError, PollSettings};
pub use provisioner::{ProvisionError, RealizedResource, ResourceProvisioner, ResourceRegistry};
pub use retry::{RetryPolicy, RetrySettings};
pub use trigger::{TriggerError, WorkflowTrigger};
