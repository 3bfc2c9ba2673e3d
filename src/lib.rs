//! lakehouse-deploy - Event-sourced provisioning orchestrator
//!
//! Provisions the cloud resources of an analytics lakehouse, then triggers
//! its remote setup workflows and waits for them to finish.
//!
//! # Architecture
//!
//! The system is built around event sourcing:
//! - All state changes are recorded as immutable events
//! - Current state is derived by replaying events
//! - Failed or inconclusive runs can be resumed without recreating
//!   resources or re-triggering finished workflows
//!
//! # Modules
//!
//! - `adapters`: External system integrations (Google Cloud REST APIs)
//! - `core`: Orchestration logic (Provisioner, Gate, Trigger, Poller, Retry)
//! - `domain`: Data structures (ResourceSpec, ExecutionHandle, Event, DeploymentRun)
//! - `config`: Configuration discovery and resolution
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Deploy a plan
//! lakehouse-deploy deploy analytics-lakehouse --project my-project
//!
//! # Check run status
//! lakehouse-deploy status <run-id>
//!
//! # Resume a failed run
//! lakehouse-deploy resume <run-id>
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use crate::core::{DeploymentPlan, Orchestrator};
pub use domain::{DeploymentRun, Event, EventType, RunContext, RunState};
