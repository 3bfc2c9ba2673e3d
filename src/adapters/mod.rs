//! Adapter interfaces for external systems.
//!
//! Adapters provide a unified interface over the cloud control plane, the
//! workflow execution service and the credential source. The core only sees
//! the traits below; `gcp`, `workflows` and `token` are the Google Cloud
//! implementations.

pub mod gcp;
pub mod token;
pub mod workflows;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{ExecutionSummary, InstanceSummary, Operation, ResourceSpec, RunContext};

pub use gcp::{ApiEndpoints, GcpControlPlane};
pub use token::{EnvTokenProvider, GcloudTokenProvider, StaticTokenProvider};
pub use workflows::WorkflowsClient;

/// Errors returned by remote calls.
///
/// The `Display` text is what the retry classifier matches against, so
/// `Status` renders in the same `Error <code>: <message>` shape the cloud
/// tooling uses.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Error {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Error 409: {resource} already exists")]
    AlreadyExists { resource: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Credential error: {0}")]
    Credentials(String),

    #[error("Operation {operation} failed: {message}")]
    OperationFailed { operation: String, message: String },

    #[error("Invalid resource spec '{resource}': {reason}")]
    InvalidSpec { resource: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ApiError {
    /// Whether the error means the target already exists
    pub fn is_already_exists(&self) -> bool {
        match self {
            Self::AlreadyExists { .. } => true,
            Self::Status { status, message } => {
                *status == 409 || message.to_lowercase().contains("already exists")
            }
            _ => false,
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

/// A cloud control plane able to create resources
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Create the resource described by `spec`.
    ///
    /// Attributes are already rendered. Implementations report an existing
    /// resource as [`ApiError::AlreadyExists`] (or a 409 status); the
    /// provisioner treats that as success. Creates that complete
    /// asynchronously return the operation tracking them.
    async fn realize(
        &self,
        ctx: &RunContext,
        spec: &ResourceSpec,
    ) -> Result<Option<Operation>, ApiError>;

    /// Fresh status of an operation returned by [`ControlPlane::realize`]
    async fn operation(&self, operation: &Operation) -> Result<Operation, ApiError>;

    /// Compute instances currently present in the project, in every zone
    async fn list_instances(&self, ctx: &RunContext) -> Result<Vec<InstanceSummary>, ApiError>;
}

/// Remote workflow execution service
#[async_trait]
pub trait WorkflowService: Send + Sync {
    /// Start an execution; returns the raw response body, which should
    /// carry the new execution's `name`.
    async fn start_execution(
        &self,
        ctx: &RunContext,
        workflow: &str,
        argument: &serde_json::Value,
    ) -> Result<serde_json::Value, ApiError>;

    /// Executions of `workflow`, newest first
    async fn list_executions(
        &self,
        ctx: &RunContext,
        workflow: &str,
    ) -> Result<Vec<ExecutionSummary>, ApiError>;

    /// Full execution detail, used for diagnostics only
    async fn describe_execution(&self, execution_name: &str) -> Result<serde_json::Value, ApiError>;
}

/// Source of bearer credentials
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn access_token(&self) -> Result<String, ApiError>;
}
