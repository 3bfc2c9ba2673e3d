//! Per-run context passed explicitly through every component call.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of the current deployment run and the project it targets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunContext {
    pub run_id: Uuid,

    pub project_id: String,

    pub region: String,

    pub zone: String,
}

impl RunContext {
    /// Create a context for a fresh run
    pub fn new(project_id: impl Into<String>, region: impl Into<String>, zone: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            project_id: project_id.into(),
            region: region.into(),
            zone: zone.into(),
        }
    }

    /// Same project and location, different run id (used on resume)
    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = run_id;
        self
    }
}
