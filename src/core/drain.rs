//! Instance drain wait.
//!
//! Workflows leave compute instances behind while they wind down. Before a
//! project is torn down, this waits until no more than `keep` instances
//! remain (by default the one persistent history server).

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::adapters::{ApiError, ControlPlane};
use crate::domain::{InstanceSummary, RunContext};

use super::retry::RetryPolicy;

/// Drain wait settings as they appear in configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainSettings {
    /// Instances allowed to remain
    #[serde(default = "default_keep")]
    pub keep: usize,

    #[serde(default = "default_interval")]
    pub interval_seconds: u64,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_keep() -> usize {
    1
}
fn default_interval() -> u64 {
    30
}
fn default_max_attempts() -> u32 {
    120
}

impl Default for DrainSettings {
    fn default() -> Self {
        Self {
            keep: default_keep(),
            interval_seconds: default_interval(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl DrainSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }
}

/// How a drain wait ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    Drained {
        attempts: u32,
        remaining: Vec<InstanceSummary>,
    },

    /// Still more than `keep` instances after the last listing
    TimedOut {
        attempts: u32,
        remaining: Vec<InstanceSummary>,
    },
}

/// Waits for a project's compute instances to drain
pub struct InstanceDrain {
    control_plane: Arc<dyn ControlPlane>,
    retry: RetryPolicy,
}

impl InstanceDrain {
    pub fn new(control_plane: Arc<dyn ControlPlane>, retry: RetryPolicy) -> Self {
        Self {
            control_plane,
            retry,
        }
    }

    /// List instances until at most `settings.keep` remain or
    /// `settings.max_attempts` listings have been made.
    #[instrument(skip(self, ctx, settings), fields(project = %ctx.project_id, keep = settings.keep))]
    pub async fn await_drained(
        &self,
        ctx: &RunContext,
        settings: &DrainSettings,
    ) -> Result<DrainOutcome, ApiError> {
        let max_attempts = settings.max_attempts.max(1);
        let mut remaining = Vec::new();

        for attempt in 1..=max_attempts {
            remaining = self
                .retry
                .run("list instances", |_| self.control_plane.list_instances(ctx))
                .await?;

            if remaining.len() <= settings.keep {
                info!(attempt, remaining = remaining.len(), "Instances drained");
                return Ok(DrainOutcome::Drained {
                    attempts: attempt,
                    remaining,
                });
            }

            debug!(attempt, max_attempts, remaining = remaining.len(), "Waiting for instances to drain");
            if attempt < max_attempts {
                tokio::time::sleep(settings.interval()).await;
            }
        }

        warn!(max_attempts, remaining = remaining.len(), "Instances still present");
        Ok(DrainOutcome::TimedOut {
            attempts: max_attempts,
            remaining,
        })
    }
}
