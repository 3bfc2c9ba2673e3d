//! Readiness gate: fixed-duration waits where no completion signal exists.
//!
//! Used after service API enablement (no status endpoint to observe
//! propagation) and once after the last workflow to let its side effects
//! settle. Where a status endpoint does exist, poll it instead.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

/// Readiness wait durations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadinessSettings {
    /// Wait after enabling project services, in seconds
    #[serde(default = "default_api_propagation")]
    pub api_propagation_seconds: u64,

    /// Wait after the last workflow completes, in seconds
    #[serde(default = "default_settle")]
    pub settle_seconds: u64,

    /// Skip all waits (test acceleration)
    #[serde(default)]
    pub skip: bool,
}

fn default_api_propagation() -> u64 {
    30
}
fn default_settle() -> u64 {
    300
}

impl Default for ReadinessSettings {
    fn default() -> Self {
        Self {
            api_propagation_seconds: default_api_propagation(),
            settle_seconds: default_settle(),
            skip: false,
        }
    }
}

/// Blind, fixed-duration waits. Cannot fail.
#[derive(Debug, Clone, Default)]
pub struct ReadinessGate {
    settings: ReadinessSettings,
}

impl ReadinessGate {
    pub fn new(settings: ReadinessSettings) -> Self {
        Self { settings }
    }

    /// A gate that never waits
    pub fn disabled() -> Self {
        Self::new(ReadinessSettings {
            skip: true,
            ..Default::default()
        })
    }

    pub fn is_skipped(&self) -> bool {
        self.settings.skip
    }

    pub fn api_propagation(&self) -> Duration {
        Duration::from_secs(self.settings.api_propagation_seconds)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_secs(self.settings.settle_seconds)
    }

    /// Suspend for `duration`; returns the time actually waited
    pub async fn wait(&self, reason: &str, duration: Duration) -> Duration {
        if self.settings.skip || duration.is_zero() {
            info!(reason, "Readiness wait skipped");
            return Duration::ZERO;
        }

        info!(reason, seconds = duration.as_secs(), "Waiting for readiness");
        tokio::time::sleep(duration).await;
        duration
    }

    /// Wait for service API enablement to propagate
    pub async fn wait_for_api_propagation(&self) -> Duration {
        self.wait("api propagation", self.api_propagation()).await
    }

    /// Wait for post-workflow side effects to settle
    pub async fn wait_to_settle(&self) -> Duration {
        self.wait("settle", self.settle()).await
    }
}
