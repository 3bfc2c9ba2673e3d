//! Long-running control plane operations and compute instance listings.

use serde::{Deserialize, Serialize};

/// A create call the control plane finishes asynchronously
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    /// Operation name as the API reports it
    pub name: String,

    /// Where the operation's status is read from
    pub poll_url: String,

    pub done: bool,

    /// Error reported by a finished operation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Operation {
    pub fn pending(name: impl Into<String>, poll_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            poll_url: poll_url.into(),
            done: false,
            error: None,
        }
    }

    /// Same operation, finished
    pub fn finished(mut self, error: Option<String>) -> Self {
        self.done = true;
        self.error = error;
        self
    }
}

/// A compute instance seen in a project listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSummary {
    pub name: String,

    /// Zone name, e.g. `us-central1-a`
    pub zone: String,

    /// Raw remote status, e.g. "RUNNING"
    pub status: String,
}
