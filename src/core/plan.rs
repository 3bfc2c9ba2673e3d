//! Deployment plan definitions and loading.
//!
//! A plan is a YAML document listing the resources to realize and the
//! workflows to run afterwards, in order.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;

use serde_json::Value;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::ResourceSpec;

use super::provisioner::{dependency_order, ProvisionError};
use super::template::{self, CONTEXT_VARIABLES};

/// A complete deployment plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentPlan {
    /// Plan name (used in CLI)
    pub name: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Resources to realize before any workflow runs
    #[serde(default)]
    pub resources: Vec<ResourceSpec>,

    /// Workflows to trigger, in order
    #[serde(default)]
    pub workflows: Vec<WorkflowSpec>,
}

/// A workflow to trigger once resources are realized
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSpec {
    /// Remote workflow name
    pub name: String,

    /// Argument fields; strings may contain placeholders
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,

    /// Resources that must be realized first (placeholder references are
    /// added implicitly)
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Workflows that must have succeeded first
    #[serde(default)]
    pub after: Vec<String>,
}

impl WorkflowSpec {
    /// Declared resource dependencies plus placeholder references
    pub fn required_resources(&self) -> BTreeSet<String> {
        let mut required: BTreeSet<String> = self.depends_on.iter().cloned().collect();
        for value in self.parameters.values() {
            required.extend(template::value_references(value));
        }
        required
    }
}

/// Plan validation errors
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("Plan name cannot be empty")]
    EmptyName,

    #[error("'{0}' is reserved for run context placeholders and cannot name a resource")]
    ReservedName(String),

    #[error(transparent)]
    Resources(#[from] ProvisionError),

    #[error("Duplicate workflow '{0}'")]
    DuplicateWorkflow(String),

    #[error("Workflow '{workflow}' requires unknown resource '{resource}'")]
    UnknownResource { workflow: String, resource: String },

    #[error("Workflow '{workflow}' must run after '{after}', which is not declared before it")]
    UnknownPredecessor { workflow: String, after: String },
}

impl DeploymentPlan {
    /// Load a plan from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read plan file: {}", path.display()))?;

        Self::from_yaml(&content)
    }

    /// Parse a plan from YAML content
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse plan YAML")
    }

    /// Validate the plan before any remote call is made
    pub fn validate(&self) -> Result<(), PlanError> {
        if self.name.is_empty() {
            return Err(PlanError::EmptyName);
        }

        if let Some(spec) = self
            .resources
            .iter()
            .find(|r| CONTEXT_VARIABLES.contains(&r.name.as_str()))
        {
            return Err(PlanError::ReservedName(spec.name.clone()));
        }

        // Unknown dependencies, duplicates and cycles
        dependency_order(&self.resources)?;

        let resource_names: HashSet<&str> = self.resources.iter().map(|r| r.name.as_str()).collect();
        let mut seen_workflows: HashSet<&str> = HashSet::new();

        for workflow in &self.workflows {
            for resource in workflow.required_resources() {
                if !resource_names.contains(resource.as_str()) {
                    return Err(PlanError::UnknownResource {
                        workflow: workflow.name.clone(),
                        resource,
                    });
                }
            }

            // Predecessors must be declared earlier (no forward references)
            for after in &workflow.after {
                if !seen_workflows.contains(after.as_str()) {
                    return Err(PlanError::UnknownPredecessor {
                        workflow: workflow.name.clone(),
                        after: after.clone(),
                    });
                }
            }

            if !seen_workflows.insert(workflow.name.as_str()) {
                return Err(PlanError::DuplicateWorkflow(workflow.name.clone()));
            }
        }

        Ok(())
    }

    /// Make relative `source` attributes (local files read at realization
    /// time) relative to `base` instead of the working directory. A source
    /// that starts with a placeholder is left for rendering.
    pub fn with_sources_under(mut self, base: &Path) -> Self {
        for spec in &mut self.resources {
            if let Some(Value::String(source)) = spec.attributes.get_mut("source") {
                if Path::new(source.as_str()).is_relative() && !source.trim_start().starts_with("{{") {
                    *source = base.join(source.as_str()).to_string_lossy().into_owned();
                }
            }
        }
        self
    }
}
