//! Resource specifications and the identities they produce once realized.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::context::RunContext;

/// Kinds of cloud objects the provisioner knows how to create
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// A service API enabled on the project (e.g. `workflows.googleapis.com`)
    ProjectService,

    /// A storage bucket
    StorageBucket,

    /// An opaque local file uploaded into a bucket
    StorageObject,

    /// A service account
    ServiceAccount,

    /// A VPC network
    Network,

    /// A regional subnetwork
    Subnetwork,

    /// A managed notebook instance
    NotebookInstance,

    /// A workflow definition
    Workflow,
}

impl ResourceKind {
    /// Whether the effect of creating this kind propagates asynchronously
    /// with no status endpoint to observe it.
    pub fn has_propagation_delay(&self) -> bool {
        matches!(self, Self::ProjectService)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProjectService => "project_service",
            Self::StorageBucket => "storage_bucket",
            Self::StorageObject => "storage_object",
            Self::ServiceAccount => "service_account",
            Self::Network => "network",
            Self::Subnetwork => "subnetwork",
            Self::NotebookInstance => "notebook_instance",
            Self::Workflow => "workflow",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A declarative description of a cloud object to create.
///
/// `name` is the key other specs and workflow parameters use to refer to
/// this resource; `attributes` are kind-specific and may contain
/// `{{ other.attribute }}` placeholders resolved at realization time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub name: String,

    pub kind: ResourceKind,

    #[serde(default)]
    pub attributes: BTreeMap<String, serde_json::Value>,

    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl ResourceSpec {
    pub fn new(name: impl Into<String>, kind: ResourceKind) -> Self {
        Self {
            name: name.into(),
            kind,
            attributes: BTreeMap::new(),
            depends_on: Vec::new(),
        }
    }

    pub fn with_attribute(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    pub fn depends_on(mut self, name: &str) -> Self {
        self.depends_on.push(name.to_string());
        self
    }

    /// Get a string attribute
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(|v| v.as_str())
    }

    /// The cloud-side name: the `id` attribute when present, else the spec name
    pub fn resource_id(&self) -> &str {
        self.attr("id").unwrap_or(&self.name)
    }
}

/// Identity attributes of a realized resource, referenced by later stages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceIdentity {
    pub spec_name: String,

    pub kind: ResourceKind,

    pub attributes: BTreeMap<String, String>,
}

impl ResourceIdentity {
    /// Derive the identity a spec will have once realized.
    ///
    /// Google Cloud names are caller-chosen, so identities are known before
    /// (and independent of) the create call. This is what lets an
    /// already-existing resource count as realized.
    pub fn derive(ctx: &RunContext, spec: &ResourceSpec) -> Self {
        let id = spec.resource_id().to_string();
        let project = &ctx.project_id;
        let mut attributes = BTreeMap::new();

        match spec.kind {
            ResourceKind::ProjectService => {
                attributes.insert("service".to_string(), id.clone());
            }
            ResourceKind::StorageBucket => {
                attributes.insert("url".to_string(), format!("gs://{}", id));
            }
            ResourceKind::StorageObject => {
                let bucket = spec.attr("bucket").unwrap_or_default();
                attributes.insert("bucket".to_string(), bucket.to_string());
                attributes.insert("url".to_string(), format!("gs://{}/{}", bucket, id));
            }
            ResourceKind::ServiceAccount => {
                attributes.insert(
                    "email".to_string(),
                    format!("{}@{}.iam.gserviceaccount.com", id, project),
                );
            }
            ResourceKind::Network => {
                attributes.insert(
                    "self_link".to_string(),
                    format!("projects/{}/global/networks/{}", project, id),
                );
            }
            ResourceKind::Subnetwork => {
                let region = spec.attr("region").unwrap_or(&ctx.region);
                attributes.insert(
                    "self_link".to_string(),
                    format!("projects/{}/regions/{}/subnetworks/{}", project, region, id),
                );
            }
            ResourceKind::NotebookInstance => {
                let zone = spec.attr("zone").unwrap_or(&ctx.zone);
                attributes.insert(
                    "self_link".to_string(),
                    format!("projects/{}/locations/{}/instances/{}", project, zone, id),
                );
            }
            ResourceKind::Workflow => {
                let region = spec.attr("region").unwrap_or(&ctx.region);
                attributes.insert(
                    "self_link".to_string(),
                    format!("projects/{}/locations/{}/workflows/{}", project, region, id),
                );
            }
        }
        attributes.insert("name".to_string(), id);

        Self {
            spec_name: spec.name.clone(),
            kind: spec.kind,
            attributes,
        }
    }

    pub fn get(&self, attribute: &str) -> Option<&str> {
        self.attributes.get(attribute).map(String::as_str)
    }
}

/// How a realize call ended on the control plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Realization {
    Created,
    AlreadyExisted,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> RunContext {
        RunContext::new("p1", "us-central1", "us-central1-a")
    }

    #[test]
    fn test_service_account_identity() {
        let spec = ResourceSpec::new("workflows_sa", ResourceKind::ServiceAccount)
            .with_attribute("id", "workflows-sa");
        let identity = ResourceIdentity::derive(&ctx(), &spec);

        assert_eq!(identity.get("name"), Some("workflows-sa"));
        assert_eq!(
            identity.get("email"),
            Some("workflows-sa@p1.iam.gserviceaccount.com")
        );
    }

    #[test]
    fn test_bucket_identity_defaults_to_spec_name() {
        let spec = ResourceSpec::new("raw-bucket", ResourceKind::StorageBucket);
        let identity = ResourceIdentity::derive(&ctx(), &spec);

        assert_eq!(identity.get("name"), Some("raw-bucket"));
        assert_eq!(identity.get("url"), Some("gs://raw-bucket"));
    }

    #[test]
    fn test_subnetwork_uses_context_region() {
        let spec = ResourceSpec::new("subnet", ResourceKind::Subnetwork);
        let identity = ResourceIdentity::derive(&ctx(), &spec);

        assert_eq!(
            identity.get("self_link"),
            Some("projects/p1/regions/us-central1/subnetworks/subnet")
        );
    }

    #[test]
    fn test_only_services_propagate() {
        assert!(ResourceKind::ProjectService.has_propagation_delay());
        assert!(!ResourceKind::StorageBucket.has_propagation_delay());
    }
}
