//! Google Cloud REST control plane.
//!
//! Each resource kind maps to one create call. Service enablement and the
//! compute, notebooks and workflows creates return long-running operations;
//! [`GcpControlPlane::realize`] hands those back so the provisioner can
//! wait on them before realizing dependents.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::domain::{InstanceSummary, Operation, ResourceKind, ResourceSpec, RunContext};

use super::{ApiError, ControlPlane, TokenProvider};

/// Root domain for Google APIs (`<service>.<host>`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiEndpoints {
    #[serde(default = "default_api_host")]
    pub host: String,
}

fn default_api_host() -> String {
    "googleapis.com".to_string()
}

impl Default for ApiEndpoints {
    fn default() -> Self {
        Self {
            host: default_api_host(),
        }
    }
}

impl ApiEndpoints {
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }

    /// `https://<service>.<host>/<path>`
    pub fn url(&self, service: &str, path: &str) -> String {
        format!("https://{}.{}/{}", service, self.host, path.trim_start_matches('/'))
    }
}

/// Body of a create request
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Json(Value),

    /// Raw upload of a local file; the file content is never inspected
    File { path: PathBuf, content_type: String },
}

/// A fully described create call
#[derive(Debug, Clone, PartialEq)]
pub struct CreateRequest {
    pub method: Method,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub body: RequestBody,
}

impl CreateRequest {
    fn post(url: String, body: Value) -> Self {
        Self {
            method: Method::POST,
            url,
            query: Vec::new(),
            body: RequestBody::Json(body),
        }
    }

    fn with_query(mut self, key: &str, value: &str) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }
}

fn required<'a>(spec: &'a ResourceSpec, key: &str) -> Result<&'a str, ApiError> {
    spec.attr(key).ok_or_else(|| ApiError::InvalidSpec {
        resource: spec.name.clone(),
        reason: format!("missing required attribute '{}'", key),
    })
}

/// Build the create call for a (rendered) spec
pub async fn create_request(
    endpoints: &ApiEndpoints,
    ctx: &RunContext,
    spec: &ResourceSpec,
) -> Result<CreateRequest, ApiError> {
    let project = &ctx.project_id;
    let id = spec.resource_id();

    let request = match spec.kind {
        ResourceKind::ProjectService => CreateRequest::post(
            endpoints.url(
                "serviceusage",
                &format!("v1/projects/{}/services/{}:enable", project, id),
            ),
            json!({}),
        ),

        ResourceKind::StorageBucket => {
            let mut body = json!({
                "name": id,
                "location": spec.attr("location").unwrap_or(&ctx.region),
                "iamConfiguration": { "uniformBucketLevelAccess": { "enabled": true } },
            });
            if let Some(class) = spec.attr("storage_class") {
                body["storageClass"] = json!(class);
            }
            if let Some(labels) = spec.attributes.get("labels") {
                body["labels"] = labels.clone();
            }
            CreateRequest::post(endpoints.url("storage", "storage/v1/b"), body)
                .with_query("project", project)
        }

        ResourceKind::StorageObject => {
            let bucket = required(spec, "bucket")?;
            let source = required(spec, "source")?;
            CreateRequest {
                method: Method::POST,
                url: endpoints.url("storage", &format!("upload/storage/v1/b/{}/o", bucket)),
                query: Vec::new(),
                body: RequestBody::File {
                    path: PathBuf::from(source),
                    content_type: spec
                        .attr("content_type")
                        .unwrap_or("application/octet-stream")
                        .to_string(),
                },
            }
            .with_query("uploadType", "media")
            .with_query("name", id)
        }

        ResourceKind::ServiceAccount => CreateRequest::post(
            endpoints.url("iam", &format!("v1/projects/{}/serviceAccounts", project)),
            json!({
                "accountId": id,
                "serviceAccount": {
                    "displayName": spec.attr("display_name").unwrap_or(id),
                },
            }),
        ),

        ResourceKind::Network => CreateRequest::post(
            endpoints.url("compute", &format!("compute/v1/projects/{}/global/networks", project)),
            json!({
                "name": id,
                "autoCreateSubnetworks": false,
            }),
        ),

        ResourceKind::Subnetwork => {
            let region = spec.attr("region").unwrap_or(&ctx.region);
            CreateRequest::post(
                endpoints.url(
                    "compute",
                    &format!("compute/v1/projects/{}/regions/{}/subnetworks", project, region),
                ),
                json!({
                    "name": id,
                    "network": required(spec, "network")?,
                    "ipCidrRange": required(spec, "ip_cidr_range")?,
                    "privateIpGoogleAccess": true,
                }),
            )
        }

        ResourceKind::NotebookInstance => {
            let zone = spec.attr("zone").unwrap_or(&ctx.zone);
            let mut setup = json!({
                "machineType": spec.attr("machine_type").unwrap_or("e2-standard-2"),
                "networkInterfaces": [{
                    "network": required(spec, "network")?,
                    "subnet": required(spec, "subnetwork")?,
                }],
            });
            if let Some(email) = spec.attr("service_account") {
                setup["serviceAccounts"] = json!([{ "email": email }]);
            }
            if let Some(metadata) = spec.attributes.get("metadata") {
                setup["metadata"] = metadata.clone();
            }
            CreateRequest::post(
                endpoints.url(
                    "notebooks",
                    &format!("v2/projects/{}/locations/{}/instances", project, zone),
                ),
                json!({ "gceSetup": setup }),
            )
            .with_query("instanceId", id)
        }

        ResourceKind::Workflow => {
            let region = spec.attr("region").unwrap_or(&ctx.region);
            let source = required(spec, "source")?;
            let source_contents = tokio::fs::read_to_string(source).await?;
            let mut body = json!({ "sourceContents": source_contents });
            if let Some(email) = spec.attr("service_account") {
                body["serviceAccount"] = json!(email);
            }
            CreateRequest::post(
                endpoints.url(
                    "workflows",
                    &format!("v1/projects/{}/locations/{}/workflows", project, region),
                ),
                body,
            )
            .with_query("workflowId", id)
        }
    };

    Ok(request)
}

/// Extract `error.message` from a Google API error body
pub fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string())
}

/// Service and API version whose operations a kind's create call returns;
/// `None` for creates that complete synchronously
fn operation_api(kind: ResourceKind) -> Option<(&'static str, &'static str)> {
    match kind {
        ResourceKind::ProjectService => Some(("serviceusage", "v1")),
        ResourceKind::Network | ResourceKind::Subnetwork => Some(("compute", "compute/v1")),
        ResourceKind::NotebookInstance => Some(("notebooks", "v2")),
        ResourceKind::Workflow => Some(("workflows", "v1")),
        ResourceKind::StorageBucket | ResourceKind::StorageObject | ResourceKind::ServiceAccount => {
            None
        }
    }
}

/// Decode an operation resource.
///
/// Compute operations carry `status` and a `selfLink`; the other APIs
/// return `google.longrunning.Operation` (`name`, `done`, `error`), read
/// back from `<service>/<version>/<name>`.
pub fn decode_operation(
    endpoints: &ApiEndpoints,
    service: &str,
    version: &str,
    body: &Value,
) -> Option<Operation> {
    let name = body["name"].as_str()?;

    if body["kind"] == "compute#operation" {
        let poll_url = body["selfLink"].as_str()?;
        let errors: Vec<&str> = body["error"]["errors"]
            .as_array()
            .map(|errors| errors.iter().filter_map(|e| e["message"].as_str()).collect())
            .unwrap_or_default();
        let operation = Operation::pending(name, poll_url);
        if body["status"] != "DONE" {
            return Some(operation);
        }
        return Some(operation.finished((!errors.is_empty()).then(|| errors.join("; "))));
    }

    let operation = Operation::pending(name, endpoints.url(service, &format!("{}/{}", version, name)));
    if !body["done"].as_bool().unwrap_or(false) {
        return Some(operation);
    }
    let error = body["error"]["message"].as_str().map(str::to_string);
    Some(operation.finished(error))
}

/// Instances from an `aggregated/instances` page, across all zones
pub fn decode_instances(body: &Value) -> Vec<InstanceSummary> {
    let Some(scopes) = body["items"].as_object() else {
        return Vec::new();
    };

    scopes
        .values()
        .filter_map(|scope| scope["instances"].as_array())
        .flatten()
        .filter_map(|instance| {
            let name = instance["name"].as_str()?;
            let zone = instance["zone"]
                .as_str()
                .and_then(|z| z.rsplit('/').next())
                .unwrap_or_default();
            Some(InstanceSummary {
                name: name.to_string(),
                zone: zone.to_string(),
                status: instance["status"].as_str().unwrap_or_default().to_string(),
            })
        })
        .collect()
}

/// Authenticated JSON client shared by the Google adapters
#[derive(Clone)]
pub struct GoogleApiClient {
    http: reqwest::Client,
    tokens: Arc<dyn TokenProvider>,
}

impl GoogleApiClient {
    pub fn new(tokens: Arc<dyn TokenProvider>) -> Self {
        Self {
            http: reqwest::Client::new(),
            tokens,
        }
    }

    /// Send a request and decode the JSON response.
    ///
    /// Non-2xx responses become [`ApiError::Status`]; 409 becomes
    /// [`ApiError::AlreadyExists`] naming `subject`.
    pub async fn send(
        &self,
        method: Method,
        url: &str,
        query: &[(String, String)],
        body: Option<RequestBody>,
        subject: &str,
    ) -> Result<Value, ApiError> {
        let token = self.tokens.access_token().await?;

        let mut request = self
            .http
            .request(method.clone(), url)
            .query(query)
            .header("Authorization", format!("Bearer {}", token))
            .header("Accept", "application/json");

        request = match body {
            Some(RequestBody::Json(value)) => request.json(&value),
            Some(RequestBody::File { path, content_type }) => {
                let bytes = tokio::fs::read(&path).await?;
                request.header("Content-Type", content_type).body(bytes)
            }
            None => request,
        };

        debug!(%method, url, "Calling Google API");
        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;

        if status == StatusCode::CONFLICT {
            return Err(ApiError::AlreadyExists {
                resource: subject.to_string(),
            });
        }
        if !status.is_success() {
            return Err(ApiError::Status {
                status: status.as_u16(),
                message: error_message(&text),
            });
        }

        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text)
            .map_err(|e| ApiError::MalformedResponse(format!("{} from {}", e, url)))
    }
}

/// Control plane backed by the Google Cloud REST APIs
pub struct GcpControlPlane {
    client: GoogleApiClient,
    endpoints: ApiEndpoints,
}

impl GcpControlPlane {
    pub fn new(client: GoogleApiClient, endpoints: ApiEndpoints) -> Self {
        Self { client, endpoints }
    }
}

#[async_trait]
impl ControlPlane for GcpControlPlane {
    async fn realize(
        &self,
        ctx: &RunContext,
        spec: &ResourceSpec,
    ) -> Result<Option<Operation>, ApiError> {
        let request = create_request(&self.endpoints, ctx, spec).await?;
        let subject = format!("{} '{}'", spec.kind, spec.resource_id());

        let body = self
            .client
            .send(
                request.method,
                &request.url,
                &request.query,
                Some(request.body),
                &subject,
            )
            .await?;

        let operation = operation_api(spec.kind).and_then(|(service, version)| {
            decode_operation(&self.endpoints, service, version, &body)
        });
        Ok(operation)
    }

    async fn operation(&self, operation: &Operation) -> Result<Operation, ApiError> {
        let body = self
            .client
            .send(Method::GET, &operation.poll_url, &[], None, &operation.name)
            .await?;

        if body["kind"] == "compute#operation" {
            return decode_operation(&self.endpoints, "compute", "compute/v1", &body)
                .ok_or_else(|| ApiError::MalformedResponse(format!("operation {}: {}", operation.name, body)));
        }

        let error = body["error"]["message"].as_str().map(str::to_string);
        if body["done"].as_bool().unwrap_or(false) {
            Ok(operation.clone().finished(error))
        } else {
            Ok(operation.clone())
        }
    }

    async fn list_instances(&self, ctx: &RunContext) -> Result<Vec<InstanceSummary>, ApiError> {
        let url = self.endpoints.url(
            "compute",
            &format!("compute/v1/projects/{}/aggregated/instances", ctx.project_id),
        );
        let mut instances = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut query = vec![("returnPartialSuccess".to_string(), "true".to_string())];
            if let Some(ref token) = page_token {
                query.push(("pageToken".to_string(), token.clone()));
            }

            let body = self
                .client
                .send(Method::GET, &url, &query, None, "instances")
                .await?;
            instances.extend(decode_instances(&body));

            match body["nextPageToken"].as_str() {
                Some(token) if !token.is_empty() => page_token = Some(token.to_string()),
                _ => break,
            }
        }

        Ok(instances)
    }
}
