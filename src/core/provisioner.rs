//! Resource provisioner.
//!
//! Realizes resource specs against a control plane in dependency order and
//! records each produced identity. A create that returns a long-running
//! operation is only realized once the operation is done. Re-running over
//! the same specs is safe: a resource that already exists counts as
//! realized.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::adapters::{ApiError, ControlPlane};
use crate::domain::{Operation, Realization, ResourceIdentity, ResourceSpec, RunContext};

use super::gate::ReadinessGate;
use super::poller::PollSettings;
use super::retry::RetryPolicy;
use super::template::{self, TemplateError, TemplateScope};

/// Provisioning errors
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("Duplicate resource name '{0}'")]
    DuplicateResource(String),

    #[error("Resource '{resource}' depends on unknown resource '{dependency}'")]
    UnknownDependency { resource: String, dependency: String },

    #[error("Dependency cycle among resources: {}", .0.join(", "))]
    Cycle(Vec<String>),

    #[error("Resource '{resource}': {source}")]
    Template {
        resource: String,
        #[source]
        source: TemplateError,
    },

    #[error("Failed to realize {kind} '{resource}': {source}")]
    Realize {
        resource: String,
        kind: String,
        #[source]
        source: ApiError,
    },

    #[error("Operation {operation} creating '{resource}' still running after {attempts} polls")]
    OperationPending {
        resource: String,
        operation: String,
        attempts: u32,
    },
}

impl ProvisionError {
    fn realize(spec: &ResourceSpec, source: ApiError) -> Self {
        Self::Realize {
            resource: spec.name.clone(),
            kind: spec.kind.to_string(),
            source,
        }
    }
}

/// Dependencies of a spec: declared ones plus any resource its attributes
/// reference through placeholders.
pub fn effective_dependencies(spec: &ResourceSpec) -> BTreeSet<String> {
    let mut deps: BTreeSet<String> = spec.depends_on.iter().cloned().collect();
    for value in spec.attributes.values() {
        deps.extend(template::value_references(value));
    }
    deps
}

/// Stable topological order of `specs` (indices into the slice).
///
/// Among specs whose dependencies are satisfied, declaration order wins.
pub fn dependency_order(specs: &[ResourceSpec]) -> Result<Vec<usize>, ProvisionError> {
    let mut index: HashMap<&str, usize> = HashMap::with_capacity(specs.len());
    for (i, spec) in specs.iter().enumerate() {
        if index.insert(spec.name.as_str(), i).is_some() {
            return Err(ProvisionError::DuplicateResource(spec.name.clone()));
        }
    }

    let mut in_degree = vec![0usize; specs.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); specs.len()];
    for (i, spec) in specs.iter().enumerate() {
        for dep in effective_dependencies(spec) {
            let &d = index
                .get(dep.as_str())
                .ok_or_else(|| ProvisionError::UnknownDependency {
                    resource: spec.name.clone(),
                    dependency: dep.clone(),
                })?;
            in_degree[i] += 1;
            dependents[d].push(i);
        }
    }

    let mut ready: BTreeSet<usize> = (0..specs.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(specs.len());

    while let Some(i) = ready.pop_first() {
        order.push(i);
        for &j in &dependents[i] {
            in_degree[j] -= 1;
            if in_degree[j] == 0 {
                ready.insert(j);
            }
        }
    }

    if order.len() != specs.len() {
        let stuck = (0..specs.len())
            .filter(|i| in_degree[*i] > 0)
            .map(|i| specs[i].name.clone())
            .collect();
        return Err(ProvisionError::Cycle(stuck));
    }

    Ok(order)
}

/// Outcome of realizing one spec
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealizedResource {
    pub identity: ResourceIdentity,
    pub realization: Realization,
    pub duration_ms: u64,
}

/// Realized identities plus propagation bookkeeping
#[derive(Debug, Clone, Default)]
pub struct ResourceRegistry {
    identities: BTreeMap<String, ResourceIdentity>,
    /// Realized resources whose effect has not had time to propagate yet
    pending_propagation: BTreeSet<String>,
    /// Realized since the last drain, for the run log
    unreported: Vec<RealizedResource>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from a previous run's log
    pub fn from_identities(identities: impl IntoIterator<Item = ResourceIdentity>) -> Self {
        let mut registry = Self::new();
        for identity in identities {
            registry.identities.insert(identity.spec_name.clone(), identity);
        }
        registry
    }

    pub fn get(&self, name: &str) -> Option<&ResourceIdentity> {
        self.identities.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.identities.contains_key(name)
    }

    pub fn identities(&self) -> &BTreeMap<String, ResourceIdentity> {
        &self.identities
    }

    pub fn has_pending_propagation(&self) -> bool {
        !self.pending_propagation.is_empty()
    }

    pub fn clear_pending_propagation(&mut self) {
        self.pending_propagation.clear();
    }

    /// Take the resources realized since the last call
    pub fn drain_unreported(&mut self) -> Vec<RealizedResource> {
        std::mem::take(&mut self.unreported)
    }

    fn record(&mut self, realized: RealizedResource, propagates: bool) {
        let name = realized.identity.spec_name.clone();
        if propagates {
            self.pending_propagation.insert(name.clone());
        }
        self.identities.insert(name, realized.identity.clone());
        self.unreported.push(realized);
    }
}

/// Realizes specs against a control plane
pub struct ResourceProvisioner {
    control_plane: Arc<dyn ControlPlane>,
    retry: RetryPolicy,
    gate: ReadinessGate,
    operations: PollSettings,
}

impl ResourceProvisioner {
    pub fn new(control_plane: Arc<dyn ControlPlane>, retry: RetryPolicy, gate: ReadinessGate) -> Self {
        Self {
            control_plane,
            retry,
            gate,
            operations: PollSettings::operations(),
        }
    }

    /// How often, and how long, create operations are polled
    pub fn with_operation_polling(mut self, operations: PollSettings) -> Self {
        self.operations = operations;
        self
    }

    /// Realize every spec in dependency order.
    ///
    /// Specs already present in `registry` (seeded from an earlier attempt
    /// of the same run) are skipped. Propagation waits are inserted before
    /// the first spec that depends on a just-enabled service; waits still
    /// owed at the end are left in the registry for the caller. On error,
    /// everything realized before the failure stays recorded in `registry`.
    #[instrument(skip_all, fields(project = %ctx.project_id, resources = specs.len()))]
    pub async fn provision(
        &self,
        ctx: &RunContext,
        specs: &[ResourceSpec],
        registry: &mut ResourceRegistry,
    ) -> Result<(), ProvisionError> {
        let order = dependency_order(specs)?;

        for i in order {
            let spec = &specs[i];
            if registry.contains(&spec.name) {
                debug!(resource = %spec.name, "Already realized in this run, skipping");
                continue;
            }

            let waits_on_propagation = effective_dependencies(spec)
                .iter()
                .any(|dep| registry.pending_propagation.contains(dep));
            if waits_on_propagation {
                self.gate.wait_for_api_propagation().await;
                registry.clear_pending_propagation();
            }

            let realized = self.realize(ctx, spec, registry).await?;
            registry.record(realized, spec.kind.has_propagation_delay());
        }

        Ok(())
    }

    /// Render and realize a single spec. Its dependencies must already be
    /// in `registry`.
    pub async fn realize(
        &self,
        ctx: &RunContext,
        spec: &ResourceSpec,
        registry: &ResourceRegistry,
    ) -> Result<RealizedResource, ProvisionError> {
        let rendered = render_spec(ctx, spec, registry)?;
        let started = Instant::now();

        let result = self
            .retry
            .run(&format!("realize {}", spec.name), |_| {
                self.control_plane.realize(ctx, &rendered)
            })
            .await;

        let realization = match result {
            Ok(None) => Realization::Created,
            Ok(Some(operation)) => {
                self.await_operation(spec, operation).await?;
                Realization::Created
            }
            Err(e) if e.is_already_exists() => Realization::AlreadyExisted,
            Err(source) => return Err(ProvisionError::realize(spec, source)),
        };

        let identity = ResourceIdentity::derive(ctx, &rendered);
        info!(
            resource = %spec.name,
            kind = %spec.kind,
            ?realization,
            "Resource realized"
        );

        Ok(RealizedResource {
            identity,
            realization,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }
}

impl ResourceProvisioner {
    /// Poll a create operation until it is done.
    ///
    /// Status reads go through the retry policy. An error reported by the
    /// finished operation is fatal.
    #[instrument(skip(self, spec, operation), fields(resource = %spec.name, operation = %operation.name))]
    async fn await_operation(
        &self,
        spec: &ResourceSpec,
        operation: Operation,
    ) -> Result<(), ProvisionError> {
        let mut operation = operation;
        let interval = self.operations.interval();
        let mut attempts = 0u32;

        while !operation.done {
            if attempts >= self.operations.max_attempts {
                warn!(attempts, "Create operation still running, giving up");
                return Err(ProvisionError::OperationPending {
                    resource: spec.name.clone(),
                    operation: operation.name,
                    attempts,
                });
            }

            tokio::time::sleep(interval).await;
            attempts += 1;

            let polled = self
                .retry
                .run(&format!("operation {}", operation.name), |_| {
                    self.control_plane.operation(&operation)
                })
                .await
                .map_err(|source| ProvisionError::realize(spec, source))?;
            debug!(attempts, done = polled.done, "Polled create operation");
            operation = polled;
        }

        match operation.error {
            Some(message) => Err(ProvisionError::realize(
                spec,
                ApiError::OperationFailed {
                    operation: operation.name,
                    message,
                },
            )),
            None => Ok(()),
        }
    }
}

/// Resolve placeholders in a spec's attributes
fn render_spec(
    ctx: &RunContext,
    spec: &ResourceSpec,
    registry: &ResourceRegistry,
) -> Result<ResourceSpec, ProvisionError> {
    let scope = TemplateScope::new(ctx, registry.identities());
    let attributes = spec
        .attributes
        .iter()
        .map(|(k, v)| Ok((k.clone(), template::render_value(v, &scope)?)))
        .collect::<Result<BTreeMap<_, _>, TemplateError>>()
        .map_err(|source| ProvisionError::Template {
            resource: spec.name.clone(),
            source,
        })?;

    Ok(ResourceSpec {
        attributes,
        ..spec.clone()
    })
}
