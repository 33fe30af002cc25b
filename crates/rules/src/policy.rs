//! Compliance evaluation: resources against many policies.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};
use tripwire_core::Config;

use crate::runner::{RunMode, UnitRunner};
use crate::script::{Argument, Interpreter, Mocks, ScriptFailure};
use crate::unit::{Unit, UnitDescriptor, UnitKind};

#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("policy with id {0} already exists")]
    DuplicateId(String),

    #[error("failed to build worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

/// A resource to evaluate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub id: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    #[serde(default)]
    pub attributes: Value,
    #[serde(default)]
    pub mocks: Mocks,
}

/// A policy that raised, returned a non-boolean, or could not be built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErroredPolicy {
    pub id: String,
    pub message: String,
}

/// Outcome of every applicable policy for one resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceResult {
    pub id: String,
    pub errored: Vec<ErroredPolicy>,
    pub failed: Vec<String>,
    pub passed: Vec<String>,
}

/// `{"policies": [...], "resources": [...]}`; both keys are required.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRequest {
    pub policies: Vec<UnitDescriptor>,
    pub resources: Vec<ResourceDescriptor>,
}

/// `{"resources": [...]}`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyResponse {
    pub resources: Vec<ResourceResult>,
}

#[derive(Debug)]
enum Entry {
    Ready(Unit),
    /// Construction failed; reported as errored wherever the policy applies.
    Broken { id: String, failure: ScriptFailure },
}

impl Entry {
    fn id(&self) -> &str {
        match self {
            Entry::Ready(unit) => unit.id(),
            Entry::Broken { id, .. } => id,
        }
    }
}

/// A fixed set of compiled policies.
pub struct PolicySet {
    by_type: HashMap<String, Vec<Arc<Entry>>>,
    /// Policies without resource types; they apply to every resource.
    global: Vec<Arc<Entry>>,
    runner: UnitRunner,
    pool: rayon::ThreadPool,
}

impl std::fmt::Debug for PolicySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicySet")
            .field("resource_types", &self.by_type.len())
            .field("global", &self.global.len())
            .finish()
    }
}

impl PolicySet {
    /// Compile `policies`. Policies arrive without versions and get the
    /// default one. Duplicate ids are rejected.
    pub fn new(
        policies: &[UnitDescriptor],
        interpreter: &dyn Interpreter,
        config: &Config,
    ) -> Result<Self, PolicyError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.execution.resolved_worker_threads())
            .build()?;
        let runner = UnitRunner::new(config.limits.clone(), config.execution.invocation_timeout());

        let mut seen = HashSet::new();
        let mut by_type: HashMap<String, Vec<Arc<Entry>>> = HashMap::new();
        let mut global = Vec::new();

        for descriptor in policies {
            if !seen.insert(descriptor.id.clone()) {
                return Err(PolicyError::DuplicateId(descriptor.id.clone()));
            }
            let entry = match Unit::unversioned(UnitKind::Policy, descriptor, interpreter) {
                Ok(unit) => Entry::Ready(unit),
                Err(e) => {
                    warn!(policy_id = %descriptor.id, error = %e, "failed to import policy");
                    Entry::Broken {
                        id: descriptor.id.clone(),
                        failure: e.to_failure(),
                    }
                }
            };
            let entry = Arc::new(entry);
            let types = descriptor.categories(UnitKind::Policy);
            if types.is_empty() {
                global.push(entry);
            } else {
                for resource_type in types {
                    by_type.entry(resource_type.clone()).or_default().push(Arc::clone(&entry));
                }
            }
        }

        debug!(policies = policies.len(), global = global.len(), "policy set built");
        Ok(Self {
            by_type,
            global,
            runner,
            pool,
        })
    }

    /// Evaluate every applicable policy: type-specific ones first, then
    /// global ones, each in declaration order.
    pub fn analyze(&self, resource: &ResourceDescriptor) -> ResourceResult {
        let mut result = ResourceResult {
            id: resource.id.clone(),
            ..ResourceResult::default()
        };

        let applicable = self
            .by_type
            .get(&resource.resource_type)
            .into_iter()
            .flatten()
            .chain(self.global.iter());

        for entry in applicable {
            let unit = match entry.as_ref() {
                Entry::Ready(unit) => unit,
                Entry::Broken { id, failure } => {
                    result.errored.push(ErroredPolicy {
                        id: id.clone(),
                        message: failure.display_message(),
                    });
                    continue;
                }
            };

            if let Some(name) = unknown_mock(unit, &resource.mocks) {
                debug!(policy_id = %unit.id(), mock = %name, "mock not used by policy");
                result.errored.push(ErroredPolicy {
                    id: entry.id().to_string(),
                    message: format!("Bad Mock Data: '{}'", name),
                });
                result.failed.push(entry.id().to_string());
                continue;
            }

            let outcome = self.runner.run_primary(
                unit,
                Argument::Record(&resource.attributes),
                &resource.mocks,
                RunMode::Batch,
            );
            match (outcome.primary_failure(), outcome.matched()) {
                (Some(failure), _) => result.errored.push(ErroredPolicy {
                    id: entry.id().to_string(),
                    message: failure.display_message(),
                }),
                (None, Some(true)) => result.passed.push(entry.id().to_string()),
                (None, _) => result.failed.push(entry.id().to_string()),
            }
        }

        result
    }

    /// Evaluate `resources` in parallel, preserving input order.
    pub fn analyze_all(&self, resources: &[ResourceDescriptor]) -> Vec<ResourceResult> {
        let results: Vec<ResourceResult> = self
            .pool
            .install(|| resources.par_iter().map(|r| self.analyze(r)).collect());
        let errored: usize = results.iter().map(|r| r.errored.len()).sum();
        info!(resources = resources.len(), errored, "compliance scan complete");
        results
    }

    /// Handle a full process-protocol request.
    pub fn evaluate(
        request: &PolicyRequest,
        interpreter: &dyn Interpreter,
        config: &Config,
    ) -> Result<PolicyResponse, PolicyError> {
        info!(
            resources = request.resources.len(),
            policies = request.policies.len(),
            "scanning resources with compliance policies"
        );
        let set = Self::new(&request.policies, interpreter, config)?;
        Ok(PolicyResponse {
            resources: set.analyze_all(&request.resources),
        })
    }
}

/// First mock, in name order, that the policy body never refers to.
fn unknown_mock<'m>(unit: &Unit, mocks: &'m Mocks) -> Option<&'m str> {
    let script = unit.script()?;
    mocks
        .keys()
        .map(String::as_str)
        .find(|name| !script.uses(name))
}
