//! Rule and policy units: descriptor parsing, normalization and compilation.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::script::{FailureKind, Interpreter, Script, ScriptFailure};

/// Dedup period applied when a descriptor does not set one.
pub const DEFAULT_DEDUP_PERIOD_MINUTES: u32 = 60;

/// Version given to units that arrive without a catalog version.
pub const DEFAULT_VERSION: &str = "default";

/// Raw unit as stored in the analysis catalog or submitted over the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitDescriptor {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub version_id: String,
    #[serde(default)]
    pub log_types: Vec<String>,
    #[serde(default)]
    pub resource_types: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedup_period_minutes: Option<u32>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub reports: BTreeMap<String, Vec<String>>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl UnitDescriptor {
    /// Categories a unit of `kind` applies to: log types for rules,
    /// resource types for policies.
    pub fn categories(&self, kind: UnitKind) -> &[String] {
        match kind {
            UnitKind::Rule => &self.log_types,
            UnitKind::Policy => &self.resource_types,
        }
    }
}

/// Whether a unit is a detection rule or a compliance policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitKind {
    Rule,
    Policy,
}

impl UnitKind {
    /// Recognized primary entry points, in preference order.
    pub fn primary_points(&self) -> &'static [&'static str] {
        match self {
            UnitKind::Rule => &["rule"],
            UnitKind::Policy => &["policy", "rule"],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UnitKind::Rule => "rule",
            UnitKind::Policy => "policy",
        }
    }
}

impl fmt::Display for UnitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that prevent a unit from being constructed at all.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum UnitError {
    #[error("{kind} field `{field}` is required")]
    MissingField { kind: UnitKind, field: &'static str },

    #[error("{kind} [{id}] does not define a [{expected}] function")]
    MissingEntryPoint {
        kind: UnitKind,
        id: String,
        expected: String,
    },
}

impl UnitError {
    /// Same error expressed as a script failure for result reporting.
    pub fn to_failure(&self) -> ScriptFailure {
        let kind = match self {
            UnitError::MissingField { .. } => FailureKind::Validation,
            UnitError::MissingEntryPoint { .. } => FailureKind::Name,
        };
        ScriptFailure::new(kind, self.to_string())
    }
}

/// A compiled, immutable rule or policy.
#[derive(Debug, Clone)]
pub struct Unit {
    kind: UnitKind,
    id: String,
    version: String,
    categories: Vec<String>,
    dedup_period_minutes: u32,
    tags: Vec<String>,
    reports: BTreeMap<String, Vec<String>>,
    primary_point: &'static str,
    script: Option<Arc<dyn Script>>,
    setup_failure: Option<ScriptFailure>,
}

impl Unit {
    /// Validate the descriptor and compile its body.
    ///
    /// A body that fails to compile still yields a unit; the compile
    /// failure is kept as the setup failure and reported on every run.
    pub fn new(
        kind: UnitKind,
        descriptor: &UnitDescriptor,
        interpreter: &dyn Interpreter,
    ) -> Result<Self, UnitError> {
        if descriptor.id.is_empty() {
            return Err(UnitError::MissingField { kind, field: "id" });
        }
        if descriptor.body.is_empty() {
            return Err(UnitError::MissingField { kind, field: "body" });
        }
        if descriptor.version_id.is_empty() {
            return Err(UnitError::MissingField { kind, field: "versionId" });
        }

        let (script, setup_failure, primary_point) =
            match interpreter.compile(&descriptor.id, &descriptor.body) {
                Ok(script) => {
                    let primary = kind
                        .primary_points()
                        .iter()
                        .copied()
                        .find(|point| script.defines(point))
                        .ok_or_else(|| UnitError::MissingEntryPoint {
                            kind,
                            id: descriptor.id.clone(),
                            expected: kind.primary_points().join("|"),
                        })?;
                    (Some(script), None, primary)
                }
                Err(failure) => {
                    warn!(unit_id = %descriptor.id, error = %failure, "unit body failed to compile");
                    (None, Some(failure), kind.primary_points()[0])
                }
            };

        let mut tags = descriptor.tags.clone();
        tags.sort();
        let mut reports = descriptor.reports.clone();
        for values in reports.values_mut() {
            values.sort();
        }

        debug!(unit_id = %descriptor.id, kind = %kind, primary = primary_point, "constructed unit");

        Ok(Self {
            kind,
            id: descriptor.id.clone(),
            version: descriptor.version_id.clone(),
            categories: descriptor.categories(kind).to_vec(),
            dedup_period_minutes: descriptor
                .dedup_period_minutes
                .unwrap_or(DEFAULT_DEDUP_PERIOD_MINUTES),
            tags,
            reports,
            primary_point,
            script,
            setup_failure,
        })
    }

    /// Construct a unit that arrived without a version token.
    pub fn unversioned(
        kind: UnitKind,
        descriptor: &UnitDescriptor,
        interpreter: &dyn Interpreter,
    ) -> Result<Self, UnitError> {
        let mut descriptor = descriptor.clone();
        descriptor.version_id = DEFAULT_VERSION.to_string();
        Self::new(kind, &descriptor, interpreter)
    }

    pub fn kind(&self) -> UnitKind {
        self.kind
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Empty when the unit applies to every category.
    pub fn categories(&self) -> &[String] {
        &self.categories
    }

    pub fn dedup_period_minutes(&self) -> u32 {
        self.dedup_period_minutes
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn reports(&self) -> &BTreeMap<String, Vec<String>> {
        &self.reports
    }

    /// Entry point invoked first: `rule` for rules, `policy` or `rule` for policies.
    pub fn primary_point(&self) -> &'static str {
        self.primary_point
    }

    /// `None` when the body failed to compile.
    pub fn script(&self) -> Option<&Arc<dyn Script>> {
        self.script.as_ref()
    }

    pub fn setup_failure(&self) -> Option<&ScriptFailure> {
        self.setup_failure.as_ref()
    }
}
