//! Detection engine: matches rules to events by log type and turns unit
//! results into alert candidates.

mod batch;
mod single;

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};
use tripwire_core::{Config, Severity};

use crate::catalog::{AnalysisCatalog, CatalogError, OutputsCatalog};
use crate::destination::{Destination, DestinationIndex};
use crate::event::EventView;
use crate::field_model::{FieldModel, LookupError};
use crate::result::{ExecutionResult, PointFailure};
use crate::runner::{RunMode, UnitRunner};
use crate::script::{Argument, FailureKind, Interpreter, Mocks};
use crate::unit::{Unit, UnitKind};

pub use self::batch::BatchEvent;
pub use self::single::{DirectRequest, DirectResponse, SingleRuleResponse, TestSpec, MISSING_FIELD_MODEL_MESSAGE};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),

    /// A failure that invalidates the whole event, such as a missing field model.
    #[error("ConfigurationError: {message} (rule {unit_id})")]
    Configuration { unit_id: String, message: String },

    #[error("evaluation cancelled")]
    Cancelled,

    #[error("failed to build worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// Alert candidate for one (rule, event) pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineResult {
    pub rule_id: String,
    pub rule_version: String,
    pub log_type: String,
    pub dedup: String,
    pub dedup_period_mins: u32,
    pub rule_tags: Vec<String>,
    pub rule_reports: std::collections::BTreeMap<String, Vec<String>>,
    pub event: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runbook: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alert_context: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destinations: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl EngineResult {
    /// Candidate for a unit whose primary entry point (or setup) failed.
    fn error(unit: &Unit, log_type: &str, event: &Value, failure: &PointFailure) -> Self {
        Self {
            dedup: failure.kind.to_string(),
            title: Some(failure.short_message.clone()),
            error_message: Some(failure.long_message.clone()),
            ..Self::base(unit, log_type, event)
        }
    }

    /// Candidate for a matching unit.
    fn matched(unit: &Unit, log_type: &str, event: &Value, result: ExecutionResult) -> Self {
        Self {
            dedup: result.dedup.output.unwrap_or_default(),
            title: result.title.output,
            description: result.description.output,
            reference: result.reference.output,
            severity: result.severity.output,
            runbook: result.runbook.output,
            alert_context: result.alert_context.output,
            destinations: result.destinations.output,
            ..Self::base(unit, log_type, event)
        }
    }

    fn base(unit: &Unit, log_type: &str, event: &Value) -> Self {
        Self {
            rule_id: unit.id().to_string(),
            rule_version: unit.version().to_string(),
            log_type: log_type.to_string(),
            dedup: String::new(),
            dedup_period_mins: unit.dedup_period_minutes(),
            rule_tags: unit.tags().to_vec(),
            rule_reports: unit.reports().clone(),
            event: event.clone(),
            title: None,
            description: None,
            reference: None,
            severity: None,
            runbook: None,
            alert_context: None,
            destinations: None,
            error_message: None,
        }
    }

    /// Whether this candidate reports a rule failure rather than a match.
    pub fn is_error(&self) -> bool {
        self.error_message.is_some()
    }
}

/// A catalog entry that could not be turned into a unit, model or destination.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadFailure {
    pub kind: &'static str,
    pub id: Option<String>,
    pub error: String,
}

/// Summary of one catalog load.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LoadReport {
    pub rules_loaded: usize,
    pub data_models_loaded: usize,
    pub destinations_loaded: usize,
    pub failures: Vec<LoadFailure>,
}

/// Read-only lookup tables built from the catalogs.
#[derive(Debug, Default)]
struct Indexes {
    rules_by_log_type: HashMap<String, Vec<Arc<Unit>>>,
    /// Rules without log types; they apply to every event.
    global_rules: Vec<Arc<Unit>>,
    models_by_log_type: HashMap<String, Arc<FieldModel>>,
    destinations: DestinationIndex,
}

/// Evaluates events against every enabled rule.
pub struct Engine {
    analysis: Arc<dyn AnalysisCatalog>,
    outputs: Arc<dyn OutputsCatalog>,
    interpreter: Arc<dyn Interpreter>,
    runner: UnitRunner,
    indexes: Indexes,
    pool: rayon::ThreadPool,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("runner", &self.runner)
            .field("indexes", &self.indexes)
            .field("workers", &self.pool.current_num_threads())
            .finish()
    }
}

impl Engine {
    /// Load all rules, data models and destinations.
    ///
    /// Entries that fail to load are logged, listed in the report and skipped.
    pub fn new(
        analysis: Arc<dyn AnalysisCatalog>,
        outputs: Arc<dyn OutputsCatalog>,
        interpreter: Arc<dyn Interpreter>,
        config: &Config,
    ) -> Result<(Self, LoadReport), EngineError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.execution.resolved_worker_threads())
            .build()?;
        let runner = UnitRunner::new(config.limits.clone(), config.execution.invocation_timeout());

        let (indexes, report) = load_indexes(analysis.as_ref(), outputs.as_ref(), interpreter.as_ref())?;
        let engine = Self {
            analysis,
            outputs,
            interpreter,
            runner,
            indexes,
            pool,
        };
        Ok((engine, report))
    }

    /// Re-read both catalogs and rebuild every index.
    pub fn reload(&mut self) -> Result<LoadReport, EngineError> {
        let (indexes, report) = load_indexes(
            self.analysis.as_ref(),
            self.outputs.as_ref(),
            self.interpreter.as_ref(),
        )?;
        self.indexes = indexes;
        Ok(report)
    }

    pub fn runner(&self) -> &UnitRunner {
        &self.runner
    }

    pub fn destinations(&self) -> &DestinationIndex {
        &self.indexes.destinations
    }

    pub fn field_model(&self, log_type: &str) -> Option<&Arc<FieldModel>> {
        self.indexes.models_by_log_type.get(log_type)
    }

    /// Rules that apply to `log_type`: specific ones first, then global ones.
    pub fn rules_for<'a>(&'a self, log_type: &str) -> impl Iterator<Item = &'a Arc<Unit>> + 'a {
        self.indexes
            .rules_by_log_type
            .get(log_type)
            .into_iter()
            .flatten()
            .chain(self.indexes.global_rules.iter())
    }

    /// Run every applicable rule against `event`.
    pub fn analyze(&self, log_type: &str, event: Arc<Value>) -> Result<Vec<EngineResult>, EngineError> {
        self.analyze_until(log_type, event, &AtomicBool::new(false))
    }

    /// Like [`Engine::analyze`], checking `cancel` between rules.
    pub fn analyze_until(
        &self,
        log_type: &str,
        event: Arc<Value>,
        cancel: &AtomicBool,
    ) -> Result<Vec<EngineResult>, EngineError> {
        let model = self.field_model(log_type).cloned();
        let view = EventView::new(Arc::clone(&event), model, self.runner.timeout());
        let mocks = Mocks::new();
        let mut results = Vec::new();

        for unit in self.rules_for(log_type) {
            if cancel.load(Ordering::Relaxed) {
                return Err(EngineError::Cancelled);
            }
            debug!(rule_id = %unit.id(), log_type, "running rule");
            let result = self.runner.run(
                unit,
                Argument::Event(&view),
                &mocks,
                &self.indexes.destinations,
                RunMode::Batch,
            );

            if let Some(failure) = result.configuration_failure() {
                return Err(EngineError::Configuration {
                    unit_id: unit.id().to_string(),
                    message: failure.message.clone(),
                });
            }

            if let Some(failure) = result.primary_failure() {
                results.push(EngineResult::error(unit, log_type, &event, failure));
            } else if result.matched() == Some(true) {
                results.push(EngineResult::matched(unit, log_type, &event, result));
            }
        }

        Ok(results)
    }
}

/// Whether `failure` is the missing-field-model lookup failure.
fn is_missing_model(failure: &PointFailure) -> bool {
    failure.kind == FailureKind::Configuration && failure.message == LookupError::NoFieldModel.to_string()
}

fn load_indexes(
    analysis: &dyn AnalysisCatalog,
    outputs: &dyn OutputsCatalog,
    interpreter: &dyn Interpreter,
) -> Result<(Indexes, LoadReport), EngineError> {
    let mut indexes = Indexes::default();
    let mut report = LoadReport::default();

    let start = Instant::now();
    let rules = analysis.enabled_rules()?;
    info!(count = rules.len(), elapsed_ms = start.elapsed().as_millis() as u64, "retrieved rules");
    for descriptor in &rules {
        let unit = match Unit::new(UnitKind::Rule, descriptor, interpreter) {
            Ok(unit) => Arc::new(unit),
            Err(e) => {
                error!(rule_id = %descriptor.id, error = %e, "failed to import rule");
                report.failures.push(LoadFailure {
                    kind: "rule",
                    id: Some(descriptor.id.clone()).filter(|id| !id.is_empty()),
                    error: e.to_string(),
                });
                continue;
            }
        };
        if unit.categories().is_empty() {
            indexes.global_rules.push(unit);
        } else {
            for log_type in unit.categories() {
                indexes
                    .rules_by_log_type
                    .entry(log_type.clone())
                    .or_default()
                    .push(Arc::clone(&unit));
            }
        }
        report.rules_loaded += 1;
    }

    let models = analysis.enabled_data_models()?;
    for descriptor in &models {
        let model = match FieldModel::new(descriptor, interpreter) {
            Ok(model) => Arc::new(model),
            Err(e) => {
                error!(data_model_id = %descriptor.id, error = %e, "failed to import data model");
                report.failures.push(LoadFailure {
                    kind: "data_model",
                    id: Some(descriptor.id.clone()).filter(|id| !id.is_empty()),
                    error: e.to_string(),
                });
                continue;
            }
        };
        for log_type in model.categories() {
            if let Some(previous) = indexes
                .models_by_log_type
                .insert(log_type.clone(), Arc::clone(&model))
            {
                warn!(
                    log_type = %log_type,
                    previous = %previous.id(),
                    data_model_id = %model.id(),
                    "more than one data model for log type, keeping the last one"
                );
            }
        }
        report.data_models_loaded += 1;
    }

    let raw_outputs = outputs.outputs()?;
    let mut destinations = Vec::with_capacity(raw_outputs.len());
    for raw in &raw_outputs {
        match Destination::from_value(raw) {
            Ok(destination) => destinations.push(destination),
            Err(e) => {
                error!(error = %e, "failed to import destination");
                report.failures.push(LoadFailure {
                    kind: "destination",
                    id: raw.get("outputId").and_then(Value::as_str).map(str::to_string),
                    error: e.to_string(),
                });
            }
        }
    }
    report.destinations_loaded = destinations.len();
    indexes.destinations = DestinationIndex::new(destinations);

    info!(
        rules = report.rules_loaded,
        data_models = report.data_models_loaded,
        destinations = report.destinations_loaded,
        failures = report.failures.len(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "catalogs loaded"
    );
    Ok((indexes, report))
}
