//! Ad-hoc evaluation of one rule against test events.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use tripwire_core::Severity;

use super::{is_missing_model, Engine, EngineError};
use crate::event::EventView;
use crate::result::{ExecutionResult, PointSlot};
use crate::runner::RunMode;
use crate::script::{Argument, FailureKind, Mocks, ScriptFailure};
use crate::unit::{Unit, UnitDescriptor, UnitKind};

/// Log type used when a test event has no `p_log_type`.
pub const DEFAULT_LOG_TYPE: &str = "default";

/// Replacement message for a missing field model in test mode.
pub const MISSING_FIELD_MODEL_MESSAGE: &str = "The test specification for rules using the 'udm' method must specify the 'p_log_type' field, and there must be an enabled DataModel for the log type.";

/// One test case: an event plus optional mock bindings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestSpec {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub mocks: Mocks,
}

/// Outcome of every entry point for one test case.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SingleRuleResponse {
    pub id: String,
    pub rule_id: String,
    pub generic_error: Option<String>,
    pub errored: bool,
    pub rule_output: Option<bool>,
    pub rule_error: Option<String>,
    pub title_output: Option<String>,
    pub title_error: Option<String>,
    pub description_output: Option<String>,
    pub description_error: Option<String>,
    pub reference_output: Option<String>,
    pub reference_error: Option<String>,
    pub severity_output: Option<Severity>,
    pub severity_error: Option<String>,
    pub runbook_output: Option<String>,
    pub runbook_error: Option<String>,
    pub destinations_output: Option<Vec<String>>,
    pub destinations_error: Option<String>,
    pub dedup_output: Option<String>,
    pub dedup_error: Option<String>,
    pub alert_context_output: Option<String>,
    pub alert_context_error: Option<String>,
}

impl SingleRuleResponse {
    fn generic(id: &str, rule_id: &str, failure: &ScriptFailure) -> Self {
        Self {
            id: id.to_string(),
            rule_id: rule_id.to_string(),
            generic_error: Some(failure.display_message()),
            errored: true,
            ..Self::default()
        }
    }

    fn from_result(id: &str, rule_id: &str, result: ExecutionResult) -> Self {
        fn split<T>(slot: PointSlot<T>) -> (Option<T>, Option<String>) {
            let error = slot.error_message();
            (slot.output, error)
        }

        let generic_error = result.setup.as_ref().map(|f| f.display_message());
        let (rule_output, rule_error) = split(result.matched);
        let (title_output, title_error) = split(result.title);
        let (description_output, description_error) = split(result.description);
        let (reference_output, reference_error) = split(result.reference);
        let (severity_output, severity_error) = split(result.severity);
        let (runbook_output, runbook_error) = split(result.runbook);
        let (destinations_output, destinations_error) = split(result.destinations);
        let (dedup_output, dedup_error) = split(result.dedup);
        let (alert_context_output, alert_context_error) = split(result.alert_context);

        Self {
            id: id.to_string(),
            rule_id: rule_id.to_string(),
            generic_error,
            errored: result.errored,
            rule_output,
            rule_error,
            title_output,
            title_error,
            description_output,
            description_error,
            reference_output,
            reference_error,
            severity_output,
            severity_error,
            runbook_output,
            runbook_error,
            destinations_output,
            destinations_error,
            dedup_output,
            dedup_error,
            alert_context_output,
            alert_context_error,
        }
    }
}

/// `{"rules": [rule], "events": [test, ...]}`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DirectRequest {
    #[serde(default)]
    pub rules: Vec<UnitDescriptor>,
    #[serde(default)]
    pub events: Vec<TestSpec>,
}

/// `{"results": [...]}`
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DirectResponse {
    pub results: Vec<SingleRuleResponse>,
}

impl Engine {
    /// Evaluate one rule against one test event, keeping every failure.
    ///
    /// The rule needs no version; field models and destinations come from
    /// the loaded catalogs.
    pub fn analyze_single(&self, rule: &UnitDescriptor, test: &TestSpec) -> SingleRuleResponse {
        let unit = match Unit::unversioned(UnitKind::Rule, rule, self.interpreter.as_ref()) {
            Ok(unit) => unit,
            Err(e) => return SingleRuleResponse::generic(&test.id, &rule.id, &e.to_failure()),
        };

        let log_type = test
            .data
            .get("p_log_type")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_LOG_TYPE);
        let mocks = Arc::new(test.mocks.clone());
        let view = EventView::new(
            Arc::new(test.data.clone()),
            self.field_model(log_type).cloned(),
            self.runner.timeout(),
        )
        .with_mocks(Arc::clone(&mocks));

        debug!(rule_id = %unit.id(), test_id = %test.id, log_type, "running single rule");
        let result = self.runner.run(
            &unit,
            Argument::Event(&view),
            &mocks,
            &self.indexes.destinations,
            RunMode::NonBatch,
        );

        let missing_model = result.failures().any(|(_, f)| is_missing_model(f));
        let rule_missing_model = result.matched.error.as_ref().is_some_and(is_missing_model);
        let mut response = SingleRuleResponse::from_result(&test.id, unit.id(), result);
        if missing_model {
            let message = ScriptFailure::new(FailureKind::Configuration, MISSING_FIELD_MODEL_MESSAGE).display_message();
            if rule_missing_model {
                response.rule_error = Some(message.clone());
            }
            response.generic_error = Some(message);
            response.errored = true;
        }
        response
    }

    /// Evaluate the single rule of `request` against each of its events.
    pub fn analyze_direct(&self, request: &DirectRequest) -> Result<DirectResponse, EngineError> {
        let [rule] = request.rules.as_slice() else {
            return Err(EngineError::InvalidRequest(format!(
                "exactly one rule is required, got {}",
                request.rules.len()
            )));
        };
        let results = request
            .events
            .iter()
            .map(|test| self.analyze_single(rule, test))
            .collect();
        Ok(DirectResponse { results })
    }
}
