//! Unit runner: drives a unit's entry points in order and applies the
//! validation, truncation and fallback policy for every output point.
//!
//! Order: primary, title, dedup, description, reference, runbook, severity,
//! alert context, destinations. A primary result of `false` (or a primary
//! failure) stops the run.

mod outputs;

#[cfg(test)]
mod tests;

use std::time::Duration;

use serde_json::Value;
use tracing::{debug, trace};
use tripwire_core::config::LimitsConfig;
use tripwire_core::Severity;

use crate::destination::DestinationIndex;
use crate::result::{ExecutionResult, PointFailure, PointSlot};
use crate::script::{Argument, Call, FailureKind, Invocation, Mocks, Script, ScriptFailure};
use crate::unit::Unit;

pub use self::outputs::{
    default_dedup, truncate, DEFAULT_DEDUP_PREFIX, MAX_ALERT_CONTEXT_LENGTH,
};

/// Entry point reported for failures that happen before any invocation.
pub const SETUP_POINT: &str = "setup";

/// How much failure detail a run keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Failure summaries only.
    Batch,
    /// Summaries plus the raw interpreter failure of every point.
    NonBatch,
}

/// Executes units against events or resources.
#[derive(Debug, Clone)]
pub struct UnitRunner {
    limits: LimitsConfig,
    timeout: Duration,
}

impl UnitRunner {
    pub fn new(limits: LimitsConfig, timeout: Duration) -> Self {
        Self { limits, timeout }
    }

    pub fn limits(&self) -> &LimitsConfig {
        &self.limits
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run `unit` against `argument`.
    ///
    /// Never fails: every failure is recorded in the returned result.
    pub fn run(
        &self,
        unit: &Unit,
        argument: Argument<'_>,
        mocks: &Mocks,
        destinations: &DestinationIndex,
        mode: RunMode,
    ) -> ExecutionResult {
        self.execute(unit, argument, mocks, Some(destinations), mode)
    }

    /// Run only the primary entry point, as compliance evaluation does.
    pub fn run_primary(&self, unit: &Unit, argument: Argument<'_>, mocks: &Mocks, mode: RunMode) -> ExecutionResult {
        self.execute(unit, argument, mocks, None, mode)
    }

    fn execute(
        &self,
        unit: &Unit,
        argument: Argument<'_>,
        mocks: &Mocks,
        destinations: Option<&DestinationIndex>,
        mode: RunMode,
    ) -> ExecutionResult {
        let mut result = ExecutionResult::default();

        if let Some(failure) = unit.setup_failure() {
            result.setup = Some(PointFailure::new(failure.clone(), SETUP_POINT, mode));
            result.errored = true;
            return result;
        }
        let Some(script) = unit.script() else {
            return result;
        };

        let mut run = Run {
            unit,
            script: script.as_ref(),
            call: Call {
                argument,
                mocks,
                timeout: self.timeout,
            },
            mode,
            errored: false,
        };

        run.primary(&mut result.matched);
        if let (Some(true), Some(destinations)) = (result.matched.output, destinations) {
            self.generated_fields(&mut run, &mut result, destinations);
        }

        result.errored = run.errored;
        debug!(
            unit_id = %unit.id(),
            matched = ?result.matched.output,
            errored = result.errored,
            "unit run complete"
        );
        result
    }

    fn generated_fields(&self, run: &mut Run<'_>, result: &mut ExecutionResult, destinations: &DestinationIndex) {
        let max_field = self.limits.max_field_length;
        let suffix = self.limits.truncation_suffix.as_str();
        // Title falls back to the unit id on failure or wrong type.
        run.string_point("title", &mut result.title, max_field, suffix);
        if result.title.error.is_some() {
            result.title.output = Some(run.unit.id().to_string());
        }

        self.dedup(run, result);

        run.string_point("description", &mut result.description, max_field, suffix);
        run.string_point("reference", &mut result.reference, max_field, suffix);
        run.string_point("runbook", &mut result.runbook, max_field, suffix);
        run.severity(&mut result.severity);
        run.alert_context(&mut result.alert_context);
        run.destinations(&mut result.destinations, destinations);
    }

    fn dedup(&self, run: &mut Run<'_>, result: &mut ExecutionResult) {
        let max = self.limits.max_dedup_length;
        let suffix = self.limits.truncation_suffix.as_str();
        let default = outputs::default_dedup(run.unit.id());

        let dedup = match run.invoke("dedup") {
            Invocation::Undefined => match result.title.output.as_deref() {
                Some(title) if !title.is_empty() => title.to_string(),
                _ => default,
            },
            Invocation::Returned(Value::String(s)) if !s.is_empty() => s,
            Invocation::Returned(Value::String(_)) => default,
            Invocation::Returned(other) => {
                let failure = outputs::wrong_type(run.unit, "dedup", &other, "string");
                result.dedup.error = Some(run.fail("dedup", failure));
                default
            }
            Invocation::Failed(failure) => {
                result.dedup.error = Some(run.fail("dedup", failure));
                default
            }
        };
        result.dedup.output = Some(outputs::truncate(dedup, max, suffix));
    }
}

/// State of one unit run.
struct Run<'a> {
    unit: &'a Unit,
    script: &'a dyn Script,
    call: Call<'a>,
    mode: RunMode,
    errored: bool,
}

impl Run<'_> {
    fn invoke(&self, point: &str) -> Invocation {
        trace!(unit_id = %self.unit.id(), point, "invoking entry point");
        self.script.invoke(point, self.call)
    }

    fn fail(&mut self, point: &str, failure: ScriptFailure) -> PointFailure {
        debug!(unit_id = %self.unit.id(), point, error = %failure, "entry point failed");
        self.errored = true;
        PointFailure::new(failure, point, self.mode)
    }

    fn primary(&mut self, slot: &mut PointSlot<bool>) {
        let point = self.unit.primary_point();
        match self.invoke(point) {
            Invocation::Returned(Value::Bool(matched)) => slot.output = Some(matched),
            Invocation::Returned(other) => {
                let failure = outputs::wrong_type(self.unit, point, &other, "bool");
                slot.error = Some(self.fail(point, failure));
            }
            Invocation::Undefined => {
                let failure = ScriptFailure::new(
                    FailureKind::Name,
                    format!("{} [{}] does not define [{}]", self.unit.kind(), self.unit.id(), point),
                );
                slot.error = Some(self.fail(point, failure));
            }
            Invocation::Failed(failure) => slot.error = Some(self.fail(point, failure)),
        }
    }

    /// Optional string point: truncated on success, no fallback value.
    fn string_point(&mut self, point: &str, slot: &mut PointSlot<String>, max: usize, suffix: &str) {
        match self.invoke(point) {
            Invocation::Undefined => {}
            Invocation::Returned(Value::String(s)) => slot.output = Some(outputs::truncate(s, max, suffix)),
            Invocation::Returned(other) => {
                let failure = outputs::wrong_type(self.unit, point, &other, "string");
                slot.error = Some(self.fail(point, failure));
            }
            Invocation::Failed(failure) => slot.error = Some(self.fail(point, failure)),
        }
    }

    fn severity(&mut self, slot: &mut PointSlot<Severity>) {
        const POINT: &str = "severity";
        match self.invoke(POINT) {
            Invocation::Undefined => {}
            Invocation::Returned(Value::String(s)) => slot.output = Some(Severity::parse_or_info(&s)),
            Invocation::Returned(other) => {
                let failure = outputs::wrong_type(self.unit, POINT, &other, "string");
                slot.error = Some(self.fail(POINT, failure));
            }
            Invocation::Failed(failure) => slot.error = Some(self.fail(POINT, failure)),
        }
    }

    fn alert_context(&mut self, slot: &mut PointSlot<String>) {
        const POINT: &str = "alert_context";
        let failure = match self.invoke(POINT) {
            Invocation::Undefined => return,
            Invocation::Returned(value @ Value::Object(_)) => match outputs::encode_alert_context(&value) {
                Ok(encoded) => {
                    slot.output = Some(encoded);
                    return;
                }
                Err(too_big) => {
                    slot.output = Some(outputs::alert_context_error(&too_big.message));
                    slot.error = Some(self.fail(POINT, too_big));
                    return;
                }
            },
            Invocation::Returned(other) => outputs::wrong_type(self.unit, POINT, &other, "map"),
            Invocation::Failed(failure) => failure,
        };
        let recorded = self.fail(POINT, failure);
        slot.output = Some(outputs::alert_context_error(&recorded.short_message));
        slot.error = Some(recorded);
    }

    fn destinations(&mut self, slot: &mut PointSlot<Vec<String>>, index: &DestinationIndex) {
        const POINT: &str = "destinations";
        match self.invoke(POINT) {
            Invocation::Undefined => {}
            Invocation::Returned(Value::Array(items)) => {
                let references = outputs::destination_references(&items);
                match index.resolve(&references) {
                    Ok(resolved) => slot.output = Some(resolved),
                    Err(invalid) => {
                        let failure = ScriptFailure::new(FailureKind::Value, invalid.to_string());
                        slot.error = Some(self.fail(POINT, failure));
                    }
                }
            }
            Invocation::Returned(other) => {
                let failure = outputs::not_a_list(self.unit, POINT, &other);
                slot.error = Some(self.fail(POINT, failure));
            }
            Invocation::Failed(failure) => slot.error = Some(self.fail(POINT, failure)),
        }
    }
}
