//! Per-unit execution results.

use serde::Serialize;
use tripwire_core::Severity;

use crate::runner::RunMode;
use crate::script::{FailureKind, ScriptFailure};

/// Failure recorded against one output point.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PointFailure {
    pub kind: FailureKind,
    pub message: String,
    /// `Kind('message')`
    pub short_message: String,
    /// Message with source location and entry point.
    pub long_message: String,
    /// Interpreter failure as reported, kept outside batch mode only.
    #[serde(skip)]
    pub raw: Option<ScriptFailure>,
}

impl PointFailure {
    pub fn new(failure: ScriptFailure, point: &str, mode: RunMode) -> Self {
        Self {
            kind: failure.kind.clone(),
            message: failure.message.clone(),
            short_message: failure.short_message(),
            long_message: failure.long_message(point),
            raw: match mode {
                RunMode::Batch => None,
                RunMode::NonBatch => Some(failure),
            },
        }
    }

    /// `Kind: message`
    pub fn display_message(&self) -> String {
        format!("{}: {}", self.kind, self.message)
    }
}

/// Output and failure of a single entry point.
#[derive(Debug, Clone, PartialEq)]
pub struct PointSlot<T> {
    pub output: Option<T>,
    pub error: Option<PointFailure>,
}

impl<T> Default for PointSlot<T> {
    fn default() -> Self {
        Self {
            output: None,
            error: None,
        }
    }
}

impl<T> PointSlot<T> {
    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(PointFailure::display_message)
    }
}

/// Everything one unit produced for one input.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionResult {
    /// Failure raised before any entry point ran (compile failure).
    pub setup: Option<PointFailure>,
    pub matched: PointSlot<bool>,
    pub title: PointSlot<String>,
    pub dedup: PointSlot<String>,
    pub description: PointSlot<String>,
    pub reference: PointSlot<String>,
    pub runbook: PointSlot<String>,
    pub severity: PointSlot<Severity>,
    /// Serialized JSON map.
    pub alert_context: PointSlot<String>,
    pub destinations: PointSlot<Vec<String>>,
    /// Whether any failure was recorded.
    pub errored: bool,
}

impl ExecutionResult {
    pub fn matched(&self) -> Option<bool> {
        self.matched.output
    }

    /// Coalesced dedup key of a matching unit.
    pub fn dedup_key(&self) -> Option<&str> {
        self.dedup.output.as_deref()
    }

    /// Setup failure, else the primary entry point's failure.
    pub fn primary_failure(&self) -> Option<&PointFailure> {
        self.setup.as_ref().or(self.matched.error.as_ref())
    }

    pub fn error_type(&self) -> Option<String> {
        self.primary_failure().map(|f| f.kind.to_string())
    }

    pub fn short_error_message(&self) -> Option<&str> {
        self.primary_failure().map(|f| f.short_message.as_str())
    }

    pub fn error_message(&self) -> Option<&str> {
        self.primary_failure().map(|f| f.long_message.as_str())
    }

    /// All recorded failures labelled by entry point.
    pub fn failures(&self) -> impl Iterator<Item = (&'static str, &PointFailure)> {
        [
            ("setup", self.setup.as_ref()),
            ("rule", self.matched.error.as_ref()),
            ("title", self.title.error.as_ref()),
            ("dedup", self.dedup.error.as_ref()),
            ("description", self.description.error.as_ref()),
            ("reference", self.reference.error.as_ref()),
            ("runbook", self.runbook.error.as_ref()),
            ("severity", self.severity.error.as_ref()),
            ("alert_context", self.alert_context.error.as_ref()),
            ("destinations", self.destinations.error.as_ref()),
        ]
        .into_iter()
        .filter_map(|(point, failure)| failure.map(|f| (point, f)))
    }

    /// First failure that must abort evaluation of the whole event.
    pub fn configuration_failure(&self) -> Option<&PointFailure> {
        self.failures()
            .map(|(_, f)| f)
            .find(|f| f.kind == FailureKind::Configuration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::SourceLocation;

    fn failure() -> ScriptFailure {
        ScriptFailure::new(FailureKind::Runtime, "boom").at(SourceLocation {
            file: "r1.yml".into(),
            line: Some(2),
        })
    }

    #[test]
    fn batch_mode_drops_raw_failure() {
        let batch = PointFailure::new(failure(), "rule", RunMode::Batch);
        assert!(batch.raw.is_none());
        assert_eq!(batch.short_message, "RuntimeError('boom')");
        assert_eq!(batch.long_message, "boom: r1.yml, line 2, in rule");

        let full = PointFailure::new(failure(), "rule", RunMode::NonBatch);
        assert_eq!(full.raw, Some(failure()));
    }

    #[test]
    fn primary_failure_prefers_setup() {
        let mut result = ExecutionResult::default();
        result.matched.error = Some(PointFailure::new(failure(), "rule", RunMode::Batch));
        assert_eq!(result.error_type().as_deref(), Some("RuntimeError"));

        result.setup = Some(PointFailure::new(
            ScriptFailure::new(FailureKind::Syntax, "bad"),
            "setup",
            RunMode::Batch,
        ));
        assert_eq!(result.error_type().as_deref(), Some("SyntaxError"));
        assert_eq!(result.short_error_message(), Some("SyntaxError('bad')"));
        assert_eq!(result.failures().count(), 2);
    }

    #[test]
    fn configuration_failures_are_found_on_any_point() {
        let mut result = ExecutionResult::default();
        assert!(result.configuration_failure().is_none());
        result.title.error = Some(PointFailure::new(
            ScriptFailure::new(FailureKind::Configuration, "no field model registered for this category"),
            "title",
            RunMode::Batch,
        ));
        assert!(result.configuration_failure().is_some());
    }
}
