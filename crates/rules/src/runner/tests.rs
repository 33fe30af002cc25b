use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tripwire_core::config::LimitsConfig;
use tripwire_core::Severity;

use super::*;
use crate::destination::Destination;
use crate::event::EventView;
use crate::testing::{FnInterpreter, FnScript};
use crate::unit::{UnitDescriptor, UnitKind};

const RULE_ID: &str = "test_rule";

fn runner() -> UnitRunner {
    UnitRunner::new(LimitsConfig::default(), Duration::from_secs(1))
}

fn build_unit(interpreter: &FnInterpreter) -> Unit {
    let descriptor = UnitDescriptor {
        id: RULE_ID.to_string(),
        body: "body".to_string(),
        version_id: "v1".to_string(),
        ..UnitDescriptor::default()
    };
    Unit::new(UnitKind::Rule, &descriptor, interpreter).unwrap()
}

fn destinations() -> DestinationIndex {
    DestinationIndex::new([Destination::from_value(&json!({"outputId": "1234", "displayName": "Test"})).unwrap()])
}

fn run_against(
    destinations: &DestinationIndex,
    mode: RunMode,
    build: impl FnOnce(FnScript) -> FnScript,
) -> ExecutionResult {
    let interpreter = FnInterpreter::new().script("body", build);
    let unit = build_unit(&interpreter);
    let view = EventView::new(Arc::new(json!({"key": "value"})), None, Duration::from_secs(1));
    runner().run(&unit, Argument::Event(&view), &Mocks::new(), destinations, mode)
}

fn run_with(mode: RunMode, build: impl FnOnce(FnScript) -> FnScript) -> ExecutionResult {
    run_against(&destinations(), mode, build)
}

fn run(build: impl FnOnce(FnScript) -> FnScript) -> ExecutionResult {
    run_with(RunMode::Batch, build)
}

fn matching() -> FnScript {
    FnScript::default().returns("rule", json!(true))
}

// ── Primary ─────────────────────────────────────────────────

#[test]
fn false_primary_short_circuits() {
    let result = run(|_| {
        FnScript::default()
            .returns("rule", json!(false))
            .with("title", |_| panic!("title must not run"))
    });
    assert_eq!(result.matched(), Some(false));
    assert!(result.title.output.is_none());
    assert!(result.dedup_key().is_none());
    assert!(!result.errored);
}

#[test]
fn primary_failure_leaves_matched_absent() {
    let result = run(|_| FnScript::default().fails("rule", FailureKind::Runtime, "test"));
    assert_eq!(result.matched(), None);
    assert!(result.dedup_key().is_none());
    assert!(result.errored);
    assert_eq!(result.error_type().as_deref(), Some("RuntimeError"));
}

#[test]
fn non_bool_primary_is_a_type_error() {
    let result = run(|_| FnScript::default().returns("rule", json!("test")));
    assert_eq!(result.matched(), None);
    assert!(result.errored);
    assert_eq!(
        result.short_error_message(),
        Some("TypeError('rule [test_rule] function [rule] returned [string], expected [bool]')")
    );
}

#[test]
fn setup_failure_is_reported_without_invoking() {
    let interpreter = FnInterpreter::new().broken("body", FailureKind::Syntax, "invalid syntax");
    let unit = build_unit(&interpreter);
    let record = json!({});
    let result = runner().run(&unit, Argument::Record(&record), &Mocks::new(), &destinations(), RunMode::Batch);
    assert!(result.errored);
    assert_eq!(result.matched(), None);
    assert_eq!(result.error_type().as_deref(), Some("SyntaxError"));
    assert!(result.matched.error.is_none());
}

// ── Title and dedup ─────────────────────────────────────────

#[test]
fn dedup_defaults_without_title() {
    let result = run(|_| matching());
    assert_eq!(result.dedup_key(), Some("defaultDedupString:test_rule"));
    assert!(result.title.output.is_none());
    assert!(!result.errored);
}

#[test]
fn title_becomes_dedup_when_dedup_undefined() {
    let result = run(|_| matching().returns("title", json!("title")));
    assert_eq!(result.title.output.as_deref(), Some("title"));
    assert_eq!(result.dedup_key(), Some("title"));
}

#[test]
fn empty_title_is_kept_and_dedup_defaults() {
    let result = run(|_| matching().returns("title", json!("")));
    assert_eq!(result.title.output.as_deref(), Some(""));
    assert_eq!(result.dedup_key(), Some("defaultDedupString:test_rule"));
}

#[test]
fn title_failure_falls_back_to_unit_id() {
    let result = run(|_| matching().fails("title", FailureKind::Runtime, "test"));
    assert_eq!(result.title.output.as_deref(), Some(RULE_ID));
    assert_eq!(result.dedup_key(), Some(RULE_ID));
    assert!(result.errored);

    let result = run(|_| matching().returns("title", json!({})));
    assert_eq!(result.title.output.as_deref(), Some(RULE_ID));
    assert_eq!(result.title.error.as_ref().map(|f| f.kind.clone()), Some(FailureKind::Type));
}

#[test]
fn dedup_failures_use_default_regardless_of_title() {
    let result = run(|_| {
        matching()
            .returns("title", json!("title"))
            .fails("dedup", FailureKind::Runtime, "test")
    });
    assert_eq!(result.dedup_key(), Some("defaultDedupString:test_rule"));
    assert!(result.errored);

    let result = run(|_| matching().returns("title", json!("title")).returns("dedup", json!({})));
    assert_eq!(result.dedup_key(), Some("defaultDedupString:test_rule"));

    let result = run(|_| matching().returns("title", json!("title")).returns("dedup", json!("")));
    assert_eq!(result.dedup_key(), Some("defaultDedupString:test_rule"));
}

#[test]
fn long_dedup_is_truncated() {
    let long = "a".repeat(1001);
    let result = run(|_| matching().returns("dedup", json!(long)));
    let dedup = result.dedup_key().unwrap();
    let suffix = "... (truncated)";
    assert_eq!(dedup.chars().count(), 1000);
    assert_eq!(dedup, format!("{}{}", "a".repeat(1000 - suffix.len()), suffix));
}

#[test]
fn long_title_is_truncated_and_short_untouched() {
    let long = "b".repeat(1001);
    let result = run(|_| matching().returns("title", json!(long)));
    let title = result.title.output.unwrap();
    assert_eq!(title.chars().count(), 1000);
    assert!(title.ends_with("... (truncated)"));

    let exact = "c".repeat(1000);
    let result = run(|_| matching().returns("title", json!(exact.clone())));
    assert_eq!(result.title.output, Some(exact));
}

#[test]
fn truncation_counts_characters() {
    assert_eq!(truncate("ééééé".to_string(), 4, ".."), "éé..");
    assert_eq!(truncate("abc".to_string(), 3, ".."), "abc");
    assert_eq!(truncate(String::new(), 3, ".."), "");
}

// ── Optional string points ──────────────────────────────────

#[test]
fn description_reference_runbook_have_no_fallback() {
    let result = run(|_| {
        matching()
            .returns("description", json!("desc"))
            .fails("reference", FailureKind::Runtime, "test")
            .returns("runbook", json!(5))
    });
    assert_eq!(result.description.output.as_deref(), Some("desc"));
    assert!(result.reference.output.is_none());
    assert!(result.reference.error.is_some());
    assert!(result.runbook.output.is_none());
    assert_eq!(result.runbook.error.as_ref().map(|f| f.kind.clone()), Some(FailureKind::Type));
    assert!(result.errored);
}

// ── Severity ────────────────────────────────────────────────

#[test]
fn severity_is_normalized() {
    let result = run(|_| matching().returns("severity", json!("cRiTiCaL")));
    assert_eq!(result.severity.output, Some(Severity::Critical));

    let result = run(|_| matching().returns("severity", json!("CRITICAL-ISH")));
    assert_eq!(result.severity.output, Some(Severity::Info));
    assert!(!result.errored);
}

#[test]
fn severity_failure_leaves_output_absent() {
    let result = run(|_| matching().fails("severity", FailureKind::Runtime, "test"));
    assert!(result.severity.output.is_none());
    assert!(result.errored);

    let result = run(|_| matching().returns("severity", json!(3)));
    assert!(result.severity.output.is_none());
    assert!(result.severity.error.is_some());
}

// ── Alert context ───────────────────────────────────────────

#[test]
fn alert_context_is_compact_json() {
    let result = run(|_| matching().returns("alert_context", json!({"string": "string", "int": 1, "nested": {}})));
    let encoded = result.alert_context.output.unwrap();
    let decoded: Value = serde_json::from_str(&encoded).unwrap();
    assert_eq!(decoded, json!({"string": "string", "int": 1, "nested": {}}));
    assert!(!encoded.contains(": "));
    assert!(!result.errored);
}

#[test]
fn alert_context_wrong_type_stores_error() {
    let result = run(|_| matching().returns("alert_context", json!("")));
    let decoded: Value = serde_json::from_str(result.alert_context.output.as_deref().unwrap()).unwrap();
    assert_eq!(
        decoded,
        json!({"_error": "TypeError('rule [test_rule] function [alert_context] returned [string], expected [map]')"})
    );
    assert!(result.errored);
}

#[test]
fn alert_context_failure_stores_short_message() {
    let result = run(|_| matching().fails("alert_context", FailureKind::Runtime, "boom"));
    let decoded: Value = serde_json::from_str(result.alert_context.output.as_deref().unwrap()).unwrap();
    assert_eq!(decoded, json!({"_error": "RuntimeError('boom')"}));
}

#[test]
fn oversized_alert_context_is_replaced() {
    let big = "x".repeat(MAX_ALERT_CONTEXT_LENGTH);
    let result = run(|_| matching().returns("alert_context", json!({ "data": big })));
    let expected_size = MAX_ALERT_CONTEXT_LENGTH + r#"{"data":""}"#.len();
    let decoded: Value = serde_json::from_str(result.alert_context.output.as_deref().unwrap()).unwrap();
    assert_eq!(
        decoded,
        json!({"_error": format!(
            "alert_context size is [{}] characters, bigger than maximum of [204800] characters",
            expected_size
        )})
    );
    assert_eq!(decoded.as_object().unwrap().len(), 1);
    assert!(result.errored);
}

// ── Destinations ────────────────────────────────────────────

#[test]
fn destinations_resolve_names_and_ids() {
    let result = run(|_| matching().returns("destinations", json!(["Test"])));
    assert_eq!(result.destinations.output, Some(vec!["1234".to_string()]));

    let result = run(|_| matching().returns("destinations", json!([])));
    assert_eq!(result.destinations.output, Some(vec![]));
}

#[test]
fn invalid_destinations_fail_the_output() {
    let result = run(|_| matching().returns("destinations", json!(["Test", "TestTest"])));
    assert!(result.destinations.output.is_none());
    assert_eq!(
        result.destinations.error_message().as_deref(),
        Some(r#"ValueError: Invalid Destinations: ["TestTest"]"#)
    );

    let result = run(|_| matching().returns("destinations", json!(["Test", "Test", "TestTest"])));
    assert_eq!(
        result.destinations.error.as_ref().map(|f| f.message.clone()).as_deref(),
        Some(r#"Invalid Destinations: ["Test", "TestTest"]"#)
    );
}

#[test]
fn id_after_its_display_name_is_a_duplicate() {
    let result = run(|_| matching().returns("destinations", json!(["Test", "Test", "1234"])));
    assert!(result.destinations.output.is_none());
    assert_eq!(
        result.destinations.error_message().as_deref(),
        Some(r#"ValueError: Invalid Destinations: ["Test", "1234"]"#)
    );
}

#[test]
fn ids_and_names_of_distinct_destinations_resolve() {
    let index = DestinationIndex::new([
        Destination::from_value(&json!({"outputId": "1234", "displayName": "Test"})).unwrap(),
        Destination::from_value(&json!({"outputId": "5678", "displayName": "TestTest"})).unwrap(),
    ]);
    let result = run_against(&index, RunMode::Batch, |_| {
        matching().returns("destinations", json!(["1234", "TestTest"]))
    });
    assert_eq!(
        result.destinations.output,
        Some(vec!["1234".to_string(), "5678".to_string()])
    );
    assert!(result.destinations.error.is_none());
    assert!(!result.errored);
}

#[test]
fn destinations_must_be_a_list() {
    let result = run(|_| matching().returns("destinations", json!("bad input")));
    assert!(result.destinations.output.is_none());
    assert_eq!(
        result.destinations.error.as_ref().map(|f| f.message.clone()).as_deref(),
        Some("rule [test_rule] function [destinations] returned [string], expected a list")
    );
}

// ── Modes ───────────────────────────────────────────────────

#[test]
fn non_batch_mode_keeps_raw_failures() {
    let batch = run_with(RunMode::Batch, |_| matching().fails("dedup", FailureKind::Runtime, "test"));
    assert!(batch.dedup.error.as_ref().unwrap().raw.is_none());
    assert_eq!(batch.dedup_key(), Some("defaultDedupString:test_rule"));

    let full = run_with(RunMode::NonBatch, |_| matching().fails("dedup", FailureKind::Runtime, "test"));
    assert!(full.dedup.error.as_ref().unwrap().raw.is_some());
    assert_eq!(full.dedup_key(), Some("defaultDedupString:test_rule"));
    assert!(full.errored);
}

#[test]
fn entry_points_see_mocks() {
    let interpreter = FnInterpreter::new().script("body", |s| {
        s.with("rule", |call| Invocation::Returned(json!(call.mocks.contains_key("lookup"))))
    });
    let unit = build_unit(&interpreter);
    let record = json!({});
    let mut mocks = Mocks::new();
    mocks.insert("lookup".to_string(), json!("mocked"));
    let result = runner().run(&unit, Argument::Record(&record), &mocks, &destinations(), RunMode::Batch);
    assert_eq!(result.matched(), Some(true));
}

#[test]
fn run_primary_skips_generated_fields() {
    let interpreter = FnInterpreter::new().script("body", |s| {
        s.returns("rule", json!(true))
            .with("title", |_| panic!("title must not run"))
    });
    let unit = build_unit(&interpreter);
    let record = json!({});
    let result = runner().run_primary(&unit, Argument::Record(&record), &Mocks::new(), RunMode::Batch);
    assert_eq!(result.matched(), Some(true));
    assert!(result.dedup_key().is_none());
}
