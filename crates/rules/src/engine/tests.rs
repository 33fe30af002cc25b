use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use serde_json::{json, Value};
use tripwire_core::Config;

use super::*;
use crate::catalog::StaticCatalog;
use crate::field_model::{FieldModelDescriptor, MappingDescriptor};
use crate::script::{FailureKind, Invocation};
use crate::testing::FnInterpreter;
use crate::unit::UnitDescriptor;

fn rule(id: &str, body: &str, log_types: &[&str]) -> UnitDescriptor {
    UnitDescriptor {
        id: id.to_string(),
        body: body.to_string(),
        version_id: "v1".to_string(),
        log_types: log_types.iter().map(|s| s.to_string()).collect(),
        ..UnitDescriptor::default()
    }
}

fn cloudtrail_model() -> FieldModelDescriptor {
    FieldModelDescriptor {
        id: "aws.cloudtrail".to_string(),
        log_types: vec!["AWS.CloudTrail".to_string()],
        mappings: vec![MappingDescriptor {
            name: "source_ip".to_string(),
            path: Some("sourceIPAddress".to_string()),
            method: None,
        }],
        ..FieldModelDescriptor::default()
    }
}

fn interpreter() -> FnInterpreter {
    FnInterpreter::new()
        .script("always", |s| s.returns("rule", json!(true)).returns("title", json!("always")))
        .script("never", |s| s.returns("rule", json!(false)))
        .script("raises", |s| s.fails("rule", FailureKind::Runtime, "boom"))
        .script("udm", |s| {
            s.with("rule", |call| match call.argument {
                Argument::Event(view) => match view.udm("source_ip") {
                    Ok(ip) => Invocation::Returned(json!(ip == Some(json!("1.2.3.4")))),
                    Err(e) => Invocation::Failed(e.to_failure()),
                },
                Argument::Record(_) => Invocation::Returned(json!(false)),
            })
        })
        .script("mocked", |s| {
            s.with("rule", |call| Invocation::Returned(json!(call.mocks.get("flag") == Some(&json!(true)))))
        })
        .broken("broken", FailureKind::Syntax, "invalid syntax")
}

fn engine_with(catalog: StaticCatalog) -> (Engine, LoadReport) {
    let catalog = Arc::new(catalog);
    let mut config = Config::default();
    config.execution.worker_threads = 2;
    Engine::new(catalog.clone(), catalog, Arc::new(interpreter()), &config).unwrap()
}

fn event(value: Value) -> Arc<Value> {
    Arc::new(value)
}

#[test]
fn matching_rules_produce_candidates() {
    let (engine, report) = engine_with(
        StaticCatalog::new()
            .with_rule(rule("always", "always", &["AWS.CloudTrail"]))
            .with_rule(rule("never", "never", &["AWS.CloudTrail"]))
            .with_rule(rule("other", "always", &["Okta.SystemLog"])),
    );
    assert_eq!(report.rules_loaded, 3);

    let results = engine.analyze("AWS.CloudTrail", event(json!({"a": 1}))).unwrap();
    assert_eq!(results.len(), 1);
    let candidate = &results[0];
    assert_eq!(candidate.rule_id, "always");
    assert_eq!(candidate.rule_version, "v1");
    assert_eq!(candidate.dedup, "always");
    assert_eq!(candidate.title.as_deref(), Some("always"));
    assert_eq!(candidate.dedup_period_mins, 60);
    assert_eq!(candidate.event, json!({"a": 1}));
    assert!(!candidate.is_error());
}

#[test]
fn primary_failures_become_error_candidates() {
    let (engine, _) = engine_with(StaticCatalog::new().with_rule(rule("raises", "raises", &["AWS.CloudTrail"])));

    let results = engine.analyze("AWS.CloudTrail", event(json!({}))).unwrap();
    assert_eq!(results.len(), 1);
    let candidate = &results[0];
    assert!(candidate.is_error());
    assert_eq!(candidate.dedup, "RuntimeError");
    assert_eq!(candidate.title.as_deref(), Some("RuntimeError('boom')"));
    assert_eq!(candidate.error_message.as_deref(), Some("boom: in rule"));
}

#[test]
fn compile_failures_become_error_candidates() {
    let (engine, report) = engine_with(StaticCatalog::new().with_rule(rule("broken", "broken", &["AWS.CloudTrail"])));
    assert!(report.failures.is_empty());

    let results = engine.analyze("AWS.CloudTrail", event(json!({}))).unwrap();
    assert_eq!(results[0].dedup, "SyntaxError");
}

#[test]
fn global_rules_run_after_specific_ones() {
    let (engine, _) = engine_with(
        StaticCatalog::new()
            .with_rule(rule("global", "always", &[]))
            .with_rule(rule("specific", "always", &["AWS.CloudTrail"])),
    );
    let ids: Vec<_> = engine
        .analyze("AWS.CloudTrail", event(json!({})))
        .unwrap()
        .into_iter()
        .map(|r| r.rule_id)
        .collect();
    assert_eq!(ids, vec!["specific", "global"]);

    let ids: Vec<_> = engine
        .analyze("Unknown.Type", event(json!({})))
        .unwrap()
        .into_iter()
        .map(|r| r.rule_id)
        .collect();
    assert_eq!(ids, vec!["global"]);
}

#[test]
fn resource_types_do_not_scope_rules() {
    let mut descriptor = rule("resource_scoped", "always", &[]);
    descriptor.resource_types = vec!["AWS.S3.Bucket".to_string()];
    let (engine, _) = engine_with(StaticCatalog::new().with_rule(descriptor));

    let results = engine.analyze("AWS.CloudTrail", event(json!({}))).unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].rule_id, "resource_scoped");
}

#[test]
fn malformed_entries_are_reported_not_fatal() {
    let mut no_version = rule("no_version", "always", &["AWS.CloudTrail"]);
    no_version.version_id.clear();
    let (engine, report) = engine_with(
        StaticCatalog::new()
            .with_rule(no_version)
            .with_rule(rule("ok", "always", &["AWS.CloudTrail"]))
            .with_output(json!({"displayName": "no id"}))
            .with_output(json!({"outputId": "1234", "displayName": "Test"})),
    );
    assert_eq!(report.rules_loaded, 1);
    assert_eq!(report.destinations_loaded, 1);
    assert_eq!(report.failures.len(), 2);
    assert_eq!(engine.destinations().id_for_name("Test"), Some("1234"));
}

#[test]
fn udm_lookups_use_the_log_type_model() {
    let (engine, _) = engine_with(
        StaticCatalog::new()
            .with_rule(rule("udm", "udm", &["AWS.CloudTrail", "Okta.SystemLog"]))
            .with_data_model(cloudtrail_model()),
    );

    let results = engine
        .analyze("AWS.CloudTrail", event(json!({"sourceIPAddress": "1.2.3.4"})))
        .unwrap();
    assert_eq!(results.len(), 1);

    let err = engine.analyze("Okta.SystemLog", event(json!({}))).unwrap_err();
    match err {
        EngineError::Configuration { unit_id, message } => {
            assert_eq!(unit_id, "udm");
            assert_eq!(message, "no field model registered for this category");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn batch_keeps_input_order_and_isolates_failures() {
    let (engine, _) = engine_with(
        StaticCatalog::new()
            .with_rule(rule("udm", "udm", &["AWS.CloudTrail", "Okta.SystemLog"]))
            .with_data_model(cloudtrail_model()),
    );
    let events = vec![
        BatchEvent::new("AWS.CloudTrail", json!({"sourceIPAddress": "1.2.3.4"})),
        BatchEvent::new("Okta.SystemLog", json!({})),
        BatchEvent::new("AWS.CloudTrail", json!({"sourceIPAddress": "5.6.7.8"})),
    ];

    let outcomes = engine.analyze_batch(&events, &AtomicBool::new(false));
    assert_eq!(outcomes.len(), 3);
    assert_eq!(outcomes[0].as_ref().unwrap().len(), 1);
    assert!(matches!(outcomes[1], Err(EngineError::Configuration { .. })));
    assert!(outcomes[2].as_ref().unwrap().is_empty());
    assert_eq!(engine.worker_threads(), 2);
}

#[test]
fn cancelled_batches_stop_between_rules() {
    let (engine, _) = engine_with(StaticCatalog::new().with_rule(rule("always", "always", &["AWS.CloudTrail"])));
    let events = vec![BatchEvent::new("AWS.CloudTrail", json!({}))];
    let outcomes = engine.analyze_batch(&events, &AtomicBool::new(true));
    assert!(matches!(outcomes[0], Err(EngineError::Cancelled)));
}

#[test]
fn reload_rebuilds_indexes() {
    let catalog = Arc::new(StaticCatalog::new().with_rule(rule("always", "always", &["AWS.CloudTrail"])));
    let (mut engine, _) = Engine::new(catalog.clone(), catalog, Arc::new(interpreter()), &Config::default()).unwrap();
    let report = engine.reload().unwrap();
    assert_eq!(report.rules_loaded, 1);
    assert_eq!(engine.rules_for("AWS.CloudTrail").count(), 1);
}

// ── Single-rule mode ────────────────────────────────────────

#[test]
fn analyze_single_reports_every_point() {
    let (engine, _) = engine_with(StaticCatalog::new());
    let mut descriptor = rule("always", "always", &[]);
    descriptor.version_id.clear();
    let test = TestSpec {
        id: "t1".to_string(),
        data: json!({}),
        ..TestSpec::default()
    };

    let response = engine.analyze_single(&descriptor, &test);
    assert_eq!(response.id, "t1");
    assert_eq!(response.rule_id, "always");
    assert_eq!(response.rule_output, Some(true));
    assert_eq!(response.title_output.as_deref(), Some("always"));
    assert_eq!(response.dedup_output.as_deref(), Some("always"));
    assert!(!response.errored);
    assert!(response.generic_error.is_none());

    let json = serde_json::to_value(&response).unwrap();
    for key in ["genericError", "ruleOutput", "dedupError", "alertContextOutput", "destinationsOutput"] {
        assert!(json.get(key).is_some(), "missing key {key}");
    }
}

#[test]
fn analyze_single_formats_errors() {
    let (engine, _) = engine_with(StaticCatalog::new());
    let test = TestSpec::default();

    let response = engine.analyze_single(&rule("raises", "raises", &[]), &test);
    assert_eq!(response.rule_error.as_deref(), Some("RuntimeError: boom"));
    assert!(response.errored);

    let response = engine.analyze_single(&rule("broken", "broken", &[]), &test);
    assert_eq!(response.generic_error.as_deref(), Some("SyntaxError: invalid syntax"));

    let response = engine.analyze_single(&rule("", "always", &[]), &test);
    assert_eq!(response.generic_error.as_deref(), Some("ValidationError: rule field `id` is required"));
}

#[test]
fn analyze_single_explains_missing_field_model() {
    let (engine, _) = engine_with(StaticCatalog::new().with_data_model(cloudtrail_model()));

    let test = TestSpec {
        id: "t".to_string(),
        data: json!({"sourceIPAddress": "1.2.3.4"}),
        ..TestSpec::default()
    };
    let response = engine.analyze_single(&rule("udm", "udm", &[]), &test);
    let explained = format!("ConfigurationError: {}", MISSING_FIELD_MODEL_MESSAGE);
    assert_eq!(response.generic_error.as_deref(), Some(explained.as_str()));
    assert_eq!(response.rule_error.as_deref(), Some(explained.as_str()));
    assert_eq!(response.rule_output, None);
    assert!(response.errored);

    let test = TestSpec {
        data: json!({"p_log_type": "AWS.CloudTrail", "sourceIPAddress": "1.2.3.4"}),
        ..test
    };
    let response = engine.analyze_single(&rule("udm", "udm", &[]), &test);
    assert_eq!(response.rule_output, Some(true));
    assert!(response.generic_error.is_none());
}

#[test]
fn analyze_single_applies_mocks() {
    let (engine, _) = engine_with(StaticCatalog::new());
    let mut test = TestSpec::default();
    test.mocks.insert("flag".to_string(), json!(true));
    let response = engine.analyze_single(&rule("mocked", "mocked", &[]), &test);
    assert_eq!(response.rule_output, Some(true));
}

#[test]
fn analyze_direct_requires_exactly_one_rule() {
    let (engine, _) = engine_with(StaticCatalog::new());
    let request: DirectRequest = serde_json::from_value(json!({
        "rules": [{"id": "always", "body": "always"}],
        "events": [{"id": "a", "data": {}}, {"id": "b", "data": {}}]
    }))
    .unwrap();
    let response = engine.analyze_direct(&request).unwrap();
    assert_eq!(response.results.len(), 2);
    assert_eq!(response.results[1].id, "b");

    let empty = DirectRequest::default();
    assert!(matches!(engine.analyze_direct(&empty), Err(EngineError::InvalidRequest(_))));
}
