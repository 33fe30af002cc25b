//! Per-category field models mapping logical names to record paths or derivations.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::script::{Argument, Call, FailureKind, Interpreter, Invocation, Mocks, Script, ScriptFailure};

/// Where a logical field's value comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldSource {
    /// Segments walked into the raw record. Numeric segments index lists.
    Path(Vec<String>),
    /// Entry point of the model body, invoked with the raw record.
    Method(String),
}

impl FieldSource {
    /// Parse a record path. Segments are separated by `.`; a bracketed
    /// segment is either a quoted key (`['a.b']`, `["a.b"]`) that may
    /// contain dots, or a list index (`[0]`). A leading `$` is ignored.
    /// Returns `None` for an unterminated or malformed bracket.
    pub fn parse_path(path: &str) -> Option<FieldSource> {
        let mut rest = path.strip_prefix('$').unwrap_or(path);
        let mut segments = Vec::new();
        while !rest.is_empty() {
            if let Some(after) = rest.strip_prefix('[') {
                let (segment, tail) = bracketed(after)?;
                segments.push(segment);
                rest = tail;
            } else {
                let body = rest.strip_prefix('.').unwrap_or(rest);
                let end = body.find(['.', '[']).unwrap_or(body.len());
                if end > 0 {
                    segments.push(body[..end].to_string());
                }
                rest = &body[end..];
            }
        }
        Some(FieldSource::Path(segments))
    }
}

/// Segment inside `[...]` and the text after the closing bracket.
fn bracketed(text: &str) -> Option<(String, &str)> {
    match text.chars().next()? {
        quote @ ('\'' | '"') => {
            let inner = &text[1..];
            let close = inner.find(quote)?;
            let tail = inner[close + 1..].strip_prefix(']')?;
            Some((inner[..close].to_string(), tail))
        }
        _ => {
            let close = text.find(']')?;
            let index = text[..close].trim();
            index.parse::<usize>().ok()?;
            Some((index.to_string(), &text[close + 1..]))
        }
    }
}

/// Data model descriptor as stored in the analysis catalog.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldModelDescriptor {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub version_id: String,
    #[serde(default)]
    pub log_types: Vec<String>,
    #[serde(default)]
    pub mappings: Vec<MappingDescriptor>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MappingDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ModelError {
    #[error("data model field `{0}` is required")]
    MissingField(&'static str),

    #[error("mapping `{name}` must define exactly one of `path` or `method`")]
    InvalidMapping { name: String },

    #[error("mapping `{name}` has a malformed path `{path}`")]
    InvalidPath { name: String, path: String },

    #[error("mapping `{name}` is defined more than once")]
    DuplicateMapping { name: String },

    #[error("mapping `{name}` uses method `{method}` but the data model has no body")]
    MissingBody { name: String, method: String },

    #[error("mapping `{name}` uses method `{method}` which the body does not define")]
    UndefinedMethod { name: String, method: String },

    #[error("data model body failed to compile: {0}")]
    Compile(ScriptFailure),
}

/// Failure of a logical-field lookup.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LookupError {
    #[error("no field model registered for this category")]
    NoFieldModel,

    #[error("derivation failed for field `{name}`: {failure}")]
    Derivation { name: String, failure: ScriptFailure },
}

impl LookupError {
    /// Failure handed back to the interpreter that requested the lookup.
    pub fn to_failure(&self) -> ScriptFailure {
        match self {
            LookupError::NoFieldModel => ScriptFailure::new(FailureKind::Configuration, self.to_string()),
            LookupError::Derivation { name, failure } => ScriptFailure {
                kind: failure.kind.clone(),
                message: format!("derivation failed for field `{}`: {}", name, failure.message),
                location: failure.location.clone(),
            },
        }
    }
}

/// Compiled mapping from logical field names to value sources.
#[derive(Debug, Clone)]
pub struct FieldModel {
    id: String,
    categories: Vec<String>,
    mappings: HashMap<String, FieldSource>,
    script: Option<Arc<dyn Script>>,
}

impl FieldModel {
    pub fn new(descriptor: &FieldModelDescriptor, interpreter: &dyn Interpreter) -> Result<Self, ModelError> {
        if descriptor.id.is_empty() {
            return Err(ModelError::MissingField("id"));
        }

        let script = if descriptor.body.is_empty() {
            None
        } else {
            Some(
                interpreter
                    .compile(&descriptor.id, &descriptor.body)
                    .map_err(ModelError::Compile)?,
            )
        };

        let mut mappings = HashMap::with_capacity(descriptor.mappings.len());
        for mapping in &descriptor.mappings {
            let source = match (&mapping.path, &mapping.method) {
                (Some(path), None) => FieldSource::parse_path(path).ok_or_else(|| ModelError::InvalidPath {
                    name: mapping.name.clone(),
                    path: path.clone(),
                })?,
                (None, Some(method)) => {
                    let script = script.as_ref().ok_or_else(|| ModelError::MissingBody {
                        name: mapping.name.clone(),
                        method: method.clone(),
                    })?;
                    if !script.defines(method) {
                        return Err(ModelError::UndefinedMethod {
                            name: mapping.name.clone(),
                            method: method.clone(),
                        });
                    }
                    FieldSource::Method(method.clone())
                }
                _ => {
                    return Err(ModelError::InvalidMapping {
                        name: mapping.name.clone(),
                    })
                }
            };
            if mappings.insert(mapping.name.clone(), source).is_some() {
                return Err(ModelError::DuplicateMapping {
                    name: mapping.name.clone(),
                });
            }
        }

        Ok(Self {
            id: descriptor.id.clone(),
            categories: descriptor.log_types.clone(),
            mappings,
            script,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn categories(&self) -> &[String] {
        &self.categories
    }

    pub fn source(&self, name: &str) -> Option<&FieldSource> {
        self.mappings.get(name)
    }

    /// Resolve `name` against `record`. Unmapped names and missing path
    /// segments are `Ok(None)`.
    pub fn lookup(
        &self,
        record: &Value,
        name: &str,
        mocks: &Mocks,
        timeout: Duration,
    ) -> Result<Option<Value>, LookupError> {
        match self.mappings.get(name) {
            None => Ok(None),
            Some(FieldSource::Path(segments)) => Ok(resolve_path(record, segments).cloned()),
            Some(FieldSource::Method(method)) => {
                let Some(script) = self.script.as_ref() else {
                    return Ok(None);
                };
                let call = Call {
                    argument: Argument::Record(record),
                    mocks,
                    timeout,
                };
                match script.invoke(method, call) {
                    Invocation::Returned(value) => Ok(Some(value)),
                    Invocation::Undefined => Ok(None),
                    Invocation::Failed(failure) => Err(LookupError::Derivation {
                        name: name.to_string(),
                        failure,
                    }),
                }
            }
        }
    }
}

/// Walk `segments` into `record`.
pub fn resolve_path<'a>(record: &'a Value, segments: &[String]) -> Option<&'a Value> {
    segments.iter().try_fold(record, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FnInterpreter;
    use serde_json::json;

    fn mapping(name: &str, path: Option<&str>, method: Option<&str>) -> MappingDescriptor {
        MappingDescriptor {
            name: name.to_string(),
            path: path.map(str::to_string),
            method: method.map(str::to_string),
        }
    }

    fn model_descriptor(mappings: Vec<MappingDescriptor>, body: &str) -> FieldModelDescriptor {
        FieldModelDescriptor {
            id: "aws.cloudtrail".to_string(),
            body: body.to_string(),
            log_types: vec!["AWS.CloudTrail".to_string()],
            mappings,
            ..FieldModelDescriptor::default()
        }
    }

    fn derivations() -> FnInterpreter {
        FnInterpreter::new().script("model", |s| {
            s.with("get_source_ip", |call| {
                Invocation::Returned(call.argument.record()["sourceIPAddress"].clone())
            })
            .fails("get_broken", FailureKind::Runtime, "boom")
        })
    }

    fn segments(path: &str) -> Vec<String> {
        match FieldSource::parse_path(path) {
            Some(FieldSource::Path(segments)) => segments,
            other => panic!("expected a path for {path}, got {other:?}"),
        }
    }

    #[test]
    fn path_parsing_strips_prefix() {
        assert_eq!(segments("$.userIdentity.arn"), ["userIdentity", "arn"]);
        assert_eq!(segments("a.0.b"), ["a", "0", "b"]);
    }

    #[test]
    fn bracketed_segments_may_contain_dots() {
        assert_eq!(segments("$['a.b']"), ["a.b"]);
        assert_eq!(segments(r#"$.tags["aws:cloudformation.stack"].value"#), ["tags", "aws:cloudformation.stack", "value"]);
        assert_eq!(segments("ips[1]"), ["ips", "1"]);
        assert_eq!(segments("$['a'][0]['b.c']"), ["a", "0", "b.c"]);

        assert_eq!(FieldSource::parse_path("$['a.b"), None);
        assert_eq!(FieldSource::parse_path("a[x]"), None);
        assert_eq!(FieldSource::parse_path("a['b'c]"), None);
    }

    #[test]
    fn dotted_keys_are_addressable() {
        let model = FieldModel::new(
            &model_descriptor(vec![mapping("stack", Some("$.tags['cloudformation.stack']"), None)], ""),
            &derivations(),
        )
        .unwrap();
        let record = json!({"tags": {"cloudformation.stack": "prod", "cloudformation": {"stack": "wrong"}}});
        let lookup = model.lookup(&record, "stack", &Mocks::new(), Duration::from_secs(1));
        assert_eq!(lookup.unwrap(), Some(json!("prod")));

        let err = FieldModel::new(&model_descriptor(vec![mapping("bad", Some("a['b"), None)], ""), &derivations())
            .unwrap_err();
        assert_eq!(err, ModelError::InvalidPath { name: "bad".into(), path: "a['b".into() });
    }

    #[test]
    fn path_lookup_traverses_maps_and_lists() {
        let model = FieldModel::new(
            &model_descriptor(vec![mapping("first_ip", Some("ips.0"), None), mapping("user", Some("$.user.name"), None)], ""),
            &derivations(),
        )
        .unwrap();
        let record = json!({"ips": ["10.0.0.1", "10.0.0.2"], "user": {"name": "alice"}});
        let timeout = Duration::from_secs(1);
        let mocks = Mocks::new();

        assert_eq!(model.lookup(&record, "first_ip", &mocks, timeout).unwrap(), Some(json!("10.0.0.1")));
        assert_eq!(model.lookup(&record, "user", &mocks, timeout).unwrap(), Some(json!("alice")));
        assert_eq!(model.lookup(&json!({}), "user", &mocks, timeout).unwrap(), None);
        assert_eq!(model.lookup(&record, "unmapped", &mocks, timeout).unwrap(), None);
    }

    #[test]
    fn method_lookup_invokes_derivation() {
        let model = FieldModel::new(
            &model_descriptor(
                vec![
                    mapping("source_ip", None, Some("get_source_ip")),
                    mapping("broken", None, Some("get_broken")),
                ],
                "model",
            ),
            &derivations(),
        )
        .unwrap();
        let record = json!({"sourceIPAddress": "1.2.3.4"});
        let timeout = Duration::from_secs(1);
        let mocks = Mocks::new();

        assert_eq!(model.lookup(&record, "source_ip", &mocks, timeout).unwrap(), Some(json!("1.2.3.4")));

        let err = model.lookup(&record, "broken", &mocks, timeout).unwrap_err();
        let failure = err.to_failure();
        assert_eq!(failure.kind, FailureKind::Runtime);
        assert!(failure.message.starts_with("derivation failed for field `broken`"));
    }

    #[test]
    fn mappings_need_exactly_one_source() {
        let err = FieldModel::new(
            &model_descriptor(vec![mapping("x", Some("a"), Some("get_source_ip"))], "model"),
            &derivations(),
        )
        .unwrap_err();
        assert_eq!(err, ModelError::InvalidMapping { name: "x".into() });

        let err = FieldModel::new(&model_descriptor(vec![mapping("x", None, None)], ""), &derivations()).unwrap_err();
        assert_eq!(err, ModelError::InvalidMapping { name: "x".into() });
    }

    #[test]
    fn duplicate_and_undefined_methods_are_rejected() {
        let err = FieldModel::new(
            &model_descriptor(vec![mapping("x", Some("a"), None), mapping("x", Some("b"), None)], ""),
            &derivations(),
        )
        .unwrap_err();
        assert_eq!(err, ModelError::DuplicateMapping { name: "x".into() });

        let err = FieldModel::new(
            &model_descriptor(vec![mapping("x", None, Some("missing"))], "model"),
            &derivations(),
        )
        .unwrap_err();
        assert!(matches!(err, ModelError::UndefinedMethod { .. }));

        let err = FieldModel::new(&model_descriptor(vec![mapping("x", None, Some("m"))], ""), &derivations()).unwrap_err();
        assert!(matches!(err, ModelError::MissingBody { .. }));
    }

    #[test]
    fn missing_model_is_a_configuration_failure() {
        let failure = LookupError::NoFieldModel.to_failure();
        assert_eq!(failure.kind, FailureKind::Configuration);
        assert_eq!(failure.message, "no field model registered for this category");
    }
}
