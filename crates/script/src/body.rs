//! Unit bodies: a YAML mapping from entry-point name to expression.
//!
//! ```yaml
//! rule: event.eventName == 'ConsoleLogin' and not event.mfa
//! title: "'Console login without MFA by ' ~ udm('actor_user')"
//! severity: "'HIGH'"
//! ```

use std::collections::BTreeMap;

use serde_yaml::Value as Yaml;
use tripwire_rules::script::{FailureKind, ScriptFailure, SourceLocation};

/// Source of one entry point.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct EntryPoint {
    pub source: String,
    /// Line of the entry-point key in the body, 1-based.
    pub line: Option<usize>,
}

/// Split `body` into entry points.
pub(crate) fn parse(file: &str, body: &str) -> Result<BTreeMap<String, EntryPoint>, ScriptFailure> {
    let mapping: serde_yaml::Mapping = serde_yaml::from_str(body).map_err(|e| {
        ScriptFailure::new(FailureKind::Syntax, e.to_string()).at(SourceLocation {
            file: file.to_string(),
            line: e.location().map(|l| l.line()),
        })
    })?;

    let mut points = BTreeMap::new();
    for (key, value) in mapping {
        let name = match key {
            Yaml::String(name) => name,
            other => {
                return Err(ScriptFailure::new(
                    FailureKind::Syntax,
                    format!("entry point names must be strings, got {:?}", other),
                )
                .at(location(file, None)))
            }
        };
        let line = key_line(body, &name);
        let source = match value {
            Yaml::String(s) => s,
            Yaml::Bool(b) => b.to_string(),
            Yaml::Number(n) => n.to_string(),
            _ => {
                return Err(ScriptFailure::new(
                    FailureKind::Syntax,
                    format!("entry point `{}` must be an expression", name),
                )
                .at(location(file, line)))
            }
        };
        if source.trim().is_empty() {
            return Err(ScriptFailure::new(
                FailureKind::Syntax,
                format!("entry point `{}` has an empty expression", name),
            )
            .at(location(file, line)));
        }
        points.insert(name, EntryPoint { source, line });
    }
    Ok(points)
}

pub(crate) fn location(file: &str, line: Option<usize>) -> SourceLocation {
    SourceLocation {
        file: file.to_string(),
        line,
    }
}

/// Line of the top-level `name:` key, if it is written unquoted.
fn key_line(body: &str, name: &str) -> Option<usize> {
    body.lines()
        .position(|line| {
            line.strip_prefix(name)
                .is_some_and(|rest| rest.trim_start().starts_with(':'))
        })
        .map(|i| i + 1)
}
