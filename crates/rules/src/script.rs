//! Contract between the evaluation core and a script interpreter.
//!
//! The core never looks at script syntax. It names entry points, hands the
//! interpreter an argument plus mock bindings, and interprets the three-way
//! [`Invocation`] that comes back.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use crate::event::EventView;

/// Named symbol substitutions forwarded to the interpreter for one call.
pub type Mocks = BTreeMap<String, Value>;

/// Compiles unit bodies into callable scripts.
pub trait Interpreter: Send + Sync {
    /// Compile `body` for the unit `unit_id`.
    ///
    /// A body that cannot be compiled yields a failure (usually
    /// [`FailureKind::Syntax`]) rather than a Rust error so callers can
    /// attribute it to the unit.
    fn compile(&self, unit_id: &str, body: &str) -> Result<Arc<dyn Script>, ScriptFailure>;
}

/// A compiled body exposing named entry points.
pub trait Script: Send + Sync + fmt::Debug {
    /// Whether the body defines `entry_point`.
    fn defines(&self, entry_point: &str) -> bool;

    /// Whether the body refers to the free name `name`, so a mock bound to
    /// it can take effect. Scripts that cannot tell accept every name.
    fn uses(&self, _name: &str) -> bool {
        true
    }

    /// Invoke `entry_point`. Must return within `call.timeout` or report a
    /// [`FailureKind::Timeout`] failure.
    fn invoke(&self, entry_point: &str, call: Call<'_>) -> Invocation;
}

/// Single positional argument passed to an entry point.
#[derive(Debug, Clone, Copy)]
pub enum Argument<'a> {
    /// An event wrapped in a view with logical-field lookup.
    Event(&'a EventView),
    /// A bare record: resource attributes or the input of a field derivation.
    Record(&'a Value),
}

impl<'a> Argument<'a> {
    /// The underlying record.
    pub fn record(&self) -> &'a Value {
        match self {
            Argument::Event(view) => view.raw(),
            Argument::Record(value) => value,
        }
    }
}

/// Everything an interpreter needs for one entry-point invocation.
#[derive(Debug, Clone, Copy)]
pub struct Call<'a> {
    pub argument: Argument<'a>,
    pub mocks: &'a Mocks,
    pub timeout: Duration,
}

/// Outcome of invoking one entry point.
#[derive(Debug, Clone, PartialEq)]
pub enum Invocation {
    /// The body does not define the entry point.
    Undefined,
    /// The entry point returned a value.
    Returned(Value),
    /// The entry point raised, timed out, or could not run.
    Failed(ScriptFailure),
}

// ── Failures ────────────────────────────────────────────────────────

/// Classification of a failure, rendered as its exception-style name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FailureKind {
    Syntax,
    Type,
    Value,
    Lookup,
    Name,
    Runtime,
    Timeout,
    Configuration,
    Validation,
    /// Interpreter-specific kind not covered above.
    Custom(String),
}

impl FailureKind {
    pub fn name(&self) -> &str {
        match self {
            FailureKind::Syntax => "SyntaxError",
            FailureKind::Type => "TypeError",
            FailureKind::Value => "ValueError",
            FailureKind::Lookup => "LookupError",
            FailureKind::Name => "NameError",
            FailureKind::Runtime => "RuntimeError",
            FailureKind::Timeout => "TimeoutError",
            FailureKind::Configuration => "ConfigurationError",
            FailureKind::Validation => "ValidationError",
            FailureKind::Custom(name) => name,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Serialize for FailureKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

/// Where in a body a failure happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceLocation {
    /// Source file name the interpreter associates with the body.
    pub file: String,
    pub line: Option<usize>,
}

/// Structured failure reported by an interpreter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScriptFailure {
    pub kind: FailureKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<SourceLocation>,
}

impl ScriptFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            location: None,
        }
    }

    pub fn at(mut self, location: SourceLocation) -> Self {
        self.location = Some(location);
        self
    }

    /// `Kind('message')`
    pub fn short_message(&self) -> String {
        format!("{}('{}')", self.kind, self.message)
    }

    /// Message with the source location and the entry point that failed.
    pub fn long_message(&self, entry_point: &str) -> String {
        match &self.location {
            Some(SourceLocation { file, line: Some(line) }) => {
                format!("{}: {}, line {}, in {}", self.message, file, line, entry_point)
            }
            Some(SourceLocation { file, line: None }) => {
                format!("{}: {}, in {}", self.message, file, entry_point)
            }
            None => format!("{}: in {}", self.message, entry_point),
        }
    }

    /// `Kind: message`, the form used in API responses.
    pub fn display_message(&self) -> String {
        format!("{}: {}", self.kind, self.message)
    }
}

impl fmt::Display for ScriptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Type name used in return-type validation messages.
pub fn value_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "none",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "map",
    }
}
