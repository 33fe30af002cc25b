//! Translation of template-engine errors into script failures.

use std::sync::{Arc, Mutex, PoisonError};

use minijinja::{Error, ErrorKind};
use tripwire_rules::script::{FailureKind, ScriptFailure, SourceLocation};

/// Failure raised from inside a host function during one evaluation.
///
/// Host functions can only return a template error; the structured failure
/// travels alongside it and takes precedence when the evaluation fails.
#[derive(Debug, Clone, Default)]
pub(crate) struct Raised(Arc<Mutex<Option<ScriptFailure>>>);

impl Raised {
    pub fn raise(&self, failure: ScriptFailure) -> Error {
        let message = failure.message.clone();
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = Some(failure);
        Error::new(ErrorKind::InvalidOperation, message)
    }

    pub fn take(&self) -> Option<ScriptFailure> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

pub(crate) fn kind_of(kind: ErrorKind) -> FailureKind {
    match kind {
        ErrorKind::SyntaxError => FailureKind::Syntax,
        ErrorKind::InvalidOperation
        | ErrorKind::MissingArgument
        | ErrorKind::TooManyArguments
        | ErrorKind::NonPrimitive
        | ErrorKind::NonKey => FailureKind::Type,
        ErrorKind::UndefinedError => FailureKind::Lookup,
        ErrorKind::UnknownFunction
        | ErrorKind::UnknownMethod
        | ErrorKind::UnknownFilter
        | ErrorKind::UnknownTest => FailureKind::Name,
        ErrorKind::OutOfFuel => FailureKind::Timeout,
        _ => FailureKind::Runtime,
    }
}

/// Kind for a name passed to `fail(message, kind)`.
pub(crate) fn kind_named(name: &str) -> FailureKind {
    match name {
        "SyntaxError" => FailureKind::Syntax,
        "TypeError" => FailureKind::Type,
        "ValueError" => FailureKind::Value,
        "LookupError" | "KeyError" | "IndexError" => FailureKind::Lookup,
        "NameError" => FailureKind::Name,
        "RuntimeError" => FailureKind::Runtime,
        "TimeoutError" => FailureKind::Timeout,
        other => FailureKind::Custom(other.to_string()),
    }
}

pub(crate) fn from_error(err: &Error, location: SourceLocation) -> ScriptFailure {
    let message = match err.detail() {
        Some(detail) => detail.to_string(),
        None => err.kind().to_string(),
    };
    ScriptFailure::new(kind_of(err.kind()), message).at(location)
}
