//! Closure-backed interpreter for exercising the core without a scripting language.
//!
//! Bodies are plain keys: `compile` looks the body text up in the table of
//! registered scripts, and each script maps entry-point names to closures.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::script::{Call, FailureKind, Interpreter, Invocation, Script, ScriptFailure};

type EntryPoint = Arc<dyn Fn(Call<'_>) -> Invocation + Send + Sync>;

/// Interpreter whose scripts are registered up front by body text.
#[derive(Debug, Default, Clone)]
pub struct FnInterpreter {
    scripts: HashMap<String, FnScript>,
    broken: HashMap<String, ScriptFailure>,
}

impl FnInterpreter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the script compiled from `body`.
    pub fn script(mut self, body: &str, build: impl FnOnce(FnScript) -> FnScript) -> Self {
        self.scripts.insert(body.to_string(), build(FnScript::default()));
        self
    }

    /// Make `body` fail to compile.
    pub fn broken(mut self, body: &str, kind: FailureKind, message: &str) -> Self {
        self.broken
            .insert(body.to_string(), ScriptFailure::new(kind, message));
        self
    }
}

impl Interpreter for FnInterpreter {
    fn compile(&self, _unit_id: &str, body: &str) -> Result<Arc<dyn Script>, ScriptFailure> {
        if let Some(failure) = self.broken.get(body) {
            return Err(failure.clone());
        }
        match self.scripts.get(body) {
            Some(script) => Ok(Arc::new(script.clone())),
            None => Err(ScriptFailure::new(
                FailureKind::Syntax,
                format!("unknown body `{}`", body),
            )),
        }
    }
}

/// Table of entry points backed by closures.
#[derive(Default, Clone)]
pub struct FnScript {
    points: BTreeMap<String, EntryPoint>,
    /// Free names the body refers to; `None` accepts every name.
    names: Option<BTreeSet<String>>,
}

impl FnScript {
    pub fn with(
        mut self,
        point: &str,
        f: impl Fn(Call<'_>) -> Invocation + Send + Sync + 'static,
    ) -> Self {
        self.points.insert(point.to_string(), Arc::new(f));
        self
    }

    pub fn returns(self, point: &str, value: Value) -> Self {
        self.with(point, move |_| Invocation::Returned(value.clone()))
    }

    pub fn fails(self, point: &str, kind: FailureKind, message: &str) -> Self {
        let failure = ScriptFailure::new(kind, message);
        self.with(point, move |_| Invocation::Failed(failure.clone()))
    }

    /// Restrict the free names the body refers to.
    pub fn names(mut self, names: &[&str]) -> Self {
        self.names = Some(names.iter().map(|n| n.to_string()).collect());
        self
    }
}

impl fmt::Debug for FnScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnScript")
            .field("points", &self.points.keys().collect::<Vec<_>>())
            .field("names", &self.names)
            .finish()
    }
}

impl Script for FnScript {
    fn defines(&self, entry_point: &str) -> bool {
        self.points.contains_key(entry_point)
    }

    fn uses(&self, name: &str) -> bool {
        self.names.as_ref().map_or(true, |names| names.contains(name))
    }

    fn invoke(&self, entry_point: &str, call: Call<'_>) -> Invocation {
        match self.points.get(entry_point) {
            Some(f) => f(call),
            None => Invocation::Undefined,
        }
    }
}
