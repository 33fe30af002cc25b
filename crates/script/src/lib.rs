//! Expression interpreter for rule, policy and field model bodies.
//!
//! A body is a YAML mapping from entry-point name to a minijinja expression.
//! Expressions see:
//! - `event`: the record under evaluation
//! - `udm(name)`: logical-field lookup (event arguments only)
//! - `fail(message, kind=None)`: raise a failure, `RuntimeError` by default
//! - every mock name, as a function returning the mocked value
//!
//! Undefined attributes chain, so `event.a.b.c` is `none` when `a` is missing.

mod body;
mod failure;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use minijinja::value::Rest;
use minijinja::{Environment, Error, UndefinedBehavior, Value};
use tracing::{debug, trace};
use tripwire_core::config::ExecutionConfig;
use tripwire_rules::script::{
    Argument, Call, FailureKind, Interpreter, Invocation, Script, ScriptFailure,
};

use self::body::EntryPoint;
use self::failure::Raised;

/// Compiles bodies into [`ExpressionScript`]s.
#[derive(Debug, Clone, Default)]
pub struct ExpressionInterpreter {
    fuel: Option<u64>,
}

impl ExpressionInterpreter {
    /// Interpreter with a per-invocation fuel budget; `0` disables fuel.
    pub fn new(fuel: u64) -> Self {
        Self {
            fuel: (fuel > 0).then_some(fuel),
        }
    }

    pub fn from_config(config: &ExecutionConfig) -> Self {
        Self::new(config.script_fuel)
    }
}

/// Fresh environment for one compilation or evaluation.
fn environment<'source>(fuel: Option<u64>) -> Environment<'source> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Chainable);
    env.set_fuel(fuel);
    env
}

impl Interpreter for ExpressionInterpreter {
    fn compile(&self, unit_id: &str, body: &str) -> Result<Arc<dyn Script>, ScriptFailure> {
        let file = format!("{}.yml", unit_id);
        let points = body::parse(&file, body)?;
        let env = environment(self.fuel);
        let mut names = BTreeSet::new();

        for (name, point) in &points {
            match env.compile_expression(&point.source) {
                Ok(expr) => names.extend(expr.undeclared_variables(false)),
                Err(err) => {
                    debug!(unit_id, point = %name, error = %err, "expression failed to compile");
                    return Err(failure::from_error(&err, body::location(&file, point.line)));
                }
            }
        }

        debug!(unit_id, points = points.len(), names = names.len(), "compiled body");
        Ok(Arc::new(ExpressionScript {
            file,
            fuel: self.fuel,
            points,
            names,
        }))
    }
}

/// A compiled body.
#[derive(Debug)]
pub struct ExpressionScript {
    file: String,
    fuel: Option<u64>,
    points: BTreeMap<String, EntryPoint>,
    /// Free variables referenced by any entry point.
    names: BTreeSet<String>,
}

impl ExpressionScript {
    /// Entry-point names in sorted order.
    pub fn entry_points(&self) -> impl Iterator<Item = &str> {
        self.points.keys().map(String::as_str)
    }

    /// Free variables referenced by any entry point, in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    fn context(&self, call: Call<'_>, raised: &Raised) -> BTreeMap<String, Value> {
        let mut vars = BTreeMap::new();
        vars.insert("event".to_string(), Value::from_serialize(call.argument.record()));

        if let Argument::Event(view) = call.argument {
            let view = view.clone();
            let raised = raised.clone();
            let udm = move |name: String| -> Result<Value, Error> {
                match view.udm(&name) {
                    Ok(found) => Ok(Value::from_serialize(&found)),
                    Err(e) => Err(raised.raise(e.to_failure())),
                }
            };
            vars.insert("udm".to_string(), Value::from_function(udm));
        }

        let raised = raised.clone();
        let fail = move |message: String, kind: Option<String>| -> Result<Value, Error> {
            let kind = kind.as_deref().map_or(FailureKind::Runtime, failure::kind_named);
            Err(raised.raise(ScriptFailure::new(kind, message)))
        };
        vars.insert("fail".to_string(), Value::from_function(fail));

        for (name, mocked) in call.mocks {
            let mocked = Value::from_serialize(mocked);
            let mock = move |_args: Rest<Value>| mocked.clone();
            vars.insert(name.clone(), Value::from_function(mock));
        }
        vars
    }

    fn failed(&self, point: &EntryPoint, err: &Error, raised: &Raised) -> ScriptFailure {
        let location = body::location(&self.file, point.line);
        match raised.take() {
            Some(mut failure) => {
                if failure.location.is_none() {
                    failure.location = Some(location);
                }
                failure
            }
            None => failure::from_error(err, location),
        }
    }
}

impl Script for ExpressionScript {
    fn defines(&self, entry_point: &str) -> bool {
        self.points.contains_key(entry_point)
    }

    fn uses(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    fn invoke(&self, entry_point: &str, call: Call<'_>) -> Invocation {
        let Some(point) = self.points.get(entry_point) else {
            return Invocation::Undefined;
        };
        trace!(file = %self.file, entry_point, "evaluating expression");

        let raised = Raised::default();
        let ctx = self.context(call, &raised);
        let env = environment(self.fuel);
        let started = Instant::now();
        let outcome = env
            .compile_expression(&point.source)
            .and_then(|expr| expr.eval(ctx));
        let elapsed = started.elapsed();

        if elapsed > call.timeout {
            let failure = ScriptFailure::new(
                FailureKind::Timeout,
                format!(
                    "{} exceeded the {} ms time limit",
                    entry_point,
                    call.timeout.as_millis()
                ),
            )
            .at(body::location(&self.file, point.line));
            return Invocation::Failed(failure);
        }

        match outcome {
            Ok(value) => match serde_json::to_value(&value) {
                Ok(returned) => Invocation::Returned(returned),
                Err(e) => Invocation::Failed(
                    ScriptFailure::new(FailureKind::Type, format!("unsupported return value: {}", e))
                        .at(body::location(&self.file, point.line)),
                ),
            },
            Err(err) => Invocation::Failed(self.failed(point, &err, &raised)),
        }
    }
}
