//! Subcommand handlers.

use std::io::{self, BufRead, Write};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};
use tripwire_core::Config;
use tripwire_rules::engine::DirectRequest;
use tripwire_rules::output::MatchSink;
use tripwire_rules::policy::PolicyRequest;
use tripwire_rules::{
    AnalysisCatalog, BatchEvent, DirectoryCatalog, Engine, JsonLinesSink, MatchBuffer,
    OutputsCatalog, PolicySet, StaticCatalog, WriterSink,
};
use tripwire_script::ExpressionInterpreter;

use crate::cli::{RulesArgs, TestArgs};

/// `tripwire policy`
pub fn policy(config: &Config) -> Result<()> {
    let request: PolicyRequest =
        serde_json::from_reader(io::stdin().lock()).context("failed to parse policy request")?;
    let interpreter = ExpressionInterpreter::from_config(&config.execution);
    let response = PolicySet::evaluate(&request, &interpreter, config).context("policy evaluation failed")?;
    write_json(&response)
}

/// `tripwire test`
pub fn test(args: &TestArgs, config: &Config) -> Result<()> {
    let request: DirectRequest =
        serde_json::from_reader(io::stdin().lock()).context("failed to parse test request")?;
    let engine = match &args.root {
        Some(root) => {
            let catalog = Arc::new(DirectoryCatalog::new(root));
            build_engine(catalog.clone(), catalog, config)?
        }
        None => {
            let catalog = Arc::new(StaticCatalog::new());
            build_engine(catalog.clone(), catalog, config)?
        }
    };
    let response = engine.analyze_direct(&request)?;
    write_json(&response)
}

/// `tripwire rules`
pub fn rules(args: &RulesArgs, config: &Config) -> Result<()> {
    let catalog = Arc::new(DirectoryCatalog::new(&args.root));
    let engine = build_engine(catalog.clone(), catalog, config)?;

    let mut sink: Box<dyn MatchSink> = match &args.output_dir {
        Some(dir) => Box::new(JsonLinesSink::new(dir)),
        None => Box::new(WriterSink::new(io::stdout().lock())),
    };
    let mut buffer = MatchBuffer::new(config.output.max_buffer_bytes);
    let cancel = AtomicBool::new(false);
    let batch_size = args.batch_size.max(1);
    let mut batch = Vec::with_capacity(batch_size);
    let mut stats = RunStats::default();

    for (n, line) in io::stdin().lock().lines().enumerate() {
        let line = line.context("failed to read events")?;
        if line.trim().is_empty() {
            continue;
        }
        match parse_event(&line, args.log_type.as_deref()) {
            Ok(event) => batch.push(event),
            Err(reason) => {
                warn!(line = n + 1, reason = %format!("{reason:#}"), "skipping invalid event");
                stats.skipped += 1;
            }
        }
        if batch.len() >= batch_size {
            process(&engine, &batch, &cancel, &mut buffer, sink.as_mut(), &mut stats)?;
            batch.clear();
        }
    }
    process(&engine, &batch, &cancel, &mut buffer, sink.as_mut(), &mut stats)?;
    buffer.flush(sink.as_mut()).context("failed to write matches")?;

    info!(
        events = stats.events,
        matches = stats.matches,
        errors = stats.errors,
        failed = stats.failed,
        skipped = stats.skipped,
        "rule run complete"
    );
    Ok(())
}

#[derive(Debug, Default)]
struct RunStats {
    events: usize,
    matches: usize,
    errors: usize,
    failed: usize,
    skipped: usize,
}

fn build_engine(
    analysis: Arc<dyn AnalysisCatalog>,
    outputs: Arc<dyn OutputsCatalog>,
    config: &Config,
) -> Result<Engine> {
    let interpreter = Arc::new(ExpressionInterpreter::from_config(&config.execution));
    let (engine, report) =
        Engine::new(analysis, outputs, interpreter, config).context("failed to load the catalog")?;
    for failure in &report.failures {
        warn!(kind = failure.kind, id = ?failure.id, error = %failure.error, "catalog entry not loaded");
    }
    info!(
        rules = report.rules_loaded,
        data_models = report.data_models_loaded,
        destinations = report.destinations_loaded,
        workers = engine.worker_threads(),
        "engine ready"
    );
    Ok(engine)
}

fn process(
    engine: &Engine,
    batch: &[BatchEvent],
    cancel: &AtomicBool,
    buffer: &mut MatchBuffer,
    sink: &mut dyn MatchSink,
    stats: &mut RunStats,
) -> Result<()> {
    if batch.is_empty() {
        return Ok(());
    }
    stats.events += batch.len();
    for (event, outcome) in batch.iter().zip(engine.analyze_batch(batch, cancel)) {
        match outcome {
            Ok(results) => {
                for result in results {
                    if result.is_error() {
                        stats.errors += 1;
                    } else {
                        stats.matches += 1;
                    }
                    buffer.add(result, sink).context("failed to write matches")?;
                }
            }
            Err(e) => {
                warn!(log_type = %event.log_type, error = %e, "event not evaluated");
                stats.failed += 1;
            }
        }
    }
    Ok(())
}

/// Parse one JSON-lines event. The log type comes from `log_type` when
/// given, otherwise from the event's `p_log_type`.
fn parse_event(line: &str, log_type: Option<&str>) -> Result<BatchEvent> {
    let event: Value = serde_json::from_str(line).context("invalid JSON")?;
    if !event.is_object() {
        bail!("event is not a JSON object");
    }
    let log_type = match log_type {
        Some(log_type) => log_type.to_string(),
        None => match event.get("p_log_type").and_then(Value::as_str) {
            Some(log_type) => log_type.to_string(),
            None => bail!("event has no `p_log_type` and no --log-type was given"),
        },
    };
    Ok(BatchEvent::new(log_type, event))
}

fn write_json<T: Serialize>(value: &T) -> Result<()> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer(&mut stdout, value).context("failed to write response")?;
    writeln!(stdout)?;
    stdout.flush()?;
    Ok(())
}
