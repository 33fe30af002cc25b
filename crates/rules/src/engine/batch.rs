//! Parallel evaluation of independent events on the engine's worker pool.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use rayon::prelude::*;
use serde_json::Value;
use tracing::info;

use super::{Engine, EngineError, EngineResult};

/// One event and the log type it was parsed as.
#[derive(Debug, Clone)]
pub struct BatchEvent {
    pub log_type: String,
    pub event: Arc<Value>,
}

impl BatchEvent {
    pub fn new(log_type: impl Into<String>, event: Value) -> Self {
        Self {
            log_type: log_type.into(),
            event: Arc::new(event),
        }
    }
}

impl Engine {
    /// Evaluate `events` in parallel. Outcomes are returned in input order.
    pub fn analyze_batch(
        &self,
        events: &[BatchEvent],
        cancel: &AtomicBool,
    ) -> Vec<Result<Vec<EngineResult>, EngineError>> {
        let outcomes: Vec<_> = self.pool.install(|| {
            events
                .par_iter()
                .map(|item| self.analyze_until(&item.log_type, Arc::clone(&item.event), cancel))
                .collect()
        });

        let matches: usize = outcomes.iter().filter_map(|o| o.as_ref().ok()).map(Vec::len).sum();
        let failed = outcomes.iter().filter(|o| o.is_err()).count();
        info!(events = events.len(), matches, failed, "batch analyzed");
        outcomes
    }

    /// Number of worker threads in the pool.
    pub fn worker_threads(&self) -> usize {
        self.pool.current_num_threads()
    }
}
