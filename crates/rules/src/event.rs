//! Read-only event view with logical-field lookup.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::field_model::{FieldModel, LookupError};
use crate::script::Mocks;

/// A raw record plus the field model for its category.
///
/// The record is shared and never mutated; every unit evaluated against the
/// same event sees identical input.
#[derive(Debug, Clone)]
pub struct EventView {
    raw: Arc<Value>,
    model: Option<Arc<FieldModel>>,
    mocks: Arc<Mocks>,
    timeout: Duration,
}

impl EventView {
    pub fn new(raw: Arc<Value>, model: Option<Arc<FieldModel>>, timeout: Duration) -> Self {
        Self {
            raw,
            model,
            mocks: Arc::new(Mocks::new()),
            timeout,
        }
    }

    /// Mock bindings forwarded to field derivations.
    pub fn with_mocks(mut self, mocks: Arc<Mocks>) -> Self {
        self.mocks = mocks;
        self
    }

    pub fn raw(&self) -> &Value {
        &self.raw
    }

    pub fn shared_raw(&self) -> Arc<Value> {
        Arc::clone(&self.raw)
    }

    pub fn model(&self) -> Option<&FieldModel> {
        self.model.as_deref()
    }

    pub fn mocks(&self) -> &Mocks {
        &self.mocks
    }

    /// Direct key access on the raw record.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.raw.get(key)
    }

    /// Resolve a logical field through the category's field model.
    pub fn udm(&self, name: &str) -> Result<Option<Value>, LookupError> {
        let model = self.model.as_ref().ok_or(LookupError::NoFieldModel)?;
        model.lookup(&self.raw, name, &self.mocks, self.timeout)
    }
}
