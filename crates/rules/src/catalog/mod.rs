//! Sources of units, field models and destinations.
//!
//! The engine reads snapshots through [`AnalysisCatalog`] and
//! [`OutputsCatalog`]. [`StaticCatalog`] holds descriptors in memory;
//! [`DirectoryCatalog`] reads them from disk on every call.

mod directory;
mod error;


use serde_json::Value;

use crate::field_model::FieldModelDescriptor;
use crate::unit::UnitDescriptor;

pub use self::directory::DirectoryCatalog;
pub use self::error::{CatalogError, LoadResult, LoadStatus, Result};

/// Enabled rules and data models.
pub trait AnalysisCatalog: Send + Sync {
    fn enabled_rules(&self) -> Result<Vec<UnitDescriptor>>;
    fn enabled_data_models(&self) -> Result<Vec<FieldModelDescriptor>>;
}

/// Destination configurations, validated one by one by the engine.
pub trait OutputsCatalog: Send + Sync {
    fn outputs(&self) -> Result<Vec<Value>>;
}

/// In-memory catalog.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    pub rules: Vec<UnitDescriptor>,
    pub data_models: Vec<FieldModelDescriptor>,
    pub outputs: Vec<Value>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rule(mut self, rule: UnitDescriptor) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn with_data_model(mut self, model: FieldModelDescriptor) -> Self {
        self.data_models.push(model);
        self
    }

    pub fn with_output(mut self, output: Value) -> Self {
        self.outputs.push(output);
        self
    }
}

impl AnalysisCatalog for StaticCatalog {
    fn enabled_rules(&self) -> Result<Vec<UnitDescriptor>> {
        Ok(self.rules.iter().filter(|r| r.enabled).cloned().collect())
    }

    fn enabled_data_models(&self) -> Result<Vec<FieldModelDescriptor>> {
        Ok(self.data_models.iter().filter(|m| m.enabled).cloned().collect())
    }
}

impl OutputsCatalog for StaticCatalog {
    fn outputs(&self) -> Result<Vec<Value>> {
        Ok(self.outputs.clone())
    }
}
