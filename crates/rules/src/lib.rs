//! Detection and compliance rule engine.
//!
//! This crate provides:
//! - Rule, policy and field model descriptors with validation
//! - Filesystem and in-memory catalogs of enabled units and destinations
//! - A unit runner that applies output validation, truncation and fallbacks
//! - A batch detection engine producing alert candidates
//! - Compliance evaluation of resources against policies
//! - Buffered, grouped output of alert candidates
//!
//! Script evaluation is abstracted behind [`script::Interpreter`].

pub mod catalog;
pub mod destination;
pub mod engine;
pub mod event;
pub mod field_model;
pub mod output;
pub mod policy;
pub mod result;
pub mod runner;
pub mod script;
pub mod unit;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use catalog::{AnalysisCatalog, DirectoryCatalog, OutputsCatalog, StaticCatalog};
pub use engine::{BatchEvent, Engine, EngineError, EngineResult, LoadReport};
pub use output::{AlertMerger, JsonLinesSink, MatchBuffer, MatchSink, WriterSink};
pub use policy::{PolicyRequest, PolicyResponse, PolicySet};
pub use runner::{RunMode, UnitRunner};
pub use script::{FailureKind, Interpreter, Script, ScriptFailure};
pub use unit::{Unit, UnitDescriptor, UnitKind};
