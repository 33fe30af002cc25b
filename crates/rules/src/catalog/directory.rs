//! Directory-backed catalog: descriptor files on disk.
//!
//! Layout under the root:
//! - `rules/**/*.{yml,yaml,json}`: one rule descriptor per file
//! - `data_models/**/*.{yml,yaml,json}`: one data model descriptor per file
//! - `outputs.json` or `outputs.yml`: list of destination configurations

use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::error::{CatalogError, LoadResult, LoadStatus, Result};
use super::{AnalysisCatalog, OutputsCatalog};
use crate::field_model::FieldModelDescriptor;
use crate::unit::UnitDescriptor;

const RULES_DIR: &str = "rules";
const DATA_MODELS_DIR: &str = "data_models";
const OUTPUTS_FILES: [&str; 3] = ["outputs.json", "outputs.yml", "outputs.yaml"];

/// Descriptors that carry an id and an enabled flag.
trait Descriptor: DeserializeOwned {
    fn id(&self) -> &str;
    fn enabled(&self) -> bool;
}

impl Descriptor for UnitDescriptor {
    fn id(&self) -> &str {
        &self.id
    }
    fn enabled(&self) -> bool {
        self.enabled
    }
}

impl Descriptor for FieldModelDescriptor {
    fn id(&self) -> &str {
        &self.id
    }
    fn enabled(&self) -> bool {
        self.enabled
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Yaml,
    Json,
}

impl Format {
    fn of(path: &Path) -> Option<Format> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("yml") | Some("yaml") => Some(Format::Yaml),
            Some("json") => Some(Format::Json),
            _ => None,
        }
    }
}

/// Filesystem-backed analysis and outputs catalog.
///
/// Every call rescans the directory, so a reload picks up edits.
#[derive(Debug, Clone)]
pub struct DirectoryCatalog {
    root: PathBuf,
}

impl DirectoryCatalog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Scan `rules/` and report the outcome of every file.
    pub fn scan_rules(&self) -> Result<(Vec<UnitDescriptor>, Vec<LoadResult>)> {
        scan(&self.root.join(RULES_DIR))
    }

    /// Scan `data_models/` and report the outcome of every file.
    pub fn scan_data_models(&self) -> Result<(Vec<FieldModelDescriptor>, Vec<LoadResult>)> {
        scan(&self.root.join(DATA_MODELS_DIR))
    }

    /// Parse a single descriptor file.
    pub fn load_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
        let contents = fs::read_to_string(path)?;
        parse(path, &contents)
    }
}

impl AnalysisCatalog for DirectoryCatalog {
    fn enabled_rules(&self) -> Result<Vec<UnitDescriptor>> {
        let (rules, results) = self.scan_rules()?;
        log_failures(&results);
        Ok(rules)
    }

    fn enabled_data_models(&self) -> Result<Vec<FieldModelDescriptor>> {
        let (models, results) = self.scan_data_models()?;
        log_failures(&results);
        Ok(models)
    }
}

impl OutputsCatalog for DirectoryCatalog {
    fn outputs(&self) -> Result<Vec<Value>> {
        for name in OUTPUTS_FILES {
            let path = self.root.join(name);
            if !path.is_file() {
                continue;
            }
            let outputs: Vec<Value> = Self::load_file(&path)?;
            info!(path = %path.display(), count = outputs.len(), "loaded outputs");
            return Ok(outputs);
        }
        debug!(root = %self.root.display(), "no outputs file, using no destinations");
        Ok(Vec::new())
    }
}

fn parse<T: DeserializeOwned>(path: &Path, contents: &str) -> Result<T> {
    match Format::of(path) {
        Some(Format::Json) => Ok(serde_json::from_str(contents)?),
        _ => Ok(serde_yaml::from_str(contents)?),
    }
}

fn log_failures(results: &[LoadResult]) {
    for result in results {
        if let LoadStatus::Failed { error } = &result.status {
            warn!(path = %result.path.display(), error = %error, "skipping catalog file");
        }
    }
}

/// Recursively load every enabled descriptor below `dir`. A missing
/// directory yields nothing.
fn scan<T: Descriptor>(dir: &Path) -> Result<(Vec<T>, Vec<LoadResult>)> {
    let mut descriptors = Vec::new();
    let mut results = Vec::new();
    if dir.is_dir() {
        scan_dir_recursive(dir, &mut descriptors, &mut results)?;
    } else {
        debug!(path = %dir.display(), "catalog directory does not exist");
    }
    Ok((descriptors, results))
}

fn scan_dir_recursive<T: Descriptor>(
    dir: &Path,
    descriptors: &mut Vec<T>,
    results: &mut Vec<LoadResult>,
) -> Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) => {
            warn!(path = %dir.display(), error = %e, "failed to read directory");
            return Ok(());
        }
    };

    let mut paths = entries
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<Vec<_>>>()?;
    paths.sort();

    for path in paths {
        // Skip dotfiles/dotdirs
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            if name.starts_with('.') {
                if path.is_file() {
                    results.push(LoadResult {
                        path,
                        status: LoadStatus::Skipped {
                            reason: "dotfile".to_string(),
                        },
                    });
                }
                continue;
            }
        }

        if path.is_dir() {
            scan_dir_recursive(&path, descriptors, results)?;
            continue;
        }

        if Format::of(&path).is_none() {
            results.push(LoadResult {
                path,
                status: LoadStatus::Skipped {
                    reason: "not a YAML or JSON file".to_string(),
                },
            });
            continue;
        }

        match load_descriptor::<T>(&path) {
            Ok(descriptor) if !descriptor.enabled() => {
                debug!(id = %descriptor.id(), path = %path.display(), "skipping disabled descriptor");
                results.push(LoadResult {
                    path,
                    status: LoadStatus::Skipped {
                        reason: "disabled".to_string(),
                    },
                });
            }
            Ok(descriptor) => {
                let id = descriptor.id().to_string();
                info!(id = %id, path = %path.display(), "loaded descriptor");
                descriptors.push(descriptor);
                results.push(LoadResult {
                    path,
                    status: LoadStatus::Loaded { id },
                });
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to load descriptor file");
                results.push(LoadResult {
                    path,
                    status: LoadStatus::Failed {
                        error: e.to_string(),
                    },
                });
            }
        }
    }

    Ok(())
}

fn load_descriptor<T: Descriptor>(path: &Path) -> Result<T> {
    let descriptor: T = DirectoryCatalog::load_file(path)?;
    if descriptor.id().is_empty() {
        return Err(CatalogError::Validation("descriptor id must not be empty".to_string()));
    }
    Ok(descriptor)
}
