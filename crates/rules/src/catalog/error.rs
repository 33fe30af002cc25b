//! Error types and load result structures for catalogs.

use std::path::PathBuf;

/// Errors that can occur while reading a catalog.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    /// Filesystem I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parse/deserialization error.
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON parse/deserialization error.
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    /// Descriptor validation error (e.g. missing id).
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Result alias for catalog operations.
pub type Result<T> = std::result::Result<T, CatalogError>;

/// Outcome of loading a single descriptor file.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadResult {
    /// Path to the file that was loaded.
    pub path: PathBuf,
    /// Status of the load attempt.
    pub status: LoadStatus,
}

/// Status of a single file load attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadStatus {
    /// Descriptor was successfully loaded.
    Loaded { id: String },
    /// File was skipped (dotfile, unsupported extension, disabled).
    Skipped { reason: String },
    /// Parse or validation error occurred.
    Failed { error: String },
}
