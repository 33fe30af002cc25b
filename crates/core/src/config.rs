use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_or(profile: &str, key: &str, default: &str) -> String {
    profiled_env_opt(profile, key).unwrap_or_else(|| default.to_string())
}

fn profiled_env_usize(profile: &str, key: &str, default: usize) -> usize {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_u64(profile: &str, key: &str, default: u64) -> u64 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

// ── Defaults ──────────────────────────────────────────────────

pub const DEFAULT_MAX_DEDUP_LENGTH: usize = 1000;
pub const DEFAULT_MAX_FIELD_LENGTH: usize = 1000;
pub const DEFAULT_TRUNCATION_SUFFIX: &str = "... (truncated)";
pub const DEFAULT_INVOCATION_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_SCRIPT_FUEL: u64 = 100_000;
pub const DEFAULT_MAX_BUFFER_BYTES: usize = 100_000_000;

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub limits: LimitsConfig,
    pub execution: ExecutionConfig,
    pub output: OutputConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `TRIPWIRE_PROFILE`. When set (e.g. `PROD`),
    /// every key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("TRIPWIRE_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        Self {
            profile: p.to_string(),
            limits: LimitsConfig::from_env_profiled(p),
            execution: ExecutionConfig::from_env_profiled(p),
            output: OutputConfig::from_env_profiled(p),
        }
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Reject limit combinations the runner cannot honour.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.limits.validate()?;
        if self.execution.invocation_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "TRIPWIRE_INVOCATION_TIMEOUT_MS".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!(
            "  limits:      dedup={}, field={}, suffix={:?}",
            self.limits.max_dedup_length,
            self.limits.max_field_length,
            self.limits.truncation_suffix
        );
        tracing::info!(
            "  execution:   timeout={}ms, workers={}, fuel={}",
            self.execution.invocation_timeout_ms,
            self.execution.resolved_worker_threads(),
            self.execution.script_fuel
        );
        tracing::info!("  output:      max_buffer_bytes={}", self.output.max_buffer_bytes);
    }
}

// ── Output limits ─────────────────────────────────────────────

/// Size limits for generated alert fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    pub max_dedup_length: usize,
    pub max_field_length: usize,
    pub truncation_suffix: String,
}

impl LimitsConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            max_dedup_length: profiled_env_usize(p, "TRIPWIRE_MAX_DEDUP_LENGTH", DEFAULT_MAX_DEDUP_LENGTH),
            max_field_length: profiled_env_usize(p, "TRIPWIRE_MAX_FIELD_LENGTH", DEFAULT_MAX_FIELD_LENGTH),
            truncation_suffix: profiled_env_or(p, "TRIPWIRE_TRUNCATION_SUFFIX", DEFAULT_TRUNCATION_SUFFIX),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let suffix_len = self.truncation_suffix.chars().count();
        for (limit, max) in [("dedup", self.max_dedup_length), ("field", self.max_field_length)] {
            if suffix_len > max {
                return Err(ConfigError::SuffixTooLong { suffix_len, limit, max });
            }
        }
        Ok(())
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_dedup_length: DEFAULT_MAX_DEDUP_LENGTH,
            max_field_length: DEFAULT_MAX_FIELD_LENGTH,
            truncation_suffix: DEFAULT_TRUNCATION_SUFFIX.to_string(),
        }
    }
}

// ── Execution ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Upper bound for a single entry-point invocation.
    pub invocation_timeout_ms: u64,
    /// Worker pool size; 0 means one thread per available core.
    pub worker_threads: usize,
    /// Evaluation budget handed to the script interpreter per invocation.
    pub script_fuel: u64,
}

impl ExecutionConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            invocation_timeout_ms: profiled_env_u64(p, "TRIPWIRE_INVOCATION_TIMEOUT_MS", DEFAULT_INVOCATION_TIMEOUT_MS),
            worker_threads: profiled_env_usize(p, "TRIPWIRE_WORKER_THREADS", 0),
            script_fuel: profiled_env_u64(p, "TRIPWIRE_SCRIPT_FUEL", DEFAULT_SCRIPT_FUEL),
        }
    }

    pub fn invocation_timeout(&self) -> Duration {
        Duration::from_millis(self.invocation_timeout_ms)
    }

    pub fn resolved_worker_threads(&self) -> usize {
        if self.worker_threads > 0 {
            return self.worker_threads;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            invocation_timeout_ms: DEFAULT_INVOCATION_TIMEOUT_MS,
            worker_threads: 0,
            script_fuel: DEFAULT_SCRIPT_FUEL,
        }
    }
}

// ── Match output ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Estimated buffered bytes before the largest match group is flushed.
    pub max_buffer_bytes: usize,
}

impl OutputConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            max_buffer_bytes: profiled_env_usize(p, "TRIPWIRE_MAX_BUFFER_BYTES", DEFAULT_MAX_BUFFER_BYTES),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            max_buffer_bytes: DEFAULT_MAX_BUFFER_BYTES,
        }
    }
}
