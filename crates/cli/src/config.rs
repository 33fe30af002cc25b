use anyhow::{Context, Result};
use tripwire_core::Config;

use crate::cli::CliArgs;

/// Build the runtime config from the environment plus CLI overrides.
pub fn load(args: &CliArgs) -> Result<Config> {
    let mut config = Config::for_profile(&args.profile);
    if let Some(workers) = args.workers {
        config.execution.worker_threads = workers;
    }
    config.validate().context("invalid configuration")?;
    config.log_summary();
    Ok(config)
}
