use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Detection and compliance rule engine.
///
/// Requests are read from stdin and responses written to stdout; logs go
/// to stderr.
#[derive(Parser, Debug)]
#[command(name = "tripwire", about = "Detection and compliance rule engine")]
pub struct CliArgs {
    /// Config profile; every key is looked up as `<PROFILE>_<KEY>` first
    #[arg(long, env = "TRIPWIRE_PROFILE", default_value = "", global = true)]
    pub profile: String,

    /// Worker thread override (0 = available parallelism)
    #[arg(long, global = true)]
    pub workers: Option<usize>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Evaluate policies against resources: `{"policies": [...], "resources": [...]}`
    Policy,

    /// Run the rule catalog over JSON-lines events
    Rules(RulesArgs),

    /// Evaluate one rule against test events: `{"rules": [rule], "events": [...]}`
    Test(TestArgs),
}

#[derive(Args, Debug)]
pub struct RulesArgs {
    /// Catalog root holding `rules/`, `data_models/` and `outputs.json`
    #[arg(long, env = "TRIPWIRE_ROOT")]
    pub root: PathBuf,

    /// Log type for every event; otherwise each event's `p_log_type` is used
    #[arg(long)]
    pub log_type: Option<String>,

    /// Directory for grouped match files (stdout when unset)
    #[arg(long, env = "TRIPWIRE_OUTPUT_DIR")]
    pub output_dir: Option<PathBuf>,

    /// Events evaluated per parallel batch
    #[arg(long, default_value = "1000")]
    pub batch_size: usize,
}

#[derive(Args, Debug)]
pub struct TestArgs {
    /// Catalog root providing data models and destinations
    #[arg(long, env = "TRIPWIRE_ROOT")]
    pub root: Option<PathBuf>,
}
