mod cli;
mod commands;
mod config;

use anyhow::Result;
use clap::Parser;

use crate::cli::{CliArgs, Command};

fn main() -> Result<()> {
    // Logs go to stderr; stdout carries the protocol.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    tripwire_core::config::load_dotenv();
    let args = CliArgs::parse();
    let config = config::load(&args)?;

    match &args.command {
        Command::Policy => commands::policy(&config),
        Command::Rules(rules) => commands::rules(rules, &config),
        Command::Test(test) => commands::test(test, &config),
    }
}
