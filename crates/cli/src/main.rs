mod cli;
mod commands;
mod config;

use anyhow::{Context, Result};
use clap::Parser;
use tollgate_policy::PolicyManager;

use crate::cli::{CliArgs, Command};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args = CliArgs::parse();
    let config = config::load(args.config.as_deref(), args.path.as_deref())?;
    config.log_summary();

    let manager = PolicyManager::new(config).context("failed to create policy manager")?;

    match args.command {
        Command::Validate => commands::validate(&manager, args.json).await,
        Command::List => commands::list(&manager, args.json).await,
        Command::Watch => commands::watch(&manager).await,
        Command::Git(command) => commands::git(&manager, command, args.json).await,
    }
}
