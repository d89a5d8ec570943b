use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Operate on LLM gateway policies.
///
/// Loads policy documents from a file, a directory or a git working copy and
/// runs the same pipeline the gateway uses, so problems show up before deploy.
#[derive(Parser, Debug)]
#[command(name = "tollgate", version, about = "Policy control plane for the LLM gateway")]
pub struct CliArgs {
    /// Path to a TOML config file. Without it, config comes from TOLLGATE_* env vars.
    #[arg(long, global = true, env = "TOLLGATE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Override the policy file or directory (file mode only).
    #[arg(long, global = true)]
    pub path: Option<PathBuf>,

    /// Print machine-readable JSON instead of text.
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Load and validate without applying anything.
    Validate,
    /// Load and print the policy set.
    List,
    /// Load, then reload on every change until Ctrl-C.
    Watch,
    /// Git working copy operations.
    #[command(subcommand)]
    Git(GitCommand),
}

#[derive(Subcommand, Debug)]
pub enum GitCommand {
    /// Recent commits on the checked-out branch, newest first.
    History {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Pull now and reload; a failing commit is rolled back.
    Sync,
    /// Reset the working copy to a commit and reload from it.
    Rollback { sha: String },
    /// Pull and rollback counters for this process.
    Status,
}
