//! Subcommand handlers. Each returns once its output is printed.

use anyhow::{Context, Result};
use serde_json::json;
use tokio::sync::watch;
use tollgate_core::Policy;
use tollgate_policy::PolicyManager;
use tracing::info;

use crate::cli::GitCommand;

pub async fn validate(manager: &PolicyManager, as_json: bool) -> Result<()> {
    let diagnostics = manager
        .dry_run_report()
        .await
        .context("policy validation failed")?;
    if as_json {
        println!("{}", json!({ "valid": true, "warnings": diagnostics.warnings }));
    } else {
        for warning in &diagnostics.warnings {
            println!("warning: {warning}");
        }
        println!("policies are valid");
    }
    Ok(())
}

pub async fn list(manager: &PolicyManager, as_json: bool) -> Result<()> {
    manager.load_policies().await.context("failed to load policies")?;
    let policies = manager.get_all_policies();
    let stats = manager.registry().stats();

    if as_json {
        let entries: Vec<_> = policies.iter().map(|p| policy_json(p)).collect();
        println!(
            "{}",
            json!({
                "version": stats.version,
                "loaded_at": stats.loaded_at,
                "rules": stats.rules,
                "enabled_rules": stats.enabled_rules,
                "policies": entries,
            })
        );
        return Ok(());
    }

    for policy in &policies {
        println!(
            "{:<32} {:<10} {:>3} rules  {}",
            policy.name,
            policy.version,
            policy.rule_count(),
            policy
                .source()
                .map(|p| p.display().to_string())
                .unwrap_or_default()
        );
    }
    println!(
        "{} policies, {} rules ({} enabled), version {}",
        stats.policies, stats.rules, stats.enabled_rules, stats.version
    );
    for warning in manager.last_diagnostics().warnings {
        println!("warning: {warning}");
    }
    Ok(())
}

/// Load, then block in the watch loop until Ctrl-C.
pub async fn watch(manager: &PolicyManager) -> Result<()> {
    manager.load_policies().await.context("initial load failed")?;
    info!(
        policies = manager.get_all_policies().len(),
        version = %manager.get_policy_version(),
        "watching for policy changes (Ctrl-C to stop)"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
        }
        let _ = shutdown_tx.send(true);
    });

    manager.watch(shutdown_rx).await?;
    manager.close().await?;
    Ok(())
}

pub async fn git(manager: &PolicyManager, command: GitCommand, as_json: bool) -> Result<()> {
    match command {
        GitCommand::History { limit } => {
            manager.load_policies().await.context("failed to open policy repository")?;
            let commits = manager.get_commit_history(limit).await?;
            if as_json {
                println!("{}", json!(commits));
            } else {
                for commit in &commits {
                    println!(
                        "{}  {}  {:<20}  {}",
                        commit.short_sha(),
                        commit.timestamp.format("%Y-%m-%d %H:%M"),
                        commit.author,
                        commit.message
                    );
                }
            }
        }
        GitCommand::Sync => {
            manager.load_policies().await.context("failed to load policies")?;
            let pull = manager.force_sync().await.context("sync failed")?;
            if as_json {
                println!("{}", json!(pull));
            } else if pull.changed() {
                println!(
                    "updated {} -> {} ({} files changed)",
                    short(&pull.previous),
                    short(&pull.current),
                    pull.changed_files.len()
                );
            } else {
                println!("already up to date at {}", short(&pull.current));
            }
        }
        GitCommand::Rollback { sha } => {
            manager.load_policies().await.context("failed to load policies")?;
            let commit = manager
                .rollback_to_commit(&sha)
                .await
                .with_context(|| format!("rollback to {sha} failed"))?;
            if as_json {
                println!("{}", json!(commit));
            } else {
                println!(
                    "rolled back to {} ({}), {} policies loaded",
                    commit.short_sha(),
                    commit.message,
                    manager.get_all_policies().len()
                );
            }
        }
        GitCommand::Status => {
            // Opening the working copy can fail on bad commits; metrics still help then.
            let load = manager.load_policies().await;
            let metrics = manager.get_git_metrics()?;
            let health = manager.health();
            if as_json {
                println!("{}", json!({ "health": health, "metrics": metrics }));
            } else {
                println!("state:        {}", health.state);
                println!("healthy:      {}", health.healthy);
                println!("policies:     {} (version {})", health.policies, health.version);
                println!(
                    "commit:       {}",
                    metrics.last_commit.as_deref().map(short).unwrap_or("-")
                );
                if let Some(rejected) = &health.rejected_commit {
                    println!("rejected:     {}", short(rejected));
                }
                if let Some(error) = &health.last_error {
                    println!("last error:   {error}");
                }
            }
            load.context("failed to load policies")?;
        }
    }
    manager.close().await?;
    Ok(())
}

fn policy_json(policy: &Policy) -> serde_json::Value {
    json!({
        "name": policy.name,
        "version": policy.version,
        "rules": policy.rule_count(),
        "enabled_rules": policy.enabled_rule_count(),
        "includes": policy.includes,
        "source": policy.source().map(|p| p.display().to_string()),
    })
}

fn short(sha: &str) -> &str {
    sha.get(..8).unwrap_or(sha)
}
