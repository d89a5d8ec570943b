//! Local working copy of the policy repository, driven through the `git` CLI.

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::process::Command;
use tollgate_core::config::GitConfig;
use tracing::{debug, info, warn};
use url::Url;

use super::types::{CommitInfo, PullResult, RepositoryMetrics, LOG_FORMAT};
use crate::error::GitError;

type GitResult<T> = std::result::Result<T, GitError>;

/// Working copy of the configured remote branch.
///
/// Every public operation holds an internal async lock, so concurrent callers
/// never interleave git commands against the same checkout. Each command is
/// bounded by `git.poll.timeout_secs` and killed when it overruns.
pub struct GitRepository {
    config: GitConfig,
    timeout: Duration,
    lock: tokio::sync::Mutex<()>,
    metrics: Mutex<RepositoryMetrics>,
    opened: AtomicBool,
}

impl std::fmt::Debug for GitRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitRepository")
            .field("repository", &redact_url(&self.config.repository))
            .field("branch", &self.config.branch)
            .field("local_path", &self.config.clone.local_path)
            .finish_non_exhaustive()
    }
}

impl GitRepository {
    pub fn new(config: GitConfig) -> Self {
        let timeout = config.poll.timeout();
        Self {
            config,
            timeout,
            lock: tokio::sync::Mutex::new(()),
            metrics: Mutex::new(RepositoryMetrics::default()),
            opened: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &GitConfig {
        &self.config
    }

    pub fn local_path(&self) -> &Path {
        &self.config.clone.local_path
    }

    /// Policy file or directory inside the working copy.
    pub fn policy_path(&self) -> PathBuf {
        self.config.policy_path()
    }

    pub fn is_cloned(&self) -> bool {
        self.local_path().join(".git").exists()
    }

    pub fn metrics(&self) -> RepositoryMetrics {
        self.metrics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn with_metrics(&self, f: impl FnOnce(&mut RepositoryMetrics)) {
        f(&mut self.metrics.lock().unwrap_or_else(PoisonError::into_inner));
    }

    // ── Operations ──────────────────────────────────────────────

    /// Clone the branch into the local path, or reuse an existing checkout.
    ///
    /// With `clone.clean_on_start` a checkout left by a previous run is
    /// removed before the first clone.
    pub async fn clone_or_open(&self) -> GitResult<CommitInfo> {
        let _guard = self.lock.lock().await;
        let local = self.local_path().to_path_buf();

        if self.config.clone.clean_on_start && !self.opened.load(Ordering::Acquire) && local.exists()
        {
            info!(path = %local.display(), "removing existing working copy");
            tokio::fs::remove_dir_all(&local).await?;
        }

        if self.is_cloned() {
            self.git(["rev-parse", "--is-inside-work-tree"]).await?;
            debug!(path = %local.display(), "reusing existing working copy");
        } else {
            if let Some(parent) = local.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await?;
            }
            let started = Instant::now();
            let mut args: Vec<OsString> = vec![
                "clone".into(),
                "--quiet".into(),
                "--branch".into(),
                self.config.branch.clone().into(),
                "--single-branch".into(),
            ];
            if self.config.clone.depth > 0 {
                args.push("--depth".into());
                args.push(self.config.clone.depth.to_string().into());
            }
            args.push("--".into());
            args.push(self.remote_url().into());
            args.push(local.clone().into());
            self.run(None, &args).await?;

            // Credentials only ever live in the command line, never in .git/config.
            if self.config.auth.token.is_some() {
                self.git(["remote", "set-url", "origin", self.config.repository.as_str()])
                    .await?;
            }

            let elapsed = started.elapsed();
            self.with_metrics(|m| m.last_clone_duration = Some(elapsed));
            info!(
                repository = %redact_url(&self.config.repository),
                branch = %self.config.branch,
                path = %local.display(),
                elapsed_ms = elapsed.as_millis() as u64,
                "cloned policy repository"
            );
        }

        let head = self.head_commit().await?;
        self.opened.store(true, Ordering::Release);
        self.with_metrics(|m| m.last_commit = Some(head.sha.clone()));
        Ok(head)
    }

    /// Fetch the remote branch and fast-forward to it. Local modifications or a
    /// diverged history fail the pull instead of being discarded.
    pub async fn pull(&self) -> GitResult<PullResult> {
        self.pull_unless(None).await
    }

    /// Like [`pull`](Self::pull), but leaves HEAD alone when the fetched
    /// remote head equals `skip`.
    pub async fn pull_unless(&self, skip: Option<&str>) -> GitResult<PullResult> {
        let _guard = self.lock.lock().await;
        let started = Instant::now();
        let result = self.pull_locked(skip).await;
        let elapsed = started.elapsed();

        self.with_metrics(|m| match &result {
            Ok(pull) => {
                m.successful_pulls += 1;
                m.last_pull_duration = Some(elapsed);
                m.last_pull_at = Some(Utc::now());
                m.last_commit = Some(pull.current.clone());
            }
            Err(_) => m.failed_pulls += 1,
        });
        match &result {
            Ok(pull) if pull.changed() => info!(
                from = %short(&pull.previous),
                to = %short(&pull.current),
                files = pull.changed_files.len(),
                "pulled policy changes"
            ),
            Ok(_) => debug!("policy repository up to date"),
            Err(e) => warn!(error = %e, "policy pull failed"),
        }
        result
    }

    async fn pull_locked(&self, skip: Option<&str>) -> GitResult<PullResult> {
        self.ensure_cloned()?;
        let previous = self.rev_parse("HEAD").await?;

        let url = self.remote_url();
        self.git([
            "fetch",
            "--quiet",
            "--no-tags",
            "--",
            url.as_str(),
            self.config.branch.as_str(),
        ])
        .await?;
        let fetched = self.rev_parse("FETCH_HEAD").await?;

        if fetched == previous || skip == Some(fetched.as_str()) {
            if fetched != previous {
                debug!(commit = %short(&fetched), "remote head was rejected earlier; skipping");
            }
            return Ok(PullResult::unchanged(previous));
        }

        let dirty = self
            .git(["status", "--porcelain", "--untracked-files=no"])
            .await?;
        if !dirty.trim().is_empty() {
            return Err(GitError::CommandFailed {
                command: "merge".into(),
                stderr: "working copy has local modifications".into(),
            });
        }

        self.git(["merge", "--ff-only", "--quiet", "FETCH_HEAD"]).await?;
        let current = self.rev_parse("HEAD").await?;
        let changed_files = self.diff_names(&previous, &current).await?;
        Ok(PullResult {
            previous,
            current,
            changed_files,
        })
    }

    /// Hard-reset the working copy to `target`.
    pub async fn rollback(&self, target: &str) -> GitResult<CommitInfo> {
        validate_ref(target)?;
        let _guard = self.lock.lock().await;
        let result = self.rollback_locked(target).await;
        self.with_metrics(|m| match &result {
            Ok(head) => {
                m.rollbacks += 1;
                m.last_commit = Some(head.sha.clone());
            }
            Err(_) => m.failed_rollbacks += 1,
        });
        match &result {
            Ok(head) => info!(commit = %head.short_sha(), "rolled back working copy"),
            Err(e) => warn!(target, error = %e, "rollback failed"),
        }
        result
    }

    async fn rollback_locked(&self, target: &str) -> GitResult<CommitInfo> {
        self.ensure_cloned()?;
        let sha = self
            .rev_parse(&format!("{target}^{{commit}}"))
            .await
            .map_err(|_| GitError::InvalidRef(target.to_string()))?;
        self.git(["reset", "--hard", "--quiet", sha.as_str()]).await?;
        self.head_commit().await
    }

    pub async fn current_commit(&self) -> GitResult<CommitInfo> {
        let _guard = self.lock.lock().await;
        self.ensure_cloned()?;
        self.head_commit().await
    }

    /// Most recent `limit` commits reachable from HEAD, newest first.
    pub async fn commit_history(&self, limit: usize) -> GitResult<Vec<CommitInfo>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let _guard = self.lock.lock().await;
        self.ensure_cloned()?;
        let count = format!("--max-count={limit}");
        let out = self
            .git(["log", count.as_str(), LOG_FORMAT, "HEAD"])
            .await?;
        Ok(out.lines().filter_map(CommitInfo::parse_line).collect())
    }

    /// Paths changed between two commits.
    pub async fn changed_files(&self, from: &str, to: &str) -> GitResult<Vec<String>> {
        validate_ref(from)?;
        validate_ref(to)?;
        let _guard = self.lock.lock().await;
        self.ensure_cloned()?;
        self.diff_names(from, to).await
    }

    // ── Helpers (callers hold the lock) ─────────────────────────

    fn ensure_cloned(&self) -> GitResult<()> {
        if self.is_cloned() {
            Ok(())
        } else {
            Err(GitError::NotCloned(self.local_path().to_path_buf()))
        }
    }

    async fn head_commit(&self) -> GitResult<CommitInfo> {
        let out = self.git(["log", "-1", LOG_FORMAT, "HEAD"]).await?;
        CommitInfo::parse_line(out.trim()).ok_or_else(|| GitError::CommandFailed {
            command: "log".into(),
            stderr: format!("unexpected output: {out}"),
        })
    }

    async fn rev_parse(&self, rev: &str) -> GitResult<String> {
        self.git(["rev-parse", "--verify", "--quiet", rev])
            .await
            .map(|s| s.trim().to_string())
    }

    async fn diff_names(&self, from: &str, to: &str) -> GitResult<Vec<String>> {
        if from == to {
            return Ok(Vec::new());
        }
        let out = self.git(["diff", "--name-only", from, to, "--"]).await?;
        Ok(out
            .lines()
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Remote URL with the token injected for https remotes. Never persisted.
    fn remote_url(&self) -> String {
        let token = match self.config.auth.token.as_deref() {
            Some(t) if !t.is_empty() => t,
            _ => return self.config.repository.clone(),
        };
        match Url::parse(&self.config.repository) {
            Ok(mut url) if matches!(url.scheme(), "http" | "https") => {
                let user = self
                    .config
                    .auth
                    .username
                    .as_deref()
                    .unwrap_or("x-access-token");
                if url.set_username(user).is_err() || url.set_password(Some(token)).is_err() {
                    return self.config.repository.clone();
                }
                url.into()
            }
            _ => self.config.repository.clone(),
        }
    }

    /// Strip the token (raw and URL-encoded) from command output.
    fn redact(&self, text: &str) -> String {
        let Some(token) = self.config.auth.token.as_deref().filter(|t| !t.is_empty()) else {
            return text.to_string();
        };
        let mut out = text.replace(token, "***");
        if let Ok(url) = Url::parse(&self.remote_url()) {
            if let Some(encoded) = url.password().filter(|p| *p != token) {
                out = out.replace(encoded, "***");
            }
        }
        out
    }

    async fn git<I, S>(&self, args: I) -> GitResult<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let args: Vec<OsString> = args.into_iter().map(|a| a.as_ref().to_os_string()).collect();
        self.run(Some(self.local_path()), &args).await
    }

    async fn run(&self, cwd: Option<&Path>, args: &[OsString]) -> GitResult<String> {
        let command = args
            .first()
            .map(|a| a.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut cmd = Command::new("git");
        if let Some(dir) = cwd {
            cmd.arg("-C").arg(dir);
        }
        cmd.args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(key) = &self.config.auth.ssh_key_path {
            cmd.env(
                "GIT_SSH_COMMAND",
                format!(
                    "ssh -i {} -o IdentitiesOnly=yes -o BatchMode=yes",
                    shell_quote(&key.to_string_lossy())
                ),
            );
        }

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(output) => output.map_err(|source| GitError::Spawn {
                command: command.clone(),
                source,
            })?,
            Err(_) => {
                return Err(GitError::Timeout {
                    command,
                    after: self.timeout,
                })
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(GitError::CommandFailed {
                command,
                stderr: self.redact(stderr.trim()),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
    }
}

/// Reject references that could be read as options or carry shell/control
/// characters. Allows hex shas, branch and tag names, and `~`/`^` suffixes.
pub fn validate_ref(reference: &str) -> GitResult<()> {
    let valid = !reference.is_empty()
        && reference.len() <= 256
        && !reference.starts_with('-')
        && !reference.contains("..")
        && reference
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '/' | '.' | '~' | '^'));
    if valid {
        Ok(())
    } else {
        Err(GitError::InvalidRef(reference.to_string()))
    }
}

/// Remote URL with any userinfo removed, for logs.
pub fn redact_url(repository: &str) -> String {
    match Url::parse(repository) {
        Ok(mut url) if url.password().is_some() || !url.username().is_empty() => {
            let _ = url.set_username("");
            let _ = url.set_password(None);
            url.into()
        }
        _ => repository.to_string(),
    }
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

fn short(sha: &str) -> &str {
    &sha[..sha.len().min(8)]
}
