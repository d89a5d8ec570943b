//! Git-mode operations: sync with automatic rollback, operator rollback,
//! history and metrics.

use async_trait::async_trait;
use tracing::{error, info, warn};

use super::core::{ManagerInner, PolicyManager};
use super::state::ManagerState;
use crate::error::{PolicyError, Result};
use crate::git::{CommitInfo, PullResult, RepositoryMetrics, SyncTarget};

impl PolicyManager {
    /// Pull now and reload if HEAD moved. A reload failure rolls the working
    /// copy back to the pre-pull commit and returns the reload error.
    ///
    /// Unlike the poller, this retries a remote head that was rejected earlier.
    pub async fn force_sync(&self) -> Result<PullResult> {
        let _op = self.inner.op_lock.lock().await;
        self.inner.ensure_open()?;
        self.inner.sync_locked(false).await
    }

    /// Reset the working copy to `sha` and reload from it.
    ///
    /// If the policies at `sha` fail to load, the working copy is reset to
    /// the commit the served policies came from and the reload error is
    /// returned.
    pub async fn rollback_to_commit(&self, sha: &str) -> Result<CommitInfo> {
        let _op = self.inner.op_lock.lock().await;
        self.inner.ensure_open()?;
        let git = self.inner.git_source()?.clone();
        let last_good = self.inner.status().last_good_commit.clone();

        let commit = git.rollback(sha).await?;
        if let Err(reload_err) = self.inner.reload_locked().await {
            warn!(
                commit = %commit.short_sha(),
                error = %reload_err,
                "policies at rollback target failed to load; restoring working copy"
            );
            return Err(match last_good {
                Some(good) => self.inner.restore_commit(&good, reload_err).await,
                None => reload_err,
            });
        }
        {
            let mut status = self.inner.status_mut();
            status.healthy = true;
            status.rejected_commit = None;
        }
        info!(commit = %commit.short_sha(), "rolled back policies");
        Ok(commit)
    }

    pub async fn get_current_commit(&self) -> Result<CommitInfo> {
        let git = self.inner.git_source()?;
        Ok(git.current_commit().await?)
    }

    pub async fn get_commit_history(&self, limit: usize) -> Result<Vec<CommitInfo>> {
        let git = self.inner.git_source()?;
        Ok(git.commit_history(limit).await?)
    }

    pub fn get_git_metrics(&self) -> Result<RepositoryMetrics> {
        Ok(self.inner.git_source()?.metrics())
    }
}

impl ManagerInner {
    /// Pull → reload → rollback-on-failure. Caller holds `op_lock`.
    ///
    /// With `skip_rejected`, a remote head that already failed to load is
    /// left alone until the remote moves on.
    pub async fn sync_locked(&self, skip_rejected: bool) -> Result<PullResult> {
        let git = self.git_source()?.clone();
        let skip = if skip_rejected {
            self.status().rejected_commit.clone()
        } else {
            None
        };

        let pull = git.pull_unless(skip.as_deref()).await?;
        if !pull.changed() {
            return Ok(pull);
        }

        let reload_err = match self.reload_locked().await {
            Ok(()) => {
                let mut status = self.status_mut();
                status.healthy = true;
                status.rejected_commit = None;
                return Ok(pull);
            }
            Err(e) => e,
        };

        warn!(
            commit = %pull.current,
            previous = %pull.previous,
            error = %reload_err,
            "pulled policies failed to load; rolling back"
        );
        let err = self.restore_commit(&pull.previous, reload_err).await;
        if !matches!(err, PolicyError::SyncRollback { .. }) {
            self.status_mut().rejected_commit = Some(pull.current.clone());
        }
        Err(err)
    }

    /// Reset the working copy to `target` after a failed reload and return
    /// the error to report. Caller holds `op_lock`.
    ///
    /// When the reset fails too, the manager is marked unhealthy and both
    /// errors come back as [`PolicyError::SyncRollback`].
    pub async fn restore_commit(&self, target: &str, reload_err: PolicyError) -> PolicyError {
        let git = match self.git_source() {
            Ok(git) => git.clone(),
            Err(_) => return reload_err,
        };
        match git.rollback(target).await {
            Ok(_) => {
                let mut status = self.status_mut();
                // The working copy matches the served set again.
                if status.state == ManagerState::Stale && status.last_good.is_some() {
                    status.state = ManagerState::Loaded;
                }
                reload_err
            }
            Err(rollback_err) => {
                self.status_mut().healthy = false;
                error!(
                    commit = %target,
                    error = %rollback_err,
                    "restoring the working copy failed; manager is unhealthy"
                );
                PolicyError::SyncRollback {
                    reload: Box::new(reload_err),
                    rollback: Box::new(rollback_err.into()),
                }
            }
        }
    }
}

#[async_trait]
impl SyncTarget for ManagerInner {
    async fn sync(&self) -> Result<PullResult> {
        let _op = self.op_lock.lock().await;
        self.ensure_open()?;
        self.sync_locked(true).await
    }
}
