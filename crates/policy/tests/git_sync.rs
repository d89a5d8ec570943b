//! End-to-end git source tests against a local bare remote.
//!
//! Skipped when no `git` binary is on PATH.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::watch;
use tollgate_core::config::GitConfig;
use tollgate_core::{Policy, PolicyConfig};
use tollgate_policy::{ManagerState, PolicyError, PolicyManager};

fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn git(cwd: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .current_dir(cwd)
        .args([
            "-c",
            "user.name=Policy Bot",
            "-c",
            "user.email=bot@example.com",
            "-c",
            "init.defaultBranch=main",
            "-c",
            "commit.gpgsign=false",
        ])
        .args(args)
        .output()
        .expect("git runs");
    assert!(
        output.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

fn policy_yaml(name: &str, version: &str) -> String {
    format!(
        "name: {name}\nversion: {version}\nrules:\n  - name: {name}-rule\n    actions:\n      - type: allow\n"
    )
}

/// A bare remote plus a work tree that pushes to it.
struct Remote {
    _root: TempDir,
    bare: PathBuf,
    work: PathBuf,
    base: PathBuf,
}

impl Remote {
    fn new() -> Self {
        let root = TempDir::new().unwrap();
        let bare = root.path().join("remote.git");
        let work = root.path().join("work");
        fs::create_dir_all(&bare).unwrap();
        fs::create_dir_all(&work).unwrap();
        git(&bare, &["init", "--bare", "--quiet"]);
        git(&work, &["init", "--quiet"]);
        git(&work, &["symbolic-ref", "HEAD", "refs/heads/main"]);
        git(&work, &["remote", "add", "origin", bare.to_str().unwrap()]);
        let base = root.path().to_path_buf();
        Self {
            _root: root,
            bare,
            work,
            base,
        }
    }

    fn commit(&self, file: &str, body: &str, message: &str) -> String {
        let path = self.work.join(file);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, body).unwrap();
        git(&self.work, &["add", "-A"]);
        git(&self.work, &["commit", "-q", "-m", message]);
        git(&self.work, &["push", "-q", "origin", "main"]);
        git(&self.work, &["rev-parse", "HEAD"])
    }

    fn checkout(&self) -> PathBuf {
        self.base.join("checkout")
    }

    fn config(&self) -> PolicyConfig {
        let mut git = GitConfig::new(self.bare.to_str().unwrap(), self.checkout());
        git.path = PathBuf::from("policies");
        git.poll.enabled = false;
        PolicyConfig::git(git)
    }

    fn manager(&self) -> PolicyManager {
        PolicyManager::new(self.config()).unwrap()
    }
}

async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    check()
}

#[tokio::test]
async fn sync_applies_new_commits_and_rolls_back_bad_ones() {
    if !git_available() {
        eprintln!("git not available; skipping");
        return;
    }
    let remote = Remote::new();
    let first = remote.commit("policies/a.yaml", &policy_yaml("a", "1.0.0"), "add a");
    let manager = remote.manager();

    // Dry runs need a working copy.
    assert!(matches!(
        manager.validate_policies_dry_run().await,
        Err(PolicyError::Git(_))
    ));

    manager.load_policies().await.unwrap();
    assert_eq!(manager.get_policy("a").unwrap().version, "1.0.0");
    assert_eq!(manager.get_current_commit().await.unwrap().sha, first);
    assert_eq!(manager.health().last_good_commit.as_deref(), Some(first.as_str()));

    // Nothing new upstream.
    let pull = manager.force_sync().await.unwrap();
    assert!(!pull.changed());

    let second = remote.commit("policies/b.yaml", &policy_yaml("b", "1.0.0"), "add b");
    let pull = manager.force_sync().await.unwrap();
    assert!(pull.changed());
    assert_eq!(pull.current, second);
    assert_eq!(pull.changed_files, vec!["policies/b.yaml".to_string()]);
    assert!(manager.get_policy("b").is_ok());

    let bad = remote.commit("policies/c.yaml", "name: c\nversion: broken\n", "add c");
    let err = manager.force_sync().await.unwrap_err();
    assert!(matches!(err, PolicyError::Validation { .. }));

    let health = manager.health();
    assert_eq!(health.state, ManagerState::Loaded);
    assert!(health.healthy);
    assert_eq!(health.rejected_commit.as_deref(), Some(bad.as_str()));
    assert_eq!(health.policies, 2);
    assert_eq!(manager.get_current_commit().await.unwrap().sha, second);
    assert!(manager.get_policy("c").is_err());

    let metrics = manager.get_git_metrics().unwrap();
    assert_eq!(metrics.rollbacks, 1);
    assert_eq!(metrics.failed_rollbacks, 0);
    assert!(metrics.successful_pulls >= 3);
    assert!(metrics.last_clone_duration.is_some());

    // Fixing the remote clears the rejection.
    let fixed = remote.commit("policies/c.yaml", &policy_yaml("c", "1.0.0"), "fix c");
    let pull = manager.force_sync().await.unwrap();
    assert_eq!(pull.current, fixed);
    assert_eq!(manager.get_all_policies().len(), 3);
    assert!(manager.health().rejected_commit.is_none());

    manager.close().await.unwrap();
}

#[tokio::test]
async fn rollback_and_history() {
    if !git_available() {
        eprintln!("git not available; skipping");
        return;
    }
    let remote = Remote::new();
    let first = remote.commit("policies/a.yaml", &policy_yaml("a", "1.0.0"), "a v1");
    let second = remote.commit("policies/a.yaml", &policy_yaml("a", "2.0.0"), "a v2");
    let manager = remote.manager();
    manager.load_policies().await.unwrap();
    assert_eq!(manager.get_policy("a").unwrap().version, "2.0.0");

    let history = manager.get_commit_history(10).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].sha, second);
    assert_eq!(history[0].message, "a v2");
    assert_eq!(history[0].author, "Policy Bot");
    assert_eq!(history[1].sha, first);
    assert!(manager.get_commit_history(0).await.unwrap().is_empty());

    let commit = manager.rollback_to_commit(&first[..12]).await.unwrap();
    assert_eq!(commit.sha, first);
    assert_eq!(manager.get_policy("a").unwrap().version, "1.0.0");

    assert!(matches!(
        manager.rollback_to_commit("--upload-pack=evil").await,
        Err(PolicyError::Git(_))
    ));
    assert!(matches!(
        manager.rollback_to_commit("0000000000000000000000000000000000000000").await,
        Err(PolicyError::Git(_))
    ));
    assert_eq!(manager.get_policy("a").unwrap().version, "1.0.0");
}

#[tokio::test]
async fn reopening_an_existing_checkout() {
    if !git_available() {
        eprintln!("git not available; skipping");
        return;
    }
    let remote = Remote::new();
    let head = remote.commit("policies/a.yaml", &policy_yaml("a", "1.0.0"), "add a");

    remote.manager().load_policies().await.unwrap();
    let reopened = remote.manager();
    reopened.validate_policies_dry_run().await.unwrap();
    reopened.load_policies().await.unwrap();
    assert_eq!(reopened.get_current_commit().await.unwrap().sha, head);
    assert_eq!(reopened.get_all_policies().len(), 1);
}

#[tokio::test]
async fn failed_operator_rollback_restores_served_commit() {
    if !git_available() {
        eprintln!("git not available; skipping");
        return;
    }
    let remote = Remote::new();
    let bad = remote.commit("policies/a.yaml", &policy_yaml("a", "broken"), "a broken");
    let good = remote.commit("policies/a.yaml", &policy_yaml("a", "2.0.0"), "a v2");
    let manager = remote.manager();
    manager.load_policies().await.unwrap();

    let err = manager.rollback_to_commit(&bad).await.unwrap_err();
    assert!(matches!(err, PolicyError::Validation { .. }));

    assert_eq!(manager.get_current_commit().await.unwrap().sha, good);
    assert_eq!(manager.get_policy("a").unwrap().version, "2.0.0");
    let health = manager.health();
    assert!(health.healthy);
    assert_eq!(health.state, ManagerState::Loaded);
    assert_eq!(health.last_good_commit.as_deref(), Some(good.as_str()));
    assert_eq!(manager.get_git_metrics().unwrap().rollbacks, 2);
}

#[tokio::test]
async fn failed_automatic_rollback_marks_manager_unhealthy() {
    if !git_available() {
        eprintln!("git not available; skipping");
        return;
    }
    let remote = Remote::new();
    let first = remote.commit("policies/a.yaml", &policy_yaml("a", "1.0.0"), "add a");

    // Rejecting `c` also locks the index, so the reset that follows fails.
    let index_lock = remote.checkout().join(".git").join("index.lock");
    let lock = index_lock.clone();
    let manager = PolicyManager::builder(remote.config())
        .validator(move |p: &Policy| -> tollgate_policy::Result<()> {
            if p.name == "c" {
                fs::write(&lock, b"").unwrap();
                return Err(PolicyError::Validation {
                    policy: p.name.clone(),
                    message: "c is not allowed".into(),
                });
            }
            Ok(())
        })
        .build()
        .unwrap();
    manager.load_policies().await.unwrap();

    remote.commit("policies/c.yaml", &policy_yaml("c", "1.0.0"), "add c");
    let err = manager.force_sync().await.unwrap_err();
    match err {
        PolicyError::SyncRollback { reload, rollback } => {
            assert!(matches!(*reload, PolicyError::Validation { .. }));
            assert!(matches!(*rollback, PolicyError::Git(_)));
        }
        other => panic!("expected both errors, got {other:?}"),
    }
    assert!(!manager.is_healthy());
    assert_eq!(manager.get_git_metrics().unwrap().failed_rollbacks, 1);
    assert_eq!(manager.get_all_policies().len(), 1);

    // An operator rollback once the lock is gone recovers.
    fs::remove_file(&index_lock).unwrap();
    manager.rollback_to_commit(&first).await.unwrap();
    assert!(manager.is_healthy());
    assert_eq!(manager.get_current_commit().await.unwrap().sha, first);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn poller_skips_rejected_head_until_remote_moves() {
    if !git_available() {
        eprintln!("git not available; skipping");
        return;
    }
    let remote = Remote::new();
    let first = remote.commit("policies/a.yaml", &policy_yaml("a", "1.0.0"), "add a");
    let mut config = remote.config();
    if let Some(git) = config.git.as_mut() {
        git.poll.enabled = true;
        git.poll.interval_secs = 1;
    }
    let manager = PolicyManager::new(config).unwrap();
    manager.load_policies().await.unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let watcher = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.watch(shutdown_rx).await })
    };

    let bad = remote.commit("policies/c.yaml", "name: c\nversion: broken\n", "add c");
    assert!(
        wait_until(|| manager.health().rejected_commit.as_deref() == Some(bad.as_str())).await
    );
    let metrics = manager.get_git_metrics().unwrap();
    assert_eq!(metrics.rollbacks, 1);

    // Later ticks see the same remote head and leave the working copy alone.
    let pulls = metrics.successful_pulls;
    assert!(wait_until(|| manager.get_git_metrics().unwrap().successful_pulls >= pulls + 2).await);
    assert_eq!(manager.get_git_metrics().unwrap().rollbacks, 1);
    assert_eq!(manager.get_current_commit().await.unwrap().sha, first);
    assert_eq!(manager.state(), ManagerState::Loaded);

    let fixed = remote.commit("policies/c.yaml", &policy_yaml("c", "1.0.0"), "fix c");
    assert!(wait_until(|| manager.get_all_policies().len() == 2).await);
    assert!(manager.health().rejected_commit.is_none());
    assert_eq!(manager.get_current_commit().await.unwrap().sha, fixed);

    shutdown_tx.send(true).unwrap();
    watcher.await.unwrap().unwrap();
}
