//! [`PolicyManager`]: owns the registry and drives every load.

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use tokio::sync::watch;
use tollgate_core::config::SourceMode;
use tollgate_core::{Policy, PolicyConfig};
use tracing::{debug, error, info};

use super::pipeline::{Pipeline, PolicySet};
use super::state::{LoadDiagnostics, ManagerHealth, ManagerState, Status};
use crate::error::{GitError, PolicyError, Result};
use crate::git::GitRepository;
use crate::loader::PolicyLoader;
use crate::parser::{PolicyParser, YamlPolicyParser};
use crate::registry::PolicyRegistry;
use crate::validator::{DefaultValidator, PolicyValidator};

/// Fluent builder for a [`PolicyManager`].
///
/// ```ignore
/// let manager = ManagerBuilder::new(PolicyConfig::file("policies"))
///     .validator(|p: &Policy| Ok(()))
///     .build()?;
/// ```
pub struct ManagerBuilder {
    config: PolicyConfig,
    parser: Arc<dyn PolicyParser>,
    validator: Arc<dyn PolicyValidator>,
    registry: Option<Arc<PolicyRegistry>>,
}

impl ManagerBuilder {
    pub fn new(config: PolicyConfig) -> Self {
        Self {
            config,
            parser: Arc::new(YamlPolicyParser::new()),
            validator: Arc::new(DefaultValidator::new()),
            registry: None,
        }
    }

    /// Replace the default YAML parser.
    pub fn parser(mut self, parser: impl PolicyParser + 'static) -> Self {
        self.parser = Arc::new(parser);
        self
    }

    /// Replace the default structural validator.
    pub fn validator(mut self, validator: impl PolicyValidator + 'static) -> Self {
        self.validator = Arc::new(validator);
        self
    }

    /// Share an existing registry, e.g. one already handed to request handlers.
    pub fn registry(mut self, registry: Arc<PolicyRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn build(self) -> Result<PolicyManager> {
        self.config.validate()?;

        let git = match self.config.mode {
            SourceMode::Git => {
                let git_config = self.config.git.clone().ok_or_else(|| {
                    PolicyError::State("git mode requires a [git] section".into())
                })?;
                Some(Arc::new(GitRepository::new(git_config)))
            }
            SourceMode::File => None,
        };

        let (close_tx, _) = watch::channel(false);
        Ok(PolicyManager {
            inner: Arc::new(ManagerInner {
                loader: PolicyLoader::new(self.config.loader.clone(), self.parser),
                validator: self.validator,
                registry: self.registry.unwrap_or_default(),
                git,
                op_lock: tokio::sync::Mutex::new(()),
                status: RwLock::new(Status::default()),
                watching: AtomicBool::new(false),
                close_tx,
                config: self.config,
            }),
        })
    }
}

/// Lifecycle owner for a policy source.
///
/// Cheap to clone; clones share the same registry and state. Loads, reloads,
/// syncs and rollbacks are serialized by one async lock. Reads go straight to
/// the registry and never wait for them.
#[derive(Clone)]
pub struct PolicyManager {
    pub(super) inner: Arc<ManagerInner>,
}

pub(super) struct ManagerInner {
    pub config: PolicyConfig,
    pub loader: PolicyLoader,
    pub validator: Arc<dyn PolicyValidator>,
    pub registry: Arc<PolicyRegistry>,
    pub git: Option<Arc<GitRepository>>,
    pub op_lock: tokio::sync::Mutex<()>,
    pub status: RwLock<Status>,
    pub watching: AtomicBool,
    pub close_tx: watch::Sender<bool>,
}

impl PolicyManager {
    /// Manager with the default parser and validator.
    pub fn new(config: PolicyConfig) -> Result<Self> {
        ManagerBuilder::new(config).build()
    }

    pub fn builder(config: PolicyConfig) -> ManagerBuilder {
        ManagerBuilder::new(config)
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.inner.config
    }

    // ── Mutating operations ─────────────────────────────────────

    /// Initial load. In git mode the working copy is cloned (or reopened) first.
    pub async fn load_policies(&self) -> Result<()> {
        let _op = self.inner.op_lock.lock().await;
        self.inner.ensure_open()?;
        if let Some(git) = &self.inner.git {
            if let Err(e) = git.clone_or_open().await {
                let e = PolicyError::from(e);
                self.inner.record_failure(&e);
                return Err(e);
            }
        }
        self.inner.reload_locked().await
    }

    /// Re-run the pipeline against the current source. On failure the
    /// previously loaded policies stay in place.
    pub async fn reload_policies(&self) -> Result<()> {
        let _op = self.inner.op_lock.lock().await;
        self.inner.ensure_open()?;
        self.inner.reload_locked().await
    }

    /// Load and validate without touching the registry or any recorded state.
    pub async fn validate_policies_dry_run(&self) -> Result<()> {
        self.dry_run_report().await.map(|_| ())
    }

    /// Dry run that also returns the non-fatal diagnostics.
    pub async fn dry_run_report(&self) -> Result<LoadDiagnostics> {
        let _op = self.inner.op_lock.lock().await;
        self.inner.ensure_open()?;
        if let Some(git) = &self.inner.git {
            if !git.is_cloned() {
                return Err(GitError::NotCloned(git.local_path().to_path_buf()).into());
            }
        }
        let set = self.inner.build()?;
        debug!(policies = set.policies.len(), "dry run passed");
        Ok(set.diagnostics)
    }

    /// Stop any active watch loop and move to [`ManagerState::Closed`].
    /// Idempotent.
    pub async fn close(&self) -> Result<()> {
        self.inner.close_tx.send_replace(true);
        let _op = self.inner.op_lock.lock().await;
        let mut status = self.inner.status_mut();
        if status.state != ManagerState::Closed {
            status.state = ManagerState::Closed;
            info!("policy manager closed");
        }
        Ok(())
    }

    // ── Reads ───────────────────────────────────────────────────

    pub fn get_policy(&self, name: &str) -> Result<Arc<Policy>> {
        self.inner
            .registry
            .get(name)
            .ok_or_else(|| PolicyError::NotFound(name.to_string()))
    }

    pub fn get_all_policies(&self) -> Vec<Arc<Policy>> {
        self.inner.registry.get_all()
    }

    pub fn get_policy_version(&self) -> String {
        self.inner.registry.version()
    }

    pub fn registry(&self) -> Arc<PolicyRegistry> {
        self.inner.registry.clone()
    }

    pub fn state(&self) -> ManagerState {
        self.inner.status().state
    }

    /// Message of the most recent failed load, cleared by the next success.
    pub fn last_load_error(&self) -> Option<String> {
        self.inner.status().last_error.clone()
    }

    pub fn last_diagnostics(&self) -> LoadDiagnostics {
        self.inner.status().diagnostics.clone()
    }

    /// False after an automatic rollback failed; the working copy may not
    /// match the served policies until the next successful sync or rollback.
    pub fn is_healthy(&self) -> bool {
        self.inner.status().healthy
    }

    pub fn health(&self) -> ManagerHealth {
        let snapshot = self.inner.registry.snapshot();
        let status = self.inner.status();
        ManagerHealth {
            state: status.state,
            healthy: status.healthy,
            policies: snapshot.len(),
            version: snapshot.version().to_string(),
            loaded_at: status.last_loaded_at,
            last_error: status.last_error.clone(),
            last_good_commit: status.last_good_commit.clone(),
            rejected_commit: status.rejected_commit.clone(),
        }
    }
}

impl ManagerInner {
    pub fn status(&self) -> RwLockReadGuard<'_, Status> {
        self.status.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status_mut(&self) -> RwLockWriteGuard<'_, Status> {
        self.status.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn ensure_open(&self) -> Result<()> {
        if *self.close_tx.borrow() || self.status().state == ManagerState::Closed {
            Err(PolicyError::Closed)
        } else {
            Ok(())
        }
    }

    pub fn git_source(&self) -> Result<&Arc<GitRepository>> {
        self.git
            .as_ref()
            .ok_or_else(|| PolicyError::State("operation requires git mode".into()))
    }

    pub fn build(&self) -> Result<PolicySet> {
        Pipeline {
            loader: &self.loader,
            validator: self.validator.as_ref(),
            validation: &self.config.validation,
            include_root: self.config.include_root.as_deref(),
        }
        .run(&self.config.policy_path())
    }

    /// Full pipeline plus replace. Caller holds `op_lock`.
    pub async fn reload_locked(&self) -> Result<()> {
        let started = Instant::now();
        let set = match self.build() {
            Ok(set) => set,
            Err(e) => {
                self.record_failure(&e);
                return Err(e);
            }
        };

        let policies: Vec<Arc<Policy>> = set.policies.into_iter().map(Arc::new).collect();
        if let Err(e) = self.registry.replace(policies.clone()) {
            self.restore_last_good();
            self.record_failure(&e);
            return Err(e);
        }

        let commit = match &self.git {
            Some(git) => git.current_commit().await.ok().map(|c| c.sha),
            None => None,
        };

        let count = policies.len();
        {
            let mut status = self.status_mut();
            status.state = ManagerState::Loaded;
            status.last_good = Some(Arc::new(policies));
            status.last_loaded_at = Some(self.registry.loaded_at());
            status.last_error = None;
            status.diagnostics = set.diagnostics;
            if commit.is_some() {
                status.last_good_commit = commit;
            }
        }
        info!(
            policies = count,
            version = %self.registry.version(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "policies loaded"
        );
        Ok(())
    }

    /// Put the last successfully applied set back into the registry.
    pub fn restore_last_good(&self) {
        let last_good = self.status().last_good.clone();
        if let Some(good) = last_good {
            if let Err(e) = self.registry.replace(good.as_ref().clone()) {
                error!(error = %e, "failed to restore last known good policies");
            }
        }
    }

    pub fn record_failure(&self, err: &PolicyError) {
        let mut status = self.status_mut();
        status.last_error = Some(err.to_string());
        if status.state == ManagerState::Loaded {
            status.state = ManagerState::Stale;
        }
        error!(error = %err, state = %status.state, "policy load failed");
    }
}
