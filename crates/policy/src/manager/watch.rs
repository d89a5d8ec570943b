//! The blocking watch loop: file change detection or git polling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use super::core::PolicyManager;
use crate::error::{PolicyError, Result};
use crate::git::{GitPoller, SyncTarget};
use crate::watcher::{ChangeDetector, WatchTarget};

/// Clears the active-watch flag however the loop exits.
struct ActiveWatch<'a>(&'a AtomicBool);

impl Drop for ActiveWatch<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Resolves once the flag turns true or its sender goes away.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

impl PolicyManager {
    /// Reload on every detected change until `shutdown` turns true or the
    /// manager is closed. Only one watch loop may run at a time.
    ///
    /// File mode reacts to debounced filesystem events; git mode runs the
    /// poller. Reload failures are logged and the loop keeps going.
    pub async fn watch(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        self.inner.ensure_open()?;
        if self.inner.watching.swap(true, Ordering::AcqRel) {
            return Err(PolicyError::State("a watch loop is already running".into()));
        }
        let _active = ActiveWatch(&self.inner.watching);
        let mut closed = self.inner.close_tx.subscribe();

        if self.inner.git.is_some() {
            self.watch_git(&mut shutdown, &mut closed).await
        } else {
            self.watch_files(&mut shutdown, &mut closed).await
        }
    }

    async fn watch_files(
        &self,
        shutdown: &mut watch::Receiver<bool>,
        closed: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let target = WatchTarget::resolve(&self.inner.config.policy_path())?;
        let detector = ChangeDetector::new(
            target,
            self.inner.config.loader.clone(),
            &self.inner.config.watcher,
        );

        // Capacity 1: a queued request already covers any later change.
        let (reload_tx, mut reload_rx) = mpsc::channel::<()>(1);
        detector.start(move || {
            let _ = reload_tx.try_send(());
        })?;

        loop {
            tokio::select! {
                _ = cancelled(shutdown) => break,
                _ = cancelled(closed) => break,
                Some(()) = reload_rx.recv() => {
                    match self.reload_policies().await {
                        Ok(()) => {}
                        Err(PolicyError::Closed) => break,
                        Err(e) => warn!(error = %e, "reload after change failed; keeping previous policies"),
                    }
                }
            }
        }

        detector.stop().await;
        info!("policy watch stopped");
        Ok(())
    }

    async fn watch_git(
        &self,
        shutdown: &mut watch::Receiver<bool>,
        closed: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let poll = self
            .inner
            .config
            .git
            .as_ref()
            .map(|g| g.poll.clone())
            .unwrap_or_default();

        let poller = if poll.enabled {
            let target: Arc<dyn SyncTarget> = self.inner.clone();
            Some(GitPoller::spawn(poll.interval(), target))
        } else {
            info!("git polling disabled; waiting for shutdown");
            None
        };

        tokio::select! {
            _ = cancelled(shutdown) => {}
            _ = cancelled(closed) => {}
        }

        if let Some(poller) = poller {
            poller.stop().await;
        }
        info!("policy watch stopped");
        Ok(())
    }
}
