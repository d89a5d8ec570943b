//! Periodic sync loop for git-backed sources.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::types::PullResult;
use crate::error::Result;

/// Something that can pull the remote and apply what it finds.
#[async_trait]
pub trait SyncTarget: Send + Sync {
    async fn sync(&self) -> Result<PullResult>;
}

/// Background task calling [`SyncTarget::sync`] every `interval`.
///
/// The first sync happens one full interval after spawning. Failures are
/// logged and the loop keeps going.
pub struct GitPoller {
    interval: Duration,
    shutdown_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl GitPoller {
    pub fn spawn(interval: Duration, target: Arc<dyn SyncTarget>) -> Self {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_secs = interval.as_secs(), "git poller started");

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {
                        match target.sync().await {
                            Ok(pull) if pull.changed() => {
                                info!(commit = %pull.current, files = pull.changed_files.len(), "applied remote policy changes");
                            }
                            Ok(_) => debug!("no remote policy changes"),
                            Err(e) => warn!(error = %e, "policy sync failed"),
                        }
                    }
                }
            }
            debug!("git poller stopped");
        });

        Self {
            interval,
            shutdown_tx,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Stop the loop and wait for an in-flight sync to finish. Idempotent.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let mut handle = self.handle.lock().await;
        if let Some(task) = handle.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "git poller task ended abnormally");
            }
        }
    }
}
