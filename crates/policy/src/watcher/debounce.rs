//! Trailing-edge debouncer.
//!
//! Every trigger restarts the quiet period; the callback fires once the
//! period elapses with no further triggers. Triggers are delivered to a
//! single timer task over a bounded channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

const TRIGGER_QUEUE: usize = 64;

pub struct Debouncer {
    trigger_tx: mpsc::Sender<()>,
    shutdown_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl Debouncer {
    /// Spawn the timer task. Must be called from within a tokio runtime.
    pub fn start<F>(interval: Duration, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        let (trigger_tx, mut trigger_rx) = mpsc::channel::<()>(TRIGGER_QUEUE);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut deadline: Option<Instant> = None;
            loop {
                let at = deadline;
                let quiet = async move {
                    match at {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending::<()>().await,
                    }
                };
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => break,
                    msg = trigger_rx.recv() => match msg {
                        Some(()) => deadline = Some(Instant::now() + interval),
                        None => break,
                    },
                    _ = quiet => {
                        deadline = None;
                        debug!("debounce interval elapsed");
                        callback();
                    }
                }
            }
        });

        Self {
            trigger_tx,
            shutdown_tx,
            handle: Mutex::new(Some(handle)),
            stopped: AtomicBool::new(false),
        }
    }

    /// Restart the quiet period. A no-op after [`stop`](Self::stop).
    pub fn trigger(&self) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        // A full queue already holds a pending restart.
        let _ = self.trigger_tx.try_send(());
    }

    /// Cancel any pending callback and wait for the timer task to exit.
    /// Safe to call more than once; every caller returns only after the
    /// task is gone.
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        let _ = self.shutdown_tx.send(true);
        let mut handle = self.handle.lock().await;
        if let Some(task) = handle.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "debounce task ended abnormally");
            }
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}
