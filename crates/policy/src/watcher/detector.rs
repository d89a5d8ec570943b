//! Filesystem change detection for a policy file or directory tree.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use notify::event::{CreateKind, ModifyKind};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tollgate_core::config::{LoaderLimits, WatcherConfig};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::debounce::Debouncer;
use crate::error::{LoadError, PolicyError, Result};

const EVENT_QUEUE: usize = 256;

/// What the detector is watching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchTarget {
    /// A single document. Its parent directory is watched so editors that
    /// save by rename are still seen.
    File(PathBuf),
    /// Every subdirectory of a tree, registered individually.
    Tree(PathBuf),
}

impl WatchTarget {
    /// Canonicalize `path` and classify it as a file or a tree.
    pub fn resolve(path: &Path) -> Result<Self> {
        let canonical = std::fs::canonicalize(path).map_err(|e| LoadError::from_io(path, e))?;
        if canonical.is_dir() {
            Ok(WatchTarget::Tree(canonical))
        } else {
            Ok(WatchTarget::File(canonical))
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            WatchTarget::File(p) | WatchTarget::Tree(p) => p,
        }
    }
}

/// Decides which raw notifications count as policy changes.
#[derive(Debug, Clone)]
pub struct EventFilter {
    target: WatchTarget,
    limits: LoaderLimits,
}

impl EventFilter {
    pub fn new(target: WatchTarget, limits: LoaderLimits) -> Self {
        Self { target, limits }
    }

    /// Whether `event` may have changed policy content.
    ///
    /// Access events and metadata-only changes (permissions, timestamps) are
    /// ignored, as are paths outside the extension allow-list and hidden
    /// entries when hidden files are skipped.
    pub fn is_relevant(&self, event: &Event) -> bool {
        match event.kind {
            EventKind::Access(_) | EventKind::Modify(ModifyKind::Metadata(_)) => false,
            EventKind::Create(CreateKind::Folder) => {
                matches!(self.target, WatchTarget::Tree(_))
                    && event.paths.iter().any(|p| !self.hidden(p))
            }
            _ => event.paths.iter().any(|p| self.path_relevant(p)),
        }
    }

    fn path_relevant(&self, path: &Path) -> bool {
        match &self.target {
            WatchTarget::File(file) => path == file,
            WatchTarget::Tree(_) => self.limits.extension_allowed(path) && !self.hidden(path),
        }
    }

    /// Hidden if any component below the watched root is dot-prefixed.
    fn hidden(&self, path: &Path) -> bool {
        if !self.limits.skip_hidden {
            return false;
        }
        let relative = path.strip_prefix(self.target.path()).unwrap_or(path);
        relative
            .components()
            .any(|c| c.as_os_str().to_str().is_some_and(|s| s.starts_with('.')))
    }
}

/// Notification forwarded from the notify thread to the event task.
enum Signal {
    Changed,
    NewDirectory(PathBuf),
    Failed(notify::Error),
}

struct Running {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
    debouncer: Arc<Debouncer>,
}

/// Watches a policy location and invokes a callback once per debounced burst
/// of relevant changes.
pub struct ChangeDetector {
    target: WatchTarget,
    limits: LoaderLimits,
    debounce: Duration,
    started: AtomicBool,
    running: Mutex<Option<Running>>,
    // Held for a whole `stop` so concurrent callers all wait for teardown.
    stopping: tokio::sync::Mutex<()>,
}

impl ChangeDetector {
    pub fn new(target: WatchTarget, limits: LoaderLimits, config: &WatcherConfig) -> Self {
        Self {
            target,
            limits,
            debounce: config.debounce(),
            started: AtomicBool::new(false),
            running: Mutex::new(None),
            stopping: tokio::sync::Mutex::new(()),
        }
    }

    pub fn target(&self) -> &WatchTarget {
        &self.target
    }

    /// Register the watches and spawn the event task. Fails if the target
    /// cannot be watched or the detector was already started.
    pub fn start<F>(&self, on_change: F) -> Result<()>
    where
        F: Fn() + Send + Sync + 'static,
    {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(PolicyError::State("change detector already started".into()));
        }

        let filter = EventFilter::new(self.target.clone(), self.limits.clone());
        let (signal_tx, mut signal_rx) = mpsc::channel::<Signal>(EVENT_QUEUE);

        let callback_filter = filter.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let signal = match res {
                Ok(event) => {
                    let new_dir = match event.kind {
                        EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(_)) => {
                            event.paths.iter().find(|p| p.is_dir()).cloned()
                        }
                        _ => None,
                    };
                    match new_dir {
                        Some(dir) if matches!(callback_filter.target, WatchTarget::Tree(_)) => {
                            Signal::NewDirectory(dir)
                        }
                        _ if callback_filter.is_relevant(&event) => Signal::Changed,
                        _ => return,
                    }
                }
                Err(e) => Signal::Failed(e),
            };
            // The notify thread is not a runtime thread, so blocking is fine.
            let _ = signal_tx.blocking_send(signal);
        })?;

        let watched = self.register(&mut watcher)?;
        info!(
            target = %self.target.path().display(),
            directories = watched,
            debounce_ms = self.debounce.as_millis() as u64,
            "watching policy source"
        );

        let debouncer = Arc::new(Debouncer::start(self.debounce, on_change));
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let task_debouncer = debouncer.clone();
        let limits = self.limits.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => break,
                    signal = signal_rx.recv() => match signal {
                        Some(Signal::Changed) => task_debouncer.trigger(),
                        Some(Signal::NewDirectory(dir)) => {
                            if !filter.hidden(&dir) {
                                let added = register_tree(&mut watcher, &dir, &limits);
                                debug!(dir = %dir.display(), added, "watching new directory");
                                task_debouncer.trigger();
                            }
                        }
                        Some(Signal::Failed(e)) => warn!(error = %e, "watcher error"),
                        None => break,
                    },
                }
            }
            drop(watcher);
        });

        *self.running.lock().unwrap_or_else(PoisonError::into_inner) = Some(Running {
            shutdown_tx,
            handle,
            debouncer,
        });
        Ok(())
    }

    fn register(&self, watcher: &mut RecommendedWatcher) -> Result<usize> {
        match &self.target {
            WatchTarget::File(file) => {
                let parent = file.parent().ok_or_else(|| {
                    PolicyError::State(format!("{} has no parent directory", file.display()))
                })?;
                watcher.watch(parent, RecursiveMode::NonRecursive)?;
                Ok(1)
            }
            WatchTarget::Tree(root) => {
                watcher.watch(root, RecursiveMode::NonRecursive)?;
                Ok(1 + register_tree(watcher, root, &self.limits))
            }
        }
    }

    /// Stop the event task and cancel any pending debounced callback.
    /// Safe to call more than once, and before `start`.
    pub async fn stop(&self) {
        let _stopping = self.stopping.lock().await;
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(running) = running else {
            return;
        };
        let _ = running.shutdown_tx.send(true);
        if let Err(e) = running.handle.await {
            warn!(error = %e, "watch task ended abnormally");
        }
        running.debouncer.stop().await;
        debug!(target = %self.target.path().display(), "change detector stopped");
    }
}

/// Register every subdirectory below `root` (not `root` itself).
/// Returns how many directories were added.
fn register_tree(watcher: &mut RecommendedWatcher, root: &Path, limits: &LoaderLimits) -> usize {
    let skip_hidden = limits.skip_hidden;
    let mut added = 0;
    let dirs = WalkDir::new(root)
        .min_depth(1)
        .follow_links(limits.follow_symlinks)
        .into_iter()
        .filter_entry(|e| !(skip_hidden && LoaderLimits::is_hidden(e.path())))
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir());
    for dir in dirs {
        match watcher.watch(dir.path(), RecursiveMode::NonRecursive) {
            Ok(()) => added += 1,
            Err(e) => warn!(dir = %dir.path().display(), error = %e, "cannot watch directory"),
        }
    }
    added
}
