//! Manager lifecycle state and load bookkeeping.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tollgate_core::Policy;

/// Lifecycle of a [`PolicyManager`](super::PolicyManager).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ManagerState {
    /// Nothing has loaded successfully yet.
    Unloaded,
    /// The registry holds the result of the latest load.
    Loaded,
    /// The latest reload failed; the registry still holds the previous set.
    Stale,
    /// Terminal.
    Closed,
}

impl fmt::Display for ManagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ManagerState::Unloaded => "unloaded",
            ManagerState::Loaded => "loaded",
            ManagerState::Stale => "stale",
            ManagerState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Non-fatal findings from a load.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadDiagnostics {
    pub warnings: Vec<String>,
}

impl LoadDiagnostics {
    pub fn is_empty(&self) -> bool {
        self.warnings.is_empty()
    }

    pub(crate) fn warn(&mut self, message: String) {
        tracing::warn!("{message}");
        self.warnings.push(message);
    }
}

/// Point-in-time view of the manager for status output.
#[derive(Debug, Clone, Serialize)]
pub struct ManagerHealth {
    pub state: ManagerState,
    pub healthy: bool,
    pub policies: usize,
    pub version: String,
    pub loaded_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_good_commit: Option<String>,
    pub rejected_commit: Option<String>,
}

/// Mutable bookkeeping guarded by the manager's status lock.
#[derive(Debug)]
pub(crate) struct Status {
    pub state: ManagerState,
    /// Exactly what was last handed to a successful `replace`.
    pub last_good: Option<Arc<Vec<Arc<Policy>>>>,
    pub last_loaded_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub diagnostics: LoadDiagnostics,
    /// Cleared when an automatic rollback fails.
    pub healthy: bool,
    pub last_good_commit: Option<String>,
    /// Remote head that was pulled, failed to load and was rolled back.
    pub rejected_commit: Option<String>,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            state: ManagerState::Unloaded,
            last_good: None,
            last_loaded_at: None,
            last_error: None,
            diagnostics: LoadDiagnostics::default(),
            healthy: true,
            last_good_commit: None,
            rejected_commit: None,
        }
    }
}
