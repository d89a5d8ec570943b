//! Git-backed policy source: working copy, sync loop and commit metadata.

mod poller;
mod repository;
mod types;

pub use self::poller::{GitPoller, SyncTarget};
pub use self::repository::{redact_url, validate_ref, GitRepository};
pub use self::types::{CommitInfo, PullResult, RepositoryMetrics};
