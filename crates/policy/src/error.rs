//! Error taxonomy for the policy lifecycle.
//!
//! Every failure surfaced by the loader, resolver, registry, git source and
//! manager is a [`PolicyError`]. Batch operations collapse their internal
//! error lists with [`collapse`].

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use tollgate_core::ConfigError;

/// Errors that can occur while loading, linking or swapping policies.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    /// Reading a document from storage failed.
    #[error(transparent)]
    Load(#[from] LoadError),

    /// The parser rejected a document.
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// A parsed policy failed semantic validation.
    #[error("validation failed for policy '{policy}': {message}")]
    Validation { policy: String, message: String },

    /// Include resolution failed (cycle, traversal, depth).
    #[error(transparent)]
    Include(#[from] IncludeError),

    /// Malformed input to a registry operation.
    #[error("registry error: {0}")]
    Registry(String),

    /// A git working copy operation failed.
    #[error(transparent)]
    Git(#[from] GitError),

    /// Filesystem watcher error.
    #[error("watcher error: {0}")]
    Watch(#[from] notify::Error),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// The operation is not valid in the manager's current state or mode.
    #[error("invalid state: {0}")]
    State(String),

    #[error("policy manager is closed")]
    Closed,

    #[error("policy not found: {0}")]
    NotFound(String),

    /// Several independent failures from one batch.
    #[error(transparent)]
    Multiple(#[from] MultiError),

    /// A post-sync reload failed and restoring the previous commit failed too.
    #[error("reload failed: {reload}; rollback also failed: {rollback}")]
    SyncRollback {
        reload: Box<PolicyError>,
        rollback: Box<PolicyError>,
    },
}

/// Result alias for policy operations.
pub type Result<T> = std::result::Result<T, PolicyError>;

/// Storage-level failures while reading a single document or directory.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("policy file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("permission denied reading {}", .0.display())]
    PermissionDenied(PathBuf),

    #[error("{} is {size} bytes, exceeding the {max} byte limit", .path.display())]
    TooLarge { path: PathBuf, size: u64, max: u64 },

    #[error("{} is not valid UTF-8", .0.display())]
    InvalidEncoding(PathBuf),

    #[error("{} does not have an allowed policy extension", .0.display())]
    UnsupportedExtension(PathBuf),

    #[error("{} is a symlink and symlinks are disabled", .0.display())]
    SymlinkRejected(PathBuf),

    #[error("no policy documents found under {}", .0.display())]
    NoPolicies(PathBuf),

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl LoadError {
    /// Classify an I/O error against the path it occurred on.
    pub fn from_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            std::io::ErrorKind::NotFound => LoadError::NotFound(path),
            std::io::ErrorKind::PermissionDenied => LoadError::PermissionDenied(path),
            std::io::ErrorKind::InvalidData => LoadError::InvalidEncoding(path),
            _ => LoadError::Io { path, source },
        }
    }
}

/// A parser failure, optionally pinned to a line and column.
#[derive(Debug)]
pub struct ParseError {
    pub path: PathBuf,
    pub line: Option<usize>,
    pub column: Option<usize>,
    pub message: String,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "parse error in {}", self.path.display())?;
        match (self.line, self.column) {
            (Some(line), Some(column)) => write!(f, " at line {line}, column {column}")?,
            (Some(line), None) => write!(f, " at line {line}")?,
            _ => {}
        }
        write!(f, ": {}", self.message)
    }
}

impl std::error::Error for ParseError {}

/// Include-graph failures.
#[derive(Debug, thiserror::Error)]
pub enum IncludeError {
    /// The cycle as an ordered path list; the first path is repeated at the end.
    #[error("include cycle detected: {}", join_paths(.cycle))]
    Cycle { cycle: Vec<PathBuf> },

    #[error("include {} escapes sandbox root {}", .path.display(), .root.display())]
    Traversal { path: PathBuf, root: PathBuf },

    #[error("include depth limit {max} exceeded at {}", .path.display())]
    DepthExceeded { path: PathBuf, max: usize },

    /// Reported by the graph-level check over an already built edge map.
    #[error("dependency graph is not acyclic; unresolved: {}", join_paths(.paths))]
    TopologicalCycle { paths: Vec<PathBuf> },
}

impl IncludeError {
    /// Paths participating in the failure.
    pub fn paths(&self) -> Vec<&PathBuf> {
        match self {
            IncludeError::Cycle { cycle } => cycle.iter().collect(),
            IncludeError::TopologicalCycle { paths } => paths.iter().collect(),
            IncludeError::Traversal { path, .. } | IncludeError::DepthExceeded { path, .. } => {
                vec![path]
            }
        }
    }
}

fn join_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Failures from the git working copy.
#[derive(Debug, thiserror::Error)]
pub enum GitError {
    #[error("failed to run git {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("git {command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("git {command} timed out after {after:?}")]
    Timeout { command: String, after: Duration },

    #[error("invalid commit reference '{0}'")]
    InvalidRef(String),

    #[error("no working copy at {}", .0.display())]
    NotCloned(PathBuf),

    #[error("git I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Combined report naming every underlying failure.
#[derive(Debug)]
pub struct MultiError {
    errors: Vec<PolicyError>,
}

impl MultiError {
    pub fn errors(&self) -> &[PolicyError] {
        &self.errors
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} errors occurred:", self.errors.len())?;
        for err in &self.errors {
            write!(f, "\n  - {err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for MultiError {}

/// Collapse a batch of errors: none → `Ok`, one → that error, more → [`MultiError`].
pub fn collapse(mut errors: Vec<PolicyError>) -> Result<()> {
    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.remove(0)),
        _ => Err(PolicyError::Multiple(MultiError { errors })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collapse_shapes() {
        assert!(collapse(Vec::new()).is_ok());

        let single = collapse(vec![PolicyError::Registry("a".into())]).unwrap_err();
        assert!(matches!(single, PolicyError::Registry(ref m) if m == "a"));

        let multi = collapse(vec![
            PolicyError::Registry("first".into()),
            PolicyError::NotFound("second".into()),
        ])
        .unwrap_err();
        let text = multi.to_string();
        assert!(text.starts_with("2 errors occurred:"));
        assert!(text.contains("first"));
        assert!(text.contains("second"));
        match multi {
            PolicyError::Multiple(m) => assert_eq!(m.len(), 2),
            other => panic!("expected Multiple, got {other:?}"),
        }
    }

    #[test]
    fn parse_error_location_formatting() {
        let err = ParseError {
            path: PathBuf::from("/p/a.yaml"),
            line: Some(3),
            column: Some(7),
            message: "bad indent".into(),
        };
        assert_eq!(
            err.to_string(),
            "parse error in /p/a.yaml at line 3, column 7: bad indent"
        );
    }

    #[test]
    fn cycle_lists_members_in_order() {
        let err = IncludeError::Cycle {
            cycle: vec!["/p/a.yaml".into(), "/p/b.yaml".into(), "/p/a.yaml".into()],
        };
        assert_eq!(
            err.to_string(),
            "include cycle detected: /p/a.yaml -> /p/b.yaml -> /p/a.yaml"
        );
        assert_eq!(err.paths().len(), 3);
    }

    #[test]
    fn io_errors_are_classified() {
        let nf = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(matches!(LoadError::from_io("/x", nf), LoadError::NotFound(_)));
        let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "no");
        assert!(matches!(
            LoadError::from_io("/x", denied),
            LoadError::PermissionDenied(_)
        ));
    }
}
