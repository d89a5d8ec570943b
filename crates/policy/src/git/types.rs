//! Value types reported by the git working copy.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Field separator used in `git log --format` output.
pub(crate) const FIELD_SEP: char = '\x1f';

/// `--format` string matching [`CommitInfo::parse_line`].
pub(crate) const LOG_FORMAT: &str = "--format=%H%x1f%an%x1f%ae%x1f%at%x1f%s";

/// One commit as seen in the working copy's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommitInfo {
    pub sha: String,
    pub author: String,
    pub email: String,
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

impl CommitInfo {
    /// Parse one line of [`LOG_FORMAT`] output.
    pub(crate) fn parse_line(line: &str) -> Option<Self> {
        let mut fields = line.splitn(5, FIELD_SEP);
        let sha = fields.next()?.trim().to_string();
        let author = fields.next()?.to_string();
        let email = fields.next()?.to_string();
        let secs: i64 = fields.next()?.trim().parse().ok()?;
        let message = fields.next().unwrap_or_default().to_string();
        if sha.is_empty() {
            return None;
        }
        Some(Self {
            sha,
            author,
            email,
            timestamp: DateTime::from_timestamp(secs, 0)?,
            message,
        })
    }

    /// Abbreviated sha for log lines.
    pub fn short_sha(&self) -> &str {
        &self.sha[..self.sha.len().min(8)]
    }
}

/// Outcome of a fast-forward pull.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PullResult {
    pub previous: String,
    pub current: String,
    /// Paths changed between `previous` and `current`, relative to the repository root.
    pub changed_files: Vec<String>,
}

impl PullResult {
    pub fn changed(&self) -> bool {
        self.previous != self.current
    }

    pub(crate) fn unchanged(head: String) -> Self {
        Self {
            previous: head.clone(),
            current: head,
            changed_files: Vec::new(),
        }
    }
}

/// Counters and timings for the working copy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RepositoryMetrics {
    pub successful_pulls: u64,
    pub failed_pulls: u64,
    pub rollbacks: u64,
    pub failed_rollbacks: u64,
    pub last_clone_duration: Option<Duration>,
    pub last_pull_duration: Option<Duration>,
    pub last_pull_at: Option<DateTime<Utc>>,
    pub last_commit: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_log_lines() {
        let line = "0123456789abcdef0123456789abcdef01234567\x1fAda\x1fada@example.com\x1f1700000000\x1ftighten egress: deny \x1f in subject";
        let commit = CommitInfo::parse_line(line).unwrap();
        assert_eq!(commit.author, "Ada");
        assert_eq!(commit.email, "ada@example.com");
        assert_eq!(commit.timestamp.timestamp(), 1_700_000_000);
        assert_eq!(commit.message, "tighten egress: deny \x1f in subject");
        assert_eq!(commit.short_sha(), "01234567");
    }

    #[test]
    fn rejects_truncated_lines() {
        assert!(CommitInfo::parse_line("").is_none());
        assert!(CommitInfo::parse_line("abc\x1fAda").is_none());
        assert!(CommitInfo::parse_line("abc\x1fAda\x1fa@b\x1fnot-a-number\x1fmsg").is_none());
    }

    #[test]
    fn pull_result_change_detection() {
        assert!(!PullResult::unchanged("abc".into()).changed());
        let moved = PullResult {
            previous: "abc".into(),
            current: "def".into(),
            changed_files: vec!["egress.yaml".into()],
        };
        assert!(moved.changed());
    }
}
