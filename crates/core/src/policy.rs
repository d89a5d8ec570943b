//! Policy document model.
//!
//! A [`Policy`] is built once by a parser and never mutated afterwards; the
//! lifecycle layer shares it as `Arc<Policy>` and swaps whole sets on reload.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A named, versioned policy document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Policy {
    /// Unique key within a registry.
    pub name: String,
    /// Semantic version string, e.g. `1.2.0`.
    pub version: String,
    #[serde(default)]
    pub metadata: PolicyMetadata,
    /// Rules in declared order.
    #[serde(default)]
    pub rules: Vec<Rule>,
    /// Named variables available to rule conditions.
    #[serde(default)]
    pub variables: BTreeMap<String, serde_json::Value>,
    /// Paths of other policy documents this one depends on, as written.
    #[serde(default)]
    pub includes: Vec<String>,
    /// Canonical location the document was loaded from. Set by the loader.
    #[serde(skip)]
    pub source_path: Option<PathBuf>,
}

/// Human-facing metadata attached to a policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PolicyMetadata {
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl Policy {
    /// Attach the canonical source path (builder style, used by parsers).
    pub fn with_source(mut self, path: impl Into<PathBuf>) -> Self {
        self.source_path = Some(path.into());
        self
    }

    pub fn source(&self) -> Option<&Path> {
        self.source_path.as_deref()
    }

    pub fn has_includes(&self) -> bool {
        !self.includes.is_empty()
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    pub fn enabled_rule_count(&self) -> usize {
        self.rules.iter().filter(|r| r.enabled).count()
    }

    /// Look up a rule by name.
    pub fn rule(&self, name: &str) -> Option<&Rule> {
        self.rules.iter().find(|r| r.name == name)
    }
}

/// A single rule: when `condition` holds, `actions` apply in order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Rule {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Higher priority rules are evaluated first by the request path.
    #[serde(default)]
    pub priority: i32,
    /// `None` means the rule applies unconditionally.
    #[serde(default)]
    pub condition: Option<Condition>,
    #[serde(default)]
    pub actions: Vec<Action>,
}

fn default_true() -> bool {
    true
}

/// Boolean condition tree. Evaluation is owned by the request path; this
/// crate only carries the shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Condition {
    All { all: Vec<Condition> },
    Any { any: Vec<Condition> },
    Not { not: Box<Condition> },
    Match {
        field: String,
        operator: MatchOperator,
        value: serde_json::Value,
    },
}

impl Condition {
    /// Visit every node of the tree, parents before children.
    pub fn walk<'a>(&'a self, f: &mut impl FnMut(&'a Condition)) {
        f(self);
        match self {
            Condition::All { all: children } | Condition::Any { any: children } => {
                for child in children {
                    child.walk(f);
                }
            }
            Condition::Not { not } => not.walk(f),
            Condition::Match { .. } => {}
        }
    }

    /// Nesting depth; a single leaf has depth 1.
    pub fn depth(&self) -> usize {
        match self {
            Condition::All { all: children } | Condition::Any { any: children } => {
                1 + children.iter().map(Condition::depth).max().unwrap_or(0)
            }
            Condition::Not { not } => 1 + not.depth(),
            Condition::Match { .. } => 1,
        }
    }
}

/// Comparison operators for [`Condition::Match`] leaves.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MatchOperator {
    Equals,
    NotEquals,
    Contains,
    Matches,
    In,
    GreaterThan,
    LessThan,
}

/// Actions applied when a rule matches.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum Action {
    Allow,
    Deny {
        #[serde(default)]
        reason: Option<String>,
    },
    Log {
        #[serde(default = "default_log_level")]
        level: String,
    },
    Redact {
        fields: Vec<String>,
    },
    RateLimit {
        requests_per_minute: u32,
    },
    SetHeader {
        name: String,
        value: String,
    },
}

fn default_log_level() -> String {
    "info".to_string()
}
