//! Validator seam and the default structural checks.

use std::collections::HashSet;

use tollgate_core::{Action, Condition, MatchOperator, Policy};

use crate::error::{PolicyError, Result};

/// Maximum nesting of a rule's condition tree.
const MAX_CONDITION_DEPTH: usize = 32;

/// Semantic validation of a parsed policy.
pub trait PolicyValidator: Send + Sync {
    fn validate(&self, policy: &Policy) -> Result<()>;
}

impl<F> PolicyValidator for F
where
    F: Fn(&Policy) -> Result<()> + Send + Sync,
{
    fn validate(&self, policy: &Policy) -> Result<()> {
        self(policy)
    }
}

/// Structural checks every policy must pass before it reaches the registry.
///
/// All problems in one policy are reported together in a single
/// [`PolicyError::Validation`].
#[derive(Debug, Clone, Default)]
pub struct DefaultValidator;

impl DefaultValidator {
    pub fn new() -> Self {
        Self
    }

    fn check(&self, policy: &Policy) -> Vec<String> {
        let mut problems = Vec::new();

        if policy.name.trim().is_empty() {
            problems.push("name must not be empty".to_string());
        } else if !policy
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            problems.push(format!(
                "name '{}' may only contain letters, digits, '-', '_' and '.'",
                policy.name
            ));
        }

        if !is_semver(&policy.version) {
            problems.push(format!(
                "version '{}' is not a semantic version (MAJOR.MINOR.PATCH)",
                policy.version
            ));
        }

        let mut seen = HashSet::new();
        for (idx, rule) in policy.rules.iter().enumerate() {
            let at = format!("rules[{idx}]");
            if rule.name.trim().is_empty() {
                problems.push(format!("{at}: rule name must not be empty"));
            } else if !seen.insert(rule.name.as_str()) {
                problems.push(format!("{at}: duplicate rule name '{}'", rule.name));
            }

            if rule.actions.is_empty() {
                problems.push(format!("{at}: rule '{}' has no actions", rule.name));
            }
            for (a_idx, action) in rule.actions.iter().enumerate() {
                check_action(action, &format!("{at}.actions[{a_idx}]"), &mut problems);
            }

            if let Some(condition) = &rule.condition {
                if condition.depth() > MAX_CONDITION_DEPTH {
                    problems.push(format!(
                        "{at}: condition nesting exceeds {MAX_CONDITION_DEPTH} levels"
                    ));
                }
                condition.walk(&mut |node| check_condition(node, &at, &mut problems));
            }
        }

        for include in &policy.includes {
            if include.trim().is_empty() {
                problems.push("includes: entries must not be empty".to_string());
            }
        }

        problems
    }
}

impl PolicyValidator for DefaultValidator {
    fn validate(&self, policy: &Policy) -> Result<()> {
        let problems = self.check(policy);
        if problems.is_empty() {
            Ok(())
        } else {
            Err(PolicyError::Validation {
                policy: policy.name.clone(),
                message: problems.join("; "),
            })
        }
    }
}

fn check_action(action: &Action, at: &str, problems: &mut Vec<String>) {
    match action {
        Action::Redact { fields } if fields.is_empty() => {
            problems.push(format!("{at}: redact needs at least one field"));
        }
        Action::RateLimit {
            requests_per_minute: 0,
        } => {
            problems.push(format!("{at}: rate_limit must allow at least one request"));
        }
        Action::SetHeader { name, .. } if name.trim().is_empty() => {
            problems.push(format!("{at}: set_header name must not be empty"));
        }
        Action::Log { level }
            if !matches!(level.as_str(), "trace" | "debug" | "info" | "warn" | "error") =>
        {
            problems.push(format!("{at}: unknown log level '{level}'"));
        }
        _ => {}
    }
}

fn check_condition(node: &Condition, at: &str, problems: &mut Vec<String>) {
    match node {
        Condition::All { all: children } | Condition::Any { any: children }
            if children.is_empty() =>
        {
            problems.push(format!("{at}: empty all/any group"));
        }
        Condition::Match {
            field,
            operator,
            value,
        } => {
            if field.trim().is_empty() {
                problems.push(format!("{at}: condition field must not be empty"));
            }
            match operator {
                MatchOperator::Matches => match value.as_str() {
                    Some(pattern) => {
                        if let Err(e) = regex_lite::Regex::new(pattern) {
                            problems.push(format!("{at}: invalid pattern '{pattern}': {e}"));
                        }
                    }
                    None => problems.push(format!("{at}: 'matches' needs a string pattern")),
                },
                MatchOperator::In if !value.is_array() => {
                    problems.push(format!("{at}: 'in' needs a list value"));
                }
                MatchOperator::GreaterThan | MatchOperator::LessThan if !value.is_number() => {
                    problems.push(format!("{at}: numeric comparison needs a number"));
                }
                _ => {}
            }
        }
        _ => {}
    }
}

/// `MAJOR.MINOR.PATCH` with optional `-prerelease` and `+build` suffixes.
fn is_semver(version: &str) -> bool {
    let (rest, build) = match version.split_once('+') {
        Some((rest, build)) => (rest, Some(build)),
        None => (version, None),
    };
    let (core, pre) = match rest.split_once('-') {
        Some((core, pre)) => (core, Some(pre)),
        None => (rest, None),
    };
    if build.is_some_and(str::is_empty) || pre.is_some_and(str::is_empty) {
        return false;
    }
    let parts: Vec<&str> = core.split('.').collect();
    parts.len() == 3
        && parts.iter().all(|p| {
            !p.is_empty()
                && p.chars().all(|c| c.is_ascii_digit())
                && (p.len() == 1 || !p.starts_with('0'))
        })
}
