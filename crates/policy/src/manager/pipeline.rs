//! Load → resolve → validate, shared by load, reload and dry runs.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use tollgate_core::config::ValidationConfig;
use tollgate_core::Policy;
use tracing::debug;

use super::state::LoadDiagnostics;
use crate::error::{collapse, LoadError, PolicyError, Result};
use crate::loader::PolicyLoader;
use crate::resolver::IncludeResolver;
use crate::validator::PolicyValidator;

/// Output of a successful pipeline run, not yet applied anywhere.
#[derive(Debug)]
pub(crate) struct PolicySet {
    pub policies: Vec<Policy>,
    pub diagnostics: LoadDiagnostics,
}

pub(crate) struct Pipeline<'a> {
    pub loader: &'a PolicyLoader,
    pub validator: &'a dyn PolicyValidator,
    pub validation: &'a ValidationConfig,
    pub include_root: Option<&'a Path>,
}

impl Pipeline<'_> {
    /// Build a complete, validated policy set from `source` (a file or a
    /// directory). Any failure discards the whole set.
    pub fn run(&self, source: &Path) -> Result<PolicySet> {
        let meta = fs::metadata(source).map_err(|e| LoadError::from_io(source, e))?;
        let (documents, default_root) = if meta.is_dir() {
            (self.loader.load_directory(source)?, source.to_path_buf())
        } else {
            let parent = source
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            (vec![self.loader.load_file(source)?], parent)
        };

        let policies = if documents.iter().any(Policy::has_includes) {
            let sandbox = self.include_root.unwrap_or(&default_root);
            let roots: Vec<PathBuf> = documents
                .iter()
                .filter_map(|p| p.source_path.clone())
                .collect();
            let resolver = IncludeResolver::new(
                self.loader.clone(),
                sandbox,
                self.loader.limits().max_include_depth,
            )?;
            resolver.resolve_multiple(&roots)?.into_policies()
        } else {
            documents
        };

        let diagnostics = diagnose(&policies);
        self.validate(&policies)?;
        debug!(
            policies = policies.len(),
            warnings = diagnostics.warnings.len(),
            "policy pipeline finished"
        );
        Ok(PolicySet {
            policies,
            diagnostics,
        })
    }

    fn validate(&self, policies: &[Policy]) -> Result<()> {
        if !self.validation.enabled {
            return Ok(());
        }
        if self.validation.strict {
            for policy in policies {
                self.validator.validate(policy)?;
            }
            return Ok(());
        }
        let errors: Vec<PolicyError> = policies
            .iter()
            .filter_map(|p| self.validator.validate(p).err())
            .collect();
        collapse(errors)
    }
}

/// Duplicate policy names (last wins) and rule names shared across policies.
fn diagnose(policies: &[Policy]) -> LoadDiagnostics {
    let mut diagnostics = LoadDiagnostics::default();

    let mut sources: HashMap<&str, Option<&Path>> = HashMap::new();
    for policy in policies {
        if let Some(previous) = sources.insert(policy.name.as_str(), policy.source()) {
            diagnostics.warn(format!(
                "policy '{}' from {} overrides the definition from {}",
                policy.name,
                display(policy.source()),
                display(previous),
            ));
        }
    }

    let mut owners: HashMap<&str, &str> = HashMap::new();
    for policy in policies {
        for rule in &policy.rules {
            match owners.get(rule.name.as_str()) {
                Some(owner) if *owner != policy.name => diagnostics.warn(format!(
                    "rule '{}' is defined in both '{}' and '{}'",
                    rule.name, owner, policy.name
                )),
                Some(_) => {}
                None => {
                    owners.insert(rule.name.as_str(), policy.name.as_str());
                }
            }
        }
    }

    diagnostics
}

fn display(path: Option<&Path>) -> String {
    path.map(|p| p.display().to_string())
        .unwrap_or_else(|| "<memory>".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(name: &str, source: &str, rules: &[&str]) -> Policy {
        let mut yaml = format!("name: {name}\nversion: 1.0.0\nrules:\n");
        for rule in rules {
            yaml.push_str(&format!("  - name: {rule}\n    actions:\n      - type: allow\n"));
        }
        serde_yaml::from_str::<Policy>(&yaml)
            .unwrap()
            .with_source(source)
    }

    #[test]
    fn duplicates_are_reported_not_fatal() {
        let policies = vec![
            policy("a", "/p/a.yaml", &["shared", "only-a"]),
            policy("b", "/p/b.yaml", &["shared"]),
            policy("a", "/p/a2.yaml", &["x"]),
        ];
        let diagnostics = diagnose(&policies);
        assert_eq!(diagnostics.warnings.len(), 2);
        assert!(diagnostics.warnings[0].contains("policy 'a' from /p/a2.yaml overrides"));
        assert!(diagnostics.warnings[1].contains("rule 'shared' is defined in both 'a' and 'b'"));
    }

    #[test]
    fn clean_batch_has_no_diagnostics() {
        let policies = vec![
            policy("a", "/p/a.yaml", &["r1"]),
            policy("b", "/p/b.yaml", &["r2"]),
        ];
        assert!(diagnose(&policies).is_empty());
    }
}
