//! Copy-on-write policy registry.
//!
//! Readers take an `Arc` to the current [`RegistrySnapshot`] and never block on
//! a writer for longer than the pointer clone. Writers build a complete new
//! snapshot and swap it in, so a reader sees either the old set or the new set
//! and never a mixture.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tollgate_core::Policy;
use tracing::debug;

use crate::error::{collapse, PolicyError, Result};

/// An immutable policy set with its content fingerprint.
#[derive(Debug, Clone)]
pub struct RegistrySnapshot {
    policies: HashMap<String, Arc<Policy>>,
    version: String,
    loaded_at: DateTime<Utc>,
}

impl RegistrySnapshot {
    fn build(policies: HashMap<String, Arc<Policy>>, loaded_at: DateTime<Utc>) -> Self {
        let version = fingerprint(&policies);
        Self {
            policies,
            version,
            loaded_at,
        }
    }

    fn empty() -> Self {
        Self::build(HashMap::new(), Utc::now())
    }

    pub fn get(&self, name: &str) -> Option<Arc<Policy>> {
        self.policies.get(name).cloned()
    }

    /// Every policy, ordered by name.
    pub fn all(&self) -> Vec<Arc<Policy>> {
        let mut all: Vec<_> = self.policies.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.policies.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }
}

/// Aggregate counts over the current snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub policies: usize,
    pub rules: usize,
    pub enabled_rules: usize,
    pub version: String,
    pub loaded_at: DateTime<Utc>,
}

/// Thread-safe name → policy store with atomic whole-set replacement.
#[derive(Debug)]
pub struct PolicyRegistry {
    current: RwLock<Arc<RegistrySnapshot>>,
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyRegistry {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(RegistrySnapshot::empty())),
        }
    }

    /// The current snapshot. Holding it pins that version for as long as needed.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Build a new map from the current one under the write lock and swap it in.
    /// Writers are serialized; readers only ever see the old or new snapshot.
    fn update<F>(&self, keep_timestamp: bool, f: F) -> Result<()>
    where
        F: FnOnce(&mut HashMap<String, Arc<Policy>>) -> Result<()>,
    {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = guard.policies.clone();
        f(&mut next)?;
        let loaded_at = if keep_timestamp {
            guard.loaded_at
        } else {
            Utc::now()
        };
        let snapshot = RegistrySnapshot::build(next, loaded_at);
        debug!(policies = snapshot.len(), version = %snapshot.version, "registry updated");
        *guard = Arc::new(snapshot);
        Ok(())
    }

    /// Insert or overwrite one policy.
    pub fn register(&self, policy: impl Into<Arc<Policy>>) -> Result<()> {
        let policy = policy.into();
        check_batch(std::slice::from_ref(&policy))?;
        self.update(true, |map| {
            map.insert(policy.name.clone(), policy);
            Ok(())
        })
    }

    /// Insert or overwrite several policies at once; nothing is applied if
    /// any of them is malformed.
    pub fn register_multiple(&self, policies: Vec<Arc<Policy>>) -> Result<()> {
        check_batch(&policies)?;
        self.update(true, |map| {
            for policy in policies {
                map.insert(policy.name.clone(), policy);
            }
            Ok(())
        })
    }

    /// Replace the whole set. Later duplicates of a name win. On a malformed
    /// batch the previous contents remain untouched.
    pub fn replace(&self, policies: Vec<Arc<Policy>>) -> Result<()> {
        check_batch(&policies)?;
        self.update(false, |map| {
            map.clear();
            for policy in policies {
                map.insert(policy.name.clone(), policy);
            }
            Ok(())
        })
    }

    pub fn unregister(&self, name: &str) -> Result<Arc<Policy>> {
        let mut removed = None;
        self.update(true, |map| {
            removed = map.remove(name);
            match removed {
                Some(_) => Ok(()),
                None => Err(not_registered(name)),
            }
        })?;
        removed.ok_or_else(|| not_registered(name))
    }

    pub fn clear(&self) {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        *guard = Arc::new(RegistrySnapshot::empty());
    }

    /// Independent registry holding deep copies of the current policies.
    pub fn clone_registry(&self) -> PolicyRegistry {
        let snapshot = self.snapshot();
        let policies = snapshot
            .policies
            .iter()
            .map(|(name, policy)| (name.clone(), Arc::new(Policy::clone(policy))))
            .collect();
        PolicyRegistry {
            current: RwLock::new(Arc::new(RegistrySnapshot::build(
                policies,
                snapshot.loaded_at,
            ))),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<Policy>> {
        self.snapshot().get(name)
    }

    pub fn get_all(&self) -> Vec<Arc<Policy>> {
        self.snapshot().all()
    }

    pub fn names(&self) -> Vec<String> {
        self.snapshot().names()
    }

    pub fn count(&self) -> usize {
        self.snapshot().len()
    }

    pub fn version(&self) -> String {
        self.snapshot().version.clone()
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.snapshot().loaded_at
    }

    pub fn stats(&self) -> RegistryStats {
        let snapshot = self.snapshot();
        let (rules, enabled_rules) = snapshot.policies.values().fold((0, 0), |acc, p| {
            (acc.0 + p.rule_count(), acc.1 + p.enabled_rule_count())
        });
        RegistryStats {
            policies: snapshot.len(),
            rules,
            enabled_rules,
            version: snapshot.version.clone(),
            loaded_at: snapshot.loaded_at,
        }
    }
}

fn check_batch(policies: &[Arc<Policy>]) -> Result<()> {
    let errors = policies
        .iter()
        .enumerate()
        .filter(|(_, p)| p.name.trim().is_empty())
        .map(|(idx, _)| PolicyError::Registry(format!("policy at index {idx} has an empty name")))
        .collect();
    collapse(errors)
}

fn not_registered(name: &str) -> PolicyError {
    PolicyError::Registry(format!("policy '{name}' is not registered"))
}

/// First 16 hex chars of SHA-256 over name-sorted `(name, version, source)`
/// triples. Independent of insertion order.
fn fingerprint(policies: &HashMap<String, Arc<Policy>>) -> String {
    let mut entries: Vec<_> = policies.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));

    let mut hasher = Sha256::new();
    for (name, policy) in entries {
        hasher.update(name.as_bytes());
        hasher.update([0]);
        hasher.update(policy.version.as_bytes());
        hasher.update([0]);
        if let Some(source) = policy.source() {
            hasher.update(source.to_string_lossy().as_bytes());
        }
        hasher.update(b"\n");
    }
    let mut digest = hex::encode(hasher.finalize());
    digest.truncate(16);
    digest
}
