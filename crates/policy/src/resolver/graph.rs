//! Dependency graph produced by include resolution.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};

use tollgate_core::Policy;

use crate::error::IncludeError;

/// One resolved document in the include graph.
#[derive(Debug, Clone)]
pub struct DependencyNode {
    pub path: PathBuf,
    pub policy: Policy,
    /// Canonical paths this document includes, in declaration order.
    pub includes: Vec<PathBuf>,
    /// Canonical paths of documents that include this one.
    pub included_by: BTreeSet<PathBuf>,
    /// Depth at which the document was first reached (roots are 0).
    pub depth: usize,
}

/// Documents keyed by canonical path, with edges from includer to included
/// and a load order in which every document follows what it includes.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: HashMap<PathBuf, DependencyNode>,
    edges: HashMap<PathBuf, Vec<PathBuf>>,
    order: Vec<PathBuf>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a fully resolved document. Everything in `includes` must already
    /// be present, so the insertion order is a valid load order.
    pub(crate) fn insert(
        &mut self,
        path: PathBuf,
        policy: Policy,
        includes: Vec<PathBuf>,
        depth: usize,
    ) {
        for target in &includes {
            if let Some(node) = self.nodes.get_mut(target) {
                node.included_by.insert(path.clone());
            }
        }
        self.edges.insert(path.clone(), includes.clone());
        self.order.push(path.clone());
        self.nodes.insert(
            path.clone(),
            DependencyNode {
                path,
                policy,
                includes,
                included_by: BTreeSet::new(),
                depth,
            },
        );
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.nodes.contains_key(path)
    }

    pub fn node(&self, path: &Path) -> Option<&DependencyNode> {
        self.nodes.get(path)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &DependencyNode> {
        self.order.iter().filter_map(|p| self.nodes.get(p))
    }

    pub fn edges(&self) -> &HashMap<PathBuf, Vec<PathBuf>> {
        &self.edges
    }

    /// Canonical paths in load order: included documents first.
    pub fn sorted_paths(&self) -> &[PathBuf] {
        &self.order
    }

    /// Documents nothing else includes.
    pub fn roots(&self) -> Vec<&Path> {
        self.nodes()
            .filter(|n| n.included_by.is_empty())
            .map(|n| n.path.as_path())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Borrow the policies in load order.
    pub fn policies(&self) -> impl Iterator<Item = &Policy> {
        self.nodes().map(|n| &n.policy)
    }

    /// Consume the graph, yielding policies in load order.
    pub fn into_policies(mut self) -> Vec<Policy> {
        self.order
            .iter()
            .filter_map(|p| self.nodes.remove(p))
            .map(|n| n.policy)
            .collect()
    }

    /// Independent acyclicity check over the edge map (Kahn's algorithm).
    ///
    /// Resolution already rejects cycles while walking, so a graph built by
    /// [`IncludeResolver`](super::IncludeResolver) always passes.
    pub fn detect_cycles(&self) -> Result<(), IncludeError> {
        let mut pending: BTreeMap<&Path, usize> = BTreeMap::new();
        let mut dependents: HashMap<&Path, Vec<&Path>> = HashMap::new();

        for (from, targets) in &self.edges {
            pending.entry(from.as_path()).or_insert(0);
            for to in targets {
                pending.entry(to.as_path()).or_insert(0);
                *pending.entry(from.as_path()).or_insert(0) += 1;
                dependents.entry(to.as_path()).or_default().push(from.as_path());
            }
        }

        let mut queue: VecDeque<&Path> = pending
            .iter()
            .filter(|(_, &n)| n == 0)
            .map(|(&p, _)| p)
            .collect();
        let mut resolved = 0usize;

        while let Some(path) = queue.pop_front() {
            resolved += 1;
            if let Some(deps) = dependents.get(path) {
                for dependent in deps {
                    if let Some(count) = pending.get_mut(dependent) {
                        *count -= 1;
                        if *count == 0 {
                            queue.push_back(*dependent);
                        }
                    }
                }
            }
        }

        if resolved == pending.len() {
            Ok(())
        } else {
            let paths = pending
                .into_iter()
                .filter(|(_, n)| *n > 0)
                .map(|(p, _)| p.to_path_buf())
                .collect();
            Err(IncludeError::TopologicalCycle { paths })
        }
    }
}
