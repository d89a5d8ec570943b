//! Depth-first include resolution with cycle, depth and sandbox checks.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

use tracing::{debug, info};

use crate::error::{IncludeError, LoadError, Result};
use crate::loader::PolicyLoader;

use super::graph::DependencyGraph;

/// Follows `includes` declarations from one or more root documents.
///
/// Include paths are relative to the including document. Every resolved
/// target must stay inside `sandbox_root`, both lexically and after symlinks
/// are resolved.
#[derive(Debug, Clone)]
pub struct IncludeResolver {
    loader: PolicyLoader,
    sandbox_root: PathBuf,
    max_depth: usize,
}

/// Walk state shared across the roots of one resolution.
#[derive(Default)]
struct Walk {
    graph: DependencyGraph,
    stack: Vec<PathBuf>,
    on_stack: HashSet<PathBuf>,
}

impl IncludeResolver {
    /// `sandbox_root` must exist; it is canonicalized here.
    pub fn new(loader: PolicyLoader, sandbox_root: &Path, max_depth: usize) -> Result<Self> {
        let sandbox_root = std::fs::canonicalize(sandbox_root)
            .map_err(|e| LoadError::from_io(sandbox_root, e))?;
        Ok(Self {
            loader,
            sandbox_root,
            max_depth,
        })
    }

    pub fn sandbox_root(&self) -> &Path {
        &self.sandbox_root
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Resolve the include tree below a single root document.
    pub fn resolve_includes(&self, root: &Path) -> Result<DependencyGraph> {
        self.resolve_multiple(&[root])
    }

    /// Resolve several roots into one graph. Documents reachable from more
    /// than one root are loaded once.
    pub fn resolve_multiple<P: AsRef<Path>>(&self, roots: &[P]) -> Result<DependencyGraph> {
        let mut walk = Walk::default();
        for root in roots {
            let root = root.as_ref();
            let canonical = self.loader.canonicalize(root)?;
            self.ensure_sandboxed(&canonical)?;
            self.visit(&canonical, 0, &mut walk)?;
        }
        info!(
            documents = walk.graph.len(),
            roots = roots.len(),
            "resolved policy includes"
        );
        Ok(walk.graph)
    }

    fn visit(&self, path: &Path, depth: usize, walk: &mut Walk) -> Result<()> {
        if walk.graph.contains(path) {
            return Ok(());
        }
        if walk.on_stack.contains(path) {
            let start = walk.stack.iter().position(|p| p == path).unwrap_or(0);
            let mut cycle = walk.stack[start..].to_vec();
            cycle.push(path.to_path_buf());
            return Err(IncludeError::Cycle { cycle }.into());
        }
        if depth > self.max_depth {
            return Err(IncludeError::DepthExceeded {
                path: path.to_path_buf(),
                max: self.max_depth,
            }
            .into());
        }

        walk.stack.push(path.to_path_buf());
        walk.on_stack.insert(path.to_path_buf());

        let policy = self.loader.load_file(path)?;
        let base = path.parent().unwrap_or(&self.sandbox_root);
        let mut includes: Vec<PathBuf> = Vec::with_capacity(policy.includes.len());
        for declared in &policy.includes {
            let target = self.locate(base, declared)?;
            debug!(from = %path.display(), include = %target.display(), "following include");
            self.visit(&target, depth + 1, walk)?;
            if !includes.contains(&target) {
                includes.push(target);
            }
        }

        walk.stack.pop();
        walk.on_stack.remove(path);
        walk.graph.insert(path.to_path_buf(), policy, includes, depth);
        Ok(())
    }

    /// Turn a declared include into a canonical, sandboxed path.
    fn locate(&self, base: &Path, declared: &str) -> Result<PathBuf> {
        let joined = normalize(&base.join(declared));
        self.ensure_sandboxed(&joined)?;
        let canonical = self.loader.canonicalize(&joined)?;
        self.ensure_sandboxed(&canonical)?;
        Ok(canonical)
    }

    fn ensure_sandboxed(&self, path: &Path) -> Result<()> {
        if path.starts_with(&self.sandbox_root) {
            Ok(())
        } else {
            Err(IncludeError::Traversal {
                path: path.to_path_buf(),
                root: self.sandbox_root.clone(),
            }
            .into())
        }
    }
}

/// Lexically collapse `.` and `..` without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if out.file_name().is_some() {
                    out.pop();
                } else if !out.has_root() {
                    out.push(component);
                }
            }
            other => out.push(other),
        }
    }
    out
}
