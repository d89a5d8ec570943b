//! Core [`PolicyLoader`] struct: bounded reads plus atomic directory loads.

use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tollgate_core::config::LoaderLimits;
use tollgate_core::Policy;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::error::{collapse, LoadError, PolicyError, Result};
use crate::parser::{PolicyParser, YamlPolicyParser};

/// Reads policy documents from the local filesystem.
///
/// Cheap to clone; the parser is shared.
#[derive(Clone)]
pub struct PolicyLoader {
    limits: LoaderLimits,
    parser: Arc<dyn PolicyParser>,
}

impl std::fmt::Debug for PolicyLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyLoader")
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl PolicyLoader {
    pub fn new(limits: LoaderLimits, parser: Arc<dyn PolicyParser>) -> Self {
        Self { limits, parser }
    }

    /// Loader backed by [`YamlPolicyParser`].
    pub fn yaml(limits: LoaderLimits) -> Self {
        Self::new(limits, Arc::new(YamlPolicyParser::new()))
    }

    pub fn limits(&self) -> &LoaderLimits {
        &self.limits
    }

    /// Canonicalize `path`, rejecting symlinked documents when symlinks are disabled.
    pub fn canonicalize(&self, path: &Path) -> Result<PathBuf> {
        let meta = fs::symlink_metadata(path).map_err(|e| LoadError::from_io(path, e))?;
        if meta.file_type().is_symlink() && !self.limits.follow_symlinks {
            return Err(LoadError::SymlinkRejected(path.to_path_buf()).into());
        }
        Ok(fs::canonicalize(path).map_err(|e| LoadError::from_io(path, e))?)
    }

    /// Read and parse a single document.
    ///
    /// The returned policy's `source_path` is the canonical path.
    pub fn load_file(&self, path: &Path) -> Result<Policy> {
        let canonical = self.canonicalize(path)?;
        let meta = fs::metadata(&canonical).map_err(|e| LoadError::from_io(&canonical, e))?;
        if !meta.is_file() {
            return Err(LoadError::Io {
                path: canonical,
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "not a regular file",
                ),
            }
            .into());
        }
        if !self.limits.extension_allowed(&canonical) {
            return Err(LoadError::UnsupportedExtension(canonical).into());
        }
        if meta.len() > self.limits.max_file_size {
            return Err(LoadError::TooLarge {
                path: canonical,
                size: meta.len(),
                max: self.limits.max_file_size,
            }
            .into());
        }

        let bytes = self.read_bounded(&canonical)?;
        let policy = self.parser.parse_bytes(&bytes, &canonical)?;
        debug!(policy = %policy.name, path = %canonical.display(), "parsed policy document");
        Ok(policy)
    }

    /// Read at most `max_file_size` bytes; a file that grew past the limit
    /// after the metadata check is still rejected.
    fn read_bounded(&self, path: &Path) -> Result<Vec<u8>> {
        let max = self.limits.max_file_size;
        let file = File::open(path).map_err(|e| LoadError::from_io(path, e))?;
        let mut bytes = Vec::new();
        file.take(max.saturating_add(1))
            .read_to_end(&mut bytes)
            .map_err(|e| LoadError::from_io(path, e))?;
        if bytes.len() as u64 > max {
            return Err(LoadError::TooLarge {
                path: path.to_path_buf(),
                size: bytes.len() as u64,
                max,
            }
            .into());
        }
        Ok(bytes)
    }

    /// List candidate documents under `dir` in a stable (file-name sorted) order.
    ///
    /// Hidden entries are pruned when `skip_hidden` is set; subdirectories are
    /// scanned recursively.
    pub fn discover(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let skip_hidden = self.limits.skip_hidden;
        let walker = WalkDir::new(dir)
            .follow_links(self.limits.follow_symlinks)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !(skip_hidden && LoaderLimits::is_hidden(e.path())));

        let mut paths = Vec::new();
        for entry in walker {
            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(dir).to_path_buf();
                LoadError::from_io(path, e.into())
            })?;
            if !entry.file_type().is_file() && !entry.path_is_symlink() {
                continue;
            }
            if entry.path_is_symlink() && !self.limits.follow_symlinks {
                debug!(path = %entry.path().display(), "skipping symlink");
                continue;
            }
            if self.limits.extension_allowed(entry.path()) {
                paths.push(entry.into_path());
            }
        }
        Ok(paths)
    }

    /// Load every document under `dir`. One bad document fails the whole
    /// batch; every failure is named in the returned error.
    pub fn load_directory(&self, dir: &Path) -> Result<Vec<Policy>> {
        let paths = self.discover(dir)?;
        if paths.is_empty() {
            return Err(LoadError::NoPolicies(dir.to_path_buf()).into());
        }

        let mut policies = Vec::with_capacity(paths.len());
        let mut errors: Vec<PolicyError> = Vec::new();
        for path in &paths {
            match self.load_file(path) {
                Ok(policy) => policies.push(policy),
                Err(e) => errors.push(e),
            }
        }
        collapse(errors)?;

        info!(dir = %dir.display(), count = policies.len(), "loaded policy directory");
        Ok(policies)
    }

    /// Load a file or a directory, whichever `path` names.
    pub fn load_path(&self, path: &Path) -> Result<Vec<Policy>> {
        let meta = fs::metadata(path).map_err(|e| LoadError::from_io(path, e))?;
        if meta.is_dir() {
            self.load_directory(path)
        } else {
            Ok(vec![self.load_file(path)?])
        }
    }
}
