//! Parser seam: raw document bytes → [`Policy`].
//!
//! The lifecycle layer only needs [`PolicyParser`]; [`YamlPolicyParser`] is the
//! default implementation backed by `serde_yaml`.

use std::fs;
use std::path::Path;

use tollgate_core::Policy;

use crate::error::{LoadError, ParseError, PolicyError, Result};

/// Turns a policy document into a structured [`Policy`].
pub trait PolicyParser: Send + Sync {
    /// Parse an in-memory document. `source` is recorded as the policy's location.
    fn parse_bytes(&self, bytes: &[u8], source: &Path) -> Result<Policy>;

    /// Read and parse a document from disk.
    fn parse(&self, path: &Path) -> Result<Policy> {
        let bytes = fs::read(path).map_err(|e| LoadError::from_io(path, e))?;
        self.parse_bytes(&bytes, path)
    }
}

/// YAML policy parser.
#[derive(Debug, Clone, Default)]
pub struct YamlPolicyParser;

impl YamlPolicyParser {
    pub fn new() -> Self {
        Self
    }
}

impl PolicyParser for YamlPolicyParser {
    fn parse_bytes(&self, bytes: &[u8], source: &Path) -> Result<Policy> {
        let text = std::str::from_utf8(bytes)
            .map_err(|_| LoadError::InvalidEncoding(source.to_path_buf()))?;

        if text.trim().is_empty() {
            return Err(PolicyError::Parse(ParseError {
                path: source.to_path_buf(),
                line: None,
                column: None,
                message: "document is empty".into(),
            }));
        }

        let policy: Policy = serde_yaml::from_str(text).map_err(|e| {
            let location = e.location();
            ParseError {
                path: source.to_path_buf(),
                line: location.as_ref().map(|l| l.line()),
                column: location.as_ref().map(|l| l.column()),
                message: e.to_string(),
            }
        })?;

        Ok(policy.with_source(source))
    }
}
