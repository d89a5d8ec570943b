//! Policy lifecycle for the tollgate gateway.
//!
//! Loads policy documents from a file, a directory or a git working copy,
//! resolves their includes, validates them and publishes them through a
//! copy-on-write [`PolicyRegistry`]. [`PolicyManager`] ties the pieces
//! together and keeps the last good set serving when a reload fails.

pub mod error;
pub mod git;
pub mod loader;
pub mod manager;
pub mod parser;
pub mod registry;
pub mod resolver;
pub mod validator;
pub mod watcher;

pub use error::{PolicyError, Result};
pub use loader::PolicyLoader;
pub use manager::{LoadDiagnostics, ManagerBuilder, ManagerHealth, ManagerState, PolicyManager};
pub use parser::{PolicyParser, YamlPolicyParser};
pub use registry::{PolicyRegistry, RegistrySnapshot, RegistryStats};
pub use resolver::{DependencyGraph, IncludeResolver};
pub use validator::{DefaultValidator, PolicyValidator};
