use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

fn env_bool(key: &str) -> Option<bool> {
    env_opt(key).and_then(|v| match v.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    })
}

// ── Top-level config ──────────────────────────────────────────

/// Where policy documents come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SourceMode {
    /// A single file or a directory on the local filesystem.
    #[default]
    File,
    /// A local working copy of a git repository.
    Git,
}

impl fmt::Display for SourceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceMode::File => write!(f, "file"),
            SourceMode::Git => write!(f, "git"),
        }
    }
}

impl FromStr for SourceMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file" => Ok(SourceMode::File),
            "git" => Ok(SourceMode::Git),
            other => Err(ConfigError::Invalid(format!(
                "unknown mode '{other}', expected 'file' or 'git'"
            ))),
        }
    }
}

/// Configuration consumed by the policy lifecycle subsystem.
///
/// Parsed from TOML with `TOLLGATE_*` environment overrides. Every component
/// receives the section it needs at construction time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default)]
    pub mode: SourceMode,

    /// Policy file or directory (file mode).
    #[serde(default = "default_file_path")]
    pub file_path: PathBuf,

    /// Reload automatically when the source changes.
    #[serde(default)]
    pub watch: bool,

    /// Sandbox root for include resolution. Defaults to the policy directory.
    #[serde(default)]
    pub include_root: Option<PathBuf>,

    #[serde(default)]
    pub validation: ValidationConfig,

    #[serde(default)]
    pub loader: LoaderLimits,

    #[serde(default)]
    pub watcher: WatcherConfig,

    /// Required when `mode = "git"`.
    #[serde(default)]
    pub git: Option<GitConfig>,
}

fn default_file_path() -> PathBuf {
    PathBuf::from("policies")
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            mode: SourceMode::File,
            file_path: default_file_path(),
            watch: false,
            include_root: None,
            validation: ValidationConfig::default(),
            loader: LoaderLimits::default(),
            watcher: WatcherConfig::default(),
            git: None,
        }
    }
}

// ── Section configs ───────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Abort on the first invalid policy instead of collecting every error.
    #[serde(default = "default_true")]
    pub strict: bool,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            strict: true,
        }
    }
}

/// Limits enforced when reading policy documents from storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoaderLimits {
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    #[serde(default = "default_max_include_depth")]
    pub max_include_depth: usize,
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,
    #[serde(default = "default_true")]
    pub follow_symlinks: bool,
    #[serde(default = "default_true")]
    pub skip_hidden: bool,
}

fn default_max_file_size() -> u64 {
    10 * 1024 * 1024
}

fn default_max_include_depth() -> usize {
    10
}

fn default_allowed_extensions() -> Vec<String> {
    vec![".yaml".into(), ".yml".into()]
}

impl Default for LoaderLimits {
    fn default() -> Self {
        Self {
            max_file_size: default_max_file_size(),
            max_include_depth: default_max_include_depth(),
            allowed_extensions: default_allowed_extensions(),
            follow_symlinks: true,
            skip_hidden: true,
        }
    }
}

impl LoaderLimits {
    /// Whether `path` carries one of the allowed extensions (case-insensitive).
    pub fn extension_allowed(&self, path: &Path) -> bool {
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            return false;
        };
        self.allowed_extensions
            .iter()
            .any(|allowed| allowed.trim_start_matches('.').eq_ignore_ascii_case(ext))
    }

    /// Whether `path` names a dot-prefixed file or directory.
    pub fn is_hidden(path: &Path) -> bool {
        path.file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with('.'))
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

fn default_debounce_ms() -> u64 {
    100
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
        }
    }
}

impl WatcherConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

/// Git-backed policy source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitConfig {
    /// Remote URL (https, ssh, or a local path).
    pub repository: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    /// Policy file or directory inside the repository. Empty = repository root.
    #[serde(default)]
    pub path: PathBuf,
    #[serde(default)]
    pub auth: GitAuthConfig,
    #[serde(default)]
    pub poll: GitPollConfig,
    #[serde(default)]
    pub clone: GitCloneConfig,
}

fn default_branch() -> String {
    "main".into()
}

impl GitConfig {
    pub fn new(repository: impl Into<String>, local_path: impl Into<PathBuf>) -> Self {
        Self {
            repository: repository.into(),
            branch: default_branch(),
            path: PathBuf::new(),
            auth: GitAuthConfig::default(),
            poll: GitPollConfig::default(),
            clone: GitCloneConfig {
                local_path: local_path.into(),
                ..GitCloneConfig::default()
            },
        }
    }

    /// Directory or file inside the working copy that holds the policies.
    pub fn policy_path(&self) -> PathBuf {
        if self.path.as_os_str().is_empty() {
            self.clone.local_path.clone()
        } else {
            self.clone.local_path.join(&self.path)
        }
    }
}

/// Credentials for the remote. The token is never printed.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct GitAuthConfig {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub ssh_key_path: Option<PathBuf>,
}

impl fmt::Debug for GitAuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GitAuthConfig")
            .field("username", &self.username)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("ssh_key_path", &self.ssh_key_path)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitPollConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_poll_interval")]
    pub interval_secs: u64,
    /// Upper bound for a single git operation.
    #[serde(default = "default_poll_timeout")]
    pub timeout_secs: u64,
}

fn default_poll_interval() -> u64 {
    60
}

fn default_poll_timeout() -> u64 {
    30
}

impl Default for GitPollConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_poll_interval(),
            timeout_secs: default_poll_timeout(),
        }
    }
}

impl GitPollConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitCloneConfig {
    /// Shallow clone depth; 0 clones the full history.
    #[serde(default)]
    pub depth: u32,
    #[serde(default = "default_local_path")]
    pub local_path: PathBuf,
    /// Remove any existing working copy and clone fresh on startup.
    #[serde(default)]
    pub clean_on_start: bool,
}

fn default_local_path() -> PathBuf {
    PathBuf::from("data/policy-repo")
}

impl Default for GitCloneConfig {
    fn default() -> Self {
        Self {
            depth: 0,
            local_path: default_local_path(),
            clean_on_start: false,
        }
    }
}

fn default_true() -> bool {
    true
}

// ── Loading & Validation ──────────────────────────────────────

impl PolicyConfig {
    /// Config for a single file or directory with default limits.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            file_path: path.into(),
            ..Self::default()
        }
    }

    /// Config for a git-backed source.
    pub fn git(git: GitConfig) -> Self {
        Self {
            mode: SourceMode::Git,
            git: Some(git),
            ..Self::default()
        }
    }

    /// Parse config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Build config from defaults plus environment variables only.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Directory or file the policies are read from, for either mode.
    pub fn policy_path(&self) -> PathBuf {
        match (self.mode, &self.git) {
            (SourceMode::Git, Some(git)) => git.policy_path(),
            _ => self.file_path.clone(),
        }
    }

    // ── Environment variable overrides ──────────────────────────

    /// Apply environment variable overrides.
    ///
    /// Convention: `TOLLGATE_SECTION_KEY` overrides `section.key`.
    /// - `TOLLGATE_MODE` → `mode`
    /// - `TOLLGATE_FILE_PATH` → `file_path`
    /// - `TOLLGATE_WATCH` → `watch`
    /// - `TOLLGATE_VALIDATION_STRICT` → `validation.strict`
    /// - `TOLLGATE_GIT_REPOSITORY` → `git.repository` (creates the section)
    /// - `TOLLGATE_GIT_BRANCH` → `git.branch`
    /// - `TOLLGATE_GIT_TOKEN` → `git.auth.token`
    /// - `TOLLGATE_GIT_POLL_INTERVAL_SECS` → `git.poll.interval_secs`
    fn apply_env_overrides(&mut self) {
        if let Some(v) = env_opt("TOLLGATE_MODE") {
            match v.parse() {
                Ok(mode) => self.mode = mode,
                Err(e) => tracing::warn!(error = %e, "ignoring TOLLGATE_MODE"),
            }
        }
        if let Some(v) = env_opt("TOLLGATE_FILE_PATH") {
            self.file_path = PathBuf::from(v);
        }
        if let Some(v) = env_bool("TOLLGATE_WATCH") {
            self.watch = v;
        }
        if let Some(v) = env_bool("TOLLGATE_VALIDATION_STRICT") {
            self.validation.strict = v;
        }
        if let Some(v) = env_opt("TOLLGATE_GIT_REPOSITORY") {
            match self.git.as_mut() {
                Some(git) => git.repository = v,
                None => self.git = Some(GitConfig::new(v, default_local_path())),
            }
        }
        if let Some(git) = self.git.as_mut() {
            if let Some(v) = env_opt("TOLLGATE_GIT_BRANCH") {
                git.branch = v;
            }
            if let Some(v) = env_opt("TOLLGATE_GIT_TOKEN") {
                git.auth.token = Some(v);
            }
            if let Some(v) = env_opt("TOLLGATE_GIT_POLL_INTERVAL_SECS") {
                if let Ok(secs) = v.parse::<u64>() {
                    git.poll.interval_secs = secs;
                }
            }
        }
    }

    // ── Validation ──────────────────────────────────────────────

    /// Reject configurations the lifecycle layer cannot act on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.loader.max_file_size == 0 {
            return Err(ConfigError::Invalid(
                "loader.max_file_size must be greater than zero".into(),
            ));
        }
        if self.loader.allowed_extensions.is_empty() {
            return Err(ConfigError::Invalid(
                "loader.allowed_extensions must not be empty".into(),
            ));
        }
        match self.mode {
            SourceMode::File => {
                if self.file_path.as_os_str().is_empty() {
                    return Err(ConfigError::Invalid(
                        "file_path is required in file mode".into(),
                    ));
                }
            }
            SourceMode::Git => {
                let git = self.git.as_ref().ok_or_else(|| {
                    ConfigError::Invalid("[git] section is required in git mode".into())
                })?;
                if git.repository.trim().is_empty() {
                    return Err(ConfigError::Invalid("git.repository must be set".into()));
                }
                if git.branch.trim().is_empty() || git.branch.starts_with('-') {
                    return Err(ConfigError::Invalid(format!(
                        "invalid git.branch '{}'",
                        git.branch
                    )));
                }
                if git.poll.enabled && git.poll.interval_secs == 0 {
                    return Err(ConfigError::Invalid(
                        "git.poll.interval_secs must be greater than zero".into(),
                    ));
                }
                if git.poll.timeout_secs == 0 {
                    return Err(ConfigError::Invalid(
                        "git.poll.timeout_secs must be greater than zero".into(),
                    ));
                }
                if git.path.is_absolute() {
                    return Err(ConfigError::Invalid(
                        "git.path must be relative to the repository root".into(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Print a redacted summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Policy config loaded (mode: {}):", self.mode);
        tracing::info!("  source:      {}", self.policy_path().display());
        tracing::info!("  watch:       {}", self.watch);
        tracing::info!(
            "  validation:  enabled={}, strict={}",
            self.validation.enabled,
            self.validation.strict
        );
        if let Some(git) = &self.git {
            tracing::info!(
                "  git:         branch={}, poll={}s, auth={}",
                git.branch,
                git.poll.interval_secs,
                if git.auth.token.is_some() {
                    "token"
                } else if git.auth.ssh_key_path.is_some() {
                    "ssh-key"
                } else {
                    "none"
                }
            );
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_toml() {
        let cfg = PolicyConfig::from_toml("file_path = \"/etc/tollgate/policies\"\n").unwrap();
        assert_eq!(cfg.mode, SourceMode::File);
        assert_eq!(cfg.file_path, PathBuf::from("/etc/tollgate/policies"));
        assert!(cfg.validation.enabled);
        assert!(cfg.validation.strict);
        assert_eq!(cfg.loader.max_file_size, 10 * 1024 * 1024);
        assert_eq!(cfg.loader.max_include_depth, 10);
        assert_eq!(cfg.watcher.debounce(), Duration::from_millis(100));
    }

    #[test]
    fn parse_git_toml() {
        let toml = r#"
mode = "git"
watch = true

[validation]
strict = false

[git]
repository = "https://git.example.com/org/policies.git"
branch = "release"
path = "gateway"

[git.auth]
token = "s3cr3t"

[git.poll]
interval_secs = 15

[git.clone]
depth = 1
local_path = "/var/lib/tollgate/repo"
clean_on_start = true
"#;
        let cfg = PolicyConfig::from_toml(toml).unwrap();
        assert_eq!(cfg.mode, SourceMode::Git);
        assert!(!cfg.validation.strict);
        let git = cfg.git.as_ref().unwrap();
        assert_eq!(git.branch, "release");
        assert_eq!(git.poll.interval(), Duration::from_secs(15));
        assert_eq!(git.poll.timeout(), Duration::from_secs(30));
        assert!(git.clone.clean_on_start);
        assert_eq!(
            cfg.policy_path(),
            PathBuf::from("/var/lib/tollgate/repo/gateway")
        );
        assert!(!format!("{:?}", git.auth).contains("s3cr3t"));
    }

    #[test]
    fn git_mode_requires_repository() {
        let err = PolicyConfig::from_toml("mode = \"git\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn unknown_mode_is_rejected() {
        assert!(PolicyConfig::from_toml("mode = \"svn\"\n").is_err());
        assert!("svn".parse::<SourceMode>().is_err());
    }

    #[test]
    fn extension_matching_is_case_insensitive() {
        let limits = LoaderLimits::default();
        assert!(limits.extension_allowed(Path::new("a/b.yaml")));
        assert!(limits.extension_allowed(Path::new("a/b.YML")));
        assert!(!limits.extension_allowed(Path::new("a/b.json")));
        assert!(!limits.extension_allowed(Path::new("a/noext")));
        assert!(LoaderLimits::is_hidden(Path::new("a/.b.yaml")));
        assert!(!LoaderLimits::is_hidden(Path::new("a/b.yaml")));
    }
}
