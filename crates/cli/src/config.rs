use std::path::Path;

use anyhow::{bail, Context, Result};
use tollgate_core::config::{load_dotenv, SourceMode};
use tollgate_core::PolicyConfig;
use tracing::debug;

/// Resolve the policy config for this invocation.
/// Priority: `--path` > config file > TOLLGATE_* env vars > defaults.
pub fn load(config_path: Option<&Path>, path_override: Option<&Path>) -> Result<PolicyConfig> {
    load_dotenv();

    let mut config = match config_path {
        Some(path) => {
            debug!(path = %path.display(), "loading config file");
            PolicyConfig::from_file(path)
                .with_context(|| format!("failed to load config: {}", path.display()))?
        }
        None => PolicyConfig::from_env().context("failed to load config from environment")?,
    };

    if let Some(path) = path_override {
        if config.mode == SourceMode::Git {
            bail!("--path only applies in file mode");
        }
        config.file_path = path.to_path_buf();
        config.validate().context("invalid --path")?;
    }

    Ok(config)
}
