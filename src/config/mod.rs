pub mod accounts;
pub mod types;

use std::path::{Path, PathBuf};

use crate::common::error::{ProxyError, Result};

pub use types::Config;

/// Config file inside the `-c` root, one per role.
pub fn config_path(root: &str, server_role: bool) -> PathBuf {
    let name = if server_role { "exit.yaml" } else { "edge.yaml" };
    Path::new(root).join(name)
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        ProxyError::Config(format!("read {}: {}", path.display(), e))
    })?;
    let config: Config = serde_yml::from_str(&content)
        .map_err(|e| ProxyError::Config(format!("parse {}: {}", path.display(), e)))?;
    config.validate()?;
    Ok(config)
}
