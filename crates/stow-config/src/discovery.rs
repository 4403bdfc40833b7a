//! Config file discovery.
//!
//! Resolution order (first match wins):
//! 1. Path in the `STOW_CONFIG` environment variable
//! 2. `./stow.toml` (or the given project directory)
//! 3. Built-in defaults

use std::path::{Path, PathBuf};

use crate::{ConfigError, Result, SessionConfig};

/// Default config filename for project-local config.
const PROJECT_CONFIG_FILE: &str = "stow.toml";

/// Environment variable pointing at an explicit config file.
pub const CONFIG_ENV_VAR: &str = "STOW_CONFIG";

/// Load config from a specific file path (no discovery).
pub fn load_config_file(path: &Path) -> Result<SessionConfig> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.display().to_string(),
        source: e,
    })?;
    SessionConfig::from_toml(&contents)
}

/// Discover and load the session configuration.
///
/// A missing project file is not an error; defaults are returned instead.
/// An explicit `STOW_CONFIG` path that cannot be read is an error.
pub fn load_config(project_dir: Option<&Path>) -> Result<SessionConfig> {
    if let Ok(explicit) = std::env::var(CONFIG_ENV_VAR)
        && !explicit.is_empty()
    {
        return load_config_file(Path::new(&explicit));
    }

    let project_path = project_dir
        .map(|d| d.join(PROJECT_CONFIG_FILE))
        .unwrap_or_else(|| PathBuf::from(PROJECT_CONFIG_FILE));
    if project_path.exists() {
        return load_config_file(&project_path);
    }

    Ok(SessionConfig::default())
}
