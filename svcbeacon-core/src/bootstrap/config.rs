//! Configuration loading

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::Config;

/// Config file looked up in the working directory when no path is given
pub const DEFAULT_CONFIG_FILE: &str = "svcbeacon.toml";

/// Load configuration from a `.env` file, a config file and the environment
///
/// Config file search order:
/// 1. `explicit_path` (must exist)
/// 2. ./svcbeacon.toml (current working directory)
/// 3. Fall back to environment variables only
///
/// Variables from a `.env` file in the working directory are exported
/// first; variables already set in the process environment win.
pub fn load_config(explicit_path: Option<&str>) -> Result<Config> {
    match dotenvy::dotenv() {
        Ok(path) => eprintln!("Loaded environment from {}", path.display()),
        Err(e) if e.not_found() => {}
        Err(e) => return Err(e).context("Failed to read .env file"),
    }

    let config_path = resolve_config_path(explicit_path)?;

    let config = if let Some(path) = config_path {
        eprintln!("Loading config from {}", path.display());
        Config::load(Some(&path))
            .with_context(|| format!("Could not load configuration from {}", path.display()))?
    } else {
        Config::from_env().context("Could not load environment configuration")?
    };

    Ok(config)
}

fn resolve_config_path(explicit_path: Option<&str>) -> Result<Option<PathBuf>> {
    if let Some(path) = explicit_path {
        let path = PathBuf::from(path);
        if !path.exists() {
            anyhow::bail!("Config file {} does not exist", path.display());
        }
        return Ok(Some(path));
    }

    let cwd = Path::new(DEFAULT_CONFIG_FILE);
    Ok(cwd.exists().then(|| cwd.to_path_buf()))
}
