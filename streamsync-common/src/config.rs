//! Configuration file resolution and loading
//!
//! Engine configuration is located using this priority order:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable
//! 3. User config directory (`<config_dir>/streamsync/engine.toml`)
//! 4. System config file (`/etc/streamsync/engine.toml`, Linux only)
//!
//! When none of these exist the caller falls back to built-in defaults.

use crate::{Error, Result};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Environment variable consulted when no CLI path is given
pub const CONFIG_ENV_VAR: &str = "STREAMSYNC_CONFIG";

/// File name looked up in the platform config directories
pub const CONFIG_FILE_NAME: &str = "engine.toml";

/// Resolve the configuration file path.
///
/// An explicitly requested path (CLI or environment) must exist, otherwise an
/// error is returned. Implicit locations are only used when present; `Ok(None)`
/// means "use built-in defaults".
pub fn resolve_config_path(cli_arg: Option<&Path>, env_var_name: &str) -> Result<Option<PathBuf>> {
    // Priority 1: Command-line argument
    if let Some(path) = cli_arg {
        return require_exists(path.to_path_buf());
    }

    // Priority 2: Environment variable
    if let Ok(path) = std::env::var(env_var_name) {
        if !path.is_empty() {
            return require_exists(PathBuf::from(path));
        }
    }

    // Priority 3/4: platform locations
    Ok(default_config_locations().into_iter().find(|p| p.exists()))
}

fn require_exists(path: PathBuf) -> Result<Option<PathBuf>> {
    if path.exists() {
        Ok(Some(path))
    } else {
        Err(Error::Config(format!("Config file not found: {:?}", path)))
    }
}

/// Candidate config file locations for the platform, most specific first
pub fn default_config_locations() -> Vec<PathBuf> {
    let mut locations = Vec::new();

    if let Some(dir) = dirs::config_dir() {
        locations.push(dir.join("streamsync").join(CONFIG_FILE_NAME));
    }

    if cfg!(target_os = "linux") {
        locations.push(PathBuf::from("/etc/streamsync").join(CONFIG_FILE_NAME));
    }

    locations
}

/// Parse a TOML document into `T`
pub fn parse_toml<T: DeserializeOwned>(content: &str) -> Result<T> {
    toml::from_str(content).map_err(|e| Error::Config(format!("Failed to parse TOML: {}", e)))
}

/// Load and parse a TOML file into `T`
pub fn load_toml_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    debug!("Reading config file {:?}", path);
    let content = std::fs::read_to_string(path)?;
    let value = parse_toml(&content)?;
    info!("Loaded configuration from {:?}", path);
    Ok(value)
}

/// Resolve and load configuration, or return `T::default()` when no file exists
pub fn load_or_default<T: DeserializeOwned + Default>(
    cli_arg: Option<&Path>,
    env_var_name: &str,
) -> Result<T> {
    match resolve_config_path(cli_arg, env_var_name)? {
        Some(path) => load_toml_file(&path),
        None => {
            info!("No config file found, using built-in defaults");
            Ok(T::default())
        }
    }
}
