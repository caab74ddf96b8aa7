//! Configuration loading

use anyhow::{bail, Result};
use config::Map;
use std::path::Path;

use crate::Config;

const CONFIG_PATH_ENV: &str = "ACEPROXY_CONFIG_PATH";
const DEFAULT_CONFIG_PATHS: [&str; 2] = ["config.yaml", "/config/config.yaml"];

/// Load configuration from config file or environment variables
///
/// Config file search order:
/// 1. `explicit_path` (from the command line)
/// 2. `ACEPROXY_CONFIG_PATH` environment variable
/// 3. ./config.yaml (current working directory)
/// 4. /config/config.yaml (container mount path)
/// 5. Fall back to environment variables only
///
/// A path named by 1 or 2 must exist. Runs before logging is initialized, so
/// progress goes to stderr.
pub fn load_config(explicit_path: Option<&str>) -> Result<Config> {
    load_config_from(explicit_path, std::env::var(CONFIG_PATH_ENV).ok(), None)
}

fn load_config_from(
    explicit_path: Option<&str>,
    env_path: Option<String>,
    env: Option<Map<String, String>>,
) -> Result<Config> {
    let config_path = match (explicit_path, env_path.filter(|p| !p.is_empty())) {
        (Some(path), _) => Some(require_file(path, "--config")?),
        (None, Some(path)) => Some(require_file(&path, CONFIG_PATH_ENV)?),
        (None, None) => DEFAULT_CONFIG_PATHS
            .into_iter()
            .find(|p| Path::new(p).exists())
            .map(str::to_string),
    };

    let config = if let Some(path) = config_path {
        eprintln!("Loading config from {path}");
        Config::load_with_env(Some(&path), env)
            .map_err(|e| anyhow::anyhow!("Failed to load {path}: {e}"))?
    } else {
        eprintln!("No config file found, using environment variables");
        Config::load_with_env(None, env)
            .map_err(|e| anyhow::anyhow!("Failed to load config from environment: {e}"))?
    };

    // Invalid bounds are a startup failure, never a request-time one
    if let Err(errors) = config.validate() {
        for error in &errors {
            eprintln!("Config validation error: {error}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s): {}",
            errors.len(),
            errors.join("; ")
        ));
    }

    Ok(config)
}

fn require_file(path: &str, source: &str) -> Result<String> {
    if !Path::new(path).is_file() {
        bail!("Config file {path} given by {source} does not exist");
    }
    Ok(path.to_string())
}
