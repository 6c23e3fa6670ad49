//! Configuration loading: defaults ← TOML file ← `AGORA_*` environment.

use std::path::{Path, PathBuf};

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use tracing::debug;

use super::error::{ConfigError, ConfigResult};
use super::schema::AgoraConfig;
use super::validation::validate_config;

const CONFIG_FILE_NAME: &str = "agora.toml";

/// Environment variables use a double underscore as the section separator,
/// e.g. `AGORA_BROKER__URL`.
const ENV_PREFIX: &str = "AGORA_";

fn candidate_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Ok(cwd) = std::env::current_dir() {
        paths.push(cwd.join(CONFIG_FILE_NAME));
    }
    if let Some(config_dir) = dirs::config_dir() {
        paths.push(config_dir.join("agora").join(CONFIG_FILE_NAME));
    }
    paths
}

fn extract(figment: Figment) -> ConfigResult<AgoraConfig> {
    let config: AgoraConfig = figment.extract()?;
    validate_config(&config)?;
    Ok(config)
}

/// Loads the configuration from the first `agora.toml` found in the search
/// path, merged with the environment. Missing files mean defaults.
pub fn load_config() -> ConfigResult<AgoraConfig> {
    let mut figment = Figment::from(Serialized::defaults(AgoraConfig::default()));
    for path in candidate_paths() {
        if path.is_file() {
            debug!(path = %path.display(), "loading configuration file");
            figment = figment.merge(Toml::file(&path));
            break;
        }
    }
    extract(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
}

/// Loads the configuration from a specific file, merged with the
/// environment.
pub fn load_config_from_file(path: impl AsRef<Path>) -> ConfigResult<AgoraConfig> {
    let path = path.as_ref();
    if !path.is_file() {
        return Err(ConfigError::FileNotFound(path.to_path_buf()));
    }
    let figment = Figment::from(Serialized::defaults(AgoraConfig::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed(ENV_PREFIX).split("__"));
    extract(figment)
}
