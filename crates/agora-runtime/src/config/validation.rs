//! Configuration constraints.

use super::error::{ConfigError, ConfigResult};
use super::schema::AgoraConfig;

/// Checks the merged configuration before the runtime starts.
pub fn validate_config(config: &AgoraConfig) -> ConfigResult<()> {
    if config.runtime.workers == 0 {
        return Err(ConfigError::Invalid(
            "at least one worker is required".into(),
        ));
    }
    if config.broker.qos > 2 {
        return Err(ConfigError::Invalid(format!(
            "qos must be within 0..=2, got {}",
            config.broker.qos
        )));
    }
    if config.storage.backend != "fs" {
        return Err(ConfigError::Invalid(format!(
            "unknown storage backend '{}'",
            config.storage.backend
        )));
    }
    if config.plugins.root.as_os_str().is_empty() {
        return Err(ConfigError::Invalid("plugin root must be set".into()));
    }
    if config.plugins.workspace.as_os_str().is_empty() {
        return Err(ConfigError::Invalid("workspace root must be set".into()));
    }
    Ok(())
}
