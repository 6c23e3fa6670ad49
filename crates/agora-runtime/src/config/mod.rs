//! Operator configuration: schema, loading and validation.

mod error;
mod loader;
mod schema;
mod validation;

pub use error::{ConfigError, ConfigResult};
pub use loader::{load_config, load_config_from_file};
pub use schema::{
    AgoraConfig, BrokerSection, LogLevel, PluginSection, RuntimeSection, StorageSection,
};
pub use validation::validate_config;
