//! Configuration schema.

use std::fmt::{self, Display};
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Operator-facing log levels, ordered by verbosity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// No logging at all.
    Disabled,
    /// Only warnings.
    Warning,
    /// Operational messages.
    #[default]
    Info,
    /// Chatty per-message detail.
    Pedantic,
    /// Everything.
    Debug,
}

impl LogLevel {
    /// The tracing filter directive this level maps to.
    pub fn as_filter(self) -> &'static str {
        match self {
            Self::Disabled => "off",
            Self::Warning => "warn",
            Self::Info => "info",
            Self::Pedantic => "debug",
            Self::Debug => "trace",
        }
    }
}

impl Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disabled => "disabled",
            Self::Warning => "warning",
            Self::Info => "info",
            Self::Pedantic => "pedantic",
            Self::Debug => "debug",
        };
        f.write_str(name)
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "disabled" | "off" => Ok(Self::Disabled),
            "warning" | "warn" => Ok(Self::Warning),
            "info" => Ok(Self::Info),
            "pedantic" => Ok(Self::Pedantic),
            "debug" => Ok(Self::Debug),
            other => Err(format!("unknown log level '{other}'")),
        }
    }
}

/// Broker connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerSection {
    /// The broker endpoint.
    pub url: String,
    /// Username for authentication, if any.
    pub username: Option<String>,
    /// Password for authentication, if any.
    pub password: Option<String>,
    /// Requested quality-of-service level, `0..=2`.
    pub qos: u8,
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            url: "127.0.0.1:1883".to_string(),
            username: None,
            password: None,
            qos: 2,
        }
    }
}

/// Storage backend settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    /// Backend name; only `fs` ships in-tree.
    pub backend: String,
    /// Root of the storage tree.
    pub root: PathBuf,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            backend: "fs".to_string(),
            root: PathBuf::from("storage"),
        }
    }
}

/// Plugin filesystem settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginSection {
    /// Directory holding one subdirectory per available plugin.
    pub root: PathBuf,
    /// Directory the per-application workspaces are created under.
    pub workspace: PathBuf,
    /// Name of the executable script inside each plugin directory.
    pub script_name: String,
}

impl Default for PluginSection {
    fn default() -> Self {
        Self {
            root: PathBuf::from("plugins"),
            workspace: PathBuf::from("workspaces"),
            script_name: "plugin.sh".to_string(),
        }
    }
}

/// Worker pool and logging settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSection {
    /// Number of message workers; at least one per active application is
    /// recommended.
    pub workers: usize,
    /// Minimum level of logging.
    pub log_level: LogLevel,
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            workers: 3,
            log_level: LogLevel::Info,
        }
    }
}

/// The complete operator configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgoraConfig {
    /// Broker connection settings.
    pub broker: BrokerSection,
    /// Storage backend settings.
    pub storage: StorageSection,
    /// Plugin filesystem settings.
    pub plugins: PluginSection,
    /// Worker pool and logging settings.
    pub runtime: RuntimeSection,
}
