//! The configuration handed to an external plugin invocation.

use std::collections::BTreeMap;
use std::fmt::{self, Display};

use crate::app_id::ApplicationId;

/// Default name of the environment file a plugin script reads.
pub const PLUGIN_ENV_FILE_NAME: &str = "plugin_config.env";

/// The role of a plugin invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PluginKind {
    /// Produces the design of experiments.
    Doe,
    /// Trains the model of one metric.
    Model,
    /// Clusters the input features.
    Cluster,
    /// Computes the final predictions.
    Prediction,
}

impl Display for PluginKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Doe => "doe",
            Self::Model => "model",
            Self::Cluster => "cluster",
            Self::Prediction => "prediction",
        };
        f.write_str(name)
    }
}

/// Everything one plugin launch needs to know, rendered into the
/// environment file by the storage adapter and written by the launcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginConfiguration {
    /// Name of the environment file inside the plugin workspace.
    pub env_file_name: String,
    /// The application this launch works for.
    pub app_id: ApplicationId,
    /// The target metric, for modelling plugins.
    pub metric_name: Option<String>,
    /// The current iteration number, for modelling plugins.
    pub iteration: Option<u64>,
    /// Pass-through policy parameters, already stringified.
    pub properties: BTreeMap<String, String>,
}

impl PluginConfiguration {
    /// Creates a configuration for a DoE, clustering or prediction launch.
    pub fn new(app_id: ApplicationId) -> Self {
        Self {
            env_file_name: PLUGIN_ENV_FILE_NAME.to_string(),
            app_id,
            metric_name: None,
            iteration: None,
            properties: BTreeMap::new(),
        }
    }

    /// Creates a configuration for a modelling launch.
    pub fn for_metric(app_id: ApplicationId, metric_name: impl Into<String>, iteration: u64) -> Self {
        Self {
            metric_name: Some(metric_name.into()),
            iteration: Some(iteration),
            ..Self::new(app_id)
        }
    }

    /// Adds a pass-through property.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}
