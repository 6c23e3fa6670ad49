//! The application knowledge: the prediction table broadcast to clients.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::doe::Configuration;

/// The predicted value of one metric for one row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricEstimate {
    /// The predicted mean, stringified.
    pub mean: String,
    /// The predicted standard deviation for distribution metrics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub std: Option<String>,
}

/// One predicted operating point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredictionRow {
    /// The configuration the row predicts for.
    pub configuration: Configuration,
    /// Feature values, empty when features are disabled.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub features: BTreeMap<String, String>,
    /// Metric name to predicted estimate.
    pub metrics: BTreeMap<String, MetricEstimate>,
}

/// The finite list of predicted rows produced by the prediction plugin.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prediction {
    /// The predicted rows, in plugin order.
    pub rows: Vec<PredictionRow>,
}

impl Prediction {
    /// Whether at least one row is available.
    pub fn is_valid(&self) -> bool {
        !self.rows.is_empty()
    }

    /// Drops every row.
    pub fn clear(&mut self) {
        self.rows.clear();
    }
}
