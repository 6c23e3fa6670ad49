//! Input-feature clusters produced by the clustering plugin.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One cluster representative in the feature space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Centroid {
    /// Identifier assigned by the clustering plugin.
    pub id: String,
    /// Feature name to stringified value.
    pub features: BTreeMap<String, String>,
}

/// The ordered list of centroids for an application.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    /// The centroids, in plugin order.
    pub centroids: Vec<Centroid>,
}

impl Cluster {
    /// Whether at least one centroid is available.
    pub fn is_valid(&self) -> bool {
        !self.centroids.is_empty()
    }

    /// Drops every centroid.
    pub fn clear(&mut self) {
        self.centroids.clear();
    }
}
