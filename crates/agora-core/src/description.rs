//! The application description carried by a welcome message.
//!
//! A client announces itself with a JSON self-description listing the
//! software knobs it exposes, the input features it observes (possibly
//! none), the metrics it wants predicted and the autotuning policy. Only
//! the block matching the application identifier is retained.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::app_id::ApplicationId;
use crate::error::{ParseError, ParseResult};

/// A software knob: name, value type and exploration domain.
///
/// The domain is either an enumerated list of `values` or a numeric
/// `[min, max, step]` range; at least one of the two must be present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Knob {
    /// The knob name, unique within the block.
    pub name: String,
    /// The value type as declared by the client (e.g. `int`, `string`).
    #[serde(rename = "type")]
    pub value_type: String,
    /// Enumerated domain values.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<Value>,
    /// Numeric range domain: `[min, max, step]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<[f64; 3]>,
}

impl Knob {
    /// Whether values of this knob are quoted on the wire.
    pub fn is_string(&self) -> bool {
        self.value_type == "string"
    }

    fn domain_is_empty(&self) -> bool {
        self.values.is_empty()
            && !matches!(self.range, Some([min, max, step]) if step > 0.0 && min <= max)
    }
}

/// An input feature: same shape as a knob, observed instead of chosen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    /// The feature name, unique within the block.
    pub name: String,
    /// The value type as declared by the client.
    #[serde(rename = "type")]
    pub value_type: String,
    /// Enumerated domain values.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<Value>,
    /// Numeric range domain: `[min, max, step]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<[f64; 3]>,
}

impl Feature {
    fn domain_is_empty(&self) -> bool {
        self.values.is_empty()
            && !matches!(self.range, Some([min, max, step]) if step > 0.0 && min <= max)
    }
}

/// A metric the application wants predicted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    /// The metric name, unique within the block.
    pub name: String,
    /// The value type as declared by the client.
    #[serde(rename = "type")]
    pub value_type: String,
    /// Name of the modelling plugin predicting this metric.
    #[serde(alias = "prediction_method")]
    pub prediction_plugin: String,
    /// Whether the metric is predicted as a `(mean, std)` pair.
    #[serde(default)]
    pub distribution: bool,
}

fn default_observations_per_configuration() -> u32 {
    1
}

/// Accepts both a JSON number and a numeric string, as clients disagree.
fn flexible_u32<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    match &value {
        Value::Number(n) => n
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| serde::de::Error::custom(format!("number {n} is out of range"))),
        Value::String(s) => s
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("'{s}' is not an unsigned integer"))),
        other => Err(serde::de::Error::custom(format!(
            "expected a number, got {other}"
        ))),
    }
}

/// The autotuning policy of a block.
///
/// Everything the orchestrator does not interpret itself is kept verbatim
/// in `extra` and forwarded to the plugins through their environment file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgoraProperties {
    /// Plugin producing the design of experiments.
    pub doe_plugin: String,
    /// Plugin clustering the input features, when features are enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clustering_plugin: Option<String>,
    /// Cap on configurations dispatched per exploration iteration.
    #[serde(deserialize_with = "flexible_u32")]
    pub number_configurations_per_iteration: u32,
    /// Observations requested for each configuration; seeds the DoE
    /// counters.
    #[serde(
        default = "default_observations_per_configuration",
        deserialize_with = "flexible_u32"
    )]
    pub number_observations_per_configuration: u32,
    /// Plugin-opaque parameters, passed through untouched.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// The retained self-description of one application block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockDescription {
    /// The block name; matches the application id.
    pub name: String,
    /// The software knobs, in client order.
    pub knobs: Vec<Knob>,
    /// The input features, in client order; empty means features disabled.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub features: Vec<Feature>,
    /// The metrics to predict, in client order.
    pub metrics: Vec<Metric>,
    /// The autotuning policy.
    pub agora: AgoraProperties,
}

impl BlockDescription {
    /// Whether the application observes input features.
    pub fn features_enabled(&self) -> bool {
        !self.features.is_empty()
    }

    /// The distinct modelling plugins referenced by the metrics.
    pub fn model_plugins(&self) -> BTreeSet<String> {
        self.metrics
            .iter()
            .map(|m| m.prediction_plugin.clone())
            .collect()
    }

    /// Checks the structural invariants of a description.
    pub fn validate(&self) -> ParseResult<()> {
        if self.knobs.is_empty() {
            return Err(ParseError::Invalid("no knobs declared".into()));
        }
        if self.metrics.is_empty() {
            return Err(ParseError::Invalid("no metrics declared".into()));
        }
        if let Some(knob) = self.knobs.iter().find(|k| k.domain_is_empty()) {
            return Err(ParseError::Invalid(format!(
                "knob '{}' has an empty domain",
                knob.name
            )));
        }
        if let Some(feature) = self.features.iter().find(|f| f.domain_is_empty()) {
            return Err(ParseError::Invalid(format!(
                "feature '{}' has an empty domain",
                feature.name
            )));
        }
        if self.features_enabled() && self.agora.clustering_plugin.is_none() {
            return Err(ParseError::Invalid(
                "features are enabled but no clustering plugin is named".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct WelcomeDocument {
    name: String,
    version: String,
    #[serde(default)]
    blocks: Vec<BlockDescription>,
}

/// Parses a welcome payload, retaining the block addressed by `app_id`.
///
/// Unknown fields are ignored; a missing block or a violated invariant is a
/// parse error and the welcome is rejected.
pub fn parse_welcome(payload: &str, app_id: &ApplicationId) -> ParseResult<BlockDescription> {
    let document: WelcomeDocument = serde_json::from_str(payload)?;
    if document.name != app_id.app_name || document.version != app_id.version {
        return Err(ParseError::MissingBlock(app_id.to_string()));
    }
    let block = document
        .blocks
        .into_iter()
        .find(|block| block.name == app_id.block_name)
        .ok_or_else(|| ParseError::MissingBlock(app_id.to_string()))?;
    block.validate()?;
    Ok(block)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn welcome_payload() -> String {
        json!({
            "name": "swaptions",
            "version": "v1",
            "future_field": "ignored",
            "blocks": [{
                "name": "parallel",
                "knobs": [
                    {"name": "threads", "type": "int", "values": [1, 2, 4]},
                    {"name": "variant", "type": "string", "values": ["fast", "precise"]}
                ],
                "features": [
                    {"name": "size", "type": "int", "range": [1.0, 64.0, 1.0]}
                ],
                "metrics": [
                    {"name": "exec_time", "type": "double",
                     "prediction_plugin": "ridge", "distribution": true},
                    {"name": "energy", "type": "double", "prediction_plugin": "ridge"}
                ],
                "agora": {
                    "doe_plugin": "full_factorial",
                    "clustering_plugin": "kmeans",
                    "number_configurations_per_iteration": "3",
                    "number_observations_per_configuration": 2,
                    "max_mae": 0.5,
                    "min_r2": "0.9"
                }
            }]
        })
        .to_string()
    }

    #[test]
    fn parses_the_matching_block() {
        let aid = ApplicationId::new("swaptions", "v1", "parallel");
        let block = parse_welcome(&welcome_payload(), &aid).unwrap();

        assert_eq!(block.knobs.len(), 2);
        assert!(block.knobs[1].is_string());
        assert!(block.features_enabled());
        assert_eq!(block.agora.number_configurations_per_iteration, 3);
        assert_eq!(block.agora.number_observations_per_configuration, 2);
        assert_eq!(
            block.model_plugins().into_iter().collect::<Vec<_>>(),
            vec!["ridge".to_string()]
        );
        // Opaque parameters ride through untouched.
        assert_eq!(block.agora.extra.get("max_mae"), Some(&json!(0.5)));
        assert_eq!(block.agora.extra.get("min_r2"), Some(&json!("0.9")));
    }

    #[test]
    fn rejects_a_mismatched_identifier() {
        let aid = ApplicationId::new("swaptions", "v2", "parallel");
        assert!(matches!(
            parse_welcome(&welcome_payload(), &aid),
            Err(ParseError::MissingBlock(_))
        ));

        let aid = ApplicationId::new("swaptions", "v1", "serial");
        assert!(matches!(
            parse_welcome(&welcome_payload(), &aid),
            Err(ParseError::MissingBlock(_))
        ));
    }

    #[test]
    fn rejects_structural_violations() {
        let aid = ApplicationId::new("app", "v1", "blk");
        let no_knobs = json!({
            "name": "app", "version": "v1",
            "blocks": [{
                "name": "blk",
                "knobs": [],
                "metrics": [{"name": "m", "type": "int", "prediction_plugin": "p"}],
                "agora": {"doe_plugin": "d", "number_configurations_per_iteration": 1}
            }]
        });
        assert!(matches!(
            parse_welcome(&no_knobs.to_string(), &aid),
            Err(ParseError::Invalid(_))
        ));

        let empty_domain = json!({
            "name": "app", "version": "v1",
            "blocks": [{
                "name": "blk",
                "knobs": [{"name": "k", "type": "int"}],
                "metrics": [{"name": "m", "type": "int", "prediction_plugin": "p"}],
                "agora": {"doe_plugin": "d", "number_configurations_per_iteration": 1}
            }]
        });
        assert!(matches!(
            parse_welcome(&empty_domain.to_string(), &aid),
            Err(ParseError::Invalid(_))
        ));
    }

    #[test]
    fn survives_a_description_round_trip() {
        let aid = ApplicationId::new("swaptions", "v1", "parallel");
        let block = parse_welcome(&welcome_payload(), &aid).unwrap();
        let serialized = serde_json::to_string(&block).unwrap();
        let reloaded: BlockDescription = serde_json::from_str(&serialized).unwrap();
        assert_eq!(reloaded, block);
    }
}
