//! Operating points and the wire JSON they travel as.
//!
//! Observations, explore commands and the prediction broadcast all share
//! one document shape: `{"<block>": [{"knobs": …, "features": …,
//! "metrics": …}]}`. Two cosmetic constraints apply on emission: values
//! that are numbers must be emitted as JSON numbers (numeric strings never
//! gain quotes) and no trailing newline is appended.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::description::BlockDescription;
use crate::doe::Configuration;
use crate::error::{ParseError, ParseResult};
use crate::prediction::Prediction;

/// Sentinel used to fill feature and metric fields of an explore command,
/// keeping the on-the-wire schema identical to observations.
const SENTINEL: i64 = 9999;

/// The observed value of one metric.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    /// A plain scalar sample.
    Scalar(String),
    /// A `(mean, std)` pair for distribution metrics.
    Distribution {
        /// The sample mean.
        mean: String,
        /// The sample standard deviation.
        std: String,
    },
}

/// A concrete `(knobs, features?, metrics)` tuple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatingPoint {
    /// Knob name to stringified value.
    pub knobs: Configuration,
    /// Feature name to stringified value; empty when features are disabled.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub features: BTreeMap<String, String>,
    /// Metric name to observed value.
    pub metrics: BTreeMap<String, MetricValue>,
}

/// Splits an observation payload into `(seconds, nanoseconds, json)`.
pub fn split_observation(payload: &str) -> ParseResult<(i64, i64, &str)> {
    let mut parts = payload.splitn(3, ' ');
    let (Some(sec), Some(ns), Some(rest)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(ParseError::MalformedObservation(payload.to_string()));
    };
    let sec = sec
        .parse()
        .map_err(|_| ParseError::MalformedObservation(payload.to_string()))?;
    let ns = ns
        .parse()
        .map_err(|_| ParseError::MalformedObservation(payload.to_string()))?;
    Ok((sec, ns, rest))
}

/// Renders a JSON value as the bare string the data model stores.
fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Renders a stored string as the JSON value the wire carries: numbers stay
/// numbers, string-typed fields stay strings.
fn wire_value(value_type: &str, raw: &str) -> Value {
    if value_type == "string" {
        return Value::String(raw.to_string());
    }
    if let Ok(n) = raw.parse::<i64>() {
        return Value::from(n);
    }
    if let Ok(f) = raw.parse::<f64>()
        && let Some(n) = serde_json::Number::from_f64(f)
    {
        return Value::Number(n);
    }
    Value::String(raw.to_string())
}

fn fields_of<'a>(op: &'a Value, section: &str) -> ParseResult<&'a Map<String, Value>> {
    op.get(section)
        .and_then(Value::as_object)
        .ok_or_else(|| ParseError::Inconsistent(format!("missing '{section}' section")))
}

/// Parses the single operating point of an observation document, checking
/// it against the application description.
pub fn parse_operating_point(
    payload: &str,
    description: &BlockDescription,
) -> ParseResult<OperatingPoint> {
    let document: Value = serde_json::from_str(payload)?;
    let op = document
        .get(&description.name)
        .and_then(Value::as_array)
        .and_then(|ops| ops.first())
        .ok_or_else(|| {
            ParseError::Inconsistent(format!("no operating point for block '{}'", description.name))
        })?;

    let knob_fields = fields_of(op, "knobs")?;
    let mut knobs = Configuration::new();
    for knob in &description.knobs {
        let value = knob_fields
            .get(&knob.name)
            .ok_or_else(|| ParseError::Inconsistent(format!("missing knob '{}'", knob.name)))?;
        knobs.insert(knob.name.clone(), stringify(value));
    }

    let mut features = BTreeMap::new();
    if description.features_enabled() {
        let feature_fields = fields_of(op, "features")?;
        for feature in &description.features {
            let value = feature_fields.get(&feature.name).ok_or_else(|| {
                ParseError::Inconsistent(format!("missing feature '{}'", feature.name))
            })?;
            features.insert(feature.name.clone(), stringify(value));
        }
    }

    let metric_fields = fields_of(op, "metrics")?;
    let mut metrics = BTreeMap::new();
    for metric in &description.metrics {
        let value = metric_fields
            .get(&metric.name)
            .ok_or_else(|| ParseError::Inconsistent(format!("missing metric '{}'", metric.name)))?;
        let observed = if metric.distribution {
            let pair = value.as_array().filter(|a| a.len() == 2).ok_or_else(|| {
                ParseError::Inconsistent(format!(
                    "metric '{}' must be a [mean, std] pair",
                    metric.name
                ))
            })?;
            MetricValue::Distribution {
                mean: stringify(&pair[0]),
                std: stringify(&pair[1]),
            }
        } else {
            MetricValue::Scalar(stringify(value))
        };
        metrics.insert(metric.name.clone(), observed);
    }

    Ok(OperatingPoint {
        knobs,
        features,
        metrics,
    })
}

fn wrap(description: &BlockDescription, ops: Vec<Value>) -> String {
    let mut root = Map::new();
    root.insert(description.name.clone(), Value::Array(ops));
    Value::Object(root).to_string()
}

/// Composes the explore payload for one configuration.
///
/// Feature and metric fields carry sentinel values purely to keep the
/// schema identical to observations.
pub fn explore_to_json(description: &BlockDescription, configuration: &Configuration) -> String {
    let mut knobs = Map::new();
    for knob in &description.knobs {
        let raw = configuration.get(&knob.name).map(String::as_str).unwrap_or("");
        knobs.insert(knob.name.clone(), wire_value(&knob.value_type, raw));
    }

    let mut op = Map::new();
    op.insert("knobs".into(), Value::Object(knobs));

    if description.features_enabled() {
        let mut features = Map::new();
        for feature in &description.features {
            features.insert(feature.name.clone(), json!(SENTINEL));
        }
        op.insert("features".into(), Value::Object(features));
    }

    let mut metrics = Map::new();
    for metric in &description.metrics {
        let value = if metric.distribution {
            json!([SENTINEL, 0])
        } else {
            json!(SENTINEL)
        };
        metrics.insert(metric.name.clone(), value);
    }
    op.insert("metrics".into(), Value::Object(metrics));

    wrap(description, vec![Value::Object(op)])
}

/// Composes the prediction payload: one operating point per predicted row.
pub fn prediction_to_json(description: &BlockDescription, prediction: &Prediction) -> String {
    let ops = prediction
        .rows
        .iter()
        .map(|row| {
            let mut op = Map::new();

            if description.features_enabled() {
                let mut features = Map::new();
                for feature in &description.features {
                    let raw = row.features.get(&feature.name).map(String::as_str).unwrap_or("");
                    features.insert(feature.name.clone(), wire_value(&feature.value_type, raw));
                }
                op.insert("features".into(), Value::Object(features));
            }

            let mut knobs = Map::new();
            for knob in &description.knobs {
                let raw = row
                    .configuration
                    .get(&knob.name)
                    .map(String::as_str)
                    .unwrap_or("");
                knobs.insert(knob.name.clone(), wire_value(&knob.value_type, raw));
            }
            op.insert("knobs".into(), Value::Object(knobs));

            let mut metrics = Map::new();
            for metric in &description.metrics {
                let Some(estimate) = row.metrics.get(&metric.name) else {
                    continue;
                };
                let value = if metric.distribution {
                    let std = estimate.std.as_deref().unwrap_or("0");
                    Value::Array(vec![
                        wire_value(&metric.value_type, &estimate.mean),
                        wire_value(&metric.value_type, std),
                    ])
                } else {
                    wire_value(&metric.value_type, &estimate.mean)
                };
                metrics.insert(metric.name.clone(), value);
            }
            op.insert("metrics".into(), Value::Object(metrics));

            Value::Object(op)
        })
        .collect();

    wrap(description, ops)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app_id::ApplicationId;
    use crate::description::parse_welcome;
    use crate::prediction::{MetricEstimate, PredictionRow};
    use serde_json::json;

    fn description(features: bool) -> BlockDescription {
        let features_block = if features {
            json!([{"name": "size", "type": "int", "values": [1, 2]}])
        } else {
            json!([])
        };
        let payload = json!({
            "name": "app", "version": "v1",
            "blocks": [{
                "name": "blk",
                "knobs": [
                    {"name": "threads", "type": "int", "values": [1, 2]},
                    {"name": "variant", "type": "string", "values": ["fast"]}
                ],
                "features": features_block,
                "metrics": [
                    {"name": "exec_time", "type": "double",
                     "prediction_plugin": "ridge", "distribution": true},
                    {"name": "energy", "type": "double", "prediction_plugin": "ridge"}
                ],
                "agora": {
                    "doe_plugin": "full_factorial",
                    "clustering_plugin": "kmeans",
                    "number_configurations_per_iteration": 2
                }
            }]
        })
        .to_string();
        parse_welcome(&payload, &ApplicationId::new("app", "v1", "blk")).unwrap()
    }

    #[test]
    fn splits_observation_payloads() {
        let (sec, ns, rest) = split_observation("100 250 {\"blk\": []}").unwrap();
        assert_eq!((sec, ns), (100, 250));
        assert_eq!(rest, "{\"blk\": []}");

        assert!(split_observation("not numbers").is_err());
        assert!(split_observation("100").is_err());
    }

    #[test]
    fn parses_a_consistent_operating_point() {
        let desc = description(true);
        let payload = json!({
            "blk": [{
                "knobs": {"threads": 2, "variant": "fast"},
                "features": {"size": 1},
                "metrics": {"exec_time": [12.5, 0.3], "energy": 40}
            }]
        })
        .to_string();

        let op = parse_operating_point(&payload, &desc).unwrap();
        assert_eq!(op.knobs["threads"], "2");
        assert_eq!(op.knobs["variant"], "fast");
        assert_eq!(op.features["size"], "1");
        assert_eq!(
            op.metrics["exec_time"],
            MetricValue::Distribution {
                mean: "12.5".into(),
                std: "0.3".into()
            }
        );
        assert_eq!(op.metrics["energy"], MetricValue::Scalar("40".into()));
    }

    #[test]
    fn rejects_inconsistent_operating_points() {
        let desc = description(false);
        let missing_knob = json!({
            "blk": [{"knobs": {"threads": 2}, "metrics": {"exec_time": [1, 0], "energy": 1}}]
        });
        assert!(matches!(
            parse_operating_point(&missing_knob.to_string(), &desc),
            Err(ParseError::Inconsistent(_))
        ));

        let scalar_for_distribution = json!({
            "blk": [{
                "knobs": {"threads": 2, "variant": "fast"},
                "metrics": {"exec_time": 1, "energy": 1}
            }]
        });
        assert!(matches!(
            parse_operating_point(&scalar_for_distribution.to_string(), &desc),
            Err(ParseError::Inconsistent(_))
        ));
    }

    #[test]
    fn explore_payload_keeps_numbers_bare_and_strings_quoted() {
        let desc = description(true);
        let config: Configuration = [
            ("threads".to_string(), "2".to_string()),
            ("variant".to_string(), "fast".to_string()),
        ]
        .into();

        let payload = explore_to_json(&desc, &config);
        let document: Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(
            document,
            json!({
                "blk": [{
                    "knobs": {"threads": 2, "variant": "fast"},
                    "features": {"size": 9999},
                    "metrics": {"energy": 9999, "exec_time": [9999, 0]}
                }]
            })
        );
        // The numeric knob travels as a bare number, the string one quoted.
        assert!(payload.contains("\"threads\":2"));
        assert!(payload.contains("\"variant\":\"fast\""));
        assert!(!payload.ends_with('\n'));
    }

    #[test]
    fn prediction_payload_is_deterministic() {
        let desc = description(false);
        let prediction = Prediction {
            rows: vec![PredictionRow {
                configuration: [
                    ("threads".to_string(), "2".to_string()),
                    ("variant".to_string(), "fast".to_string()),
                ]
                .into(),
                features: BTreeMap::new(),
                metrics: [
                    (
                        "exec_time".to_string(),
                        MetricEstimate {
                            mean: "12.5".into(),
                            std: Some("0.3".into()),
                        },
                    ),
                    (
                        "energy".to_string(),
                        MetricEstimate {
                            mean: "40".into(),
                            std: None,
                        },
                    ),
                ]
                .into(),
            }],
        };

        let first = prediction_to_json(&desc, &prediction);
        let second = prediction_to_json(&desc, &prediction);
        assert_eq!(first, second);
        assert!(first.contains("\"energy\":40"));
        assert!(first.contains("\"exec_time\":[12.5,0.3]"));
        assert!(!first.ends_with('\n'));
    }

    #[test]
    fn observation_round_trips_through_serde() {
        let desc = description(true);
        let payload = json!({
            "blk": [{
                "knobs": {"threads": 1, "variant": "fast"},
                "features": {"size": 2},
                "metrics": {"exec_time": [1.0, 0.1], "energy": 3}
            }]
        })
        .to_string();
        let op = parse_operating_point(&payload, &desc).unwrap();
        let reloaded: OperatingPoint =
            serde_json::from_str(&serde_json::to_string(&op).unwrap()).unwrap();
        assert_eq!(reloaded, op);
    }
}
