//! KPI values
//!
//! A KPI set is an ordered map of metric name to value. Every number in it
//! comes from the execution result; nothing is taken from model output.

pub mod engine;

pub use engine::KpiEngine;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

/// Marker written in place of a ratio whose denominator is zero.
pub const UNDEFINED: &str = "undefined";

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Metric {
    Value(f64),
    Undefined,
}

impl Metric {
    pub fn value(&self) -> Option<f64> {
        match self {
            Metric::Value(v) => Some(*v),
            Metric::Undefined => None,
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Metric::Undefined)
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Metric::Value(v) => write!(f, "{}", v),
            Metric::Undefined => f.write_str(UNDEFINED),
        }
    }
}

impl Serialize for Metric {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Metric::Value(v) => serializer.serialize_f64(*v),
            Metric::Undefined => serializer.serialize_str(UNDEFINED),
        }
    }
}

impl<'de> Deserialize<'de> for Metric {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Number(f64),
            Marker(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Number(v) => Ok(Metric::Value(v)),
            Repr::Marker(m) if m == UNDEFINED => Ok(Metric::Undefined),
            Repr::Marker(m) => Err(D::Error::custom(format!("unexpected metric marker '{}'", m))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bucket {
    pub label: String,
    pub value: Metric,
}

impl Bucket {
    pub fn new(label: impl Into<String>, value: Metric) -> Self {
        Self {
            label: label.into(),
            value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum KpiValue {
    Scalar(Metric),
    Label(String),
    /// Per-group values in first-appearance order
    Breakdown(Vec<Bucket>),
    /// Per-period values in chronological order
    Series(Vec<Bucket>),
}

impl KpiValue {
    pub fn number(value: f64) -> Self {
        KpiValue::Scalar(Metric::Value(value))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KpiSet(BTreeMap<String, KpiValue>);

impl KpiSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: KpiValue) {
        self.0.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&KpiValue> {
        self.0.get(name)
    }

    pub fn metric(&self, name: &str) -> Option<Metric> {
        match self.0.get(name) {
            Some(KpiValue::Scalar(m)) => Some(*m),
            _ => None,
        }
    }

    pub fn value(&self, name: &str) -> Option<f64> {
        self.metric(name).and_then(|m| m.value())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &KpiValue)> {
        self.0.iter()
    }

    /// Every defined number in the set, including bucket values.
    pub fn numbers(&self) -> Vec<f64> {
        let mut out = Vec::new();
        for value in self.0.values() {
            match value {
                KpiValue::Scalar(Metric::Value(v)) => out.push(*v),
                KpiValue::Scalar(Metric::Undefined) | KpiValue::Label(_) => {}
                KpiValue::Breakdown(buckets) | KpiValue::Series(buckets) => {
                    out.extend(buckets.iter().filter_map(|b| b.value.value()));
                }
            }
        }
        out
    }

    /// Free text carried by the set: label values and bucket labels.
    pub fn labels(&self) -> Vec<&str> {
        let mut out = Vec::new();
        for value in self.0.values() {
            match value {
                KpiValue::Label(text) => out.push(text.as_str()),
                KpiValue::Breakdown(buckets) | KpiValue::Series(buckets) => {
                    out.extend(buckets.iter().map(|b| b.label.as_str()));
                }
                KpiValue::Scalar(_) => {}
            }
        }
        out
    }

    /// Compact JSON for prompts: buckets become `[label, value]` pairs so
    /// their order survives.
    pub fn to_prompt_json(&self) -> serde_json::Value {
        let object: serde_json::Map<String, serde_json::Value> = self
            .0
            .iter()
            .map(|(name, value)| {
                let json = match value {
                    KpiValue::Scalar(metric) => metric_json(metric),
                    KpiValue::Label(text) => serde_json::Value::String(text.clone()),
                    KpiValue::Breakdown(buckets) | KpiValue::Series(buckets) => serde_json::Value::Array(
                        buckets
                            .iter()
                            .map(|b| serde_json::json!([b.label, metric_json(&b.value)]))
                            .collect(),
                    ),
                };
                (name.clone(), json)
            })
            .collect();
        serde_json::Value::Object(object)
    }
}

fn metric_json(metric: &Metric) -> serde_json::Value {
    match metric {
        Metric::Value(v) => serde_json::json!(v),
        Metric::Undefined => serde_json::Value::String(UNDEFINED.to_string()),
    }
}
