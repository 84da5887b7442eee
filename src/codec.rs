//! Feature codec: heterogeneous feature payloads to fixed-length vectors.
//!
//! Producers send features as a named map (`{"rsi_14": 0.4}`), a sparse
//! index map (`{"3": 1.25}`) or a plain array. All three are normalized here
//! into one ordered vector of exactly `dimension` values so nothing
//! downstream has to care which shape arrived.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Raw feature payload as received from a producer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeatureInput {
    Array(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl FeatureInput {
    pub fn from_named<I, K>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, f64)>,
        K: Into<String>,
    {
        FeatureInput::Map(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), Value::from(v)))
                .collect(),
        )
    }

    pub fn from_values(values: &[f64]) -> Self {
        FeatureInput::Array(values.iter().map(|v| Value::from(*v)).collect())
    }

    pub fn is_empty(&self) -> bool {
        match self {
            FeatureInput::Array(v) => v.is_empty(),
            FeatureInput::Map(m) => m.is_empty(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EncodedFeatures {
    pub vector: Vec<f64>,
    pub names: Vec<String>,
    /// Features that did not fit the dimension or the schema.
    pub dropped: usize,
}

#[derive(Debug, Clone)]
pub struct FeatureCodec {
    dimension: usize,
    /// Sorted schema names; `None` means order by whatever names arrive.
    schema: Option<Vec<String>>,
}

impl FeatureCodec {
    pub fn new(dimension: usize) -> Self {
        Self { dimension, schema: None }
    }

    /// Codec bound to a known feature set. The dimension is the schema size.
    pub fn with_schema<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let sorted: BTreeSet<String> = names.into_iter().map(Into::into).collect();
        let schema: Vec<String> = sorted.into_iter().collect();
        Self { dimension: schema.len(), schema: Some(schema) }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn encode(&self, input: &FeatureInput) -> EncodedFeatures {
        match input {
            FeatureInput::Array(values) => self.encode_positional(
                values.iter().enumerate().map(|(i, v)| (i, coerce(v))),
                values.len(),
            ),
            FeatureInput::Map(map) => {
                let indices: Option<Vec<(usize, f64)>> = if map.is_empty() {
                    None
                } else {
                    map.iter()
                        .map(|(k, v)| k.trim().parse::<usize>().ok().map(|i| (i, coerce(v))))
                        .collect()
                };
                match indices {
                    Some(pairs) => {
                        let total = pairs.len();
                        self.encode_positional(pairs.into_iter(), total)
                    }
                    None => self.encode_named(map),
                }
            }
        }
    }

    fn encode_positional<I>(&self, pairs: I, total: usize) -> EncodedFeatures
    where
        I: Iterator<Item = (usize, f64)>,
    {
        let mut vector = vec![0.0; self.dimension];
        let mut placed = 0;
        for (idx, value) in pairs {
            if idx < self.dimension {
                vector[idx] = value;
                placed += 1;
            }
        }
        let names = match &self.schema {
            Some(schema) => schema.clone(),
            None => (0..self.dimension).map(placeholder_name).collect(),
        };
        EncodedFeatures { vector, names, dropped: total - placed }
    }

    fn encode_named(&self, map: &BTreeMap<String, Value>) -> EncodedFeatures {
        match &self.schema {
            Some(schema) => {
                let vector: Vec<f64> = schema
                    .iter()
                    .map(|name| map.get(name).map(coerce).unwrap_or(0.0))
                    .collect();
                let known = map.keys().filter(|k| schema.binary_search(k).is_ok()).count();
                EncodedFeatures { vector, names: schema.clone(), dropped: map.len() - known }
            }
            None => {
                // BTreeMap iteration is already lexicographic by name.
                let mut vector = Vec::with_capacity(self.dimension);
                let mut names = Vec::with_capacity(self.dimension);
                for (name, value) in map.iter().take(self.dimension) {
                    vector.push(coerce(value));
                    names.push(name.clone());
                }
                for i in vector.len()..self.dimension {
                    vector.push(0.0);
                    names.push(placeholder_name(i));
                }
                EncodedFeatures {
                    vector,
                    names,
                    dropped: map.len().saturating_sub(self.dimension),
                }
            }
        }
    }
}

fn placeholder_name(i: usize) -> String {
    format!("feature_{}", i)
}

/// Numbers pass through, numeric strings are parsed, everything else is 0.
fn coerce(value: &Value) -> f64 {
    let v = match value {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => s.trim().parse::<f64>().unwrap_or(0.0),
        _ => 0.0,
    };
    if v.is_finite() {
        v
    } else {
        0.0
    }
}
