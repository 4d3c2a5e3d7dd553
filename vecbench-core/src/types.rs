use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Opaque engine-specific parameters and recorded results
pub type Params = serde_json::Map<String, serde_json::Value>;

/// Similarity metric a dataset was built for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Distance {
    L2,
    Cosine,
    Dot,
}

impl std::fmt::Display for Distance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Distance::L2 => "l2",
            Distance::Cosine => "cosine",
            Distance::Dot => "dot",
        };
        f.write_str(name)
    }
}

/// A single point to upload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: u64,
    pub vector: Vec<f32>,
    /// Payload fields, keyed by schema field name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Params>,
}

/// A single search request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub vector: Vec<f32>,
    /// Engine-agnostic filter conditions, passed through untouched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta_conditions: Option<serde_json::Value>,
    /// Ground-truth neighbour ids, if the dataset ships them
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_result: Option<Vec<u64>>,
}

/// A single hit returned by a search engine
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: u64,
    pub score: f32,
}

impl SearchHit {
    pub fn new(id: u64, score: f32) -> Self {
        Self { id, score }
    }
}

/// Scale a vector to unit length in place (zero vectors are left untouched)
pub fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}

/// Serialize a value that must be a JSON object into a parameter map
pub fn to_params<T: Serialize>(value: &T) -> Result<Params> {
    match serde_json::to_value(value)? {
        serde_json::Value::Object(map) => Ok(map),
        other => Err(Error::Config(format!(
            "Expected a mapping, got: {}",
            other
        ))),
    }
}
