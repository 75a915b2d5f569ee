use crate::error::SearchError;
use crate::traits::ChunkStore;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::debug;

pub const PARENT_KEY: &str = "__parent";
pub const CHUNK_INDEX_KEY: &str = "__chunk_index";

/// Distance metric of a partition. Fixed per partition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    #[default]
    Cosine,
    L2,
}

impl DistanceMetric {
    pub fn distance(self, left: &[f32], right: &[f32]) -> f64 {
        match self {
            Self::Cosine => 1.0 - cosine_similarity(left, right),
            Self::L2 => left
                .iter()
                .zip(right)
                .map(|(a, b)| {
                    let delta = f64::from(*a) - f64::from(*b);
                    delta * delta
                })
                .sum::<f64>()
                .sqrt(),
        }
    }

    /// Similarity fed to the score combiner.
    pub fn similarity(self, distance: f64) -> f64 {
        match self {
            Self::Cosine => 1.0 - distance,
            Self::L2 => 1.0 / (1.0 + distance),
        }
    }

    /// Cosine similarity recovered from a distance. L2 partitions hold
    /// unit-norm vectors, where `|a - b|² = 2 - 2cos`.
    pub fn cosine_similarity(self, distance: f64) -> f64 {
        match self {
            Self::Cosine => 1.0 - distance,
            Self::L2 => 1.0 - distance * distance / 2.0,
        }
    }
}

pub fn cosine_similarity(left: &[f32], right: &[f32]) -> f64 {
    let mut dot = 0.0f64;
    let mut left_norm = 0.0f64;
    let mut right_norm = 0.0f64;

    for (a, b) in left.iter().zip(right) {
        let (a, b) = (f64::from(*a), f64::from(*b));
        dot += a * b;
        left_norm += a * a;
        right_norm += b * b;
    }

    if left_norm == 0.0 || right_norm == 0.0 {
        return 0.0;
    }
    dot / (left_norm.sqrt() * right_norm.sqrt())
}

/// Key/value containment predicate over chunk metadata.
///
/// A chunk matches when every filter entry is contained in its metadata:
/// scalars compare equal, objects match recursively, and an array filter
/// value requires each of its elements to be present in the metadata array.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetadataFilter(pub Map<String, Value>);

impl MetadataFilter {
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn matches(&self, metadata: &Map<String, Value>) -> bool {
        self.0.iter().all(|(key, expected)| {
            metadata
                .get(key)
                .is_some_and(|actual| contains(actual, expected))
        })
    }
}

fn contains(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Object(actual), Value::Object(expected)) => expected.iter().all(|(key, value)| {
            actual
                .get(key)
                .is_some_and(|inner| contains(inner, value))
        }),
        (Value::Array(actual), Value::Array(expected)) => expected
            .iter()
            .all(|value| actual.iter().any(|inner| contains(inner, value))),
        (Value::Array(actual), scalar) => actual.iter().any(|inner| inner == scalar),
        (actual, expected) => actual == expected,
    }
}

/// Opaque reference to a chunk's precomputed full-text entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LexicalHandle(pub String);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnnHit {
    pub id: String,
    pub content: String,
    pub metadata: Map<String, Value>,
    pub distance: f64,
    pub handle: LexicalHandle,
}

impl KnnHit {
    /// Parent group of the hit, read from `__parent`.
    pub fn parent(&self) -> String {
        self.metadata
            .get(PARENT_KEY)
            .and_then(Value::as_str)
            .unwrap_or(self.id.as_str())
            .to_string()
    }
}

/// Storage partitions keyed by the embedding dimension they hold.
pub struct PartitionRegistry<S> {
    partitions: BTreeMap<usize, S>,
}

impl<S> Default for PartitionRegistry<S> {
    fn default() -> Self {
        Self {
            partitions: BTreeMap::new(),
        }
    }
}

impl<S: ChunkStore> PartitionRegistry<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `store` under its own dimension, replacing any previous one.
    pub fn register(mut self, store: S) -> Self {
        self.partitions.insert(store.dimension(), store);
        self
    }

    pub fn route(&self, dimension: usize) -> Result<&S, SearchError> {
        match self.partitions.get(&dimension) {
            Some(store) => {
                debug!(dimension, "routed query to partition");
                Ok(store)
            }
            None => Err(SearchError::UnsupportedDimension {
                dimension,
                supported: self.dimensions(),
            }),
        }
    }

    pub fn dimensions(&self) -> Vec<usize> {
        self.partitions.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn metadata(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[test]
    fn filter_matches_by_containment() {
        let chunk = metadata(json!({
            "type": "pdf",
            "author": "Plant Engineering",
            "heading_path": ["1 General", "1.1 Pumps"],
            "extra": {"site": "north", "line": 4}
        }));

        assert!(MetadataFilter::default().matches(&chunk));
        assert!(MetadataFilter::default().with("type", "pdf").matches(&chunk));
        assert!(MetadataFilter::default()
            .with("heading_path", "1.1 Pumps")
            .matches(&chunk));
        assert!(MetadataFilter::default()
            .with("extra", json!({"site": "north"}))
            .matches(&chunk));
        assert!(!MetadataFilter::default().with("type", "docx").matches(&chunk));
        assert!(!MetadataFilter::default().with("missing", 1).matches(&chunk));
    }

    #[test]
    fn metric_similarities() {
        assert!((DistanceMetric::Cosine.similarity(0.1) - 0.9).abs() < 1e-12);
        assert!((DistanceMetric::L2.similarity(1.0) - 0.5).abs() < 1e-12);

        let a = [1.0f32, 0.0];
        let b = [0.0f32, 1.0];
        let l2 = DistanceMetric::L2.distance(&a, &b);
        assert!(DistanceMetric::L2.cosine_similarity(l2).abs() < 1e-9);
        assert!(DistanceMetric::Cosine.distance(&a, &a).abs() < 1e-9);
    }

    #[test]
    fn hit_parent_falls_back_to_id() {
        let hit = KnnHit {
            id: "chunk-1".into(),
            content: String::new(),
            metadata: Map::new(),
            distance: 0.0,
            handle: LexicalHandle("chunk-1".into()),
        };
        assert_eq!(hit.parent(), "chunk-1");
    }
}
