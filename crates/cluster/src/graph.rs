//! Similarity graph persistence.
//!
//! Scored pairs at or above the edge-creation threshold become undirected
//! weighted edges. Edge keys are a hash of the sorted endpoints plus the
//! relation method, so re-running a build overwrites instead of
//! duplicating.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use store::{
    with_retry, DocumentStore, OnConflict, Record, StoreError, Value, DEFAULT_RETRY_ATTEMPTS,
};
use tracing::info;
use xxhash_rust::xxh3::xxh3_64;

use crate::ClusterError;

/// Default normalized-score floor for edge creation.
pub const DEFAULT_EDGE_THRESHOLD: f64 = 0.7;

/// How edges reach the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EdgeLoadingMethod {
    /// Chunked `insert_many` calls.
    #[default]
    Api,
    /// NDJSON bulk import; dramatically faster for large runs when the
    /// store supports it.
    BulkImport,
}

/// A weighted undirected edge between two record ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityEdge {
    /// Deterministic key: `xxh3(min_id | max_id | method)` in hex.
    pub key: String,
    pub from: String,
    pub to: String,
    pub weight: f64,
    pub confidence: f64,
    pub method: String,
}

impl SimilarityEdge {
    /// Canonicalize endpoints and derive the key. `None` for self-loops.
    pub fn new(
        a: impl Into<String>,
        b: impl Into<String>,
        weight: f64,
        confidence: f64,
        method: &str,
    ) -> Option<Self> {
        let a = a.into();
        let b = b.into();
        if a == b {
            return None;
        }
        let (from, to) = if a < b { (a, b) } else { (b, a) };
        let key = Self::edge_key(&from, &to, method);
        Some(Self {
            key,
            from,
            to,
            weight,
            confidence,
            method: method.to_string(),
        })
    }

    pub fn edge_key(from: &str, to: &str, method: &str) -> String {
        format!("{:016x}", xxh3_64(format!("{from}|{to}|{method}").as_bytes()))
    }

    pub fn to_record(&self, collection: &str) -> Record {
        Record::new(self.key.clone(), collection)
            .with_field("_from", self.from.clone())
            .with_field("_to", self.to.clone())
            .with_field("weight", self.weight)
            .with_field("confidence", self.confidence)
            .with_field("method", self.method.clone())
    }

    /// Parse an edge document read back from the store.
    pub fn from_record(record: &Record) -> Option<Self> {
        let from = record.field_text("_from")?;
        let to = record.field_text("_to")?;
        let weight = record.field("weight").and_then(Value::as_f64)?;
        let confidence = record
            .field("confidence")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);
        let method = record.field_text("method").unwrap_or_default();
        Some(Self {
            key: record.id.clone(),
            from,
            to,
            weight,
            confidence,
            method,
        })
    }
}

/// Raw material for one edge: a scored pair boiled down to endpoints and
/// weights. The orchestrator maps scored pairs into these.
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeInput {
    pub from: String,
    pub to: String,
    /// Normalized match score.
    pub weight: f64,
    pub confidence: f64,
}

/// Graph-build configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphConfig {
    pub edge_collection: String,
    /// Minimum weight for an edge to be persisted.
    #[serde(default = "GraphConfig::default_threshold")]
    pub edge_creation_threshold: f64,
    #[serde(default)]
    pub loading_method: EdgeLoadingMethod,
    /// Relation method tag written on every edge.
    #[serde(default = "GraphConfig::default_method")]
    pub method: String,
    #[serde(default = "GraphConfig::default_chunk_size")]
    pub chunk_size: usize,
}

impl GraphConfig {
    fn default_threshold() -> f64 {
        DEFAULT_EDGE_THRESHOLD
    }

    fn default_method() -> String {
        "similarity".to_string()
    }

    fn default_chunk_size() -> usize {
        1000
    }

    pub fn new(edge_collection: impl Into<String>) -> Self {
        Self {
            edge_collection: edge_collection.into(),
            edge_creation_threshold: Self::default_threshold(),
            loading_method: EdgeLoadingMethod::default(),
            method: Self::default_method(),
            chunk_size: Self::default_chunk_size(),
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.edge_creation_threshold = threshold;
        self
    }

    pub fn with_loading_method(mut self, method: EdgeLoadingMethod) -> Self {
        self.loading_method = method;
        self
    }
}

/// Counters from one graph build.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphStats {
    pub input_pairs: usize,
    pub edges_written: usize,
    pub below_threshold: usize,
    pub self_loops_skipped: usize,
    pub loading_method: String,
}

/// Persists scored pairs as similarity edges.
pub struct GraphBuilder {
    store: Arc<dyn DocumentStore>,
    cfg: GraphConfig,
}

impl GraphBuilder {
    pub fn new(store: Arc<dyn DocumentStore>, cfg: GraphConfig) -> Self {
        Self { store, cfg }
    }

    pub fn config(&self) -> &GraphConfig {
        &self.cfg
    }

    /// Build and persist edges for every input at or above the threshold.
    pub fn build(
        &self,
        inputs: impl IntoIterator<Item = EdgeInput>,
    ) -> Result<GraphStats, ClusterError> {
        let mut stats = GraphStats {
            loading_method: match self.cfg.loading_method {
                EdgeLoadingMethod::Api => "api".to_string(),
                EdgeLoadingMethod::BulkImport => "bulk_import".to_string(),
            },
            ..GraphStats::default()
        };

        // Same pair scored twice resolves to the same key; the later input
        // wins, mirroring the store's replace semantics.
        let mut edges: std::collections::BTreeMap<String, SimilarityEdge> =
            std::collections::BTreeMap::new();
        for input in inputs {
            stats.input_pairs += 1;
            if input.weight < self.cfg.edge_creation_threshold {
                stats.below_threshold += 1;
                continue;
            }
            match SimilarityEdge::new(
                input.from,
                input.to,
                input.weight,
                input.confidence,
                &self.cfg.method,
            ) {
                Some(edge) => {
                    edges.insert(edge.key.clone(), edge);
                }
                None => stats.self_loops_skipped += 1,
            }
        }

        self.store.create_edge_collection(&self.cfg.edge_collection)?;
        let records: Vec<Record> = edges
            .values()
            .map(|e| e.to_record(&self.cfg.edge_collection))
            .collect();
        stats.edges_written = records.len();

        match self.cfg.loading_method {
            EdgeLoadingMethod::Api => {
                for chunk in records.chunks(self.cfg.chunk_size) {
                    with_retry(DEFAULT_RETRY_ATTEMPTS, || {
                        self.store.insert_many(
                            &self.cfg.edge_collection,
                            chunk.to_vec(),
                            OnConflict::Replace,
                        )
                    })?;
                }
            }
            EdgeLoadingMethod::BulkImport => {
                let mut ndjson = String::new();
                for record in &records {
                    let line = serde_json::to_string(record).map_err(|e| {
                        ClusterError::Store(StoreError::internal(format!(
                            "edge serialization failed: {e}"
                        )))
                    })?;
                    ndjson.push_str(&line);
                    ndjson.push('\n');
                }
                with_retry(DEFAULT_RETRY_ATTEMPTS, || {
                    self.store.bulk_import(
                        &self.cfg.edge_collection,
                        &ndjson,
                        OnConflict::Replace,
                    )
                })?;
            }
        }

        info!(
            edges = stats.edges_written,
            below_threshold = stats.below_threshold,
            method = stats.loading_method.as_str(),
            "similarity graph build finished"
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use store::InMemoryStore;

    fn input(from: &str, to: &str, weight: f64) -> EdgeInput {
        EdgeInput {
            from: from.to_string(),
            to: to.to_string(),
            weight,
            confidence: weight,
        }
    }

    fn builder(store: Arc<InMemoryStore>, method: EdgeLoadingMethod) -> GraphBuilder {
        GraphBuilder::new(
            store,
            GraphConfig::new("similarities")
                .with_threshold(0.7)
                .with_loading_method(method),
        )
    }

    #[test]
    fn edge_key_is_order_independent() {
        assert_eq!(
            SimilarityEdge::new("b", "a", 0.9, 0.8, "sim").unwrap().key,
            SimilarityEdge::new("a", "b", 0.9, 0.8, "sim").unwrap().key
        );
    }

    #[test]
    fn self_loops_are_rejected() {
        assert!(SimilarityEdge::new("x", "x", 0.9, 0.9, "sim").is_none());
    }

    #[test]
    fn below_threshold_pairs_are_not_persisted() {
        let store = Arc::new(InMemoryStore::new());
        let builder = builder(store.clone(), EdgeLoadingMethod::Api);
        let stats = builder
            .build(vec![input("a", "b", 0.9), input("a", "c", 0.5)])
            .unwrap();
        assert_eq!(stats.edges_written, 1);
        assert_eq!(stats.below_threshold, 1);
        assert_eq!(store.count("similarities").unwrap(), 1);
    }

    #[test]
    fn rebuild_is_idempotent() {
        let store = Arc::new(InMemoryStore::new());
        let builder = builder(store.clone(), EdgeLoadingMethod::Api);
        let inputs = vec![input("a", "b", 0.9), input("b", "c", 0.8)];
        builder.build(inputs.clone()).unwrap();
        builder.build(inputs).unwrap();
        assert_eq!(store.count("similarities").unwrap(), 2);
    }

    #[test]
    fn bulk_import_path_writes_the_same_edges() {
        let api_store = Arc::new(InMemoryStore::new());
        let bulk_store = Arc::new(InMemoryStore::new());
        let inputs = vec![input("a", "b", 0.9), input("c", "d", 0.95)];
        builder(api_store.clone(), EdgeLoadingMethod::Api)
            .build(inputs.clone())
            .unwrap();
        let stats = builder(bulk_store.clone(), EdgeLoadingMethod::BulkImport)
            .build(inputs)
            .unwrap();
        assert_eq!(stats.loading_method, "bulk_import");
        assert_eq!(
            api_store.count("similarities").unwrap(),
            bulk_store.count("similarities").unwrap()
        );
        assert_eq!(bulk_store.op_counts().bulk_import, 1);
    }

    #[test]
    fn edge_roundtrips_through_record() {
        let edge = SimilarityEdge::new("a", "b", 0.91, 0.85, "similarity").unwrap();
        let record = edge.to_record("similarities");
        let back = SimilarityEdge::from_record(&record).unwrap();
        assert_eq!(back, edge);
    }
}
