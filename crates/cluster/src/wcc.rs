//! Weakly-connected-component clustering.
//!
//! The engine fetches the entire (optionally filtered) edge set in a
//! single paged scan, builds an adjacency map in memory, and assigns
//! components with an iterative, explicit-stack DFS. One store round trip
//! for any graph size - never one query per vertex. Recursion is off the
//! table too: component chains of 100k+ vertices would blow the native
//! stack.

use std::sync::Arc;

use hashbrown::{HashMap as FastMap, HashSet as FastSet};
use serde::{Deserialize, Serialize};
use store::{CancelToken, DocumentStore, OnConflict, Record, ScanFilter, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::graph::SimilarityEdge;
use crate::ClusterError;

/// Namespace for deterministic cluster ids (uuid v5 over member ids).
pub const CLUSTER_ID_NAMESPACE: Uuid = Uuid::from_u128(0x9a1d_74c2_55e8_4c0b_a3fd_1be2_90f7_6d11);

/// Default safety limits on the bulk edge fetch.
pub const DEFAULT_MAX_EDGES: usize = 5_000_000;
pub const DEFAULT_WARN_EDGES: usize = 500_000;

/// Clustering algorithm selector. Only WCC is specified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ClusterAlgorithm {
    #[default]
    Wcc,
}

/// What to do with components larger than `max_cluster_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OversizePolicy {
    /// Keep the cluster, mark it `oversized`, log a warning.
    #[default]
    Flag,
    /// Drop the cluster and count it.
    Drop,
}

/// Cluster lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterStatus {
    Pending,
    Computed,
    Persisted,
}

/// Clustering configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub edge_collection: String,
    pub cluster_collection: String,
    #[serde(default)]
    pub algorithm: ClusterAlgorithm,
    #[serde(default = "ClusterConfig::default_min_cluster_size")]
    pub min_cluster_size: usize,
    #[serde(default = "ClusterConfig::default_max_cluster_size")]
    pub max_cluster_size: usize,
    #[serde(default)]
    pub oversize_policy: OversizePolicy,
    /// Only consider edges at or above this weight.
    #[serde(default)]
    pub min_weight: Option<f64>,
    /// Only consider edges with this relation method.
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default = "ClusterConfig::default_max_edges")]
    pub max_edges: usize,
    #[serde(default = "ClusterConfig::default_warn_edges")]
    pub warn_edges: usize,
    /// Density at or above which a cluster's density factor is unreduced.
    #[serde(default = "ClusterConfig::default_density_threshold")]
    pub density_threshold: f64,
    #[serde(default = "ClusterConfig::default_store_results")]
    pub store_results: bool,
}

impl ClusterConfig {
    fn default_min_cluster_size() -> usize {
        2
    }

    fn default_max_cluster_size() -> usize {
        100
    }

    fn default_max_edges() -> usize {
        DEFAULT_MAX_EDGES
    }

    fn default_warn_edges() -> usize {
        DEFAULT_WARN_EDGES
    }

    fn default_density_threshold() -> f64 {
        0.5
    }

    fn default_store_results() -> bool {
        true
    }

    pub fn new(
        edge_collection: impl Into<String>,
        cluster_collection: impl Into<String>,
    ) -> Self {
        Self {
            edge_collection: edge_collection.into(),
            cluster_collection: cluster_collection.into(),
            algorithm: ClusterAlgorithm::Wcc,
            min_cluster_size: Self::default_min_cluster_size(),
            max_cluster_size: Self::default_max_cluster_size(),
            oversize_policy: OversizePolicy::default(),
            min_weight: None,
            method: None,
            max_edges: Self::default_max_edges(),
            warn_edges: Self::default_warn_edges(),
            density_threshold: Self::default_density_threshold(),
            store_results: Self::default_store_results(),
        }
    }

    pub fn with_size_bounds(mut self, min: usize, max: usize) -> Self {
        self.min_cluster_size = min;
        self.max_cluster_size = max;
        self
    }

    pub fn with_oversize_policy(mut self, policy: OversizePolicy) -> Self {
        self.oversize_policy = policy;
        self
    }

    pub fn with_store_results(mut self, store_results: bool) -> Self {
        self.store_results = store_results;
        self
    }

    pub fn validate(&self) -> Result<(), ClusterError> {
        if self.min_cluster_size < 2 {
            return Err(ClusterError::InvalidConfig(
                "min_cluster_size must be >= 2".into(),
            ));
        }
        if self.max_cluster_size < self.min_cluster_size {
            return Err(ClusterError::InvalidConfig(
                "max_cluster_size must be >= min_cluster_size".into(),
            ));
        }
        if self.max_edges == 0 {
            return Err(ClusterError::InvalidConfig("max_edges must be > 0".into()));
        }
        Ok(())
    }
}

/// One weakly-connected component with derived statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    /// Deterministic id derived from the sorted member ids.
    pub id: String,
    /// Sorted member record ids.
    pub member_ids: Vec<String>,
    pub size: usize,
    pub edge_count: usize,
    pub min_weight: f64,
    pub avg_weight: f64,
    pub max_weight: f64,
    /// Mean of the pairwise confidences carried on the cluster's edges.
    pub avg_confidence: f64,
    /// `edges / (size*(size-1)/2)`.
    pub density: f64,
    pub quality_score: f64,
    pub oversized: bool,
    pub status: ClusterStatus,
}

impl Cluster {
    pub fn to_record(&self, collection: &str) -> Record {
        Record::new(self.id.clone(), collection)
            .with_field(
                "member_ids",
                Value::List(self.member_ids.iter().map(|m| Value::from(m.clone())).collect()),
            )
            .with_field("size", self.size as i64)
            .with_field("edge_count", self.edge_count as i64)
            .with_field("min_weight", self.min_weight)
            .with_field("avg_weight", self.avg_weight)
            .with_field("max_weight", self.max_weight)
            .with_field("avg_confidence", self.avg_confidence)
            .with_field("density", self.density)
            .with_field("quality_score", self.quality_score)
            .with_field("oversized", self.oversized)
            .with_field("status", "persisted")
    }

    /// Parse a cluster document read back from the store.
    pub fn from_record(record: &Record) -> Option<Self> {
        let member_ids: Vec<String> = record
            .field("member_ids")?
            .as_list()?
            .iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect();
        Some(Self {
            id: record.id.clone(),
            size: record.field("size")?.as_i64()? as usize,
            edge_count: record.field("edge_count")?.as_i64()? as usize,
            min_weight: record.field("min_weight")?.as_f64()?,
            avg_weight: record.field("avg_weight")?.as_f64()?,
            max_weight: record.field("max_weight")?.as_f64()?,
            avg_confidence: record.field("avg_confidence").and_then(Value::as_f64)?,
            density: record.field("density")?.as_f64()?,
            quality_score: record.field("quality_score")?.as_f64()?,
            oversized: record.field("oversized").and_then(Value::as_bool)?,
            status: ClusterStatus::Persisted,
            member_ids,
        })
    }
}

/// Counters for one clustering run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusteringStats {
    pub edges_fetched: usize,
    pub malformed_edges: usize,
    pub vertices: usize,
    pub components_found: usize,
    pub clusters_kept: usize,
    pub dropped_small: usize,
    pub dropped_oversized: usize,
    pub flagged_oversized: usize,
    /// Store round trips used for the edge fetch. Always 1.
    pub fetch_round_trips: usize,
    pub persisted: usize,
    pub cancelled: bool,
}

/// Result of a clustering run.
#[derive(Debug, Clone, Default)]
pub struct ClusterOutcome {
    pub clusters: Vec<Cluster>,
    pub stats: ClusteringStats,
}

/// Computes weakly-connected components over the similarity graph.
pub struct ClusterEngine {
    store: Arc<dyn DocumentStore>,
    cfg: ClusterConfig,
}

impl ClusterEngine {
    pub fn new(store: Arc<dyn DocumentStore>, cfg: ClusterConfig) -> Result<Self, ClusterError> {
        cfg.validate()?;
        Ok(Self { store, cfg })
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.cfg
    }

    /// Compute clusters and, unless disabled or cancelled, persist them.
    pub fn run(&self, cancel: &CancelToken) -> Result<ClusterOutcome, ClusterError> {
        let mut outcome = self.compute()?;
        if cancel.is_cancelled() {
            outcome.stats.cancelled = true;
            return Ok(outcome);
        }
        if self.cfg.store_results {
            outcome.stats.persisted = self.persist(&mut outcome.clusters)?;
        }
        Ok(outcome)
    }

    /// Fetch the edge set (one round trip) and compute components.
    pub fn compute(&self) -> Result<ClusterOutcome, ClusterError> {
        let ClusterAlgorithm::Wcc = self.cfg.algorithm;
        let mut stats = ClusteringStats {
            fetch_round_trips: 1,
            ..ClusteringStats::default()
        };

        let mut edges: Vec<SimilarityEdge> = Vec::new();
        let mut warned = false;
        let filter = match &self.cfg.method {
            Some(method) => ScanFilter::none().with_equals("method", method.clone()),
            None => ScanFilter::none(),
        };
        self.store
            .scan(&self.cfg.edge_collection, &filter, 10_000, &mut |record| {
                match SimilarityEdge::from_record(&record) {
                    Some(edge) => {
                        if let Some(min_weight) = self.cfg.min_weight {
                            if edge.weight < min_weight {
                                return Ok(());
                            }
                        }
                        stats.edges_fetched += 1;
                        if stats.edges_fetched > self.cfg.warn_edges && !warned {
                            warned = true;
                            warn!(
                                warn_edges = self.cfg.warn_edges,
                                "edge fetch passed warn threshold"
                            );
                        }
                        // Cap the buffer; the overflow check below turns
                        // this into a fatal error, not a truncation.
                        if edges.len() <= self.cfg.max_edges {
                            edges.push(edge);
                        }
                    }
                    None => stats.malformed_edges += 1,
                }
                Ok(())
            })?;

        if stats.edges_fetched > self.cfg.max_edges {
            return Err(ClusterError::EdgeLimitExceeded {
                fetched: stats.edges_fetched,
                max: self.cfg.max_edges,
            });
        }

        // Adjacency over edge indices; vertices resolve through a dense map.
        let mut adjacency: FastMap<&str, Vec<u32>> = FastMap::new();
        for (idx, edge) in edges.iter().enumerate() {
            adjacency.entry(edge.from.as_str()).or_default().push(idx as u32);
            adjacency.entry(edge.to.as_str()).or_default().push(idx as u32);
        }
        stats.vertices = adjacency.len();

        let mut vertices: Vec<&str> = adjacency.keys().copied().collect();
        vertices.sort_unstable();

        let mut visited: FastSet<&str> = FastSet::new();
        let mut components: Vec<Vec<String>> = Vec::new();
        let mut stack: Vec<&str> = Vec::new();
        for &start in &vertices {
            if visited.contains(start) {
                continue;
            }
            let mut component = Vec::new();
            stack.push(start);
            visited.insert(start);
            while let Some(vertex) = stack.pop() {
                component.push(vertex.to_string());
                if let Some(edge_idxs) = adjacency.get(vertex) {
                    for &idx in edge_idxs {
                        let edge = &edges[idx as usize];
                        let neighbour = if edge.from == vertex {
                            edge.to.as_str()
                        } else {
                            edge.from.as_str()
                        };
                        if visited.insert(neighbour) {
                            stack.push(neighbour);
                        }
                    }
                }
            }
            components.push(component);
        }
        stats.components_found = components.len();

        let mut clusters = Vec::new();
        for mut members in components {
            members.sort();
            if members.len() < self.cfg.min_cluster_size {
                stats.dropped_small += 1;
                continue;
            }
            let oversized = members.len() > self.cfg.max_cluster_size;
            if oversized {
                match self.cfg.oversize_policy {
                    OversizePolicy::Drop => {
                        stats.dropped_oversized += 1;
                        continue;
                    }
                    OversizePolicy::Flag => {
                        stats.flagged_oversized += 1;
                        warn!(
                            size = members.len(),
                            max = self.cfg.max_cluster_size,
                            "keeping oversized cluster (flagged)"
                        );
                    }
                }
            }
            clusters.push(self.build_cluster(members, oversized, &edges, &adjacency));
        }
        stats.clusters_kept = clusters.len();

        info!(
            edges = stats.edges_fetched,
            vertices = stats.vertices,
            clusters = stats.clusters_kept,
            "clustering finished"
        );
        Ok(ClusterOutcome { clusters, stats })
    }

    fn build_cluster(
        &self,
        member_ids: Vec<String>,
        oversized: bool,
        edges: &[SimilarityEdge],
        adjacency: &FastMap<&str, Vec<u32>>,
    ) -> Cluster {
        // Sorted so weight sums accumulate in a fixed order and stats stay
        // bit-identical across runs.
        let mut edge_idxs: Vec<u32> = member_ids
            .iter()
            .filter_map(|m| adjacency.get(m.as_str()))
            .flat_map(|idxs| idxs.iter().copied())
            .collect();
        edge_idxs.sort_unstable();
        edge_idxs.dedup();
        let size = member_ids.len();
        let edge_count = edge_idxs.len();
        let mut min_weight = f64::INFINITY;
        let mut max_weight = f64::NEG_INFINITY;
        let mut weight_sum = 0.0;
        let mut confidence_sum = 0.0;
        for &idx in &edge_idxs {
            let edge = &edges[idx as usize];
            min_weight = min_weight.min(edge.weight);
            max_weight = max_weight.max(edge.weight);
            weight_sum += edge.weight;
            confidence_sum += edge.confidence;
        }
        let (min_weight, max_weight, avg_weight, avg_confidence) = if edge_count > 0 {
            (
                min_weight,
                max_weight,
                weight_sum / edge_count as f64,
                confidence_sum / edge_count as f64,
            )
        } else {
            (0.0, 0.0, 0.0, 0.0)
        };
        let possible = size as f64 * (size as f64 - 1.0) / 2.0;
        let density = if possible > 0.0 {
            edge_count as f64 / possible
        } else {
            0.0
        };

        let id = Uuid::new_v5(&CLUSTER_ID_NAMESPACE, member_ids.join("\u{1f}").as_bytes())
            .to_string();
        Cluster {
            id,
            quality_score: self.quality_score(size, density, avg_weight),
            member_ids,
            size,
            edge_count,
            min_weight,
            avg_weight,
            max_weight,
            avg_confidence,
            density,
            oversized,
            status: ClusterStatus::Computed,
        }
    }

    /// Quality combines size adequacy, density, and average weight
    /// (0.3 / 0.4 / 0.3) with a mild penalty for clusters over 20 members.
    fn quality_score(&self, size: usize, density: f64, avg_weight: f64) -> f64 {
        let mut size_factor = if size >= self.cfg.min_cluster_size {
            1.0
        } else {
            0.5
        };
        if size > 20 {
            size_factor *= 0.8;
        }
        let density_factor = if density >= self.cfg.density_threshold {
            density
        } else {
            density * 0.5
        };
        (0.3 * size_factor + 0.4 * density_factor + 0.3 * avg_weight).min(1.0)
    }

    /// Write clusters to the cluster collection and mark them persisted.
    pub fn persist(&self, clusters: &mut [Cluster]) -> Result<usize, ClusterError> {
        if clusters.is_empty() {
            return Ok(0);
        }
        self.store.create_collection(&self.cfg.cluster_collection)?;
        let records: Vec<Record> = clusters
            .iter()
            .map(|c| c.to_record(&self.cfg.cluster_collection))
            .collect();
        self.store
            .insert_many(&self.cfg.cluster_collection, records, OnConflict::Replace)?;
        for cluster in clusters.iter_mut() {
            cluster.status = ClusterStatus::Persisted;
        }
        Ok(clusters.len())
    }
}

/// Read persisted clusters back from the store.
pub fn load_clusters(
    store: &dyn DocumentStore,
    collection: &str,
) -> Result<Vec<Cluster>, ClusterError> {
    let mut clusters = Vec::new();
    store.scan(collection, &ScanFilter::none(), 1000, &mut |record| {
        if let Some(cluster) = Cluster::from_record(&record) {
            clusters.push(cluster);
        }
        Ok(())
    })?;
    Ok(clusters)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{EdgeInput, GraphBuilder, GraphConfig};
    use store::InMemoryStore;

    fn seed_edges(store: &Arc<InMemoryStore>, edges: &[(&str, &str, f64)]) {
        let builder = GraphBuilder::new(
            store.clone() as Arc<dyn DocumentStore>,
            GraphConfig::new("similarities").with_threshold(0.0),
        );
        builder
            .build(edges.iter().map(|(a, b, w)| EdgeInput {
                from: a.to_string(),
                to: b.to_string(),
                weight: *w,
                confidence: *w,
            }))
            .unwrap();
    }

    fn engine(store: Arc<InMemoryStore>, cfg: ClusterConfig) -> ClusterEngine {
        ClusterEngine::new(store, cfg).unwrap()
    }

    #[test]
    fn partitions_vertices_into_components() {
        let store = Arc::new(InMemoryStore::new());
        seed_edges(
            &store,
            &[("a", "b", 0.9), ("b", "c", 0.8), ("x", "y", 0.95)],
        );
        let outcome = engine(
            store,
            ClusterConfig::new("similarities", "clusters").with_store_results(false),
        )
        .run(&CancelToken::new())
        .unwrap();

        assert_eq!(outcome.clusters.len(), 2);
        let all_members: Vec<&String> = outcome
            .clusters
            .iter()
            .flat_map(|c| c.member_ids.iter())
            .collect();
        assert_eq!(all_members.len(), 5);
        let unique: std::collections::HashSet<&&String> = all_members.iter().collect();
        assert_eq!(unique.len(), 5);
    }

    #[test]
    fn cluster_stats_are_derived_from_edges() {
        let store = Arc::new(InMemoryStore::new());
        seed_edges(
            &store,
            &[("a", "b", 0.9), ("b", "c", 0.7), ("a", "c", 0.8)],
        );
        let outcome = engine(
            store,
            ClusterConfig::new("similarities", "clusters").with_store_results(false),
        )
        .run(&CancelToken::new())
        .unwrap();
        let cluster = &outcome.clusters[0];
        assert_eq!(cluster.size, 3);
        assert_eq!(cluster.edge_count, 3);
        assert!((cluster.density - 1.0).abs() < 1e-12);
        assert!((cluster.min_weight - 0.7).abs() < 1e-12);
        assert!((cluster.max_weight - 0.9).abs() < 1e-12);
        assert!((cluster.avg_weight - 0.8).abs() < 1e-12);
        assert!(cluster.quality_score > 0.8);
    }

    #[test]
    fn single_round_trip_regardless_of_graph_size() {
        let store = Arc::new(InMemoryStore::new());
        let edges: Vec<(String, String)> = (0..2000u32)
            .map(|i| (format!("v{}", i % 500), format!("v{}", (i * 7 + 1) % 500)))
            .collect();
        let owned: Vec<(&str, &str, f64)> = edges
            .iter()
            .filter(|(a, b)| a != b)
            .map(|(a, b)| (a.as_str(), b.as_str(), 0.9))
            .collect();
        seed_edges(&store, &owned);
        store.reset_op_counts();

        engine(
            store.clone(),
            ClusterConfig::new("similarities", "clusters").with_store_results(false),
        )
        .run(&CancelToken::new())
        .unwrap();
        let counts = store.op_counts();
        assert_eq!(counts.scan, 1, "edge fetch must be one bulk scan");
        assert_eq!(counts.get_many, 0, "no per-vertex queries allowed");
    }

    #[test]
    fn small_components_are_dropped() {
        let store = Arc::new(InMemoryStore::new());
        seed_edges(&store, &[("a", "b", 0.9)]);
        let outcome = engine(
            store,
            ClusterConfig::new("similarities", "clusters")
                .with_size_bounds(3, 100)
                .with_store_results(false),
        )
        .run(&CancelToken::new())
        .unwrap();
        assert!(outcome.clusters.is_empty());
        assert_eq!(outcome.stats.dropped_small, 1);
    }

    #[test]
    fn oversize_policy_flag_keeps_and_marks() {
        let store = Arc::new(InMemoryStore::new());
        let edges: Vec<(String, String)> =
            (0..5).map(|i| (format!("n{i}"), format!("n{}", i + 1))).collect();
        let owned: Vec<(&str, &str, f64)> = edges
            .iter()
            .map(|(a, b)| (a.as_str(), b.as_str(), 0.9))
            .collect();
        seed_edges(&store, &owned);

        let flagged = engine(
            store.clone(),
            ClusterConfig::new("similarities", "clusters")
                .with_size_bounds(2, 3)
                .with_store_results(false),
        )
        .run(&CancelToken::new())
        .unwrap();
        assert_eq!(flagged.clusters.len(), 1);
        assert!(flagged.clusters[0].oversized);
        assert_eq!(flagged.stats.flagged_oversized, 1);

        let dropped = engine(
            store,
            ClusterConfig::new("similarities", "clusters")
                .with_size_bounds(2, 3)
                .with_oversize_policy(OversizePolicy::Drop)
                .with_store_results(false),
        )
        .run(&CancelToken::new())
        .unwrap();
        assert!(dropped.clusters.is_empty());
        assert_eq!(dropped.stats.dropped_oversized, 1);
    }

    #[test]
    fn edge_limit_is_fatal_not_truncating() {
        let store = Arc::new(InMemoryStore::new());
        let edges: Vec<(String, String)> =
            (0..20).map(|i| (format!("a{i}"), format!("b{i}"))).collect();
        let owned: Vec<(&str, &str, f64)> = edges
            .iter()
            .map(|(a, b)| (a.as_str(), b.as_str(), 0.9))
            .collect();
        seed_edges(&store, &owned);

        let mut cfg = ClusterConfig::new("similarities", "clusters").with_store_results(false);
        cfg.max_edges = 10;
        cfg.warn_edges = 5;
        let err = engine(store, cfg).run(&CancelToken::new()).unwrap_err();
        assert!(matches!(err, ClusterError::EdgeLimitExceeded { max: 10, .. }));
    }

    #[test]
    fn cluster_ids_are_deterministic() {
        let store = Arc::new(InMemoryStore::new());
        seed_edges(&store, &[("a", "b", 0.9)]);
        let cfg = ClusterConfig::new("similarities", "clusters").with_store_results(false);
        let first = engine(store.clone(), cfg.clone())
            .run(&CancelToken::new())
            .unwrap();
        let second = engine(store, cfg).run(&CancelToken::new()).unwrap();
        assert_eq!(first.clusters[0].id, second.clusters[0].id);
    }

    #[test]
    fn persisted_clusters_read_back_with_same_members() {
        let store = Arc::new(InMemoryStore::new());
        seed_edges(&store, &[("a", "b", 0.9), ("b", "c", 0.85)]);
        let outcome = engine(
            store.clone(),
            ClusterConfig::new("similarities", "clusters"),
        )
        .run(&CancelToken::new())
        .unwrap();
        assert_eq!(outcome.stats.persisted, 1);
        assert_eq!(outcome.clusters[0].status, ClusterStatus::Persisted);

        let loaded = load_clusters(store.as_ref(), "clusters").unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].member_ids, outcome.clusters[0].member_ids);
    }

    #[test]
    fn min_weight_filter_prunes_edges() {
        let store = Arc::new(InMemoryStore::new());
        seed_edges(&store, &[("a", "b", 0.9), ("b", "c", 0.4)]);
        let mut cfg = ClusterConfig::new("similarities", "clusters").with_store_results(false);
        cfg.min_weight = Some(0.7);
        let outcome = engine(store, cfg).run(&CancelToken::new()).unwrap();
        assert_eq!(outcome.stats.edges_fetched, 1);
        assert_eq!(outcome.clusters.len(), 1);
        assert_eq!(outcome.clusters[0].member_ids, vec!["a", "b"]);
    }

    #[test]
    fn cancellation_skips_persistence() {
        let store = Arc::new(InMemoryStore::new());
        seed_edges(&store, &[("a", "b", 0.9)]);
        let cancel = CancelToken::new();
        cancel.cancel();
        let outcome = engine(
            store.clone(),
            ClusterConfig::new("similarities", "clusters"),
        )
        .run(&cancel)
        .unwrap();
        assert!(outcome.stats.cancelled);
        assert_eq!(outcome.stats.persisted, 0);
        assert!(!store.has_collection("clusters").unwrap());
    }

    #[test]
    fn invalid_config_rejected() {
        let store = Arc::new(InMemoryStore::new());
        let bad = ClusterConfig::new("e", "c").with_size_bounds(1, 100);
        assert!(matches!(
            ClusterEngine::new(store, bad),
            Err(ClusterError::InvalidConfig(_))
        ));
    }
}
