//! Entlink Graph Builder & Cluster Engine
//!
//! Two stages share this crate because they share the edge model:
//!
//! - [`GraphBuilder`] persists scored pairs at or above the edge-creation
//!   threshold as undirected weighted [`SimilarityEdge`]s. Edge keys are
//!   deterministic, so rebuilding is idempotent. Two write paths exist:
//!   chunked API inserts and NDJSON bulk import.
//! - [`ClusterEngine`] computes weakly-connected components over the
//!   persisted graph: one bulk edge fetch, an in-memory adjacency map, and
//!   iterative DFS. The per-vertex-query traversal this replaces is the
//!   N+1 access pattern the engine exists to eliminate - tests pin the
//!   fetch to a single round trip.
//!
//! Cluster ids are uuid-v5 digests of the sorted member ids, so the same
//! component always gets the same id across runs.

mod graph;
mod wcc;

use store::StoreError;
use thiserror::Error;

pub use crate::graph::{
    EdgeInput, EdgeLoadingMethod, GraphBuilder, GraphConfig, GraphStats, SimilarityEdge,
    DEFAULT_EDGE_THRESHOLD,
};
pub use crate::wcc::{
    load_clusters, Cluster, ClusterAlgorithm, ClusterConfig, ClusterEngine, ClusterOutcome,
    ClusterStatus, ClusteringStats, OversizePolicy, CLUSTER_ID_NAMESPACE, DEFAULT_MAX_EDGES,
    DEFAULT_WARN_EDGES,
};

/// Errors raised by graph building and clustering.
#[derive(Debug, Clone, Error, PartialEq)]
#[non_exhaustive]
pub enum ClusterError {
    #[error("store error during clustering: {0}")]
    Store(#[from] StoreError),
    #[error("edge fetch exceeded max_edges: fetched {fetched}, limit {max}")]
    EdgeLimitExceeded { fetched: usize, max: usize },
    #[error("invalid cluster config: {0}")]
    InvalidConfig(String),
}
