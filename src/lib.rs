//! Entlink - entity resolution for duplicate-ridden record collections.
//!
//! Given a collection of records that may describe the same real-world
//! entities (people, companies, addresses), entlink finds the groups that
//! co-refer and fuses each group into one canonical record. The work runs
//! as a four-stage pipeline over an abstract document store:
//!
//! 1. **Blocking** - cut the quadratic comparison space down to candidate
//!    pairs (composite keys, phonetic codes, BM25 text search, vector kNN,
//!    seeded random-hyperplane LSH).
//! 2. **Similarity scoring** - bulk-fetch records per batch and score each
//!    pair under a Fellegi–Sunter model with optional enrichment hooks.
//! 3. **Clustering** - persist match edges, then compute weakly-connected
//!    components with one bulk edge fetch and iterative DFS.
//! 4. **Golden records** - fuse each cluster per-field under deterministic
//!    rules, with provenance on every fused value.
//!
//! The umbrella crate re-exports the stage crates and hosts the
//! [`Pipeline`] orchestrator plus the [`PipelineConfig`] document (YAML
//! file or in-memory struct).
//!
//! ## Quick start
//!
//! ```
//! use std::sync::Arc;
//! use entlink::{Pipeline, PipelineConfig};
//! use entlink::store::{DocumentStore, InMemoryStore, OnConflict, Record};
//!
//! let store = Arc::new(InMemoryStore::new());
//! store.create_collection("people").unwrap();
//! store
//!     .insert_many(
//!         "people",
//!         vec![
//!             Record::new("people/1", "people")
//!                 .with_field("first_name", "John")
//!                 .with_field("last_name", "Smith")
//!                 .with_field("email", "john@acme.com"),
//!             Record::new("people/2", "people")
//!                 .with_field("first_name", "Jon")
//!                 .with_field("last_name", "Smith")
//!                 .with_field("email", "john@acme.com"),
//!         ],
//!         OnConflict::Replace,
//!     )
//!     .unwrap();
//!
//! let pipeline = Pipeline::new(store, PipelineConfig::for_collection("people")).unwrap();
//! let run = pipeline.run();
//! assert!(run.report.success);
//! assert_eq!(run.clusters.len(), 1);
//! assert_eq!(run.golden_records.len(), 1);
//! ```
//!
//! ## Reports and failure behavior
//!
//! [`Pipeline::run`] always returns a [`PipelineRun`]; on a stage failure
//! the report names the failed stage and keeps the counters gathered up to
//! that point. Writes are idempotent by key, so a cancelled or failed run
//! can simply be re-run. [`ConfigError`] is the only pre-start failure:
//! an invalid config never launches a pipeline.

mod config;
mod pipeline;

pub use crate::config::{
    BlockingStageConfig, ClusteringStageConfig, ConfigError, GoldenStageConfig, PipelineConfig,
    SimilarityStageConfig, StrategySpec,
};
pub use crate::pipeline::{DerivedMetrics, Pipeline, PipelineReport, PipelineRun};

// Stage crates, re-exported under their short names.
pub use blocking;
pub use cluster;
pub use embed;
pub use golden;
pub use scoring;
pub use similarity;
pub use store;
