//! Entlink Blocking Engine
//!
//! Blocking cuts the quadratic comparison space down to candidate pairs
//! worth scoring. Strategies are pluggable behind [`BlockingStrategy`];
//! the [`BlockingEngine`] runs a configured list of them, set-unions their
//! output under canonical pair ordering, and reports the reduction ratio.
//!
//! ## Strategies
//!
//! - [`CompositeKeyStrategy`] - group records by a deterministic key built
//!   from field projections; emit all intra-group pairs. Oversized blocks
//!   are discarded, not sampled.
//! - exact-field and phonetic blocking are composite-key specials
//!   ([`CompositeKeyStrategy::exact_field`],
//!   [`CompositeKeyStrategy::phonetic`]).
//! - [`TextBlockingStrategy`] - BM25 search of a text index with each
//!   record's own field values.
//! - [`VectorBlockingStrategy`] - approximate-nearest-neighbour search of
//!   a vector index, optionally gated by an exact-match field.
//! - [`LshStrategy`] - random-hyperplane LSH over embeddings; needs no
//!   vector index and is reproducible from its seed.
//!
//! ## Failure semantics
//!
//! A strategy that fails for a single record logs the failure and keeps
//! going; a strategy that cannot run at all (missing index) surfaces a
//! [`BlockingError`] to the orchestrator. Skipping an oversized block is a
//! normal outcome, counted in [`StrategyStats`].

mod composite;
mod lsh;
mod text;
mod vector;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use store::{DocumentStore, StoreError};
use thiserror::Error;
use tracing::info;

pub use crate::composite::{CompositeKeyStrategy, KeyPart, KeyTransform};
pub use crate::lsh::LshStrategy;
pub use crate::text::TextBlockingStrategy;
pub use crate::vector::VectorBlockingStrategy;

/// Page size used by strategies when scanning source records.
pub(crate) const SCAN_BATCH: usize = 1000;

/// Default cap on intra-block pair emission.
pub const DEFAULT_MAX_BLOCK_SIZE: usize = 100;

/// Errors surfaced by blocking strategies and the engine.
#[derive(Debug, Clone, Error, PartialEq)]
#[non_exhaustive]
pub enum BlockingError {
    #[error("store error during blocking: {0}")]
    Store(#[from] StoreError),
    #[error("invalid config for strategy {strategy}: {reason}")]
    InvalidConfig { strategy: String, reason: String },
    #[error("duplicate strategy name: {0}")]
    DuplicateStrategy(String),
}

/// An unordered candidate pair in canonical form (`id_a < id_b`), with the
/// strategies that produced it and an optional blocking key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidatePair {
    pub id_a: String,
    pub id_b: String,
    /// Every strategy that emitted this pair, in emission order.
    pub strategies: Vec<String>,
    /// Key of the block that produced the pair, when the strategy has one.
    pub blocking_key: Option<String>,
}

impl CandidatePair {
    /// Canonicalize endpoint order. Returns `None` for self-pairs.
    pub fn new(
        a: impl Into<String>,
        b: impl Into<String>,
        strategy: &str,
        blocking_key: Option<String>,
    ) -> Option<Self> {
        let a = a.into();
        let b = b.into();
        if a == b {
            return None;
        }
        let (id_a, id_b) = if a < b { (a, b) } else { (b, a) };
        Some(Self {
            id_a,
            id_b,
            strategies: vec![strategy.to_string()],
            blocking_key,
        })
    }

    /// The `(id_a, id_b)` dedup key.
    pub fn key(&self) -> (&str, &str) {
        (self.id_a.as_str(), self.id_b.as_str())
    }
}

/// Counters reported by a single strategy run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyStats {
    pub pairs_emitted: usize,
    pub records_scanned: usize,
    /// Records the strategy could not use (missing key fields, missing or
    /// mismatched embeddings, missing gate values).
    pub records_skipped: usize,
    pub blocks_built: usize,
    pub oversized_blocks_skipped: usize,
    /// Per-record failures that were logged and survived.
    pub record_failures: usize,
}

/// Pairs plus counters from one strategy.
#[derive(Debug, Clone, Default)]
pub struct StrategyOutput {
    pub pairs: Vec<CandidatePair>,
    pub stats: StrategyStats,
}

/// A candidate-pair generator.
pub trait BlockingStrategy: Send + Sync {
    /// Unique name used in pair provenance and per-strategy stats.
    fn name(&self) -> &str;

    /// Emit candidate pairs for every record in `collection`.
    fn generate(
        &self,
        store: &dyn DocumentStore,
        collection: &str,
    ) -> Result<StrategyOutput, BlockingError>;
}

/// Aggregate counters for one blocking run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockingStats {
    pub records_in_collection: usize,
    /// Pair emissions before cross-strategy dedup.
    pub total_emitted: usize,
    pub unique_pairs: usize,
    /// `1 - pairs / (n*(n-1)/2)`; 0.0 when fewer than two records exist.
    pub reduction_ratio: f64,
    pub per_strategy: BTreeMap<String, StrategyStats>,
}

/// Result of running the blocking engine.
#[derive(Debug, Clone, Default)]
pub struct BlockingOutcome {
    /// Deduplicated pairs in canonical order, sorted by `(id_a, id_b)`.
    pub pairs: Vec<CandidatePair>,
    pub stats: BlockingStats,
}

/// Runs a list of strategies and merges their output.
pub struct BlockingEngine {
    strategies: Vec<Box<dyn BlockingStrategy>>,
}

impl BlockingEngine {
    pub fn new(strategies: Vec<Box<dyn BlockingStrategy>>) -> Result<Self, BlockingError> {
        let mut seen = std::collections::HashSet::new();
        for strategy in &strategies {
            if !seen.insert(strategy.name().to_string()) {
                return Err(BlockingError::DuplicateStrategy(strategy.name().to_string()));
            }
        }
        Ok(Self { strategies })
    }

    pub fn strategy_names(&self) -> Vec<&str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    /// Run every strategy against `collection` and dedup across them.
    ///
    /// If the same pair is produced by several strategies it is emitted
    /// once, with all producing strategies recorded in its provenance.
    pub fn run(
        &self,
        store: &dyn DocumentStore,
        collection: &str,
    ) -> Result<BlockingOutcome, BlockingError> {
        let records_in_collection = store.count(collection)?;
        let mut merged: BTreeMap<(String, String), CandidatePair> = BTreeMap::new();
        let mut stats = BlockingStats {
            records_in_collection,
            ..BlockingStats::default()
        };

        for strategy in &self.strategies {
            let output = strategy.generate(store, collection)?;
            stats.total_emitted += output.pairs.len();
            info!(
                strategy = strategy.name(),
                pairs = output.pairs.len(),
                oversized_skipped = output.stats.oversized_blocks_skipped,
                "blocking strategy finished"
            );
            stats
                .per_strategy
                .insert(strategy.name().to_string(), output.stats);
            for pair in output.pairs {
                let key = (pair.id_a.clone(), pair.id_b.clone());
                match merged.get_mut(&key) {
                    Some(existing) => {
                        for name in pair.strategies {
                            if !existing.strategies.contains(&name) {
                                existing.strategies.push(name);
                            }
                        }
                        if existing.blocking_key.is_none() {
                            existing.blocking_key = pair.blocking_key;
                        }
                    }
                    None => {
                        merged.insert(key, pair);
                    }
                }
            }
        }

        let pairs: Vec<CandidatePair> = merged.into_values().collect();
        stats.unique_pairs = pairs.len();
        stats.reduction_ratio = reduction_ratio(records_in_collection, pairs.len());
        Ok(BlockingOutcome { pairs, stats })
    }
}

/// `1 - pairs / (n*(n-1)/2)`, clamped to `[0, 1]`; defined as 0.0 when the
/// collection has fewer than two records.
pub fn reduction_ratio(record_count: usize, pair_count: usize) -> f64 {
    if record_count < 2 {
        return 0.0;
    }
    let possible = record_count as f64 * (record_count as f64 - 1.0) / 2.0;
    (1.0 - pair_count as f64 / possible).clamp(0.0, 1.0)
}
