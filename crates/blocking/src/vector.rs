//! Vector-kNN blocking.
//!
//! Pairs each embedded record with its approximate nearest neighbours
//! above a cosine floor, optionally gated so that only records agreeing on
//! an exact-match field (e.g. state) are compared.

use hashbrown::HashMap as FastMap;
use store::{DocumentStore, ScanFilter, StoreErrorKind};
use tracing::warn;

use crate::{
    BlockingError, BlockingStrategy, CandidatePair, StrategyOutput, StrategyStats, SCAN_BATCH,
};

/// ANN blocking over a pre-created vector index.
pub struct VectorBlockingStrategy {
    name: String,
    index: String,
    limit_per_entity: usize,
    min_cosine: f64,
    /// When set, a pair is only emitted if both records carry an equal
    /// (case-insensitive) value in this field.
    blocking_field: Option<String>,
}

impl VectorBlockingStrategy {
    pub fn new(index: impl Into<String>) -> Self {
        Self {
            name: "vector".to_string(),
            index: index.into(),
            limit_per_entity: 10,
            min_cosine: 0.8,
            blocking_field: None,
        }
    }

    pub fn with_limit_per_entity(mut self, limit: usize) -> Self {
        self.limit_per_entity = limit.max(1);
        self
    }

    pub fn with_min_cosine(mut self, min_cosine: f64) -> Self {
        self.min_cosine = min_cosine;
        self
    }

    pub fn with_blocking_field(mut self, field: impl Into<String>) -> Self {
        self.blocking_field = Some(field.into());
        self
    }
}

impl BlockingStrategy for VectorBlockingStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn generate(
        &self,
        store: &dyn DocumentStore,
        collection: &str,
    ) -> Result<StrategyOutput, BlockingError> {
        let mut stats = StrategyStats::default();
        let mut queries: Vec<(String, Vec<f32>, Option<String>)> = Vec::new();
        store.scan(
            collection,
            &ScanFilter::none().with_embedding(true),
            SCAN_BATCH,
            &mut |record| {
                stats.records_scanned += 1;
                let gate = self
                    .blocking_field
                    .as_deref()
                    .and_then(|f| record.field_text(f))
                    .map(|v| v.to_lowercase());
                if self.blocking_field.is_some() && gate.is_none() {
                    stats.records_skipped += 1;
                    return Ok(());
                }
                let embedding = record.embedding.clone().unwrap_or_default();
                queries.push((record.id, embedding, gate));
                Ok(())
            },
        )?;

        // First pass: collect tentative pairs from ANN hits.
        let mut tentative: Vec<(String, String, Option<String>)> = Vec::new();
        for (id, embedding, gate) in &queries {
            let hits = match store.vector_search(
                collection,
                &self.index,
                embedding,
                self.limit_per_entity + 1,
                self.min_cosine,
            ) {
                Ok(hits) => hits,
                Err(err) if err.kind == StoreErrorKind::NotFound => {
                    return Err(BlockingError::Store(err))
                }
                Err(err) => {
                    stats.record_failures += 1;
                    warn!(record = id.as_str(), "vector blocking query failed: {err}");
                    continue;
                }
            };
            let mut taken = 0;
            for hit in hits {
                if hit.id == *id {
                    continue;
                }
                if taken >= self.limit_per_entity {
                    break;
                }
                taken += 1;
                tentative.push((id.clone(), hit.id, gate.clone()));
            }
        }

        // The gate check needs hit-side field values: resolve them with a
        // single batch fetch instead of one lookup per hit.
        let pairs = if let Some(gate_field) = &self.blocking_field {
            let mut hit_ids: Vec<String> =
                tentative.iter().map(|(_, hit, _)| hit.clone()).collect();
            hit_ids.sort();
            hit_ids.dedup();
            let batch = store.get_many(collection, &hit_ids)?;
            let gate_values: FastMap<&str, String> = batch
                .found
                .iter()
                .filter_map(|(id, record)| {
                    record
                        .field_text(gate_field)
                        .map(|v| (id.as_str(), v.to_lowercase()))
                })
                .collect();
            tentative
                .into_iter()
                .filter_map(|(a, b, gate)| {
                    let query_gate = gate?;
                    let hit_gate = gate_values.get(b.as_str())?;
                    if *hit_gate != query_gate {
                        return None;
                    }
                    CandidatePair::new(a, b, &self.name, Some(query_gate))
                })
                .collect()
        } else {
            tentative
                .into_iter()
                .filter_map(|(a, b, _)| CandidatePair::new(a, b, &self.name, None))
                .collect()
        };

        let mut output = StrategyOutput { pairs, stats };
        output.stats.pairs_emitted = output.pairs.len();
        Ok(output)
    }
}
