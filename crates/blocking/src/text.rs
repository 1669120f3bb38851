//! BM25 text blocking.
//!
//! Queries a text index with each record's own field values and pairs the
//! record with its top-ranked hits. Needs a store that supports
//! BM25-scorable text search.

use store::{DocumentStore, ScanFilter, StoreErrorKind};
use tracing::warn;

use crate::{
    BlockingError, BlockingStrategy, CandidatePair, StrategyOutput, StrategyStats, SCAN_BATCH,
};

/// Text-search blocking over a pre-created text index.
pub struct TextBlockingStrategy {
    name: String,
    index: String,
    fields: Vec<String>,
    limit_per_entity: usize,
    min_score: f64,
}

impl TextBlockingStrategy {
    pub fn new(
        index: impl Into<String>,
        fields: Vec<String>,
    ) -> Result<Self, BlockingError> {
        if fields.is_empty() {
            return Err(BlockingError::InvalidConfig {
                strategy: "text".into(),
                reason: "at least one query field is required".into(),
            });
        }
        Ok(Self {
            name: "text".to_string(),
            index: index.into(),
            fields,
            limit_per_entity: 10,
            min_score: 0.0,
        })
    }

    pub fn with_limit_per_entity(mut self, limit: usize) -> Self {
        self.limit_per_entity = limit.max(1);
        self
    }

    pub fn with_min_score(mut self, min_score: f64) -> Self {
        self.min_score = min_score;
        self
    }

    fn query_for(&self, record: &store::Record) -> Option<String> {
        let parts: Vec<String> = self
            .fields
            .iter()
            .filter_map(|f| record.field_text(f))
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(" "))
        }
    }
}

impl BlockingStrategy for TextBlockingStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn generate(
        &self,
        store: &dyn DocumentStore,
        collection: &str,
    ) -> Result<StrategyOutput, BlockingError> {
        let mut stats = StrategyStats::default();
        let mut queries: Vec<(String, String)> = Vec::new();
        store.scan(collection, &ScanFilter::none(), SCAN_BATCH, &mut |record| {
            stats.records_scanned += 1;
            match self.query_for(&record) {
                Some(query) => queries.push((record.id, query)),
                None => stats.records_skipped += 1,
            }
            Ok(())
        })?;

        let mut pairs = Vec::new();
        for (id, query) in queries {
            // One extra hit so the record itself never crowds out a match.
            let hits = match store.text_search(
                collection,
                &self.index,
                &query,
                self.limit_per_entity + 1,
                self.min_score,
            ) {
                Ok(hits) => hits,
                // A missing index is a wholesale failure; anything else is
                // a per-record failure that the run survives.
                Err(err) if err.kind == StoreErrorKind::NotFound => {
                    return Err(BlockingError::Store(err))
                }
                Err(err) => {
                    stats.record_failures += 1;
                    warn!(record = id.as_str(), "text blocking query failed: {err}");
                    continue;
                }
            };
            let mut taken = 0;
            for hit in hits {
                if hit.id == id {
                    continue;
                }
                if taken >= self.limit_per_entity {
                    break;
                }
                taken += 1;
                if let Some(pair) = CandidatePair::new(id.clone(), hit.id, &self.name, None) {
                    pairs.push(pair);
                }
            }
        }
        stats.pairs_emitted = pairs.len();
        Ok(StrategyOutput { pairs, stats })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use store::{InMemoryStore, OnConflict, Record, TextAnalyzer};

    fn seeded() -> InMemoryStore {
        let store = InMemoryStore::new();
        store.create_collection("people").unwrap();
        store
            .insert_many(
                "people",
                vec![
                    Record::new("people/1", "people")
                        .with_field("first_name", "John")
                        .with_field("last_name", "Smith"),
                    Record::new("people/2", "people")
                        .with_field("first_name", "John")
                        .with_field("last_name", "Smith"),
                    Record::new("people/3", "people")
                        .with_field("first_name", "Maria")
                        .with_field("last_name", "Garcia"),
                ],
                OnConflict::Replace,
            )
            .unwrap();
        store
            .create_text_index(
                "people",
                "people_text",
                &["first_name".to_string(), "last_name".to_string()],
                TextAnalyzer::Text,
            )
            .unwrap();
        store
    }

    #[test]
    fn pairs_records_with_their_text_hits() {
        let store = seeded();
        let strategy = TextBlockingStrategy::new(
            "people_text",
            vec!["first_name".to_string(), "last_name".to_string()],
        )
        .unwrap()
        .with_limit_per_entity(5);

        let output = strategy.generate(&store, "people").unwrap();
        assert!(output
            .pairs
            .iter()
            .any(|p| p.key() == ("people/1", "people/2")));
        // Every emitted pair is canonical and non-self.
        for pair in &output.pairs {
            assert!(pair.id_a < pair.id_b);
        }
    }

    #[test]
    fn missing_index_is_a_wholesale_failure() {
        let store = seeded();
        let strategy =
            TextBlockingStrategy::new("absent_index", vec!["last_name".to_string()]).unwrap();
        let err = strategy.generate(&store, "people").unwrap_err();
        assert!(matches!(err, BlockingError::Store(e) if e.kind == StoreErrorKind::NotFound));
    }

    #[test]
    fn records_without_query_fields_are_skipped() {
        let store = seeded();
        store
            .insert_many(
                "people",
                vec![Record::new("people/4", "people").with_field("phone", "555")],
                OnConflict::Replace,
            )
            .unwrap();
        let strategy =
            TextBlockingStrategy::new("people_text", vec!["last_name".to_string()]).unwrap();
        let output = strategy.generate(&store, "people").unwrap();
        assert_eq!(output.stats.records_skipped, 1);
    }
}
