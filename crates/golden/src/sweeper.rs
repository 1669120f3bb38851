//! Relationship provenance sweeper.
//!
//! After consolidation, domain relationships between source records must
//! point at the golden records. The sweeper remaps each edge's endpoints
//! through the member->golden mapping, merges duplicates under a
//! deterministic key, and keeps the original endpoints in a provenance
//! array so lineage survives the rewrite.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use store::{DocumentStore, OnConflict, Record, ScanFilter, Value};
use tracing::info;
use xxhash_rust::xxh3::xxh3_64;

use crate::GoldenError;

/// Sweeper configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweeperConfig {
    /// Edge collection holding the original domain relationships.
    pub relation_collection: String,
    /// Edge collection receiving the remapped relationships.
    pub output_collection: String,
    #[serde(default = "SweeperConfig::default_track_provenance")]
    pub track_provenance: bool,
    #[serde(default = "SweeperConfig::default_deduplicate_edges")]
    pub deduplicate_edges: bool,
}

impl SweeperConfig {
    fn default_track_provenance() -> bool {
        true
    }

    fn default_deduplicate_edges() -> bool {
        true
    }

    pub fn new(
        relation_collection: impl Into<String>,
        output_collection: impl Into<String>,
    ) -> Self {
        Self {
            relation_collection: relation_collection.into(),
            output_collection: output_collection.into(),
            track_provenance: Self::default_track_provenance(),
            deduplicate_edges: Self::default_deduplicate_edges(),
        }
    }
}

/// Counters for one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepStats {
    pub edges_scanned: usize,
    /// Edges where at least one endpoint was remapped.
    pub edges_remapped: usize,
    pub duplicates_merged: usize,
    /// Edges whose endpoints collapsed onto the same golden record.
    pub self_loops_collapsed: usize,
    pub edges_written: usize,
}

struct MergedEdge {
    from: String,
    to: String,
    relation: String,
    provenance: Vec<Value>,
}

/// Remaps domain relationships through entity consolidation.
pub struct RelationshipSweeper {
    store: Arc<dyn DocumentStore>,
    cfg: SweeperConfig,
}

impl RelationshipSweeper {
    pub fn new(store: Arc<dyn DocumentStore>, cfg: SweeperConfig) -> Self {
        Self { store, cfg }
    }

    /// Rewrite every relationship whose endpoints appear in `mapping`.
    pub fn sweep(&self, mapping: &HashMap<String, String>) -> Result<SweepStats, GoldenError> {
        let mut stats = SweepStats::default();
        let mut merged: BTreeMap<String, MergedEdge> = BTreeMap::new();

        self.store.scan(
            &self.cfg.relation_collection,
            &ScanFilter::none(),
            1000,
            &mut |record| {
                stats.edges_scanned += 1;
                let Some(original_from) = record.field_text("_from") else {
                    return Ok(());
                };
                let Some(original_to) = record.field_text("_to") else {
                    return Ok(());
                };
                let relation = record
                    .field_text("relation")
                    .unwrap_or_else(|| "related".to_string());

                let from = mapping
                    .get(&original_from)
                    .cloned()
                    .unwrap_or_else(|| original_from.clone());
                let to = mapping
                    .get(&original_to)
                    .cloned()
                    .unwrap_or_else(|| original_to.clone());
                if from != original_from || to != original_to {
                    stats.edges_remapped += 1;
                }
                if from == to {
                    stats.self_loops_collapsed += 1;
                    return Ok(());
                }

                let key = format!(
                    "{:016x}",
                    xxh3_64(format!("{from}|{to}|{relation}").as_bytes())
                );
                let provenance_entry = {
                    let mut map = BTreeMap::new();
                    map.insert("original_from".to_string(), Value::from(original_from));
                    map.insert("original_to".to_string(), Value::from(original_to));
                    map.insert("source_key".to_string(), Value::from(record.id.clone()));
                    Value::Map(map)
                };

                if self.cfg.deduplicate_edges {
                    if let Some(existing) = merged.get_mut(&key) {
                        stats.duplicates_merged += 1;
                        existing.provenance.push(provenance_entry);
                        return Ok(());
                    }
                }
                merged.insert(
                    key,
                    MergedEdge {
                        from,
                        to,
                        relation,
                        provenance: vec![provenance_entry],
                    },
                );
                Ok(())
            },
        )?;

        self.store
            .create_edge_collection(&self.cfg.output_collection)?;
        let records: Vec<Record> = merged
            .into_iter()
            .map(|(key, edge)| {
                let mut record = Record::new(key, self.cfg.output_collection.clone())
                    .with_field("_from", edge.from)
                    .with_field("_to", edge.to)
                    .with_field("relation", edge.relation);
                if self.cfg.track_provenance {
                    record
                        .fields
                        .insert("provenance".to_string(), Value::List(edge.provenance));
                }
                record
            })
            .collect();
        stats.edges_written = records.len();
        if !records.is_empty() {
            self.store
                .insert_many(&self.cfg.output_collection, records, OnConflict::Replace)?;
        }

        info!(
            scanned = stats.edges_scanned,
            remapped = stats.edges_remapped,
            merged = stats.duplicates_merged,
            written = stats.edges_written,
            "relationship sweep finished"
        );
        Ok(stats)
    }
}
