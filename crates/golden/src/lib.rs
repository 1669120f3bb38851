//! Entlink Golden Record Builder
//!
//! Fuses each cluster's member records into one canonical record. Every
//! golden field carries provenance (which member contributed the value,
//! under which rule, how many alternatives existed), and the record keeps
//! id-based references to its cluster and members - no object graphs.
//!
//! Member records are fetched in batches across clusters (one bulk fetch
//! per batch), and fusion itself fans out across clusters with rayon.
//! [`RelationshipSweeper`] then remaps domain relationships onto golden
//! ids while preserving the original endpoints as provenance.

mod fusion;
mod sweeper;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use cluster::Cluster;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use store::{
    with_retry, CancelToken, DocumentStore, OnConflict, Record, StoreError, Value,
    DEFAULT_RETRY_ATTEMPTS,
};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

pub use crate::fusion::{fuse_field, FusedField, FusionPolicy, FusionRule};
pub use crate::sweeper::{RelationshipSweeper, SweepStats, SweeperConfig};

/// Namespace for deterministic golden-record ids (uuid v5 over cluster id).
pub const GOLDEN_ID_NAMESPACE: Uuid = Uuid::from_u128(0x41c9_02ae_7de4_4f51_9b23_6c70_55ea_8833);

/// Errors raised while building golden records.
#[derive(Debug, Clone, Error, PartialEq)]
#[non_exhaustive]
pub enum GoldenError {
    #[error("store error during golden-record build: {0}")]
    Store(#[from] StoreError),
    #[error("invalid golden config: {0}")]
    InvalidConfig(String),
}

/// Provenance of one fused field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldProvenance {
    pub value: Value,
    pub source_member_id: String,
    pub rule: String,
    pub alternatives_considered: usize,
}

/// The consolidated representative of one cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoldenRecord {
    /// Deterministic id derived from the cluster id.
    pub id: String,
    pub cluster_id: String,
    pub member_ids: Vec<String>,
    pub fields: BTreeMap<String, Value>,
    /// One provenance entry per fused field.
    pub provenance: BTreeMap<String, FieldProvenance>,
    /// Fraction of the cluster's field universe that is populated.
    pub data_quality_score: f64,
    /// Mean of the cluster's pairwise confidences.
    pub confidence_score: f64,
    pub created_at: DateTime<Utc>,
}

impl GoldenRecord {
    pub fn to_record(&self, collection: &str) -> Record {
        let mut record = Record::new(self.id.clone(), collection);
        for (field, value) in &self.fields {
            record.fields.insert(field.clone(), value.clone());
        }
        let provenance: BTreeMap<String, Value> = self
            .provenance
            .iter()
            .map(|(field, p)| {
                let mut map = BTreeMap::new();
                map.insert("value".to_string(), p.value.clone());
                map.insert(
                    "source_member_id".to_string(),
                    Value::from(p.source_member_id.clone()),
                );
                map.insert("rule".to_string(), Value::from(p.rule.clone()));
                map.insert(
                    "alternatives_considered".to_string(),
                    Value::Int(p.alternatives_considered as i64),
                );
                (field.clone(), Value::Map(map))
            })
            .collect();
        record.fields.insert(
            "_cluster_id".to_string(),
            Value::from(self.cluster_id.clone()),
        );
        record.fields.insert(
            "_member_ids".to_string(),
            Value::List(
                self.member_ids
                    .iter()
                    .map(|m| Value::from(m.clone()))
                    .collect(),
            ),
        );
        record
            .fields
            .insert("_provenance".to_string(), Value::Map(provenance));
        record.fields.insert(
            "_data_quality_score".to_string(),
            Value::Float(self.data_quality_score),
        );
        record.fields.insert(
            "_confidence_score".to_string(),
            Value::Float(self.confidence_score),
        );
        record.fields.insert(
            "_created_at".to_string(),
            Value::from(self.created_at.to_rfc3339()),
        );
        record
    }
}

/// Golden-record stage configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoldenConfig {
    pub source_collection: String,
    pub golden_collection: String,
    #[serde(default)]
    pub policy: FusionPolicy,
    #[serde(default = "GoldenConfig::default_store_results")]
    pub store_results: bool,
    /// Clusters fused per bulk member fetch.
    #[serde(default = "GoldenConfig::default_cluster_batch")]
    pub cluster_batch: usize,
}

impl GoldenConfig {
    fn default_store_results() -> bool {
        true
    }

    fn default_cluster_batch() -> usize {
        50
    }

    pub fn new(
        source_collection: impl Into<String>,
        golden_collection: impl Into<String>,
    ) -> Self {
        Self {
            source_collection: source_collection.into(),
            golden_collection: golden_collection.into(),
            policy: FusionPolicy::default(),
            store_results: Self::default_store_results(),
            cluster_batch: Self::default_cluster_batch(),
        }
    }

    pub fn with_policy(mut self, policy: FusionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_store_results(mut self, store_results: bool) -> Self {
        self.store_results = store_results;
        self
    }

    pub fn validate(&self) -> Result<(), GoldenError> {
        if self.cluster_batch == 0 {
            return Err(GoldenError::InvalidConfig(
                "cluster_batch must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Counters for one golden-record run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GoldenStats {
    pub clusters_in: usize,
    pub golden_records: usize,
    /// Clusters with no resolvable members.
    pub clusters_skipped: usize,
    pub missing_members: usize,
    pub persisted: usize,
    pub mean_quality: f64,
    pub cancelled: bool,
}

/// Result of a golden-record run.
#[derive(Debug, Clone, Default)]
pub struct GoldenOutcome {
    pub records: Vec<GoldenRecord>,
    pub stats: GoldenStats,
}

/// Builds golden records from clusters.
pub struct GoldenRecordBuilder {
    store: Arc<dyn DocumentStore>,
    cfg: GoldenConfig,
}

impl GoldenRecordBuilder {
    pub fn new(store: Arc<dyn DocumentStore>, cfg: GoldenConfig) -> Result<Self, GoldenError> {
        cfg.validate()?;
        Ok(Self { store, cfg })
    }

    /// Fuse every cluster into a golden record.
    pub fn build(
        &self,
        clusters: &[Cluster],
        cancel: &CancelToken,
    ) -> Result<GoldenOutcome, GoldenError> {
        let mut outcome = GoldenOutcome::default();
        outcome.stats.clusters_in = clusters.len();

        for batch in clusters.chunks(self.cfg.cluster_batch) {
            if cancel.is_cancelled() {
                outcome.stats.cancelled = true;
                break;
            }
            let mut ids: Vec<String> = batch
                .iter()
                .flat_map(|c| c.member_ids.iter().cloned())
                .collect();
            ids.sort();
            ids.dedup();
            let fetched = with_retry(DEFAULT_RETRY_ATTEMPTS, || {
                self.store.get_many(&self.cfg.source_collection, &ids)
            })?;
            outcome.stats.missing_members += fetched.missing.len();
            if !fetched.missing.is_empty() {
                debug!(
                    missing = fetched.missing.len(),
                    "cluster members missing from source collection"
                );
            }

            let fused: Vec<Option<GoldenRecord>> = batch
                .par_iter()
                .map(|cluster| self.fuse_cluster(cluster, &fetched.found))
                .collect();
            for record in fused {
                match record {
                    Some(record) => outcome.records.push(record),
                    None => outcome.stats.clusters_skipped += 1,
                }
            }
        }

        outcome.stats.golden_records = outcome.records.len();
        if !outcome.records.is_empty() {
            outcome.stats.mean_quality = outcome
                .records
                .iter()
                .map(|r| r.data_quality_score)
                .sum::<f64>()
                / outcome.records.len() as f64;
        }

        if self.cfg.store_results && !outcome.stats.cancelled && !outcome.records.is_empty() {
            self.store.create_collection(&self.cfg.golden_collection)?;
            let documents: Vec<Record> = outcome
                .records
                .iter()
                .map(|r| r.to_record(&self.cfg.golden_collection))
                .collect();
            with_retry(DEFAULT_RETRY_ATTEMPTS, || {
                self.store.insert_many(
                    &self.cfg.golden_collection,
                    documents.clone(),
                    OnConflict::Replace,
                )
            })?;
            outcome.stats.persisted = outcome.records.len();
        }

        info!(
            clusters = outcome.stats.clusters_in,
            golden_records = outcome.stats.golden_records,
            skipped = outcome.stats.clusters_skipped,
            "golden-record build finished"
        );
        Ok(outcome)
    }

    fn fuse_cluster(
        &self,
        cluster: &Cluster,
        records: &HashMap<String, Record>,
    ) -> Option<GoldenRecord> {
        let mut members: Vec<&Record> = cluster
            .member_ids
            .iter()
            .filter_map(|id| records.get(id))
            .collect();
        if members.is_empty() {
            return None;
        }
        members.sort_by(|a, b| a.id.cmp(&b.id));

        // Field universe: every non-internal field any member carries.
        let mut field_names: Vec<&str> = members
            .iter()
            .flat_map(|r| r.fields.keys())
            .map(String::as_str)
            .filter(|f| !f.starts_with('_'))
            .collect();
        field_names.sort();
        field_names.dedup();

        let mut fields = BTreeMap::new();
        let mut provenance = BTreeMap::new();
        for field in &field_names {
            let rule = self.cfg.policy.rule_for(field);
            if let Some(fused) = fuse_field(field, rule, &members) {
                fields.insert(field.to_string(), fused.value.clone());
                provenance.insert(
                    field.to_string(),
                    FieldProvenance {
                        value: fused.value,
                        source_member_id: fused.source_member_id,
                        rule: fused.rule.to_string(),
                        alternatives_considered: fused.alternatives_considered,
                    },
                );
            }
        }

        let data_quality_score = if field_names.is_empty() {
            0.0
        } else {
            fields.len() as f64 / field_names.len() as f64
        };

        Some(GoldenRecord {
            id: Uuid::new_v5(&GOLDEN_ID_NAMESPACE, cluster.id.as_bytes()).to_string(),
            cluster_id: cluster.id.clone(),
            member_ids: cluster.member_ids.clone(),
            fields,
            provenance,
            data_quality_score,
            confidence_score: cluster.avg_confidence.clamp(0.0, 1.0),
            created_at: Utc::now(),
        })
    }
}

/// Duplicate-member -> golden-id mapping used by the relationship sweeper.
pub fn member_mapping(records: &[GoldenRecord]) -> HashMap<String, String> {
    let mut mapping = HashMap::new();
    for record in records {
        for member in &record.member_ids {
            mapping.insert(member.clone(), record.id.clone());
        }
    }
    mapping
}

#[cfg(test)]
mod tests {
    use super::*;
    use cluster::ClusterStatus;
    use store::InMemoryStore;

    fn cluster_of(members: &[&str], avg_confidence: f64) -> Cluster {
        let member_ids: Vec<String> = members.iter().map(|m| m.to_string()).collect();
        Cluster {
            id: format!("cluster-{}", members.join("-")),
            size: member_ids.len(),
            member_ids,
            edge_count: members.len().saturating_sub(1),
            min_weight: 0.8,
            avg_weight: 0.85,
            max_weight: 0.9,
            avg_confidence,
            density: 1.0,
            quality_score: 0.9,
            oversized: false,
            status: ClusterStatus::Computed,
        }
    }

    fn seeded() -> Arc<InMemoryStore> {
        let store = InMemoryStore::new();
        store.create_collection("people").unwrap();
        store
            .insert_many(
                "people",
                vec![
                    Record::new("people/1", "people")
                        .with_field("first_name", "John")
                        .with_field("last_name", "Smith")
                        .with_field("street", "123 Main St")
                        .with_field("city", "NYC")
                        .with_field("email", "john@acme.com"),
                    Record::new("people/2", "people")
                        .with_field("first_name", "Jon")
                        .with_field("last_name", "Smith")
                        .with_field("street", "123 Main Street")
                        .with_field("city", "NYC")
                        .with_field("email", "j.smith@acme.com"),
                    Record::new("people/3", "people")
                        .with_field("first_name", "John")
                        .with_field("last_name", "Smyth")
                        .with_field("street", "123 Main St")
                        .with_field("city", "New York")
                        .with_field("email", "john@acme.com")
                        .with_field("phone", "555-0100"),
                ],
                OnConflict::Replace,
            )
            .unwrap();
        Arc::new(store)
    }

    fn config() -> GoldenConfig {
        GoldenConfig::new("people", "golden")
            .with_policy(
                FusionPolicy::default()
                    .with_field_rule("street", FusionRule::LongestValue)
                    .with_field_rule("city", FusionRule::MostFrequent)
                    .with_field_rule("email", FusionRule::MostFrequent),
            )
            .with_store_results(false)
    }

    #[test]
    fn fuses_cluster_with_expected_field_values() {
        let store = seeded();
        let builder = GoldenRecordBuilder::new(store, config()).unwrap();
        let outcome = builder
            .build(
                &[cluster_of(&["people/1", "people/2", "people/3"], 0.82)],
                &CancelToken::new(),
            )
            .unwrap();

        assert_eq!(outcome.records.len(), 1);
        let golden = &outcome.records[0];
        assert_eq!(golden.fields["street"], Value::from("123 Main Street"));
        assert_eq!(golden.fields["city"], Value::from("NYC"));
        assert_eq!(golden.fields["email"], Value::from("john@acme.com"));
        // people/3 has the most populated fields, so it wins default rules.
        assert_eq!(
            golden.provenance["first_name"].source_member_id,
            "people/3"
        );
        assert!((golden.confidence_score - 0.82).abs() < 1e-12);
    }

    #[test]
    fn every_field_has_provenance_pointing_at_a_member() {
        let store = seeded();
        let builder = GoldenRecordBuilder::new(store, config()).unwrap();
        let outcome = builder
            .build(
                &[cluster_of(&["people/1", "people/2", "people/3"], 0.8)],
                &CancelToken::new(),
            )
            .unwrap();
        let golden = &outcome.records[0];
        assert_eq!(golden.fields.len(), golden.provenance.len());
        for (field, prov) in &golden.provenance {
            assert!(
                golden.member_ids.contains(&prov.source_member_id),
                "field {field} has provenance outside the cluster"
            );
        }
    }

    #[test]
    fn data_quality_reflects_populated_fraction() {
        let store = seeded();
        let builder = GoldenRecordBuilder::new(store, config()).unwrap();
        let outcome = builder
            .build(
                &[cluster_of(&["people/1", "people/2"], 0.8)],
                &CancelToken::new(),
            )
            .unwrap();
        // Universe: first_name, last_name, street, city, email - all fused.
        assert!((outcome.records[0].data_quality_score - 1.0).abs() < 1e-12);
    }

    #[test]
    fn missing_members_are_counted_and_empty_clusters_skipped() {
        let store = seeded();
        let builder = GoldenRecordBuilder::new(store, config()).unwrap();
        let outcome = builder
            .build(
                &[
                    cluster_of(&["people/1", "people/404"], 0.8),
                    cluster_of(&["people/404", "people/405"], 0.8),
                ],
                &CancelToken::new(),
            )
            .unwrap();
        // Ids are deduplicated across the batch, so people/404 counts once.
        assert_eq!(outcome.stats.missing_members, 2);
        assert_eq!(outcome.stats.clusters_skipped, 1);
        assert_eq!(outcome.records.len(), 1);
    }

    #[test]
    fn golden_ids_are_deterministic_per_cluster() {
        let store = seeded();
        let builder = GoldenRecordBuilder::new(store, config()).unwrap();
        let cluster = cluster_of(&["people/1", "people/2"], 0.8);
        let first = builder
            .build(std::slice::from_ref(&cluster), &CancelToken::new())
            .unwrap();
        let second = builder
            .build(std::slice::from_ref(&cluster), &CancelToken::new())
            .unwrap();
        assert_eq!(first.records[0].id, second.records[0].id);
    }

    #[test]
    fn persists_golden_documents_when_enabled() {
        let store = seeded();
        let builder = GoldenRecordBuilder::new(
            store.clone(),
            config().with_store_results(true),
        )
        .unwrap();
        let outcome = builder
            .build(
                &[cluster_of(&["people/1", "people/2"], 0.8)],
                &CancelToken::new(),
            )
            .unwrap();
        assert_eq!(outcome.stats.persisted, 1);
        assert_eq!(store.count("golden").unwrap(), 1);
    }

    #[test]
    fn member_mapping_covers_all_members() {
        let store = seeded();
        let builder = GoldenRecordBuilder::new(store, config()).unwrap();
        let outcome = builder
            .build(
                &[cluster_of(&["people/1", "people/2", "people/3"], 0.8)],
                &CancelToken::new(),
            )
            .unwrap();
        let mapping = member_mapping(&outcome.records);
        assert_eq!(mapping.len(), 3);
        assert!(mapping.values().all(|v| *v == outcome.records[0].id));
    }
}
