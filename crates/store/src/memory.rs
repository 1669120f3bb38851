//! In-memory reference implementation of [`DocumentStore`].
//!
//! Backs the test suite and small local runs. Auxiliary text/vector
//! indexes are maintained incrementally on insert, the same way a real
//! store keeps its search views current. Every trait call bumps an
//! operation counter so tests can assert round-trip budgets.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use hashbrown::HashMap as FastMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StoreError;
use crate::record::Record;
use crate::{
    BatchFetch, DocumentStore, InsertOutcome, OnConflict, ScanFilter, SearchHit, TextAnalyzer,
    VectorMetric,
};

const BM25_K1: f64 = 1.2;
const BM25_B: f64 = 0.75;
const INSERT_CHUNK: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CollectionKind {
    Document,
    Edge,
}

struct TextIndex {
    fields: Vec<String>,
    analyzer: TextAnalyzer,
    /// term -> (record id -> term frequency)
    postings: FastMap<String, FastMap<String, u32>>,
    /// record id -> token count across indexed fields
    doc_len: FastMap<String, u32>,
}

impl TextIndex {
    fn new(fields: Vec<String>, analyzer: TextAnalyzer) -> Self {
        Self {
            fields,
            analyzer,
            postings: FastMap::new(),
            doc_len: FastMap::new(),
        }
    }

    fn tokenize(analyzer: TextAnalyzer, text: &str) -> Vec<String> {
        match analyzer {
            TextAnalyzer::Text => text
                .to_lowercase()
                .split(|c: char| !c.is_alphanumeric())
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect(),
            TextAnalyzer::Identity => {
                let trimmed = text.trim().to_lowercase();
                if trimmed.is_empty() {
                    Vec::new()
                } else {
                    vec![trimmed]
                }
            }
        }
    }

    fn record_tokens(&self, record: &Record) -> Vec<String> {
        let mut tokens = Vec::new();
        for field in &self.fields {
            if let Some(text) = record.field_text(field) {
                tokens.extend(Self::tokenize(self.analyzer, &text));
            }
        }
        tokens
    }

    fn add(&mut self, record: &Record) {
        let tokens = self.record_tokens(record);
        if tokens.is_empty() {
            return;
        }
        self.doc_len.insert(record.id.clone(), tokens.len() as u32);
        for token in tokens {
            *self
                .postings
                .entry(token)
                .or_default()
                .entry(record.id.clone())
                .or_insert(0) += 1;
        }
    }

    fn remove(&mut self, id: &str) {
        if self.doc_len.remove(id).is_none() {
            return;
        }
        self.postings.retain(|_, docs| {
            docs.remove(id);
            !docs.is_empty()
        });
    }

    fn search(&self, query: &str, limit: usize, min_score: f64) -> Vec<SearchHit> {
        let terms = Self::tokenize(self.analyzer, query);
        let total_docs = self.doc_len.len();
        if terms.is_empty() || total_docs == 0 {
            return Vec::new();
        }
        let avg_len = self.doc_len.values().map(|&l| l as f64).sum::<f64>() / total_docs as f64;

        let mut scores: FastMap<&str, f64> = FastMap::new();
        for term in &terms {
            let Some(docs) = self.postings.get(term) else {
                continue;
            };
            let df = docs.len() as f64;
            let idf = (((total_docs as f64 - df + 0.5) / (df + 0.5)) + 1.0).ln();
            for (id, &tf) in docs {
                let tf = tf as f64;
                let dl = f64::from(*self.doc_len.get(id).unwrap_or(&0));
                let norm = tf + BM25_K1 * (1.0 - BM25_B + BM25_B * dl / avg_len);
                *scores.entry(id.as_str()).or_insert(0.0) += idf * (tf * (BM25_K1 + 1.0)) / norm;
            }
        }

        let mut hits: Vec<SearchHit> = scores
            .into_iter()
            .filter(|(_, score)| *score >= min_score)
            .map(|(id, score)| SearchHit {
                id: id.to_string(),
                score,
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(limit);
        hits
    }
}

struct VectorIndex {
    metric: VectorMetric,
    /// record id -> L2-normalized vector
    vectors: FastMap<String, Vec<f32>>,
}

impl VectorIndex {
    fn new(metric: VectorMetric) -> Self {
        Self {
            metric,
            vectors: FastMap::new(),
        }
    }

    fn add(&mut self, record: &Record) {
        if let Some(embedding) = &record.embedding {
            self.vectors
                .insert(record.id.clone(), normalize(embedding));
        }
    }

    fn remove(&mut self, id: &str) {
        self.vectors.remove(id);
    }

    fn search(&self, vector: &[f32], limit: usize, min_cosine: f64) -> Vec<SearchHit> {
        let VectorMetric::Cosine = self.metric;
        let query = normalize(vector);
        let mut hits: Vec<SearchHit> = self
            .vectors
            .iter()
            .filter(|(_, stored)| stored.len() == query.len())
            .map(|(id, stored)| SearchHit {
                id: id.clone(),
                score: dot(&query, stored),
            })
            .filter(|hit| hit.score >= min_cosine)
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(limit);
        hits
    }
}

fn normalize(vector: &[f32]) -> Vec<f32> {
    let norm = vector.iter().map(|v| f64::from(*v) * f64::from(*v)).sum::<f64>().sqrt();
    if norm <= f64::EPSILON {
        return vector.to_vec();
    }
    vector.iter().map(|v| (f64::from(*v) / norm) as f32).collect()
}

fn dot(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| f64::from(*x) * f64::from(*y))
        .sum()
}

struct Collection {
    kind: CollectionKind,
    records: BTreeMap<String, Record>,
    text_indexes: BTreeMap<String, TextIndex>,
    vector_indexes: BTreeMap<String, VectorIndex>,
}

impl Collection {
    fn new(kind: CollectionKind) -> Self {
        Self {
            kind,
            records: BTreeMap::new(),
            text_indexes: BTreeMap::new(),
            vector_indexes: BTreeMap::new(),
        }
    }

    fn insert(&mut self, record: Record, on_conflict: OnConflict) -> Result<InsertOutcome, StoreError> {
        if self.kind == CollectionKind::Edge {
            for endpoint in ["_from", "_to"] {
                if record.field_text(endpoint).is_none() {
                    return Err(StoreError::invalid_request(format!(
                        "edge document {} is missing {endpoint}",
                        record.id
                    )));
                }
            }
        }

        let mut outcome = InsertOutcome::default();
        let existed = self.records.contains_key(&record.id);
        if existed && on_conflict == OnConflict::Ignore {
            outcome.ignored = 1;
            return Ok(outcome);
        }
        if existed {
            for index in self.text_indexes.values_mut() {
                index.remove(&record.id);
            }
            for index in self.vector_indexes.values_mut() {
                index.remove(&record.id);
            }
            outcome.replaced = 1;
        } else {
            outcome.inserted = 1;
        }
        for index in self.text_indexes.values_mut() {
            index.add(&record);
        }
        for index in self.vector_indexes.values_mut() {
            index.add(&record);
        }
        self.records.insert(record.id.clone(), record);
        Ok(outcome)
    }
}

/// Snapshot of per-operation call counters. `get_many` and `scan` are the
/// interesting ones for round-trip budget assertions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpCounts {
    pub get_many: u64,
    pub scan: u64,
    pub insert_many: u64,
    pub text_search: u64,
    pub vector_search: u64,
    pub bulk_import: u64,
}

#[derive(Default)]
struct OpCounters {
    get_many: AtomicU64,
    scan: AtomicU64,
    insert_many: AtomicU64,
    text_search: AtomicU64,
    vector_search: AtomicU64,
    bulk_import: AtomicU64,
}

impl OpCounters {
    fn snapshot(&self) -> OpCounts {
        OpCounts {
            get_many: self.get_many.load(Ordering::Relaxed),
            scan: self.scan.load(Ordering::Relaxed),
            insert_many: self.insert_many.load(Ordering::Relaxed),
            text_search: self.text_search.load(Ordering::Relaxed),
            vector_search: self.vector_search.load(Ordering::Relaxed),
            bulk_import: self.bulk_import.load(Ordering::Relaxed),
        }
    }
}

/// In-memory document store with incremental search indexes.
pub struct InMemoryStore {
    collections: RwLock<FastMap<String, Collection>>,
    ops: OpCounters,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            collections: RwLock::new(FastMap::new()),
            ops: OpCounters::default(),
        }
    }

    /// Per-operation call counts accumulated since construction (or the
    /// last [`InMemoryStore::reset_op_counts`]).
    pub fn op_counts(&self) -> OpCounts {
        self.ops.snapshot()
    }

    pub fn reset_op_counts(&self) {
        self.ops.get_many.store(0, Ordering::Relaxed);
        self.ops.scan.store(0, Ordering::Relaxed);
        self.ops.insert_many.store(0, Ordering::Relaxed);
        self.ops.text_search.store(0, Ordering::Relaxed);
        self.ops.vector_search.store(0, Ordering::Relaxed);
        self.ops.bulk_import.store(0, Ordering::Relaxed);
    }

    fn create(&self, name: &str, kind: CollectionKind) -> Result<(), StoreError> {
        let mut guard = self
            .collections
            .write()
            .map_err(|_| StoreError::internal("poisoned lock"))?;
        match guard.get(name) {
            Some(existing) if existing.kind != kind => Err(StoreError::conflict(format!(
                "collection {name} already exists with a different kind"
            ))),
            Some(_) => {
                debug!(collection = name, "collection already exists");
                Ok(())
            }
            None => {
                guard.insert(name.to_string(), Collection::new(kind));
                Ok(())
            }
        }
    }

    fn with_collection<T>(
        &self,
        name: &str,
        f: impl FnOnce(&Collection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let guard = self
            .collections
            .read()
            .map_err(|_| StoreError::internal("poisoned lock"))?;
        let collection = guard
            .get(name)
            .ok_or_else(|| StoreError::not_found(format!("collection {name} does not exist")))?;
        f(collection)
    }

    fn with_collection_mut<T>(
        &self,
        name: &str,
        f: impl FnOnce(&mut Collection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut guard = self
            .collections
            .write()
            .map_err(|_| StoreError::internal("poisoned lock"))?;
        let collection = guard
            .get_mut(name)
            .ok_or_else(|| StoreError::not_found(format!("collection {name} does not exist")))?;
        f(collection)
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentStore for InMemoryStore {
    fn create_collection(&self, name: &str) -> Result<(), StoreError> {
        self.create(name, CollectionKind::Document)
    }

    fn create_edge_collection(&self, name: &str) -> Result<(), StoreError> {
        self.create(name, CollectionKind::Edge)
    }

    fn has_collection(&self, name: &str) -> Result<bool, StoreError> {
        let guard = self
            .collections
            .read()
            .map_err(|_| StoreError::internal("poisoned lock"))?;
        Ok(guard.contains_key(name))
    }

    fn count(&self, collection: &str) -> Result<usize, StoreError> {
        self.with_collection(collection, |c| Ok(c.records.len()))
    }

    fn get_many(&self, collection: &str, ids: &[String]) -> Result<BatchFetch, StoreError> {
        self.ops.get_many.fetch_add(1, Ordering::Relaxed);
        self.with_collection(collection, |c| {
            let mut batch = BatchFetch::default();
            for id in ids {
                match c.records.get(id) {
                    Some(record) => {
                        batch.found.insert(id.clone(), record.clone());
                    }
                    None => batch.missing.push(id.clone()),
                }
            }
            Ok(batch)
        })
    }

    fn scan(
        &self,
        collection: &str,
        filter: &ScanFilter,
        batch_size: usize,
        visitor: &mut dyn FnMut(Record) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        if batch_size == 0 {
            return Err(StoreError::invalid_request("scan batch_size must be > 0"));
        }
        self.ops.scan.fetch_add(1, Ordering::Relaxed);
        // Clone the matching page up front so the visitor never runs under
        // the collection lock.
        let matching: Vec<Record> = self.with_collection(collection, |c| {
            Ok(c.records
                .values()
                .filter(|r| filter.matches(r))
                .cloned()
                .collect())
        })?;
        for page in matching.chunks(batch_size) {
            for record in page {
                visitor(record.clone())?;
            }
        }
        Ok(())
    }

    fn insert_many(
        &self,
        collection: &str,
        records: Vec<Record>,
        on_conflict: OnConflict,
    ) -> Result<InsertOutcome, StoreError> {
        self.ops.insert_many.fetch_add(1, Ordering::Relaxed);
        let mut total = InsertOutcome::default();
        for chunk in records.chunks(INSERT_CHUNK) {
            self.with_collection_mut(collection, |c| {
                for record in chunk {
                    total.merge(c.insert(record.clone(), on_conflict)?);
                }
                Ok(())
            })?;
        }
        Ok(total)
    }

    fn create_text_index(
        &self,
        collection: &str,
        index: &str,
        fields: &[String],
        analyzer: TextAnalyzer,
    ) -> Result<(), StoreError> {
        self.with_collection_mut(collection, |c| {
            if c.text_indexes.contains_key(index) {
                debug!(collection, index, "text index already exists");
                return Ok(());
            }
            let mut text_index = TextIndex::new(fields.to_vec(), analyzer);
            for record in c.records.values() {
                text_index.add(record);
            }
            c.text_indexes.insert(index.to_string(), text_index);
            Ok(())
        })
    }

    fn create_vector_index(
        &self,
        collection: &str,
        index: &str,
        metric: VectorMetric,
    ) -> Result<(), StoreError> {
        self.with_collection_mut(collection, |c| {
            if c.vector_indexes.contains_key(index) {
                debug!(collection, index, "vector index already exists");
                return Ok(());
            }
            let mut vector_index = VectorIndex::new(metric);
            for record in c.records.values() {
                vector_index.add(record);
            }
            c.vector_indexes.insert(index.to_string(), vector_index);
            Ok(())
        })
    }

    fn text_search(
        &self,
        collection: &str,
        index: &str,
        query: &str,
        limit: usize,
        min_score: f64,
    ) -> Result<Vec<SearchHit>, StoreError> {
        self.ops.text_search.fetch_add(1, Ordering::Relaxed);
        self.with_collection(collection, |c| {
            let text_index = c.text_indexes.get(index).ok_or_else(|| {
                StoreError::not_found(format!("text index {index} on {collection}"))
            })?;
            Ok(text_index.search(query, limit, min_score))
        })
    }

    fn vector_search(
        &self,
        collection: &str,
        index: &str,
        vector: &[f32],
        limit: usize,
        min_cosine: f64,
    ) -> Result<Vec<SearchHit>, StoreError> {
        self.ops.vector_search.fetch_add(1, Ordering::Relaxed);
        self.with_collection(collection, |c| {
            let vector_index = c.vector_indexes.get(index).ok_or_else(|| {
                StoreError::not_found(format!("vector index {index} on {collection}"))
            })?;
            Ok(vector_index.search(vector, limit, min_cosine))
        })
    }

    fn bulk_import(
        &self,
        collection: &str,
        ndjson: &str,
        on_conflict: OnConflict,
    ) -> Result<InsertOutcome, StoreError> {
        self.ops.bulk_import.fetch_add(1, Ordering::Relaxed);
        let mut records = Vec::new();
        for (line_no, line) in ndjson.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let record: Record = serde_json::from_str(line).map_err(|e| {
                StoreError::invalid_request(format!("bulk import line {}: {e}", line_no + 1))
            })?;
            records.push(record);
        }
        let mut total = InsertOutcome::default();
        for chunk in records.chunks(INSERT_CHUNK) {
            self.with_collection_mut(collection, |c| {
                for record in chunk {
                    total.merge(c.insert(record.clone(), on_conflict)?);
                }
                Ok(())
            })?;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreErrorKind;

    fn person(id: &str, first: &str, last: &str, email: &str) -> Record {
        Record::new(id, "people")
            .with_field("first_name", first)
            .with_field("last_name", last)
            .with_field("email", email)
    }

    fn seeded_store() -> InMemoryStore {
        let store = InMemoryStore::new();
        store.create_collection("people").unwrap();
        store
            .insert_many(
                "people",
                vec![
                    person("people/1", "John", "Smith", "john@acme.com"),
                    person("people/2", "Jane", "Doe", "jane@acme.com"),
                    person("people/3", "Jon", "Smyth", "jon@other.com"),
                ],
                OnConflict::Replace,
            )
            .unwrap();
        store
    }

    #[test]
    fn get_many_partitions_found_and_missing() {
        let store = seeded_store();
        let ids = vec![
            "people/1".to_string(),
            "people/9".to_string(),
            "people/2".to_string(),
        ];
        let batch = store.get_many("people", &ids).unwrap();
        assert_eq!(batch.found.len(), 2);
        assert_eq!(batch.missing, vec!["people/9".to_string()]);
        assert_eq!(batch.found.len() + batch.missing.len(), ids.len());
    }

    #[test]
    fn create_collection_is_idempotent_but_kind_conflicts() {
        let store = InMemoryStore::new();
        store.create_collection("c").unwrap();
        store.create_collection("c").unwrap();
        let err = store.create_edge_collection("c").unwrap_err();
        assert_eq!(err.kind, StoreErrorKind::Conflict);
    }

    #[test]
    fn insert_ignore_keeps_existing_document() {
        let store = seeded_store();
        let outcome = store
            .insert_many(
                "people",
                vec![person("people/1", "Changed", "Name", "x@y.com")],
                OnConflict::Ignore,
            )
            .unwrap();
        assert_eq!(outcome.ignored, 1);
        let batch = store
            .get_many("people", &["people/1".to_string()])
            .unwrap();
        assert_eq!(
            batch.found["people/1"].field_text("first_name").as_deref(),
            Some("John")
        );
    }

    #[test]
    fn edge_collection_rejects_documents_without_endpoints() {
        let store = InMemoryStore::new();
        store.create_edge_collection("edges").unwrap();
        let err = store
            .insert_many(
                "edges",
                vec![Record::new("edges/1", "edges").with_field("weight", 0.9)],
                OnConflict::Replace,
            )
            .unwrap_err();
        assert_eq!(err.kind, StoreErrorKind::InvalidRequest);
    }

    #[test]
    fn scan_applies_filters() {
        let store = seeded_store();
        let mut seen = Vec::new();
        store
            .scan(
                "people",
                &ScanFilter::none().with_equals("last_name", "Smith"),
                10,
                &mut |record| {
                    seen.push(record.id);
                    Ok(())
                },
            )
            .unwrap();
        assert_eq!(seen, vec!["people/1".to_string()]);
    }

    #[test]
    fn text_search_ranks_matching_records() {
        let store = seeded_store();
        store
            .create_text_index(
                "people",
                "people_text",
                &["first_name".to_string(), "last_name".to_string()],
                TextAnalyzer::Text,
            )
            .unwrap();
        let hits = store
            .text_search("people", "people_text", "john smith", 10, 0.0)
            .unwrap();
        assert!(!hits.is_empty());
        assert_eq!(hits[0].id, "people/1");
    }

    #[test]
    fn text_search_missing_index_is_not_found() {
        let store = seeded_store();
        let err = store
            .text_search("people", "nope", "john", 10, 0.0)
            .unwrap_err();
        assert_eq!(err.kind, StoreErrorKind::NotFound);
    }

    #[test]
    fn text_index_stays_current_after_replace() {
        let store = seeded_store();
        store
            .create_text_index(
                "people",
                "people_text",
                &["last_name".to_string()],
                TextAnalyzer::Text,
            )
            .unwrap();
        store
            .insert_many(
                "people",
                vec![person("people/1", "John", "Renamed", "john@acme.com")],
                OnConflict::Replace,
            )
            .unwrap();
        let smith_hits = store
            .text_search("people", "people_text", "smith", 10, 0.0)
            .unwrap();
        assert!(smith_hits.iter().all(|h| h.id != "people/1"));
        let renamed_hits = store
            .text_search("people", "people_text", "renamed", 10, 0.0)
            .unwrap();
        assert_eq!(renamed_hits[0].id, "people/1");
    }

    #[test]
    fn vector_search_orders_by_cosine() {
        let store = InMemoryStore::new();
        store.create_collection("docs").unwrap();
        store
            .insert_many(
                "docs",
                vec![
                    Record::new("docs/a", "docs").with_embedding(vec![1.0, 0.0]),
                    Record::new("docs/b", "docs").with_embedding(vec![0.7, 0.7]),
                    Record::new("docs/c", "docs").with_embedding(vec![0.0, 1.0]),
                ],
                OnConflict::Replace,
            )
            .unwrap();
        store
            .create_vector_index("docs", "docs_vec", VectorMetric::Cosine)
            .unwrap();
        let hits = store
            .vector_search("docs", "docs_vec", &[1.0, 0.1], 2, 0.5)
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "docs/a");
        assert_eq!(hits[1].id, "docs/b");
    }

    #[test]
    fn bulk_import_parses_ndjson() {
        let store = InMemoryStore::new();
        store.create_collection("people").unwrap();
        let ndjson = concat!(
            "{\"id\":\"people/10\",\"collection\":\"people\",\"fields\":{\"name\":\"A\"}}\n",
            "\n",
            "{\"id\":\"people/11\",\"collection\":\"people\",\"fields\":{\"name\":\"B\"}}\n",
        );
        let outcome = store
            .bulk_import("people", ndjson, OnConflict::Replace)
            .unwrap();
        assert_eq!(outcome.inserted, 2);
        assert_eq!(store.count("people").unwrap(), 2);
    }

    #[test]
    fn bulk_import_reports_bad_lines() {
        let store = InMemoryStore::new();
        store.create_collection("people").unwrap();
        let err = store
            .bulk_import("people", "not json", OnConflict::Replace)
            .unwrap_err();
        assert_eq!(err.kind, StoreErrorKind::InvalidRequest);
        assert!(err.message.contains("line 1"));
    }

    #[test]
    fn op_counts_track_round_trips() {
        let store = seeded_store();
        store.reset_op_counts();
        store
            .get_many("people", &["people/1".to_string()])
            .unwrap();
        store
            .get_many("people", &["people/2".to_string()])
            .unwrap();
        store
            .scan("people", &ScanFilter::none(), 100, &mut |_| Ok(()))
            .unwrap();
        let counts = store.op_counts();
        assert_eq!(counts.get_many, 2);
        assert_eq!(counts.scan, 1);
    }
}
