//! Entlink Record Store Adapter
//!
//! This is where the pipeline meets the outside world. Every other layer
//! reads and writes records exclusively through the [`DocumentStore`] trait
//! defined here, so the concrete store (a graph-capable document database,
//! a relational mirror, or the bundled [`InMemoryStore`]) stays swappable.
//!
//! ## What we provide
//!
//! - **A typed document model** - [`Value`], [`Record`], and
//!   [`EmbeddingMetadata`] replace untyped dictionaries with a tagged
//!   variant plus typed accessors.
//! - **Batch-first operations** - [`DocumentStore::get_many`] returns every
//!   matching record in one round trip and reports missing ids separately.
//!   There is deliberately no single-document fetch on the trait; per-item
//!   loops belong to nobody.
//! - **Auxiliary indexes** - BM25-scorable text search and cosine vector
//!   search behind `create_text_index` / `create_vector_index`, with
//!   idempotent creation.
//! - **Typed failures** - [`StoreError`] carries a kind
//!   (`connection | not_found | conflict | invalid_request | internal`)
//!   and a `retryable` flag consumed by [`with_retry`].
//!
//! ## Example
//!
//! ```
//! use store::{DocumentStore, InMemoryStore, OnConflict, Record, ScanFilter};
//!
//! let store = InMemoryStore::new();
//! store.create_collection("people").unwrap();
//! store
//!     .insert_many(
//!         "people",
//!         vec![Record::new("people/1", "people").with_field("name", "Ada")],
//!         OnConflict::Replace,
//!     )
//!     .unwrap();
//!
//! let batch = store
//!     .get_many("people", &["people/1".into(), "people/2".into()])
//!     .unwrap();
//! assert_eq!(batch.found.len(), 1);
//! assert_eq!(batch.missing, vec!["people/2".to_string()]);
//! ```

mod cancel;
mod error;
mod memory;
mod record;
mod value;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub use crate::cancel::CancelToken;
pub use crate::error::{with_retry, StoreError, StoreErrorKind};
pub use crate::memory::{InMemoryStore, OpCounts};
pub use crate::record::{EmbeddingMetadata, Record};
pub use crate::value::Value;

/// Default number of retry attempts for retryable store failures.
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;

/// Result of a batch fetch: found records keyed by id plus the ids that
/// did not resolve. `found.keys() + missing` always equals the input ids.
#[derive(Debug, Clone, Default)]
pub struct BatchFetch {
    pub found: HashMap<String, Record>,
    pub missing: Vec<String>,
}

/// Conflict handling for bulk inserts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OnConflict {
    /// Overwrite the existing document under the same key.
    #[default]
    Replace,
    /// Keep the existing document and count the incoming one as ignored.
    Ignore,
}

/// Outcome counters for a bulk insert or import.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsertOutcome {
    pub inserted: usize,
    pub replaced: usize,
    pub ignored: usize,
}

impl InsertOutcome {
    pub fn merge(&mut self, other: InsertOutcome) {
        self.inserted += other.inserted;
        self.replaced += other.replaced;
        self.ignored += other.ignored;
    }
}

/// Equality filter applied during a paged scan.
#[derive(Debug, Clone, Default)]
pub struct ScanFilter {
    /// Field path / expected value pairs that must all match.
    pub equals: Vec<(String, Value)>,
    /// When set, restrict to records that do (or do not) carry an embedding.
    pub has_embedding: Option<bool>,
}

impl ScanFilter {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_equals(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.equals.push((field.into(), value.into()));
        self
    }

    pub fn with_embedding(mut self, required: bool) -> Self {
        self.has_embedding = Some(required);
        self
    }

    pub fn matches(&self, record: &Record) -> bool {
        if let Some(required) = self.has_embedding {
            if record.embedding.is_some() != required {
                return false;
            }
        }
        self.equals.iter().all(|(field, expected)| {
            record
                .field_path(field)
                .map(|actual| actual == expected)
                .unwrap_or(false)
        })
    }
}

/// Analyzer applied by a text index when tokenizing field values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TextAnalyzer {
    /// Lowercased word tokens.
    #[default]
    Text,
    /// The raw field value as a single token.
    Identity,
}

/// Distance metric for vector indexes. Only cosine is specified today.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VectorMetric {
    #[default]
    Cosine,
}

/// A ranked search hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: String,
    pub score: f64,
}

/// Abstract operations the pipeline needs from a record store.
///
/// Implementations must make `create_*` idempotent (recreating an existing
/// collection or index is a no-op) and must serve `get_many` in one logical
/// round trip regardless of the number of ids.
pub trait DocumentStore: Send + Sync {
    /// Create a document collection if it does not already exist.
    fn create_collection(&self, name: &str) -> Result<(), StoreError>;

    /// Create an edge collection (documents with `_from`/`_to` endpoints).
    fn create_edge_collection(&self, name: &str) -> Result<(), StoreError>;

    fn has_collection(&self, name: &str) -> Result<bool, StoreError>;

    fn count(&self, collection: &str) -> Result<usize, StoreError>;

    /// Fetch all records whose ids appear in `ids`, in one round trip.
    /// Unknown ids are reported in [`BatchFetch::missing`].
    fn get_many(&self, collection: &str, ids: &[String]) -> Result<BatchFetch, StoreError>;

    /// Paged scan of a collection. `visitor` is called once per matching
    /// record; returning an error aborts the scan.
    fn scan(
        &self,
        collection: &str,
        filter: &ScanFilter,
        batch_size: usize,
        visitor: &mut dyn FnMut(Record) -> Result<(), StoreError>,
    ) -> Result<(), StoreError>;

    /// Insert documents in store-friendly chunks chosen by the adapter.
    fn insert_many(
        &self,
        collection: &str,
        records: Vec<Record>,
        on_conflict: OnConflict,
    ) -> Result<InsertOutcome, StoreError>;

    /// Create (idempotently) a BM25-scorable text index over `fields`.
    fn create_text_index(
        &self,
        collection: &str,
        index: &str,
        fields: &[String],
        analyzer: TextAnalyzer,
    ) -> Result<(), StoreError>;

    /// Create (idempotently) a vector index over record embeddings.
    fn create_vector_index(
        &self,
        collection: &str,
        index: &str,
        metric: VectorMetric,
    ) -> Result<(), StoreError>;

    /// BM25-ranked text search against a text index.
    fn text_search(
        &self,
        collection: &str,
        index: &str,
        query: &str,
        limit: usize,
        min_score: f64,
    ) -> Result<Vec<SearchHit>, StoreError>;

    /// Approximate nearest neighbours above a cosine floor.
    fn vector_search(
        &self,
        collection: &str,
        index: &str,
        vector: &[f32],
        limit: usize,
        min_cosine: f64,
    ) -> Result<Vec<SearchHit>, StoreError>;

    /// Fast-path bulk load from newline-delimited JSON records.
    fn bulk_import(
        &self,
        collection: &str,
        ndjson: &str,
        on_conflict: OnConflict,
    ) -> Result<InsertOutcome, StoreError>;
}
