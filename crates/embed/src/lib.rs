//! Entlink Embedding Collaborator
//!
//! The pipeline treats embedding models as external collaborators; this
//! crate owns the deterministic glue around them:
//!
//! - [`RecordSerializer`] renders a record to text in a fixed field order
//!   with a fixed separator, so the same record and config always produce
//!   the same string (and therefore the same vector from any model).
//! - [`EmbeddingProvider`] is the model interface. [`HashEmbedder`] is a
//!   deterministic hash-based stand-in for tests and offline runs.
//! - [`EmbeddingCache`] fills in missing or stale embeddings for a whole
//!   collection, writing vectors and their metadata back through the
//!   store in batches.

use std::sync::Arc;

use chrono::Utc;
use fxhash::hash64;
use serde::{Deserialize, Serialize};
use store::{
    DocumentStore, EmbeddingMetadata, OnConflict, Record, ScanFilter, StoreError,
};
use thiserror::Error;
use tracing::info;

/// Errors raised by serialization or embedding.
#[derive(Debug, Clone, Error, PartialEq)]
#[non_exhaustive]
pub enum EmbedError {
    #[error("store error during embedding: {0}")]
    Store(#[from] StoreError),
    #[error("invalid serializer config: {0}")]
    InvalidConfig(String),
    #[error("embedding provider failed: {0}")]
    Provider(String),
}

/// Deterministic record->text serialization config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializerConfig {
    /// Fields rendered, in order.
    pub field_order: Vec<String>,
    /// Separator between fields.
    #[serde(default = "SerializerConfig::default_separator")]
    pub separator: String,
    /// Render missing fields as empty segments instead of skipping them.
    #[serde(default)]
    pub include_missing: bool,
}

impl SerializerConfig {
    fn default_separator() -> String {
        " | ".to_string()
    }

    pub fn new(field_order: Vec<String>) -> Self {
        Self {
            field_order,
            separator: Self::default_separator(),
            include_missing: false,
        }
    }

    pub fn with_separator(mut self, separator: impl Into<String>) -> Self {
        self.separator = separator.into();
        self
    }

    pub fn with_include_missing(mut self, include_missing: bool) -> Self {
        self.include_missing = include_missing;
        self
    }

    pub fn validate(&self) -> Result<(), EmbedError> {
        if self.field_order.is_empty() {
            return Err(EmbedError::InvalidConfig(
                "field_order must not be empty".into(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for field in &self.field_order {
            if !seen.insert(field) {
                return Err(EmbedError::InvalidConfig(format!(
                    "field_order contains duplicate field {field}"
                )));
            }
        }
        Ok(())
    }

    /// Short label describing this serialization profile, stored in
    /// embedding metadata so stale vectors can be detected.
    pub fn profile(&self) -> String {
        format!("{}[{}]", self.separator, self.field_order.join(","))
    }
}

/// Deterministic record->text serializer.
pub struct RecordSerializer {
    cfg: SerializerConfig,
}

impl RecordSerializer {
    pub fn new(cfg: SerializerConfig) -> Result<Self, EmbedError> {
        cfg.validate()?;
        Ok(Self { cfg })
    }

    pub fn config(&self) -> &SerializerConfig {
        &self.cfg
    }

    /// Render the record. Missing fields collapse to empty (and are
    /// skipped entirely unless `include_missing` is set).
    pub fn serialize(&self, record: &Record) -> String {
        let mut segments = Vec::with_capacity(self.cfg.field_order.len());
        for field in &self.cfg.field_order {
            match record.field_text(field) {
                Some(text) => segments.push(text),
                None if self.cfg.include_missing => segments.push(String::new()),
                None => {}
            }
        }
        segments.join(&self.cfg.separator)
    }
}

/// An embedding model. Implementations must be deterministic: the same
/// text yields the same vector.
pub trait EmbeddingProvider: Send + Sync {
    fn model_name(&self) -> &str;
    fn dimension(&self) -> usize;
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError>;

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        texts.iter().map(|t| self.embed(t)).collect()
    }
}

/// Deterministic hash-based embedder. Generates sinusoid values derived
/// from a hash of the input text: reproducible vectors at zero model cost.
pub struct HashEmbedder {
    model_name: String,
    dimension: usize,
    normalize: bool,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            model_name: "hash-stub".to_string(),
            dimension,
            normalize: true,
        }
    }

    pub fn with_normalize(mut self, normalize: bool) -> Self {
        self.normalize = normalize;
        self
    }
}

impl EmbeddingProvider for HashEmbedder {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let h = hash64(text.as_bytes());
        let mut v = vec![0f32; self.dimension];
        for (idx, value) in v.iter_mut().enumerate() {
            let rotated = h.rotate_left((idx % 64) as u32);
            *value = ((rotated as f32) * 1.0e-4).sin();
        }
        if self.normalize {
            l2_normalize_in_place(&mut v);
        }
        Ok(v)
    }
}

/// Normalize a vector to unit L2 length in place. Zero vectors pass
/// through untouched.
pub fn l2_normalize_in_place(v: &mut [f32]) {
    let norm = v.iter().map(|x| f64::from(*x).powi(2)).sum::<f64>().sqrt();
    if norm <= f64::EPSILON {
        return;
    }
    for value in v.iter_mut() {
        *value = (f64::from(*value) / norm) as f32;
    }
}

/// Counters from one cache fill.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbedStats {
    pub records_scanned: usize,
    pub reused: usize,
    pub generated: usize,
    pub failed: usize,
}

/// Fills missing or stale embeddings for a collection.
pub struct EmbeddingCache {
    serializer: RecordSerializer,
    provider: Arc<dyn EmbeddingProvider>,
}

impl EmbeddingCache {
    pub fn new(serializer: RecordSerializer, provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            serializer,
            provider,
        }
    }

    /// Embed every record in `collection` that has no vector yet, or
    /// whose vector was produced by a different model/profile. Updated
    /// records are written back in batches of `write_batch`.
    pub fn ensure_embeddings(
        &self,
        store: &dyn DocumentStore,
        collection: &str,
        write_batch: usize,
    ) -> Result<EmbedStats, EmbedError> {
        let write_batch = write_batch.max(1);
        let mut stats = EmbedStats::default();
        let profile = self.serializer.config().profile();
        let mut pending: Vec<Record> = Vec::new();

        store.scan(collection, &ScanFilter::none(), 1000, &mut |record| {
            stats.records_scanned += 1;
            let fresh = record.embedding.is_some()
                && record.embedding_meta.as_ref().is_some_and(|meta| {
                    meta.model_name == self.provider.model_name()
                        && meta.dimension == self.provider.dimension()
                        && meta.profile.as_deref() == Some(profile.as_str())
                });
            if fresh {
                stats.reused += 1;
            } else {
                pending.push(record);
            }
            Ok(())
        })?;

        for chunk in pending.chunks(write_batch) {
            let mut updated = Vec::with_capacity(chunk.len());
            for record in chunk {
                let text = self.serializer.serialize(record);
                match self.provider.embed(&text) {
                    Ok(vector) => {
                        let mut record = record.clone();
                        record.embedding = Some(vector);
                        record.embedding_meta = Some(EmbeddingMetadata {
                            model_name: self.provider.model_name().to_string(),
                            dimension: self.provider.dimension(),
                            profile: Some(profile.clone()),
                            generated_at: Some(Utc::now()),
                        });
                        updated.push(record);
                    }
                    Err(_) => stats.failed += 1,
                }
            }
            stats.generated += updated.len();
            if !updated.is_empty() {
                store.insert_many(collection, updated, OnConflict::Replace)?;
            }
        }

        info!(
            collection,
            generated = stats.generated,
            reused = stats.reused,
            failed = stats.failed,
            "embedding cache fill finished"
        );
        Ok(stats)
    }
}
