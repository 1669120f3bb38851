//! Record shape shared by every pipeline stage.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Metadata describing how a record's embedding vector was produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingMetadata {
    /// Name of the model that produced the vector.
    pub model_name: String,
    /// Vector dimensionality.
    pub dimension: usize,
    /// Optional serialization profile label (which fields, which separator).
    pub profile: Option<String>,
    /// When the vector was generated.
    pub generated_at: Option<DateTime<Utc>>,
}

/// An immutable source record: a stable id, its collection, and a map of
/// field values with an optional precomputed embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Stable, globally unique identifier.
    pub id: String,
    /// Name of the collection the record belongs to.
    pub collection: String,
    /// Field name to value mapping. Nested sub-maps are allowed.
    pub fields: BTreeMap<String, Value>,
    /// Optional dense embedding vector.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// Metadata for the embedding, when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_meta: Option<EmbeddingMetadata>,
}

impl Record {
    pub fn new(id: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            collection: collection.into(),
            fields: BTreeMap::new(),
            embedding: None,
            embedding_meta: None,
        }
    }

    /// Builder-style field assignment.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Resolve a dotted path such as `address.city`.
    pub fn field_path(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        let mut current = self.fields.get(first)?;
        for segment in segments {
            current = current.get(segment)?;
        }
        Some(current)
    }

    /// Trimmed scalar text of a (possibly dotted) field. `None` when the
    /// field is absent, null, blank, or composite.
    pub fn field_text(&self, path: &str) -> Option<String> {
        self.field_path(path).and_then(Value::scalar_text)
    }

    /// Number of populated top-level fields; the completeness signal used
    /// by golden-record fusion.
    pub fn populated_field_count(&self) -> usize {
        self.fields.values().filter(|v| v.is_populated()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Record {
        Record::new("people/1", "people")
            .with_field("first_name", "John")
            .with_field("last_name", "Smith")
            .with_field("age", 41i64)
            .with_field("notes", Value::Null)
            .with_field(
                "address",
                Value::Map(
                    [
                        ("street".to_string(), Value::from("123 Main St")),
                        ("city".to_string(), Value::from("NYC")),
                    ]
                    .into_iter()
                    .collect(),
                ),
            )
    }

    #[test]
    fn field_text_reads_scalars_and_paths() {
        let record = sample();
        assert_eq!(record.field_text("first_name").as_deref(), Some("John"));
        assert_eq!(record.field_text("age").as_deref(), Some("41"));
        assert_eq!(record.field_text("address.city").as_deref(), Some("NYC"));
        assert!(record.field_text("notes").is_none());
        assert!(record.field_text("missing").is_none());
    }

    #[test]
    fn populated_count_ignores_nulls() {
        let record = sample();
        // first_name, last_name, age, address - notes is null.
        assert_eq!(record.populated_field_count(), 4);
    }

    #[test]
    fn serde_roundtrip_preserves_embedding() {
        let record = sample().with_embedding(vec![0.1, 0.2, 0.3]);
        let json = serde_json::to_string(&record).unwrap();
        let back: Record = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
