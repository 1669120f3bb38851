//! Composite-key blocking.
//!
//! Groups records by a deterministic key built from one or more field
//! projections and emits all intra-group pairs. Exact-field and phonetic
//! blocking are thin constructors over the same machinery.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use similarity::soundex;
use store::{DocumentStore, Record, ScanFilter};
use tracing::warn;

use crate::{
    BlockingError, BlockingStrategy, CandidatePair, StrategyOutput, StrategyStats,
    DEFAULT_MAX_BLOCK_SIZE, SCAN_BATCH,
};

/// Projection applied to a field value when building a block key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyTransform {
    /// The trimmed value as-is.
    Identity,
    /// Lowercased value.
    Lowercase,
    /// First `n` characters, lowercased.
    Prefix(usize),
    /// Soundex code of the value.
    Soundex,
}

impl KeyTransform {
    fn apply(&self, value: &str) -> Option<String> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return None;
        }
        match self {
            KeyTransform::Identity => Some(trimmed.to_string()),
            KeyTransform::Lowercase => Some(trimmed.to_lowercase()),
            KeyTransform::Prefix(n) => {
                let n = (*n).max(1);
                Some(trimmed.to_lowercase().chars().take(n).collect())
            }
            KeyTransform::Soundex => {
                let code = soundex(trimmed);
                if code == "0000" {
                    None
                } else {
                    Some(code)
                }
            }
        }
    }
}

/// One component of a composite block key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPart {
    pub field: String,
    pub transform: KeyTransform,
}

impl KeyPart {
    pub fn new(field: impl Into<String>, transform: KeyTransform) -> Self {
        Self {
            field: field.into(),
            transform,
        }
    }
}

/// Blocking on a deterministic composite key (e.g. lowercased first three
/// characters of the last name x postal code). Requires no external index.
pub struct CompositeKeyStrategy {
    name: String,
    parts: Vec<KeyPart>,
    max_block_size: usize,
}

impl CompositeKeyStrategy {
    pub fn new(
        name: impl Into<String>,
        parts: Vec<KeyPart>,
    ) -> Result<Self, BlockingError> {
        let name = name.into();
        if parts.is_empty() {
            return Err(BlockingError::InvalidConfig {
                strategy: name,
                reason: "at least one key part is required".into(),
            });
        }
        Ok(Self {
            name,
            parts,
            max_block_size: DEFAULT_MAX_BLOCK_SIZE,
        })
    }

    pub fn with_max_block_size(mut self, max_block_size: usize) -> Self {
        self.max_block_size = max_block_size.max(2);
        self
    }

    /// Single-field exact blocking (case-insensitive), e.g. on email.
    pub fn exact_field(field: impl Into<String>) -> Self {
        let field = field.into();
        Self {
            name: format!("exact_{field}"),
            parts: vec![KeyPart::new(field, KeyTransform::Lowercase)],
            max_block_size: DEFAULT_MAX_BLOCK_SIZE,
        }
    }

    /// Phonetic blocking over the Soundex codes of the given name fields.
    pub fn phonetic(fields: &[&str]) -> Result<Self, BlockingError> {
        let parts = fields
            .iter()
            .map(|f| KeyPart::new(*f, KeyTransform::Soundex))
            .collect();
        Self::new("phonetic", parts)
    }

    /// Build the block key for a record; `None` when any part is missing.
    fn block_key(&self, record: &Record) -> Option<String> {
        let mut segments = Vec::with_capacity(self.parts.len());
        for part in &self.parts {
            let raw = record.field_text(&part.field)?;
            segments.push(part.transform.apply(&raw)?);
        }
        Some(segments.join("|"))
    }
}

impl BlockingStrategy for CompositeKeyStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn generate(
        &self,
        store: &dyn DocumentStore,
        collection: &str,
    ) -> Result<StrategyOutput, BlockingError> {
        let mut stats = StrategyStats::default();
        let mut blocks: BTreeMap<String, Vec<String>> = BTreeMap::new();

        store.scan(collection, &ScanFilter::none(), SCAN_BATCH, &mut |record| {
            stats.records_scanned += 1;
            match self.block_key(&record) {
                Some(key) => blocks.entry(key).or_default().push(record.id),
                None => stats.records_skipped += 1,
            }
            Ok(())
        })?;

        let mut pairs = Vec::new();
        for (key, members) in blocks {
            if members.len() < 2 {
                continue;
            }
            stats.blocks_built += 1;
            if members.len() > self.max_block_size {
                stats.oversized_blocks_skipped += 1;
                warn!(
                    strategy = self.name.as_str(),
                    block = key.as_str(),
                    size = members.len(),
                    max = self.max_block_size,
                    "skipping oversized block"
                );
                continue;
            }
            for i in 0..members.len() {
                for j in (i + 1)..members.len() {
                    if let Some(pair) = CandidatePair::new(
                        members[i].clone(),
                        members[j].clone(),
                        &self.name,
                        Some(key.clone()),
                    ) {
                        pairs.push(pair);
                    }
                }
            }
        }
        stats.pairs_emitted = pairs.len();
        Ok(StrategyOutput { pairs, stats })
    }
}
