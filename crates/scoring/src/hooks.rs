//! Optional enrichment hooks applied around score aggregation.
//!
//! Hooks are stateless transforms on the field-similarity vector or the
//! normalized score. They never touch the Fellegi–Sunter decision
//! thresholds. The engine applies them in a fixed order: type filter ->
//! acronym expansion -> aggregation -> context blend.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use similarity::{Comparator, WeightTable};
use store::Record;

use crate::ScoringError;

/// Rejects pairs whose entity types are incompatible under a
/// user-supplied matrix. The check is symmetric: `a ~ b` holds when either
/// direction is listed, or when the types are equal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeCompatibilityFilter {
    /// Record field holding the entity type.
    pub type_field: String,
    /// Source type -> set of compatible target types.
    pub matrix: BTreeMap<String, BTreeSet<String>>,
    /// Whether records with a missing or unlisted type pass the filter.
    pub unknown_compatible: bool,
}

impl TypeCompatibilityFilter {
    pub fn new(
        type_field: impl Into<String>,
        matrix: BTreeMap<String, BTreeSet<String>>,
    ) -> Self {
        Self {
            type_field: type_field.into(),
            matrix: matrix
                .into_iter()
                .map(|(k, v)| {
                    (
                        k.to_lowercase(),
                        v.into_iter().map(|t| t.to_lowercase()).collect(),
                    )
                })
                .collect(),
            unknown_compatible: true,
        }
    }

    pub fn with_unknown_compatible(mut self, unknown_compatible: bool) -> Self {
        self.unknown_compatible = unknown_compatible;
        self
    }

    pub fn is_pair_compatible(&self, a: &Record, b: &Record) -> bool {
        let type_a = a.field_text(&self.type_field).map(|t| t.to_lowercase());
        let type_b = b.field_text(&self.type_field).map(|t| t.to_lowercase());
        match (type_a, type_b) {
            (Some(ta), Some(tb)) => {
                if ta == tb {
                    return true;
                }
                let forward = self.matrix.get(&ta).map(|s| s.contains(&tb));
                let backward = self.matrix.get(&tb).map(|s| s.contains(&ta));
                match (forward, backward) {
                    (None, None) => self.unknown_compatible,
                    (f, b) => f.unwrap_or(false) || b.unwrap_or(false),
                }
            }
            _ => self.unknown_compatible,
        }
    }
}

/// Expands known acronyms when comparing short tokens and keeps the best
/// similarity across all expansions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcronymExpander {
    /// Fields the expander applies to.
    pub fields: Vec<String>,
    /// Acronym (lowercased) -> expansions.
    pub expansions: BTreeMap<String, Vec<String>>,
}

impl AcronymExpander {
    pub fn new(fields: Vec<String>, expansions: BTreeMap<String, Vec<String>>) -> Self {
        Self {
            fields,
            expansions: expansions
                .into_iter()
                .map(|(k, v)| (k.to_lowercase(), v))
                .collect(),
        }
    }

    /// Original term plus every known expansion.
    fn variants(&self, term: &str) -> Vec<String> {
        let mut variants = vec![term.to_string()];
        if let Some(expansions) = self.expansions.get(&term.trim().to_lowercase()) {
            variants.extend(expansions.iter().cloned());
        }
        variants
    }

    /// Raise similarity-vector entries where an expansion matches better
    /// than the raw token did.
    pub fn apply(
        &self,
        table: &WeightTable,
        a: &Record,
        b: &Record,
        similarities: &mut BTreeMap<String, f64>,
    ) {
        for rule in &table.rules {
            if matches!(rule.comparator, Comparator::Cosine) {
                continue;
            }
            if !self.fields.contains(&rule.field) {
                continue;
            }
            let (Some(ta), Some(tb)) = (a.field_text(&rule.field), b.field_text(&rule.field))
            else {
                continue;
            };
            let variants_a = self.variants(&ta);
            let variants_b = self.variants(&tb);
            if variants_a.len() == 1 && variants_b.len() == 1 {
                continue;
            }
            let mut best: f64 = 0.0;
            for va in &variants_a {
                for vb in &variants_b {
                    best = best.max(rule.comparator.compare_text(va, vb));
                }
            }
            let entry = similarities.entry(rule.name()).or_insert(0.0);
            if best > *entry {
                *entry = best;
            }
        }
    }
}

/// Blends a parent-context overlap score into the normalized score.
///
/// Context overlap is the token Jaccard of the two records' context
/// fields; when both carry context and the overlap is non-zero, the final
/// normalized score is `base*base_weight + overlap*context_weight`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextResolver {
    pub context_field: String,
    pub base_weight: f64,
    pub context_weight: f64,
}

impl ContextResolver {
    pub fn new(
        context_field: impl Into<String>,
        base_weight: f64,
        context_weight: f64,
    ) -> Result<Self, ScoringError> {
        if !(0.0..=1.0).contains(&base_weight) || !(0.0..=1.0).contains(&context_weight) {
            return Err(ScoringError::InvalidConfig(
                "context resolver weights must lie in [0, 1]".into(),
            ));
        }
        if (base_weight + context_weight - 1.0).abs() > 0.01 {
            return Err(ScoringError::InvalidConfig(format!(
                "base_weight ({base_weight}) and context_weight ({context_weight}) must sum to 1.0"
            )));
        }
        Ok(Self {
            context_field: context_field.into(),
            base_weight,
            context_weight,
        })
    }

    /// Token Jaccard overlap of two context descriptions.
    pub fn token_overlap(a: &str, b: &str) -> f64 {
        let tokens_a: BTreeSet<String> =
            a.to_lowercase().split_whitespace().map(String::from).collect();
        let tokens_b: BTreeSet<String> =
            b.to_lowercase().split_whitespace().map(String::from).collect();
        if tokens_a.is_empty() || tokens_b.is_empty() {
            return 0.0;
        }
        let intersection = tokens_a.intersection(&tokens_b).count() as f64;
        let union = tokens_a.union(&tokens_b).count() as f64;
        intersection / union
    }

    pub fn blend(&self, base_score: f64, a: &Record, b: &Record) -> f64 {
        let (Some(ctx_a), Some(ctx_b)) = (
            a.field_text(&self.context_field),
            b.field_text(&self.context_field),
        ) else {
            return base_score;
        };
        let overlap = Self::token_overlap(&ctx_a, &ctx_b);
        if overlap <= 0.0 {
            return base_score;
        }
        base_score * self.base_weight + overlap * self.context_weight
    }
}

/// The hook set applied by the scoring engine, in its fixed order.
#[derive(Debug, Clone, Default)]
pub struct ScoringHooks {
    pub type_filter: Option<TypeCompatibilityFilter>,
    pub acronyms: Option<AcronymExpander>,
    pub context: Option<ContextResolver>,
}

impl ScoringHooks {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_type_filter(mut self, filter: TypeCompatibilityFilter) -> Self {
        self.type_filter = Some(filter);
        self
    }

    pub fn with_acronyms(mut self, expander: AcronymExpander) -> Self {
        self.acronyms = Some(expander);
        self
    }

    pub fn with_context(mut self, resolver: ContextResolver) -> Self {
        self.context = Some(resolver);
        self
    }
}
