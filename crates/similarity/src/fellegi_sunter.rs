//! Fellegi–Sunter probabilistic match scoring.
//!
//! The aggregator is a pure function: given a field-similarity vector and a
//! weight table it always produces the same [`MatchScore`], with no hidden
//! state. Agreement on a field adds `importance * ln(m/u)` to the total;
//! disagreement adds `importance * ln((1-m)/(1-u))`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use store::Record;
use thiserror::Error;

use crate::comparators::{cosine_similarity, Comparator};

/// Probabilities are clamped into this range to avoid infinite log ratios.
pub const PROB_FLOOR: f64 = 0.001;
pub const PROB_CEIL: f64 = 0.999;

/// Default decision thresholds on the raw (unnormalized) total score.
pub const DEFAULT_UPPER_THRESHOLD: f64 = 3.5;
pub const DEFAULT_LOWER_THRESHOLD: f64 = -1.5;

/// Errors raised while validating a weight table.
#[derive(Debug, Error, Clone, PartialEq)]
#[non_exhaustive]
pub enum SimilarityError {
    #[error("weight table has no field rules")]
    EmptyWeightTable,
    #[error("invalid rule {name}: {reason}")]
    InvalidRule { name: String, reason: String },
    #[error("upper_threshold ({upper}) must exceed lower_threshold ({lower})")]
    InvalidThresholds { upper: f64, lower: f64 },
}

/// One field comparison to run and its Fellegi–Sunter parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldRule {
    /// Field path on the record (dotted paths reach into sub-maps).
    pub field: String,
    pub comparator: Comparator,
    /// P(values agree | records match).
    pub m_prob: f64,
    /// P(values agree | records do not match).
    pub u_prob: f64,
    /// Similarity at or above which the field counts as agreeing.
    pub agreement_threshold: f64,
    /// Multiplier applied to this field's log-likelihood contribution.
    pub importance: f64,
}

impl FieldRule {
    pub fn new(field: impl Into<String>, comparator: Comparator) -> Self {
        Self {
            field: field.into(),
            comparator,
            m_prob: 0.8,
            u_prob: 0.05,
            agreement_threshold: 0.7,
            importance: 1.0,
        }
    }

    pub fn with_probs(mut self, m_prob: f64, u_prob: f64) -> Self {
        self.m_prob = m_prob;
        self.u_prob = u_prob;
        self
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.agreement_threshold = threshold;
        self
    }

    pub fn with_importance(mut self, importance: f64) -> Self {
        self.importance = importance;
        self
    }

    /// Key of this rule in field-similarity vectors,
    /// e.g. `last_name.jaro_winkler`.
    pub fn name(&self) -> String {
        format!("{}.{}", self.field, self.comparator.label())
    }
}

/// The weight table driving scoring: field rules plus decision thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightTable {
    pub rules: Vec<FieldRule>,
    pub upper_threshold: f64,
    pub lower_threshold: f64,
}

impl Default for WeightTable {
    fn default() -> Self {
        Self::person_default()
    }
}

impl WeightTable {
    pub fn new(rules: Vec<FieldRule>) -> Self {
        Self {
            rules,
            upper_threshold: DEFAULT_UPPER_THRESHOLD,
            lower_threshold: DEFAULT_LOWER_THRESHOLD,
        }
    }

    pub fn with_thresholds(mut self, upper: f64, lower: f64) -> Self {
        self.upper_threshold = upper;
        self.lower_threshold = lower;
        self
    }

    /// Default rules for person/company records: names compared four ways,
    /// addresses by n-gram, identifiers exactly.
    pub fn person_default() -> Self {
        let ngram = Comparator::NgramJaccard { n: 3 };
        Self::new(vec![
            FieldRule::new("first_name", ngram)
                .with_probs(0.85, 0.02)
                .with_threshold(0.7)
                .with_importance(0.8),
            FieldRule::new("last_name", ngram)
                .with_probs(0.9, 0.015)
                .with_threshold(0.7)
                .with_importance(1.0),
            FieldRule::new("first_name", Comparator::Levenshtein)
                .with_probs(0.8, 0.05)
                .with_threshold(0.6)
                .with_importance(0.7),
            FieldRule::new("last_name", Comparator::Levenshtein)
                .with_probs(0.85, 0.03)
                .with_threshold(0.6)
                .with_importance(0.9),
            FieldRule::new("first_name", Comparator::JaroWinkler)
                .with_probs(0.88, 0.03)
                .with_threshold(0.75)
                .with_importance(0.9),
            FieldRule::new("last_name", Comparator::JaroWinkler)
                .with_probs(0.92, 0.02)
                .with_threshold(0.75)
                .with_importance(1.1),
            FieldRule::new("first_name", Comparator::Phonetic)
                .with_probs(0.75, 0.08)
                .with_threshold(1.0)
                .with_importance(0.6),
            FieldRule::new("last_name", Comparator::Phonetic)
                .with_probs(0.8, 0.06)
                .with_threshold(1.0)
                .with_importance(0.7),
            FieldRule::new("address", ngram)
                .with_probs(0.8, 0.03)
                .with_threshold(0.6)
                .with_importance(0.8),
            FieldRule::new("city", ngram)
                .with_probs(0.9, 0.05)
                .with_threshold(0.8)
                .with_importance(0.6),
            FieldRule::new("email", Comparator::Exact)
                .with_probs(0.95, 0.001)
                .with_threshold(1.0)
                .with_importance(1.2),
            FieldRule::new("phone", Comparator::Exact)
                .with_probs(0.9, 0.005)
                .with_threshold(1.0)
                .with_importance(1.1),
            FieldRule::new("company", ngram)
                .with_probs(0.8, 0.02)
                .with_threshold(0.7)
                .with_importance(0.7),
        ])
    }

    pub fn validate(&self) -> Result<(), SimilarityError> {
        if self.rules.is_empty() {
            return Err(SimilarityError::EmptyWeightTable);
        }
        if self.upper_threshold <= self.lower_threshold {
            return Err(SimilarityError::InvalidThresholds {
                upper: self.upper_threshold,
                lower: self.lower_threshold,
            });
        }
        for rule in &self.rules {
            if !(0.0..=1.0).contains(&rule.m_prob) || !(0.0..=1.0).contains(&rule.u_prob) {
                return Err(SimilarityError::InvalidRule {
                    name: rule.name(),
                    reason: "m_prob and u_prob must lie in [0, 1]".into(),
                });
            }
            if rule.importance <= 0.0 {
                return Err(SimilarityError::InvalidRule {
                    name: rule.name(),
                    reason: "importance must be positive".into(),
                });
            }
            if !(0.0..=1.0).contains(&rule.agreement_threshold) {
                return Err(SimilarityError::InvalidRule {
                    name: rule.name(),
                    reason: "agreement_threshold must lie in [0, 1]".into(),
                });
            }
        }
        Ok(())
    }

    /// Compute the field-similarity vector for a pair of records.
    ///
    /// Text comparators contribute only when both sides carry a populated
    /// value, except `Exact`, which always contributes (a missing
    /// identifier is a disagreement, not an unknown). `Cosine` contributes
    /// when both records carry embeddings of the same dimension.
    pub fn similarity_vector(&self, a: &Record, b: &Record) -> BTreeMap<String, f64> {
        let mut vector = BTreeMap::new();
        for rule in &self.rules {
            match rule.comparator {
                Comparator::Cosine => {
                    if let (Some(va), Some(vb)) = (&a.embedding, &b.embedding) {
                        if va.len() == vb.len() && !va.is_empty() {
                            vector.insert(rule.name(), cosine_similarity(va, vb));
                        }
                    }
                }
                Comparator::Exact => {
                    let ta = a.field_text(&rule.field).unwrap_or_default();
                    let tb = b.field_text(&rule.field).unwrap_or_default();
                    vector.insert(rule.name(), rule.comparator.compare_text(&ta, &tb));
                }
                _ => {
                    if let (Some(ta), Some(tb)) =
                        (a.field_text(&rule.field), b.field_text(&rule.field))
                    {
                        vector.insert(rule.name(), rule.comparator.compare_text(&ta, &tb));
                    }
                }
            }
        }
        vector
    }
}

/// Three-valued match decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchDecision {
    Match,
    PossibleMatch,
    NonMatch,
}

/// Per-field detail of an aggregated score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldScore {
    pub similarity: f64,
    pub agreement: bool,
    /// Log-likelihood ratio before the importance multiplier.
    pub weight: f64,
    pub threshold: f64,
    pub importance: f64,
}

/// Aggregated Fellegi–Sunter outcome for one pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchScore {
    /// Summed importance-weighted log-likelihood ratios (unbounded).
    pub total_score: f64,
    /// Total divided by the summed importances of the fields compared.
    pub normalized_score: f64,
    pub decision: MatchDecision,
    /// Piecewise-linear confidence in `[0, 1]` from threshold distance.
    pub confidence: f64,
    pub field_scores: BTreeMap<String, FieldScore>,
}

/// Aggregate a field-similarity vector under a weight table.
pub fn score_vector(similarities: &BTreeMap<String, f64>, table: &WeightTable) -> MatchScore {
    let mut total = 0.0;
    let mut total_importance = 0.0;
    let mut field_scores = BTreeMap::new();

    for rule in &table.rules {
        let Some(&similarity) = similarities.get(&rule.name()) else {
            continue;
        };
        let m = rule.m_prob.clamp(PROB_FLOOR, PROB_CEIL);
        let u = rule.u_prob.clamp(PROB_FLOOR, PROB_CEIL);
        let agreement = similarity >= rule.agreement_threshold;
        let weight = if agreement {
            (m / u).ln()
        } else {
            ((1.0 - m) / (1.0 - u)).ln()
        };
        total += weight * rule.importance;
        total_importance += rule.importance;
        field_scores.insert(
            rule.name(),
            FieldScore {
                similarity,
                agreement,
                weight,
                threshold: rule.agreement_threshold,
                importance: rule.importance,
            },
        );
    }

    let normalized = if total_importance > 0.0 {
        total / total_importance
    } else {
        0.0
    };

    let upper = table.upper_threshold;
    let lower = table.lower_threshold;
    let decision = if total > upper {
        MatchDecision::Match
    } else if total > lower {
        MatchDecision::PossibleMatch
    } else {
        MatchDecision::NonMatch
    };

    let confidence = match decision {
        MatchDecision::Match => {
            let span = (upper * 2.0).abs().max(f64::EPSILON);
            (0.5 + (total - upper) / span).min(1.0)
        }
        MatchDecision::PossibleMatch => {
            let span = (upper - lower).max(f64::EPSILON);
            0.3 + 0.4 * (total - lower) / span
        }
        MatchDecision::NonMatch => {
            let span = lower.abs().max(f64::EPSILON);
            (0.1 * (total - lower) / span).max(0.0)
        }
    }
    .clamp(0.0, 1.0);

    MatchScore {
        total_score: total,
        normalized_score: normalized,
        decision,
        confidence,
        field_scores,
    }
}
