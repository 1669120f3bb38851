//! Stateless per-field comparison functions.
//!
//! Every comparator maps a pair of inputs to a similarity in `[0, 1]`.
//! Missing data never counts as agreement: empty input on either side
//! (or both) yields `0.0`.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::soundex::soundex;

/// Default n-gram width for [`Comparator::NgramJaccard`].
pub const DEFAULT_NGRAM: usize = 3;

const JARO_WINKLER_BOOST_THRESHOLD: f64 = 0.7;
const JARO_WINKLER_PREFIX_SCALE: f64 = 0.1;
const JARO_WINKLER_PREFIX_CAP: usize = 4;

/// A field comparison function.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Comparator {
    /// 1.0 when normalized values are equal, else 0.0.
    Exact,
    /// Character n-gram Jaccard, case-folded and whitespace-normalized.
    NgramJaccard { n: usize },
    /// `1 - edit_distance / max(|a|, |b|)`.
    Levenshtein,
    /// Jaro with the Winkler prefix boost.
    JaroWinkler,
    /// 1.0 when Soundex codes agree, else 0.0.
    Phonetic,
    /// Dot product of L2-normalized vectors; applies to embeddings.
    Cosine,
}

impl Comparator {
    /// Short label used in field-similarity vector keys
    /// (e.g. `last_name.jaro_winkler`).
    pub fn label(&self) -> &'static str {
        match self {
            Comparator::Exact => "exact",
            Comparator::NgramJaccard { .. } => "ngram",
            Comparator::Levenshtein => "levenshtein",
            Comparator::JaroWinkler => "jaro_winkler",
            Comparator::Phonetic => "phonetic",
            Comparator::Cosine => "cosine",
        }
    }

    /// Compare two text values. [`Comparator::Cosine`] always yields 0.0
    /// here; it is evaluated over embeddings via [`cosine_similarity`].
    pub fn compare_text(&self, a: &str, b: &str) -> f64 {
        let a = a.trim();
        let b = b.trim();
        if a.is_empty() || b.is_empty() {
            return 0.0;
        }
        match self {
            Comparator::Exact => exact_similarity(a, b),
            Comparator::NgramJaccard { n } => ngram_jaccard(a, b, *n),
            Comparator::Levenshtein => normalized_levenshtein(a, b),
            Comparator::JaroWinkler => jaro_winkler(a, b),
            Comparator::Phonetic => phonetic_similarity(a, b),
            Comparator::Cosine => 0.0,
        }
    }
}

/// Case-insensitive equality on trimmed input.
pub fn exact_similarity(a: &str, b: &str) -> f64 {
    if a.trim().to_lowercase() == b.trim().to_lowercase() {
        1.0
    } else {
        0.0
    }
}

/// Jaccard overlap of character n-grams after case folding and whitespace
/// normalization. Inputs shorter than `n` only match via full equality.
pub fn ngram_jaccard(a: &str, b: &str, n: usize) -> f64 {
    let n = n.max(1);
    let a = fold(a);
    let b = fold(b);
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a == b {
        return 1.0;
    }
    let grams_a = grams(&a, n);
    let grams_b = grams(&b, n);
    if grams_a.is_empty() || grams_b.is_empty() {
        return 0.0;
    }
    let intersection = grams_a.intersection(&grams_b).count() as f64;
    let union = grams_a.union(&grams_b).count() as f64;
    intersection / union
}

fn fold(s: &str) -> String {
    s.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn grams(s: &str, n: usize) -> HashSet<String> {
    let chars: Vec<char> = s.chars().collect();
    if chars.len() < n {
        return HashSet::new();
    }
    chars
        .windows(n)
        .map(|w| w.iter().collect::<String>())
        .collect()
}

/// `1 - edit_distance / max(|a|, |b|)` on character counts.
pub fn normalized_levenshtein(a: &str, b: &str) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a == b {
        return 1.0;
    }
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 0.0;
    }
    1.0 - strsim::levenshtein(a, b) as f64 / max_len as f64
}

/// Jaro similarity with the Winkler prefix boost applied above the
/// standard 0.7 threshold (scale 0.1, prefix capped at 4 characters).
pub fn jaro_winkler(a: &str, b: &str) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let a = a.to_lowercase();
    let b = b.to_lowercase();
    if a == b {
        return 1.0;
    }
    let jaro = strsim::jaro(&a, &b);
    if jaro < JARO_WINKLER_BOOST_THRESHOLD {
        return jaro;
    }
    let prefix_len = a
        .chars()
        .zip(b.chars())
        .take(JARO_WINKLER_PREFIX_CAP)
        .take_while(|(x, y)| x == y)
        .count();
    jaro + prefix_len as f64 * JARO_WINKLER_PREFIX_SCALE * (1.0 - jaro)
}

/// 1.0 when the Soundex codes of both inputs agree.
pub fn phonetic_similarity(a: &str, b: &str) -> f64 {
    let code_a = soundex(a);
    let code_b = soundex(b);
    if code_a == "0000" || code_b == "0000" {
        return 0.0;
    }
    if code_a == code_b {
        1.0
    } else {
        0.0
    }
}

/// Cosine similarity as the dot product of L2-normalized vectors.
/// Mismatched dimensions or zero-norm inputs yield 0.0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let norm_a = a.iter().map(|v| f64::from(*v).powi(2)).sum::<f64>().sqrt();
    let norm_b = b.iter().map(|v| f64::from(*v).powi(2)).sum::<f64>().sqrt();
    if norm_a <= f64::EPSILON || norm_b <= f64::EPSILON {
        return 0.0;
    }
    let dot: f64 = a
        .iter()
        .zip(b.iter())
        .map(|(x, y)| f64::from(*x) * f64::from(*y))
        .sum();
    dot / (norm_a * norm_b)
}
