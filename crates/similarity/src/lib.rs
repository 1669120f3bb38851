//! Entlink Similarity Kernel
//!
//! Stateless field-level comparators plus the Fellegi–Sunter aggregator
//! that turns a field-similarity vector into a match decision.
//!
//! The kernel never touches the store: callers hand it records (or
//! precomputed similarity vectors) and get pure values back. That keeps
//! scoring bit-for-bit reproducible - the same inputs and weight table
//! always produce the same [`MatchScore`].
//!
//! ## Example
//!
//! ```
//! use similarity::{score_vector, Comparator, FieldRule, MatchDecision, WeightTable};
//! use store::Record;
//!
//! let table = WeightTable::new(vec![
//!     FieldRule::new("email", Comparator::Exact)
//!         .with_probs(0.95, 0.001)
//!         .with_threshold(1.0)
//!         .with_importance(1.2),
//! ])
//! .with_thresholds(2.0, -1.0);
//!
//! let a = Record::new("a", "people").with_field("email", "ada@acme.com");
//! let b = Record::new("b", "people").with_field("email", "ADA@acme.com");
//!
//! let vector = table.similarity_vector(&a, &b);
//! let score = score_vector(&vector, &table);
//! assert_eq!(score.decision, MatchDecision::Match);
//! ```

mod comparators;
mod fellegi_sunter;
mod soundex;

pub use crate::comparators::{
    cosine_similarity, exact_similarity, jaro_winkler, ngram_jaccard, normalized_levenshtein,
    phonetic_similarity, Comparator, DEFAULT_NGRAM,
};
pub use crate::fellegi_sunter::{
    score_vector, FieldRule, FieldScore, MatchDecision, MatchScore, SimilarityError, WeightTable,
    DEFAULT_LOWER_THRESHOLD, DEFAULT_UPPER_THRESHOLD, PROB_CEIL, PROB_FLOOR,
};
pub use crate::soundex::soundex;
