//! Per-field fusion rules.
//!
//! Fusion is deterministic: every rule defines a total order over the
//! candidate members, and ties always fall back to the lexicographically
//! smallest member id, never to map iteration order.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use store::{Record, Value};

/// How a single field is fused across cluster members.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum FusionRule {
    /// Value from the member with the most populated fields overall.
    CompletenessWinner,
    /// Most frequent value; ties break by recency (`updated_at`), then by
    /// member id.
    MostFrequent,
    /// Longest non-null scalar value; useful for addresses.
    LongestValue,
    /// Prefer members from collections in the given order; unlisted
    /// collections rank last.
    SourcePriority { collections: Vec<String> },
}

impl FusionRule {
    pub fn label(&self) -> &'static str {
        match self {
            FusionRule::CompletenessWinner => "completeness_winner",
            FusionRule::MostFrequent => "most_frequent",
            FusionRule::LongestValue => "longest_value",
            FusionRule::SourcePriority { .. } => "source_priority",
        }
    }
}

/// Per-field rule assignments with a default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusionPolicy {
    #[serde(default = "FusionPolicy::default_rule")]
    pub default_rule: FusionRule,
    #[serde(default)]
    pub per_field: BTreeMap<String, FusionRule>,
}

impl FusionPolicy {
    fn default_rule() -> FusionRule {
        FusionRule::CompletenessWinner
    }

    pub fn rule_for(&self, field: &str) -> &FusionRule {
        self.per_field.get(field).unwrap_or(&self.default_rule)
    }

    pub fn with_field_rule(mut self, field: impl Into<String>, rule: FusionRule) -> Self {
        self.per_field.insert(field.into(), rule);
        self
    }
}

impl Default for FusionPolicy {
    fn default() -> Self {
        Self {
            default_rule: Self::default_rule(),
            per_field: BTreeMap::new(),
        }
    }
}

/// The fused value for one field with its provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct FusedField {
    pub value: Value,
    pub source_member_id: String,
    pub rule: &'static str,
    pub alternatives_considered: usize,
}

/// Fuse one field across members. `members` must be sorted by id; the
/// function returns `None` when no member has a populated value.
pub fn fuse_field(field: &str, rule: &FusionRule, members: &[&Record]) -> Option<FusedField> {
    let candidates: Vec<&Record> = members
        .iter()
        .copied()
        .filter(|r| r.field(field).map(Value::is_populated).unwrap_or(false))
        .collect();
    if candidates.is_empty() {
        return None;
    }
    let alternatives = distinct_value_count(field, &candidates);

    let winner: &Record = match rule {
        FusionRule::CompletenessWinner => candidates
            .iter()
            .copied()
            // max_by prefers later elements on ties, so compare id in
            // reverse to keep the smallest id.
            .max_by(|a, b| {
                a.populated_field_count()
                    .cmp(&b.populated_field_count())
                    .then_with(|| b.id.cmp(&a.id))
            })?,
        FusionRule::MostFrequent => {
            let mut counts: BTreeMap<String, usize> = BTreeMap::new();
            for record in &candidates {
                let key = value_key(record.field(field)?);
                *counts.entry(key).or_insert(0) += 1;
            }
            let best_count = *counts.values().max()?;
            candidates
                .iter()
                .copied()
                .filter(|r| {
                    r.field(field)
                        .map(|v| counts[&value_key(v)] == best_count)
                        .unwrap_or(false)
                })
                .max_by(|a, b| {
                    recency(a)
                        .cmp(&recency(b))
                        .then_with(|| b.id.cmp(&a.id))
                })?
        }
        FusionRule::LongestValue => candidates
            .iter()
            .copied()
            .max_by(|a, b| {
                scalar_len(a, field)
                    .cmp(&scalar_len(b, field))
                    .then_with(|| b.id.cmp(&a.id))
            })?,
        FusionRule::SourcePriority { collections } => candidates
            .iter()
            .copied()
            .min_by(|a, b| {
                priority_rank(a, collections)
                    .cmp(&priority_rank(b, collections))
                    .then_with(|| a.id.cmp(&b.id))
            })?,
    };

    Some(FusedField {
        value: winner.field(field)?.clone(),
        source_member_id: winner.id.clone(),
        rule: rule.label(),
        alternatives_considered: alternatives,
    })
}

fn distinct_value_count(field: &str, candidates: &[&Record]) -> usize {
    let mut keys: Vec<String> = candidates
        .iter()
        .filter_map(|r| r.field(field).map(value_key))
        .collect();
    keys.sort();
    keys.dedup();
    keys.len()
}

/// Stable hashable rendering of a value for frequency counting.
fn value_key(value: &Value) -> String {
    serde_json::Value::from(value.clone()).to_string()
}

fn scalar_len(record: &Record, field: &str) -> usize {
    record
        .field_text(field)
        .map(|t| t.chars().count())
        .unwrap_or(0)
}

/// Recency from the conventional `updated_at` field; records without one
/// rank oldest.
fn recency(record: &Record) -> Option<DateTime<Utc>> {
    record
        .field_text("updated_at")
        .and_then(|t| DateTime::parse_from_rfc3339(&t).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn priority_rank(record: &Record, collections: &[String]) -> usize {
    collections
        .iter()
        .position(|c| *c == record.collection)
        .unwrap_or(collections.len())
}
