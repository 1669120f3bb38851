//! Pipeline configuration.
//!
//! A single document (in-memory struct or YAML file) wires every stage:
//! source and output collections, the blocking strategy list, similarity
//! weights and thresholds, clustering limits, and fusion rules. Nothing
//! reads configuration from ambient process state; the config handle is
//! built once, validated, and passed down.
//!
//! ## Example YAML
//!
//! ```yaml
//! entity_type: customer
//! collection_name: customers
//! edge_collection: similarities
//! cluster_collection: entity_clusters
//! golden_collection: golden_customers
//!
//! blocking:
//!   strategies:
//!     - type: exact
//!       field: email
//!     - type: phonetic
//!       fields: [first_name, last_name]
//!     - type: lsh
//!       num_hash_tables: 10
//!       num_hyperplanes: 8
//!       random_seed: 42
//!
//! similarity:
//!   algorithm: fellegi_sunter
//!   upper_threshold: 3.5
//!   lower_threshold: -1.5
//!   batch_size: 2000
//!
//! clustering:
//!   algorithm: wcc
//!   min_cluster_size: 2
//!   max_cluster_size: 100
//!   edge_creation_threshold: 0.7
//!
//! golden:
//!   fusion_rules:
//!     address: { rule: longest_value }
//!     city: { rule: most_frequent }
//!
//! edge_loading_method: api
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use blocking::{
    BlockingEngine, BlockingError, BlockingStrategy, CompositeKeyStrategy, KeyPart, LshStrategy,
    TextBlockingStrategy, VectorBlockingStrategy,
};
use cluster::{
    ClusterAlgorithm, ClusterConfig, EdgeLoadingMethod, GraphConfig, OversizePolicy,
};
use golden::{FusionPolicy, FusionRule, GoldenConfig};
use scoring::ScoringConfig;
use similarity::{FieldRule, WeightTable};

/// Errors raised while loading or validating configuration. The pipeline
/// does not start on any of these.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("failed to read config file {path}: {reason}")]
    Io { path: String, reason: String },
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl From<BlockingError> for ConfigError {
    fn from(err: BlockingError) -> Self {
        ConfigError::Invalid(err.to_string())
    }
}

/// One blocking strategy plus its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StrategySpec {
    /// Composite-key blocking over explicit field projections.
    Composite {
        name: String,
        keys: Vec<KeyPart>,
        #[serde(default)]
        max_block_size: Option<usize>,
    },
    /// Exact single-field blocking (case-insensitive).
    Exact {
        field: String,
        #[serde(default)]
        max_block_size: Option<usize>,
    },
    /// Soundex blocking over name fields.
    Phonetic {
        fields: Vec<String>,
        #[serde(default)]
        max_block_size: Option<usize>,
    },
    /// BM25 text blocking against a text index.
    Text {
        index: String,
        fields: Vec<String>,
        #[serde(default)]
        limit_per_entity: Option<usize>,
        #[serde(default)]
        min_score: Option<f64>,
    },
    /// Vector-kNN blocking against a vector index.
    Vector {
        index: String,
        #[serde(default)]
        limit_per_entity: Option<usize>,
        #[serde(default)]
        min_cosine: Option<f64>,
        #[serde(default)]
        blocking_field: Option<String>,
    },
    /// Random-hyperplane LSH over embeddings.
    Lsh {
        num_hash_tables: usize,
        num_hyperplanes: usize,
        #[serde(default = "default_lsh_seed")]
        random_seed: u64,
    },
}

fn default_lsh_seed() -> u64 {
    42
}

impl StrategySpec {
    fn build(&self) -> Result<Box<dyn BlockingStrategy>, ConfigError> {
        Ok(match self {
            StrategySpec::Composite {
                name,
                keys,
                max_block_size,
            } => {
                let mut strategy = CompositeKeyStrategy::new(name.clone(), keys.clone())?;
                if let Some(max) = max_block_size {
                    strategy = strategy.with_max_block_size(*max);
                }
                Box::new(strategy)
            }
            StrategySpec::Exact {
                field,
                max_block_size,
            } => {
                let mut strategy = CompositeKeyStrategy::exact_field(field.clone());
                if let Some(max) = max_block_size {
                    strategy = strategy.with_max_block_size(*max);
                }
                Box::new(strategy)
            }
            StrategySpec::Phonetic {
                fields,
                max_block_size,
            } => {
                let refs: Vec<&str> = fields.iter().map(String::as_str).collect();
                let mut strategy = CompositeKeyStrategy::phonetic(&refs)?;
                if let Some(max) = max_block_size {
                    strategy = strategy.with_max_block_size(*max);
                }
                Box::new(strategy)
            }
            StrategySpec::Text {
                index,
                fields,
                limit_per_entity,
                min_score,
            } => {
                let mut strategy = TextBlockingStrategy::new(index.clone(), fields.clone())?;
                if let Some(limit) = limit_per_entity {
                    strategy = strategy.with_limit_per_entity(*limit);
                }
                if let Some(min) = min_score {
                    strategy = strategy.with_min_score(*min);
                }
                Box::new(strategy)
            }
            StrategySpec::Vector {
                index,
                limit_per_entity,
                min_cosine,
                blocking_field,
            } => {
                let mut strategy = VectorBlockingStrategy::new(index.clone());
                if let Some(limit) = limit_per_entity {
                    strategy = strategy.with_limit_per_entity(*limit);
                }
                if let Some(min) = min_cosine {
                    strategy = strategy.with_min_cosine(*min);
                }
                if let Some(field) = blocking_field {
                    strategy = strategy.with_blocking_field(field.clone());
                }
                Box::new(strategy)
            }
            StrategySpec::Lsh {
                num_hash_tables,
                num_hyperplanes,
                random_seed,
            } => Box::new(LshStrategy::new(
                *num_hash_tables,
                *num_hyperplanes,
                *random_seed,
            )?),
        })
    }
}

/// Blocking stage configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockingStageConfig {
    pub strategies: Vec<StrategySpec>,
}

impl Default for BlockingStageConfig {
    fn default() -> Self {
        Self {
            strategies: vec![
                StrategySpec::Exact {
                    field: "email".to_string(),
                    max_block_size: None,
                },
                StrategySpec::Phonetic {
                    fields: vec!["first_name".to_string(), "last_name".to_string()],
                    max_block_size: None,
                },
            ],
        }
    }
}

/// Scoring stage configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityStageConfig {
    /// Only `fellegi_sunter` is supported.
    #[serde(default = "SimilarityStageConfig::default_algorithm")]
    pub algorithm: String,
    /// Explicit field rules; empty means the person/company defaults.
    #[serde(default)]
    pub field_rules: Vec<FieldRule>,
    #[serde(default = "SimilarityStageConfig::default_upper")]
    pub upper_threshold: f64,
    #[serde(default = "SimilarityStageConfig::default_lower")]
    pub lower_threshold: f64,
    #[serde(default = "SimilarityStageConfig::default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub drop_non_matches: bool,
    #[serde(default)]
    pub min_normalized_score: Option<f64>,
    #[serde(default = "SimilarityStageConfig::default_include_field_scores")]
    pub include_field_scores: bool,
}

impl SimilarityStageConfig {
    fn default_algorithm() -> String {
        "fellegi_sunter".to_string()
    }

    fn default_upper() -> f64 {
        similarity::DEFAULT_UPPER_THRESHOLD
    }

    fn default_lower() -> f64 {
        similarity::DEFAULT_LOWER_THRESHOLD
    }

    fn default_batch_size() -> usize {
        scoring::DEFAULT_BATCH_SIZE
    }

    fn default_include_field_scores() -> bool {
        true
    }

    pub fn weight_table(&self) -> WeightTable {
        let table = if self.field_rules.is_empty() {
            WeightTable::person_default()
        } else {
            WeightTable::new(self.field_rules.clone())
        };
        table.with_thresholds(self.upper_threshold, self.lower_threshold)
    }

    pub fn scoring_config(&self) -> ScoringConfig {
        ScoringConfig {
            batch_size: self.batch_size,
            drop_non_matches: self.drop_non_matches,
            min_normalized_score: self.min_normalized_score,
            include_field_scores: self.include_field_scores,
        }
    }
}

impl Default for SimilarityStageConfig {
    fn default() -> Self {
        Self {
            algorithm: Self::default_algorithm(),
            field_rules: Vec::new(),
            upper_threshold: Self::default_upper(),
            lower_threshold: Self::default_lower(),
            batch_size: Self::default_batch_size(),
            drop_non_matches: false,
            min_normalized_score: None,
            include_field_scores: Self::default_include_field_scores(),
        }
    }
}

/// Clustering stage configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusteringStageConfig {
    #[serde(default)]
    pub algorithm: ClusterAlgorithm,
    #[serde(default = "ClusteringStageConfig::default_min_cluster_size")]
    pub min_cluster_size: usize,
    #[serde(default = "ClusteringStageConfig::default_max_cluster_size")]
    pub max_cluster_size: usize,
    #[serde(default)]
    pub oversize_policy: OversizePolicy,
    /// Normalized-score floor for persisting a similarity edge.
    #[serde(default = "ClusteringStageConfig::default_edge_threshold")]
    pub edge_creation_threshold: f64,
    #[serde(default = "ClusteringStageConfig::default_max_edges")]
    pub max_edges: usize,
    #[serde(default = "ClusteringStageConfig::default_warn_edges")]
    pub warn_edges: usize,
    #[serde(default = "ClusteringStageConfig::default_store_results")]
    pub store_results: bool,
}

impl ClusteringStageConfig {
    fn default_min_cluster_size() -> usize {
        2
    }

    fn default_max_cluster_size() -> usize {
        100
    }

    fn default_edge_threshold() -> f64 {
        cluster::DEFAULT_EDGE_THRESHOLD
    }

    fn default_max_edges() -> usize {
        cluster::DEFAULT_MAX_EDGES
    }

    fn default_warn_edges() -> usize {
        cluster::DEFAULT_WARN_EDGES
    }

    fn default_store_results() -> bool {
        true
    }
}

impl Default for ClusteringStageConfig {
    fn default() -> Self {
        Self {
            algorithm: ClusterAlgorithm::Wcc,
            min_cluster_size: Self::default_min_cluster_size(),
            max_cluster_size: Self::default_max_cluster_size(),
            oversize_policy: OversizePolicy::default(),
            edge_creation_threshold: Self::default_edge_threshold(),
            max_edges: Self::default_max_edges(),
            warn_edges: Self::default_warn_edges(),
            store_results: Self::default_store_results(),
        }
    }
}

/// Golden-record stage configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoldenStageConfig {
    /// Per-field fusion rule overrides.
    #[serde(default)]
    pub fusion_rules: BTreeMap<String, FusionRule>,
    /// Rule for fields without an override.
    #[serde(default)]
    pub default_rule: Option<FusionRule>,
    #[serde(default = "GoldenStageConfig::default_store_results")]
    pub store_results: bool,
}

impl Default for GoldenStageConfig {
    fn default() -> Self {
        Self {
            fusion_rules: BTreeMap::new(),
            default_rule: None,
            store_results: Self::default_store_results(),
        }
    }
}

impl GoldenStageConfig {
    fn default_store_results() -> bool {
        true
    }

    pub fn fusion_policy(&self) -> FusionPolicy {
        let mut policy = FusionPolicy::default();
        if let Some(rule) = &self.default_rule {
            policy.default_rule = rule.clone();
        }
        for (field, rule) in &self.fusion_rules {
            policy = policy.with_field_rule(field.clone(), rule.clone());
        }
        policy
    }
}

/// The single configuration document driving a pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Free-form tag carried into metadata and reports.
    #[serde(default = "PipelineConfig::default_entity_type")]
    pub entity_type: String,
    /// Source record collection.
    pub collection_name: String,
    #[serde(default = "PipelineConfig::default_edge_collection")]
    pub edge_collection: String,
    #[serde(default = "PipelineConfig::default_cluster_collection")]
    pub cluster_collection: String,
    #[serde(default = "PipelineConfig::default_golden_collection")]
    pub golden_collection: String,
    #[serde(default)]
    pub blocking: BlockingStageConfig,
    #[serde(default)]
    pub similarity: SimilarityStageConfig,
    #[serde(default)]
    pub clustering: ClusteringStageConfig,
    #[serde(default)]
    pub golden: GoldenStageConfig,
    #[serde(default)]
    pub edge_loading_method: EdgeLoadingMethod,
}

impl PipelineConfig {
    fn default_entity_type() -> String {
        "entity".to_string()
    }

    fn default_edge_collection() -> String {
        "similarities".to_string()
    }

    fn default_cluster_collection() -> String {
        "entity_clusters".to_string()
    }

    fn default_golden_collection() -> String {
        "golden_records".to_string()
    }

    /// A config with defaults for every stage.
    pub fn for_collection(collection_name: impl Into<String>) -> Self {
        Self {
            entity_type: Self::default_entity_type(),
            collection_name: collection_name.into(),
            edge_collection: Self::default_edge_collection(),
            cluster_collection: Self::default_cluster_collection(),
            golden_collection: Self::default_golden_collection(),
            blocking: BlockingStageConfig::default(),
            similarity: SimilarityStageConfig::default(),
            clustering: ClusteringStageConfig::default(),
            golden: GoldenStageConfig::default(),
            edge_loading_method: EdgeLoadingMethod::default(),
        }
    }

    /// Load and validate a YAML config file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_yaml_str(&text)
    }

    /// Parse and validate a YAML config document.
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig =
            serde_yaml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.collection_name.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "collection_name must not be empty".into(),
            ));
        }
        if self.similarity.algorithm != "fellegi_sunter" {
            return Err(ConfigError::Invalid(format!(
                "unknown similarity algorithm {}",
                self.similarity.algorithm
            )));
        }
        if self.blocking.strategies.is_empty() {
            return Err(ConfigError::Invalid(
                "blocking.strategies must not be empty".into(),
            ));
        }
        self.similarity
            .weight_table()
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        self.similarity
            .scoring_config()
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        self.cluster_config()
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        // Building the strategies exercises their own validation.
        self.build_strategies()?;
        Ok(())
    }

    /// Instantiate the configured blocking strategies.
    pub fn build_strategies(&self) -> Result<Vec<Box<dyn BlockingStrategy>>, ConfigError> {
        self.blocking.strategies.iter().map(|s| s.build()).collect()
    }

    /// Instantiate the blocking engine.
    pub fn blocking_engine(&self) -> Result<BlockingEngine, ConfigError> {
        Ok(BlockingEngine::new(self.build_strategies()?)?)
    }

    pub fn graph_config(&self) -> GraphConfig {
        GraphConfig::new(self.edge_collection.clone())
            .with_threshold(self.clustering.edge_creation_threshold)
            .with_loading_method(self.edge_loading_method)
    }

    pub fn cluster_config(&self) -> ClusterConfig {
        let mut cfg = ClusterConfig::new(
            self.edge_collection.clone(),
            self.cluster_collection.clone(),
        )
        .with_size_bounds(
            self.clustering.min_cluster_size,
            self.clustering.max_cluster_size,
        )
        .with_oversize_policy(self.clustering.oversize_policy)
        .with_store_results(self.clustering.store_results);
        cfg.algorithm = self.clustering.algorithm;
        cfg.max_edges = self.clustering.max_edges;
        cfg.warn_edges = self.clustering.warn_edges;
        cfg
    }

    pub fn golden_config(&self) -> GoldenConfig {
        GoldenConfig::new(self.collection_name.clone(), self.golden_collection.clone())
            .with_policy(self.golden.fusion_policy())
            .with_store_results(self.golden.store_results)
    }

    /// SHA-256 of the canonical JSON serialization; embedded in reports so
    /// runs are comparable.
    pub fn config_hash(&self) -> String {
        let json = serde_json::to_vec(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&json);
        hex::encode(hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_YAML: &str = r#"
entity_type: customer
collection_name: customers
blocking:
  strategies:
    - type: exact
      field: email
    - type: composite
      name: last3_postal
      keys:
        - { field: last_name, transform: { prefix: 3 } }
        - { field: postal_code, transform: identity }
      max_block_size: 50
    - type: lsh
      num_hash_tables: 10
      num_hyperplanes: 8
      random_seed: 42
similarity:
  algorithm: fellegi_sunter
  upper_threshold: 3.5
  lower_threshold: -1.5
  batch_size: 1000
clustering:
  min_cluster_size: 2
  max_cluster_size: 100
  edge_creation_threshold: 0.7
golden:
  fusion_rules:
    address: { rule: longest_value }
    city: { rule: most_frequent }
edge_loading_method: api
"#;

    #[test]
    fn sample_yaml_parses_and_validates() {
        let config = PipelineConfig::from_yaml_str(SAMPLE_YAML).unwrap();
        assert_eq!(config.collection_name, "customers");
        assert_eq!(config.blocking.strategies.len(), 3);
        assert_eq!(config.similarity.batch_size, 1000);
        assert_eq!(
            config.golden.fusion_policy().rule_for("address").label(),
            "longest_value"
        );
        assert_eq!(config.edge_collection, "similarities");
    }

    #[test]
    fn defaults_produce_a_valid_config() {
        let config = PipelineConfig::for_collection("people");
        assert!(config.validate().is_ok());
        assert_eq!(config.blocking.strategies.len(), 2);
    }

    #[test]
    fn empty_collection_name_is_rejected() {
        let mut config = PipelineConfig::for_collection(" ");
        config.collection_name = "  ".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn unknown_algorithm_is_rejected() {
        let mut config = PipelineConfig::for_collection("people");
        config.similarity.algorithm = "magic".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn bad_strategy_params_fail_validation() {
        let mut config = PipelineConfig::for_collection("people");
        config.blocking.strategies = vec![StrategySpec::Lsh {
            num_hash_tables: 0,
            num_hyperplanes: 8,
            random_seed: 1,
        }];
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_hash_is_stable_and_sensitive() {
        let a = PipelineConfig::for_collection("people");
        let b = PipelineConfig::for_collection("people");
        assert_eq!(a.config_hash(), b.config_hash());
        let mut c = PipelineConfig::for_collection("people");
        c.clustering.min_cluster_size = 3;
        assert_ne!(a.config_hash(), c.config_hash());
    }

    #[test]
    fn malformed_yaml_is_a_parse_error() {
        let result = PipelineConfig::from_yaml_str("collection_name: [unclosed");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }
}
