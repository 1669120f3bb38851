//! Pipeline orchestration.
//!
//! Drives blocking -> scoring -> graph build -> clustering -> golden records,
//! threading one config and one cancellation token through every stage
//! and collecting per-stage counters and timings into a report. The
//! orchestrator always returns a report: on a stage failure the report
//! names the stage and carries the counters accumulated so far.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use blocking::{BlockingOutcome, BlockingStats};
use cluster::{
    Cluster, ClusterEngine, ClusteringStats, EdgeInput, GraphBuilder, GraphStats,
};
use golden::{GoldenOutcome, GoldenRecordBuilder, GoldenRecord, GoldenStats};
use scoring::{ScoredPair, ScoringEngine, ScoringHooks, ScoringOutcome, ScoringStats};
use store::{CancelToken, DocumentStore};

use crate::config::{ConfigError, PipelineConfig};

/// Derived whole-run metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DerivedMetrics {
    pub reduction_ratio: f64,
    pub candidate_pairs_per_sec: f64,
    pub clusters_per_sec: f64,
    pub avg_cluster_size: f64,
    pub mean_golden_quality: f64,
}

/// Structured result of one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineReport {
    pub success: bool,
    pub cancelled: bool,
    /// Stage that failed, when `success` is false and not cancelled.
    pub failed_stage: Option<String>,
    pub error: Option<String>,
    pub entity_type: String,
    pub collection: String,
    /// SHA-256 of the canonical config serialization.
    pub config_hash: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub durations_ms: BTreeMap<String, u64>,
    pub blocking: Option<BlockingStats>,
    pub scoring: Option<ScoringStats>,
    pub graph: Option<GraphStats>,
    pub clustering: Option<ClusteringStats>,
    pub golden: Option<GoldenStats>,
    pub metrics: DerivedMetrics,
}

impl PipelineReport {
    fn new(config: &PipelineConfig) -> Self {
        Self {
            success: false,
            cancelled: false,
            failed_stage: None,
            error: None,
            entity_type: config.entity_type.clone(),
            collection: config.collection_name.clone(),
            config_hash: config.config_hash(),
            started_at: Utc::now(),
            finished_at: None,
            durations_ms: BTreeMap::new(),
            blocking: None,
            scoring: None,
            graph: None,
            clustering: None,
            golden: None,
            metrics: DerivedMetrics::default(),
        }
    }

    fn fail(&mut self, stage: &str, message: String) {
        error!(stage, "pipeline stage failed: {message}");
        self.failed_stage = Some(stage.to_string());
        self.error = Some(message);
        self.finished_at = Some(Utc::now());
    }

    fn mark_cancelled(&mut self) {
        info!("pipeline cancelled; returning partial report");
        self.cancelled = true;
        self.finished_at = Some(Utc::now());
    }
}

/// Report plus the in-memory artifacts of a successful run.
#[derive(Debug, Clone)]
pub struct PipelineRun {
    pub report: PipelineReport,
    pub clusters: Vec<Cluster>,
    pub golden_records: Vec<GoldenRecord>,
}

/// End-to-end entity resolution over one collection.
pub struct Pipeline {
    store: Arc<dyn DocumentStore>,
    config: PipelineConfig,
    hooks: ScoringHooks,
    cancel: CancelToken,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        config: PipelineConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            store,
            config,
            hooks: ScoringHooks::none(),
            cancel: CancelToken::new(),
        })
    }

    /// Install scoring hooks (type filter, acronym expansion, context).
    pub fn with_hooks(mut self, hooks: ScoringHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Token that cancels this run at the next suspension point.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run all stages. Always yields a report; `clusters` and
    /// `golden_records` are empty unless their stages completed.
    pub fn run(&self) -> PipelineRun {
        let mut report = PipelineReport::new(&self.config);
        let (clusters, golden_records) = self.run_stages(&mut report);
        PipelineRun {
            report,
            clusters,
            golden_records,
        }
    }

    fn run_stages(
        &self,
        report: &mut PipelineReport,
    ) -> (Vec<Cluster>, Vec<GoldenRecord>) {
        info!(
            collection = self.config.collection_name.as_str(),
            entity_type = self.config.entity_type.as_str(),
            "starting entity-resolution pipeline"
        );

        // Stage 1: blocking.
        let blocking_outcome = match self.timed(report, "blocking", |p| p.run_blocking()) {
            Ok(outcome) => outcome,
            Err(message) => {
                report.fail("blocking", message);
                return (Vec::new(), Vec::new());
            }
        };
        report.metrics.reduction_ratio = blocking_outcome.stats.reduction_ratio;
        report.blocking = Some(blocking_outcome.stats.clone());
        if self.cancel.is_cancelled() {
            report.mark_cancelled();
            return (Vec::new(), Vec::new());
        }

        // Stage 2: scoring.
        let scoring_outcome = match self.timed(report, "scoring", |p| {
            p.run_scoring(&blocking_outcome)
        }) {
            Ok(outcome) => outcome,
            Err(message) => {
                report.fail("scoring", message);
                return (Vec::new(), Vec::new());
            }
        };
        report.scoring = Some(scoring_outcome.stats);
        let scoring_secs = report
            .durations_ms
            .get("scoring")
            .map(|ms| *ms as f64 / 1000.0)
            .unwrap_or(0.0);
        if scoring_secs > 0.0 {
            report.metrics.candidate_pairs_per_sec =
                scoring_outcome.stats.input_pairs as f64 / scoring_secs;
        }
        if scoring_outcome.stats.cancelled || self.cancel.is_cancelled() {
            report.mark_cancelled();
            return (Vec::new(), Vec::new());
        }

        // Stage 3: graph build.
        let graph_stats = match self.timed(report, "graph", |p| {
            p.run_graph(&scoring_outcome.scored)
        }) {
            Ok(stats) => stats,
            Err(message) => {
                report.fail("graph", message);
                return (Vec::new(), Vec::new());
            }
        };
        report.graph = Some(graph_stats);
        if self.cancel.is_cancelled() {
            report.mark_cancelled();
            return (Vec::new(), Vec::new());
        }

        // Stage 4: clustering.
        let cluster_outcome = match self.timed(report, "clustering", |p| p.run_clustering()) {
            Ok(outcome) => outcome,
            Err(message) => {
                report.fail("clustering", message);
                return (Vec::new(), Vec::new());
            }
        };
        report.clustering = Some(cluster_outcome.stats.clone());
        let clustering_secs = report
            .durations_ms
            .get("clustering")
            .map(|ms| *ms as f64 / 1000.0)
            .unwrap_or(0.0);
        if clustering_secs > 0.0 {
            report.metrics.clusters_per_sec =
                cluster_outcome.clusters.len() as f64 / clustering_secs;
        }
        if !cluster_outcome.clusters.is_empty() {
            report.metrics.avg_cluster_size = cluster_outcome
                .clusters
                .iter()
                .map(|c| c.size as f64)
                .sum::<f64>()
                / cluster_outcome.clusters.len() as f64;
        }
        if cluster_outcome.stats.cancelled || self.cancel.is_cancelled() {
            report.mark_cancelled();
            return (cluster_outcome.clusters, Vec::new());
        }

        // Stage 5: golden records.
        let golden_outcome = match self.timed(report, "golden", |p| {
            p.run_golden(&cluster_outcome.clusters)
        }) {
            Ok(outcome) => outcome,
            Err(message) => {
                report.fail("golden", message);
                return (cluster_outcome.clusters, Vec::new());
            }
        };
        report.golden = Some(golden_outcome.stats.clone());
        report.metrics.mean_golden_quality = golden_outcome.stats.mean_quality;

        if golden_outcome.stats.cancelled {
            report.mark_cancelled();
        } else {
            report.success = true;
            report.finished_at = Some(Utc::now());
        }
        info!(
            pairs = blocking_outcome.pairs.len(),
            clusters = cluster_outcome.clusters.len(),
            golden_records = golden_outcome.records.len(),
            success = report.success,
            "pipeline finished"
        );
        (cluster_outcome.clusters, golden_outcome.records)
    }

    fn timed<T>(
        &self,
        report: &mut PipelineReport,
        stage: &str,
        f: impl FnOnce(&Self) -> Result<T, String>,
    ) -> Result<T, String> {
        let start = Instant::now();
        let result = f(self);
        report
            .durations_ms
            .insert(stage.to_string(), start.elapsed().as_millis() as u64);
        result
    }

    fn run_blocking(&self) -> Result<BlockingOutcome, String> {
        let engine = self.config.blocking_engine().map_err(|e| e.to_string())?;
        engine
            .run(self.store.as_ref(), &self.config.collection_name)
            .map_err(|e| e.to_string())
    }

    fn run_scoring(&self, blocking: &BlockingOutcome) -> Result<ScoringOutcome, String> {
        let engine = ScoringEngine::new(
            self.store.clone(),
            self.config.similarity.weight_table(),
            self.config.similarity.scoring_config(),
        )
        .map_err(|e| e.to_string())?
        .with_hooks(self.hooks.clone());
        engine
            .score_pairs(&self.config.collection_name, &blocking.pairs, &self.cancel)
            .map_err(|e| e.to_string())
    }

    fn run_graph(&self, scored: &[ScoredPair]) -> Result<GraphStats, String> {
        let builder = GraphBuilder::new(self.store.clone(), self.config.graph_config());
        builder
            .build(scored.iter().map(|s| EdgeInput {
                from: s.pair.id_a.clone(),
                to: s.pair.id_b.clone(),
                weight: s.normalized_score,
                confidence: s.confidence,
            }))
            .map_err(|e| e.to_string())
    }

    fn run_clustering(&self) -> Result<cluster::ClusterOutcome, String> {
        let engine = ClusterEngine::new(self.store.clone(), self.config.cluster_config())
            .map_err(|e| e.to_string())?;
        engine.run(&self.cancel).map_err(|e| e.to_string())
    }

    fn run_golden(&self, clusters: &[Cluster]) -> Result<GoldenOutcome, String> {
        let builder = GoldenRecordBuilder::new(self.store.clone(), self.config.golden_config())
            .map_err(|e| e.to_string())?;
        builder
            .build(clusters, &self.cancel)
            .map_err(|e| e.to_string())
    }
}

// Re-exported so callers can reference stats types without importing the
// stage crates directly.
pub use cluster::ClusterOutcome;
