//! Failure semantics: stage errors, skips, safety limits, cancellation,
//! and the bulk-fetch round-trip budget.

use std::sync::Arc;

use entlink::blocking::KeyPart;
use entlink::cluster::{
    ClusterConfig, ClusterEngine, EdgeInput, GraphBuilder, GraphConfig,
};
use entlink::store::{CancelToken, DocumentStore, InMemoryStore, OnConflict, Record};
use entlink::{Pipeline, PipelineConfig, StrategySpec};

fn seeded_people(n: usize, shared_postal: &str) -> Arc<InMemoryStore> {
    let store = InMemoryStore::new();
    store.create_collection("people").unwrap();
    let records: Vec<Record> = (0..n)
        .map(|i| {
            Record::new(format!("people/{i:04}"), "people")
                .with_field("first_name", format!("First{i}"))
                .with_field("last_name", format!("Last{i}"))
                .with_field("postal_code", shared_postal)
                .with_field("email", format!("user{i}@example.com"))
        })
        .collect();
    store
        .insert_many("people", records, OnConflict::Replace)
        .unwrap();
    Arc::new(store)
}

#[test]
fn missing_text_index_aborts_with_blocking_stage_error() {
    let store = seeded_people(5, "10001");
    let mut config = PipelineConfig::for_collection("people");
    config.blocking.strategies = vec![StrategySpec::Text {
        index: "does_not_exist".to_string(),
        fields: vec!["last_name".to_string()],
        limit_per_entity: None,
        min_score: None,
    }];

    let pipeline = Pipeline::new(store, config).unwrap();
    let run = pipeline.run();
    assert!(!run.report.success);
    assert_eq!(run.report.failed_stage.as_deref(), Some("blocking"));
    let error = run.report.error.unwrap();
    assert!(error.contains("not_found"), "got: {error}");
    // Partial report: later stages never ran.
    assert!(run.report.scoring.is_none());
    assert!(run.report.clustering.is_none());
}

#[test]
fn oversized_block_is_skipped_counted_and_survivable() {
    // 500 records share one postal code; the postal blocker must discard
    // the block, not sample it, and the run still succeeds.
    let store = seeded_people(500, "10001");
    let mut config = PipelineConfig::for_collection("people");
    config.blocking.strategies = vec![
        StrategySpec::Composite {
            name: "postal".to_string(),
            keys: vec![KeyPart::new(
                "postal_code",
                entlink::blocking::KeyTransform::Identity,
            )],
            max_block_size: Some(100),
        },
        StrategySpec::Exact {
            field: "email".to_string(),
            max_block_size: None,
        },
    ];

    let pipeline = Pipeline::new(store, config).unwrap();
    let run = pipeline.run();
    assert!(run.report.success, "error: {:?}", run.report.error);
    let blocking = run.report.blocking.unwrap();
    let postal = &blocking.per_strategy["postal"];
    assert_eq!(postal.pairs_emitted, 0);
    assert_eq!(postal.oversized_blocks_skipped, 1);
    // Unique emails: the exact strategy contributes nothing either.
    assert_eq!(blocking.unique_pairs, 0);
}

#[test]
fn clustering_round_trips_are_constant_not_per_vertex() {
    // 10k vertices, 15k edges: the regression guard for the N+1 access
    // pattern. The whole component computation must cost one scan.
    let store = Arc::new(InMemoryStore::new());
    let builder = GraphBuilder::new(
        store.clone() as Arc<dyn DocumentStore>,
        GraphConfig::new("similarities").with_threshold(0.0),
    );
    let inputs: Vec<EdgeInput> = (0..15_000u64)
        .filter_map(|i| {
            let from = format!("v{}", i % 10_000);
            let to = format!("v{}", (i * 7919 + 13) % 10_000);
            (from != to).then(|| EdgeInput {
                from,
                to,
                weight: 0.9,
                confidence: 0.9,
            })
        })
        .collect();
    builder.build(inputs).unwrap();

    store.reset_op_counts();
    let engine = ClusterEngine::new(
        store.clone() as Arc<dyn DocumentStore>,
        ClusterConfig::new("similarities", "clusters")
            .with_size_bounds(2, 20_000)
            .with_store_results(false),
    )
    .unwrap();
    let outcome = engine.run(&CancelToken::new()).unwrap();
    assert!(outcome.stats.vertices > 5_000);

    let counts = store.op_counts();
    assert_eq!(counts.scan, 1, "edge fetch must be a single bulk scan");
    assert_eq!(counts.get_many, 0, "no per-vertex fetches allowed");
    assert_eq!(outcome.stats.fetch_round_trips, 1);
}

#[test]
fn cancellation_returns_partial_report_and_keeps_prior_edges() {
    let store = Arc::new(InMemoryStore::new());
    store.create_collection("people").unwrap();
    store
        .insert_many(
            "people",
            vec![
                Record::new("people/1", "people")
                    .with_field("first_name", "John")
                    .with_field("last_name", "Smith")
                    .with_field("email", "john@acme.com"),
                Record::new("people/2", "people")
                    .with_field("first_name", "Jon")
                    .with_field("last_name", "Smith")
                    .with_field("email", "john@acme.com"),
            ],
            OnConflict::Replace,
        )
        .unwrap();

    // First run completes and writes edges + clusters.
    let pipeline = Pipeline::new(
        store.clone(),
        PipelineConfig::for_collection("people"),
    )
    .unwrap();
    let first = pipeline.run();
    assert!(first.report.success);
    let edges_before = store.count("similarities").unwrap();
    assert!(edges_before > 0);

    // Second run is cancelled before scoring consumes anything.
    let mut config = PipelineConfig::for_collection("people");
    config.cluster_collection = "clusters_second".to_string();
    let cancelled = Pipeline::new(store.clone(), config).unwrap();
    cancelled.cancel_token().cancel();
    let run = cancelled.run();

    assert!(!run.report.success);
    assert!(run.report.cancelled);
    assert!(run.clusters.is_empty());
    assert!(
        !store.has_collection("clusters_second").unwrap(),
        "no cluster writes after cancellation"
    );
    // Idempotent edge writes from the first run are untouched.
    assert_eq!(store.count("similarities").unwrap(), edges_before);
}

#[test]
fn malformed_records_are_skipped_not_fatal() {
    let store = Arc::new(InMemoryStore::new());
    store.create_collection("people").unwrap();
    store
        .insert_many(
            "people",
            vec![
                Record::new("people/1", "people")
                    .with_field("first_name", "John")
                    .with_field("last_name", "Smith")
                    .with_field("email", "john@acme.com"),
                Record::new("people/2", "people")
                    .with_field("first_name", "Jon")
                    .with_field("last_name", "Smith")
                    .with_field("email", "john@acme.com"),
                // No usable blocking fields at all.
                Record::new("people/3", "people").with_field("misc", 42i64),
            ],
            OnConflict::Replace,
        )
        .unwrap();

    let pipeline = Pipeline::new(store, PipelineConfig::for_collection("people")).unwrap();
    let run = pipeline.run();
    assert!(run.report.success, "error: {:?}", run.report.error);
    let blocking = run.report.blocking.unwrap();
    assert!(blocking.per_strategy["phonetic"].records_skipped >= 1);
    assert_eq!(run.clusters.len(), 1);
}

#[test]
fn scoring_skips_pairs_with_vanished_records() {
    use entlink::blocking::CandidatePair;
    use entlink::scoring::{ScoringConfig, ScoringEngine};
    use entlink::similarity::WeightTable;

    let store = Arc::new(InMemoryStore::new());
    store.create_collection("people").unwrap();
    store
        .insert_many(
            "people",
            vec![Record::new("people/1", "people").with_field("email", "a@b.com")],
            OnConflict::Replace,
        )
        .unwrap();

    let engine = ScoringEngine::new(
        store,
        WeightTable::person_default(),
        ScoringConfig::default(),
    )
    .unwrap();
    let pairs = vec![
        CandidatePair::new("people/1", "people/gone", "exact_email", None).unwrap(),
    ];
    let outcome = engine
        .score_pairs("people", &pairs, &CancelToken::new())
        .unwrap();
    assert_eq!(outcome.stats.pairs_missing_records, 1);
    assert!(outcome.scored.is_empty());
}

#[test]
fn invalid_config_never_starts_a_pipeline() {
    let store = Arc::new(InMemoryStore::new());
    let mut config = PipelineConfig::for_collection("people");
    config.similarity.batch_size = 0;
    assert!(Pipeline::new(store, config).is_err());
}
