use astdb_cache::{CacheManagerConfig, MultiLevelCache};
use astdb_core::{
    AstDbError, Embedder, EventBus, EngineEvent, Result, VectorMetadata, VectorMetadataPatch,
};
use astdb_vector::{
    QueryEngine, QueryOptions, Space, VectorDatabase, VectorDbConfig,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn meta(path: &str, confidence: f32) -> VectorMetadata {
    VectorMetadata {
        signature: "fn f()".into(),
        summary: "fixture".into(),
        file_id: "file".into(),
        file_path: path.into(),
        line: 1,
        confidence,
        last_updated: chrono::Utc::now(),
    }
}

fn config(dir: &TempDir, dimensions: usize, space: Space) -> VectorDbConfig {
    let mut config = VectorDbConfig::new(
        dimensions,
        dir.path().join("store.redb"),
        dir.path().join("index.bin"),
    );
    config.space = space;
    config
}

async fn open(dir: &TempDir, dimensions: usize, space: Space) -> Arc<VectorDatabase> {
    VectorDatabase::initialize(config(dir, dimensions, space), Arc::new(EventBus::new()))
        .await
        .unwrap()
}

/// Deterministic embedder: one-hot on the text length, so tests control
/// vectors exactly. Counts invocations for cache assertions.
struct FixtureEmbedder {
    dimensions: usize,
    calls: AtomicU64,
}

impl FixtureEmbedder {
    fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            calls: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl Embedder for FixtureEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts
            .iter()
            .map(|t| {
                let mut v = vec![0.0f32; self.dimensions];
                v[t.len() % self.dimensions] = 1.0;
                v
            })
            .collect())
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_name(&self) -> &str {
        "fixture"
    }
}

// Scenario 1: fresh database, insert one vector, exact-match search.
#[tokio::test]
async fn insert_then_search_exact_match() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir, 4, Space::Cosine).await;

    db.insert_vector("n1", vec![0.0, 0.0, 0.0, 1.0], meta("src/a.rs", 1.0))
        .await
        .unwrap();

    let results = db
        .search_similar(&[0.0, 0.0, 0.0, 1.0], Some(1), None)
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].node_id, "n1");
    assert!(results[0].distance.abs() < 1e-5);
    assert!((results[0].score - 1.0).abs() < 1e-5);
}

// Scenario 2: duplicate insert fails and changes nothing.
#[tokio::test]
async fn duplicate_insert_fails_and_count_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir, 4, Space::Cosine).await;

    db.insert_vector("n1", vec![0.0, 0.0, 0.0, 1.0], meta("src/a.rs", 1.0))
        .await
        .unwrap();
    let err = db
        .insert_vector("n1", vec![0.0, 1.0, 0.0, 0.0], meta("src/a.rs", 1.0))
        .await;
    assert!(matches!(err, Err(AstDbError::DuplicateNodeId(_))));
    assert_eq!(db.get_stats().await.unwrap().count, 1);
}

// Scenario 3: delete then re-insert issues a strictly greater label and
// the old vector is gone from search.
#[tokio::test]
async fn reinsert_after_delete_gets_greater_label() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir, 4, Space::Cosine).await;

    let original = db
        .insert_vector("n1", vec![0.0, 0.0, 0.0, 1.0], meta("src/a.rs", 1.0))
        .await
        .unwrap();
    assert!(db.delete_vector("n1").await.unwrap());
    let reissued = db
        .insert_vector("n1", vec![0.0, 1.0, 0.0, 0.0], meta("src/a.rs", 1.0))
        .await
        .unwrap();
    assert!(reissued > original);

    let results = db
        .search_similar(&[0.0, 0.0, 0.0, 1.0], Some(4), None)
        .await
        .unwrap();
    assert!(results.iter().all(|r| r.distance > 0.5));
}

#[tokio::test]
async fn delete_absent_returns_false() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir, 4, Space::Cosine).await;
    assert!(!db.delete_vector("ghost").await.unwrap());
}

#[tokio::test]
async fn batch_accounting_always_sums_to_batch_size() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir, 2, Space::L2).await;
    db.insert_vector("dup", vec![0.0, 1.0], meta("a.rs", 1.0))
        .await
        .unwrap();

    let batch: Vec<(String, Vec<f32>, VectorMetadata)> = vec![
        ("a".into(), vec![1.0, 0.0], meta("a.rs", 1.0)),
        ("dup".into(), vec![0.1, 0.9], meta("a.rs", 1.0)),
        ("b".into(), vec![0.0, 0.5], meta("b.rs", 1.0)),
        ("bad".into(), vec![0.5], meta("b.rs", 1.0)),
    ];
    let outcome = db
        .insert_vectors(batch, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome.success_count + outcome.failure_count, 4);
    assert_eq!(outcome.success_count, 2);
    let failing: Vec<&str> = outcome.failures.iter().map(|f| f.node_id.as_str()).collect();
    assert!(failing.contains(&"dup"));
    assert!(failing.contains(&"bad"));
}

#[tokio::test]
async fn update_replaces_embedding_and_merges_metadata() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir, 2, Space::L2).await;
    db.insert_vector("n", vec![1.0, 0.0], meta("a.rs", 0.5))
        .await
        .unwrap();

    db.update_vector(
        "n",
        Some(vec![0.0, 1.0]),
        Some(VectorMetadataPatch {
            confidence: Some(0.9),
            ..Default::default()
        }),
    )
    .await
    .unwrap();

    let results = db.search_similar(&[0.0, 1.0], Some(1), None).await.unwrap();
    assert_eq!(results[0].node_id, "n");
    assert!(results[0].distance < 1e-5);
    assert!((results[0].metadata.confidence - 0.9).abs() < 1e-6);

    let record = db.get_vector("n").await.unwrap().unwrap();
    assert_eq!(record.metadata.file_path, "a.rs");
}

// Property 5: rebuild preserves count and distances.
#[tokio::test]
async fn rebuild_preserves_counts_and_distances() {
    let dir = tempfile::tempdir().unwrap();
    let events = Arc::new(EventBus::new());
    let rx = events.subscribe();
    let db = VectorDatabase::initialize(config(&dir, 8, Space::Cosine), events)
        .await
        .unwrap();

    for i in 0..60u32 {
        let mut v = vec![0.05f32; 8];
        v[(i % 8) as usize] = 1.0 + (i as f32) * 0.01;
        db.insert_vector(&format!("n{}", i), v, meta("a.rs", 1.0))
            .await
            .unwrap();
    }
    db.delete_vector("n3").await.unwrap();

    let query = {
        let mut v = vec![0.0f32; 8];
        v[5] = 1.0;
        v
    };
    let before = db.search_similar(&query, Some(10), Some(128)).await.unwrap();
    let count_before = db.get_stats().await.unwrap().count;
    let version_before = db.index_version();

    let report = db.rebuild(&CancellationToken::new()).await.unwrap();
    assert_eq!(report.previous_count, report.new_count);
    assert_eq!(db.get_stats().await.unwrap().count, count_before);
    assert!(db.index_version() > version_before);

    let after = db.search_similar(&query, Some(10), Some(128)).await.unwrap();
    assert_eq!(
        before.iter().map(|r| &r.node_id).collect::<Vec<_>>(),
        after.iter().map(|r| &r.node_id).collect::<Vec<_>>()
    );
    for (b, a) in before.iter().zip(after.iter()) {
        assert!((b.distance - a.distance).abs() < 1e-5);
    }

    assert!(rx
        .try_iter()
        .any(|e| matches!(e, EngineEvent::IndexRebuilt { .. })));
}

#[tokio::test]
async fn rebuild_hook_fires_with_counts() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir, 2, Space::L2).await;
    db.insert_vector("n", vec![1.0, 0.0], meta("a.rs", 1.0))
        .await
        .unwrap();

    let seen = Arc::new(AtomicU64::new(u64::MAX));
    let seen_in_hook = Arc::clone(&seen);
    db.set_rebuild_hook(Arc::new(move |_prev: u64, new: u64| {
        seen_in_hook.store(new, Ordering::SeqCst);
    }));
    db.rebuild(&CancellationToken::new()).await.unwrap();
    assert_eq!(seen.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn capacity_overflow_triggers_transparent_rebuild() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(&dir, 2, Space::L2);
    cfg.max_elements = 4;
    let db = VectorDatabase::initialize(cfg, Arc::new(EventBus::new()))
        .await
        .unwrap();

    for i in 0..10u32 {
        db.insert_vector(&format!("n{}", i), vec![i as f32, 1.0], meta("a.rs", 1.0))
            .await
            .unwrap();
    }
    assert_eq!(db.get_stats().await.unwrap().count, 10);
}

#[tokio::test]
async fn persistence_round_trip_through_initialize() {
    let dir = tempfile::tempdir().unwrap();
    {
        let db = open(&dir, 4, Space::Cosine).await;
        for i in 0..20u32 {
            let mut v = vec![0.0f32; 4];
            v[(i % 4) as usize] = 1.0;
            db.insert_vector(&format!("n{}", i), v, meta("a.rs", 1.0))
                .await
                .unwrap();
        }
        db.save().await.unwrap();
    }

    let db = open(&dir, 4, Space::Cosine).await;
    assert_eq!(db.get_stats().await.unwrap().count, 20);
    let results = db
        .search_similar(&[1.0, 0.0, 0.0, 0.0], Some(3), None)
        .await
        .unwrap();
    assert!(!results.is_empty());

    let meta_json = std::fs::read_to_string(dir.path().join("index.meta.json")).unwrap();
    let meta: serde_json::Value = serde_json::from_str(&meta_json).unwrap();
    assert_eq!(meta["dimensions"], 4);
    assert_eq!(meta["count"], 20);
}

#[tokio::test]
async fn top_k_zero_and_count_boundaries() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir, 2, Space::L2).await;
    for i in 0..5u32 {
        db.insert_vector(&format!("n{}", i), vec![i as f32, 0.0], meta("a.rs", 1.0))
            .await
            .unwrap();
    }

    assert!(db
        .search_similar(&[0.0, 0.0], Some(0), None)
        .await
        .unwrap()
        .is_empty());
    assert_eq!(
        db.search_similar(&[0.0, 0.0], Some(1), None)
            .await
            .unwrap()
            .len(),
        1
    );
    assert_eq!(
        db.search_similar(&[0.0, 0.0], Some(5), Some(64))
            .await
            .unwrap()
            .len(),
        5
    );
}

// Scenario 4: repeated identical query served from cache, promotions
// observed on a lower-level hit.
#[tokio::test]
async fn repeated_query_hits_l1_and_skips_embedder() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir, 8, Space::Cosine).await;
    for i in 0..50u32 {
        let mut v = vec![0.01f32; 8];
        v[(i % 8) as usize] = 1.0;
        db.insert_vector(&format!("n{}", i), v, meta("src/mod.rs", 1.0))
            .await
            .unwrap();
    }

    let cache = Arc::new(
        MultiLevelCache::open(CacheManagerConfig::new(
            dir.path().join("l2"),
            dir.path().join("l3.db"),
        ))
        .unwrap(),
    );
    let embedder = Arc::new(FixtureEmbedder::new(8));
    let engine = QueryEngine::new(db, cache.clone(), embedder.clone(), 10);

    let first = engine
        .search("find the parser", QueryOptions::default())
        .await
        .unwrap();
    assert!(!first.log.cache_hit);
    assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);

    let second = engine
        .search("find the parser", QueryOptions::default())
        .await
        .unwrap();
    assert!(second.log.cache_hit);
    assert_eq!(second.log.cache_level.as_deref(), Some("l1"));
    assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);

    // Property 3: cached results are identical to the original search.
    assert_eq!(first.results.len(), second.results.len());
    for (a, b) in first.results.iter().zip(second.results.iter()) {
        assert_eq!(a.node_id, b.node_id);
        assert_eq!(a.distance.to_bits(), b.distance.to_bits());
        assert_eq!(a.score.to_bits(), b.score.to_bits());
    }

    let third = engine
        .search("find the parser", QueryOptions::default())
        .await
        .unwrap();
    assert!(third.log.cache_hit);

    let top = engine.top_queries(5).await.unwrap();
    assert_eq!(top[0].executions, 3);
}

#[tokio::test]
async fn post_filters_apply_before_top_k() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir, 4, Space::Cosine).await;
    db.insert_vector("keep", vec![1.0, 0.0, 0.0, 0.0], meta("src/core/a.rs", 0.9))
        .await
        .unwrap();
    db.insert_vector("skip", vec![0.9, 0.1, 0.0, 0.0], meta("tests/b.rs", 0.9))
        .await
        .unwrap();
    db.insert_vector("faint", vec![0.8, 0.2, 0.0, 0.0], meta("src/core/c.rs", 0.1))
        .await
        .unwrap();

    let cache = Arc::new(
        MultiLevelCache::open(CacheManagerConfig::new(
            dir.path().join("l2"),
            dir.path().join("l3.db"),
        ))
        .unwrap(),
    );
    let engine = QueryEngine::new(db, cache, Arc::new(FixtureEmbedder::new(4)), 10);

    let outcome = engine
        .search(
            "asdf",
            QueryOptions {
                file_path_regex: Some("^src/core/".to_string()),
                min_confidence: Some(0.5),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let ids: Vec<&str> = outcome.results.iter().map(|r| r.node_id.as_str()).collect();
    assert_eq!(ids, vec!["keep"]);
}

#[tokio::test]
async fn query_key_changes_with_index_version() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir, 4, Space::Cosine).await;
    db.insert_vector("n", vec![1.0, 0.0, 0.0, 0.0], meta("a.rs", 1.0))
        .await
        .unwrap();

    let cache = Arc::new(
        MultiLevelCache::open(CacheManagerConfig::new(
            dir.path().join("l2"),
            dir.path().join("l3.db"),
        ))
        .unwrap(),
    );
    let engine = QueryEngine::new(db.clone(), cache, Arc::new(FixtureEmbedder::new(4)), 10);

    let key_before = engine.cache_key("q", &QueryOptions::default());
    db.rebuild(&CancellationToken::new()).await.unwrap();
    let key_after = engine.cache_key("q", &QueryOptions::default());
    assert_ne!(key_before, key_after);
}

#[tokio::test]
async fn cancelled_rebuild_is_clean() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir, 2, Space::L2).await;
    for i in 0..1000u32 {
        db.insert_vector(&format!("n{}", i), vec![i as f32, 1.0], meta("a.rs", 1.0))
            .await
            .unwrap();
    }
    let cancel = CancellationToken::new();
    cancel.cancel();
    let result = db.rebuild(&cancel).await;
    assert!(matches!(result, Err(AstDbError::Cancelled)));
    // The old index still serves.
    assert_eq!(
        db.search_similar(&[1.0, 1.0], Some(1), None).await.unwrap().len(),
        1
    );
}

#[tokio::test]
async fn zero_vector_insert_is_valid_and_scores_zero() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir, 4, Space::Cosine).await;
    db.insert_vector("zero", vec![0.0; 4], meta("a.rs", 1.0))
        .await
        .unwrap();

    let results = db
        .search_similar(&[1.0, 0.0, 0.0, 0.0], Some(1), None)
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].score, 0.0);
}

#[tokio::test]
async fn dimension_mismatch_on_search_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir, 4, Space::Cosine).await;
    let err = db.search_similar(&[1.0, 0.0], Some(1), None).await;
    assert!(matches!(err, Err(AstDbError::DimensionMismatch { .. })));
}
