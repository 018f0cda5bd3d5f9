use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use larder::application::diagnostics::Diagnostics;
use larder::application::repos::{KeyValueStore, SetMode};
use larder::application::retrieval::{RetrievalConfig, RetrievalEngine};
use larder::application::token::OsTokenSource;
use larder::cache::{CacheAside, CacheConfig, FetchOptions, FetchRequest};
use larder::coordination::{
    AcquireOptions, DequeueOptions, DistributedMutex, LockConfig, QueueConfig, ReturnPredicate,
    WorkQueue,
};
use larder::domain::condition::ConditionSet;
use larder::domain::key::KeyColumn;
use larder::domain::task::TaskOptions;
use larder::infra::memory::{MemoryKv, MemoryTables};
use metrics_util::debugging::DebuggingRecorder;
use serde_json::{Value, json};
use serial_test::serial;

fn request(target: Value) -> FetchRequest {
    FetchRequest {
        targets: vec![target],
        key_columns: vec![KeyColumn::new("id").expect("column")],
        table: "orders".to_string(),
        namespace: Some("cache:orders:".to_string()),
        columns: Vec::new(),
    }
}

#[tokio::test]
#[serial]
async fn core_paths_emit_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");

    let rows = vec![
        json!({"id": 1, "status": "open", "note": "x".repeat(64)}),
        json!({"id": 2, "status": "paid", "note": ""}),
    ]
    .into_iter()
    .filter_map(|value| value.as_object().cloned())
    .collect();
    let tables = Arc::new(MemoryTables::new().with_table("orders", rows));
    let kv = Arc::new(MemoryKv::new());
    let engine = Arc::new(RetrievalEngine::new(
        tables.clone(),
        RetrievalConfig::default(),
    ));

    // miss then hit
    let cache = CacheAside::new(engine.clone(), kv.clone(), CacheConfig::default());
    for _ in 0..2 {
        cache
            .get_or_fetch(&request(json!(2)), &FetchOptions::default())
            .await
            .expect("fetch");
    }

    // cached row failing the caller's conditions
    kv.set(
        "cache:orders:3",
        r#"{"id": 3, "status": "open"}"#,
        SetMode::Always,
        None,
    )
    .await
    .expect("seed");
    let options = FetchOptions {
        conditions: ConditionSet::from_json(&json!([["status", "paid", "="]])).expect("conditions"),
        ..FetchOptions::default()
    };
    cache
        .get_or_fetch(&request(json!(3)), &options)
        .await
        .expect("fetch");

    // row too large to cache
    let tight = CacheAside::new(
        engine.clone(),
        kv.clone(),
        CacheConfig {
            max_entry_bytes: 16,
            ..CacheConfig::default()
        },
    );
    tight
        .get_or_fetch(&request(json!(1)), &FetchOptions::default())
        .await
        .expect("fetch");

    // unreachable store
    tables.set_offline(true);
    cache
        .get_or_fetch(&request(json!(9)), &FetchOptions::default())
        .await
        .expect("fetch");

    let mutex = DistributedMutex::new(kv.clone(), Arc::new(OsTokenSource), LockConfig::default());
    mutex
        .acquire(
            &["metrics".to_string()],
            None,
            &AcquireOptions {
                random_delay: Some(Duration::ZERO),
                ..AcquireOptions::default()
            },
        )
        .await;

    let queue = WorkQueue::new(kv, Arc::new(OsTokenSource), QueueConfig::default());
    let jobs = vec!["jobs".to_string()];
    queue
        .enqueue(&jobs, json!({}), &TaskOptions::default(), Diagnostics::default())
        .await;
    queue
        .dequeue(
            &jobs,
            &ReturnPredicate::new(),
            &DequeueOptions {
                timeout: Some(Duration::ZERO),
                ..DequeueOptions::default()
            },
        )
        .await;

    let names: HashSet<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();

    let expected = [
        "larder_cache_hit_total",
        "larder_cache_miss_total",
        "larder_cache_excluded_total",
        "larder_cache_oversized_total",
        "larder_store_error_total",
        "larder_lock_attempt_total",
        "larder_queue_delivery_total",
        "larder_retrieve_ms",
    ];

    for metric in expected {
        assert!(names.contains(metric), "missing metric: {metric}");
    }
}
