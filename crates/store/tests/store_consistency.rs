//! Cross-module consistency: atomic writes, locking, corruption scans, and
//! the tiered manager working against one docs tree.

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;
use tempfile::TempDir;

use waypoint_store::{
    paths, AtomicStore, CorruptionDetector, LockManager, LockOptions, StoreError,
    TieredOptions, TieredStateManager, WriteOptions,
};

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[tokio::test]
async fn interrupted_write_leaves_old_content_intact() {
    init_logs();
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join(paths::STORIES_FILE);
    let store = AtomicStore::new();
    let opts = WriteOptions::default();

    store
        .write_json(&path, &json!({"stories": [1, 2, 3]}), &opts)
        .await
        .expect("write");

    // Simulate a crashed writer: a stray temp file next to the target.
    let stray = path
        .parent()
        .expect("parent")
        .join(".tmp_stories.json_999999");
    std::fs::write(&stray, b"{\"stories\": [").expect("stray tmp");

    let back: serde_json::Value = store.read_json(&path).await.expect("read");
    assert_eq!(back, json!({"stories": [1, 2, 3]}), "target never sees partial data");

    // The scanner ignores the stray temp file too.
    let detector = CorruptionDetector::new(Arc::new(AtomicStore::new()));
    let reports = detector
        .scan_directory(dir.path())
        .await
        .expect("scan");
    assert_eq!(reports.len(), 1);
    assert!(reports[0].is_healthy(), "issues: {:?}", reports[0].issues);
}

#[tokio::test]
async fn concurrent_writers_serialize_through_the_sidecar_lock() {
    init_logs();
    let dir = TempDir::new().expect("tempdir");
    let path = Arc::new(dir.path().join("counter.json"));
    let store = Arc::new(AtomicStore::new());

    // One registry per writer, so exclusion runs through the on-disk
    // sidecar rather than in-process deduplication.
    let mut handles = Vec::new();
    for i in 0..8u32 {
        let store = Arc::clone(&store);
        let path = Arc::clone(&path);
        handles.push(tokio::spawn(async move {
            let manager = LockManager::new();
            let opts = LockOptions {
                retry_delay: Duration::from_millis(10),
                ..Default::default()
            };
            let result = manager
                .with_lock(&path, &opts, || async {
                    let current: serde_json::Value = match store.read_json(&path).await {
                        Ok(v) => v,
                        Err(StoreError::NotFound { .. }) => json!({"writes": []}),
                        Err(e) => return Err(e),
                    };
                    let mut writes = current["writes"].as_array().cloned().unwrap_or_default();
                    writes.push(json!(i));
                    store
                        .write_json(
                            path.as_ref(),
                            &json!({"writes": writes}),
                            &WriteOptions {
                                backup: false,
                                ..Default::default()
                            },
                        )
                        .await
                })
                .await;
            let held = manager.held_count().await;
            manager.shutdown().await;
            result.map(|()| held)
        }));
    }
    for handle in handles {
        let held = handle.await.expect("join").expect("locked write");
        assert_eq!(held, 0, "nothing left held after with_lock");
    }

    let final_doc: serde_json::Value = store.read_json(&path).await.expect("read");
    assert_eq!(
        final_doc["writes"].as_array().map(|w| w.len()),
        Some(8),
        "every writer's update survived"
    );
}

#[tokio::test]
async fn tiered_manager_and_detector_agree_on_checksums() {
    init_logs();
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("doc.json");
    let store = Arc::new(AtomicStore::new());
    let tiered = TieredStateManager::new(Arc::clone(&store), TieredOptions::default());

    tiered
        .write_json(&path, &json!({"v": 1}), &WriteOptions::default())
        .await
        .expect("write");

    let detector = CorruptionDetector::new(Arc::clone(&store));
    let report = detector.scan_file(&path, None).await;
    assert!(report.is_healthy(), "issues: {:?}", report.issues);
    assert_eq!(report.checksum, store.recorded_checksum(&path));
}

#[tokio::test]
async fn lock_contention_times_out_with_context() {
    init_logs();
    let dir = TempDir::new().expect("tempdir");
    let target = dir.path().join("contended.json");
    let manager = LockManager::new();

    manager
        .lock(&target, &LockOptions::default())
        .await
        .expect("first lock");

    // A second registry simulates another process wanting the same file.
    let other = LockManager::new();
    let opts = LockOptions {
        timeout: Duration::from_millis(250),
        retry_delay: Duration::from_millis(50),
        ..Default::default()
    };
    let err = other
        .lock(&target, &opts)
        .await
        .expect_err("held elsewhere");
    match err {
        // Same-pid sidecar reads as held, so the retry loop runs out.
        StoreError::LockTimeout { attempts, .. } => assert!(attempts >= 2),
        StoreError::LockConflict { .. } => {}
        other => panic!("unexpected error: {other:?}"),
    }

    manager.unlock(&target).await.expect("unlock");
    other
        .lock(&target, &opts)
        .await
        .expect("acquirable after release");
    other.shutdown().await;
    manager.shutdown().await;
}
