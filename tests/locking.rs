//! Key locks, lock timeouts and cancellation.

mod common;

use common::{key_owned_by, node, start_cluster, start_cluster_with};
use std::time::Duration;
use tessera::commands::{Command, Flag, Key};
use tessera::core::config::CacheMode;
use tessera::core::error::CacheError;
use tessera::invocation::Canceller;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_increments_are_serialized_on_the_primary() {
    let runtime = start_cluster(CacheMode::DistSync, &["a", "b", "c"]);
    let key = key_owned_by(&runtime, &["a", "b"]);

    let mut tasks = Vec::new();
    for i in 0..30 {
        let submitter = runtime.nodes()[i % 3].clone();
        let key = key.clone();
        tasks.push(tokio::spawn(async move { submitter.increment(key, 1).await }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    for owner in ["a", "b"] {
        let stored = node(&runtime, owner).container().peek(&key).unwrap();
        assert_eq!(stored.value, "30", "owner {}", owner);
        assert_eq!(stored.version, 30, "owner {}", owner);
    }
    assert!(node(&runtime, "a").components().locks.is_empty());
}

#[tokio::test]
async fn held_lock_times_out_writers() {
    let runtime = start_cluster_with(CacheMode::Local, &["a"], |config| {
        config.locking.lock_acquisition_timeout_ms = 30;
    });
    let cache = node(&runtime, "a");
    let key = Key::from_static(b"hot");

    let held = cache
        .components()
        .locks
        .acquire(&key, Duration::from_secs(5))
        .await
        .unwrap();

    let err = cache.put(key.clone(), "v").await.unwrap_err();
    assert!(matches!(err, CacheError::LockTimeout { timeout_ms: 30, .. }), "got {:?}", err);
    assert!(err.is_retriable());

    // Reads never lock.
    assert_eq!(cache.get(key.clone()).await.unwrap(), None);

    drop(held);
    assert_eq!(cache.put(key.clone(), "v").await.unwrap(), None);
    assert_eq!(cache.get(key).await.unwrap().unwrap(), "v");
}

#[tokio::test]
async fn only_the_primary_locks() {
    let runtime = start_cluster_with(CacheMode::DistSync, &["a", "b", "c"], |config| {
        config.locking.lock_acquisition_timeout_ms = 30;
    });
    let key = key_owned_by(&runtime, &["a", "b"]);

    // A lock held on the backup does not block replication.
    let _held = node(&runtime, "b")
        .components()
        .locks
        .acquire(&key, Duration::from_secs(5))
        .await
        .unwrap();
    node(&runtime, "c").put(key.clone(), "v").await.unwrap();
    assert_eq!(node(&runtime, "b").container().peek(&key).unwrap().value, "v");
}

#[tokio::test]
async fn skip_locking_bypasses_a_held_lock() {
    let runtime = start_cluster_with(CacheMode::Local, &["a"], |config| {
        config.locking.lock_acquisition_timeout_ms = 30;
    });
    let cache = node(&runtime, "a");
    let key = Key::from_static(b"hot");
    let _held = cache
        .components()
        .locks
        .acquire(&key, Duration::from_secs(5))
        .await
        .unwrap();

    let command = Command::put(key.clone(), "v").flag(Flag::SkipLocking);
    cache.execute(command).await.unwrap();
    assert_eq!(cache.container().peek(&key).unwrap().value, "v");
}

#[tokio::test]
async fn cancelled_lock_wait_leaves_nothing_behind() {
    let runtime = start_cluster(CacheMode::Local, &["a"]);
    let cache = node(&runtime, "a").clone();
    let key = Key::from_static(b"hot");

    let held = cache
        .components()
        .locks
        .acquire(&key, Duration::from_secs(5))
        .await
        .unwrap();

    let (canceller, handle) = Canceller::new();
    let waiter = {
        let cache = cache.clone();
        let key = key.clone();
        tokio::spawn(async move {
            cache
                .execute_cancellable(Command::put(key, "v"), handle)
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    canceller.cancel();
    let err = waiter.await.unwrap().unwrap_err();
    assert!(matches!(err, CacheError::Cancelled));
    assert!(!err.is_retriable());

    drop(held);
    assert!(cache.components().locks.is_empty());
    assert!(cache.container().peek(&key).is_none());
}
