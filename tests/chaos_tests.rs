// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Chaos tests: simulate failures and verify graceful degradation.
//!
//! These tests verify the system handles failures without panics, deadlocks,
//! lost entries or reordering.
//!
//! Run with: cargo test --test chaos_tests -- --nocapture

mod common;

use common::{produce, Harness, LOCAL, NS, TOPIC};
use replication_dispatch::{
    circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError},
    CursorConfig, CursorKey, CursorStore, DispatchRatePolicy, ReplicationError, ReplicatorStatus,
    ServiceState,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tokio::time::{sleep, timeout, Instant};

// =============================================================================
// Remote Cluster Failures
// =============================================================================

/// Test: Intermittent send failures are retried, nothing is lost or reordered.
#[tokio::test(start_paused = true)]
async fn flaky_remote_retries_without_loss() {
    let h = Harness::start(&[LOCAL, "r2"], CursorConfig::disabled()).await;
    let topic = h.topic().await;
    let replicator = topic.replicators().get("r2").cloned().unwrap();

    h.target.fail_next(2);
    produce(&h.log(), 30, 64).await;

    h.target.wait_for_count("r2", 30).await;
    assert_eq!(h.target.positions("r2"), (0..30).collect::<Vec<_>>());
    assert_eq!(h.target.attempts(), 32);
    assert_eq!(replicator.send_failures(), 2);
    assert!(!replicator.is_degraded());
    h.shutdown().await;
}

/// Test: A dead remote opens the circuit; recovery drains the backlog in order.
///
/// Uses real time: the breaker's recovery timeout is wall-clock.
#[tokio::test]
async fn dead_remote_opens_circuit_then_recovers() {
    let h = Harness::start(&[LOCAL, "r2"], CursorConfig::disabled()).await;
    let topic = h.topic().await;
    let replicator = topic.replicators().get("r2").cloned().unwrap();

    h.target.set_failing(true);
    produce(&h.log(), 10, 64).await;

    let deadline = Instant::now() + Duration::from_secs(5);
    while replicator.send_failures() < 5 && Instant::now() < deadline {
        sleep(Duration::from_millis(20)).await;
    }
    assert!(replicator.send_failures() >= 5);
    assert!(replicator.is_degraded());
    assert_eq!(replicator.acked_position(), 0);
    assert_eq!(h.target.count("r2"), 0);

    h.target.set_failing(false);
    timeout(Duration::from_secs(5), replicator.wait_for_acked(10))
        .await
        .expect("backlog should drain once the remote recovers")
        .unwrap();
    assert_eq!(h.target.positions("r2"), (0..10).collect::<Vec<_>>());
    assert!(!replicator.is_degraded());
    h.shutdown().await;
}

/// Test: One failing destination does not hold back the others.
#[tokio::test]
async fn failing_destination_is_isolated() {
    let h = Harness::start(&[LOCAL, "r2", "r3"], CursorConfig::disabled()).await;
    let topic = h.topic().await;
    let r2 = topic.replicators().get("r2").cloned().unwrap();
    let r3 = topic.replicators().get("r3").cloned().unwrap();

    h.target.set_cluster_failing("r2", true);
    produce(&h.log(), 20, 64).await;

    timeout(Duration::from_secs(5), r3.wait_for_acked(20))
        .await
        .expect("healthy destination should not wait on the failing one")
        .unwrap();
    assert_eq!(h.target.positions("r3"), (0..20).collect::<Vec<_>>());
    assert_eq!(h.target.count("r2"), 0);
    assert!(!r3.is_degraded());

    let deadline = Instant::now() + Duration::from_secs(5);
    while !r2.is_degraded() && Instant::now() < deadline {
        sleep(Duration::from_millis(10)).await;
    }
    assert!(r2.is_degraded());

    h.target.set_cluster_failing("r2", false);
    timeout(Duration::from_secs(5), r2.wait_for_acked(20))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(h.target.positions("r2"), (0..20).collect::<Vec<_>>());
    h.shutdown().await;
}

// =============================================================================
// Storage Failures
// =============================================================================

/// Test: Log read failures back off and retry without skipping entries.
#[tokio::test(start_paused = true)]
async fn log_read_failures_are_retried() {
    let h = Harness::start(&[LOCAL, "r2"], CursorConfig::disabled()).await;
    let log = h.log();
    produce(&log, 10, 32).await;
    log.fail_next_reads(5);

    h.topic().await;
    h.target.wait_for_count("r2", 10).await;
    assert_eq!(h.target.positions("r2"), (0..10).collect::<Vec<_>>());
    h.shutdown().await;
}

/// Test: Checkpoint recovery after crash
///
/// Simulates a crash by not flushing, then verifies the store recovers the
/// last persisted position (entries after it are re-sent, never skipped).
#[tokio::test]
async fn cursor_crash_recovery() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("cursors.db");
    let key = CursorKey::new(TOPIC, "r2");

    // Phase 1: Write some checkpoints and flush
    {
        let store = CursorStore::new(&db_path).await.unwrap();
        store.set(&key, 100).await;
        store.flush_dirty().await.unwrap();
        store.set(&key, 200).await;
        store.flush_dirty().await.unwrap();

        // Write position 300 but DON'T flush (simulates crash)
        store.set(&key, 300).await;
    }

    // Phase 2: Recover and verify
    {
        let store = CursorStore::new(&db_path).await.unwrap();
        assert_eq!(store.get(&key).await, Some(200));
        assert_eq!(store.get(&CursorKey::new(TOPIC, "r3")).await, None);
    }
}

/// Test: Rapid checkpoint updates coalesce into one row
#[tokio::test]
async fn cursor_rapid_updates() {
    let dir = tempdir().unwrap();
    let store = CursorStore::new(dir.path().join("cursors.db")).await.unwrap();
    let key = CursorKey::new(TOPIC, "r2");

    for i in 0..1000 {
        store.set(&key, i).await;
    }
    assert_eq!(store.dirty_count().await, 1);

    let flushed = store.flush_dirty().await.unwrap();
    assert_eq!(flushed, 1);
    assert_eq!(store.get(&key).await, Some(999));
    store.close().await;
}

// =============================================================================
// Policy Store Failures
// =============================================================================

/// Test: While the store is unreachable, throttling stays in force.
#[tokio::test(start_paused = true)]
async fn policy_store_outage_keeps_throttling() {
    let h = Harness::start(&[LOCAL, "r2"], CursorConfig::disabled()).await;
    let version = h
        .store
        .set_replicator_dispatch_rate(NS, DispatchRatePolicy::messages(5, 360))
        .unwrap();
    let topic = h.topic().await;
    h.wait_applied(version).await;

    h.store.set_unavailable(true);
    let removed = h.store.remove_replicator_dispatch_rate(NS).unwrap();

    produce(&h.log(), 20, 64).await;
    sleep(Duration::from_secs(30)).await;

    let replicator = topic.replicators().get("r2").cloned().unwrap();
    assert_eq!(replicator.rate_limiter().unwrap().dispatch_rate_on_msg(), 5);
    assert_eq!(h.target.count("r2"), 5);
    assert!(h.service.watcher().failures(NS) > 0);
    assert!(h.service.watcher().last_known_good(NS).is_some());

    // Back online: the removal lands and the backlog drains.
    h.store.set_unavailable(false);
    h.wait_applied(removed).await;
    assert!(replicator.rate_limiter().is_none());
    h.target.wait_for_count("r2", 20).await;
    assert_eq!(h.target.positions("r2"), (0..20).collect::<Vec<_>>());
    h.shutdown().await;
}

/// Test: Topic load fails cleanly while the store is down.
#[tokio::test(start_paused = true)]
async fn topic_load_during_store_outage() {
    let h = Harness::start(&[LOCAL, "r2"], CursorConfig::disabled()).await;
    h.store.set_unavailable(true);

    let result = h.service.get_or_create_topic(TOPIC).await;
    assert!(matches!(result, Err(ReplicationError::PolicyStore { .. })));
    assert!(result.unwrap_err().is_retryable());
    assert!(h.service.topic(TOPIC).is_none());

    h.store.set_unavailable(false);
    assert_eq!(h.topic().await.replicators().len(), 1);
    h.shutdown().await;
}

/// Test: Policy flapping during dispatch never loses or reorders entries.
#[tokio::test(start_paused = true)]
async fn policy_flapping_during_dispatch() {
    let h = Harness::start(&[LOCAL, "r2"], CursorConfig::disabled()).await;
    let topic = h.topic().await;
    produce(&h.log(), 200, 64).await;

    for i in 0..50 {
        let version = if i % 2 == 0 {
            h.store
                .set_replicator_dispatch_rate(NS, DispatchRatePolicy::new(10 + i, 4096, 1))
                .unwrap()
        } else {
            h.store.remove_replicator_dispatch_rate(NS).unwrap()
        };
        h.wait_applied(version).await;
        sleep(Duration::from_millis(50)).await;
    }

    h.target.wait_for_count("r2", 200).await;
    assert_eq!(h.target.positions("r2"), (0..200).collect::<Vec<_>>());
    assert!(topic.replicators().get("r2").unwrap().rate_limiter().is_none());
    h.shutdown().await;
}

// =============================================================================
// Shutdown
// =============================================================================

/// Test: Shutdown while throttled is prompt and loses nothing.
#[tokio::test]
async fn shutdown_while_throttled_resumes_later() {
    let dir = tempdir().unwrap();
    let cursor = CursorConfig {
        enabled: true,
        sqlite_path: dir.path().join("cursors.db").to_string_lossy().to_string(),
        wal_mode: true,
        flush_interval: "1s".to_string(),
    };

    let h = Harness::start(&[LOCAL, "r2"], cursor.clone()).await;
    h.store
        .set_replicator_dispatch_rate(NS, DispatchRatePolicy::messages(5, 3600))
        .unwrap();
    let (store, logs) = (h.store.clone(), h.logs.clone());

    let topic = h.topic().await;
    let replicator = topic.replicators().get("r2").cloned().unwrap();
    produce(&h.log(), 12, 64).await;
    timeout(Duration::from_secs(5), replicator.wait_for_status(ReplicatorStatus::Throttled))
        .await
        .unwrap()
        .unwrap();

    let started = std::time::Instant::now();
    let mut state = h.service.state_receiver();
    h.shutdown().await;
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(*state.borrow_and_update(), ServiceState::Stopped);
    assert_eq!(replicator.status(), ReplicatorStatus::Stopped);
    assert_eq!(replicator.acked_position(), 5);

    // The rest goes out after a restart, starting right after the checkpoint.
    store.remove_replicator_dispatch_rate(NS).unwrap();
    let h = Harness::start_with(store, logs, cursor).await;
    h.topic().await;
    assert!(h.target.wait_for_count_within("r2", 7, Duration::from_secs(5)).await);
    assert_eq!(h.target.positions("r2"), (5..12).collect::<Vec<_>>());
    h.shutdown().await;
}

/// Test: A topic is loaded exactly once under concurrent requests.
#[tokio::test(start_paused = true)]
async fn concurrent_topic_loads() {
    let h = Arc::new(Harness::start(&[LOCAL, "r2"], CursorConfig::disabled()).await);

    let loads = (0..16).map(|_| {
        let h = Arc::clone(&h);
        tokio::spawn(async move { h.service.get_or_create_topic(TOPIC).await.unwrap() })
    });
    let topics: Vec<_> = futures::future::join_all(loads)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    assert!(topics.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    assert_eq!(h.service.topic_names(), vec![TOPIC.to_string()]);
    Arc::try_unwrap(h).ok().unwrap().shutdown().await;
}

/// Test: A topic loaded while the namespace churns ends on the newest policies.
#[tokio::test(start_paused = true)]
async fn topic_load_races_policy_refresh() {
    let h = Arc::new(Harness::start(&[LOCAL, "r2", "r3"], CursorConfig::disabled()).await);
    produce(&h.log(), 20, 64).await;

    let churn = {
        let h = Arc::clone(&h);
        tokio::spawn(async move {
            let mut last = 0;
            for i in 0..5i64 {
                let clusters: &[&str] = if i % 2 == 0 { &[LOCAL, "r2"] } else { &[LOCAL, "r2", "r3"] };
                h.store.set_replication_clusters(NS, clusters.iter().copied()).unwrap();
                last = h
                    .store
                    .set_replicator_dispatch_rate(NS, DispatchRatePolicy::messages(100 + i, 1))
                    .unwrap();
                let _ = h.service.watcher().refresh(NS).await;
                tokio::task::yield_now().await;
            }
            last
        })
    };

    let topic = h.topic().await;
    let last = churn.await.unwrap();
    h.wait_applied(last).await;

    assert_eq!(topic.policy_version(), last);
    assert_eq!(topic.dispatch_rate(), Some(DispatchRatePolicy::messages(104, 1)));
    assert_eq!(topic.replicators().keys().collect::<Vec<_>>(), vec!["r2"]);
    let r2 = topic.replicators().get("r2").cloned().unwrap();
    assert_eq!(r2.rate_limiter().unwrap().dispatch_rate_on_msg(), 104);

    drop(topic);
    drop(r2);
    Arc::try_unwrap(h).ok().unwrap().shutdown().await;
}

// =============================================================================
// Circuit Breaker
// =============================================================================

/// Test: Circuit breaker opens after repeated failures
#[tokio::test]
async fn circuit_breaker_opens_on_failures() {
    let config = CircuitConfig {
        failure_threshold: 3,
        success_threshold: 1,
        recovery_timeout: Duration::from_millis(100),
    };
    let breaker = CircuitBreaker::new("pulsar/ns/t->r2", config);
    let attempts = Arc::new(AtomicU32::new(0));

    for _ in 0..3 {
        let attempts = attempts.clone();
        let result: Result<(), CircuitError<&str>> = breaker
            .call(|| async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err("remote down")
            })
            .await;
        assert!(result.is_err());
    }

    // Next call is rejected without reaching the remote.
    let before = attempts.load(Ordering::SeqCst);
    let attempts_inner = attempts.clone();
    let result: Result<(), CircuitError<&str>> = breaker
        .call(|| async move {
            attempts_inner.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await;
    assert!(result.unwrap_err().is_rejected());
    assert_eq!(attempts.load(Ordering::SeqCst), before);

    // After the recovery timeout a probe goes through.
    sleep(Duration::from_millis(150)).await;
    let result: Result<(), CircuitError<&str>> = breaker.call(|| async { Ok(()) }).await;
    assert!(result.is_ok());
}
