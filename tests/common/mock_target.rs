// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Recording `ReplicationTarget` for testing.
//!
//! Records every acknowledged send with the (tokio) instant it happened, so
//! tests can assert ordering and throttling windows. Sends can be made to
//! fail, either for the next N calls or until switched back.

use replication_dispatch::{BoxFuture, LogEntry, ReplicationError, ReplicationTarget};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// An acknowledged send.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub topic: String,
    pub position: u64,
    pub bytes: usize,
    pub at: Instant,
}

pub struct RecordingTarget {
    deliveries: Mutex<HashMap<String, Vec<Delivery>>>,
    /// Total acknowledged sends, for waiting.
    total: watch::Sender<usize>,
    fail_next: AtomicUsize,
    fail_all: AtomicBool,
    failing_clusters: Mutex<HashSet<String>>,
    attempts: AtomicUsize,
}

impl RecordingTarget {
    pub fn new() -> Self {
        Self {
            deliveries: Mutex::new(HashMap::new()),
            total: watch::channel(0).0,
            fail_next: AtomicUsize::new(0),
            fail_all: AtomicBool::new(false),
            failing_clusters: Mutex::new(HashSet::new()),
            attempts: AtomicUsize::new(0),
        }
    }

    /// Fail the next `count` sends (any cluster).
    pub fn fail_next(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Fail every send until switched off.
    pub fn set_failing(&self, failing: bool) {
        self.fail_all.store(failing, Ordering::SeqCst);
    }

    /// Fail every send to `cluster` until switched off.
    pub fn set_cluster_failing(&self, cluster: &str, failing: bool) {
        let mut clusters = self.failing_clusters.lock().unwrap();
        if failing {
            clusters.insert(cluster.to_string());
        } else {
            clusters.remove(cluster);
        }
    }

    /// Send attempts, including failed ones.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn deliveries(&self, cluster: &str) -> Vec<Delivery> {
        self.deliveries
            .lock()
            .unwrap()
            .get(cluster)
            .cloned()
            .unwrap_or_default()
    }

    pub fn positions(&self, cluster: &str) -> Vec<u64> {
        self.deliveries(cluster).iter().map(|d| d.position).collect()
    }

    pub fn count(&self, cluster: &str) -> usize {
        self.deliveries
            .lock()
            .unwrap()
            .get(cluster)
            .map_or(0, Vec::len)
    }

    /// Deliveries to `cluster` at or before `deadline`.
    pub fn count_until(&self, cluster: &str, deadline: Instant) -> usize {
        self.deliveries(cluster).iter().filter(|d| d.at <= deadline).count()
    }

    /// Wait until `cluster` has received `count` entries.
    pub async fn wait_for_count(&self, cluster: &str, count: usize) {
        let mut rx = self.total.subscribe();
        loop {
            if self.count(cluster) >= count {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// `wait_for_count` bounded by `limit`; returns whether it completed.
    pub async fn wait_for_count_within(&self, cluster: &str, count: usize, limit: Duration) -> bool {
        tokio::time::timeout(limit, self.wait_for_count(cluster, count))
            .await
            .is_ok()
    }

    fn should_fail(&self, cluster: &str) -> bool {
        if self.fail_all.load(Ordering::SeqCst) || self.failing_clusters.lock().unwrap().contains(cluster) {
            return true;
        }
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for RecordingTarget {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplicationTarget for RecordingTarget {
    fn send<'a>(&'a self, cluster: &'a str, topic: &'a str, entry: &'a LogEntry) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.should_fail(cluster) {
                return Err(ReplicationError::remote(cluster, "injected failure"));
            }

            self.deliveries
                .lock()
                .unwrap()
                .entry(cluster.to_string())
                .or_default()
                .push(Delivery {
                    topic: topic.to_string(),
                    position: entry.position,
                    bytes: entry.size(),
                    at: Instant::now(),
                });
            self.total.send_modify(|n| *n += 1);
            Ok(())
        })
    }
}
