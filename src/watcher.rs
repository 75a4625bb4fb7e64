// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Namespace policy propagation.
//!
//! The [`PolicyWatcher`] keeps loaded topics in line with their namespace
//! policies. One background task drives it:
//!
//! ```text
//!            ┌──────────── change feed (namespace) ────────────┐
//!  PolicyStore                                                 ▼
//!            └◀── namespace_policies(ns) ──── PolicyWatcher ── poll tick (all namespaces)
//!                                                │
//!                        for every loaded topic of ns:
//!                        apply_dispatch_rate + reconcile_clusters
//!                                                │
//!                                    applied_version(ns) ◀── observers
//! ```
//!
//! # Idempotence
//!
//! Topics ignore snapshots that are not newer than what they reflect, and
//! limiters ignore structurally equal policies, so duplicate notifications
//! and overlapping polls are no-ops.
//!
//! # Store Failures
//!
//! A failed fetch keeps the last known-good configuration in force (nothing
//! is touched, throttling is never dropped) and schedules a retry of that
//! namespace with exponential backoff.
//!
//! # Observing Propagation
//!
//! [`applied_version`](PolicyWatcher::applied_version) is a watch channel per
//! namespace; [`wait_for_version`](PolicyWatcher::wait_for_version) resolves
//! once a given store version has been applied to every loaded topic.

use crate::config::WatcherConfig;
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::policy::{NamespacePolicies, VersionedPolicies};
use crate::policy_store::PolicyStore;
use crate::resilience::RetryConfig;
use crate::topic::Topic;
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, info_span, warn, Instrument};

/// Per-namespace propagation state.
struct NamespaceState {
    applied: watch::Sender<u64>,
    last_good: Option<NamespacePolicies>,
    failures: usize,
    retry_at: Option<Instant>,
}

impl NamespaceState {
    fn new() -> Self {
        Self {
            applied: watch::channel(0).0,
            last_good: None,
            failures: 0,
            retry_at: None,
        }
    }
}

/// Fans namespace policy changes out to loaded topics.
pub struct PolicyWatcher {
    store: Arc<dyn PolicyStore>,
    topics: Arc<DashMap<String, Arc<Topic>>>,
    config: WatcherConfig,
    retry: RetryConfig,
    namespaces: DashMap<String, NamespaceState>,
}

impl PolicyWatcher {
    /// `topics` is the broker's table of loaded topics, keyed by full name.
    pub fn new(store: Arc<dyn PolicyStore>, topics: Arc<DashMap<String, Arc<Topic>>>, config: WatcherConfig) -> Self {
        let retry = config.retry_config();
        Self {
            store,
            topics,
            config,
            retry,
            namespaces: DashMap::new(),
        }
    }

    /// Version of the last snapshot applied for `namespace` (0 = none yet).
    pub fn applied_version(&self, namespace: &str) -> watch::Receiver<u64> {
        self.namespaces
            .entry(namespace.to_string())
            .or_insert_with(NamespaceState::new)
            .applied
            .subscribe()
    }

    /// Wait until store version `version` (or newer) of `namespace` is applied.
    pub async fn wait_for_version(&self, namespace: &str, version: u64) -> Result<()> {
        let mut rx = self.applied_version(namespace);
        rx.wait_for(|applied| *applied >= version)
            .await
            .map(|_| ())
            .map_err(|_| ReplicationError::Shutdown)
    }

    /// Last policies successfully fetched for `namespace`.
    pub fn last_known_good(&self, namespace: &str) -> Option<NamespacePolicies> {
        self.namespaces.get(namespace).and_then(|s| s.last_good.clone())
    }

    /// Consecutive failed fetches of `namespace`.
    pub fn failures(&self, namespace: &str) -> usize {
        self.namespaces.get(namespace).map_or(0, |s| s.failures)
    }

    /// Namespaces with at least one loaded topic.
    pub fn watched_namespaces(&self) -> BTreeSet<String> {
        self.topics
            .iter()
            .map(|t| t.value().namespace().to_string())
            .collect()
    }

    fn topics_of(&self, namespace: &str) -> Vec<Arc<Topic>> {
        self.topics
            .iter()
            .filter(|t| t.value().namespace() == namespace)
            .map(|t| Arc::clone(t.value()))
            .collect()
    }

    /// Record that a topic was loaded with `versioned`, so observers waiting
    /// for that version are released.
    pub(crate) fn note_loaded(&self, namespace: &str, versioned: &VersionedPolicies) {
        let mut state = self
            .namespaces
            .entry(namespace.to_string())
            .or_insert_with(NamespaceState::new);
        if state.last_good.is_none() {
            state.last_good = Some(versioned.policies.clone());
        }
        state.applied.send_if_modified(|v| {
            if versioned.version > *v {
                *v = versioned.version;
                true
            } else {
                false
            }
        });
    }

    /// Fetch `namespace` and apply it to its loaded topics.
    ///
    /// Returns the applied store version, or `None` if the namespace no
    /// longer exists (the current configuration is kept). A store failure
    /// is returned after scheduling a backoff retry.
    pub async fn refresh(&self, namespace: &str) -> Result<Option<u64>> {
        let fetched = match self.store.namespace_policies(namespace).await {
            Ok(fetched) => fetched,
            Err(e) => {
                self.record_failure(namespace, &e);
                return Err(e);
            }
        };

        let Some(versioned) = fetched else {
            self.clear_failure(namespace);
            warn!(namespace, "Namespace missing from policy store, keeping current configuration");
            return Ok(None);
        };

        let mut applied_to = 0;
        for topic in self.topics_of(namespace) {
            match topic.apply_policies(&versioned).await {
                Ok(true) => applied_to += 1,
                Ok(false) => {}
                Err(ReplicationError::InvalidPolicy(reason)) => {
                    warn!(namespace, topic = %topic.name(), %reason, "Rejected invalid dispatch rate, keeping previous");
                    metrics::record_policy_rejected(namespace);
                }
                Err(e) => {
                    warn!(namespace, topic = %topic.name(), error = %e, "Failed to apply namespace policies");
                }
            }
        }

        {
            let mut state = self
                .namespaces
                .entry(namespace.to_string())
                .or_insert_with(NamespaceState::new);
            state.failures = 0;
            state.retry_at = None;
            state.last_good = Some(versioned.policies.clone());
            state.applied.send_if_modified(|v| {
                if versioned.version > *v {
                    *v = versioned.version;
                    true
                } else {
                    false
                }
            });
        }

        if applied_to > 0 {
            info!(namespace, version = versioned.version, topics = applied_to, "Namespace policies applied");
            metrics::record_policy_applied(namespace);
        } else {
            debug!(namespace, version = versioned.version, "Namespace policies unchanged");
        }
        Ok(Some(versioned.version))
    }

    /// Refresh every watched namespace.
    pub async fn refresh_all(&self) {
        for namespace in self.watched_namespaces() {
            // Failures are logged and scheduled for retry inside refresh().
            let _ = self.refresh(&namespace).await;
        }
    }

    fn record_failure(&self, namespace: &str, error: &ReplicationError) {
        let mut state = self
            .namespaces
            .entry(namespace.to_string())
            .or_insert_with(NamespaceState::new);
        state.failures += 1;
        let delay = self.retry.delay_for_attempt(state.failures);
        state.retry_at = Some(Instant::now() + delay);

        warn!(
            namespace,
            error = %error,
            failures = state.failures,
            retry_in_ms = delay.as_millis() as u64,
            "Policy store fetch failed, keeping last known-good policies"
        );
        metrics::record_policy_fetch_failure(namespace);
    }

    fn clear_failure(&self, namespace: &str) {
        if let Some(mut state) = self.namespaces.get_mut(namespace) {
            state.failures = 0;
            state.retry_at = None;
        }
    }

    fn next_retry(&self) -> Option<Instant> {
        self.namespaces.iter().filter_map(|s| s.retry_at).min()
    }

    /// Drop state of namespaces with no loaded topic. Entries someone still
    /// observes through [`applied_version`](Self::applied_version) are kept,
    /// but their retry schedule is cleared.
    pub(crate) fn forget_unwatched(&self) {
        let watched = self.watched_namespaces();
        self.namespaces.retain(|namespace, state| {
            if watched.contains(namespace) {
                return true;
            }
            state.failures = 0;
            state.retry_at = None;
            state.applied.receiver_count() > 0
        });
    }

    async fn retry_due(&self) {
        self.forget_unwatched();
        let now = Instant::now();
        let due: Vec<String> = self
            .namespaces
            .iter()
            .filter(|s| s.retry_at.map_or(false, |at| at <= now))
            .map(|s| s.key().clone())
            .collect();

        for namespace in due {
            debug!(namespace = %namespace, "Retrying policy fetch");
            let _ = self.refresh(&namespace).await;
        }
    }

    /// Spawn the watcher task. It runs until `shutdown_rx` turns `true`.
    pub fn spawn(self: &Arc<Self>, shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        let watcher = Arc::clone(self);
        tokio::spawn(async move { watcher.run(shutdown_rx).await })
    }

    async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let span = info_span!("policy_watcher");

        async move {
            let poll_interval = self.config.poll_interval_duration();
            let mut changes = self.store.subscribe();
            info!(
                poll_interval_ms = poll_interval.as_millis() as u64,
                notifications = changes.is_some(),
                "Starting policy watcher"
            );

            let mut poll = tokio::time::interval_at(Instant::now() + poll_interval, poll_interval);
            poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                let next_retry = self.next_retry();

                tokio::select! {
                    biased;

                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }

                    change = next_change(&mut changes) => match change {
                        Ok(namespace) => {
                            if self.watched_namespaces().contains(&namespace) {
                                debug!(namespace = %namespace, "Policy change notification");
                                let _ = self.refresh(&namespace).await;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "Policy change feed lagged, refreshing all namespaces");
                            self.refresh_all().await;
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            warn!("Policy change feed closed, falling back to polling");
                            changes = None;
                        }
                    },

                    _ = poll.tick() => {
                        debug!("Polling namespace policies");
                        self.refresh_all().await;
                    }

                    _ = sleep_until_opt(next_retry) => {
                        self.retry_due().await;
                    }
                }
            }

            info!("Policy watcher stopped");
        }
        .instrument(span)
        .await
    }
}

/// Next change notification, or never when there is no feed.
async fn next_change(
    changes: &mut Option<broadcast::Receiver<String>>,
) -> std::result::Result<String, broadcast::error::RecvError> {
    match changes {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
