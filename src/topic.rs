// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Loaded topics and their replicator registry.
//!
//! A [`Topic`] owns one replicator per remote cluster of its namespace,
//! kept in configuration order:
//!
//! ```text
//! namespace clusters: [r1, r2, r3]     local cluster: r1
//!
//! Topic persistent://pulsar/ns/t
//!   ├── [0] r2 ─ dispatch task ─▶ remote r2
//!   └── [1] r3 ─ dispatch task ─▶ remote r3
//! ```
//!
//! # Reconciliation
//!
//! [`Topic::reconcile_clusters`] diffs the replicator set against a new
//! cluster list: removed destinations are stopped and their checkpoints
//! deleted, new destinations get a replicator that starts from their last
//! checkpoint (or the start of the log). Survivors are untouched.
//!
//! # Dispatch Rate
//!
//! The topic remembers the namespace's current dispatch rate so that a
//! replicator created later is throttled before its first send.

use crate::config::DispatchConfig;
use crate::cursor::{CursorKey, CursorLeases, CursorStore, ReplicatorCursor};
use crate::error::{ReplicationError, Result};
use crate::log::ManagedLog;
use crate::metrics;
use crate::policy::{DispatchRatePolicy, TopicName, VersionedPolicies};
use crate::remote::ReplicationTarget;
use crate::replicator::{Replicator, ReplicatorHandle, ReplicatorShared};
use futures::future::join_all;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{debug, info, warn};

/// Everything a topic needs to run replicators, shared by all topics of a broker.
#[derive(Clone)]
pub struct TopicContext {
    pub(crate) local_cluster: String,
    pub(crate) target: Arc<dyn ReplicationTarget>,
    pub(crate) leases: CursorLeases,
    pub(crate) store: Option<Arc<CursorStore>>,
    pub(crate) dispatch: DispatchConfig,
}

impl TopicContext {
    pub fn new(local_cluster: impl Into<String>, target: Arc<dyn ReplicationTarget>, dispatch: DispatchConfig) -> Self {
        Self {
            local_cluster: local_cluster.into(),
            target,
            leases: CursorLeases::new(),
            store: None,
            dispatch,
        }
    }

    /// Checkpoint cursors in `store`.
    pub fn with_cursor_store(mut self, store: Arc<CursorStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Share a lease table (one per broker).
    pub fn with_leases(mut self, leases: CursorLeases) -> Self {
        self.leases = leases;
        self
    }

    pub fn local_cluster(&self) -> &str {
        &self.local_cluster
    }
}

/// Ordered snapshot of a topic's replicators, keyed by destination cluster.
#[derive(Debug, Clone, Default)]
pub struct Replicators {
    entries: Vec<ReplicatorHandle>,
}

impl Replicators {
    pub fn get(&self, cluster: &str) -> Option<&ReplicatorHandle> {
        self.entries.iter().find(|h| h.cluster() == cluster)
    }

    /// Handles in configuration order.
    pub fn values(&self) -> std::slice::Iter<'_, ReplicatorHandle> {
        self.entries.iter()
    }

    /// Destination clusters in configuration order.
    pub fn keys(&self) -> impl Iterator<Item = &str> + '_ {
        self.entries.iter().map(|h| h.cluster())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ReplicatorHandle)> + '_ {
        self.entries.iter().map(|h| (h.cluster(), h))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A loaded topic.
pub struct Topic {
    name: TopicName,
    ctx: TopicContext,
    log: Arc<dyn ManagedLog>,
    /// Rate applied to every replicator, including ones created later.
    dispatch_rate: Mutex<Option<DispatchRatePolicy>>,
    replicators: RwLock<Vec<Replicator>>,
    /// Version of the namespace policies the topic reflects.
    policy_version: AtomicU64,
    /// Serializes reconcile/unload; `true` once unloaded.
    lifecycle: tokio::sync::Mutex<bool>,
    /// Held across a whole `apply_policies` so snapshots land in version order.
    applying: tokio::sync::Mutex<()>,
}

impl Topic {
    /// Load a topic: apply the namespace's dispatch rate, then start one
    /// replicator per remote cluster.
    pub async fn load(
        name: TopicName,
        log: Arc<dyn ManagedLog>,
        versioned: &VersionedPolicies,
        ctx: TopicContext,
    ) -> Result<Arc<Self>> {
        let policies = &versioned.policies;
        let dispatch_rate = match policies.replicator_dispatch_rate {
            Some(policy) => match policy.validate() {
                Ok(()) => Some(policy),
                Err(e) => {
                    warn!(topic = %name, error = %e, "Ignoring invalid dispatch rate");
                    metrics::record_policy_rejected(name.namespace());
                    None
                }
            },
            None => None,
        };

        let topic = Arc::new(Self {
            name,
            ctx,
            log,
            dispatch_rate: Mutex::new(dispatch_rate),
            replicators: RwLock::new(Vec::new()),
            policy_version: AtomicU64::new(versioned.version),
            lifecycle: tokio::sync::Mutex::new(false),
            applying: tokio::sync::Mutex::new(()),
        });

        topic.reconcile_clusters(&policies.replication_clusters).await?;
        info!(
            topic = %topic.name,
            replicators = topic.replicators().len(),
            throttled = dispatch_rate.map_or(false, |p| p.is_throttling()),
            "Topic loaded"
        );
        Ok(topic)
    }

    pub fn name(&self) -> &TopicName {
        &self.name
    }

    /// `tenant/namespace` of the topic.
    pub fn namespace(&self) -> &str {
        self.name.namespace()
    }

    /// Dispatch rate currently applied to the topic's replicators.
    pub fn dispatch_rate(&self) -> Option<DispatchRatePolicy> {
        *self.dispatch_rate.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of the replicators, in configuration order.
    pub fn replicators(&self) -> Replicators {
        let replicators = self.replicators.read().unwrap_or_else(PoisonError::into_inner);
        Replicators {
            entries: replicators.iter().map(|r| r.handle().clone()).collect(),
        }
    }

    /// Version of the namespace policies this topic reflects.
    pub fn policy_version(&self) -> u64 {
        self.policy_version.load(Ordering::Acquire)
    }

    /// Apply a namespace policy snapshot: dispatch rate first (so replicators
    /// started by the reconciliation are throttled from their first send),
    /// then the cluster list.
    ///
    /// Snapshots not newer than [`policy_version`](Self::policy_version) are
    /// ignored. An invalid dispatch rate is reported but does not block the
    /// cluster update. Returns whether the snapshot was applied.
    pub async fn apply_policies(&self, versioned: &VersionedPolicies) -> Result<bool> {
        let _applying = self.applying.lock().await;
        if versioned.version <= self.policy_version() {
            return Ok(false);
        }

        let rate = self.apply_dispatch_rate(versioned.policies.replicator_dispatch_rate.as_ref());
        let clusters = self
            .reconcile_clusters(&versioned.policies.replication_clusters)
            .await;
        self.policy_version.store(versioned.version, Ordering::Release);

        rate?;
        clusters?;
        Ok(true)
    }

    pub async fn is_unloaded(&self) -> bool {
        *self.lifecycle.lock().await
    }

    /// Apply a dispatch rate (`None` = no policy) to every replicator.
    ///
    /// An invalid policy is rejected before any replicator is touched.
    /// Returns how many limiters changed.
    pub fn apply_dispatch_rate(&self, policy: Option<&DispatchRatePolicy>) -> Result<usize> {
        if let Some(p) = policy {
            p.validate()?;
        }

        let mut current = self.dispatch_rate.lock().unwrap_or_else(PoisonError::into_inner);
        *current = policy.copied();

        let replicators = self.replicators.read().unwrap_or_else(PoisonError::into_inner);
        let mut changed = 0;
        for replicator in replicators.iter() {
            if replicator.handle().configure_dispatch_rate(policy)? {
                changed += 1;
            }
        }

        if changed > 0 {
            info!(topic = %self.name, changed, policy = ?policy, "Dispatch rate applied");
        }
        Ok(changed)
    }

    /// Bring the replicator set in line with `clusters` (the local cluster
    /// is ignored). Removed destinations are stopped and forgotten,
    /// including their checkpoints; new ones are started.
    pub async fn reconcile_clusters(&self, clusters: &[String]) -> Result<()> {
        let unloaded = self.lifecycle.lock().await;
        if *unloaded {
            return Err(ReplicationError::InvalidState {
                expected: "loaded topic".to_string(),
                actual: "unloaded".to_string(),
            });
        }

        let mut desired: Vec<&str> = Vec::new();
        for cluster in clusters {
            let cluster = cluster.as_str();
            if cluster != self.ctx.local_cluster && !desired.contains(&cluster) {
                desired.push(cluster);
            }
        }

        let removed: Vec<Replicator> = {
            let mut replicators = self.replicators.write().unwrap_or_else(PoisonError::into_inner);
            let (keep, removed): (Vec<Replicator>, Vec<Replicator>) = std::mem::take(&mut *replicators)
                .into_iter()
                .partition(|r| desired.contains(&r.cluster()));
            *replicators = keep;
            removed
        };

        if !removed.is_empty() {
            let clusters: Vec<String> = removed.iter().map(|r| r.cluster().to_string()).collect();
            info!(topic = %self.name, ?clusters, "Stopping replicators for removed clusters");

            let drain = self.ctx.dispatch.drain_timeout_duration();
            join_all(removed.into_iter().map(|r| r.stop(drain))).await;

            if let Some(store) = &self.ctx.store {
                for cluster in &clusters {
                    if let Err(e) = store.delete(&CursorKey::new(self.name.as_str(), cluster.as_str())).await {
                        warn!(topic = %self.name, cluster = %cluster, error = %e, "Failed to delete checkpoint");
                    }
                }
            }
        }

        let existing: Vec<String> = self.replicators().keys().map(str::to_string).collect();
        let mut first_error = None;
        for cluster in desired {
            if existing.iter().any(|c| c == cluster) {
                continue;
            }
            if let Err(e) = self.start_replicator(cluster).await {
                warn!(topic = %self.name, cluster, error = %e, "Failed to start replicator");
                first_error.get_or_insert(e);
            }
        }

        // Keep configuration order: survivors and new replicators follow the cluster list.
        {
            let mut replicators = self.replicators.write().unwrap_or_else(PoisonError::into_inner);
            replicators.sort_by_key(|r| {
                clusters
                    .iter()
                    .position(|c| c == r.cluster())
                    .unwrap_or(usize::MAX)
            });
        }

        debug!(topic = %self.name, clusters = ?self.replicators().keys().collect::<Vec<_>>(), "Replicators reconciled");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn start_replicator(&self, cluster: &str) -> Result<()> {
        let key = CursorKey::new(self.name.as_str(), cluster);
        let cursor = ReplicatorCursor::open(key, Arc::clone(&self.log), &self.ctx.leases, self.ctx.store.clone()).await?;

        let shared = Arc::new(ReplicatorShared::new(
            self.name.as_str(),
            cluster,
            cursor.position(),
            self.ctx.dispatch.circuit_config(),
        ));
        let handle = ReplicatorHandle::new(shared);

        // Configure and register under the rate lock so a concurrent
        // apply_dispatch_rate either sees this replicator or ran before it.
        let current = self.dispatch_rate.lock().unwrap_or_else(PoisonError::into_inner);
        handle.configure_dispatch_rate(current.as_ref())?;
        let replicator = Replicator::spawn(
            handle,
            cursor,
            Arc::clone(&self.ctx.target),
            self.ctx.dispatch.clone(),
        );
        self.replicators
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(replicator);
        Ok(())
    }

    /// Stop every replicator (bounded drain each) and refuse further
    /// reconciliation. Checkpoints are kept.
    pub async fn unload(&self) {
        let mut unloaded = self.lifecycle.lock().await;
        if *unloaded {
            return;
        }
        *unloaded = true;

        let replicators = std::mem::take(&mut *self.replicators.write().unwrap_or_else(PoisonError::into_inner));
        let count = replicators.len();
        let drain = self.ctx.dispatch.drain_timeout_duration();
        join_all(replicators.into_iter().map(|r| r.stop(drain))).await;

        info!(topic = %self.name, replicators = count, "Topic unloaded");
    }
}

impl std::fmt::Debug for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Topic")
            .field("name", &self.name.as_str())
            .field("dispatch_rate", &self.dispatch_rate())
            .field("replicators", &self.replicators().keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::InMemoryLog;
    use crate::policy::NamespacePolicies;
    use crate::remote::NoOpTarget;
    use crate::replicator::ReplicatorStatus;

    const TOPIC: &str = "persistent://pulsar/ns/t";

    fn ctx() -> TopicContext {
        TopicContext::new("r1", Arc::new(NoOpTarget), DispatchConfig::for_testing())
    }

    fn policies(clusters: &[&str], rate: Option<DispatchRatePolicy>) -> VersionedPolicies {
        versioned(1, clusters, rate)
    }

    fn versioned(version: u64, clusters: &[&str], rate: Option<DispatchRatePolicy>) -> VersionedPolicies {
        let mut policies = NamespacePolicies::default();
        policies.set_clusters(clusters.iter().copied());
        policies.replicator_dispatch_rate = rate;
        VersionedPolicies { version, policies }
    }

    fn clusters(list: &[&str]) -> Vec<String> {
        list.iter().map(|c| c.to_string()).collect()
    }

    async fn load(p: &VersionedPolicies, ctx: TopicContext) -> (Arc<InMemoryLog>, Arc<Topic>) {
        let log = Arc::new(InMemoryLog::new(TOPIC));
        let topic = Topic::load(TopicName::parse(TOPIC).unwrap(), log.clone(), p, ctx)
            .await
            .unwrap();
        (log, topic)
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_excludes_local_cluster_and_keeps_order() {
        let (_log, topic) = load(&policies(&["r3", "r1", "r2"], None), ctx()).await;

        let replicators = topic.replicators();
        assert_eq!(replicators.keys().collect::<Vec<_>>(), vec!["r3", "r2"]);
        assert_eq!(replicators.values().nth(1).unwrap().cluster(), "r2");
        assert!(replicators.get("r1").is_none());
        assert!(replicators.values().all(|h| h.rate_limiter().is_none()));

        topic.unload().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_applies_rate_before_dispatch() {
        let rate = DispatchRatePolicy::messages(100, 360);
        let (_log, topic) = load(&policies(&["r1", "r2"], Some(rate)), ctx()).await;

        let view = topic.replicators().values().next().unwrap().rate_limiter().unwrap();
        assert_eq!(view.dispatch_rate_on_msg(), 100);
        assert_eq!(topic.dispatch_rate(), Some(rate));

        topic.unload().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_apply_dispatch_rate_to_all_and_new_replicators() {
        let (_log, topic) = load(&policies(&["r1", "r2", "r3"], None), ctx()).await;

        let changed = topic
            .apply_dispatch_rate(Some(&DispatchRatePolicy::bytes(500, 360)))
            .unwrap();
        assert_eq!(changed, 2);
        assert_eq!(topic.apply_dispatch_rate(Some(&DispatchRatePolicy::bytes(500, 360))).unwrap(), 0);

        // A replicator added later inherits the rate.
        topic.reconcile_clusters(&clusters(&["r1", "r2", "r3", "r4"])).await.unwrap();
        let r4 = topic.replicators().get("r4").cloned().unwrap();
        assert_eq!(r4.rate_limiter().unwrap().dispatch_rate_on_byte(), 500);

        // Invalid: rejected, nothing touched.
        assert!(topic
            .apply_dispatch_rate(Some(&DispatchRatePolicy::new(-2, -1, 360)))
            .is_err());
        assert!(topic.replicators().values().all(|h| h.has_rate_limiter()));

        assert_eq!(topic.apply_dispatch_rate(None).unwrap(), 3);
        assert!(topic.replicators().values().all(|h| !h.has_rate_limiter()));

        topic.unload().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_apply_policies_ignores_stale_versions() {
        let (_log, topic) = load(&versioned(5, &["r1", "r2"], None), ctx()).await;
        assert_eq!(topic.policy_version(), 5);

        let stale = versioned(4, &["r1", "r2", "r3"], Some(DispatchRatePolicy::messages(1, 1)));
        assert!(!topic.apply_policies(&stale).await.unwrap());
        assert_eq!(topic.replicators().len(), 1);
        assert!(topic.dispatch_rate().is_none());

        let newer = versioned(6, &["r1", "r2", "r3"], Some(DispatchRatePolicy::messages(100, 360)));
        assert!(topic.apply_policies(&newer).await.unwrap());
        assert_eq!(topic.policy_version(), 6);
        let replicators = topic.replicators();
        assert_eq!(replicators.len(), 2);
        assert!(replicators
            .values()
            .all(|h| h.rate_limiter().map(|v| v.dispatch_rate_on_msg()) == Some(100)));

        topic.unload().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_apply_policies_keeps_newest() {
        let (log, topic) = load(&versioned(5, &["r1", "r2", "r3"], None), ctx()).await;
        for _ in 0..3 {
            log.append(b"m".to_vec()).await;
        }

        // v7 drops r3 and suspends while it drains; v6 arrives meanwhile.
        let newer = versioned(7, &["r1", "r2"], Some(DispatchRatePolicy::messages(200, 1)));
        let older = versioned(6, &["r1", "r2", "r3"], Some(DispatchRatePolicy::messages(100, 1)));
        let (newer_applied, older_applied) = tokio::join!(topic.apply_policies(&newer), topic.apply_policies(&older));

        assert!(newer_applied.unwrap());
        assert!(!older_applied.unwrap());
        assert_eq!(topic.policy_version(), 7);
        assert_eq!(topic.dispatch_rate(), Some(DispatchRatePolicy::messages(200, 1)));
        assert_eq!(topic.replicators().keys().collect::<Vec<_>>(), vec!["r2"]);
        assert!(topic
            .replicators()
            .values()
            .all(|h| h.rate_limiter().map(|v| v.dispatch_rate_on_msg()) == Some(200)));

        topic.unload().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_apply_policies_invalid_rate_still_updates_clusters() {
        let rate = DispatchRatePolicy::messages(100, 360);
        let (_log, topic) = load(&versioned(1, &["r1", "r2"], Some(rate)), ctx()).await;

        let bad = versioned(2, &["r1", "r2", "r3"], Some(DispatchRatePolicy::new(100, -1, 0)));
        assert!(topic.apply_policies(&bad).await.is_err());

        // Previous rate stays, and the new replicator got it too.
        assert_eq!(topic.dispatch_rate(), Some(rate));
        assert_eq!(topic.replicators().len(), 2);
        assert!(topic.replicators().values().all(|h| h.has_rate_limiter()));

        topic.unload().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconcile_starts_new_and_stops_removed() {
        let (_log, topic) = load(&policies(&["r1", "r2", "r3"], None), ctx()).await;
        let r2 = topic.replicators().get("r2").cloned().unwrap();
        let r3_before = topic.replicators().get("r3").cloned().unwrap();

        topic
            .reconcile_clusters(&clusters(&["r1", "r4", "r3"]))
            .await
            .unwrap();

        assert_eq!(r2.status(), ReplicatorStatus::Stopped);
        let after = topic.replicators();
        assert_eq!(after.keys().collect::<Vec<_>>(), vec!["r4", "r3"]);
        // r3 survived untouched: same replicator, still running.
        assert_ne!(after.get("r3").unwrap().status(), ReplicatorStatus::Stopped);
        assert_ne!(r3_before.status(), ReplicatorStatus::Stopped);

        topic.unload().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_readding_cluster_gets_fresh_replicator() {
        let (_log, topic) = load(&policies(&["r1", "r2"], None), ctx()).await;

        topic.reconcile_clusters(&clusters(&["r1"])).await.unwrap();
        assert!(topic.replicators().is_empty());

        // The old lease was released when its loop stopped.
        topic.reconcile_clusters(&clusters(&["r1", "r2"])).await.unwrap();
        assert_eq!(topic.replicators().len(), 1);

        topic.unload().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unload_stops_everything() {
        let (log, topic) = load(&policies(&["r1", "r2", "r3"], None), ctx()).await;
        for _ in 0..5 {
            log.append(b"m".to_vec()).await;
        }
        let handles: Vec<_> = topic.replicators().values().cloned().collect();
        for h in &handles {
            h.wait_for_acked(5).await.unwrap();
        }

        topic.unload().await;
        assert!(topic.is_unloaded().await);
        assert!(topic.replicators().is_empty());
        assert!(handles.iter().all(|h| h.status() == ReplicatorStatus::Stopped));

        // Unloading twice is harmless; reconciling afterwards is not allowed.
        topic.unload().await;
        assert!(topic.reconcile_clusters(&clusters(&["r1", "r2"])).await.is_err());
    }

    #[tokio::test]
    async fn test_removed_cluster_loses_checkpoint_unload_keeps_it() {
        let store = Arc::new(CursorStore::in_memory().await.unwrap());
        let ctx = ctx().with_cursor_store(store.clone());
        let (log, topic) = load(&policies(&["r1", "r2", "r3"], None), ctx).await;
        for _ in 0..3 {
            log.append(b"m".to_vec()).await;
        }
        for h in topic.replicators().values() {
            h.wait_for_acked(3).await.unwrap();
        }

        topic.reconcile_clusters(&clusters(&["r1", "r3"])).await.unwrap();
        assert!(store.get(&CursorKey::new(TOPIC, "r2")).await.is_none());

        topic.unload().await;
        assert_eq!(store.get(&CursorKey::new(TOPIC, "r3")).await, Some(3));
    }
}
