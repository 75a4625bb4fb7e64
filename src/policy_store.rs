// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Namespace policy store.
//!
//! The broker does not own namespace configuration; it reads it from an
//! external store (a coordination service in production). [`PolicyStore`] is
//! the seam: a fetch operation plus an optional change feed.
//!
//! ```text
//!  admin ──set_replicator_dispatch_rate──▶ InMemoryPolicyStore
//!                                            │ version += 1
//!                                            ├──▶ broadcast(namespace)  ──▶ PolicyWatcher
//!                                            └──◀ namespace_policies()  ◀── PolicyWatcher
//! ```
//!
//! Stores without push support return `None` from
//! [`subscribe()`](PolicyStore::subscribe); the watcher then relies on
//! polling alone.
//!
//! # Example
//!
//! ```rust
//! use replication_dispatch::policy::DispatchRatePolicy;
//! use replication_dispatch::policy_store::InMemoryPolicyStore;
//!
//! let store = InMemoryPolicyStore::new();
//! store.create_namespace("pulsar/ns", ["r1", "r2"]).unwrap();
//! store
//!     .set_replicator_dispatch_rate("pulsar/ns", DispatchRatePolicy::messages(100, 360))
//!     .unwrap();
//! assert_eq!(
//!     store.get_replicator_dispatch_rate("pulsar/ns"),
//!     Some(DispatchRatePolicy::messages(100, 360))
//! );
//! ```

use crate::error::{ReplicationError, Result};
use crate::policy::{DispatchRatePolicy, NamespacePolicies, VersionedPolicies};
use crate::BoxFuture;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Capacity of the change feed. A lagging subscriber falls back to a full refresh.
const CHANGE_FEED_CAPACITY: usize = 256;

/// Source of namespace policies.
pub trait PolicyStore: Send + Sync + 'static {
    /// Fetch the current policies of a namespace.
    ///
    /// `Ok(None)` means the namespace does not exist. An `Err` means the
    /// store could not be reached; callers keep what they had.
    fn namespace_policies(&self, namespace: &str) -> BoxFuture<'_, Option<VersionedPolicies>>;

    /// Subscribe to change notifications. Each message is a namespace name.
    ///
    /// Default: no push support.
    fn subscribe(&self) -> Option<broadcast::Receiver<String>> {
        None
    }
}

/// In-process policy store with the namespace administration operations.
///
/// Every mutation bumps a store-wide version counter, so versions of one
/// namespace are strictly increasing.
pub struct InMemoryPolicyStore {
    namespaces: DashMap<String, VersionedPolicies>,
    version: AtomicU64,
    changes: Option<broadcast::Sender<String>>,
    unavailable: AtomicBool,
}

impl Default for InMemoryPolicyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryPolicyStore {
    /// Store with a change feed.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            namespaces: DashMap::new(),
            version: AtomicU64::new(0),
            changes: Some(tx),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Store without a change feed; watchers must poll.
    pub fn without_notifications() -> Self {
        Self {
            changes: None,
            ..Self::new()
        }
    }

    /// Simulate an unreachable store: every fetch fails until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Release);
    }

    fn next_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn notify(&self, namespace: &str) {
        if let Some(tx) = &self.changes {
            // No receivers is fine: nobody is watching yet.
            let _ = tx.send(namespace.to_string());
        }
    }

    fn update<F>(&self, namespace: &str, f: F) -> Result<u64>
    where
        F: FnOnce(&mut NamespacePolicies),
    {
        let version = {
            let mut entry = self
                .namespaces
                .get_mut(namespace)
                .ok_or_else(|| ReplicationError::Config(format!("namespace {} does not exist", namespace)))?;
            f(&mut entry.policies);
            entry.version = self.next_version();
            entry.version
        };
        self.notify(namespace);
        Ok(version)
    }

    /// Create a namespace (or replace an existing one's cluster list).
    pub fn create_namespace<I, S>(&self, namespace: &str, clusters: I) -> Result<u64>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut policies = NamespacePolicies::default();
        policies.set_clusters(clusters);
        if let Some(existing) = self.namespaces.get(namespace) {
            policies.replicator_dispatch_rate = existing.policies.replicator_dispatch_rate;
        }

        let version = self.next_version();
        info!(namespace, clusters = ?policies.replication_clusters, "Namespace created");
        self.namespaces
            .insert(namespace.to_string(), VersionedPolicies { version, policies });
        self.notify(namespace);
        Ok(version)
    }

    /// Replace the namespace's replication cluster list.
    pub fn set_replication_clusters<I, S>(&self, namespace: &str, clusters: I) -> Result<u64>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let clusters: Vec<String> = clusters.into_iter().map(Into::into).collect();
        debug!(namespace, ?clusters, "Setting replication clusters");
        self.update(namespace, |p| p.set_clusters(clusters))
    }

    /// Set the replicator dispatch rate. Invalid policies are rejected and
    /// the previous one stays.
    pub fn set_replicator_dispatch_rate(&self, namespace: &str, policy: DispatchRatePolicy) -> Result<u64> {
        policy.validate()?;
        debug!(namespace, ?policy, "Setting replicator dispatch rate");
        self.update(namespace, |p| p.replicator_dispatch_rate = Some(policy))
    }

    pub fn get_replicator_dispatch_rate(&self, namespace: &str) -> Option<DispatchRatePolicy> {
        self.namespaces
            .get(namespace)
            .and_then(|e| e.policies.replicator_dispatch_rate)
    }

    pub fn remove_replicator_dispatch_rate(&self, namespace: &str) -> Result<u64> {
        debug!(namespace, "Removing replicator dispatch rate");
        self.update(namespace, |p| p.replicator_dispatch_rate = None)
    }

    /// Snapshot of a namespace, bypassing the availability switch.
    pub fn get(&self, namespace: &str) -> Option<VersionedPolicies> {
        self.namespaces.get(namespace).map(|e| e.clone())
    }
}

impl PolicyStore for InMemoryPolicyStore {
    fn namespace_policies(&self, namespace: &str) -> BoxFuture<'_, Option<VersionedPolicies>> {
        let namespace = namespace.to_string();
        Box::pin(async move {
            if self.unavailable.load(Ordering::Acquire) {
                return Err(ReplicationError::PolicyStore {
                    namespace,
                    message: "policy store unavailable".to_string(),
                });
            }
            Ok(self.get(&namespace))
        })
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<String>> {
        self.changes.as_ref().map(|tx| tx.subscribe())
    }
}
