// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Replication Dispatch
//!
//! Throttled cross-cluster replication for a persistent pub/sub log.
//!
//! ## Architecture
//!
//! Every (topic, remote cluster) pair gets its own dispatch loop that reads
//! the topic log through a cursor and forwards entries to the remote
//! cluster, optionally throttled by a per-namespace dispatch rate:
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                         replication-dispatch                              │
//! │                                                                           │
//! │  ┌─────────────┐    ┌───────────────┐    ┌────────────────────────────┐   │
//! │  │ PolicyStore │───►│ PolicyWatcher │───►│ Topic (per loaded topic)   │   │
//! │  │ (namespace) │    │ (push + poll) │    │ reconcile + apply rate     │   │
//! │  └─────────────┘    └───────────────┘    └────────────────────────────┘   │
//! │                                                     │ one per cluster     │
//! │                                                     ▼                     │
//! │  ┌─────────────┐    ┌───────────────┐    ┌────────────────────────────┐   │
//! │  │ ManagedLog  │───►│ ReplicatorCur │───►│ Dispatch loop              │   │
//! │  │ (topic log) │    │ (lease+ckpt)  │    │ permits → send → advance   │   │
//! │  └─────────────┘    └───────────────┘    └────────────────────────────┘   │
//! │                            │                          │                   │
//! │                            ▼                          ▼                   │
//! │                     ┌─────────────┐        ┌───────────────────────┐      │
//! │                     │ CursorStore │        │ ReplicationTarget     │      │
//! │                     │ (SQLite)    │        │ (remote cluster)      │      │
//! │                     └─────────────┘        └───────────────────────┘      │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Throttling
//!
//! A [`DispatchRatePolicy`] limits messages and/or bytes per period. Each
//! replicator owns an independent token bucket ([`DispatchRateLimiter`]);
//! a denied dispatch suspends the loop until permits accrue, never drops or
//! reorders entries. Policy changes propagate to running replicators without
//! restarting them.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use replication_dispatch::{
//!     DispatchRatePolicy, InMemoryLogProvider, InMemoryPolicyStore, NoOpTarget,
//!     ReplicationConfig, ReplicationService,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> replication_dispatch::Result<()> {
//!     let store = Arc::new(InMemoryPolicyStore::new());
//!     store.create_namespace("pulsar/ns", ["r1", "r2"])?;
//!     store.set_replicator_dispatch_rate("pulsar/ns", DispatchRatePolicy::messages(100, 1))?;
//!
//!     let mut service = ReplicationService::new(
//!         ReplicationConfig::default(),
//!         store,
//!         Arc::new(InMemoryLogProvider::new()),
//!         Arc::new(NoOpTarget),
//!     );
//!     service.start().await?;
//!
//!     let topic = service.get_or_create_topic("persistent://pulsar/ns/orders").await?;
//!     for (cluster, replicator) in topic.replicators().iter() {
//!         println!("{cluster}: {:?}", replicator.rate_limiter());
//!     }
//!
//!     service.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod circuit_breaker;
pub mod config;
pub mod cursor;
mod dispatch;
pub mod error;
pub mod log;
pub mod metrics;
pub mod policy;
pub mod policy_store;
pub mod rate_limiter;
pub mod remote;
pub mod replicator;
pub mod resilience;
pub mod service;
pub mod topic;
pub mod watcher;

use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by the collaborator traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

// Re-exports for convenience
pub use circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError};
pub use config::{ClusterConfig, CursorConfig, DispatchConfig, ReplicationConfig, WatcherConfig};
pub use cursor::{CursorKey, CursorLeases, CursorStore, ReplicatorCursor};
pub use error::{ReplicationError, Result};
pub use log::{InMemoryLog, InMemoryLogProvider, LogEntry, LogProvider, ManagedLog};
pub use policy::{DispatchRatePolicy, NamespacePolicies, TopicName, VersionedPolicies};
pub use policy_store::{InMemoryPolicyStore, PolicyStore};
pub use rate_limiter::{Acquire, DispatchRateLimiter, LimiterSlot, RateLimiterView};
pub use remote::{NoOpTarget, RedisStreamTarget, ReplicationTarget};
pub use replicator::{ReplicatorHandle, ReplicatorStatus};
pub use resilience::RetryConfig;
pub use service::{HealthCheck, ReplicationService, ServiceState};
pub use topic::{Replicators, Topic, TopicContext};
pub use watcher::PolicyWatcher;
