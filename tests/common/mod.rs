//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - Redis testcontainer setup (remote cluster endpoints)
//! - A recording `ReplicationTarget` with fault injection
//! - Service harness and log helpers

#![allow(dead_code)]

pub mod containers;
pub mod mock_target;

pub use containers::*;
pub use mock_target::*;

use replication_dispatch::{
    CursorConfig, InMemoryLog, InMemoryLogProvider, InMemoryPolicyStore, ReplicationConfig,
    ReplicationService, Topic,
};
use std::sync::Arc;

pub const LOCAL: &str = "r1";
pub const NS: &str = "pulsar/ns";
pub const TOPIC: &str = "persistent://pulsar/ns/replicated";

/// A running service with in-memory collaborators.
pub struct Harness {
    pub store: Arc<InMemoryPolicyStore>,
    pub logs: Arc<InMemoryLogProvider>,
    pub target: Arc<RecordingTarget>,
    pub service: ReplicationService,
}

impl Harness {
    /// Service for `LOCAL` with `NS` replicating to `clusters`.
    pub async fn start(clusters: &[&str], cursor: CursorConfig) -> Self {
        let store = Arc::new(InMemoryPolicyStore::new());
        store.create_namespace(NS, clusters.iter().copied()).unwrap();
        Self::start_with(store, Arc::new(InMemoryLogProvider::new()), cursor).await
    }

    /// Service over existing collaborators (e.g. to simulate a broker restart).
    pub async fn start_with(
        store: Arc<InMemoryPolicyStore>,
        logs: Arc<InMemoryLogProvider>,
        cursor: CursorConfig,
    ) -> Self {
        let mut config = ReplicationConfig::for_testing(LOCAL);
        config.cursor = cursor;

        let target = Arc::new(RecordingTarget::new());
        let mut service = ReplicationService::new(config, store.clone(), logs.clone(), target.clone());
        service.start().await.unwrap();

        Self {
            store,
            logs,
            target,
            service,
        }
    }

    pub fn log(&self) -> Arc<InMemoryLog> {
        self.logs.log(TOPIC)
    }

    pub async fn topic(&self) -> Arc<Topic> {
        self.service.get_or_create_topic(TOPIC).await.unwrap()
    }

    /// Apply `version` of `NS` and wait until every loaded topic reflects it.
    pub async fn wait_applied(&self, version: u64) {
        self.service.watcher().wait_for_version(NS, version).await.unwrap();
    }

    pub async fn shutdown(mut self) {
        self.service.shutdown().await;
    }
}

/// Append `count` messages of `size` bytes.
pub async fn produce(log: &InMemoryLog, count: usize, size: usize) {
    for _ in 0..count {
        log.append(vec![0xAB; size]).await;
    }
}
