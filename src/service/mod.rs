// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Broker-side replication service.
//!
//! Ties together:
//! - Loaded topics and their replicators via [`crate::topic::Topic`]
//! - Policy propagation via [`crate::watcher::PolicyWatcher`]
//! - Checkpoint persistence via [`crate::cursor::CursorStore`]
//!
//! # Lifecycle
//!
//! 1. [`start()`](ReplicationService::start) opens the cursor store and
//!    spawns the policy watcher and the periodic checkpoint flush
//! 2. [`get_or_create_topic()`](ReplicationService::get_or_create_topic)
//!    loads topics as the broker takes ownership of them
//! 3. [`shutdown()`](ReplicationService::shutdown) stops the background
//!    tasks, unloads every topic and closes the store

mod types;

pub use types::{HealthCheck, ReplicatorHealth, ServiceState};

use crate::config::ReplicationConfig;
use crate::cursor::{CursorLeases, CursorStore};
use crate::error::{ReplicationError, Result};
use crate::log::LogProvider;
use crate::metrics;
use crate::policy::TopicName;
use crate::policy_store::PolicyStore;
use crate::remote::ReplicationTarget;
use crate::replicator::ReplicatorStatus;
use crate::topic::{Topic, TopicContext};
use crate::watcher::PolicyWatcher;
use dashmap::DashMap;
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Owns the replication state of one broker.
pub struct ReplicationService {
    config: ReplicationConfig,

    /// Service state (broadcast to watchers)
    state_tx: watch::Sender<ServiceState>,
    state_rx: watch::Receiver<ServiceState>,

    store: Arc<dyn PolicyStore>,
    logs: Arc<dyn LogProvider>,
    target: Arc<dyn ReplicationTarget>,

    /// Loaded topics, keyed by full topic name
    topics: Arc<DashMap<String, Arc<Topic>>>,

    watcher: Arc<PolicyWatcher>,

    /// Cursor lease table shared by every topic of this broker
    leases: CursorLeases,

    /// Checkpoint store, opened by `start()` when enabled
    cursor_store: Option<Arc<CursorStore>>,

    /// Serializes topic loads so a topic is loaded once
    load_lock: Mutex<()>,

    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,

    /// Watcher and flush task handles
    task_handles: Vec<JoinHandle<()>>,
}

impl ReplicationService {
    /// Create a service in the `Created` state.
    pub fn new(
        config: ReplicationConfig,
        store: Arc<dyn PolicyStore>,
        logs: Arc<dyn LogProvider>,
        target: Arc<dyn ReplicationTarget>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(ServiceState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let topics = Arc::new(DashMap::new());
        let watcher = Arc::new(PolicyWatcher::new(
            Arc::clone(&store),
            Arc::clone(&topics),
            config.watcher.clone(),
        ));

        Self {
            config,
            state_tx,
            state_rx,
            store,
            logs,
            target,
            topics,
            watcher,
            leases: CursorLeases::new(),
            cursor_store: None,
            load_lock: Mutex::new(()),
            shutdown_tx,
            shutdown_rx,
            task_handles: Vec::new(),
        }
    }

    pub fn state(&self) -> ServiceState {
        *self.state_rx.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<ServiceState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        self.state() == ServiceState::Running
    }

    pub fn local_cluster(&self) -> &str {
        &self.config.local_cluster
    }

    pub fn watcher(&self) -> &Arc<PolicyWatcher> {
        &self.watcher
    }

    pub fn cursor_store(&self) -> Option<&Arc<CursorStore>> {
        self.cursor_store.as_ref()
    }

    fn set_state(&self, state: ServiceState) {
        let _ = self.state_tx.send(state);
        metrics::set_service_state(state.as_str());
    }

    /// Start the service.
    ///
    /// 1. Opens the cursor store (SQLite), unless checkpoints are disabled
    /// 2. Spawns the policy watcher
    /// 3. Spawns the checkpoint flush task
    pub async fn start(&mut self) -> Result<()> {
        if self.state() != ServiceState::Created {
            return Err(ReplicationError::InvalidState {
                expected: "Created".to_string(),
                actual: format!("{:?}", self.state()),
            });
        }

        info!(
            local_cluster = %self.config.local_cluster,
            checkpoints = self.config.cursor.enabled,
            "Starting replication service"
        );

        if self.config.cursor.enabled {
            let store = CursorStore::open(&self.config.cursor).await?;
            info!(path = %self.config.cursor.sqlite_path, "Cursor store initialized");
            self.cursor_store = Some(Arc::new(store));
        }

        let watcher = self.watcher.spawn(self.shutdown_rx.clone());
        self.task_handles.push(watcher);
        debug!("Spawned policy watcher");

        if let Some(store) = self.cursor_store.clone() {
            let flush = self.spawn_cursor_flush_task(store);
            self.task_handles.push(flush);
        }

        self.set_state(ServiceState::Running);
        info!("Replication service running");
        Ok(())
    }

    /// Periodically flushes dirty checkpoints to SQLite.
    fn spawn_cursor_flush_task(&self, store: Arc<CursorStore>) -> JoinHandle<()> {
        let mut shutdown_rx = self.shutdown_rx.clone();
        let flush_interval = self.config.cursor.flush_interval_duration();

        let handle = tokio::spawn(async move {
            let mut timer = tokio::time::interval(flush_interval);

            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        if let Err(e) = store.flush_dirty().await {
                            warn!(error = %e, "Failed to flush checkpoints");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            debug!("Cursor flush task stopping");
                            break;
                        }
                    }
                }
            }
        });

        debug!(interval_ms = flush_interval.as_millis() as u64, "Spawned cursor flush task");
        handle
    }

    fn topic_context(&self) -> TopicContext {
        let ctx = TopicContext::new(
            self.config.local_cluster.clone(),
            Arc::clone(&self.target),
            self.config.dispatch.clone(),
        )
        .with_leases(self.leases.clone());
        match &self.cursor_store {
            Some(store) => ctx.with_cursor_store(Arc::clone(store)),
            None => ctx,
        }
    }

    /// A loaded topic.
    pub fn topic(&self, name: &str) -> Option<Arc<Topic>> {
        self.topics.get(name).map(|t| Arc::clone(t.value()))
    }

    /// Names of loaded topics.
    pub fn topic_names(&self) -> Vec<String> {
        self.topics.iter().map(|t| t.key().clone()).collect()
    }

    /// Return the loaded topic, loading it first if needed.
    ///
    /// Loading reads the namespace policies from the store and applies the
    /// dispatch rate before any replicator sends.
    pub async fn get_or_create_topic(&self, name: &str) -> Result<Arc<Topic>> {
        if let Some(topic) = self.topic(name) {
            return Ok(topic);
        }

        let _guard = self.load_lock.lock().await;
        if let Some(topic) = self.topic(name) {
            return Ok(topic);
        }

        if !self.is_running() {
            return Err(ReplicationError::InvalidState {
                expected: "Running".to_string(),
                actual: self.state().to_string(),
            });
        }

        let topic_name = TopicName::parse(name)?;
        let namespace = topic_name.namespace().to_string();
        let versioned = self
            .store
            .namespace_policies(&namespace)
            .await?
            .ok_or_else(|| ReplicationError::Config(format!("namespace {} does not exist", namespace)))?;

        let log = self.logs.open(&topic_name).await?;
        let topic = Topic::load(topic_name, log, &versioned, self.topic_context()).await?;

        self.topics.insert(name.to_string(), Arc::clone(&topic));
        self.watcher.note_loaded(&namespace, &versioned);
        self.update_gauges();

        // A change published while the topic was loading had no topic to reach.
        if let Err(e) = self.watcher.refresh(&namespace).await {
            debug!(namespace = %namespace, error = %e, "Post-load policy refresh failed, will retry");
        }
        Ok(topic)
    }

    /// Unload a topic. Its checkpoints are kept. Returns whether it was loaded.
    pub async fn unload_topic(&self, name: &str) -> bool {
        let Some((_, topic)) = self.topics.remove(name) else {
            return false;
        };
        topic.unload().await;
        self.watcher.forget_unwatched();
        self.update_gauges();
        true
    }

    fn update_gauges(&self) {
        metrics::set_loaded_topics(self.topics.len());
        let replicators: usize = self.topics.iter().map(|t| t.value().replicators().len()).sum();
        metrics::set_active_replicators(replicators);
    }

    /// Health summary from cached state.
    pub fn health_check(&self) -> HealthCheck {
        let state = self.state();
        let mut replicators = Vec::new();

        for topic in self.topics.iter() {
            for handle in topic.value().replicators().values() {
                let view = handle.rate_limiter();
                replicators.push(ReplicatorHealth {
                    topic: handle.topic().to_string(),
                    cluster: handle.cluster().to_string(),
                    status: handle.status(),
                    acked_position: handle.acked_position(),
                    degraded: handle.is_degraded(),
                    send_failures: handle.send_failures(),
                    dispatch_rate_on_msg: view.as_ref().map(|v| v.dispatch_rate_on_msg()),
                    dispatch_rate_on_byte: view.as_ref().map(|v| v.dispatch_rate_on_byte()),
                });
            }
        }

        let replicators_throttled = replicators
            .iter()
            .filter(|r| r.status == ReplicatorStatus::Throttled)
            .count();
        let replicators_degraded = replicators.iter().filter(|r| r.degraded).count();
        let ready = state == ServiceState::Running;

        HealthCheck {
            state,
            ready,
            topics_loaded: self.topics.len(),
            replicators_total: replicators.len(),
            replicators_throttled,
            replicators_degraded,
            replicators,
            healthy: ready && replicators_degraded == 0,
        }
    }

    /// Shut down gracefully.
    ///
    /// 1. Signal the watcher and flush task to stop
    /// 2. Unload every topic (each replicator drains within the drain timeout)
    /// 3. Flush checkpoints and close the cursor store
    pub async fn shutdown(&mut self) {
        if self.state() == ServiceState::Stopped {
            return;
        }
        info!("Shutting down replication service");
        self.set_state(ServiceState::ShuttingDown);

        let _ = self.shutdown_tx.send(true);

        let handles = std::mem::take(&mut self.task_handles);
        let drain_timeout = self.config.dispatch.drain_timeout_duration();
        for (i, handle) in handles.into_iter().enumerate() {
            match tokio::time::timeout(drain_timeout, handle).await {
                Ok(Ok(())) => debug!(task = i + 1, "Task completed gracefully"),
                Ok(Err(e)) => warn!(task = i + 1, error = %e, "Task panicked during shutdown"),
                Err(_) => warn!(task = i + 1, "Task timed out during shutdown"),
            }
        }

        let topics: Vec<Arc<Topic>> = self.topics.iter().map(|t| Arc::clone(t.value())).collect();
        self.topics.clear();
        if !topics.is_empty() {
            info!(topics = topics.len(), "Unloading topics");
        }
        join_all(topics.iter().map(|t| t.unload())).await;
        self.update_gauges();

        if let Some(store) = self.cursor_store.take() {
            store.close().await;
        }

        self.set_state(ServiceState::Stopped);
        info!("Replication service stopped");
    }
}
