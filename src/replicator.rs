// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-destination replicator state.
//!
//! A replicator forwards one topic to one remote cluster. Its state is
//! shared between three parties:
//!
//! ```text
//!   PolicyWatcher ──configure_dispatch_rate──▶ ┌──────────────────┐
//!                                              │ ReplicatorShared │ ◀── dispatch task
//!   operators/tests ◀──ReplicatorHandle─────── │ limiter, status, │     (sole cursor writer)
//!                                              │ acked, degraded  │
//!                                              └──────────────────┘
//! ```
//!
//! The `Replicator` owning the dispatch task lives in its [`Topic`]; the
//! rest of the system only sees cheap, cloneable [`ReplicatorHandle`]s.
//!
//! # Status
//!
//! ```text
//! Starting ──▶ Active ⇄ Throttled ──▶ Stopping ──▶ Stopped
//! ```
//!
//! [`Topic`]: crate::topic::Topic

use crate::circuit_breaker::{CircuitBreaker, CircuitConfig};
use crate::config::DispatchConfig;
use crate::cursor::ReplicatorCursor;
use crate::dispatch;
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::policy::DispatchRatePolicy;
use crate::rate_limiter::{DispatchRateLimiter, LimiterSlot, RateLimiterView};
use crate::remote::ReplicationTarget;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Lifecycle of a replicator's dispatch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicatorStatus {
    /// Created, cursor opened, loop not yet running.
    Starting,
    /// Forwarding entries.
    Active,
    /// Suspended waiting for dispatch permits.
    Throttled,
    /// Cancellation observed, finishing the in-flight send.
    Stopping,
    /// Loop exited, checkpoint flushed.
    Stopped,
}

impl ReplicatorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplicatorStatus::Starting => "Starting",
            ReplicatorStatus::Active => "Active",
            ReplicatorStatus::Throttled => "Throttled",
            ReplicatorStatus::Stopping => "Stopping",
            ReplicatorStatus::Stopped => "Stopped",
        }
    }
}

impl std::fmt::Display for ReplicatorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State shared by a replicator's handles and its dispatch task.
pub(crate) struct ReplicatorShared {
    topic: String,
    cluster: String,
    limiter: RwLock<LimiterSlot>,
    /// Bumped on every effective limiter change; wakes throttled loops.
    limiter_version: watch::Sender<u64>,
    status: watch::Sender<ReplicatorStatus>,
    /// Next position to send; everything below it is acknowledged.
    acked: watch::Sender<u64>,
    degraded: AtomicBool,
    send_failures: AtomicU64,
    circuit: CircuitBreaker,
}

impl ReplicatorShared {
    pub(crate) fn new(topic: &str, cluster: &str, start_position: u64, circuit: CircuitConfig) -> Self {
        Self {
            topic: topic.to_string(),
            cluster: cluster.to_string(),
            limiter: RwLock::new(LimiterSlot::Absent),
            limiter_version: watch::channel(0).0,
            status: watch::channel(ReplicatorStatus::Starting).0,
            acked: watch::channel(start_position).0,
            degraded: AtomicBool::new(false),
            send_failures: AtomicU64::new(0),
            circuit: CircuitBreaker::new(format!("{}->{}", topic, cluster), circuit),
        }
    }

    pub(crate) fn topic(&self) -> &str {
        &self.topic
    }

    pub(crate) fn cluster(&self) -> &str {
        &self.cluster
    }

    pub(crate) fn circuit(&self) -> &CircuitBreaker {
        &self.circuit
    }

    /// Current limiter, if any. The slot lock is not held by the caller.
    pub(crate) fn limiter(&self) -> Option<Arc<DispatchRateLimiter>> {
        self.limiter
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .limiter()
            .cloned()
    }

    pub(crate) fn limiter_changes(&self) -> watch::Receiver<u64> {
        self.limiter_version.subscribe()
    }

    fn configure(&self, policy: Option<&DispatchRatePolicy>) -> Result<bool> {
        let changed = {
            let mut slot = self.limiter.write().unwrap_or_else(PoisonError::into_inner);
            let changed = slot.configure(policy)?;
            if changed {
                let (msg, byte) = slot
                    .view()
                    .map_or((-1, -1), |v| (v.dispatch_rate_on_msg(), v.dispatch_rate_on_byte()));
                metrics::set_dispatch_rate(&self.topic, &self.cluster, msg, byte);
            }
            changed
        };

        if changed {
            self.limiter_version.send_modify(|v| *v += 1);
        }
        Ok(changed)
    }

    pub(crate) fn status(&self) -> ReplicatorStatus {
        *self.status.borrow()
    }

    pub(crate) fn set_status(&self, status: ReplicatorStatus) {
        let previous = self.status.send_replace(status);
        if previous != status {
            debug!(topic = %self.topic, cluster = %self.cluster, from = %previous, to = %status, "Replicator status");
            metrics::set_replicator_status(&self.topic, &self.cluster, status.as_str());
        }
    }

    /// Move to `Stopping` unless the loop already reached `Stopped`.
    fn begin_stopping(&self) {
        let changed = self.status.send_if_modified(|s| {
            if *s == ReplicatorStatus::Stopped || *s == ReplicatorStatus::Stopping {
                false
            } else {
                *s = ReplicatorStatus::Stopping;
                true
            }
        });
        if changed {
            metrics::set_replicator_status(&self.topic, &self.cluster, ReplicatorStatus::Stopping.as_str());
        }
    }

    pub(crate) fn record_ack(&self, position: u64) {
        self.acked.send_replace(position);
    }

    pub(crate) fn mark_degraded(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
        if !self.degraded.swap(true, Ordering::AcqRel) {
            warn!(topic = %self.topic, cluster = %self.cluster, "Replicator degraded");
        }
    }

    pub(crate) fn clear_degraded(&self) {
        if self.degraded.swap(false, Ordering::AcqRel) {
            info!(topic = %self.topic, cluster = %self.cluster, "Replicator recovered");
        }
    }
}

/// Cheap, cloneable view of one replicator.
#[derive(Clone)]
pub struct ReplicatorHandle {
    shared: Arc<ReplicatorShared>,
}

impl ReplicatorHandle {
    pub(crate) fn new(shared: Arc<ReplicatorShared>) -> Self {
        Self { shared }
    }

    pub fn topic(&self) -> &str {
        self.shared.topic()
    }

    /// Destination cluster.
    pub fn cluster(&self) -> &str {
        self.shared.cluster()
    }

    /// The configured limiter, or `None` when the replicator is not throttled.
    pub fn rate_limiter(&self) -> Option<RateLimiterView> {
        self.shared
            .limiter
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .view()
    }

    pub fn has_rate_limiter(&self) -> bool {
        self.rate_limiter().is_some()
    }

    /// Apply a dispatch rate policy (`None` = no policy).
    ///
    /// Invalid policies are rejected and the current limiter stays. Returns
    /// whether the limiter changed.
    pub fn configure_dispatch_rate(&self, policy: Option<&DispatchRatePolicy>) -> Result<bool> {
        self.shared.configure(policy)
    }

    pub fn status(&self) -> ReplicatorStatus {
        self.shared.status()
    }

    /// Next position to send; every entry before it has been acknowledged.
    pub fn acked_position(&self) -> u64 {
        *self.shared.acked.borrow()
    }

    /// Whether the last send attempt failed.
    pub fn is_degraded(&self) -> bool {
        self.shared.degraded.load(Ordering::Acquire)
    }

    /// Failed or rejected send attempts since creation.
    pub fn send_failures(&self) -> u64 {
        self.shared.send_failures.load(Ordering::Relaxed)
    }

    /// Circuit breaker guarding sends to this destination.
    pub fn circuit(&self) -> &CircuitBreaker {
        self.shared.circuit()
    }

    /// Wait until the replicator reaches `status`.
    pub async fn wait_for_status(&self, status: ReplicatorStatus) -> Result<()> {
        let mut rx = self.shared.status.subscribe();
        rx.wait_for(|s| *s == status)
            .await
            .map(|_| ())
            .map_err(|_| ReplicationError::Shutdown)
    }

    /// Wait until at least `position` entries have been acknowledged.
    pub async fn wait_for_acked(&self, position: u64) -> Result<()> {
        let mut rx = self.shared.acked.subscribe();
        rx.wait_for(|acked| *acked >= position)
            .await
            .map(|_| ())
            .map_err(|_| ReplicationError::Shutdown)
    }
}

impl std::fmt::Debug for ReplicatorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicatorHandle")
            .field("topic", &self.topic())
            .field("cluster", &self.cluster())
            .field("status", &self.status())
            .field("acked", &self.acked_position())
            .field("rate_limiter", &self.rate_limiter())
            .finish()
    }
}

/// A running replicator: its handle, cancellation switch and dispatch task.
///
/// Dropping it without [`stop`](Self::stop) still cancels the loop (the
/// cancellation sender goes away), but does not wait for it.
pub(crate) struct Replicator {
    handle: ReplicatorHandle,
    cancel: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl Replicator {
    /// Spawn the dispatch loop. The limiter should already be configured.
    pub(crate) fn spawn(
        handle: ReplicatorHandle,
        cursor: ReplicatorCursor,
        target: Arc<dyn ReplicationTarget>,
        config: DispatchConfig,
    ) -> Self {
        let (cancel, cancel_rx) = watch::channel(false);
        let shared = Arc::clone(&handle.shared);

        let task = tokio::spawn(async move {
            dispatch::run_dispatch_loop(shared, cursor, target, config, cancel_rx).await;
        });

        info!(topic = %handle.topic(), cluster = %handle.cluster(), "Spawned replicator");
        Self {
            handle,
            cancel,
            task: Some(task),
        }
    }

    pub(crate) fn handle(&self) -> &ReplicatorHandle {
        &self.handle
    }

    pub(crate) fn cluster(&self) -> &str {
        self.handle.cluster()
    }

    /// Cancel the loop and wait up to `drain_timeout` for it to finish its
    /// in-flight send and flush the checkpoint. Past the timeout the task is
    /// aborted; the unacknowledged entry is sent again by the next owner.
    pub(crate) async fn stop(mut self, drain_timeout: Duration) {
        let _ = self.cancel.send(true);
        self.handle.shared.begin_stopping();

        let Some(mut task) = self.task.take() else {
            return;
        };

        match tokio::time::timeout(drain_timeout, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(cluster = %self.cluster(), error = %e, "Dispatch task ended abnormally");
                self.handle.shared.set_status(ReplicatorStatus::Stopped);
            }
            Err(_) => {
                warn!(
                    cluster = %self.cluster(),
                    timeout_ms = drain_timeout.as_millis() as u64,
                    "Replicator drain timed out, aborting dispatch task"
                );
                task.abort();
                let _ = task.await;
                self.handle.shared.set_status(ReplicatorStatus::Stopped);
            }
        }
        info!(topic = %self.handle.topic(), cluster = %self.cluster(), "Replicator stopped");
    }
}
