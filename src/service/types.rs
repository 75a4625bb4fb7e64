// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Service state types.
//!
//! # State Transitions
//!
//! ```text
//!            start()                shutdown()
//! Created ───────────→ Running ───────────────→ ShuttingDown ──→ Stopped
//!    │                                                              ↑
//!    └────────────────────── shutdown() ────────────────────────────┘
//! ```
//!
//! - **Created**: after `ReplicationService::new()`. No tasks running.
//! - **Running**: watcher and cursor flush task running, topics may be loaded.
//! - **ShuttingDown**: topics are being unloaded, replicators drained.
//! - **Stopped**: checkpoints flushed, store closed. Safe to drop.

use crate::replicator::ReplicatorStatus;

/// State of the replication service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    /// Created but not started.
    ///
    /// Call [`start()`](super::ReplicationService::start) to begin.
    Created,

    /// Loading topics and dispatching.
    Running,

    /// Unloading topics and draining replicators.
    ShuttingDown,

    /// Shut down cleanly.
    Stopped,
}

impl ServiceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceState::Created => "Created",
            ServiceState::Running => "Running",
            ServiceState::ShuttingDown => "ShuttingDown",
            ServiceState::Stopped => "Stopped",
        }
    }
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of one replicator, for monitoring endpoints.
#[derive(Debug, Clone)]
pub struct ReplicatorHealth {
    pub topic: String,
    pub cluster: String,
    pub status: ReplicatorStatus,
    /// Next position to send (everything before it is acknowledged).
    pub acked_position: u64,
    pub degraded: bool,
    pub send_failures: u64,
    /// Messages per period of the installed limiter, `None` when unthrottled.
    pub dispatch_rate_on_msg: Option<i64>,
    /// Bytes per period of the installed limiter, `None` when unthrottled.
    pub dispatch_rate_on_byte: Option<i64>,
}

/// Health summary of the service.
///
/// Built from cached state only; no I/O.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub state: ServiceState,
    /// Running and accepting topic loads.
    pub ready: bool,
    pub topics_loaded: usize,
    pub replicators_total: usize,
    pub replicators_throttled: usize,
    pub replicators_degraded: usize,
    pub replicators: Vec<ReplicatorHealth>,
    /// Ready with no degraded replicator.
    pub healthy: bool,
}
