// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the replication dispatch service.
//!
//! Configuration is passed to
//! [`ReplicationService::new()`](crate::service::ReplicationService::new)
//! and can be constructed programmatically or deserialized from YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use replication_dispatch::config::{ClusterConfig, ReplicationConfig};
//!
//! let config = ReplicationConfig {
//!     local_cluster: "r1".into(),
//!     clusters: vec![ClusterConfig::for_testing("r2", "redis://r2:6379")],
//!     ..Default::default()
//! };
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! ReplicationConfig
//! ├── local_cluster: String         # Cluster this broker belongs to
//! ├── clusters: Vec<ClusterConfig>  # Remote cluster endpoints
//! ├── dispatch: DispatchConfig      # Per-replicator loop tuning
//! ├── watcher: WatcherConfig        # Policy polling / retry
//! └── cursor: CursorConfig          # SQLite checkpoint persistence
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! local_cluster: "r1"
//!
//! clusters:
//!   - name: "r2"
//!     redis_url: "redis://r2.example.com:6379"
//!
//! dispatch:
//!   batch_size: 100
//!   retry_initial_delay: "100ms"
//!   retry_max_delay: "30s"
//!
//! watcher:
//!   poll_interval: "30s"
//!
//! cursor:
//!   sqlite_path: "/var/lib/broker/replication_cursors.db"
//!   flush_interval: "5s"
//! ```

use crate::circuit_breaker::CircuitConfig;
use crate::resilience::RetryConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Parse a humantime duration string, falling back when it is malformed.
fn parse_duration_or(value: &str, fallback: Duration) -> Duration {
    humantime::parse_duration(value).unwrap_or(fallback)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `ReplicationService::new()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// The cluster this broker runs in.
    /// Excluded from every topic's replicator set.
    pub local_cluster: String,

    /// Remote cluster endpoints, used by the Redis stream target.
    #[serde(default)]
    pub clusters: Vec<ClusterConfig>,

    /// Dispatch loop tuning.
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Policy watcher tuning.
    #[serde(default)]
    pub watcher: WatcherConfig,

    /// Cursor checkpoint persistence.
    #[serde(default)]
    pub cursor: CursorConfig,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            local_cluster: "local".to_string(),
            clusters: Vec::new(),
            dispatch: DispatchConfig::default(),
            watcher: WatcherConfig::default(),
            cursor: CursorConfig::default(),
        }
    }
}

impl ReplicationConfig {
    /// Create a minimal config for testing: fast retries, no SQLite file.
    pub fn for_testing(local_cluster: &str) -> Self {
        Self {
            local_cluster: local_cluster.to_string(),
            clusters: Vec::new(),
            dispatch: DispatchConfig::for_testing(),
            watcher: WatcherConfig::for_testing(),
            cursor: CursorConfig::in_memory(),
        }
    }

    /// Look up the endpoint of a remote cluster.
    pub fn cluster(&self, name: &str) -> Option<&ClusterConfig> {
        self.clusters.iter().find(|c| c.name == name)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ClusterConfig: one entry per remote cluster
// ═══════════════════════════════════════════════════════════════════════════════

/// Endpoint of a remote cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Cluster name as it appears in namespace `replication_clusters`.
    pub name: String,

    /// Redis URL of the cluster's replication ingress.
    /// Example: `"redis://r2.example.com:6379"`
    pub redis_url: String,

    /// Key prefix for per-topic replication streams (e.g., "repl:").
    #[serde(default)]
    pub stream_prefix: Option<String>,
}

impl ClusterConfig {
    /// Stream key an entry of `topic` is appended to on this cluster.
    pub fn stream_key(&self, topic: &str) -> String {
        let prefix = self.stream_prefix.as_deref().unwrap_or("");
        format!("{}replication:{}", prefix, topic)
    }

    /// Create a cluster config for testing.
    pub fn for_testing(name: &str, redis_url: &str) -> Self {
        Self {
            name: name.to_string(),
            redis_url: redis_url.to_string(),
            stream_prefix: None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DispatchConfig: per-replicator forwarding loop
// ═══════════════════════════════════════════════════════════════════════════════

/// Dispatch loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Maximum entries read from the log per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// First backoff after a failed send or read (e.g., "100ms").
    #[serde(default = "default_retry_initial_delay")]
    pub retry_initial_delay: String,

    /// Backoff ceiling (e.g., "30s").
    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay: String,

    /// Timeout for a single remote send.
    #[serde(default = "default_send_timeout")]
    pub send_timeout: String,

    /// How long a stopping replicator may take to finish its in-flight send.
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout: String,

    /// Consecutive send failures before the circuit opens.
    #[serde(default = "default_circuit_failure_threshold")]
    pub circuit_failure_threshold: u32,

    /// How long the circuit stays open before probing again.
    #[serde(default = "default_circuit_reset_timeout")]
    pub circuit_reset_timeout: String,
}

fn default_batch_size() -> usize {
    100
}

fn default_retry_initial_delay() -> String {
    "100ms".to_string()
}

fn default_retry_max_delay() -> String {
    "30s".to_string()
}

fn default_send_timeout() -> String {
    "30s".to_string()
}

fn default_drain_timeout() -> String {
    "10s".to_string()
}

fn default_circuit_failure_threshold() -> u32 {
    5
}

fn default_circuit_reset_timeout() -> String {
    "30s".to_string()
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            retry_initial_delay: "100ms".to_string(),
            retry_max_delay: "30s".to_string(),
            send_timeout: "30s".to_string(),
            drain_timeout: "10s".to_string(),
            circuit_failure_threshold: 5,
            circuit_reset_timeout: "30s".to_string(),
        }
    }
}

impl DispatchConfig {
    pub fn for_testing() -> Self {
        Self {
            batch_size: 10,
            retry_initial_delay: "10ms".to_string(),
            retry_max_delay: "100ms".to_string(),
            send_timeout: "1s".to_string(),
            drain_timeout: "1s".to_string(),
            circuit_failure_threshold: 3,
            circuit_reset_timeout: "200ms".to_string(),
        }
    }

    /// Backoff for send and read retries. Never gives up.
    pub fn retry_config(&self) -> RetryConfig {
        let base = RetryConfig::remote_send();
        RetryConfig {
            initial_delay: parse_duration_or(&self.retry_initial_delay, base.initial_delay),
            max_delay: parse_duration_or(&self.retry_max_delay, base.max_delay),
            attempt_timeout: self.send_timeout_duration(),
            ..base
        }
    }

    pub fn send_timeout_duration(&self) -> Duration {
        parse_duration_or(&self.send_timeout, Duration::from_secs(30))
    }

    pub fn drain_timeout_duration(&self) -> Duration {
        parse_duration_or(&self.drain_timeout, Duration::from_secs(10))
    }

    /// Circuit breaker settings for remote sends.
    pub fn circuit_config(&self) -> CircuitConfig {
        CircuitConfig {
            failure_threshold: self.circuit_failure_threshold,
            success_threshold: 2,
            recovery_timeout: parse_duration_or(&self.circuit_reset_timeout, Duration::from_secs(30)),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// WatcherConfig: namespace policy propagation
// ═══════════════════════════════════════════════════════════════════════════════

/// Policy watcher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    /// How often every watched namespace is re-read, notifications or not.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: String,

    /// First backoff after the policy store fails.
    #[serde(default = "default_watcher_retry_initial_delay")]
    pub retry_initial_delay: String,

    /// Backoff ceiling for policy store failures.
    #[serde(default = "default_watcher_retry_max_delay")]
    pub retry_max_delay: String,
}

fn default_poll_interval() -> String {
    "30s".to_string()
}

fn default_watcher_retry_initial_delay() -> String {
    "500ms".to_string()
}

fn default_watcher_retry_max_delay() -> String {
    "60s".to_string()
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: "30s".to_string(),
            retry_initial_delay: "500ms".to_string(),
            retry_max_delay: "60s".to_string(),
        }
    }
}

impl WatcherConfig {
    pub fn for_testing() -> Self {
        Self {
            poll_interval: "1s".to_string(),
            retry_initial_delay: "10ms".to_string(),
            retry_max_delay: "100ms".to_string(),
        }
    }

    pub fn poll_interval_duration(&self) -> Duration {
        parse_duration_or(&self.poll_interval, Duration::from_secs(30))
    }

    /// Backoff for policy store fetches.
    pub fn retry_config(&self) -> RetryConfig {
        let base = RetryConfig::policy_store();
        RetryConfig {
            initial_delay: parse_duration_or(&self.retry_initial_delay, base.initial_delay),
            max_delay: parse_duration_or(&self.retry_max_delay, base.max_delay),
            ..base
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CursorConfig: checkpoint persistence
// ═══════════════════════════════════════════════════════════════════════════════

/// Cursor checkpoint persistence configuration.
///
/// Checkpoints record how far each (topic, cluster) stream has been
/// acknowledged, so a restarted broker resumes instead of re-sending
/// the whole log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CursorConfig {
    /// Whether checkpoints are kept at all. Without them every restart
    /// replays each topic from the start of its log.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Path to SQLite database for checkpoints. `":memory:"` keeps them in-process.
    pub sqlite_path: String,

    /// Whether to use WAL mode for SQLite (recommended).
    #[serde(default = "default_true")]
    pub wal_mode: bool,

    /// How often dirty checkpoints are flushed to disk.
    #[serde(default = "default_flush_interval")]
    pub flush_interval: String,
}

fn default_true() -> bool {
    true
}

fn default_flush_interval() -> String {
    "5s".to_string()
}

impl Default for CursorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sqlite_path: "replication_cursors.db".to_string(),
            wal_mode: true,
            flush_interval: "5s".to_string(),
        }
    }
}

impl CursorConfig {
    /// Create an in-memory config for testing.
    pub fn in_memory() -> Self {
        Self {
            enabled: true,
            sqlite_path: ":memory:".to_string(),
            wal_mode: false,
            flush_interval: "5s".to_string(),
        }
    }

    /// No checkpoint store; cursors always start at position 0.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::in_memory()
        }
    }

    pub fn is_in_memory(&self) -> bool {
        self.sqlite_path == ":memory:"
    }

    pub fn flush_interval_duration(&self) -> Duration {
        parse_duration_or(&self.flush_interval, Duration::from_secs(5))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
