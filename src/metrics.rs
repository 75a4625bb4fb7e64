// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics through the `metrics` facade for:
//! - Entries and bytes dispatched per (topic, cluster)
//! - Throttling (denials and wait time)
//! - Remote send failures and circuit breaker rejections
//! - Replicator status and backlog
//! - Policy propagation
//! - Cursor checkpoint persistence
//!
//! The crate never installs a recorder; without one every call is a no-op.
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `replication_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! # Usage
//!
//! ```rust,no_run
//! use replication_dispatch::metrics;
//!
//! metrics::record_entry_dispatched("persistent://pulsar/ns/t", "r2", 512);
//! metrics::record_throttled("persistent://pulsar/ns/t", "r2");
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Dispatch
// =============================================================================

/// Record one entry acknowledged by a remote cluster.
pub fn record_entry_dispatched(topic: &str, cluster: &str, bytes: usize) {
    counter!("replication_entries_dispatched_total", "topic" => topic.to_string(), "cluster" => cluster.to_string())
        .increment(1);
    counter!("replication_bytes_dispatched_total", "topic" => topic.to_string(), "cluster" => cluster.to_string())
        .increment(bytes as u64);
}

/// Record remote send latency (successful sends only).
pub fn record_send_latency(cluster: &str, duration: Duration) {
    histogram!("replication_send_duration_seconds", "cluster" => cluster.to_string())
        .record(duration.as_secs_f64());
}

/// Record a failed or rejected remote send.
pub fn record_send_failure(topic: &str, cluster: &str, reason: &str) {
    counter!(
        "replication_send_failures_total",
        "topic" => topic.to_string(),
        "cluster" => cluster.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Record a log read failure.
pub fn record_log_read_failure(topic: &str) {
    counter!("replication_log_read_failures_total", "topic" => topic.to_string()).increment(1);
}

/// Record how many entries a replicator still has to send.
pub fn set_replication_backlog(topic: &str, cluster: &str, entries: u64) {
    gauge!("replication_backlog_entries", "topic" => topic.to_string(), "cluster" => cluster.to_string())
        .set(entries as f64);
}

// =============================================================================
// Throttling
// =============================================================================

/// Record a permit denial.
pub fn record_throttled(topic: &str, cluster: &str) {
    counter!("replication_throttled_total", "topic" => topic.to_string(), "cluster" => cluster.to_string())
        .increment(1);
}

/// Record time spent suspended waiting for permits.
pub fn record_throttle_wait(cluster: &str, wait: Duration) {
    histogram!("replication_throttle_wait_seconds", "cluster" => cluster.to_string())
        .record(wait.as_secs_f64());
}

/// Publish the configured dispatch rate of a replicator (`-1` when disabled).
pub fn set_dispatch_rate(topic: &str, cluster: &str, msg_rate: i64, byte_rate: i64) {
    gauge!("replication_dispatch_rate_msg", "topic" => topic.to_string(), "cluster" => cluster.to_string())
        .set(msg_rate as f64);
    gauge!("replication_dispatch_rate_byte", "topic" => topic.to_string(), "cluster" => cluster.to_string())
        .set(byte_rate as f64);
}

// =============================================================================
// Replicator / Service State
// =============================================================================

/// Set replicator status gauge.
pub fn set_replicator_status(topic: &str, cluster: &str, status: &str) {
    // Encode status as numeric for alerting
    let value = match status {
        "Starting" => 0.0,
        "Active" => 1.0,
        "Throttled" => 2.0,
        "Stopping" => 3.0,
        "Stopped" => 4.0,
        _ => -1.0,
    };
    gauge!("replication_replicator_status", "topic" => topic.to_string(), "cluster" => cluster.to_string())
        .set(value);
}

/// Set number of running replicators across all loaded topics.
pub fn set_active_replicators(count: usize) {
    gauge!("replication_active_replicators").set(count as f64);
}

/// Set number of loaded topics.
pub fn set_loaded_topics(count: usize) {
    gauge!("replication_loaded_topics").set(count as f64);
}

/// Set service state gauge.
pub fn set_service_state(state: &str) {
    let value = match state {
        "Created" => 0.0,
        "Running" => 1.0,
        "ShuttingDown" => 2.0,
        "Stopped" => 3.0,
        _ => -1.0,
    };
    gauge!("replication_service_state").set(value);
}

// =============================================================================
// Policy Propagation
// =============================================================================

/// Record a namespace policy applied to loaded topics.
pub fn record_policy_applied(namespace: &str) {
    counter!("replication_policy_applied_total", "namespace" => namespace.to_string()).increment(1);
}

/// Record a failed policy store fetch.
pub fn record_policy_fetch_failure(namespace: &str) {
    counter!("replication_policy_fetch_failures_total", "namespace" => namespace.to_string()).increment(1);
}

/// Record a rejected (invalid) policy.
pub fn record_policy_rejected(namespace: &str) {
    counter!("replication_policy_rejected_total", "namespace" => namespace.to_string()).increment(1);
}

// =============================================================================
// Circuit Breaker
// =============================================================================

/// Record circuit breaker rejection (circuit was open).
pub fn record_circuit_rejection(circuit_name: &str) {
    counter!("replication_circuit_rejections_total", "circuit" => circuit_name.to_string()).increment(1);
}

// =============================================================================
// Cursor Checkpoints
// =============================================================================

/// Record cursor flush batch (debounced writes).
pub fn record_cursor_flush(flushed: usize, errors: usize) {
    counter!("replication_cursor_flushes_total").increment(1);
    counter!("replication_cursor_flushed_count").increment(flushed as u64);
    if errors > 0 {
        counter!("replication_cursor_flush_errors_total").increment(errors as u64);
    }
}

/// Record cursor SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn cursor_retries_total(operation: &str) {
    counter!("replication_cursor_retries_total", "operation" => operation.to_string()).increment(1);
}
