// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Dispatch loop: one task per (topic, remote cluster).
//!
//! Each replicator has a dedicated task that:
//! 1. Reads the next batch after its acknowledged position
//! 2. Takes dispatch permits for each entry (1 message, `payload.len()` bytes)
//! 3. Sends the entry through the replicator's circuit breaker
//! 4. Advances the cursor once the remote cluster acknowledged it
//!
//! # Throttling
//!
//! A denied permit request parks the loop (status `Throttled`) for the
//! limiter's wait hint. The entry is neither skipped nor acknowledged; the
//! same entry is retried when the wait expires or the policy changes.
//! Throttling delays delivery, it never drops data.
//!
//! # Failures
//!
//! - Send failure or open circuit: replicator marked degraded, exponential
//!   backoff, same entry retried. The loop never gives up on an entry.
//! - Log read failure: backoff, re-read from the acknowledged position.
//!
//! # Graceful Shutdown
//!
//! Cancellation is observed at every suspension point (throttle wait,
//! empty-log wait, backoff sleep) and between entries. A send already in
//! flight is not interrupted; it completes (bounded by the send timeout)
//! before the loop exits. The checkpoint is flushed before `Stopped`.
//!
//! # Ordering
//!
//! Entries are sent one at a time in cursor order, and the cursor only moves
//! past an entry after its acknowledgment, so a remote cluster sees each
//! replicator's entries in log order (with possible re-sends after a crash).

use crate::config::DispatchConfig;
use crate::cursor::ReplicatorCursor;
use crate::error::ReplicationError;
use crate::log::LogEntry;
use crate::metrics;
use crate::rate_limiter::Acquire;
use crate::remote::ReplicationTarget;
use crate::replicator::{ReplicatorShared, ReplicatorStatus};
use crate::resilience::RetryConfig;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Resolve once cancellation is requested (or the owner went away).
async fn cancelled(cancel_rx: &mut watch::Receiver<bool>) {
    let _ = cancel_rx.wait_for(|c| *c).await;
}

/// Sleep for `delay` unless cancelled first. Returns `false` on cancellation.
async fn sleep_or_cancel(delay: Duration, cancel_rx: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        biased;
        _ = cancelled(cancel_rx) => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Per-loop context that does not change between entries.
struct DispatchContext {
    shared: Arc<ReplicatorShared>,
    target: Arc<dyn ReplicationTarget>,
    retry: RetryConfig,
    send_timeout: Duration,
}

/// How a single entry ended.
enum EntryOutcome {
    Acknowledged,
    Cancelled,
}

/// Run the dispatch loop for one replicator until cancelled.
pub(crate) async fn run_dispatch_loop(
    shared: Arc<ReplicatorShared>,
    mut cursor: ReplicatorCursor,
    target: Arc<dyn ReplicationTarget>,
    config: DispatchConfig,
    mut cancel_rx: watch::Receiver<bool>,
) {
    let span = info_span!("dispatch", topic = %shared.topic(), cluster = %shared.cluster());

    async move {
        let ctx = DispatchContext {
            shared,
            target,
            retry: config.retry_config(),
            send_timeout: config.send_timeout_duration(),
        };
        let batch_size = config.batch_size.max(1);
        let mut limiter_rx = ctx.shared.limiter_changes();
        let mut read_failures = 0usize;

        info!(position = cursor.position(), "Starting dispatch loop");
        ctx.shared.record_ack(cursor.position());
        ctx.shared.set_status(ReplicatorStatus::Active);

        'dispatch: loop {
            if *cancel_rx.borrow() {
                break;
            }

            metrics::set_replication_backlog(ctx.shared.topic(), ctx.shared.cluster(), cursor.backlog());

            let batch = match cursor.next_batch(batch_size).await {
                Ok(batch) => {
                    read_failures = 0;
                    batch
                }
                Err(e) => {
                    read_failures += 1;
                    let delay = ctx.retry.delay_for_attempt(read_failures);
                    warn!(
                        error = %e,
                        attempt = read_failures,
                        backoff_ms = delay.as_millis() as u64,
                        position = cursor.position(),
                        "Log read failed, backing off"
                    );
                    metrics::record_log_read_failure(ctx.shared.topic());
                    if !sleep_or_cancel(delay, &mut cancel_rx).await {
                        break;
                    }
                    continue;
                }
            };

            if batch.is_empty() {
                // Caught up: park until the log grows.
                tokio::select! {
                    biased;
                    _ = cancelled(&mut cancel_rx) => break,
                    result = cursor.wait_for_entries() => {
                        if let Err(e) = result {
                            warn!(error = %e, "Waiting for new entries failed");
                            if !sleep_or_cancel(ctx.retry.initial_delay, &mut cancel_rx).await {
                                break;
                            }
                        }
                    }
                }
                continue;
            }

            debug!(entries = batch.len(), first = batch[0].position, "Read batch");

            for entry in &batch {
                match dispatch_entry(&ctx, &mut cursor, entry, &mut cancel_rx, &mut limiter_rx).await {
                    EntryOutcome::Acknowledged => {}
                    EntryOutcome::Cancelled => break 'dispatch,
                }
                if *cancel_rx.borrow() {
                    break 'dispatch;
                }
            }
        }

        ctx.shared.set_status(ReplicatorStatus::Stopping);
        info!(position = cursor.position(), "Dispatch loop stopping, flushing checkpoint");
        if let Err(e) = cursor.flush().await {
            warn!(error = %e, "Failed to flush checkpoint on stop");
        }
        ctx.shared.set_status(ReplicatorStatus::Stopped);
        info!(position = cursor.position(), "Dispatch loop stopped");
    }
    .instrument(span)
    .await
}

/// Throttle, send and acknowledge one entry. Retries until acknowledged or cancelled.
async fn dispatch_entry(
    ctx: &DispatchContext,
    cursor: &mut ReplicatorCursor,
    entry: &LogEntry,
    cancel_rx: &mut watch::Receiver<bool>,
    limiter_rx: &mut watch::Receiver<u64>,
) -> EntryOutcome {
    if !acquire_permits(ctx, entry, cancel_rx, limiter_rx).await {
        return EntryOutcome::Cancelled;
    }

    let shared = &ctx.shared;
    let mut attempt = 0usize;

    loop {
        let started = Instant::now();
        let result = shared
            .circuit()
            .call(|| async {
                match tokio::time::timeout(
                    ctx.send_timeout,
                    ctx.target.send(shared.cluster(), shared.topic(), entry),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(ReplicationError::remote(shared.cluster(), "send timed out")),
                }
            })
            .await;

        match result {
            Ok(()) => {
                metrics::record_send_latency(shared.cluster(), started.elapsed());
                metrics::record_entry_dispatched(shared.topic(), shared.cluster(), entry.size());
                shared.clear_degraded();

                if let Err(e) = cursor.advance(entry.position + 1).await {
                    // The log handed back an entry behind the cursor.
                    error!(error = %e, position = entry.position, "Cursor refused to advance");
                }
                shared.record_ack(cursor.position());
                return EntryOutcome::Acknowledged;
            }
            Err(e) => {
                attempt += 1;
                shared.mark_degraded();
                let reason = if e.is_rejected() { "circuit_open" } else { "send_error" };
                metrics::record_send_failure(shared.topic(), shared.cluster(), reason);

                let delay = ctx.retry.delay_for_attempt(attempt);
                warn!(
                    error = %e,
                    attempt,
                    position = entry.position,
                    backoff_ms = delay.as_millis() as u64,
                    "Send failed, retrying same entry"
                );
                if !sleep_or_cancel(delay, cancel_rx).await {
                    return EntryOutcome::Cancelled;
                }
            }
        }
    }
}

/// Wait until the limiter (if any) grants 1 message and `entry.size()` bytes.
/// Returns `false` on cancellation.
async fn acquire_permits(
    ctx: &DispatchContext,
    entry: &LogEntry,
    cancel_rx: &mut watch::Receiver<bool>,
    limiter_rx: &mut watch::Receiver<u64>,
) -> bool {
    let shared = &ctx.shared;

    loop {
        // Re-read every round: the policy may have been replaced or removed.
        let Some(limiter) = shared.limiter() else {
            break;
        };

        match limiter.try_acquire(1, entry.size() as u64) {
            Acquire::Granted => break,
            Acquire::Denied { wait } => {
                // A stopping replicator keeps its Stopping status.
                if *cancel_rx.borrow() {
                    return false;
                }
                if shared.status() != ReplicatorStatus::Throttled {
                    debug!(
                        position = entry.position,
                        wait_ms = wait.as_millis() as u64,
                        "Dispatch throttled"
                    );
                    shared.set_status(ReplicatorStatus::Throttled);
                }
                metrics::record_throttled(shared.topic(), shared.cluster());
                metrics::record_throttle_wait(shared.cluster(), wait);

                tokio::select! {
                    biased;
                    _ = cancelled(cancel_rx) => return false,
                    _ = limiter_rx.changed() => {
                        debug!("Dispatch rate changed while throttled");
                    }
                    _ = tokio::time::sleep(wait) => {}
                }
            }
        }
    }

    if shared.status() == ReplicatorStatus::Throttled {
        shared.set_status(ReplicatorStatus::Active);
    }
    true
}
