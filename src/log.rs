// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Topic log abstraction.
//!
//! Replicators never write to the log; they only read from their own
//! position. The storage engine is external, so it is reached through two
//! traits:
//!
//! - [`LogProvider`]: opens the log of a topic
//! - [`ManagedLog`]: positional reads plus a "new data" wait
//!
//! [`InMemoryLog`] is the reference implementation: an append-only vector
//! with a [`Notify`] for appends.
//!
//! # Positions
//!
//! Positions are dense and start at 0. `end_position()` is the position the
//! next append will get, so `read(p, n)` returns nothing iff `p >= end`.

use crate::error::{ReplicationError, Result};
use crate::policy::TopicName;
use crate::BoxFuture;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Notify, RwLock};

/// One stored message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub position: u64,
    pub payload: Vec<u8>,
    pub publish_time_ms: u64,
}

impl LogEntry {
    /// Payload size in bytes (what the byte dimension is charged).
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

/// Read side of a topic log.
pub trait ManagedLog: Send + Sync + 'static {
    /// Read up to `max_entries` entries starting at `from`.
    fn read(&self, from: u64, max_entries: usize) -> BoxFuture<'_, Vec<LogEntry>>;

    /// Position the next append will receive.
    fn end_position(&self) -> u64;

    /// Resolve once the log holds an entry at `position` (i.e. `end > position`).
    fn wait_for_entries(&self, position: u64) -> BoxFuture<'_, ()>;
}

/// Opens topic logs.
pub trait LogProvider: Send + Sync + 'static {
    fn open(&self, topic: &TopicName) -> BoxFuture<'_, Arc<dyn ManagedLog>>;
}

/// In-memory append-only log.
pub struct InMemoryLog {
    topic: String,
    entries: RwLock<Vec<LogEntry>>,
    end: AtomicU64,
    appended: Notify,
    /// Remaining reads to fail (fault injection).
    failing_reads: AtomicUsize,
}

impl InMemoryLog {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            entries: RwLock::new(Vec::new()),
            end: AtomicU64::new(0),
            appended: Notify::new(),
            failing_reads: AtomicUsize::new(0),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Append a message, returning its position.
    pub async fn append(&self, payload: impl Into<Vec<u8>>) -> u64 {
        let mut entries = self.entries.write().await;
        let position = entries.len() as u64;
        entries.push(LogEntry {
            position,
            payload: payload.into(),
            publish_time_ms: chrono::Utc::now().timestamp_millis().max(0) as u64,
        });
        self.end.store(position + 1, Ordering::Release);
        drop(entries);
        self.appended.notify_waiters();
        position
    }

    /// Make the next `count` reads fail.
    pub fn fail_next_reads(&self, count: usize) {
        self.failing_reads.store(count, Ordering::Release);
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_reads
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl ManagedLog for InMemoryLog {
    fn read(&self, from: u64, max_entries: usize) -> BoxFuture<'_, Vec<LogEntry>> {
        Box::pin(async move {
            if self.take_injected_failure() {
                return Err(ReplicationError::LogRead {
                    topic: self.topic.clone(),
                    message: "injected read failure".to_string(),
                });
            }
            let entries = self.entries.read().await;
            let start = (from as usize).min(entries.len());
            let end = start.saturating_add(max_entries).min(entries.len());
            Ok(entries[start..end].to_vec())
        })
    }

    fn end_position(&self) -> u64 {
        self.end.load(Ordering::Acquire)
    }

    fn wait_for_entries(&self, position: u64) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            loop {
                // Register before checking so an append in between is not missed.
                let notified = self.appended.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                if self.end_position() > position {
                    return Ok(());
                }
                notified.await;
            }
        })
    }
}

/// Hands out one shared [`InMemoryLog`] per topic, creating it on first use.
#[derive(Default)]
pub struct InMemoryLogProvider {
    logs: DashMap<String, Arc<InMemoryLog>>,
}

impl InMemoryLogProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// The log of `topic`, for producers.
    pub fn log(&self, topic: &str) -> Arc<InMemoryLog> {
        self.logs
            .entry(topic.to_string())
            .or_insert_with(|| Arc::new(InMemoryLog::new(topic)))
            .clone()
    }
}

impl LogProvider for InMemoryLogProvider {
    fn open(&self, topic: &TopicName) -> BoxFuture<'_, Arc<dyn ManagedLog>> {
        let log: Arc<dyn ManagedLog> = self.log(topic.as_str());
        Box::pin(async move { Ok(log) })
    }
}
