// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication cursors and their durable checkpoints.
//!
//! Every (topic, remote cluster) pair has one [`ReplicatorCursor`]: the
//! position of the next entry to forward. It only moves forward, and only
//! after the remote cluster acknowledged everything before it.
//!
//! ```text
//! log:     [0][1][2][3][4][5][6][7]
//!                   ▲           ▲
//!          cursor.position()    log.end_position()
//!          (next to send)       (next to be written)
//! ```
//!
//! # Single Writer
//!
//! Opening a cursor takes an exclusive [`CursorLease`] from a shared
//! [`CursorLeases`] table. A second open for the same pair fails with
//! `CursorInUse` until the first cursor is dropped.
//!
//! # Checkpoints (SQLite)
//!
//! Positions are checkpointed in a [`CursorStore`] so a restarted broker
//! resumes where it stopped instead of re-sending the whole log.
//!
//! Writes are debounced:
//! - `set()` updates the in-memory cache immediately and marks the key dirty
//! - `flush_dirty()` persists all dirty keys in a batch
//! - the service calls `flush_dirty()` periodically, and every dispatch loop
//!   flushes once when it stops
//!
//! A crash between `set()` and `flush_dirty()` loses at most one flush
//! interval of progress; the affected entries are sent again on restart
//! (at-least-once).
//!
//! # SQLite Busy Handling
//!
//! SQLITE_BUSY/SQLITE_LOCKED are retried with exponential backoff
//! (up to 5 attempts). The cache is updated first, so a failed disk write
//! only delays durability.

use crate::error::{ReplicationError, Result};
use crate::log::{LogEntry, ManagedLog};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(operation_name: &str, mut f: F) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(operation = operation_name, attempts, "SQLite operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::cursor_retries_total(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => {
                if is_sqlite_busy_error(&e) {
                    warn!(operation = operation_name, attempts, "SQLite busy, max retries exceeded");
                }
                return Err(e);
            }
        }
    }
}

// =============================================================================
// Keys and Leases
// =============================================================================

/// Identity of one replication stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CursorKey {
    pub topic: String,
    pub cluster: String,
}

impl CursorKey {
    pub fn new(topic: impl Into<String>, cluster: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            cluster: cluster.into(),
        }
    }
}

impl std::fmt::Display for CursorKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}->{}", self.topic, self.cluster)
    }
}

/// Table of held cursor leases, shared by every replicator of a broker.
#[derive(Debug, Clone, Default)]
pub struct CursorLeases {
    held: Arc<DashMap<CursorKey, ()>>,
}

impl CursorLeases {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the exclusive lease for `key`.
    pub fn acquire(&self, key: CursorKey) -> Result<CursorLease> {
        match self.held.entry(key.clone()) {
            Entry::Occupied(_) => Err(ReplicationError::CursorInUse {
                topic: key.topic,
                cluster: key.cluster,
            }),
            Entry::Vacant(slot) => {
                slot.insert(());
                Ok(CursorLease {
                    key,
                    held: self.held.clone(),
                })
            }
        }
    }

    pub fn is_held(&self, key: &CursorKey) -> bool {
        self.held.contains_key(key)
    }
}

/// Exclusive right to move one cursor. Released on drop.
#[derive(Debug)]
pub struct CursorLease {
    key: CursorKey,
    held: Arc<DashMap<CursorKey, ()>>,
}

impl Drop for CursorLease {
    fn drop(&mut self) {
        self.held.remove(&self.key);
    }
}

// =============================================================================
// CursorStore (SQLite checkpoints)
// =============================================================================

/// Persistent checkpoint storage backed by SQLite.
///
/// Supports debounced writes: updates go to cache immediately,
/// and are flushed to disk periodically via `flush_dirty()`.
pub struct CursorStore {
    pool: SqlitePool,
    cache: Arc<RwLock<HashMap<CursorKey, u64>>>,
    dirty: Arc<RwLock<HashSet<CursorKey>>>,
    path: String,
}

impl CursorStore {
    /// Open (or create) a checkpoint database on disk, in WAL mode.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        info!(path = %path_str, "Initializing cursor store");

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path_str))
            .map_err(|e| ReplicationError::Config(format!("Invalid SQLite path: {}", e)))?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await?;

        Self::init(pool, path_str).await
    }

    /// In-process database (one connection, never recycled).
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| ReplicationError::Config(format!("Invalid SQLite path: {}", e)))?;

        // Each connection to :memory: is its own database, so pin exactly one.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Self::init(pool, ":memory:".to_string()).await
    }

    /// Open per configuration.
    pub async fn open(config: &crate::config::CursorConfig) -> Result<Self> {
        if config.is_in_memory() {
            Self::in_memory().await
        } else {
            Self::new(&config.sqlite_path).await
        }
    }

    async fn init(pool: SqlitePool, path: String) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS replication_cursors (
                topic TEXT NOT NULL,
                cluster TEXT NOT NULL,
                position INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (topic, cluster)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        let rows: Vec<(String, String, i64)> =
            sqlx::query_as("SELECT topic, cluster, position FROM replication_cursors")
                .fetch_all(&pool)
                .await?;

        let mut cache = HashMap::new();
        for (topic, cluster, position) in rows {
            debug!(topic = %topic, cluster = %cluster, position, "Loaded checkpoint from disk");
            cache.insert(CursorKey::new(topic, cluster), position.max(0) as u64);
        }

        if !cache.is_empty() {
            info!(count = cache.len(), "Restored checkpoints from previous run");
        }

        Ok(Self {
            pool,
            cache: Arc::new(RwLock::new(cache)),
            dirty: Arc::new(RwLock::new(HashSet::new())),
            path,
        })
    }

    /// Checkpointed position, `None` for a stream never checkpointed.
    pub async fn get(&self, key: &CursorKey) -> Option<u64> {
        self.cache.read().await.get(key).copied()
    }

    /// Checkpointed position, or 0 (start of the log).
    pub async fn get_or_start(&self, key: &CursorKey) -> u64 {
        self.get(key).await.unwrap_or(0)
    }

    /// Update the checkpoint (debounced).
    pub async fn set(&self, key: &CursorKey, position: u64) {
        self.cache.write().await.insert(key.clone(), position);
        self.dirty.write().await.insert(key.clone());
        debug!(cursor = %key, position, "Checkpoint updated (pending flush)");
    }

    /// Flush all dirty checkpoints to disk. Returns the number flushed.
    pub async fn flush_dirty(&self) -> Result<usize> {
        let dirty_keys: Vec<CursorKey> = {
            let mut dirty = self.dirty.write().await;
            dirty.drain().collect()
        };

        if dirty_keys.is_empty() {
            return Ok(0);
        }

        let now = chrono::Utc::now().timestamp_millis();
        let snapshot: Vec<(CursorKey, u64)> = {
            let cache = self.cache.read().await;
            dirty_keys
                .iter()
                .filter_map(|k| cache.get(k).map(|p| (k.clone(), *p)))
                .collect()
        };
        let pool = &self.pool;

        let mut flushed = 0;
        let mut errors = 0;

        for (key, position) in &snapshot {
            let result = execute_with_retry("cursor_flush", || async {
                sqlx::query(
                    r#"
                    INSERT INTO replication_cursors (topic, cluster, position, updated_at)
                    VALUES (?, ?, ?, ?)
                    ON CONFLICT(topic, cluster) DO UPDATE SET
                        position = excluded.position,
                        updated_at = excluded.updated_at
                    "#,
                )
                .bind(&key.topic)
                .bind(&key.cluster)
                .bind(*position as i64)
                .bind(now)
                .execute(pool)
                .await
            })
            .await;

            match result {
                Ok(_) => flushed += 1,
                Err(e) => {
                    errors += 1;
                    warn!(cursor = %key, error = %e, "Failed to flush checkpoint");
                    // Re-mark as dirty so we retry next flush
                    self.dirty.write().await.insert(key.clone());
                }
            }
        }

        if flushed > 0 || errors > 0 {
            debug!(flushed, errors, "Flushed dirty checkpoints");
            crate::metrics::record_cursor_flush(flushed, errors);
        }

        if errors > 0 {
            return Err(ReplicationError::Internal(format!(
                "Failed to flush {} checkpoints",
                errors
            )));
        }

        Ok(flushed)
    }

    pub async fn has_dirty(&self) -> bool {
        !self.dirty.read().await.is_empty()
    }

    pub async fn dirty_count(&self) -> usize {
        self.dirty.read().await.len()
    }

    /// Delete a checkpoint (destination removed from the namespace).
    pub async fn delete(&self, key: &CursorKey) -> Result<()> {
        self.cache.write().await.remove(key);
        self.dirty.write().await.remove(key);

        let pool = &self.pool;
        execute_with_retry("cursor_delete", || async {
            sqlx::query("DELETE FROM replication_cursors WHERE topic = ? AND cluster = ?")
                .bind(&key.topic)
                .bind(&key.cluster)
                .execute(pool)
                .await
        })
        .await?;

        info!(cursor = %key, "Deleted checkpoint");
        Ok(())
    }

    /// All checkpoints (for diagnostics).
    pub async fn get_all(&self) -> HashMap<CursorKey, u64> {
        self.cache.read().await.clone()
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Force flush WAL to main database (for clean shutdown).
    pub async fn checkpoint(&self) -> Result<()> {
        let pool = &self.pool;
        execute_with_retry("cursor_checkpoint", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").execute(pool).await
        })
        .await?;

        debug!("WAL checkpoint complete");
        Ok(())
    }

    /// Flush dirty checkpoints, checkpoint the WAL, close the pool.
    pub async fn close(&self) {
        if self.has_dirty().await {
            match self.flush_dirty().await {
                Ok(count) if count > 0 => info!(count, "Flushed dirty checkpoints on close"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Failed to flush dirty checkpoints on close"),
            }
        }

        if let Err(e) = self.checkpoint().await {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!("Cursor store closed");
    }
}

// =============================================================================
// ReplicatorCursor
// =============================================================================

/// Read position of one replicator into its topic log.
pub struct ReplicatorCursor {
    key: CursorKey,
    log: Arc<dyn ManagedLog>,
    store: Option<Arc<CursorStore>>,
    position: u64,
    _lease: CursorLease,
}

impl ReplicatorCursor {
    /// Take the lease and restore the position from the checkpoint (or 0).
    pub async fn open(
        key: CursorKey,
        log: Arc<dyn ManagedLog>,
        leases: &CursorLeases,
        store: Option<Arc<CursorStore>>,
    ) -> Result<Self> {
        let lease = leases.acquire(key.clone())?;

        let position = match &store {
            Some(store) => store.get_or_start(&key).await,
            None => 0,
        };
        if position > 0 {
            info!(cursor = %key, position, "Resuming from checkpoint");
        }

        Ok(Self {
            key,
            log,
            store,
            position,
            _lease: lease,
        })
    }

    pub fn key(&self) -> &CursorKey {
        &self.key
    }

    /// Position of the next entry to send (everything before it is acknowledged).
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Entries written but not yet acknowledged.
    pub fn backlog(&self) -> u64 {
        self.log.end_position().saturating_sub(self.position)
    }

    /// Next entries after the acknowledged position.
    ///
    /// Always starts at the acknowledged position, so a batch abandoned
    /// halfway is re-read from its first unacknowledged entry.
    pub async fn next_batch(&self, max_entries: usize) -> Result<Vec<LogEntry>> {
        self.log.read(self.position, max_entries.max(1)).await
    }

    /// Suspend until the log has an entry at the current position.
    pub async fn wait_for_entries(&self) -> Result<()> {
        self.log.wait_for_entries(self.position).await
    }

    /// Move past acknowledged entries. `up_to` is the new next-to-send position.
    pub async fn advance(&mut self, up_to: u64) -> Result<()> {
        if up_to < self.position {
            return Err(ReplicationError::InvalidState {
                expected: format!("position >= {}", self.position),
                actual: up_to.to_string(),
            });
        }
        if up_to == self.position {
            return Ok(());
        }
        self.position = up_to;
        if let Some(store) = &self.store {
            store.set(&self.key, up_to).await;
        }
        Ok(())
    }

    /// Persist the checkpoint now.
    pub async fn flush(&self) -> Result<()> {
        match &self.store {
            Some(store) => store.flush_dirty().await.map(|_| ()),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for ReplicatorCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicatorCursor")
            .field("key", &self.key)
            .field("position", &self.position)
            .finish()
    }
}
