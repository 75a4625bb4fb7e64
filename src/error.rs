// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the replication dispatch engine.
//!
//! Errors are categorized by their source (remote cluster, log, policy store,
//! SQLite, etc.) and carry enough context to debug a single replicator.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Redis` | Yes | Network errors talking to a remote cluster's Redis |
//! | `RemoteSend` | Yes | Remote cluster did not acknowledge an entry |
//! | `LogRead` | Yes | Reading the local topic log failed |
//! | `PolicyStore` | Yes | Namespace policy store unreachable |
//! | `CursorStore` | No | Local SQLite errors (needs operator attention) |
//! | `Config` | No | Configuration invalid |
//! | `InvalidPolicy` | No | Dispatch rate policy failed validation |
//! | `InvalidTopicName` | No | Topic name could not be parsed |
//! | `CursorInUse` | No | A second writer tried to open a replication cursor |
//! | `InvalidState` | No | State machine violation |
//! | `Shutdown` | No | Service is shutting down |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! Use [`ReplicationError::is_retryable()`] to decide whether the dispatch
//! loop should back off and retry the same entry. Retryable errors never
//! advance the cursor.

use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Errors that can occur while replicating a topic to remote clusters.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// Redis connection or command error.
    ///
    /// Occurs when forwarding entries to a remote cluster's Redis stream.
    #[error("Redis error ({operation}): {message}")]
    Redis {
        operation: String,
        message: String,
        #[source]
        source: Option<redis::RedisError>,
    },

    /// The remote cluster rejected or did not acknowledge an entry.
    #[error("Remote send error ({cluster}): {message}")]
    RemoteSend { cluster: String, message: String },

    /// Reading from the local topic log failed.
    ///
    /// Surfaced to the dispatch loop, which backs off without advancing.
    #[error("Log read error ({topic}): {message}")]
    LogRead { topic: String, message: String },

    /// The namespace policy store could not be reached.
    ///
    /// The watcher keeps the last known-good policy and retries.
    #[error("Policy store error ({namespace}): {message}")]
    PolicyStore { namespace: String, message: String },

    /// SQLite error during cursor checkpointing.
    #[error("Cursor store error: {0}")]
    CursorStore(#[from] sqlx::Error),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A dispatch rate policy failed validation. The previous policy stays in effect.
    #[error("Invalid dispatch rate policy: {0}")]
    InvalidPolicy(String),

    /// Topic name is not of the form `persistent://tenant/namespace/topic`.
    #[error("Invalid topic name: {0}")]
    InvalidTopicName(String),

    /// The replication cursor for this (topic, cluster) is already held by another loop.
    #[error("Replication cursor already in use: {topic} -> {cluster}")]
    CursorInUse { topic: String, cluster: String },

    /// State machine violation.
    ///
    /// Occurs when an operation is attempted in the wrong state
    /// (e.g. starting an already-running service, or moving a cursor backwards).
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Create a Redis error from a redis::RedisError
    pub fn redis(operation: impl Into<String>, source: redis::RedisError) -> Self {
        Self::Redis {
            operation: operation.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a Redis error without source
    pub fn redis_msg(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Redis {
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a remote send error.
    pub fn remote(cluster: impl Into<String>, message: impl Into<String>) -> Self {
        Self::RemoteSend {
            cluster: cluster.into(),
            message: message.into(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Redis { .. } => true,
            Self::RemoteSend { .. } => true,
            Self::LogRead { .. } => true,
            Self::PolicyStore { .. } => true,
            Self::CursorStore(_) => false, // Local DB issues need attention
            Self::Config(_) => false,
            Self::InvalidPolicy(_) => false,
            Self::InvalidTopicName(_) => false,
            Self::CursorInUse { .. } => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }
}

impl From<redis::RedisError> for ReplicationError {
    fn from(e: redis::RedisError) -> Self {
        Self::redis("unknown", e)
    }
}
