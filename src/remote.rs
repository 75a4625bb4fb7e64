// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Remote cluster transport.
//!
//! [`ReplicationTarget::send`] forwards one entry to a remote cluster and
//! resolves when the remote acknowledges it. The dispatch loop only advances
//! its cursor after that resolution.
//!
//! # Implementations
//!
//! - [`RedisStreamTarget`]: appends entries with `XADD` to a per-topic
//!   stream on the remote cluster's Redis (lazy, one `ConnectionManager`
//!   per cluster)
//! - [`NoOpTarget`]: acknowledges everything (benchmarks, dry runs)
//!
//! # Stream Entry Layout
//!
//! ```text
//! XADD replication:persistent://tenant/ns/topic * \
//!     position <u64> source <local cluster> publish_time_ms <u64> payload <bytes>
//! ```

use crate::config::ClusterConfig;
use crate::error::{ReplicationError, Result};
use crate::log::LogEntry;
use crate::BoxFuture;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::Client;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Sends entries to remote clusters.
pub trait ReplicationTarget: Send + Sync + 'static {
    /// Forward `entry` of `topic` to `cluster`. Resolves on acknowledgment.
    fn send<'a>(&'a self, cluster: &'a str, topic: &'a str, entry: &'a LogEntry) -> BoxFuture<'a, ()>;
}

/// Target that acknowledges every send without doing anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpTarget;

impl ReplicationTarget for NoOpTarget {
    fn send<'a>(&'a self, _cluster: &'a str, _topic: &'a str, _entry: &'a LogEntry) -> BoxFuture<'a, ()> {
        Box::pin(async { Ok(()) })
    }
}

/// Forwards entries to each remote cluster's Redis stream.
pub struct RedisStreamTarget {
    local_cluster: String,
    clusters: HashMap<String, ClusterConfig>,
    connections: DashMap<String, ConnectionManager>,
    connect_timeout: Duration,
}

impl RedisStreamTarget {
    pub fn new(local_cluster: impl Into<String>, clusters: Vec<ClusterConfig>, connect_timeout: Duration) -> Self {
        Self {
            local_cluster: local_cluster.into(),
            clusters: clusters.into_iter().map(|c| (c.name.clone(), c)).collect(),
            connections: DashMap::new(),
            connect_timeout,
        }
    }

    fn cluster_config(&self, cluster: &str) -> Result<&ClusterConfig> {
        self.clusters
            .get(cluster)
            .ok_or_else(|| ReplicationError::remote(cluster, "no endpoint configured for cluster"))
    }

    /// Get the cluster's connection, connecting lazily.
    async fn connection(&self, cluster: &str) -> Result<ConnectionManager> {
        // ConnectionManager is Clone and multiplexed, so handing out clones is cheap.
        if let Some(conn) = self.connections.get(cluster) {
            return Ok(conn.clone());
        }

        let config = self.cluster_config(cluster)?;
        info!(cluster, url = %config.redis_url, "Connecting to remote cluster");

        let client = Client::open(config.redis_url.as_str())
            .map_err(|e| ReplicationError::remote(cluster, format!("Invalid Redis URL: {}", e)))?;

        let conn = match timeout(self.connect_timeout, client.get_connection_manager()).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                warn!(cluster, error = %e, "Remote cluster connection failed");
                return Err(ReplicationError::redis("connect", e));
            }
            Err(_) => {
                warn!(
                    cluster,
                    timeout_ms = self.connect_timeout.as_millis() as u64,
                    "Remote cluster connection timed out"
                );
                return Err(ReplicationError::remote(cluster, "connection timed out"));
            }
        };

        self.connections.insert(cluster.to_string(), conn.clone());
        Ok(conn)
    }

    /// Drop a cluster's connection so the next send reconnects.
    pub fn mark_disconnected(&self, cluster: &str) {
        if self.connections.remove(cluster).is_some() {
            warn!(cluster, "Remote connection marked as disconnected");
        }
    }
}

impl ReplicationTarget for RedisStreamTarget {
    fn send<'a>(&'a self, cluster: &'a str, topic: &'a str, entry: &'a LogEntry) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let key = self.cluster_config(cluster)?.stream_key(topic);
            let mut conn = self.connection(cluster).await?;

            let result: redis::RedisResult<String> = redis::cmd("XADD")
                .arg(&key)
                .arg("*")
                .arg("position")
                .arg(entry.position)
                .arg("source")
                .arg(&self.local_cluster)
                .arg("publish_time_ms")
                .arg(entry.publish_time_ms)
                .arg("payload")
                .arg(entry.payload.as_slice())
                .query_async(&mut conn)
                .await;

            match result {
                Ok(id) => {
                    debug!(cluster, topic, position = entry.position, stream_id = %id, "Entry acknowledged");
                    Ok(())
                }
                Err(e) => {
                    if e.is_io_error() || e.is_connection_dropped() {
                        self.mark_disconnected(cluster);
                    }
                    Err(ReplicationError::redis("XADD", e))
                }
            }
        })
    }
}
