// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Namespace policy types.
//!
//! A namespace carries two pieces of configuration this engine cares about:
//!
//! - the set of clusters its topics replicate to, and
//! - the replicator dispatch rate applied to every (topic, cluster) stream.
//!
//! # Dispatch Rate
//!
//! ```text
//! DispatchRatePolicy { messageDispatchRate: 100, byteDispatchRate: -1, ratePeriodSeconds: 360 }
//!                      └─ 100 msgs per 360s ─┘   └─ disabled ─┘
//! ```
//!
//! `-1` disables a dimension. A policy with both dimensions disabled means
//! "no throttling" and results in no rate limiter at all.

use crate::error::{ReplicationError, Result};
use serde::{Deserialize, Serialize};

/// Rate value marking a disabled dimension.
pub const RATE_DISABLED: i64 = -1;

/// Throughput ceiling for a replicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchRatePolicy {
    /// Messages per period, or `-1` when disabled.
    pub message_dispatch_rate: i64,
    /// Bytes per period, or `-1` when disabled.
    pub byte_dispatch_rate: i64,
    /// Length of the rate period in seconds (must be > 0).
    pub rate_period_seconds: i64,
}

impl Default for DispatchRatePolicy {
    fn default() -> Self {
        Self::unlimited()
    }
}

impl DispatchRatePolicy {
    pub fn new(message_dispatch_rate: i64, byte_dispatch_rate: i64, rate_period_seconds: i64) -> Self {
        Self {
            message_dispatch_rate,
            byte_dispatch_rate,
            rate_period_seconds,
        }
    }

    /// Message dimension only.
    pub fn messages(rate: i64, period_secs: i64) -> Self {
        Self::new(rate, RATE_DISABLED, period_secs)
    }

    /// Byte dimension only.
    pub fn bytes(rate: i64, period_secs: i64) -> Self {
        Self::new(RATE_DISABLED, rate, period_secs)
    }

    /// Both dimensions disabled.
    pub fn unlimited() -> Self {
        Self::new(RATE_DISABLED, RATE_DISABLED, 1)
    }

    pub fn is_message_enabled(&self) -> bool {
        self.message_dispatch_rate != RATE_DISABLED
    }

    pub fn is_byte_enabled(&self) -> bool {
        self.byte_dispatch_rate != RATE_DISABLED
    }

    /// True when at least one dimension is enabled, i.e. a limiter must exist.
    pub fn is_throttling(&self) -> bool {
        self.is_message_enabled() || self.is_byte_enabled()
    }

    /// Validate field ranges.
    pub fn validate(&self) -> Result<()> {
        if self.message_dispatch_rate < RATE_DISABLED {
            return Err(ReplicationError::InvalidPolicy(format!(
                "messageDispatchRate must be -1 or >= 0, got {}",
                self.message_dispatch_rate
            )));
        }
        if self.byte_dispatch_rate < RATE_DISABLED {
            return Err(ReplicationError::InvalidPolicy(format!(
                "byteDispatchRate must be -1 or >= 0, got {}",
                self.byte_dispatch_rate
            )));
        }
        if self.rate_period_seconds <= 0 {
            return Err(ReplicationError::InvalidPolicy(format!(
                "ratePeriodSeconds must be > 0, got {}",
                self.rate_period_seconds
            )));
        }
        Ok(())
    }
}

/// Replication-related policies of one namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamespacePolicies {
    /// Clusters the namespace replicates to, in configuration order.
    #[serde(default)]
    pub replication_clusters: Vec<String>,

    /// Dispatch rate applied to every replicator of the namespace.
    #[serde(default)]
    pub replicator_dispatch_rate: Option<DispatchRatePolicy>,
}

impl NamespacePolicies {
    /// Set the cluster list, dropping duplicates but keeping first-seen order.
    pub fn set_clusters<I, S>(&mut self, clusters: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut out: Vec<String> = Vec::new();
        for c in clusters {
            let c = c.into();
            if !out.contains(&c) {
                out.push(c);
            }
        }
        self.replication_clusters = out;
    }
}

/// Policies as returned by a store, stamped with a monotonically increasing version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedPolicies {
    pub version: u64,
    pub policies: NamespacePolicies,
}

/// A parsed `persistent://tenant/namespace/topic` name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicName {
    full: String,
    namespace: String,
    local_name: String,
}

impl TopicName {
    /// Parse a fully qualified topic name.
    pub fn parse(name: &str) -> Result<Self> {
        let rest = name
            .strip_prefix("persistent://")
            .or_else(|| name.strip_prefix("non-persistent://"))
            .ok_or_else(|| ReplicationError::InvalidTopicName(name.to_string()))?;

        let mut parts = rest.splitn(3, '/');
        let tenant = parts.next().unwrap_or_default();
        let namespace = parts.next().unwrap_or_default();
        let local = parts.next().unwrap_or_default();

        if tenant.is_empty() || namespace.is_empty() || local.is_empty() {
            return Err(ReplicationError::InvalidTopicName(name.to_string()));
        }

        Ok(Self {
            full: name.to_string(),
            namespace: format!("{}/{}", tenant, namespace),
            local_name: local.to_string(),
        })
    }

    /// `tenant/namespace`
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn local_name(&self) -> &str {
        &self.local_name
    }

    pub fn as_str(&self) -> &str {
        &self.full
    }
}

impl std::fmt::Display for TopicName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.full)
    }
}
