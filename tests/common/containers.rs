// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Testcontainers setup for Redis.
//!
//! A Redis container stands in for a remote cluster's replication endpoint.

use redis::AsyncCommands;
use testcontainers::{clients::Cli, core::WaitFor, Container, GenericImage};

/// Create a vanilla Redis container (streams-compatible).
///
/// Uses official redis:7 image. Waits for "Ready to accept connections".
pub fn redis_container(docker: &Cli) -> Container<'_, GenericImage> {
    let image = GenericImage::new("redis", "7-alpine")
        .with_exposed_port(6379)
        .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"));
    docker.run(image)
}

/// Get the Redis URL for a container.
pub fn redis_url(container: &Container<'_, GenericImage>) -> String {
    let port = container.get_host_port_ipv4(6379);
    format!("redis://127.0.0.1:{}", port)
}

/// A remote cluster backed by its own Redis container.
pub struct TestCluster<'a> {
    #[allow(dead_code)] // Kept alive for container lifetime
    container: Container<'a, GenericImage>,
    pub name: String,
    pub redis_url: String,
}

impl<'a> TestCluster<'a> {
    pub fn new(docker: &'a Cli, name: &str) -> Self {
        let container = redis_container(docker);
        let redis_url = redis_url(&container);
        Self {
            container,
            name: name.to_string(),
            redis_url,
        }
    }

    async fn connection(&self) -> redis::RedisResult<redis::aio::MultiplexedConnection> {
        let client = redis::Client::open(self.redis_url.as_str())?;
        client.get_multiplexed_async_connection().await
    }

    /// Length of a replication stream.
    pub async fn stream_len(&self, stream_key: &str) -> redis::RedisResult<usize> {
        let mut conn = self.connection().await?;
        conn.xlen(stream_key).await
    }

    /// `position` fields of a replication stream, in stream order.
    pub async fn positions(&self, stream_key: &str) -> redis::RedisResult<Vec<u64>> {
        let mut conn = self.connection().await?;
        let reply: redis::streams::StreamRangeReply = conn.xrange_all(stream_key).await?;

        Ok(reply
            .ids
            .iter()
            .filter_map(|id| id.get::<u64>("position"))
            .collect())
    }
}
