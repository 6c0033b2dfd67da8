use async_trait::async_trait;
use redis::cluster::ClusterClient;
use redis::cluster_async::ClusterConnection;
use std::collections::HashMap;
use std::time::Duration;

use crate::client::{commands, validate_timeouts};
use crate::{Client, CustomRedisError};

/// Redis Cluster client. Keyed commands are routed by slot; `keys_matching`
/// fans out to every master and concatenates the results.
pub struct RedisClusterClient {
    connection: ClusterConnection,
}

impl RedisClusterClient {
    pub async fn new(nodes: Vec<String>) -> Result<RedisClusterClient, CustomRedisError> {
        Self::with_config(nodes, None, None).await
    }

    pub async fn with_config(
        nodes: Vec<String>,
        response_timeout: Option<Duration>,
        connection_timeout: Option<Duration>,
    ) -> Result<RedisClusterClient, CustomRedisError> {
        if nodes.is_empty() {
            return Err(CustomRedisError::InvalidConfiguration(
                "Redis cluster requires at least one seed node".to_string(),
            ));
        }
        validate_timeouts(response_timeout, connection_timeout)?;

        let mut builder = ClusterClient::builder(nodes);
        if let Some(timeout) = response_timeout {
            builder = builder.response_timeout(timeout);
        }
        if let Some(timeout) = connection_timeout {
            builder = builder.connection_timeout(timeout);
        }

        let connection = builder.build()?.get_async_connection().await?;
        Ok(RedisClusterClient { connection })
    }
}

#[async_trait]
impl Client for RedisClusterClient {
    async fn psetex(&self, k: String, v: String, millis: u64) -> Result<(), CustomRedisError> {
        let mut conn = self.connection.clone();
        commands::psetex(&mut conn, k, v, millis).await
    }

    async fn del(&self, k: String) -> Result<(), CustomRedisError> {
        let mut conn = self.connection.clone();
        commands::del(&mut conn, k).await
    }

    async fn keys_matching(&self, pattern: String) -> Result<Vec<String>, CustomRedisError> {
        // SCAN cursors are per node, KEYS is routed to all masters and combined
        let mut conn = self.connection.clone();
        let mut keys: Vec<String> = redis::cmd("KEYS")
            .arg(pattern)
            .query_async(&mut conn)
            .await?;
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn zadd(&self, k: String, member: String, score: i64) -> Result<(), CustomRedisError> {
        let mut conn = self.connection.clone();
        commands::zadd(&mut conn, k, member, score).await
    }

    async fn zrangebyscore(
        &self,
        k: String,
        min: String,
        max: String,
    ) -> Result<Vec<String>, CustomRedisError> {
        let mut conn = self.connection.clone();
        commands::zrangebyscore(&mut conn, k, min, max).await
    }

    async fn zrem(&self, k: String, member: String) -> Result<(), CustomRedisError> {
        let mut conn = self.connection.clone();
        commands::zrem(&mut conn, k, member).await
    }

    async fn hset_nx(
        &self,
        k: String,
        field: String,
        v: String,
    ) -> Result<bool, CustomRedisError> {
        let mut conn = self.connection.clone();
        commands::hset_nx(&mut conn, k, field, v).await
    }

    async fn hdel(&self, k: String, field: String) -> Result<(), CustomRedisError> {
        let mut conn = self.connection.clone();
        commands::hdel(&mut conn, k, field).await
    }

    async fn hgetall(&self, k: String) -> Result<HashMap<String, String>, CustomRedisError> {
        let mut conn = self.connection.clone();
        commands::hgetall(&mut conn, k).await
    }
}
