use async_trait::async_trait;
use redis::aio::{ConnectionLike, MultiplexedConnection};
use redis::AsyncCommands;
use std::collections::HashMap;
use std::time::Duration;

use crate::{Client, CustomRedisError};

// Keys fetched per SCAN round trip
const SCAN_COUNT: usize = 100;

pub struct RedisClient {
    connection: MultiplexedConnection,
}

impl RedisClient {
    /// Create a new RedisClient without timeouts
    ///
    /// Membership drivers need bounded calls, so prefer `with_config()` outside of tests.
    pub async fn new(addr: String) -> Result<RedisClient, CustomRedisError> {
        Self::with_config(addr, None, None).await
    }

    /// Create a new RedisClient with explicit timeouts
    ///
    /// # Arguments
    /// * `addr` - Redis connection string
    /// * `response_timeout` - Optional timeout for command responses. `None` means no timeout.
    /// * `connection_timeout` - Optional timeout for establishing connections. `None` means no timeout.
    ///
    /// # Errors
    /// Returns `CustomRedisError::InvalidConfiguration` if `Some(Duration::ZERO)` is passed - use `None` for no timeout instead.
    pub async fn with_config(
        addr: String,
        response_timeout: Option<Duration>,
        connection_timeout: Option<Duration>,
    ) -> Result<RedisClient, CustomRedisError> {
        let client = redis::Client::open(addr)?;
        validate_timeouts(response_timeout, connection_timeout)?;

        let mut config = redis::AsyncConnectionConfig::new();

        if let Some(timeout) = response_timeout {
            config = config.set_response_timeout(timeout);
        }

        if let Some(timeout) = connection_timeout {
            config = config.set_connection_timeout(timeout);
        }

        let connection = client
            .get_multiplexed_async_connection_with_config(&config)
            .await?;

        Ok(RedisClient { connection })
    }
}

pub(crate) fn validate_timeouts(
    response_timeout: Option<Duration>,
    connection_timeout: Option<Duration>,
) -> Result<(), CustomRedisError> {
    if response_timeout.is_some_and(|t| t.is_zero()) {
        return Err(CustomRedisError::InvalidConfiguration(
            "Redis response timeout cannot be Duration::ZERO - use None for no timeout".to_string(),
        ));
    }
    if connection_timeout.is_some_and(|t| t.is_zero()) {
        return Err(CustomRedisError::InvalidConfiguration(
            "Redis connection timeout cannot be Duration::ZERO - use None for no timeout"
                .to_string(),
        ));
    }
    Ok(())
}

// Command bodies shared by the single-node and cluster clients.
pub(crate) mod commands {
    use super::*;

    pub async fn psetex<C: ConnectionLike + Send + Sync>(
        conn: &mut C,
        k: String,
        v: String,
        millis: u64,
    ) -> Result<(), CustomRedisError> {
        if millis == 0 {
            return Err(CustomRedisError::InvalidConfiguration(
                "PSETEX expiry must be at least one millisecond".to_string(),
            ));
        }
        conn.pset_ex::<_, _, ()>(k, v, millis).await?;
        Ok(())
    }

    pub async fn del<C: ConnectionLike + Send + Sync>(
        conn: &mut C,
        k: String,
    ) -> Result<(), CustomRedisError> {
        conn.del::<_, ()>(k).await?;
        Ok(())
    }

    pub async fn zadd<C: ConnectionLike + Send + Sync>(
        conn: &mut C,
        k: String,
        member: String,
        score: i64,
    ) -> Result<(), CustomRedisError> {
        conn.zadd::<_, _, _, ()>(k, member, score).await?;
        Ok(())
    }

    pub async fn zrangebyscore<C: ConnectionLike + Send + Sync>(
        conn: &mut C,
        k: String,
        min: String,
        max: String,
    ) -> Result<Vec<String>, CustomRedisError> {
        let results = conn.zrangebyscore(k, min, max).await?;
        Ok(results)
    }

    pub async fn zrem<C: ConnectionLike + Send + Sync>(
        conn: &mut C,
        k: String,
        member: String,
    ) -> Result<(), CustomRedisError> {
        conn.zrem::<_, _, ()>(k, member).await?;
        Ok(())
    }

    pub async fn hset_nx<C: ConnectionLike + Send + Sync>(
        conn: &mut C,
        k: String,
        field: String,
        v: String,
    ) -> Result<bool, CustomRedisError> {
        let created: bool = conn.hset_nx(k, field, v).await?;
        Ok(created)
    }

    pub async fn hdel<C: ConnectionLike + Send + Sync>(
        conn: &mut C,
        k: String,
        field: String,
    ) -> Result<(), CustomRedisError> {
        conn.hdel::<_, _, ()>(k, field).await?;
        Ok(())
    }

    pub async fn hgetall<C: ConnectionLike + Send + Sync>(
        conn: &mut C,
        k: String,
    ) -> Result<HashMap<String, String>, CustomRedisError> {
        let result: HashMap<String, String> = conn.hgetall(k).await?;
        Ok(result)
    }
}

#[async_trait]
impl Client for RedisClient {
    async fn psetex(&self, k: String, v: String, millis: u64) -> Result<(), CustomRedisError> {
        let mut conn = self.connection.clone();
        commands::psetex(&mut conn, k, v, millis).await
    }

    async fn del(&self, k: String) -> Result<(), CustomRedisError> {
        let mut conn = self.connection.clone();
        commands::del(&mut conn, k).await
    }

    async fn keys_matching(&self, pattern: String) -> Result<Vec<String>, CustomRedisError> {
        // SCAN rather than KEYS so a large keyspace never blocks the server
        let mut conn = self.connection.clone();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        // SCAN may return a key more than once
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
