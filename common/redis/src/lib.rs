use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum CustomRedisError {
    #[error("Not found in redis")]
    NotFound,
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Timeout error")]
    Timeout,
    #[error(transparent)]
    Redis(#[from] Arc<redis::RedisError>),
}

impl From<redis::RedisError> for CustomRedisError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() {
            CustomRedisError::Timeout
        } else {
            CustomRedisError::Redis(Arc::new(err))
        }
    }
}

/// The subset of Redis commands used for membership and job bookkeeping.
///
/// Implemented for a single node (`RedisClient`), a cluster (`RedisClusterClient`)
/// and an in-memory fake (`MockRedisClient`).
#[async_trait]
pub trait Client: Send + Sync {
    /// SET with a millisecond expiry (PSETEX).
    async fn psetex(&self, k: String, v: String, millis: u64) -> Result<(), CustomRedisError>;

    async fn del(&self, k: String) -> Result<(), CustomRedisError>;

    /// All keys matching a glob pattern. On a cluster this spans every master.
    async fn keys_matching(&self, pattern: String) -> Result<Vec<String>, CustomRedisError>;

    async fn zadd(&self, k: String, member: String, score: i64) -> Result<(), CustomRedisError>;

    async fn zrangebyscore(
        &self,
        k: String,
        min: String,
        max: String,
    ) -> Result<Vec<String>, CustomRedisError>;

    async fn zrem(&self, k: String, member: String) -> Result<(), CustomRedisError>;

    /// HSETNX. Returns `false` if the field already existed.
    async fn hset_nx(&self, k: String, field: String, v: String)
        -> Result<bool, CustomRedisError>;

    async fn hdel(&self, k: String, field: String) -> Result<(), CustomRedisError>;

    async fn hgetall(&self, k: String) -> Result<HashMap<String, String>, CustomRedisError>;
}

mod client;
mod cluster;
mod mock;

pub use client::RedisClient;
pub use cluster::RedisClusterClient;
pub use mock::{MockRedisCall, MockRedisClient, MockRedisValue};
