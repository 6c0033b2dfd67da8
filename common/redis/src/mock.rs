use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

use crate::{Client, CustomRedisError};

/// In-memory stand-in for a Redis server.
///
/// Clones share the same keyspace, so several drivers built from clones of one
/// mock observe each other like processes sharing a real server. Expiry is
/// measured with `tokio::time::Instant`, which makes TTL behaviour deterministic
/// under a paused tokio clock. Glob patterns support a single trailing `*`.
#[derive(Clone, Default)]
pub struct MockRedisClient {
    state: Arc<Mutex<MockKeyspace>>,
    calls: Arc<Mutex<Vec<MockRedisCall>>>,
}

#[derive(Default)]
struct MockKeyspace {
    strings: HashMap<String, (String, Option<Instant>)>,
    zsets: HashMap<String, HashMap<String, i64>>,
    hashes: HashMap<String, HashMap<String, String>>,
    failures: HashMap<String, CustomRedisError>,
}

impl MockKeyspace {
    fn purge_expired(&mut self) {
        let now = Instant::now();
        self.strings
            .retain(|_, (_, expires_at)| expires_at.is_none_or(|at| at > now));
    }
}

#[derive(Debug, Clone)]
pub enum MockRedisValue {
    None,
    String(String),
    StringWithTTL(String, u64),
    Score(String, i64),
    MinMax(String, String),
    Field(String),
    FieldValue(String, String),
}

#[derive(Debug, Clone)]
pub struct MockRedisCall {
    pub op: String,
    pub key: String,
    pub value: MockRedisValue,
}

impl MockRedisClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_state(&self) -> MutexGuard<'_, MockKeyspace> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_calls(&self) -> MutexGuard<'_, Vec<MockRedisCall>> {
        match self.calls.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Make every subsequent call of `op` fail with `err` until `heal` is called.
    pub fn fail_op(&self, op: &str, err: CustomRedisError) -> Self {
        self.lock_state().failures.insert(op.to_owned(), err);
        self.clone()
    }

    pub fn heal(&self) {
        self.lock_state().failures.clear();
    }

    pub fn get_calls(&self) -> Vec<MockRedisCall> {
        self.lock_calls().clone()
    }

    /// Live string keys, sorted.
    pub fn live_keys(&self) -> Vec<String> {
        let mut state = self.lock_state();
        state.purge_expired();
        let mut keys: Vec<String> = state.strings.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let mut state = self.lock_state();
        state.purge_expired();
        let (_, expires_at) = state.strings.get(key)?;
        expires_at.map(|at| at.saturating_duration_since(Instant::now()))
    }

    pub fn zscore(&self, key: &str, member: &str) -> Option<i64> {
        self.lock_state()
            .zsets
            .get(key)
            .and_then(|set| set.get(member).copied())
    }

    fn record(&self, op: &str, key: &str, value: MockRedisValue) -> Result<(), CustomRedisError> {
        self.lock_calls().push(MockRedisCall {
            op: op.to_string(),
            key: key.to_string(),
            value,
        });
        match self.lock_state().failures.get(op) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

fn glob_matches(pattern: &str, key: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => key.starts_with(prefix),
        None => key == pattern,
    }
}

fn parse_bound(bound: &str) -> Result<f64, CustomRedisError> {
    match bound {
        "-inf" => Ok(f64::NEG_INFINITY),
        "+inf" | "inf" => Ok(f64::INFINITY),
        other => other
            .parse::<f64>()
            .map_err(|e| CustomRedisError::ParseError(format!("invalid score bound {other}: {e}"))),
    }
}

#[async_trait]
impl Client for MockRedisClient {
    async fn psetex(&self, key: String, value: String, millis: u64) -> Result<(), CustomRedisError> {
        self.record(
            "psetex",
            &key,
            MockRedisValue::StringWithTTL(value.clone(), millis),
        )?;
        if millis == 0 {
            return Err(CustomRedisError::InvalidConfiguration(
                "PSETEX expiry must be at least one millisecond".to_string(),
            ));
        }
        let expires_at = Instant::now() + Duration::from_millis(millis);
        self.lock_state()
            .strings
            .insert(key, (value, Some(expires_at)));
        Ok(())
    }

    async fn del(&self, key: String) -> Result<(), CustomRedisError> {
        self.record("del", &key, MockRedisValue::None)?;
        let mut state = self.lock_state();
        state.strings.remove(&key);
        state.zsets.remove(&key);
        state.hashes.remove(&key);
        Ok(())
    }

    async fn keys_matching(&self, pattern: String) -> Result<Vec<String>, CustomRedisError> {
        self.record("keys_matching", &pattern, MockRedisValue::None)?;
        let mut state = self.lock_state();
        state.purge_expired();
        let mut keys: Vec<String> = state
            .strings
            .keys()
            .chain(state.zsets.keys())
            .chain(state.hashes.keys())
            .filter(|key| glob_matches(&pattern, key))
            .cloned()
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn zadd(&self, key: String, member: String, score: i64) -> Result<(), CustomRedisError> {
        self.record("zadd", &key, MockRedisValue::Score(member.clone(), score))?;
        self.lock_state()
            .zsets
            .entry(key)
            .or_default()
            .insert(member, score);
        Ok(())
    }

    async fn zrangebyscore(
        &self,
        key: String,
        min: String,
        max: String,
    ) -> Result<Vec<String>, CustomRedisError> {
        self.record(
            "zrangebyscore",
            &key,
            MockRedisValue::MinMax(min.clone(), max.clone()),
        )?;
        let (min, max) = (parse_bound(&min)?, parse_bound(&max)?);
        let state = self.lock_state();
        let Some(set) = state.zsets.get(&key) else {
            return Ok(Vec::new());
        };
        let mut members: Vec<(i64, &String)> = set
            .iter()
            .filter(|(_, score)| {
                let score = **score as f64;
                score >= min && score <= max
            })
            .map(|(member, score)| (*score, member))
            .collect();
        members.sort();
        Ok(members.into_iter().map(|(_, m)| m.clone()).collect())
    }

    async fn zrem(&self, key: String, member: String) -> Result<(), CustomRedisError> {
        self.record("zrem", &key, MockRedisValue::String(member.clone()))?;
        let mut state = self.lock_state();
        if let Some(set) = state.zsets.get_mut(&key) {
            set.remove(&member);
            if set.is_empty() {
                state.zsets.remove(&key);
            }
        }
        Ok(())
    }

    async fn hset_nx(
        &self,
        key: String,
        field: String,
        value: String,
    ) -> Result<bool, CustomRedisError> {
        self.record(
            "hset_nx",
            &key,
            MockRedisValue::FieldValue(field.clone(), value.clone()),
        )?;
        let mut state = self.lock_state();
        let hash = state.hashes.entry(key).or_default();
        if hash.contains_key(&field) {
            return Ok(false);
        }
        hash.insert(field, value);
        Ok(true)
    }

    async fn hdel(&self, key: String, field: String) -> Result<(), CustomRedisError> {
        self.record("hdel", &key, MockRedisValue::Field(field.clone()))?;
        let mut state = self.lock_state();
        if let Some(hash) = state.hashes.get_mut(&key) {
            hash.remove(&field);
            if hash.is_empty() {
                state.hashes.remove(&key);
            }
        }
        Ok(())
    }

    async fn hgetall(&self, key: String) -> Result<HashMap<String, String>, CustomRedisError> {
        self.record("hgetall", &key, MockRedisValue::None)?;
        Ok(self
            .lock_state()
            .hashes
            .get(&key)
            .cloned()
            .unwrap_or_default())
    }
}
