#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use common_redis::MockRedisClient;
use dcron_coordination::driver::{Driver, RedisDriver, RedisZSetDriver};
use dcron_coordination::{NodePool, NodePoolConfig, PoolState};

pub const ETCD_ENDPOINT: &str = "http://localhost:2379";
pub const UPDATE_INTERVAL: Duration = Duration::from_secs(1);
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(30);
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Polls with the tokio clock so it also works under `start_paused`.
pub async fn wait_for_condition<F, Fut>(timeout: Duration, interval: Duration, f: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout {
        if f().await {
            return;
        }
        tokio::time::sleep(interval).await;
    }
    panic!("condition not met within {timeout:?}");
}

pub fn test_service(test_name: &str) -> String {
    format!("test-{}-{}", test_name, uuid::Uuid::new_v4())
}

pub fn pool_config() -> NodePoolConfig {
    NodePoolConfig {
        update_interval: UPDATE_INTERVAL,
        ..Default::default()
    }
}

// ── Pool builders ───────────────────────────────────────────────

#[derive(Clone, Copy)]
pub enum Backend {
    Ttl,
    SortedSet,
}

pub fn redis_pool(backend: Backend, redis: &MockRedisClient, service: &str) -> Arc<NodePool> {
    let client = Arc::new(redis.clone());
    let driver: Box<dyn Driver> = match backend {
        Backend::Ttl => Box::new(RedisDriver::new(client)),
        Backend::SortedSet => Box::new(RedisZSetDriver::new(client)),
    };
    Arc::new(NodePool::new(service, driver, pool_config()))
}

/// Start every pool concurrently, as a fleet booting together would.
pub async fn start_all(pools: &[Arc<NodePool>]) {
    let handles: Vec<_> = pools
        .iter()
        .cloned()
        .map(|pool| tokio::spawn(async move { pool.start().await }))
        .collect();
    for handle in handles {
        handle
            .await
            .expect("start task panicked")
            .expect("pool failed to start");
    }
}

pub async fn stop_all(pools: &[Arc<NodePool>]) {
    for pool in pools {
        pool.stop().await.expect("pool failed to stop");
    }
}

/// Wait until every pool is steady on a membership of `expected` nodes.
pub async fn wait_for_convergence(pools: &[Arc<NodePool>], expected: usize) {
    wait_for_condition(WAIT_TIMEOUT, POLL_INTERVAL, || async {
        pools
            .iter()
            .all(|p| p.state() == PoolState::Steady && p.nodes().len() == expected)
    })
    .await;
}

pub fn job_names(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("job-{i}")).collect()
}
