mod common;

use std::cell::RefCell;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use common_redis::{Client, CustomRedisError, MockRedisClient};
use dcron_coordination::driver::new_node_id;
use dcron_coordination::hash::{crc32_ieee, DEFAULT_REPLICAS};
use dcron_coordination::{Error, HashRing, NodePool, PoolState};

async fn assert_partition(pools: &[Arc<NodePool>], jobs: &[String]) {
    let mut owners_seen = HashSet::new();
    for job in jobs {
        let owners: Vec<&str> = pools
            .iter()
            .filter(|p| p.check_job_available(job).expect("pool should be steady"))
            .map(|p| p.node_id())
            .collect();
        assert_eq!(owners.len(), 1, "{job} owned by {owners:?}");
        owners_seen.insert(owners[0].to_string());
    }
    assert_eq!(owners_seen.len(), pools.len(), "some node owns no jobs");
}

// ── Ring agreement ──────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn pools_build_identical_rings() {
    let redis = MockRedisClient::new();
    let service = test_service("ring-agreement");
    let pools: Vec<_> = (0..4)
        .map(|_| redis_pool(Backend::Ttl, &redis, &service))
        .collect();
    start_all(&pools).await;
    wait_for_convergence(&pools, 4).await;

    let snapshot = pools[0].nodes();
    for pool in &pools[1..] {
        assert_eq!(pool.nodes(), snapshot);
    }

    // Any process computing the ring from the same snapshot agrees with the pools
    let ring = HashRing::with_nodes(DEFAULT_REPLICAS, crc32_ieee, &snapshot);
    for job in job_names(200) {
        let owner = ring.get(&job).unwrap();
        let pool = pools.iter().find(|p| p.node_id() == owner).unwrap();
        assert!(pool.check_job_available(&job).unwrap());
    }
    stop_all(&pools).await;
}

// ── Ownership partition ─────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn each_job_has_exactly_one_owner_with_ttl_keys() {
    let redis = MockRedisClient::new();
    let service = test_service("partition-ttl");
    let pools: Vec<_> = (0..5)
        .map(|_| redis_pool(Backend::Ttl, &redis, &service))
        .collect();
    start_all(&pools).await;
    wait_for_convergence(&pools, 5).await;

    assert_partition(&pools, &job_names(500)).await;
    stop_all(&pools).await;
}

#[tokio::test(start_paused = true)]
async fn each_job_has_exactly_one_owner_with_sorted_set() {
    let redis = MockRedisClient::new();
    let service = test_service("partition-zset");
    let pools: Vec<_> = (0..3)
        .map(|_| redis_pool(Backend::SortedSet, &redis, &service))
        .collect();
    start_all(&pools).await;
    wait_for_convergence(&pools, 3).await;

    assert_partition(&pools, &job_names(300)).await;
    stop_all(&pools).await;
}

// ── Churn gating ────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn joining_node_gates_execution_until_convergence() {
    let redis = MockRedisClient::new();
    let service = test_service("churn-join");
    let mut pools: Vec<_> = (0..3)
        .map(|_| redis_pool(Backend::Ttl, &redis, &service))
        .collect();
    start_all(&pools).await;
    wait_for_convergence(&pools, 3).await;

    let newcomer = redis_pool(Backend::Ttl, &redis, &service);
    let starting = {
        let newcomer = newcomer.clone();
        tokio::spawn(async move { newcomer.start().await })
    };

    // Every existing pool must notice the join and withhold answers for a while
    let gated: RefCell<HashSet<String>> = RefCell::new(HashSet::new());
    wait_for_condition(WAIT_TIMEOUT, POLL_INTERVAL / 2, || {
        let mut gated = gated.borrow_mut();
        for pool in &pools {
            if matches!(
                pool.check_job_available("job-0"),
                Err(Error::NodePoolIsUpgrading)
            ) {
                gated.insert(pool.node_id().to_string());
            }
        }
        let done = gated.len() == pools.len();
        async move { done }
    })
    .await;

    starting.await.unwrap().unwrap();
    pools.push(newcomer);
    wait_for_convergence(&pools, 4).await;
    assert_partition(&pools, &job_names(400)).await;
    stop_all(&pools).await;
}

#[tokio::test(start_paused = true)]
async fn leaving_node_is_dropped_and_fleet_reconverges() {
    let redis = MockRedisClient::new();
    let service = test_service("churn-leave");
    let mut pools: Vec<_> = (0..3)
        .map(|_| redis_pool(Backend::Ttl, &redis, &service))
        .collect();
    start_all(&pools).await;
    wait_for_convergence(&pools, 3).await;

    let leaving = pools.pop().unwrap();
    leaving.stop().await.unwrap();

    // Upgrading after the change, steady again within two refresh intervals
    tokio::time::sleep(UPDATE_INTERVAL + Duration::from_millis(50)).await;
    for pool in &pools {
        assert_eq!(pool.nodes().len(), 2);
    }
    tokio::time::sleep(UPDATE_INTERVAL * 2).await;
    for pool in &pools {
        assert_eq!(pool.state(), PoolState::Steady);
    }
    assert_partition(&pools, &job_names(200)).await;
    stop_all(&pools).await;
}

#[tokio::test(start_paused = true)]
async fn crashed_node_expires_out_of_membership() {
    let redis = MockRedisClient::new();
    let service = test_service("churn-crash");
    let pools: Vec<_> = (0..2)
        .map(|_| redis_pool(Backend::Ttl, &redis, &service))
        .collect();
    start_all(&pools).await;
    wait_for_convergence(&pools, 2).await;

    // A node that registered once and then died without deregistering
    let ghost = new_node_id(&service);
    redis
        .psetex(ghost.clone(), ghost.clone(), 2_500)
        .await
        .unwrap();
    wait_for_convergence(&pools, 3).await;

    wait_for_condition(WAIT_TIMEOUT, POLL_INTERVAL, || async {
        pools.iter().all(|p| {
            p.state() == PoolState::Steady && p.nodes().len() == 2 && !p.nodes().contains(&ghost)
        })
    })
    .await;
    assert_partition(&pools, &job_names(200)).await;
    stop_all(&pools).await;
}

// ── Lifecycle ───────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn stop_then_start_rejoins_membership() {
    let redis = MockRedisClient::new();
    let service = test_service("lifecycle");
    let observer = redis_pool(Backend::Ttl, &redis, &service);
    let cycling = redis_pool(Backend::Ttl, &redis, &service);
    start_all(&[observer.clone(), cycling.clone()]).await;
    wait_for_convergence(&[observer.clone(), cycling.clone()], 2).await;

    for _ in 0..2 {
        cycling.stop().await.unwrap();
        wait_for_condition(WAIT_TIMEOUT, POLL_INTERVAL, || async {
            observer.nodes() == vec![observer.node_id().to_string()]
        })
        .await;

        cycling.start().await.unwrap();
        assert!(cycling.nodes().contains(&cycling.node_id().to_string()));
        wait_for_convergence(&[observer.clone(), cycling.clone()], 2).await;
    }
    stop_all(&[observer, cycling]).await;
}

#[tokio::test]
async fn stop_on_never_started_pool_is_ok() {
    let redis = MockRedisClient::new();
    let pool = redis_pool(Backend::Ttl, &redis, &test_service("never-started"));
    pool.stop().await.unwrap();
    assert!(matches!(
        pool.check_job_available("job"),
        Err(Error::NodePoolIsNil)
    ));
}

#[tokio::test(start_paused = true)]
async fn failed_first_registration_fails_start() {
    let redis = MockRedisClient::new().fail_op("psetex", CustomRedisError::Timeout);
    let pool = redis_pool(Backend::Ttl, &redis, &test_service("failed-start"));

    assert!(matches!(
        pool.start().await,
        Err(Error::Redis(CustomRedisError::Timeout))
    ));
    assert!(matches!(
        pool.check_job_available("job"),
        Err(Error::NodePoolIsNil)
    ));

    redis.heal();
    tokio::time::timeout(Duration::from_secs(10), pool.start())
        .await
        .unwrap()
        .unwrap();
    pool.stop().await.unwrap();
}
