use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Dispatch};

use crate::driver::{Driver, DriverOptions};
use crate::error::{Error, Result};
use crate::hash::{crc32_ieee, HashFn, HashRing, DEFAULT_REPLICAS};
use crate::metrics_consts::{MEMBERSHIP_REFRESH_ERRORS, NODES, RING_REBUILDS};
use crate::util::{normalize_nodes, BackgroundTask};

pub const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PoolState {
    /// Membership changed on the last refresh; ownership answers are withheld.
    Upgrading = 0,
    /// Two consecutive refreshes agreed.
    Steady = 1,
}

/// `PoolState` behind an atomic.
#[derive(Debug)]
pub struct AtomicPoolState(AtomicU8);

impl AtomicPoolState {
    pub const fn new(state: PoolState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn load(&self) -> PoolState {
        Self::decode(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, state: PoolState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Store `state` and return the previous one.
    pub fn swap(&self, state: PoolState) -> PoolState {
        Self::decode(self.0.swap(state as u8, Ordering::AcqRel))
    }

    fn decode(raw: u8) -> PoolState {
        if raw == PoolState::Steady as u8 {
            PoolState::Steady
        } else {
            PoolState::Upgrading
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodePoolConfig {
    /// Membership refresh period; also the liveness timeout handed to the driver.
    pub update_interval: Duration,
    pub hash_replicas: usize,
    pub hash_fn: HashFn,
    /// Sink for the pool's and driver's background loops.
    pub dispatch: Option<Dispatch>,
}

impl Default for NodePoolConfig {
    fn default() -> Self {
        Self {
            update_interval: DEFAULT_UPDATE_INTERVAL,
            hash_replicas: DEFAULT_REPLICAS,
            hash_fn: crc32_ieee,
            dispatch: None,
        }
    }
}

#[derive(Default)]
struct Membership {
    /// Sorted snapshot behind the current ring. `None` forces the next refresh to rebuild.
    nodes: Option<Vec<String>>,
    ring: Option<Arc<HashRing>>,
    last_update: Option<DateTime<Utc>>,
}

struct PoolShared {
    service_name: String,
    node_id: String,
    config: NodePoolConfig,
    state: AtomicPoolState,
    membership: RwLock<Membership>,
}

impl PoolShared {
    fn read(&self) -> RwLockReadGuard<'_, Membership> {
        self.membership.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Membership> {
        self.membership.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fold a fresh membership listing into the ring and state machine.
    fn update(&self, nodes: Vec<String>) {
        let nodes = normalize_nodes(nodes);
        let mut membership = self.write();

        if membership.ring.is_some() && membership.nodes.as_ref() == Some(&nodes) {
            if self.state.swap(PoolState::Steady) == PoolState::Upgrading {
                info!(nodes = nodes.len(), "membership converged");
            }
            return;
        }

        let ring = HashRing::with_nodes(self.config.hash_replicas, self.config.hash_fn, &nodes);
        if !nodes.contains(&self.node_id) {
            warn!("this node is missing from the membership listing");
        }
        info!(nodes = nodes.len(), "membership changed, rebuilding hash ring");
        metrics::counter!(RING_REBUILDS).increment(1);
        metrics::gauge!(NODES, "service" => self.service_name.clone()).set(nodes.len() as f64);

        membership.ring = Some(Arc::new(ring));
        membership.nodes = Some(nodes);
        membership.last_update = Some(Utc::now());
        self.state.store(PoolState::Upgrading);
    }

    fn check_job_available(&self, job_name: &str) -> Result<bool> {
        let membership = self.read();
        let Some(ring) = membership.ring.as_ref() else {
            return Err(Error::NodePoolIsNil);
        };
        if ring.is_empty() {
            return Ok(false);
        }
        if self.state.load() == PoolState::Upgrading {
            return Err(Error::NodePoolIsUpgrading);
        }
        Ok(ring.get(job_name) == Some(self.node_id.as_str()))
    }
}

/// Tracks live membership through a `Driver` and answers "does this node own job X".
pub struct NodePool {
    shared: Arc<PoolShared>,
    driver: Arc<dyn Driver>,
    refresher: Mutex<Option<BackgroundTask>>,
}

impl NodePool {
    pub fn new(service_name: &str, mut driver: Box<dyn Driver>, config: NodePoolConfig) -> Self {
        driver.init(
            service_name,
            DriverOptions {
                timeout: config.update_interval,
                dispatch: config.dispatch.clone(),
            },
        );
        let node_id = driver.node_id().to_string();

        Self {
            shared: Arc::new(PoolShared {
                service_name: service_name.to_string(),
                node_id,
                config,
                state: AtomicPoolState::new(PoolState::Upgrading),
                membership: RwLock::new(Membership::default()),
            }),
            driver: Arc::from(driver),
            refresher: Mutex::new(None),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.shared.service_name
    }

    pub fn node_id(&self) -> &str {
        &self.shared.node_id
    }

    pub fn state(&self) -> PoolState {
        self.shared.state.load()
    }

    /// When the ring was last rebuilt for a membership change.
    pub fn last_nodes_update_time(&self) -> Option<DateTime<Utc>> {
        self.shared.read().last_update
    }

    /// Membership behind the current ring, sorted.
    pub fn nodes(&self) -> Vec<String> {
        self.shared.read().nodes.clone().unwrap_or_default()
    }

    /// Start the driver, build the first ring and refresh it in the background.
    ///
    /// Returns once the pool has been `Steady` at least once.
    pub async fn start(&self) -> Result<()> {
        let stopped = {
            let mut refresher = self.refresher.lock().await;
            if refresher.is_some() {
                return Err(Error::DriverAlreadyStarted);
            }

            self.driver.start().await?;
            let nodes = match self.driver.get_nodes().await {
                Ok(nodes) => nodes,
                Err(e) => {
                    if let Err(stop_err) = self.driver.stop().await {
                        warn!(error = %stop_err, "failed to stop driver after failed start");
                    }
                    return Err(e);
                }
            };

            self.shared.state.store(PoolState::Upgrading);
            self.shared.update(nodes);

            let shared = self.shared.clone();
            let driver = self.driver.clone();
            let (service, node_id) = (self.service_name().to_string(), self.node_id().to_string());
            let task = BackgroundTask::spawn(
                self.shared.config.dispatch.as_ref(),
                || info_span!("dcron_node_pool", %service, %node_id),
                move |cancel| refresh_loop(shared, driver, cancel),
            );
            let stopped = task.token();
            *refresher = Some(task);
            stopped
        };

        let interval = self.shared.config.update_interval;
        loop {
            if self.state() == PoolState::Steady {
                info!(node_id = %self.node_id(), "node pool is steady");
                return Ok(());
            }
            tokio::select! {
                _ = stopped.cancelled() => return Err(Error::PoolStopped),
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    /// Whether this node currently owns `job_name`.
    ///
    /// `NodePoolIsNil` before the first ring exists, `NodePoolIsUpgrading`
    /// while membership is changing, `Ok(false)` for an empty ring.
    pub fn check_job_available(&self, job_name: &str) -> Result<bool> {
        self.shared.check_job_available(job_name)
    }

    /// Stop refreshing, stop the driver and forget the last membership.
    pub async fn stop(&self) -> Result<()> {
        let Some(task) = self.refresher.lock().await.take() else {
            return Ok(());
        };
        task.shutdown().await;
        let result = self.driver.stop().await;

        self.shared.write().nodes = None;
        self.shared.state.store(PoolState::Upgrading);
        info!(node_id = %self.node_id(), "node pool stopped");
        result
    }
}

async fn refresh_loop(shared: Arc<PoolShared>, driver: Arc<dyn Driver>, cancel: CancellationToken) {
    let interval = shared.config.update_interval;
    let mut ticker = interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => match driver.get_nodes().await {
                Ok(nodes) => shared.update(nodes),
                Err(e) => {
                    metrics::counter!(MEMBERSHIP_REFRESH_ERRORS).increment(1);
                    warn!(error = %e, "failed to refresh membership, keeping last known ring");
                }
            }
        }
    }
}
