use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Client, ConnectOptions, EventType, GetOptions, LeaseKeepAliveStream, LeaseKeeper, PutOptions,
    WatchOptions, WatchResponse, WatchStream,
};
use tokio::sync::{Mutex, RwLock};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn};

use super::{is_node_key, key_prefix, new_node_id, Driver, DriverOptions};
use crate::error::{Error, Result};
use crate::metrics_consts::HEARTBEAT_ERRORS;
use crate::util::{bounded, BackgroundTask};

/// etcd refuses leases shorter than this.
pub const MIN_LEASE_TTL: Duration = Duration::from_secs(5);

/// Upper bound on any single etcd request.
pub const BUSINESS_TIMEOUT: Duration = Duration::from_secs(5);

/// Liveness through a leased key per node.
///
/// `start` grants a lease of the liveness timeout (at least `MIN_LEASE_TTL`),
/// puts the node key under it and keeps it alive. Membership is seeded with
/// one prefix read and then maintained from a watch on the same prefix, so
/// `get_nodes` is served from memory while started.
pub struct EtcdDriver {
    client: Client,
    service_name: String,
    node_id: String,
    options: DriverOptions,
    nodes: Arc<RwLock<HashSet<String>>>,
    lease_id: Arc<AtomicI64>,
    session: Mutex<Option<BackgroundTask>>,
}

impl EtcdDriver {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            service_name: String::new(),
            node_id: String::new(),
            options: DriverOptions::default(),
            nodes: Arc::new(RwLock::new(HashSet::new())),
            lease_id: Arc::new(AtomicI64::new(0)),
            session: Mutex::new(None),
        }
    }

    pub async fn connect(endpoints: &[String]) -> Result<Self> {
        let options = ConnectOptions::new()
            .with_connect_timeout(BUSINESS_TIMEOUT)
            .with_timeout(BUSINESS_TIMEOUT);
        let client = Client::connect(endpoints, Some(options)).await?;
        Ok(Self::new(client))
    }

    fn lease_ttl(&self) -> i64 {
        let secs = self.options.timeout.max(MIN_LEASE_TTL).as_secs();
        i64::try_from(secs).unwrap_or(i64::MAX)
    }

    fn worker(&self) -> LeaseWorker {
        LeaseWorker {
            client: self.client.clone(),
            prefix: key_prefix(&self.service_name),
            node_id: self.node_id.clone(),
            lease_ttl: self.lease_ttl(),
            nodes: self.nodes.clone(),
            lease_id: self.lease_id.clone(),
        }
    }
}

struct Lease {
    keeper: LeaseKeeper,
    stream: LeaseKeepAliveStream,
}

struct LeaseWorker {
    client: Client,
    prefix: String,
    node_id: String,
    lease_ttl: i64,
    nodes: Arc<RwLock<HashSet<String>>>,
    lease_id: Arc<AtomicI64>,
}

impl LeaseWorker {
    async fn register(&self) -> Result<Lease> {
        let mut client = self.client.clone();
        let lease = bounded(
            "etcd lease grant",
            BUSINESS_TIMEOUT,
            client.lease_grant(self.lease_ttl, None),
        )
        .await?;
        let lease_id = lease.id();

        bounded(
            "etcd put",
            BUSINESS_TIMEOUT,
            client.put(
                self.node_id.clone(),
                self.node_id.clone(),
                Some(PutOptions::new().with_lease(lease_id)),
            ),
        )
        .await?;

        let (keeper, stream) = bounded(
            "etcd lease keep alive",
            BUSINESS_TIMEOUT,
            client.lease_keep_alive(lease_id),
        )
        .await?;

        self.lease_id.store(lease_id, Ordering::SeqCst);
        Ok(Lease { keeper, stream })
    }

    /// Seed membership from a prefix read and watch for changes after it.
    async fn sync(&self) -> Result<WatchStream> {
        let mut client = self.client.clone();
        let resp = bounded(
            "etcd get",
            BUSINESS_TIMEOUT,
            client.get(self.prefix.clone(), Some(GetOptions::new().with_prefix())),
        )
        .await?;

        let revision = resp.header().map(|h| h.revision()).unwrap_or_default();
        let seeded: HashSet<String> = resp
            .kvs()
            .iter()
            .filter_map(|kv| std::str::from_utf8(kv.key()).ok())
            .filter(|key| is_node_key(&self.prefix, key))
            .map(str::to_string)
            .collect();
        *self.nodes.write().await = seeded;

        let options = WatchOptions::new()
            .with_prefix()
            .with_start_revision(revision + 1);
        let stream = bounded(
            "etcd watch",
            BUSINESS_TIMEOUT,
            client.watch(self.prefix.clone(), Some(options)),
        )
        .await?;
        Ok(stream)
    }

    async fn apply(&self, resp: &WatchResponse) {
        let mut nodes = self.nodes.write().await;
        for event in resp.events() {
            let Some(key) = event.kv().and_then(|kv| std::str::from_utf8(kv.key()).ok()) else {
                continue;
            };
            if !is_node_key(&self.prefix, key) {
                continue;
            }
            match event.event_type() {
                EventType::Put => {
                    nodes.insert(key.to_string());
                }
                EventType::Delete => {
                    nodes.remove(key);
                }
            }
        }
    }

    async fn keep_alive(&self, lease: &mut Lease) {
        let renewal = async {
            lease.keeper.keep_alive().await?;
            match lease.stream.message().await? {
                Some(resp) => Ok::<bool, etcd_client::Error>(resp.ttl() > 0),
                None => Ok(false),
            }
        };

        match bounded("etcd lease renewal", BUSINESS_TIMEOUT, renewal).await {
            Ok(true) => {}
            Ok(false) => {
                warn!("lease lost, registering again");
                match self.register().await {
                    Ok(fresh) => *lease = fresh,
                    Err(e) => {
                        metrics::counter!(HEARTBEAT_ERRORS, "driver" => "etcd").increment(1);
                        warn!(error = %e, "failed to register again");
                    }
                }
            }
            Err(e) => {
                metrics::counter!(HEARTBEAT_ERRORS, "driver" => "etcd").increment(1);
                warn!(error = %e, "failed to renew lease");
            }
        }
    }

    async fn run(self, mut lease: Lease, mut watch: Option<WatchStream>, cancel: CancellationToken) {
        let ttl_secs = u64::try_from(self.lease_ttl).unwrap_or(1);
        let interval = Duration::from_secs((ttl_secs / 3).max(1));
        let mut ticker = interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    self.keep_alive(&mut lease).await;
                    if watch.is_none() {
                        match self.sync().await {
                            Ok(stream) => watch = Some(stream),
                            Err(e) => warn!(error = %e, "failed to resync membership"),
                        }
                    }
                }
                msg = next_watch_message(&mut watch) => match msg {
                    Ok(Some(resp)) if resp.canceled() => {
                        warn!(reason = %resp.cancel_reason(), "membership watch cancelled, resyncing");
                        watch = None;
                    }
                    Ok(Some(resp)) => self.apply(&resp).await,
                    Ok(None) => {
                        warn!("membership watch stream ended, resyncing");
                        watch = None;
                    }
                    Err(e) => {
                        warn!(error = %e, "membership watch failed, resyncing");
                        watch = None;
                    }
                }
            }
        }
    }
}

async fn next_watch_message(
    watch: &mut Option<WatchStream>,
) -> std::result::Result<Option<WatchResponse>, etcd_client::Error> {
    match watch {
        Some(stream) => stream.message().await,
        None => std::future::pending().await,
    }
}

#[async_trait]
impl Driver for EtcdDriver {
    fn init(&mut self, service_name: &str, options: DriverOptions) {
        self.service_name = service_name.to_string();
        self.node_id = new_node_id(service_name);
        self.options = options;
    }

    fn node_id(&self) -> &str {
        &self.node_id
    }

    async fn get_nodes(&self) -> Result<Vec<String>> {
        if self.session.lock().await.is_none() {
            // Not watching; read the prefix directly
            let prefix = key_prefix(&self.service_name);
            let mut client = self.client.clone();
            let resp = bounded(
                "etcd get",
                BUSINESS_TIMEOUT,
                client.get(prefix.clone(), Some(GetOptions::new().with_prefix())),
            )
            .await?;
            let mut nodes: Vec<String> = resp
                .kvs()
                .iter()
                .filter_map(|kv| std::str::from_utf8(kv.key()).ok())
                .filter(|key| is_node_key(&prefix, key))
                .map(str::to_string)
                .collect();
            nodes.sort();
            return Ok(nodes);
        }

        let mut nodes: Vec<String> = self.nodes.read().await.iter().cloned().collect();
        nodes.sort();
        Ok(nodes)
    }

    async fn start(&self) -> Result<()> {
        if self.node_id.is_empty() {
            return Err(Error::invalid_state("driver started before init"));
        }
        let mut session = self.session.lock().await;
        if session.is_some() {
            return Err(Error::DriverAlreadyStarted);
        }

        let worker = self.worker();
        let lease = worker.register().await?;
        let watch = match worker.sync().await {
            Ok(stream) => stream,
            Err(e) => {
                let mut client = self.client.clone();
                let lease_id = self.lease_id.load(Ordering::SeqCst);
                // Best-effort; the lease would expire on its own
                drop(
                    bounded(
                        "etcd lease revoke",
                        BUSINESS_TIMEOUT,
                        client.lease_revoke(lease_id),
                    )
                    .await,
                );
                return Err(e);
            }
        };

        let (service, node_id) = (self.service_name.clone(), self.node_id.clone());
        *session = Some(BackgroundTask::spawn(
            self.options.dispatch.as_ref(),
            || info_span!("dcron_driver", driver = "etcd", %service, %node_id),
            move |cancel| worker.run(lease, Some(watch), cancel),
        ));
        info!(node_id = %self.node_id, lease_ttl = self.lease_ttl(), "etcd driver started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let Some(task) = self.session.lock().await.take() else {
            return Ok(());
        };
        task.shutdown().await;
        self.nodes.write().await.clear();

        let lease_id = self.lease_id.swap(0, Ordering::SeqCst);
        let mut client = self.client.clone();
        bounded(
            "etcd lease revoke",
            BUSINESS_TIMEOUT,
            client.lease_revoke(lease_id),
        )
        .await?;
        info!(node_id = %self.node_id, "etcd driver stopped");
        Ok(())
    }
}
