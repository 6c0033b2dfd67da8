use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common_redis::Client;
use tokio::sync::Mutex;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn};

use super::{is_node_key, key_prefix, new_node_id, Driver, DriverOptions};
use crate::error::{Error, Result};
use crate::metrics_consts::HEARTBEAT_ERRORS;
use crate::util::{bounded, BackgroundTask};

/// Liveness through one expiring key per node.
///
/// The key is named after the node identity and re-set with a fresh TTL every
/// half timeout. A crashed node simply lets its key expire. Works against a
/// single Redis or a Redis Cluster, depending on the `Client` passed in.
pub struct RedisDriver {
    client: Arc<dyn Client>,
    service_name: String,
    node_id: String,
    options: DriverOptions,
    heartbeat: Mutex<Option<BackgroundTask>>,
}

impl RedisDriver {
    pub fn new(client: Arc<dyn Client>) -> Self {
        Self {
            client,
            service_name: String::new(),
            node_id: String::new(),
            options: DriverOptions::default(),
            heartbeat: Mutex::new(None),
        }
    }

    fn registration(&self) -> Registration {
        Registration {
            client: self.client.clone(),
            node_id: self.node_id.clone(),
            ttl: self.options.timeout,
        }
    }
}

#[derive(Clone)]
struct Registration {
    client: Arc<dyn Client>,
    node_id: String,
    ttl: Duration,
}

impl Registration {
    async fn refresh(&self) -> Result<()> {
        let ttl_ms = u64::try_from(self.ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        bounded(
            "redis register",
            self.ttl,
            self.client
                .psetex(self.node_id.clone(), self.node_id.clone(), ttl_ms),
        )
        .await
    }

    async fn run(self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    if let Err(e) = self.refresh().await {
                        metrics::counter!(HEARTBEAT_ERRORS, "driver" => "redis").increment(1);
                        warn!(error = %e, "failed to refresh node registration");
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Driver for RedisDriver {
    fn init(&mut self, service_name: &str, options: DriverOptions) {
        self.service_name = service_name.to_string();
        self.node_id = new_node_id(service_name);
        self.options = options;
    }

    fn node_id(&self) -> &str {
        &self.node_id
    }

    async fn get_nodes(&self) -> Result<Vec<String>> {
        let prefix = key_prefix(&self.service_name);
        let keys = bounded(
            "redis get_nodes",
            self.options.timeout,
            self.client.keys_matching(format!("{prefix}*")),
        )
        .await?;
        Ok(keys
            .into_iter()
            .filter(|key| is_node_key(&prefix, key))
            .collect())
    }

    async fn start(&self) -> Result<()> {
        if self.node_id.is_empty() {
            return Err(Error::invalid_state("driver started before init"));
        }
        let mut heartbeat = self.heartbeat.lock().await;
        if heartbeat.is_some() {
            return Err(Error::DriverAlreadyStarted);
        }

        let registration = self.registration();
        registration.refresh().await?;

        let interval = (self.options.timeout / 2).max(Duration::from_millis(1));
        let (service, node_id) = (self.service_name.clone(), self.node_id.clone());
        *heartbeat = Some(BackgroundTask::spawn(
            self.options.dispatch.as_ref(),
            || info_span!("dcron_driver", driver = "redis", %service, %node_id),
            move |cancel| registration.run(interval, cancel),
        ));
        info!(node_id = %self.node_id, "redis driver started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let Some(task) = self.heartbeat.lock().await.take() else {
            return Ok(());
        };
        task.shutdown().await;

        bounded(
            "redis deregister",
            self.options.timeout,
            self.client.del(self.node_id.clone()),
        )
        .await?;
        info!(node_id = %self.node_id, "redis driver stopped");
        Ok(())
    }
}
