use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common_redis::Client;
use tokio::sync::Mutex;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn};

use super::{key_prefix, new_node_id, Driver, DriverOptions};
use crate::error::{Error, Result};
use crate::metrics_consts::HEARTBEAT_ERRORS;
use crate::util::{bounded, now_seconds, BackgroundTask};

/// Unix seconds source; replaceable so tests can move time.
pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

/// Liveness through one sorted set per service.
///
/// Members are node identities scored by their last refresh in Unix seconds.
/// `get_nodes` only reads members refreshed within the timeout, so stale
/// members never need to be evicted.
pub struct RedisZSetDriver {
    client: Arc<dyn Client>,
    service_name: String,
    node_id: String,
    options: DriverOptions,
    clock: Clock,
    heartbeat: Mutex<Option<BackgroundTask>>,
}

impl RedisZSetDriver {
    pub fn new(client: Arc<dyn Client>) -> Self {
        Self {
            client,
            service_name: String::new(),
            node_id: String::new(),
            options: DriverOptions::default(),
            clock: Arc::new(now_seconds),
            heartbeat: Mutex::new(None),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    fn set_key(&self) -> String {
        key_prefix(&self.service_name)
    }

    fn window_secs(&self) -> i64 {
        i64::try_from(self.options.timeout.as_secs())
            .unwrap_or(i64::MAX)
            .max(1)
    }

    fn heartbeat_state(&self) -> Heartbeat {
        Heartbeat {
            client: self.client.clone(),
            key: self.set_key(),
            node_id: self.node_id.clone(),
            clock: self.clock.clone(),
            timeout: self.options.timeout,
        }
    }
}

struct Heartbeat {
    client: Arc<dyn Client>,
    key: String,
    node_id: String,
    clock: Clock,
    timeout: Duration,
}

impl Heartbeat {
    async fn beat(&self) -> Result<()> {
        bounded(
            "redis zadd",
            self.timeout,
            self.client
                .zadd(self.key.clone(), self.node_id.clone(), (self.clock)()),
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
                    if let Err(e) = self.beat().await {
                        metrics::counter!(HEARTBEAT_ERRORS, "driver" => "redis_zset").increment(1);
                        warn!(error = %e, "failed to refresh sorted set membership");
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Driver for RedisZSetDriver {
    fn init(&mut self, service_name: &str, options: DriverOptions) {
        self.service_name = service_name.to_string();
        self.node_id = new_node_id(service_name);
        self.options = options;
    }

    fn node_id(&self) -> &str {
        &self.node_id
    }

    async fn get_nodes(&self) -> Result<Vec<String>> {
        let min = (self.clock)() - self.window_secs();
        bounded(
            "redis zrangebyscore",
            self.options.timeout,
            self.client
                .zrangebyscore(self.set_key(), min.to_string(), "+inf".to_string()),
        )
        .await
    }

    async fn start(&self) -> Result<()> {
        if self.node_id.is_empty() {
            return Err(Error::invalid_state("driver started before init"));
        }
        let mut heartbeat = self.heartbeat.lock().await;
        if heartbeat.is_some() {
            return Err(Error::DriverAlreadyStarted);
        }

        let state = self.heartbeat_state();
        state.beat().await?;

        let interval = (self.options.timeout / 2).max(Duration::from_millis(1));
        let (service, node_id) = (self.service_name.clone(), self.node_id.clone());
        *heartbeat = Some(BackgroundTask::spawn(
            self.options.dispatch.as_ref(),
            || info_span!("dcron_driver", driver = "redis_zset", %service, %node_id),
            move |cancel| state.run(interval, cancel),
        ));
        info!(node_id = %self.node_id, "redis zset driver started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let Some(task) = self.heartbeat.lock().await.take() else {
            return Ok(());
        };
        task.shutdown().await;

        bounded(
            "redis zrem",
            self.options.timeout,
            self.client.zrem(self.set_key(), self.node_id.clone()),
        )
        .await?;
        info!(node_id = %self.node_id, "redis zset driver stopped");
        Ok(())
    }
}
