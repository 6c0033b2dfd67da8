use std::str::FromStr;
use std::time::Duration;

use chrono_tz::Tz;
use envconfig::Envconfig;

use crate::dcron::DcronConfig;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverKind {
    /// One expiring key per node.
    Redis,
    /// One scored member per node in a sorted set.
    RedisZSet,
    RedisCluster,
    Etcd,
    /// No coordination, every job runs here.
    Local,
}

impl FromStr for DriverKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "redis" => Ok(Self::Redis),
            "redis-zset" => Ok(Self::RedisZSet),
            "redis-cluster" => Ok(Self::RedisCluster),
            "etcd" => Ok(Self::Etcd),
            "local" => Ok(Self::Local),
            other => Err(Error::InvalidConfig(format!("unknown driver {other:?}"))),
        }
    }
}

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    #[envconfig(default = "dcron")]
    pub service_name: String,

    #[envconfig(default = "redis")]
    pub driver: String,

    // ── Redis ───────────────────────────────────────────────────────
    #[envconfig(default = "redis://localhost:6379/")]
    pub redis_url: String,

    #[envconfig(default = "")]
    pub redis_cluster_nodes: String,

    // 0 disables the timeout
    #[envconfig(default = "1000")]
    pub redis_response_timeout_ms: u64,

    #[envconfig(default = "5000")]
    pub redis_connection_timeout_ms: u64,

    // ── etcd ────────────────────────────────────────────────────────
    #[envconfig(default = "http://localhost:2379")]
    pub etcd_endpoints: String,

    // ── Membership ──────────────────────────────────────────────────
    #[envconfig(default = "3000")]
    pub node_update_interval_ms: u64,

    #[envconfig(default = "50")]
    pub hash_replicas: usize,

    // 0 disables replay of jobs deferred during membership changes
    #[envconfig(default = "0")]
    pub recent_jobs_window_secs: u64,

    // ── Scheduling ──────────────────────────────────────────────────
    #[envconfig(default = "false")]
    pub cron_with_seconds: bool,

    #[envconfig(default = "UTC")]
    pub timezone: String,

    // ── Jobs ────────────────────────────────────────────────────────
    /// JSON array of `ExecJob`s registered at startup.
    pub jobs_file: Option<String>,

    #[envconfig(default = "false")]
    pub job_store_enabled: bool,

    #[envconfig(default = "60")]
    pub exec_timeout_secs: u64,

    // ── Logging ─────────────────────────────────────────────────────
    #[envconfig(default = "text")]
    pub log_format: String,
}

impl Config {
    pub fn driver_kind(&self) -> Result<DriverKind> {
        self.driver.parse()
    }

    pub fn redis_cluster_node_list(&self) -> Vec<String> {
        split_list(&self.redis_cluster_nodes)
    }

    pub fn etcd_endpoint_list(&self) -> Vec<String> {
        split_list(&self.etcd_endpoints)
    }

    pub fn redis_response_timeout(&self) -> Option<Duration> {
        non_zero_millis(self.redis_response_timeout_ms)
    }

    pub fn redis_connection_timeout(&self) -> Option<Duration> {
        non_zero_millis(self.redis_connection_timeout_ms)
    }

    pub fn node_update_interval(&self) -> Duration {
        Duration::from_millis(self.node_update_interval_ms)
    }

    pub fn recent_jobs_window(&self) -> Option<Duration> {
        (self.recent_jobs_window_secs > 0).then(|| Duration::from_secs(self.recent_jobs_window_secs))
    }

    pub fn timezone(&self) -> Result<Tz> {
        self.timezone
            .parse()
            .map_err(|e| Error::InvalidConfig(format!("timezone {:?}: {e}", self.timezone)))
    }

    pub fn json_logs(&self) -> bool {
        self.log_format.eq_ignore_ascii_case("json")
    }

    pub fn dcron_config(&self) -> Result<DcronConfig> {
        if self.node_update_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "NODE_UPDATE_INTERVAL_MS must be positive".to_string(),
            ));
        }
        Ok(DcronConfig {
            node_update_interval: self.node_update_interval(),
            hash_replicas: self.hash_replicas,
            recent_jobs_window: self.recent_jobs_window(),
            cron_with_seconds: self.cron_with_seconds,
            timezone: self.timezone()?,
            ..Default::default()
        })
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn non_zero_millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}
