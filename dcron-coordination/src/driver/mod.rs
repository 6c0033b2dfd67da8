//! Membership drivers: register this process under a service name and list
//! the processes that are currently alive.

use std::time::Duration;

use async_trait::async_trait;
use tracing::Dispatch;

use crate::error::Result;

pub mod etcd;
pub mod redis;
pub mod redis_zset;

pub use self::etcd::EtcdDriver;
pub use self::redis::RedisDriver;
pub use self::redis_zset::RedisZSetDriver;

pub const GLOBAL_KEY_PREFIX: &str = "distributed-cron:";

pub const DEFAULT_LIVENESS_TIMEOUT: Duration = Duration::from_secs(3);

/// `distributed-cron:<service>:`
pub fn key_prefix(service_name: &str) -> String {
    format!("{GLOBAL_KEY_PREFIX}{service_name}:")
}

/// `distributed-cron:<service>:<suffix>`
pub fn node_key(service_name: &str, suffix: &str) -> String {
    format!("{}{suffix}", key_prefix(service_name))
}

/// Hash holding persisted job definitions for a service.
pub fn stable_jobs_key(service_name: &str) -> String {
    format!("{}stable-jobs", key_prefix(service_name))
}

/// A fresh node identity for `service_name`.
pub fn new_node_id(service_name: &str) -> String {
    node_key(service_name, &uuid::Uuid::new_v4().to_string())
}

/// True for keys shaped like a node identity under `prefix`, which excludes
/// other bookkeeping keys sharing the service prefix.
pub(crate) fn is_node_key(prefix: &str, key: &str) -> bool {
    key.strip_prefix(prefix)
        .is_some_and(|suffix| uuid::Uuid::parse_str(suffix).is_ok())
}

#[derive(Debug, Clone)]
pub struct DriverOptions {
    /// A node missing its refresh for this long drops out of membership.
    pub timeout: Duration,
    /// Where background loops report. `None` uses the caller's subscriber.
    pub dispatch: Option<Dispatch>,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_LIVENESS_TIMEOUT,
            dispatch: None,
        }
    }
}

/// Registration and discovery against one coordination backend.
///
/// A node that stops refreshing disappears from `get_nodes` within one
/// liveness timeout, and a started node shows up within one refresh interval.
/// `start` after `stop` registers again under the same identity.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Bind the driver to a service and mint this process's identity.
    fn init(&mut self, service_name: &str, options: DriverOptions);

    fn node_id(&self) -> &str;

    /// Current live members. Fails with a timeout instead of hanging.
    async fn get_nodes(&self) -> Result<Vec<String>>;

    /// Register and begin refreshing liveness in the background.
    async fn start(&self) -> Result<()>;

    /// Deregister and halt the background loop. A no-op when not started.
    async fn stop(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout() {
        assert_eq!(key_prefix("svc"), "distributed-cron:svc:");
        assert_eq!(node_key("svc", "abc"), "distributed-cron:svc:abc");
        assert_eq!(stable_jobs_key("svc"), "distributed-cron:svc:stable-jobs");
    }

    #[test]
    fn node_ids_are_unique_and_recognised() {
        let a = new_node_id("svc");
        let b = new_node_id("svc");
        assert_ne!(a, b);
        assert!(is_node_key(&key_prefix("svc"), &a));
        assert!(!is_node_key(&key_prefix("svc"), &stable_jobs_key("svc")));
        assert!(!is_node_key(&key_prefix("other"), &a));
    }
}
