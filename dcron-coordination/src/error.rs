use std::time::Duration;

use common_redis::CustomRedisError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("node pool has no hash ring yet")]
    NodePoolIsNil,

    #[error("node pool is upgrading")]
    NodePoolIsUpgrading,

    #[error("driver is already started")]
    DriverAlreadyStarted,

    #[error("node pool was stopped before it reached a steady state")]
    PoolStopped,

    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error(transparent)]
    Redis(#[from] CustomRedisError),

    #[error(transparent)]
    Etcd(#[from] etcd_client::Error),

    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl Error {
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Expected "not right now" answers from an ownership check, as opposed to failures.
    pub fn is_transient_state(&self) -> bool {
        matches!(self, Self::NodePoolIsNil | Self::NodePoolIsUpgrading)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
