pub mod driver;
pub mod error;
pub mod hash;
pub mod metrics_consts;
pub mod node_pool;
pub mod recent_jobs;
pub mod util;

pub use driver::{Driver, DriverOptions, EtcdDriver, RedisDriver, RedisZSetDriver};
pub use error::{Error, Result};
pub use hash::HashRing;
pub use node_pool::{NodePool, NodePoolConfig, PoolState};
pub use recent_jobs::RecentJobPacker;
