pub mod config;
pub mod dcron;
pub mod error;
pub mod exec;
pub mod job;
pub mod job_store;
pub mod metrics_consts;
pub mod schedule;
mod trigger;

pub use crate::dcron::{Dcron, DcronConfig, RecoverFunc};
pub use error::{Error, Result};
pub use exec::ExecJob;
pub use job::{FuncJob, Job, RegisteredJob};
pub use job_store::RedisJobStore;
