use common_redis::CustomRedisError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("job {0} already exists")]
    JobExists(String),

    #[error("job {0} does not exist")]
    JobNotExist(String),

    #[error("job {0} is not assigned to this node")]
    JobWrongNode(String),

    #[error("invalid schedule {expr:?}: {reason}")]
    InvalidSchedule { expr: String, reason: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Coordination(#[from] dcron_coordination::Error),

    #[error(transparent)]
    Redis(#[from] CustomRedisError),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn invalid_schedule(expr: &str, reason: impl ToString) -> Self {
        Self::InvalidSchedule {
            expr: expr.to_string(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
