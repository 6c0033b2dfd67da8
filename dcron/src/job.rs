use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::schedule::Schedule;

/// A job body. Runs on whichever node owns the job when its schedule fires.
#[async_trait]
pub trait Job: Send + Sync {
    async fn run(&self);
}

/// Adapts a plain closure into a `Job`.
pub struct FuncJob<F>(pub F);

#[async_trait]
impl<F> Job for FuncJob<F>
where
    F: Fn() + Send + Sync,
{
    async fn run(&self) {
        (self.0)()
    }
}

/// A job as registered with a `Dcron`.
pub struct RegisteredJob {
    name: String,
    expr: String,
    pub(crate) schedule: Arc<dyn Schedule>,
    job: Arc<dyn Job>,
    // Fires on removal so the job's trigger loop exits
    pub(crate) removed: CancellationToken,
}

impl RegisteredJob {
    pub(crate) fn new(
        name: String,
        expr: String,
        schedule: Arc<dyn Schedule>,
        job: Arc<dyn Job>,
    ) -> Self {
        Self {
            name,
            expr,
            schedule,
            job,
            removed: CancellationToken::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The schedule expression the job was added with.
    pub fn schedule(&self) -> &str {
        &self.expr
    }

    pub fn job(&self) -> Arc<dyn Job> {
        self.job.clone()
    }

    /// Run the body here and now, bypassing the ownership check.
    pub async fn execute(&self) {
        self.job.run().await
    }
}

impl fmt::Debug for RegisteredJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredJob")
            .field("name", &self.name)
            .field("schedule", &self.expr)
            .finish()
    }
}
