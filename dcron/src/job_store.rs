use std::sync::Arc;

use common_redis::Client;
use dcron_coordination::driver::stable_jobs_key;
use futures::FutureExt;
use tracing::{info, warn};

use crate::dcron::Dcron;
use crate::error::{Error, Result};
use crate::exec::ExecJob;

/// Persists `ExecJob`s in a Redis hash so a restarted fleet gets them back.
///
/// One field per job name, holding the job as JSON.
pub struct RedisJobStore {
    client: Arc<dyn Client>,
    key: String,
}

impl RedisJobStore {
    pub fn new(client: Arc<dyn Client>, service_name: &str) -> Self {
        Self {
            client,
            key: stable_jobs_key(service_name),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Fails with `JobExists` if a job of that name is already stored.
    pub async fn store(&self, job: &ExecJob) -> Result<()> {
        let stored = self
            .client
            .hset_nx(self.key.clone(), job.name.clone(), job.to_json()?)
            .await?;
        if !stored {
            return Err(Error::JobExists(job.name.clone()));
        }
        Ok(())
    }

    pub async fn remove(&self, name: &str) -> Result<()> {
        self.client
            .hdel(self.key.clone(), name.to_string())
            .await?;
        Ok(())
    }

    /// Every stored job, sorted by name. Entries that fail to parse are skipped.
    pub async fn load_all(&self) -> Result<Vec<ExecJob>> {
        let entries = self.client.hgetall(self.key.clone()).await?;
        let mut jobs: Vec<ExecJob> = entries
            .into_iter()
            .filter_map(|(name, raw)| match ExecJob::from_json(&raw) {
                Ok(job) => Some(job),
                Err(e) => {
                    warn!(job = %name, error = %e, "skipping unreadable stored job");
                    None
                }
            })
            .collect();
        jobs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(jobs)
    }

    /// Add every stored job to `dcron`. Jobs that are already registered or
    /// fail to register are logged and skipped.
    pub async fn recover_into(&self, dcron: &Dcron) -> Result<usize> {
        let jobs = self.load_all().await?;
        info!(key = %self.key, stored = jobs.len(), "recovering stored jobs");
        let mut recovered = 0;
        for job in jobs {
            let name = job.name.clone();
            match job.register(dcron) {
                Ok(()) => recovered += 1,
                Err(e) => warn!(job = %name, error = %e, "failed to recover stored job"),
            }
        }
        Ok(recovered)
    }

    /// A recover function for `Dcron::with_recover_func` backed by this store.
    pub fn recover_func(
        self: Arc<Self>,
    ) -> impl Fn(Dcron) -> futures::future::BoxFuture<'static, ()> + Send + Sync + 'static {
        move |dcron: Dcron| {
            let store = self.clone();
            async move {
                if let Err(e) = store.recover_into(&dcron).await {
                    warn!(error = %e, "failed to load stored jobs");
                }
            }
            .boxed()
        }
    }
}
