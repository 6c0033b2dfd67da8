use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::Utc;
use chrono_tz::Tz;
use dcron_coordination::driver::new_node_id;
use dcron_coordination::hash::{crc32_ieee, HashFn, DEFAULT_REPLICAS};
use dcron_coordination::node_pool::DEFAULT_UPDATE_INTERVAL;
use dcron_coordination::util::spawn_instrumented;
use dcron_coordination::{Driver, NodePool, NodePoolConfig, RecentJobPacker};
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, warn, Dispatch};

use crate::error::{Error, Result};
use crate::job::{FuncJob, Job, RegisteredJob};
use crate::metrics_consts::{JOB_EXECUTED, JOB_PANICKED, JOB_REPLAYED, JOB_SKIPPED};
use crate::schedule::{self, ScheduleOptions};
use crate::trigger::run_trigger;

/// Runs before the scheduler starts, typically to re-add persisted jobs.
pub type RecoverFunc = Arc<dyn Fn(Dcron) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct DcronConfig {
    /// Membership refresh period, also the liveness timeout of the driver.
    pub node_update_interval: Duration,
    pub hash_replicas: usize,
    pub hash_fn: HashFn,
    /// Replay attempts deferred during membership changes, up to this old.
    /// `None` drops them.
    pub recent_jobs_window: Option<Duration>,
    pub cron_with_seconds: bool,
    pub timezone: Tz,
    pub dispatch: Option<Dispatch>,
}

impl Default for DcronConfig {
    fn default() -> Self {
        Self {
            node_update_interval: DEFAULT_UPDATE_INTERVAL,
            hash_replicas: DEFAULT_REPLICAS,
            hash_fn: crc32_ieee,
            recent_jobs_window: None,
            cron_with_seconds: false,
            timezone: Tz::UTC,
            dispatch: None,
        }
    }
}

impl DcronConfig {
    fn pool_config(&self) -> NodePoolConfig {
        NodePoolConfig {
            update_interval: self.node_update_interval,
            hash_replicas: self.hash_replicas,
            hash_fn: self.hash_fn,
            dispatch: self.dispatch.clone(),
        }
    }

    fn schedule_options(&self) -> ScheduleOptions {
        ScheduleOptions {
            with_seconds: self.cron_with_seconds,
            timezone: self.timezone,
        }
    }
}

/// Trigger loops of one start/stop cycle.
struct Session {
    cancel: CancellationToken,
    tracker: TaskTracker,
    runtime: Handle,
}

struct Inner {
    service_name: String,
    node_id: String,
    config: DcronConfig,
    // None runs every job on this node
    pool: Option<NodePool>,
    jobs: RwLock<HashMap<String, Arc<RegisteredJob>>>,
    running: AtomicBool,
    // Held across the whole of start and stop so they never interleave
    lifecycle: tokio::sync::Mutex<()>,
    session: Mutex<Option<Session>>,
    recent_jobs: Option<RecentJobPacker>,
    recover: Mutex<Option<RecoverFunc>>,
}

impl Inner {
    fn read_jobs(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<RegisteredJob>>> {
        self.jobs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_jobs(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<RegisteredJob>>> {
        self.jobs.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn job(&self, name: &str) -> Option<Arc<RegisteredJob>> {
        self.read_jobs().get(name).cloned()
    }

    fn check_job_available(&self, name: &str) -> dcron_coordination::Result<bool> {
        match &self.pool {
            Some(pool) => pool.check_job_available(name),
            None => Ok(true),
        }
    }

    /// Open a session and spawn a trigger loop for every registered job.
    fn start_triggers(self: &Arc<Self>) -> CancellationToken {
        // Lock order is jobs, then session, everywhere
        let jobs = self.read_jobs();
        let mut session = self.lock_session();
        if let Some(stale) = session.take() {
            warn!("replacing a trigger session that was never stopped");
            stale.cancel.cancel();
            stale.tracker.close();
        }
        let current = session.insert(Session {
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            runtime: Handle::current(),
        });
        for job in jobs.values() {
            self.spawn_trigger(current, job.clone());
        }
        current.cancel.clone()
    }

    fn spawn_trigger(self: &Arc<Self>, session: &Session, job: Arc<RegisteredJob>) {
        let _runtime = session.runtime.enter();
        let inner = self.clone();
        let cancel = session.cancel.clone();
        let (service, name) = (self.service_name.clone(), job.name().to_string());

        let trigger = async move {
            let removed = job.removed.clone();
            tokio::select! {
                _ = removed.cancelled() => {}
                _ = run_trigger(job.schedule.clone(), cancel, |_| inner.fire(&job)) => {}
            }
        };
        spawn_instrumented(
            self.config.dispatch.as_ref(),
            || info_span!("dcron_trigger", %service, job = %name),
            session.tracker.track_future(trigger),
        );
    }

    fn fire(self: &Arc<Self>, job: &Arc<RegisteredJob>) {
        if self.allow_this_node_run(job.name()) {
            self.execute(job.clone());
        }
    }

    /// The execution gate in front of every scheduled run.
    fn allow_this_node_run(self: &Arc<Self>, name: &str) -> bool {
        if self.pool.is_none() {
            return true;
        }
        match self.check_job_available(name) {
            Ok(available) => {
                if let Some(packer) = &self.recent_jobs {
                    if !packer.is_empty() {
                        self.replay(packer.pop_all_jobs());
                    }
                }
                if !available {
                    metrics::counter!(JOB_SKIPPED, "reason" => "not_owner").increment(1);
                }
                available
            }
            Err(e) if e.is_transient_state() => {
                if let Some(packer) = &self.recent_jobs {
                    packer.add_job(name, Utc::now());
                }
                let reason = if matches!(e, dcron_coordination::Error::NodePoolIsNil) {
                    "no_ring"
                } else {
                    "upgrading"
                };
                metrics::counter!(JOB_SKIPPED, "reason" => reason).increment(1);
                debug!(job = name, error = %e, "deferring job until membership settles");
                false
            }
            Err(e) => {
                metrics::counter!(JOB_SKIPPED, "reason" => "error").increment(1);
                error!(job = name, error = %e, "failed to check job ownership");
                false
            }
        }
    }

    /// Re-run deferred attempts this node now owns, once per attempt.
    fn replay(self: &Arc<Self>, names: Vec<String>) {
        info!(count = names.len(), "replaying jobs deferred during membership change");
        for name in names {
            let Some(job) = self.job(&name) else {
                continue;
            };
            if matches!(self.check_job_available(&name), Ok(true)) {
                metrics::counter!(JOB_REPLAYED).increment(1);
                self.execute(job);
            }
        }
    }

    /// Run the body in its own task so a panic stays contained.
    fn execute(&self, job: Arc<RegisteredJob>) {
        let (service, name) = (self.service_name.clone(), job.name().to_string());
        spawn_instrumented(
            self.config.dispatch.as_ref(),
            || info_span!("dcron_job", %service, job = %name),
            async move {
                metrics::counter!(JOB_EXECUTED).increment(1);
                if let Err(panic) = AssertUnwindSafe(job.execute()).catch_unwind().await {
                    metrics::counter!(JOB_PANICKED).increment(1);
                    error!(panic = panic_message(&*panic), "job panicked");
                }
            },
        );
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

/// Distributed cron: every registered job runs on the one live node that owns
/// it on the consistent hash ring.
#[derive(Clone)]
pub struct Dcron {
    inner: Arc<Inner>,
}

impl Dcron {
    pub fn new(service_name: &str, driver: Box<dyn Driver>, config: DcronConfig) -> Self {
        let pool = NodePool::new(service_name, driver, config.pool_config());
        let node_id = pool.node_id().to_string();
        Self::build(service_name, node_id, Some(pool), config)
    }

    /// A scheduler without coordination. Every job runs on this node.
    pub fn running_locally(service_name: &str, config: DcronConfig) -> Self {
        Self::build(service_name, new_node_id(service_name), None, config)
    }

    fn build(
        service_name: &str,
        node_id: String,
        pool: Option<NodePool>,
        config: DcronConfig,
    ) -> Self {
        let recent_jobs = pool
            .as_ref()
            .and(config.recent_jobs_window)
            .map(RecentJobPacker::new);
        Self {
            inner: Arc::new(Inner {
                service_name: service_name.to_string(),
                node_id,
                config,
                pool,
                jobs: RwLock::new(HashMap::new()),
                running: AtomicBool::new(false),
                lifecycle: tokio::sync::Mutex::new(()),
                session: Mutex::new(None),
                recent_jobs,
                recover: Mutex::new(None),
            }),
        }
    }

    pub fn with_recover_func<F>(self, recover: F) -> Self
    where
        F: Fn(Dcron) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        *self
            .inner
            .recover
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(recover));
        self
    }

    pub fn service_name(&self) -> &str {
        &self.inner.service_name
    }

    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    /// Membership behind the current ring. Just this node when running locally.
    pub fn nodes(&self) -> Vec<String> {
        match &self.inner.pool {
            Some(pool) => pool.nodes(),
            None => vec![self.inner.node_id.clone()],
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    pub fn is_running_locally(&self) -> bool {
        self.inner.pool.is_none()
    }

    /// Register a job. Fails if the name is taken or the schedule does not parse.
    pub fn add_job<J>(&self, name: &str, schedule: &str, job: J) -> Result<()>
    where
        J: Job + 'static,
    {
        self.add_shared_job(name, schedule, Arc::new(job))
    }

    pub fn add_func<F>(&self, name: &str, schedule: &str, func: F) -> Result<()>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.add_job(name, schedule, FuncJob(func))
    }

    pub fn add_shared_job(&self, name: &str, expr: &str, job: Arc<dyn Job>) -> Result<()> {
        info!(job = name, schedule = expr, "adding job");
        let mut jobs = self.inner.write_jobs();
        if jobs.contains_key(name) {
            return Err(Error::JobExists(name.to_string()));
        }
        let schedule = schedule::parse(expr, self.inner.config.schedule_options())?;
        let registered = Arc::new(RegisteredJob::new(
            name.to_string(),
            expr.to_string(),
            schedule,
            job,
        ));

        if let Some(session) = self.inner.lock_session().as_ref() {
            self.inner.spawn_trigger(session, registered.clone());
        }
        jobs.insert(name.to_string(), registered);
        Ok(())
    }

    /// Unregister a job and stop its trigger. Unknown names are ignored.
    pub fn remove(&self, name: &str) {
        if let Some(job) = self.inner.write_jobs().remove(name) {
            job.removed.cancel();
            info!(job = name, "removed job");
        }
    }

    /// Look up a job. With `this_node_only`, fails unless this node owns it right now.
    pub fn get_job(&self, name: &str, this_node_only: bool) -> Result<Arc<RegisteredJob>> {
        let Some(job) = self.inner.job(name) else {
            warn!(job = name, "job does not exist");
            return Err(Error::JobNotExist(name.to_string()));
        };
        if this_node_only && !self.inner.check_job_available(name)? {
            return Err(Error::JobWrongNode(name.to_string()));
        }
        Ok(job)
    }

    /// Registered jobs sorted by name. With `this_node_only`, only those this
    /// node owns right now; jobs whose ownership cannot be decided are left out.
    pub fn get_jobs(&self, this_node_only: bool) -> Vec<Arc<RegisteredJob>> {
        let mut jobs: Vec<_> = self
            .inner
            .read_jobs()
            .values()
            .filter(|job| {
                !this_node_only || matches!(self.inner.check_job_available(job.name()), Ok(true))
            })
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.name().cmp(b.name()));
        jobs
    }

    async fn recover(&self) {
        let recover = self
            .inner
            .recover
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(recover) = recover {
            recover(self.clone()).await;
        }
    }

    /// Join the fleet and start firing jobs. Returns once the node pool is steady.
    ///
    /// A no-op when already running. If the node pool fails to start the
    /// scheduler stays stopped and the error is returned. A concurrent `stop`
    /// waits for this to finish, so the recover func must not call `start` or `stop`.
    pub async fn start(&self) -> Result<()> {
        self.start_session().await.map(|_| ())
    }

    async fn start_session(&self) -> Result<Option<CancellationToken>> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            info!(node_id = %self.node_id(), "dcron already started");
            return Ok(self.inner.lock_session().as_ref().map(|s| s.cancel.clone()));
        }

        self.recover().await;
        if let Some(pool) = &self.inner.pool {
            if let Err(e) = pool.start().await {
                error!(error = %e, "failed to start node pool");
                self.inner.running.store(false, Ordering::Release);
                return Err(e.into());
            }
        }

        let stopped = self.inner.start_triggers();
        info!(
            node_id = %self.node_id(),
            jobs = self.inner.read_jobs().len(),
            "dcron started"
        );
        Ok(Some(stopped))
    }

    /// `start`, then wait until `stop` is called.
    pub async fn run(&self) -> Result<()> {
        if let Some(stopped) = self.start_session().await? {
            stopped.cancelled().await;
        }
        Ok(())
    }

    /// Stop firing jobs and leave the fleet. Waits for trigger loops to exit;
    /// job bodies already running are left to finish.
    pub async fn stop(&self) -> Result<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        let session = self.inner.lock_session().take();
        if let Some(session) = session {
            session.cancel.cancel();
            session.tracker.close();
            session.tracker.wait().await;
        }

        let result = match &self.inner.pool {
            Some(pool) => pool.stop().await.map_err(Error::from),
            None => Ok(()),
        };
        if self.inner.running.swap(false, Ordering::AcqRel) {
            info!(node_id = %self.node_id(), "dcron stopped");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting(counter: &Arc<AtomicUsize>) -> impl Fn() + Send + Sync + 'static {
        let counter = counter.clone();
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let dcron = Dcron::running_locally("svc", DcronConfig::default());
        let first = Arc::new(AtomicUsize::new(0));
        dcron.add_func("x", "@every 1s", counting(&first)).unwrap();

        assert!(matches!(
            dcron.add_func("x", "@every 5s", || {}),
            Err(Error::JobExists(name)) if name == "x"
        ));
        assert_eq!(dcron.get_job("x", false).unwrap().schedule(), "@every 1s");
    }

    #[test]
    fn invalid_schedule_is_not_registered() {
        let dcron = Dcron::running_locally("svc", DcronConfig::default());
        assert!(matches!(
            dcron.add_func("x", "every now and then", || {}),
            Err(Error::InvalidSchedule { .. })
        ));
        assert!(dcron.get_jobs(false).is_empty());
    }

    #[test]
    fn lookups() {
        let dcron = Dcron::running_locally("svc", DcronConfig::default());
        assert!(dcron.get_jobs(false).is_empty());
        assert!(dcron.get_jobs(true).is_empty());
        assert!(matches!(
            dcron.get_job("missing", false),
            Err(Error::JobNotExist(_))
        ));

        for name in ["b", "a", "c"] {
            dcron.add_func(name, "*/5 * * * *", || {}).unwrap();
        }
        let names: Vec<_> = dcron
            .get_jobs(false)
            .iter()
            .map(|j| j.name().to_string())
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        // Without coordination every job belongs here
        assert_eq!(dcron.get_jobs(true).len(), 3);
        assert!(dcron.get_job("a", true).is_ok());

        dcron.remove("b");
        dcron.remove("b");
        assert!(dcron.get_job("b", false).is_err());
        assert_eq!(dcron.get_jobs(false).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn local_jobs_fire_until_stopped() {
        let dcron = Dcron::running_locally("svc", DcronConfig::default());
        let fired = Arc::new(AtomicUsize::new(0));
        dcron.add_func("tick", "@every 1s", counting(&fired)).unwrap();

        dcron.start().await.unwrap();
        assert!(dcron.is_running());
        tokio::time::sleep(Duration::from_millis(3_500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 3);

        dcron.stop().await.unwrap();
        assert!(!dcron.is_running());
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn jobs_added_while_running_are_scheduled() {
        let dcron = Dcron::running_locally("svc", DcronConfig::default());
        dcron.start().await.unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        dcron.add_func("late", "@every 1s", counting(&fired)).unwrap();
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 2);

        dcron.remove("late");
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        dcron.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_job_does_not_stop_its_trigger() {
        let dcron = Dcron::running_locally("svc", DcronConfig::default());
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        dcron
            .add_func("boom", "@every 1s", move || {
                counter.fetch_add(1, Ordering::SeqCst);
                panic!("job failure");
            })
            .unwrap();

        dcron.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(3_500)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        dcron.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn start_is_idempotent_and_restartable() {
        let dcron = Dcron::running_locally("svc", DcronConfig::default());
        let fired = Arc::new(AtomicUsize::new(0));
        dcron.add_func("tick", "@every 1s", counting(&fired)).unwrap();

        dcron.stop().await.unwrap();
        dcron.start().await.unwrap();
        dcron.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        // A second start must not spawn a second trigger
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        dcron.stop().await.unwrap();
        dcron.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        dcron.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn run_blocks_until_stop() {
        let dcron = Dcron::running_locally("svc", DcronConfig::default());
        let running = {
            let dcron = dcron.clone();
            tokio::spawn(async move { dcron.run().await })
        };

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(dcron.is_running());
        assert!(!running.is_finished());

        dcron.stop().await.unwrap();
        running.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn recover_func_runs_before_start() {
        let fired = Arc::new(AtomicUsize::new(0));
        let recovered = fired.clone();
        let dcron = Dcron::running_locally("svc", DcronConfig::default()).with_recover_func(
            move |dcron| {
                let fired = recovered.clone();
                async move {
                    if let Err(e) = dcron.add_func("restored", "@every 1s", counting(&fired)) {
                        tracing::warn!(error = %e, "restore failed");
                    }
                }
                .boxed()
            },
        );

        dcron.start().await.unwrap();
        assert!(dcron.get_job("restored", false).is_ok());
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Restarting recovers again; the duplicate is rejected and logged
        dcron.stop().await.unwrap();
        dcron.start().await.unwrap();
        assert_eq!(dcron.get_jobs(false).len(), 1);
        dcron.stop().await.unwrap();
    }

    /// Membership is whatever the test says, plus this node while started.
    #[derive(Clone, Default)]
    struct ScriptedDriver {
        node_id: String,
        others: Arc<Mutex<Vec<String>>>,
        started: Arc<AtomicBool>,
    }

    impl ScriptedDriver {
        fn set_others(&self, others: &[String]) {
            *self.others.lock().unwrap() = others.to_vec();
        }
    }

    #[async_trait::async_trait]
    impl Driver for ScriptedDriver {
        fn init(&mut self, service_name: &str, _options: dcron_coordination::DriverOptions) {
            self.node_id = new_node_id(service_name);
        }

        fn node_id(&self) -> &str {
            &self.node_id
        }

        async fn get_nodes(&self) -> dcron_coordination::Result<Vec<String>> {
            let mut nodes = self.others.lock().unwrap().clone();
            if self.started.load(Ordering::SeqCst) {
                nodes.push(self.node_id.clone());
            }
            Ok(nodes)
        }

        async fn start(&self) -> dcron_coordination::Result<()> {
            self.started.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self) -> dcron_coordination::Result<()> {
            self.started.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Start a coordinated node, then push its pool through two membership
    /// changes while a 1s job keeps firing half way between refreshes.
    async fn fires_through_membership_churn(recent_jobs_window: Option<Duration>) -> usize {
        let driver = ScriptedDriver::default();
        let config = DcronConfig {
            node_update_interval: Duration::from_secs(1),
            recent_jobs_window,
            ..Default::default()
        };
        let dcron = Dcron::new("svc", Box::new(driver.clone()), config);
        dcron.start().await.unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        tokio::time::sleep(Duration::from_millis(500)).await;
        dcron.add_func("job", "@every 1s", counting(&fired)).unwrap();

        // A peer appears for one refresh, then leaves again
        tokio::time::sleep(Duration::from_millis(200)).await;
        driver.set_others(&[new_node_id("svc")]);
        tokio::time::sleep(Duration::from_millis(900)).await;
        driver.set_others(&[]);
        assert!(matches!(
            dcron.get_job("job", true),
            Err(Error::Coordination(dcron_coordination::Error::NodePoolIsUpgrading))
        ));

        tokio::time::sleep(Duration::from_millis(3_100)).await;
        assert_eq!(dcron.nodes(), vec![dcron.node_id().to_string()]);
        dcron.stop().await.unwrap();
        fired.load(Ordering::SeqCst)
    }

    #[tokio::test(start_paused = true)]
    async fn attempts_deferred_during_churn_are_replayed() {
        // Four fire times: two deferred and replayed, two run directly
        assert_eq!(fires_through_membership_churn(Some(Duration::from_secs(60))).await, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn without_a_packer_deferred_attempts_are_dropped() {
        assert_eq!(fires_through_membership_churn(None).await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_pool_start_leaves_dcron_stopped() {
        struct Unreachable;

        #[async_trait::async_trait]
        impl Driver for Unreachable {
            fn init(&mut self, _: &str, _: dcron_coordination::DriverOptions) {}

            fn node_id(&self) -> &str {
                "unreachable"
            }

            async fn get_nodes(&self) -> dcron_coordination::Result<Vec<String>> {
                Ok(Vec::new())
            }

            async fn start(&self) -> dcron_coordination::Result<()> {
                Err(dcron_coordination::Error::Timeout {
                    operation: "register",
                    timeout: Duration::from_secs(1),
                })
            }

            async fn stop(&self) -> dcron_coordination::Result<()> {
                Ok(())
            }
        }

        let dcron = Dcron::new("svc", Box::new(Unreachable), DcronConfig::default());
        assert!(matches!(
            dcron.start().await,
            Err(Error::Coordination(dcron_coordination::Error::Timeout { .. }))
        ));
        assert!(!dcron.is_running());
        assert!(dcron.run().await.is_err());
        dcron.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_start_leaves_nothing_running() {
        let fired = Arc::new(AtomicUsize::new(0));
        let dcron = Dcron::running_locally("svc", DcronConfig::default()).with_recover_func(
            |_| tokio::time::sleep(Duration::from_secs(1)).boxed(),
        );
        dcron.add_func("tick", "@every 1s", counting(&fired)).unwrap();

        let starting = {
            let dcron = dcron.clone();
            tokio::spawn(async move { dcron.start().await })
        };
        tokio::time::sleep(Duration::from_millis(500)).await;
        dcron.stop().await.unwrap();
        starting.await.unwrap().unwrap();
        assert!(!dcron.is_running());

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        // A fresh start runs exactly one trigger, and stop silences it
        dcron.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(3_500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 3);
        dcron.stop().await.unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_coordinated_start_leaves_the_fleet() {
        let driver = ScriptedDriver::default();
        let config = DcronConfig {
            node_update_interval: Duration::from_secs(1),
            ..Default::default()
        };
        let dcron = Dcron::new("svc", Box::new(driver.clone()), config);

        let starting = {
            let dcron = dcron.clone();
            tokio::spawn(async move { dcron.start().await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        dcron.stop().await.unwrap();
        starting.await.unwrap().unwrap();
        assert!(!dcron.is_running());
        assert!(!driver.started.load(Ordering::SeqCst));

        dcron.start().await.unwrap();
        assert!(driver.started.load(Ordering::SeqCst));
        dcron.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn missing_ring_defers_instead_of_failing() {
        let config = DcronConfig {
            recent_jobs_window: Some(Duration::from_secs(60)),
            ..Default::default()
        };
        let dcron = Dcron::new("svc", Box::new(ScriptedDriver::default()), config);
        dcron.add_func("job", "@every 1s", || {}).unwrap();

        assert!(!dcron.inner.allow_this_node_run("job"));
        let deferred = dcron.inner.recent_jobs.as_ref().map(RecentJobPacker::len);
        assert_eq!(deferred, Some(1));
    }

    #[test]
    fn panic_payloads() {
        let payload: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(&*payload), "static");
        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(&*payload), "owned");
        let payload: Box<dyn Any + Send> = Box::new(7);
        assert_eq!(panic_message(&*payload), "non-string panic payload");
    }
}
