// Scheduler engine implementation

use crate::config::SchedulerSettings;
use crate::db::{InMemoryTaskStore, TaskStore};
use crate::errors::{ScheduleError, SchedulerError};
use crate::models::{JobInfo, JobStatus, ScheduledTask, SchedulerState, SchedulerStatus};
use crate::registry::{JobContext, JobRegistry};
use crate::schedule::Trigger;
use crate::scheduler::clock::{Clock, SystemClock};
use crate::telemetry;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use chrono_tz::Tz;
use futures::FutureExt;
use serde_json::{Map, Value};
use std::any::Any;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, instrument, warn};

/// Concurrent executions allowed per job id
const MAX_INSTANCES: usize = 1;

/// Configuration for the scheduler
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Default timezone for triggers that do not name one
    pub timezone: Tz,
    /// A firing later than this is dropped instead of run
    pub misfire_grace: ChronoDuration,
    /// Longest the dispatch loop sleeps without re-checking
    pub max_idle: Duration,
    pub auto_register: bool,
    pub placeholder_interval_seconds: u64,
    /// Let in-flight executions finish on `stop`
    pub wait_on_shutdown: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            timezone: chrono_tz::Asia::Shanghai,
            misfire_grace: ChronoDuration::seconds(60),
            max_idle: Duration::from_secs(60),
            auto_register: true,
            placeholder_interval_seconds: 60,
            wait_on_shutdown: true,
        }
    }
}

impl SchedulerConfig {
    pub fn from_settings(settings: &SchedulerSettings) -> Result<Self, SchedulerError> {
        let timezone = Tz::from_str(&settings.timezone)
            .map_err(|_| ScheduleError::InvalidTimezone(settings.timezone.clone()))?;

        Ok(Self {
            timezone,
            misfire_grace: i64::try_from(settings.misfire_grace_seconds)
                .ok()
                .and_then(ChronoDuration::try_seconds)
                .ok_or_else(|| ScheduleError::InvalidArgument {
                    name: "misfire_grace_seconds".to_string(),
                    reason: "too large".to_string(),
                })?,
            max_idle: Duration::from_secs(settings.max_idle_seconds.max(1)),
            auto_register: settings.auto_register,
            placeholder_interval_seconds: settings.placeholder_interval_seconds,
            wait_on_shutdown: settings.wait_on_shutdown,
        })
    }
}

/// A job installed in the live engine
struct LiveJob {
    id: String,
    name: String,
    func_name: String,
    trigger: Trigger,
    args: Vec<Value>,
    kwargs: Map<String, Value>,
    /// `None` while paused or once the series is exhausted
    next_run_time: Option<DateTime<Utc>>,
    paused: bool,
    running: Arc<AtomicUsize>,
}

impl LiveJob {
    fn status(&self) -> JobStatus {
        JobStatus {
            id: self.id.clone(),
            name: self.name.clone(),
            next_run_time: self.next_run_time,
            trigger: self.trigger.to_string(),
        }
    }

    fn info(&self) -> JobInfo {
        JobInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            func_name: self.func_name.clone(),
            next_run_time: self.next_run_time,
            trigger: self.trigger.to_string(),
            args: self.args.clone(),
            kwargs: self.kwargs.clone(),
            paused: self.paused,
        }
    }
}

/// Counts one in-flight execution for the lifetime of the guard
struct RunningGuard(Arc<AtomicUsize>);

impl RunningGuard {
    fn acquire(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// State shared by the public handle, the dispatch loop and execution units
struct SchedulerShared {
    config: SchedulerConfig,
    registry: Arc<JobRegistry>,
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    jobs: Mutex<BTreeMap<String, LiveJob>>,
    running: AtomicBool,
    wakeup: Notify,
}

impl SchedulerShared {
    async fn status(&self) -> SchedulerStatus {
        let jobs = self.jobs.lock().await;
        let mut list: Vec<JobStatus> = jobs.values().map(LiveJob::status).collect();
        list.sort_by(|a, b| match (a.next_run_time, b.next_run_time) {
            (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.id.cmp(&b.id)),
            (Some(_), None) => CmpOrdering::Less,
            (None, Some(_)) => CmpOrdering::Greater,
            (None, None) => a.id.cmp(&b.id),
        });

        let status = if self.running.load(Ordering::SeqCst) {
            SchedulerState::Running
        } else {
            SchedulerState::Stopped
        };
        SchedulerStatus { status, jobs: list }
    }

    async fn job_info(&self, id: &str) -> Option<JobInfo> {
        self.jobs.lock().await.get(id).map(LiveJob::info)
    }

    async fn current_next(&self, id: &str) -> Option<DateTime<Utc>> {
        self.jobs
            .lock()
            .await
            .get(id)
            .and_then(|job| job.next_run_time)
    }

    /// Write run times back to the store; failures only log
    async fn record_times(
        &self,
        id: &str,
        last_run_time: Option<DateTime<Utc>>,
        next_run_time: Option<DateTime<Utc>>,
    ) {
        if let Err(e) = self
            .store
            .record_run_times(id, last_run_time, next_run_time)
            .await
        {
            warn!(job_id = %id, error = %e, "Failed to write run times to store");
        }
    }
}

/// Read-only scheduler access handed to running jobs
#[derive(Clone)]
pub struct SchedulerView {
    shared: Arc<SchedulerShared>,
}

impl SchedulerView {
    pub async fn status(&self) -> SchedulerStatus {
        self.shared.status().await
    }

    pub async fn job_info(&self, id: &str) -> Option<JobInfo> {
        self.shared.job_info(id).await
    }
}

#[derive(Default)]
struct Lifecycle {
    shutdown_tx: Option<broadcast::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

/// Live timer engine reconciled with a `TaskStore`
///
/// One instance per process; pass it around as `Arc<SchedulerCore>`.
pub struct SchedulerCore {
    shared: Arc<SchedulerShared>,
    lifecycle: Mutex<Lifecycle>,
}

impl SchedulerCore {
    pub fn new(
        config: SchedulerConfig,
        registry: Arc<JobRegistry>,
        store: Arc<dyn TaskStore>,
    ) -> Self {
        Self::with_clock(config, registry, store, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: SchedulerConfig,
        registry: Arc<JobRegistry>,
        store: Arc<dyn TaskStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            shared: Arc::new(SchedulerShared {
                config,
                registry,
                store,
                clock,
                jobs: Mutex::new(BTreeMap::new()),
                running: AtomicBool::new(false),
                wakeup: Notify::new(),
            }),
            lifecycle: Mutex::new(Lifecycle::default()),
        }
    }

    /// Scheduler over an empty in-memory store with default settings
    pub fn in_memory(registry: JobRegistry) -> Self {
        Self::new(
            SchedulerConfig::default(),
            Arc::new(registry),
            Arc::new(InMemoryTaskStore::new()),
        )
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.shared.store
    }

    pub fn view(&self) -> SchedulerView {
        SchedulerView {
            shared: self.shared.clone(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Reconcile with the store, then start the dispatch loop
    ///
    /// A second call while running logs a warning and does nothing.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<(), SchedulerError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.handle.is_some() {
            warn!("Scheduler already running, ignoring start");
            return Ok(());
        }

        info!(timezone = %self.shared.config.timezone, "Starting scheduler");
        let installed = self.sync_from_store().await?;

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        self.shared.running.store(true, Ordering::SeqCst);
        let handle = tokio::spawn(dispatch_loop(self.shared.clone(), shutdown_rx));
        lifecycle.shutdown_tx = Some(shutdown_tx);
        lifecycle.handle = Some(handle);

        info!(installed, "Scheduler started");
        Ok(())
    }

    /// Stop the dispatch loop; no-op when not running
    #[instrument(skip(self))]
    pub async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        let Some(handle) = lifecycle.handle.take() else {
            debug!("Scheduler not running, ignoring stop");
            return;
        };

        info!("Stopping scheduler");
        if let Some(shutdown_tx) = lifecycle.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        if let Err(e) = handle.await {
            error!(error = %e, "Dispatch loop terminated abnormally");
        }
        self.shared.running.store(false, Ordering::SeqCst);
        info!("Scheduler stopped");
    }

    /// Create placeholders for unbacked registry entries, then install every
    /// enabled row. Rows that cannot be installed are logged and skipped.
    #[instrument(skip(self))]
    pub async fn sync_from_store(&self) -> Result<usize, SchedulerError> {
        if self.shared.config.auto_register {
            self.auto_register().await?;
        }

        let tasks = self.shared.store.list_enabled().await?;
        let mut installed = 0;
        for task in &tasks {
            match self.add_or_update_job(task).await {
                Ok(_) => installed += 1,
                Err(SchedulerError::RegistryMiss { func_name }) => warn!(
                    task_id = %task.id,
                    task_name = %task.name,
                    func_name = %func_name,
                    "Job function not registered, skipping task"
                ),
                Err(e) => error!(
                    task_id = %task.id,
                    task_name = %task.name,
                    error = %e,
                    "Failed to install task, skipping"
                ),
            }
        }

        info!(loaded = tasks.len(), installed, "Live jobs synchronized from store");
        Ok(installed)
    }

    /// Insert one disabled placeholder row per registry entry with no row yet
    #[instrument(skip(self))]
    pub async fn auto_register(&self) -> Result<usize, SchedulerError> {
        let mut created = 0;
        for func_name in self.shared.registry.names() {
            if self.shared.store.exists_for_func(&func_name).await? {
                continue;
            }
            let placeholder = ScheduledTask::placeholder(
                &func_name,
                self.shared.config.placeholder_interval_seconds,
            );
            if self.shared.store.insert(&placeholder).await? {
                info!(func_name = %func_name, task_id = %placeholder.id, "Placeholder task registered");
                created += 1;
            } else {
                debug!(func_name = %func_name, "Placeholder task already exists");
            }
        }
        Ok(created)
    }

    /// Check that a task could be installed, returning its trigger
    pub fn validate(&self, task: &ScheduledTask) -> Result<Trigger, SchedulerError> {
        if !self.shared.registry.contains(&task.func_name) {
            return Err(SchedulerError::RegistryMiss {
                func_name: task.func_name.clone(),
            });
        }
        let trigger = Trigger::from_config(
            &task.trigger_kind,
            &task.trigger_args,
            self.shared.config.timezone,
            self.shared.clock.now(),
        )?;
        Ok(trigger)
    }

    /// Install `task`, replacing any live job with the same id
    ///
    /// The trigger is parsed first, so an error leaves the previous live job in
    /// place. A disabled task is installed paused. Returns the next fire time.
    #[instrument(skip(self, task), fields(job_id = %task.id, job_name = %task.name))]
    pub async fn add_or_update_job(
        &self,
        task: &ScheduledTask,
    ) -> Result<Option<DateTime<Utc>>, SchedulerError> {
        let trigger = self.validate(task)?;
        let first_fire = trigger.next_fire_time(None, self.shared.clock.now());

        let mut jobs = self.shared.jobs.lock().await;
        let running = jobs
            .remove(&task.id)
            .map(|previous| previous.running)
            .unwrap_or_default();

        let Some(first_fire) = first_fire else {
            telemetry::update_live_jobs(jobs.len());
            drop(jobs);
            warn!(trigger = %trigger, "Trigger has no remaining fire time, job not installed");
            self.shared.record_times(&task.id, None, None).await;
            return Ok(None);
        };

        let paused = !task.is_enabled;
        let next_run_time = if paused { None } else { Some(first_fire) };
        let description = trigger.to_string();
        jobs.insert(
            task.id.clone(),
            LiveJob {
                id: task.id.clone(),
                name: task.name.clone(),
                func_name: task.func_name.clone(),
                trigger,
                args: task.positional_args(),
                kwargs: task.keyword_args(),
                next_run_time,
                paused,
                running,
            },
        );
        telemetry::update_live_jobs(jobs.len());
        drop(jobs);

        self.shared.wakeup.notify_one();
        self.shared.record_times(&task.id, None, next_run_time).await;
        info!(trigger = %description, next_run_time = ?next_run_time, paused, "Job installed");
        Ok(next_run_time)
    }

    /// Remove a live job; returns whether it existed
    #[instrument(skip(self))]
    pub async fn remove_job(&self, id: &str) -> bool {
        let mut jobs = self.shared.jobs.lock().await;
        let removed = jobs.remove(id).is_some();
        telemetry::update_live_jobs(jobs.len());
        drop(jobs);

        if removed {
            self.shared.wakeup.notify_one();
            info!("Job removed");
        } else {
            debug!("Job not found, nothing to remove");
        }
        removed
    }

    /// Pause a live job, keeping its trigger
    #[instrument(skip(self))]
    pub async fn pause_job(&self, id: &str) -> bool {
        let mut jobs = self.shared.jobs.lock().await;
        let Some(job) = jobs.get_mut(id) else {
            warn!("Job not found, cannot pause");
            return false;
        };
        job.paused = true;
        job.next_run_time = None;
        drop(jobs);

        self.shared.record_times(id, None, None).await;
        info!("Job paused");
        true
    }

    /// Resume a paused job from the current time
    ///
    /// A job with no remaining fire time is removed instead.
    #[instrument(skip(self))]
    pub async fn resume_job(&self, id: &str) -> bool {
        let now = self.shared.clock.now();
        let mut jobs = self.shared.jobs.lock().await;
        let Some(job) = jobs.get_mut(id) else {
            warn!("Job not found, cannot resume");
            return false;
        };
        if !job.paused {
            debug!("Job is not paused");
            return true;
        }

        let next_run_time = job.trigger.next_fire_time(None, now);
        match next_run_time {
            Some(next) => {
                job.paused = false;
                job.next_run_time = Some(next);
            }
            None => {
                jobs.remove(id);
                telemetry::update_live_jobs(jobs.len());
            }
        }
        drop(jobs);

        self.shared.wakeup.notify_one();
        self.shared.record_times(id, None, next_run_time).await;
        match next_run_time {
            Some(next) => info!(next_run_time = %next, "Job resumed"),
            None => info!("Job has no remaining fire time, removed on resume"),
        }
        true
    }

    pub async fn get_status(&self) -> SchedulerStatus {
        self.shared.status().await
    }

    pub async fn get_job_info(&self, id: &str) -> Option<JobInfo> {
        self.shared.job_info(id).await
    }

    /// Invoke the task's function once, bypassing its trigger
    #[instrument(skip(self, task), fields(job_id = %task.id, job_name = %task.name))]
    pub async fn run_once(&self, task: &ScheduledTask) -> Result<(), SchedulerError> {
        let ctx = JobContext {
            job_id: task.id.clone(),
            job_name: task.name.clone(),
            func_name: task.func_name.clone(),
            scheduled_at: self.shared.clock.now(),
            args: task.positional_args(),
            kwargs: task.keyword_args(),
            scheduler: self.view(),
        };

        info!("Running job once");
        let result = invoke(&self.shared.registry, ctx).await;
        if let Err(e) = &result {
            warn!(error = %e, "Run-once invocation failed");
        }
        result
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "job panicked".to_string()
    }
}

/// Resolve the callable and run one invocation, catching errors and panics
async fn invoke(registry: &JobRegistry, ctx: JobContext) -> Result<(), SchedulerError> {
    let function = registry
        .get(&ctx.func_name)
        .ok_or_else(|| SchedulerError::RegistryMiss {
            func_name: ctx.func_name.clone(),
        })?;

    let job_id = ctx.job_id.clone();
    let job_name = ctx.job_name.clone();
    let started = std::time::Instant::now();
    let outcome = AssertUnwindSafe(function.call(ctx)).catch_unwind().await;
    telemetry::record_job_duration(&job_id, &job_name, started.elapsed().as_secs_f64());

    match outcome {
        Ok(Ok(())) => {
            telemetry::record_job_success(&job_id, &job_name);
            Ok(())
        }
        Ok(Err(e)) => {
            telemetry::record_job_failure(&job_id, &job_name, "error");
            Err(SchedulerError::ExecutionFailed {
                job_id,
                reason: format!("{:#}", e),
            })
        }
        Err(panic) => {
            telemetry::record_job_failure(&job_id, &job_name, "panic");
            Err(SchedulerError::ExecutionFailed {
                job_id,
                reason: panic_message(panic.as_ref()),
            })
        }
    }
}

/// One execution unit: run the job, then write run times back
#[instrument(skip_all, fields(job_id = %ctx.job_id, job_name = %ctx.job_name))]
async fn execute(shared: Arc<SchedulerShared>, ctx: JobContext, guard: RunningGuard) {
    let job_id = ctx.job_id.clone();
    let job_name = ctx.job_name.clone();
    let scheduled_at = ctx.scheduled_at;

    debug!(scheduled_at = %scheduled_at, "Running job");
    match invoke(&shared.registry, ctx).await {
        Ok(()) => info!("Job executed successfully"),
        Err(SchedulerError::RegistryMiss { func_name }) => {
            telemetry::record_job_failure(&job_id, &job_name, "registry_miss");
            warn!(func_name = %func_name, "Job function not registered, run skipped");
        }
        Err(e) => error!(error = %e, "Job raised an error"),
    }
    drop(guard);

    let next_run_time = shared.current_next(&job_id).await;
    shared
        .record_times(&job_id, Some(scheduled_at), next_run_time)
        .await;
}

/// Hand every due job to an execution unit and return how long to sleep
async fn dispatch_due(shared: &Arc<SchedulerShared>, inflight: &mut JoinSet<()>) -> Duration {
    let now = shared.clock.now();
    let grace = shared.config.misfire_grace;
    let mut earliest: Option<DateTime<Utc>> = None;
    let mut exhausted = Vec::new();
    let mut writes = Vec::new();

    let mut jobs = shared.jobs.lock().await;
    for job in jobs.values_mut() {
        let due = match job.next_run_time {
            Some(due) if !job.paused => due,
            _ => continue,
        };
        if due > now {
            earliest = Some(earliest.map_or(due, |e| e.min(due)));
            continue;
        }

        let horizon = now.checked_sub_signed(grace).unwrap_or(DateTime::<Utc>::MIN_UTC);
        let scheduled_at = job.trigger.latest_due(due, now, horizon);
        let next = job.trigger.next_fire_time_after(now);
        job.next_run_time = next;

        let lateness = now - scheduled_at;
        if lateness > grace {
            warn!(
                job_id = %job.id,
                job_name = %job.name,
                scheduled_at = %scheduled_at,
                late_by_seconds = lateness.num_seconds(),
                "Run time missed by more than the grace window, skipping"
            );
            telemetry::record_job_misfire(&job.id);
            writes.push((job.id.clone(), next));
        } else if job.running.load(Ordering::SeqCst) >= MAX_INSTANCES {
            warn!(
                job_id = %job.id,
                job_name = %job.name,
                "Previous run still in progress, skipping this run"
            );
            telemetry::record_job_skipped(&job.id);
            writes.push((job.id.clone(), next));
        } else {
            let guard = RunningGuard::acquire(job.running.clone());
            let ctx = JobContext {
                job_id: job.id.clone(),
                job_name: job.name.clone(),
                func_name: job.func_name.clone(),
                scheduled_at,
                args: job.args.clone(),
                kwargs: job.kwargs.clone(),
                scheduler: SchedulerView {
                    shared: shared.clone(),
                },
            };
            inflight.spawn(execute(shared.clone(), ctx, guard));
        }

        match next {
            Some(next) => earliest = Some(earliest.map_or(next, |e| e.min(next))),
            None => exhausted.push(job.id.clone()),
        }
    }

    for id in &exhausted {
        jobs.remove(id);
        info!(job_id = %id, "Job has no remaining fire times, removed");
    }
    telemetry::update_live_jobs(jobs.len());
    drop(jobs);

    for (id, next) in writes {
        shared.record_times(&id, None, next).await;
    }

    let max_idle = shared.config.max_idle;
    match earliest {
        Some(at) => (at - now).to_std().unwrap_or(Duration::ZERO).min(max_idle),
        None => max_idle,
    }
}

/// The single scheduling loop of this process
async fn dispatch_loop(shared: Arc<SchedulerShared>, mut shutdown_rx: broadcast::Receiver<()>) {
    info!("Dispatch loop started");
    let mut inflight: JoinSet<()> = JoinSet::new();

    loop {
        let wait = dispatch_due(&shared, &mut inflight).await;

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = shared.wakeup.notified() => {
                debug!("Dispatch loop woken by a job change");
            }
            Some(joined) = inflight.join_next(), if !inflight.is_empty() => {
                if let Err(e) = joined {
                    error!(error = %e, "Job execution task failed");
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Shutdown signal received, stopping dispatch loop");
                break;
            }
        }
    }

    if shared.config.wait_on_shutdown {
        info!(in_flight = inflight.len(), "Waiting for in-flight jobs to finish");
        while let Some(joined) = inflight.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Job execution task failed");
            }
        }
    } else {
        inflight.detach_all();
    }

    info!("Dispatch loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::clock::TokioClock;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn counting_registry(name: &'static str, hits: Arc<AtomicUsize>) -> JobRegistry {
        JobRegistry::builder()
            .register_fn(name, move |_ctx| {
                let hits = hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .build()
    }

    fn scheduler(registry: JobRegistry, store: Arc<InMemoryTaskStore>) -> SchedulerCore {
        SchedulerCore::with_clock(
            SchedulerConfig::default(),
            Arc::new(registry),
            store,
            Arc::new(TokioClock::new()),
        )
    }

    fn interval_task(id: &str, func: &str, seconds: u64) -> ScheduledTask {
        ScheduledTask::new(id, id, func, "interval", json!({ "seconds": seconds }))
    }

    #[tokio::test(start_paused = true)]
    async fn test_five_second_interval_fires_twice_in_eleven_seconds() {
        let hits = Arc::new(AtomicUsize::new(0));
        let store = Arc::new(InMemoryTaskStore::new());
        let core = scheduler(counting_registry("heartbeat", hits.clone()), store);

        core.start().await.unwrap();
        core.add_or_update_job(&interval_task("t1", "heartbeat", 5))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        core.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_job_does_not_block_others() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let registry = JobRegistry::builder()
            .register_fn("boom", |_ctx| async { Err(anyhow::anyhow!("boom")) })
            .register_fn("panics", |_ctx| async { panic!("job panicked on purpose") })
            .register_fn("ok", move |_ctx| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .build();
        let core = scheduler(registry, Arc::new(InMemoryTaskStore::new()));

        core.start().await.unwrap();
        core.add_or_update_job(&interval_task("bad", "boom", 1)).await.unwrap();
        core.add_or_update_job(&interval_task("worse", "panics", 1)).await.unwrap();
        core.add_or_update_job(&interval_task("good", "ok", 2)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(6500)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert_eq!(core.get_status().await.jobs.len(), 3);
        core.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_reflects_add_and_remove() {
        let core = scheduler(
            counting_registry("heartbeat", Arc::new(AtomicUsize::new(0))),
            Arc::new(InMemoryTaskStore::new()),
        );
        let now = core.shared.clock.now();

        let next = core
            .add_or_update_job(&interval_task("t1", "heartbeat", 30))
            .await
            .unwrap();
        assert_eq!(next, Some(now + ChronoDuration::seconds(30)));

        let status = core.get_status().await;
        assert_eq!(status.status, SchedulerState::Stopped);
        let job = status.job("t1").unwrap();
        assert_eq!(job.next_run_time, next);
        assert_eq!(job.trigger, "interval[0:00:30]");

        assert!(core.remove_job("t1").await);
        assert!(!core.remove_job("t1").await);
        assert!(core.get_status().await.job("t1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_task_installs_paused_and_resumes() {
        let store = Arc::new(InMemoryTaskStore::new());
        let core = scheduler(
            counting_registry("heartbeat", Arc::new(AtomicUsize::new(0))),
            store.clone(),
        );

        let task = interval_task("t1", "heartbeat", 10).enabled(false);
        assert_eq!(core.add_or_update_job(&task).await.unwrap(), None);
        let info = core.get_job_info("t1").await.unwrap();
        assert!(info.paused);
        assert_eq!(info.next_run_time, None);

        assert!(core.resume_job("t1").await);
        let info = core.get_job_info("t1").await.unwrap();
        assert!(!info.paused);
        assert!(info.next_run_time.is_some());
        assert_eq!(info.trigger, "interval[0:00:10]");

        assert!(core.pause_job("t1").await);
        assert_eq!(core.get_job_info("t1").await.unwrap().next_run_time, None);
        assert!(!core.pause_job("missing").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_configuration_error_keeps_previous_job() {
        let core = scheduler(
            counting_registry("heartbeat", Arc::new(AtomicUsize::new(0))),
            Arc::new(InMemoryTaskStore::new()),
        );
        core.add_or_update_job(&interval_task("t1", "heartbeat", 5))
            .await
            .unwrap();

        let broken = ScheduledTask::new("t1", "t1", "heartbeat", "weekly", json!({}));
        let err = core.add_or_update_job(&broken).await.unwrap_err();
        assert!(matches!(err, SchedulerError::Configuration(_)));
        assert_eq!(
            core.get_status().await.job("t1").unwrap().trigger,
            "interval[0:00:05]"
        );

        let missing = interval_task("t1", "not_registered", 5);
        let err = core.add_or_update_job(&missing).await.unwrap_err();
        assert!(matches!(err, SchedulerError::RegistryMiss { .. }));
        assert!(core.get_status().await.job("t1").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_date_job_runs_once_and_is_removed() {
        let hits = Arc::new(AtomicUsize::new(0));
        let store = Arc::new(InMemoryTaskStore::new());
        let core = scheduler(counting_registry("once", hits.clone()), store.clone());
        let run_date = core.shared.clock.now() + ChronoDuration::seconds(3);
        let task = ScheduledTask::new(
            "d1",
            "d1",
            "once",
            "date",
            json!({ "run_date": run_date.to_rfc3339() }),
        );
        store.insert(&task).await.unwrap();

        core.start().await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(core.get_status().await.job("d1").is_none());
        let row = store.find_by_id("d1").await.unwrap().unwrap();
        assert_eq!(row.last_run_time, Some(run_date));
        assert_eq!(row.next_run_time, None);
        core.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_firing_past_grace_window_is_dropped() {
        let hits = Arc::new(AtomicUsize::new(0));
        let core = scheduler(
            counting_registry("once", hits.clone()),
            Arc::new(InMemoryTaskStore::new()),
        );
        let run_date = core.shared.clock.now() - ChronoDuration::seconds(120);
        let task = ScheduledTask::new(
            "late",
            "late",
            "once",
            "date",
            json!({ "run_date": run_date.to_rfc3339() }),
        );

        core.start().await.unwrap();
        core.add_or_update_job(&task).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(core.get_status().await.job("late").is_none());
        core.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_run_is_skipped() {
        let started = Arc::new(AtomicUsize::new(0));
        let counter = started.clone();
        let registry = JobRegistry::builder()
            .register_fn("slow", move |_ctx| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(12)).await;
                    Ok(())
                }
            })
            .build();
        let core = scheduler(registry, Arc::new(InMemoryTaskStore::new()));

        core.start().await.unwrap();
        core.add_or_update_job(&interval_task("s1", "slow", 5)).await.unwrap();

        // fires at 5 (runs until 17), 10 and 15 skipped, 20 runs
        tokio::time::sleep(Duration::from_secs(21)).await;
        assert_eq!(started.load(Ordering::SeqCst), 2);
        core.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_idempotent_and_stop_reports_stopped() {
        let store = Arc::new(InMemoryTaskStore::new());
        let core = scheduler(
            counting_registry("heartbeat", Arc::new(AtomicUsize::new(0))),
            store.clone(),
        );

        core.start().await.unwrap();
        core.start().await.unwrap();
        assert!(core.is_running());
        assert_eq!(core.get_status().await.status, SchedulerState::Running);
        // one placeholder despite two starts
        assert_eq!(store.len().await, 1);

        core.stop().await;
        core.stop().await;
        assert_eq!(core.get_status().await.status, SchedulerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_skips_unregistered_and_invalid_rows() {
        let store = Arc::new(InMemoryTaskStore::with_tasks([
            interval_task("ok", "heartbeat", 5),
            interval_task("ghost", "gone", 5),
            ScheduledTask::new("bad", "bad", "heartbeat", "interval", json!({"seconds": 0})),
            interval_task("off", "heartbeat", 5).enabled(false),
        ]));
        let core = scheduler(
            counting_registry("heartbeat", Arc::new(AtomicUsize::new(0))),
            store,
        );

        assert_eq!(core.sync_from_store().await.unwrap(), 1);
        let status = core.get_status().await;
        assert_eq!(status.jobs.len(), 1);
        assert_eq!(status.jobs[0].id, "ok");
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_once_reports_failures() {
        let registry = JobRegistry::builder()
            .register_fn("boom", |_ctx| async { Err(anyhow::anyhow!("bad input")) })
            .register_fn("echo", |ctx: JobContext| async move {
                anyhow::ensure!(ctx.args == vec![json!(1)], "unexpected args");
                anyhow::ensure!(ctx.kwarg_str("who") == Some("me"), "unexpected kwargs");
                Ok(())
            })
            .build();
        let core = scheduler(registry, Arc::new(InMemoryTaskStore::new()));

        let echo = interval_task("e", "echo", 5)
            .with_args(json!([1]))
            .with_kwargs(json!({"who": "me"}));
        core.run_once(&echo).await.unwrap();

        let err = core.run_once(&interval_task("b", "boom", 5)).await.unwrap_err();
        assert!(matches!(err, SchedulerError::ExecutionFailed { ref reason, .. } if reason.contains("bad input")));

        let err = core.run_once(&interval_task("m", "missing", 5)).await.unwrap_err();
        assert!(matches!(err, SchedulerError::RegistryMiss { .. }));
    }

    #[test]
    fn test_config_from_settings() {
        let settings = crate::config::Settings::default().scheduler;
        let config = SchedulerConfig::from_settings(&settings).unwrap();
        assert_eq!(config.timezone, chrono_tz::Asia::Shanghai);
        assert_eq!(config.misfire_grace, ChronoDuration::seconds(60));

        let mut bad = settings.clone();
        bad.timezone = "Nowhere/City".to_string();
        assert!(SchedulerConfig::from_settings(&bad).is_err());
    }
}
