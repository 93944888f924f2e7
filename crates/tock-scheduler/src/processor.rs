use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};

use chrono::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tock_clock::{sleep, Clock, TimerHandle};
use tock_core::config::ProcessorConfig;
use tock_shard::ShardFilter;
use tracing::{debug, error, info, warn};

use crate::datastore::Datastore;
use crate::engine::log_store_error;
use crate::error::Result;
use crate::executor::{Executor, Outcome};
use crate::types::{ExecutionResult, Job, JobId, JobStatus, RateLimit, RunningStatus};

/// Times a transient storage error is retried inside one job task before the
/// job is left to the recovery sweep.
const STORE_RETRIES: u32 = 5;

/// Retry and throttling policy for one processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessorSettings {
    /// Executions per job before it is declared dead.
    pub max_attempts: u32,
    /// Attempt `n` waits `retry_backoff * n` before attempt `n + 1`. Also
    /// the backoff unit for retrying storage writes.
    pub retry_backoff: Duration,
    /// Hold time for a 429 that carries no `Retry-After`.
    pub rate_limit_backoff: Duration,
    /// Cadence of the sweep over stalled jobs.
    pub recovery_period: Duration,
    /// Age after which a `queued` or `running` job counts as stalled.
    pub stale_after: Duration,
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self::from(&ProcessorConfig::default())
    }
}

impl From<&ProcessorConfig> for ProcessorSettings {
    fn from(cfg: &ProcessorConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            retry_backoff: Duration::milliseconds(cfg.retry_backoff_ms as i64),
            rate_limit_backoff: Duration::milliseconds(cfg.rate_limit_backoff_ms as i64),
            recovery_period: Duration::milliseconds(cfg.recovery_period_ms.max(1) as i64),
            stale_after: Duration::milliseconds(cfg.stale_after_ms as i64),
        }
    }
}

/// Consumes the queued jobs in one shard assignment and runs them.
///
/// Every delivered job is handled on its own task, so a slow target never
/// holds up the rest of the queue and a failing job never stops the loop.
/// A periodic sweep picks up jobs that a failed storage write left in
/// `queued`, `running` or `failed`.
#[derive(Clone)]
pub struct Processor {
    store: Arc<dyn Datastore>,
    clock: Arc<dyn Clock>,
    executor: Arc<dyn Executor>,
    settings: ProcessorSettings,
    filter: ShardFilter,
    /// Unsatisfied limits seen on the rate-limit feed, by key.
    blocked: Arc<Mutex<HashMap<String, RateLimit>>>,
    /// Jobs with a task in this process.
    active: Arc<Mutex<HashSet<JobId>>>,
}

/// Marks a job as handled here until dropped.
struct ActiveJob {
    active: Arc<Mutex<HashSet<JobId>>>,
    id: JobId,
}

impl Drop for ActiveJob {
    fn drop(&mut self) {
        self.active.lock().unwrap().remove(&self.id);
    }
}

impl Processor {
    pub fn new(
        store: Arc<dyn Datastore>,
        clock: Arc<dyn Clock>,
        executor: Arc<dyn Executor>,
        settings: ProcessorSettings,
        filter: ShardFilter,
    ) -> Self {
        Self {
            store,
            clock,
            executor,
            settings,
            filter,
            blocked: Arc::new(Mutex::new(HashMap::new())),
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Main loop. Runs until `shutdown` broadcasts `true` or a feed ends,
    /// then waits for in-flight jobs.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut queue = match self.store.wait_for_next_jobs_in_queue(&self.filter).await {
            Ok(sub) => sub,
            Err(e) => {
                error!("processor could not subscribe to the queue: {e}");
                return;
            }
        };
        let mut limits = match self.store.listen_to_rate_limits(&self.filter).await {
            Ok(sub) => sub,
            Err(e) => {
                error!("processor could not subscribe to rate limits: {e}");
                return;
            }
        };

        let (reset_tx, mut reset_rx) = mpsc::unbounded_channel::<RateLimit>();
        let mut reset_timers: HashMap<String, TimerHandle> = HashMap::new();
        let mut tasks = JoinSet::new();

        // bounded(1): overlapping sweeps collapse into one
        let (sweep_tx, mut sweep_rx) = mpsc::channel::<()>(1);
        let recovery = self.clock.set_interval(
            Box::new(move || {
                let _ = sweep_tx.try_send(());
            }),
            self.settings.recovery_period,
        );

        info!(
            shards = ?self.filter.as_ref().map(Vec::len),
            max_attempts = self.settings.max_attempts,
            "processor started"
        );
        self.sweep(&mut tasks).await;

        loop {
            tokio::select! {
                batch = queue.recv() => {
                    let Some(jobs) = batch else {
                        warn!("queue feed ended");
                        break;
                    };
                    debug!(count = jobs.len(), "jobs delivered");
                    for job in jobs {
                        let worker = self.clone();
                        tasks.spawn(async move {
                            let id = job.id.clone();
                            if let Err(e) = worker.process_job(job).await {
                                log_store_error("process_job", &e);
                                debug!(job_id = %id, "job left for the recovery sweep");
                            }
                        });
                    }
                }
                batch = limits.recv() => {
                    let Some(batch) = batch else {
                        warn!("rate-limit feed ended");
                        break;
                    };
                    for limit in batch {
                        self.track_limit(limit, &reset_tx, &mut reset_timers);
                    }
                }
                Some(limit) = reset_rx.recv() => {
                    reset_timers.remove(&limit.key);
                    match self.store.mark_rate_limit_satisfied(&limit).await {
                        Ok(0) => debug!(key = %limit.key, "rate limit already lifted or extended"),
                        Ok(n) => info!(key = %limit.key, released = n, "rate limit lifted"),
                        Err(e) => {
                            log_store_error("mark_rate_limit_satisfied", &e);
                            if e.is_transient() {
                                let delay = self.settings.retry_backoff;
                                self.arm_reset(limit, delay, &reset_tx, &mut reset_timers);
                            }
                        }
                    }
                }
                Some(()) = sweep_rx.recv() => self.sweep(&mut tasks).await,
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!("job task panicked: {e}");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("processor shutting down");
                        break;
                    }
                }
            }
        }

        queue.cancel();
        limits.cancel();
        self.clock.clear_interval(recovery);
        for handle in reset_timers.into_values() {
            self.clock.clear_timeout(handle);
        }
        if !tasks.is_empty() {
            info!(in_flight = tasks.len(), "waiting for in-flight jobs");
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("job task panicked: {e}");
            }
        }
        info!("processor stopped");
    }

    /// Keep the local view of `limit` current and arm a timer that lifts it
    /// at `reset_at`.
    fn track_limit(
        &self,
        limit: RateLimit,
        reset_tx: &mpsc::UnboundedSender<RateLimit>,
        timers: &mut HashMap<String, TimerHandle>,
    ) {
        if let Some(old) = timers.remove(&limit.key) {
            self.clock.clear_timeout(old);
        }
        if limit.satisfied {
            self.blocked.lock().unwrap().remove(&limit.key);
            return;
        }
        self.blocked
            .lock()
            .unwrap()
            .insert(limit.key.clone(), limit.clone());

        let delay = limit.reset_at - self.clock.now();
        self.arm_reset(limit, delay, reset_tx, timers);
    }

    fn arm_reset(
        &self,
        limit: RateLimit,
        delay: Duration,
        reset_tx: &mpsc::UnboundedSender<RateLimit>,
        timers: &mut HashMap<String, TimerHandle>,
    ) {
        let key = limit.key.clone();
        let tx = reset_tx.clone();
        let handle = self.clock.set_timeout(
            Box::new(move || {
                let _ = tx.send(limit.clone());
            }),
            delay,
        );
        debug!(key = %key, delay_ms = delay.num_milliseconds(), "rate limit reset armed");
        timers.insert(key, handle);
    }

    /// The stored limit holding `key`, unless it is already due to lift.
    fn blocking_limit(&self, key: &str) -> Option<RateLimit> {
        let now = self.clock.now();
        self.blocked
            .lock()
            .unwrap()
            .get(key)
            .filter(|l| !l.is_due(now))
            .cloned()
    }

    fn activate(&self, id: &JobId) -> Option<ActiveJob> {
        if !self.active.lock().unwrap().insert(id.clone()) {
            return None;
        }
        Some(ActiveJob {
            active: self.active.clone(),
            id: id.clone(),
        })
    }

    /// Run `call` again while it fails with a transient storage error, up to
    /// [`STORE_RETRIES`] times, backing off on the clock.
    async fn persist<T, F, Fut>(&self, op: &'static str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut tries = 0;
        loop {
            match call().await {
                Err(e) if e.is_transient() && tries < STORE_RETRIES => {
                    tries += 1;
                    warn!(op, tries, "storage error, retrying: {e}");
                    sleep(self.clock.as_ref(), self.settings.retry_backoff * tries as i32).await;
                }
                other => return other,
            }
        }
    }

    /// Hand every stalled job in this shard assignment to a task.
    async fn sweep(&self, tasks: &mut JoinSet<()>) {
        let stale_before = self.clock.now() - self.settings.stale_after;
        let stalled = match self.store.get_stalled_jobs(stale_before, &self.filter).await {
            Ok(jobs) => jobs,
            Err(e) => {
                log_store_error("get_stalled_jobs", &e);
                return;
            }
        };
        let active = self.active.lock().unwrap().clone();
        let stalled: Vec<Job> = stalled
            .into_iter()
            .filter(|j| !active.contains(&j.id))
            .collect();
        if stalled.is_empty() {
            return;
        }
        info!(count = stalled.len(), "recovering stalled jobs");
        for job in stalled {
            let worker = self.clone();
            tasks.spawn(async move {
                let id = job.id.clone();
                if let Err(e) = worker.recover_job(job).await {
                    log_store_error("recover_job", &e);
                    debug!(job_id = %id, "job left for the next sweep");
                }
            });
        }
    }

    /// Run one delivery of a `queued` job to a terminal or parked state.
    ///
    /// Transient storage errors are retried in place; `Err` means they
    /// persisted, and the job is left for the recovery sweep.
    pub async fn process_job(&self, job: Job) -> Result<()> {
        let Some(_active) = self.activate(&job.id) else {
            debug!(job_id = %job.id, "job already handled here");
            return Ok(());
        };
        self.process_queued(&job).await
    }

    /// Pick up a job found by the recovery sweep where it was left.
    ///
    /// A `running` job resumes with its next attempt; one that already used
    /// every attempt fails. A `failed` job is buried.
    pub async fn recover_job(&self, job: Job) -> Result<()> {
        let Some(_active) = self.activate(&job.id) else {
            return Ok(());
        };
        match job.status {
            JobStatus::Queued => self.process_queued(&job).await,
            JobStatus::Running if job.attempts < self.settings.max_attempts => {
                let attempt = job.attempts + 1;
                if !self.claim(&job, attempt).await? {
                    return Ok(());
                }
                info!(job_id = %job.id, attempt, "resuming stalled job");
                self.run_attempts(&job, attempt).await
            }
            JobStatus::Running => {
                let result = job.result.clone().unwrap_or_else(|| {
                    ExecutionResult::from_error(
                        format!("abandoned after {} attempts", job.attempts),
                        0,
                    )
                });
                self.fail(&job, result).await
            }
            JobStatus::Failed => {
                if self.persist("mark_as_dead", || self.store.mark_as_dead(&job.id)).await? {
                    info!(job_id = %job.id, "failed job buried");
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn process_queued(&self, job: &Job) -> Result<()> {
        let key = job.definition.effective_rate_limit_key();
        if let Some(limit) = self.blocking_limit(&key) {
            let limits = [limit];
            if self
                .persist("mark_rate_limited", || self.store.mark_rate_limited(job, &limits))
                .await?
            {
                info!(job_id = %job.id, key = %key, "job deferred behind rate limit");
            }
            return Ok(());
        }

        if !self.claim(job, 1).await? {
            debug!(job_id = %job.id, "job not runnable, skipping");
            return Ok(());
        }
        self.run_attempts(job, 1).await
    }

    async fn claim(&self, job: &Job, attempt: u32) -> Result<bool> {
        let running = RunningStatus {
            attempt,
            started_at: self.clock.now(),
        };
        self.persist("mark_job_as_running", || {
            self.store.mark_job_as_running(&job.id, running)
        })
        .await
    }

    /// Execute `job` starting at the already-claimed attempt `first`, until
    /// it completes or runs out of attempts.
    ///
    /// A throttled attempt keeps the job `running`: the limit is recorded
    /// for other jobs on the same key, and the next attempt waits for its
    /// reset.
    async fn run_attempts(&self, job: &Job, first: u32) -> Result<()> {
        let max = self.settings.max_attempts;
        let mut attempt = first;
        let last_failure = loop {
            let wait = match self.executor.execute(job).await {
                Outcome::Success(mut result) => {
                    result.finished_at = self.clock.now();
                    let status = JobStatus::Completed;
                    if self
                        .persist("mark_job_as_complete", || {
                            self.store.mark_job_as_complete(&job.id, result.clone(), status)
                        })
                        .await?
                    {
                        info!(job_id = %job.id, attempt, "job completed");
                    }
                    return Ok(());
                }
                Outcome::RateLimited {
                    key,
                    retry_after,
                    mut result,
                } => {
                    result.finished_at = self.clock.now();
                    let hold = retry_after
                        .and_then(|d| Duration::from_std(d).ok())
                        .unwrap_or(self.settings.rate_limit_backoff);
                    let blocked =
                        RateLimit::blocked(key.clone(), self.clock.now() + hold, job.shards.clone());
                    let limit = self
                        .persist("record_rate_limit", || self.store.record_rate_limit(&blocked))
                        .await?;
                    warn!(
                        job_id = %job.id,
                        key = %key,
                        attempt,
                        hold_ms = hold.num_milliseconds(),
                        "target rate limited"
                    );
                    if attempt >= max {
                        break result;
                    }
                    limit.reset_at - self.clock.now()
                }
                Outcome::Failure(mut result) => {
                    result.finished_at = self.clock.now();
                    warn!(
                        job_id = %job.id,
                        attempt,
                        status = ?result.status_code,
                        error = ?result.error,
                        "attempt failed"
                    );
                    if attempt >= max {
                        break result;
                    }
                    self.settings.retry_backoff * attempt as i32
                }
            };

            sleep(self.clock.as_ref(), wait).await;
            attempt += 1;
            if !self.claim(job, attempt).await? {
                debug!(job_id = %job.id, attempt, "job taken over, stopping");
                return Ok(());
            }
        };

        self.fail(job, last_failure).await
    }

    /// `running -> failed -> dead`.
    async fn fail(&self, job: &Job, result: ExecutionResult) -> Result<()> {
        let status = JobStatus::Failed;
        let failed = self
            .persist("mark_job_as_complete", || {
                self.store.mark_job_as_complete(&job.id, result.clone(), status)
            })
            .await?;
        if failed && self.persist("mark_as_dead", || self.store.mark_as_dead(&job.id)).await? {
            info!(job_id = %job.id, attempts = self.settings.max_attempts, "job dead after exhausting retries");
        }
        Ok(())
    }
}
