use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tock_shard::ShardFilter;

use crate::error::Result;
use crate::types::{ExecutionResult, Job, JobId, JobStatus, RateLimit, RunningStatus};

/// Live feed of batches from a datastore.
///
/// Dropping the subscription or calling [`cancel`](Self::cancel) stops the
/// backing task. Batches arrive in order; separate subscriptions are not
/// ordered relative to each other.
pub struct Subscription<T> {
    rx: mpsc::Receiver<Vec<T>>,
    cancel: CancellationToken,
}

impl<T> Subscription<T> {
    pub fn new(rx: mpsc::Receiver<Vec<T>>, cancel: CancellationToken) -> Self {
        Self { rx, cancel }
    }

    /// Next batch, or `None` once the feed has ended.
    pub async fn recv(&mut self) -> Option<Vec<T>> {
        if self.cancel.is_cancelled() {
            return None;
        }
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            batch = self.rx.recv() => batch,
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Storage contract for jobs and rate limits; the single source of truth
/// for job state.
///
/// Transitions follow the rules in [`crate::lifecycle`]: anything the
/// scheduler or processor may redeliver returns `Ok(false)` when it has
/// already happened instead of failing. Every call after
/// [`close`](Self::close) returns [`SchedulerError::Closed`](crate::SchedulerError::Closed).
#[async_trait]
pub trait Datastore: Send + Sync {
    /// Persist `job` as `registered` and return its id.
    async fn schedule(&self, job: Job) -> Result<JobId>;

    async fn get_job(&self, id: &JobId) -> Result<Option<Job>>;

    /// Move a job that has not started to `cancelled`. `Ok(false)` when it
    /// is already running or terminal.
    async fn cancel(&self, id: &JobId) -> Result<bool>;

    /// Bulk `registered -> queued`. Returns how many jobs moved; ids that are
    /// unknown or past `registered` are skipped.
    async fn queue_jobs(&self, ids: &[JobId]) -> Result<usize>;

    /// Registered jobs visible through `filter`, oldest registration first.
    async fn wait_for_registered_jobs_by_registered_at(
        &self,
        filter: &ShardFilter,
    ) -> Result<Subscription<Job>>;

    /// Registered jobs with `scheduled_at <= before`, earliest first.
    async fn get_registered_jobs_by_scheduled_at(
        &self,
        before: DateTime<Utc>,
        filter: &ShardFilter,
    ) -> Result<Vec<Job>>;

    /// Queued jobs visible through `filter`. A job is delivered again each
    /// time it re-enters the queue.
    async fn wait_for_next_jobs_in_queue(&self, filter: &ShardFilter) -> Result<Subscription<Job>>;

    /// Defer a `queued` job under `limits` and record the limits as blocked.
    /// `Ok(false)` when the job is not `queued`; the limits are then left
    /// untouched.
    async fn mark_rate_limited(&self, job: &Job, limits: &[RateLimit]) -> Result<bool>;

    /// Lift `limit` and requeue every job it was holding. `limit` must carry
    /// the revision the caller observed; returns the number of jobs
    /// released, 0 if the limit changed since.
    async fn mark_rate_limit_satisfied(&self, limit: &RateLimit) -> Result<usize>;

    /// Block `limit.key` without parking any job, for a throttle hit by a job
    /// that is already running. Returns the stored limit after merging, whose
    /// `reset_at` may be later than the one passed in.
    async fn record_rate_limit(&self, limit: &RateLimit) -> Result<RateLimit>;

    /// Rate limits covering any shard in `filter`, re-delivered on every change.
    async fn listen_to_rate_limits(&self, filter: &ShardFilter) -> Result<Subscription<RateLimit>>;

    /// Start an attempt. `Ok(false)` means someone else holds the job or it
    /// is no longer runnable.
    async fn mark_job_as_running(&self, id: &JobId, status: RunningStatus) -> Result<bool>;

    /// Record the last attempt's result as `completed` or `failed`.
    async fn mark_job_as_complete(
        &self,
        id: &JobId,
        result: ExecutionResult,
        status: JobStatus,
    ) -> Result<bool>;

    /// `failed -> dead`.
    async fn mark_as_dead(&self, id: &JobId) -> Result<bool>;

    /// Jobs a lost write may have left behind, visible through `filter`:
    /// `queued` jobs due by `stale_before`, `running` jobs whose last attempt
    /// started by `stale_before`, and every `failed` job.
    async fn get_stalled_jobs(
        &self,
        stale_before: DateTime<Utc>,
        filter: &ShardFilter,
    ) -> Result<Vec<Job>>;

    /// End every subscription and refuse further calls. Safe to repeat.
    async fn close(&self);
}
