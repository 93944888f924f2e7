use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tock_shard::{filter_matches, ShardFilter};
use tracing::{debug, info};

use crate::datastore::{Datastore, Subscription};
use crate::error::{Result, SchedulerError};
use crate::feed::spawn_feed;
use crate::types::{ExecutionResult, Job, JobId, JobStatus, RateLimit, RunningStatus};

/// In-process datastore.
///
/// Holds everything behind one mutex and wakes subscriptions through a
/// change counter. Cloning shares the same store.
#[derive(Clone)]
pub struct MemoryDatastore {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    changes: watch::Sender<u64>,
    shutdown: CancellationToken,
}

#[derive(Default)]
struct State {
    jobs: HashMap<JobId, Job>,
    rate_limits: HashMap<String, RateLimit>,
    /// Pending injected failures by operation name.
    faults: HashMap<&'static str, u32>,
    closed: bool,
}

impl State {
    fn job_mut(&mut self, id: &JobId) -> Result<&mut Job> {
        self.jobs
            .get_mut(id)
            .ok_or_else(|| SchedulerError::JobNotFound { id: id.to_string() })
    }

    fn take_fault(&mut self, op: &'static str) -> Result<()> {
        match self.faults.get_mut(op) {
            Some(n) if *n > 0 => {
                *n -= 1;
                Err(SchedulerError::Storage(format!("injected failure in {op}")))
            }
            _ => Ok(()),
        }
    }

    fn jobs_in(&self, status: JobStatus, filter: &ShardFilter) -> Vec<Job> {
        self.jobs
            .values()
            .filter(|j| j.status == status && filter_matches(filter, &j.shards))
            .cloned()
            .collect()
    }
}

impl MemoryDatastore {
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                changes,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Every stored job, for inspection in tests and tooling.
    pub fn snapshot(&self) -> Vec<Job> {
        let state = self.inner.state.lock().unwrap();
        let mut jobs: Vec<Job> = state.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| a.registered_at.cmp(&b.registered_at).then(a.id.cmp(&b.id)));
        jobs
    }

    pub fn rate_limit(&self, key: &str) -> Option<RateLimit> {
        self.inner.state.lock().unwrap().rate_limits.get(key).cloned()
    }

    /// Make the next `times` calls of the write operation `op` fail with a
    /// transient storage error.
    pub fn fail_next(&self, op: &'static str, times: u32) {
        *self
            .inner
            .state
            .lock()
            .unwrap()
            .faults
            .entry(op)
            .or_default() += times;
    }

    /// Run `f` under the lock; wake subscribers when it reports a change.
    fn write<R>(&self, f: impl FnOnce(&mut State) -> Result<(R, bool)>) -> Result<R> {
        let (value, changed) = {
            let mut state = self.inner.state.lock().unwrap();
            if state.closed {
                return Err(SchedulerError::Closed);
            }
            f(&mut state)?
        };
        if changed {
            self.inner.changes.send_modify(|v| *v += 1);
        }
        Ok(value)
    }

    fn read<R>(&self, f: impl FnOnce(&State) -> R) -> Result<R> {
        let state = self.inner.state.lock().unwrap();
        if state.closed {
            return Err(SchedulerError::Closed);
        }
        Ok(f(&state))
    }

    fn feed<T, F>(&self, query: F) -> Result<Subscription<T>>
    where
        T: crate::feed::FeedItem + Send + 'static,
        F: Fn(&State) -> Vec<T> + Send + 'static,
    {
        self.read(|_| ())?;
        let inner = self.inner.clone();
        Ok(spawn_feed(
            self.inner.changes.subscribe(),
            self.inner.shutdown.child_token(),
            None,
            move || {
                let state = inner.state.lock().unwrap();
                if state.closed {
                    return Err(SchedulerError::Closed);
                }
                Ok(query(&state))
            },
        ))
    }
}

impl Default for MemoryDatastore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Datastore for MemoryDatastore {
    async fn schedule(&self, mut job: Job) -> Result<JobId> {
        job.status = JobStatus::Registered;
        let id = job.id.clone();
        self.write(|state| {
            if state.jobs.contains_key(&id) {
                return Err(SchedulerError::Storage(format!("duplicate job id {id}")));
            }
            state.jobs.insert(id.clone(), job);
            Ok(((), true))
        })?;
        debug!(job_id = %id, "job registered");
        Ok(id)
    }

    async fn get_job(&self, id: &JobId) -> Result<Option<Job>> {
        self.read(|state| state.jobs.get(id).cloned())
    }

    async fn cancel(&self, id: &JobId) -> Result<bool> {
        let cancelled = self.write(|state| {
            let changed = state.job_mut(id)?.cancel();
            Ok((changed, changed))
        })?;
        if cancelled {
            info!(job_id = %id, "job cancelled");
        }
        Ok(cancelled)
    }

    async fn queue_jobs(&self, ids: &[JobId]) -> Result<usize> {
        self.write(|state| {
            let moved = ids
                .iter()
                .filter(|id| state.jobs.get_mut(*id).is_some_and(|j| j.queue()))
                .count();
            Ok((moved, moved > 0))
        })
    }

    async fn wait_for_registered_jobs_by_registered_at(
        &self,
        filter: &ShardFilter,
    ) -> Result<Subscription<Job>> {
        let filter = filter.clone();
        self.feed(move |state| {
            let mut jobs = state.jobs_in(JobStatus::Registered, &filter);
            jobs.sort_by(|a, b| a.registered_at.cmp(&b.registered_at).then(a.id.cmp(&b.id)));
            jobs
        })
    }

    async fn get_registered_jobs_by_scheduled_at(
        &self,
        before: DateTime<Utc>,
        filter: &ShardFilter,
    ) -> Result<Vec<Job>> {
        self.read(|state| {
            let mut jobs: Vec<Job> = state
                .jobs_in(JobStatus::Registered, filter)
                .into_iter()
                .filter(|j| j.definition.scheduled_at <= before)
                .collect();
            jobs.sort_by(|a, b| {
                a.definition
                    .scheduled_at
                    .cmp(&b.definition.scheduled_at)
                    .then(a.id.cmp(&b.id))
            });
            jobs
        })
    }

    async fn wait_for_next_jobs_in_queue(&self, filter: &ShardFilter) -> Result<Subscription<Job>> {
        let filter = filter.clone();
        self.feed(move |state| {
            let mut jobs = state.jobs_in(JobStatus::Queued, &filter);
            jobs.sort_by(|a, b| {
                a.definition
                    .scheduled_at
                    .cmp(&b.definition.scheduled_at)
                    .then(a.id.cmp(&b.id))
            });
            jobs
        })
    }

    async fn mark_rate_limited(&self, job: &Job, limits: &[RateLimit]) -> Result<bool> {
        self.write(|state| {
            state.take_fault("mark_rate_limited")?;
            let stored = state.job_mut(&job.id)?;
            if !stored.defer(limits.iter().map(|l| l.key.clone())) {
                return Ok((false, false));
            }
            let shards = stored.shards.clone();
            for limit in limits {
                let merged = RateLimit::merge(state.rate_limits.get(&limit.key), limit, &shards);
                state.rate_limits.insert(limit.key.clone(), merged);
            }
            Ok((true, true))
        })
    }

    async fn mark_rate_limit_satisfied(&self, limit: &RateLimit) -> Result<usize> {
        self.write(|state| {
            state.take_fault("mark_rate_limit_satisfied")?;
            let Some(stored) = state.rate_limits.get_mut(&limit.key) else {
                return Ok((0, false));
            };
            if !stored.satisfy(limit) {
                return Ok((0, false));
            }
            let mut released = 0;
            for job in state.jobs.values_mut() {
                if job.release(&limit.key) {
                    released += 1;
                }
            }
            Ok((released, true))
        })
    }

    async fn record_rate_limit(&self, limit: &RateLimit) -> Result<RateLimit> {
        self.write(|state| {
            state.take_fault("record_rate_limit")?;
            let merged = RateLimit::merge(state.rate_limits.get(&limit.key), limit, &[]);
            state.rate_limits.insert(limit.key.clone(), merged.clone());
            Ok((merged, true))
        })
    }

    async fn listen_to_rate_limits(&self, filter: &ShardFilter) -> Result<Subscription<RateLimit>> {
        let filter = filter.clone();
        self.feed(move |state| {
            let mut limits: Vec<RateLimit> = state
                .rate_limits
                .values()
                .filter(|l| filter_matches(&filter, &l.shards))
                .cloned()
                .collect();
            limits.sort_by(|a, b| a.key.cmp(&b.key));
            limits
        })
    }

    async fn mark_job_as_running(&self, id: &JobId, status: RunningStatus) -> Result<bool> {
        self.write(|state| {
            state.take_fault("mark_job_as_running")?;
            let changed = state.job_mut(id)?.start_attempt(status);
            Ok((changed, changed))
        })
    }

    async fn mark_job_as_complete(
        &self,
        id: &JobId,
        result: ExecutionResult,
        status: JobStatus,
    ) -> Result<bool> {
        self.write(|state| {
            state.take_fault("mark_job_as_complete")?;
            let changed = state.job_mut(id)?.complete(result, status)?;
            Ok((changed, changed))
        })
    }

    async fn mark_as_dead(&self, id: &JobId) -> Result<bool> {
        self.write(|state| {
            state.take_fault("mark_as_dead")?;
            let changed = state.job_mut(id)?.bury()?;
            Ok((changed, changed))
        })
    }

    async fn get_stalled_jobs(
        &self,
        stale_before: DateTime<Utc>,
        filter: &ShardFilter,
    ) -> Result<Vec<Job>> {
        self.read(|state| {
            let mut jobs: Vec<Job> = state
                .jobs
                .values()
                .filter(|j| j.is_stalled(stale_before) && filter_matches(filter, &j.shards))
                .cloned()
                .collect();
            jobs.sort_by(|a, b| {
                a.definition
                    .scheduled_at
                    .cmp(&b.definition.scheduled_at)
                    .then(a.id.cmp(&b.id))
            });
            jobs
        })
    }

    async fn close(&self) {
        let mut state = self.inner.state.lock().unwrap();
        if state.closed {
            return;
        }
        state.closed = true;
        self.inner.shutdown.cancel();
        info!("memory datastore closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::JobDefinition;
    use chrono::{Duration, TimeZone};
    use tock_shard::Shard;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 1, 9, 0, 0).unwrap()
    }

    fn job(id: &str, shard: u32, due: DateTime<Utc>) -> Job {
        Job::with_id(
            JobId::from(id),
            JobDefinition::new("https://example.com/hook", due),
            vec![Shard::new(shard, 2)],
            t0(),
        )
    }

    fn running() -> RunningStatus {
        RunningStatus {
            attempt: 1,
            started_at: t0(),
        }
    }

    #[tokio::test]
    async fn schedule_then_read_back() {
        let store = MemoryDatastore::new();
        let id = store.schedule(job("a", 0, t0())).await.unwrap();
        let stored = store.get_job(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Registered);
        assert!(store.get_job(&JobId::from("nope")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected() {
        let store = MemoryDatastore::new();
        store.schedule(job("a", 0, t0())).await.unwrap();
        let err = store.schedule(job("a", 0, t0())).await.unwrap_err();
        assert!(matches!(err, SchedulerError::Storage(_)));
    }

    #[tokio::test]
    async fn queue_jobs_is_idempotent() {
        let store = MemoryDatastore::new();
        store.schedule(job("a", 0, t0())).await.unwrap();
        store.schedule(job("b", 0, t0())).await.unwrap();
        let ids = [JobId::from("a"), JobId::from("b"), JobId::from("ghost")];
        assert_eq!(store.queue_jobs(&ids).await.unwrap(), 2);
        assert_eq!(store.queue_jobs(&ids).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn due_query_respects_time_and_filter() {
        let store = MemoryDatastore::new();
        store.schedule(job("early", 0, t0())).await.unwrap();
        store
            .schedule(job("late", 0, t0() + Duration::hours(1)))
            .await
            .unwrap();
        store.schedule(job("other", 1, t0())).await.unwrap();

        let due = store
            .get_registered_jobs_by_scheduled_at(t0(), &Some(vec![Shard::new(0, 2)]))
            .await
            .unwrap();
        let ids: Vec<&str> = due.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, vec!["early"]);

        let all = store
            .get_registered_jobs_by_scheduled_at(t0(), &None)
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn queue_feed_delivers_newly_queued_jobs() {
        let store = MemoryDatastore::new();
        let mut queue = store
            .wait_for_next_jobs_in_queue(&Some(vec![Shard::new(0, 2)]))
            .await
            .unwrap();
        store.schedule(job("a", 0, t0())).await.unwrap();
        store.schedule(job("b", 1, t0())).await.unwrap();
        store
            .queue_jobs(&[JobId::from("a"), JobId::from("b")])
            .await
            .unwrap();

        let batch = queue.recv().await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, JobId::from("a"));
        assert_eq!(batch[0].status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn cancel_is_benign_after_start() {
        let store = MemoryDatastore::new();
        store.schedule(job("a", 0, t0())).await.unwrap();
        store.queue_jobs(&[JobId::from("a")]).await.unwrap();
        assert!(store
            .mark_job_as_running(&JobId::from("a"), running())
            .await
            .unwrap());
        assert!(!store.cancel(&JobId::from("a")).await.unwrap());
        assert!(matches!(
            store.cancel(&JobId::from("ghost")).await,
            Err(SchedulerError::JobNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn rate_limit_round_trip_requeues() {
        let store = MemoryDatastore::new();
        let mut limits = store.listen_to_rate_limits(&None).await.unwrap();
        store.schedule(job("a", 0, t0())).await.unwrap();
        store.queue_jobs(&[JobId::from("a")]).await.unwrap();
        let queued = store.get_job(&JobId::from("a")).await.unwrap().unwrap();

        let limit = RateLimit::blocked("example.com", t0(), vec![]);
        assert!(store.mark_rate_limited(&queued, &[limit]).await.unwrap());
        assert_eq!(
            store.get_job(&JobId::from("a")).await.unwrap().unwrap().status,
            JobStatus::RateLimited
        );

        let observed = limits.recv().await.unwrap().pop().unwrap();
        assert!(!observed.satisfied);
        assert_eq!(observed.shards, vec![Shard::new(0, 2)]);

        assert_eq!(store.mark_rate_limit_satisfied(&observed).await.unwrap(), 1);
        assert_eq!(store.mark_rate_limit_satisfied(&observed).await.unwrap(), 0);
        assert_eq!(
            store.get_job(&JobId::from("a")).await.unwrap().unwrap().status,
            JobStatus::Queued
        );
        assert!(limits.recv().await.unwrap()[0].satisfied);
    }

    #[tokio::test]
    async fn satisfied_limit_releases_every_held_job() {
        let store = MemoryDatastore::new();
        for id in ["a", "b", "c"] {
            store.schedule(job(id, 0, t0())).await.unwrap();
        }
        let ids = [JobId::from("a"), JobId::from("b"), JobId::from("c")];
        store.queue_jobs(&ids).await.unwrap();
        let limit = RateLimit::blocked("example.com", t0(), vec![]);
        for id in &ids[..2] {
            let queued = store.get_job(id).await.unwrap().unwrap();
            store.mark_rate_limited(&queued, &[limit.clone()]).await.unwrap();
        }

        let stored = store.rate_limit("example.com").unwrap();
        assert_eq!(store.mark_rate_limit_satisfied(&stored).await.unwrap(), 2);
        for id in &ids {
            assert_eq!(
                store.get_job(id).await.unwrap().unwrap().status,
                JobStatus::Queued
            );
        }
    }

    #[tokio::test]
    async fn running_job_is_not_parked_by_a_limit() {
        let store = MemoryDatastore::new();
        store.schedule(job("a", 0, t0())).await.unwrap();
        store.queue_jobs(&[JobId::from("a")]).await.unwrap();
        store
            .mark_job_as_running(&JobId::from("a"), running())
            .await
            .unwrap();
        let current = store.get_job(&JobId::from("a")).await.unwrap().unwrap();

        let limit = RateLimit::blocked("example.com", t0(), vec![Shard::new(0, 2)]);
        assert!(!store.mark_rate_limited(&current, &[limit.clone()]).await.unwrap());
        assert!(store.rate_limit("example.com").is_none());

        let recorded = store.record_rate_limit(&limit).await.unwrap();
        assert!(!recorded.satisfied);
        assert_eq!(recorded.revision, 1);
        assert_eq!(
            store.get_job(&JobId::from("a")).await.unwrap().unwrap().status,
            JobStatus::Running
        );
    }

    #[tokio::test]
    async fn stalled_jobs_by_state_and_age() {
        let store = MemoryDatastore::new();
        for (id, shard) in [("queued", 0), ("running", 0), ("failed", 0), ("fresh", 0), ("other", 1)] {
            store.schedule(job(id, shard, t0())).await.unwrap();
        }
        store
            .queue_jobs(&[
                JobId::from("queued"),
                JobId::from("running"),
                JobId::from("failed"),
                JobId::from("other"),
            ])
            .await
            .unwrap();
        for id in ["running", "failed"] {
            store.mark_job_as_running(&JobId::from(id), running()).await.unwrap();
        }
        store
            .mark_job_as_complete(
                &JobId::from("failed"),
                ExecutionResult::from_error("boom", 1),
                JobStatus::Failed,
            )
            .await
            .unwrap();

        let later = t0() + Duration::minutes(10);
        let stalled = store
            .get_stalled_jobs(later, &Some(vec![Shard::new(0, 2)]))
            .await
            .unwrap();
        let mut ids: Vec<&str> = stalled.iter().map(|j| j.id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["failed", "queued", "running"]);

        let early = store
            .get_stalled_jobs(t0() - Duration::seconds(1), &None)
            .await
            .unwrap();
        assert_eq!(early.len(), 1);
        assert_eq!(early[0].id, JobId::from("failed"));
    }

    #[tokio::test]
    async fn injected_failures_are_transient_and_run_out() {
        let store = MemoryDatastore::new();
        store.schedule(job("a", 0, t0())).await.unwrap();
        store.queue_jobs(&[JobId::from("a")]).await.unwrap();
        store.fail_next("mark_job_as_running", 2);

        for _ in 0..2 {
            let err = store
                .mark_job_as_running(&JobId::from("a"), running())
                .await
                .unwrap_err();
            assert!(err.is_transient());
        }
        assert_eq!(
            store.get_job(&JobId::from("a")).await.unwrap().unwrap().status,
            JobStatus::Queued
        );
        assert!(store
            .mark_job_as_running(&JobId::from("a"), running())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn close_ends_feeds_and_rejects_calls() {
        let store = MemoryDatastore::new();
        let mut queue = store.wait_for_next_jobs_in_queue(&None).await.unwrap();
        store.close().await;
        store.close().await;
        assert!(queue.recv().await.is_none());
        assert!(matches!(
            store.schedule(job("a", 0, t0())).await,
            Err(SchedulerError::Closed)
        ));
    }
}
