//! Scheduler + Processor against the in-memory datastore on a virtual clock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::watch;
use tock_clock::{Clock, VirtualClock};
use tock_scheduler::{
    Datastore, ExecutionResult, Executor, Job, JobDefinition, JobId, JobStatus, MemoryDatastore,
    Outcome, Processor, ProcessorSettings, RateLimit, RunningStatus, Scheduler, Subscription,
};
use tock_shard::{ShardFilter, ShardTable};

// --- fixtures ----------------------------------------------------------------

/// Wraps a datastore and counts the terminal transitions it accepted.
struct Recording {
    inner: MemoryDatastore,
    terminal: Mutex<HashMap<JobId, u32>>,
}

impl Recording {
    fn new(inner: MemoryDatastore) -> Arc<Self> {
        Arc::new(Self {
            inner,
            terminal: Mutex::new(HashMap::new()),
        })
    }

    fn record(&self, id: &JobId) {
        *self.terminal.lock().unwrap().entry(id.clone()).or_default() += 1;
    }

    fn terminal_counts(&self) -> HashMap<JobId, u32> {
        self.terminal.lock().unwrap().clone()
    }
}

#[async_trait]
impl Datastore for Recording {
    async fn schedule(&self, job: Job) -> tock_scheduler::Result<JobId> {
        self.inner.schedule(job).await
    }

    async fn get_job(&self, id: &JobId) -> tock_scheduler::Result<Option<Job>> {
        self.inner.get_job(id).await
    }

    async fn cancel(&self, id: &JobId) -> tock_scheduler::Result<bool> {
        let cancelled = self.inner.cancel(id).await?;
        if cancelled {
            self.record(id);
        }
        Ok(cancelled)
    }

    async fn queue_jobs(&self, ids: &[JobId]) -> tock_scheduler::Result<usize> {
        self.inner.queue_jobs(ids).await
    }

    async fn wait_for_registered_jobs_by_registered_at(
        &self,
        filter: &ShardFilter,
    ) -> tock_scheduler::Result<Subscription<Job>> {
        self.inner
            .wait_for_registered_jobs_by_registered_at(filter)
            .await
    }

    async fn get_registered_jobs_by_scheduled_at(
        &self,
        before: DateTime<Utc>,
        filter: &ShardFilter,
    ) -> tock_scheduler::Result<Vec<Job>> {
        self.inner
            .get_registered_jobs_by_scheduled_at(before, filter)
            .await
    }

    async fn wait_for_next_jobs_in_queue(
        &self,
        filter: &ShardFilter,
    ) -> tock_scheduler::Result<Subscription<Job>> {
        self.inner.wait_for_next_jobs_in_queue(filter).await
    }

    async fn mark_rate_limited(
        &self,
        job: &Job,
        limits: &[RateLimit],
    ) -> tock_scheduler::Result<bool> {
        self.inner.mark_rate_limited(job, limits).await
    }

    async fn mark_rate_limit_satisfied(&self, limit: &RateLimit) -> tock_scheduler::Result<usize> {
        self.inner.mark_rate_limit_satisfied(limit).await
    }

    async fn record_rate_limit(&self, limit: &RateLimit) -> tock_scheduler::Result<RateLimit> {
        self.inner.record_rate_limit(limit).await
    }

    async fn listen_to_rate_limits(
        &self,
        filter: &ShardFilter,
    ) -> tock_scheduler::Result<Subscription<RateLimit>> {
        self.inner.listen_to_rate_limits(filter).await
    }

    async fn mark_job_as_running(
        &self,
        id: &JobId,
        status: RunningStatus,
    ) -> tock_scheduler::Result<bool> {
        self.inner.mark_job_as_running(id, status).await
    }

    async fn mark_job_as_complete(
        &self,
        id: &JobId,
        result: ExecutionResult,
        status: JobStatus,
    ) -> tock_scheduler::Result<bool> {
        let changed = self.inner.mark_job_as_complete(id, result, status).await?;
        if changed && status == JobStatus::Completed {
            self.record(id);
        }
        Ok(changed)
    }

    async fn mark_as_dead(&self, id: &JobId) -> tock_scheduler::Result<bool> {
        let changed = self.inner.mark_as_dead(id).await?;
        if changed {
            self.record(id);
        }
        Ok(changed)
    }

    async fn get_stalled_jobs(
        &self,
        stale_before: DateTime<Utc>,
        filter: &ShardFilter,
    ) -> tock_scheduler::Result<Vec<Job>> {
        self.inner.get_stalled_jobs(stale_before, filter).await
    }

    async fn close(&self) {
        self.inner.close().await
    }
}

/// Answers by URL path: `/fail` always fails, `/limited` is throttled on
/// its first call, anything else succeeds. Counts calls per job and per
/// worker.
struct StubTarget {
    worker: &'static str,
    calls: Arc<Mutex<HashMap<JobId, Vec<&'static str>>>>,
    throttled_once: Arc<Mutex<bool>>,
}

#[async_trait]
impl Executor for StubTarget {
    async fn execute(&self, job: &Job) -> Outcome {
        self.calls
            .lock()
            .unwrap()
            .entry(job.id.clone())
            .or_default()
            .push(self.worker);

        let result = |code: u16| ExecutionResult {
            status_code: Some(code),
            body: None,
            error: None,
            duration_ms: 1,
            finished_at: Utc::now(),
        };

        if job.definition.url.ends_with("/fail") {
            return Outcome::Failure(result(500));
        }
        if job.definition.url.ends_with("/limited") {
            let mut throttled = self.throttled_once.lock().unwrap();
            if !*throttled {
                *throttled = true;
                return Outcome::RateLimited {
                    key: job.definition.effective_rate_limit_key(),
                    retry_after: Some(std::time::Duration::from_secs(10)),
                    result: result(429),
                };
            }
        }
        Outcome::Success(result(200))
    }
}

type Calls = Arc<Mutex<HashMap<JobId, Vec<&'static str>>>>;

fn stub(worker: &'static str, calls: &Calls) -> Arc<StubTarget> {
    Arc::new(StubTarget {
        worker,
        calls: calls.clone(),
        throttled_once: Arc::new(Mutex::new(false)),
    })
}

fn settings() -> ProcessorSettings {
    ProcessorSettings {
        max_attempts: 3,
        retry_backoff: Duration::seconds(1),
        rate_limit_backoff: Duration::seconds(30),
        recovery_period: Duration::seconds(10),
        stale_after: Duration::seconds(30),
    }
}

/// Let spawned tasks settle, then advance virtual time, until `done` holds.
async fn drive(clock: &VirtualClock, step_ms: u64, mut done: impl FnMut() -> bool) -> bool {
    for _ in 0..400 {
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        if done() {
            return true;
        }
        clock.tick_ms(step_ms).unwrap();
    }
    false
}

fn all_terminal(store: &MemoryDatastore) -> bool {
    store.snapshot().iter().all(|j| j.status.is_terminal())
}

// --- scenarios ---------------------------------------------------------------

#[tokio::test]
async fn every_job_reaches_one_terminal_state() {
    let memory = MemoryDatastore::new();
    let store = Recording::new(memory.clone());
    let clock = VirtualClock::new();
    let table = ShardTable::new(16, 10);
    let calls: Calls = Arc::default();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler = Scheduler::new(
        store.clone(),
        Arc::new(clock.clone()),
        Duration::milliseconds(100),
        None,
    );
    let processor = Processor::new(
        store.clone(),
        Arc::new(clock.clone()),
        stub("solo", &calls),
        settings(),
        None,
    );
    let scheduler = tokio::spawn(scheduler.run(shutdown_rx.clone()));
    let processor = tokio::spawn(processor.run(shutdown_rx));

    let mut failing = Vec::new();
    for i in 0..20 {
        let url = if i % 4 == 0 {
            "https://target.test/fail".to_string()
        } else {
            format!("https://target.test/ok/{i}")
        };
        let job = Job::register(JobDefinition::new(url, clock.now()), &table, clock.now());
        if i % 4 == 0 {
            failing.push(job.id.clone());
        }
        store.schedule(job).await.unwrap();
    }

    assert!(
        drive(&clock, 500, || all_terminal(&memory)).await,
        "jobs still pending: {:?}",
        memory
            .snapshot()
            .iter()
            .filter(|j| !j.status.is_terminal())
            .map(|j| (j.id.to_string(), j.status))
            .collect::<Vec<_>>()
    );

    shutdown_tx.send(true).unwrap();
    scheduler.await.unwrap();
    processor.await.unwrap();

    let jobs = memory.snapshot();
    assert_eq!(jobs.len(), 20);
    let terminal = store.terminal_counts();
    let calls = calls.lock().unwrap();
    for job in &jobs {
        assert_eq!(terminal.get(&job.id), Some(&1), "job {}", job.id);
        if failing.contains(&job.id) {
            assert_eq!(job.status, JobStatus::Dead);
            assert_eq!(job.attempts, 3);
            assert_eq!(calls[&job.id].len(), 3);
        } else {
            assert_eq!(job.status, JobStatus::Completed);
            assert_eq!(calls[&job.id].len(), 1);
        }
    }
}

#[tokio::test]
async fn throttled_job_runs_again_after_reset() {
    let memory = MemoryDatastore::new();
    let store: Arc<dyn Datastore> = Arc::new(memory.clone());
    let clock = VirtualClock::new();
    let calls: Calls = Arc::default();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler = tokio::spawn(
        Scheduler::new(
            store.clone(),
            Arc::new(clock.clone()),
            Duration::seconds(1),
            None,
        )
        .run(shutdown_rx.clone()),
    );
    let processor = tokio::spawn(
        Processor::new(
            store.clone(),
            Arc::new(clock.clone()),
            stub("solo", &calls),
            settings(),
            None,
        )
        .run(shutdown_rx),
    );

    let job = Job::with_id(
        JobId::from("throttled"),
        JobDefinition::new("https://slow.test/limited", clock.now()),
        Vec::new(),
        clock.now(),
    );
    let id = store.schedule(job).await.unwrap();

    // the 429 records a 10 s limit while the job keeps its claim
    let mut went_back = false;
    assert!(
        drive(&clock, 1_000, || {
            went_back |= memory.snapshot().iter().any(|j| {
                j.status == JobStatus::RateLimited || (j.status == JobStatus::Queued && j.attempts > 0)
            });
            memory.rate_limit("slow.test").is_some()
        })
        .await
    );
    let throttled_at = clock.now();
    let limit = memory.rate_limit("slow.test").unwrap();
    assert!(!limit.satisfied);
    assert_eq!(
        memory.get_job(&id).await.unwrap().unwrap().status,
        JobStatus::Running
    );

    assert!(
        drive(&clock, 1_000, || {
            let jobs = memory.snapshot();
            went_back |= jobs.iter().any(|j| {
                j.status == JobStatus::RateLimited || (j.status == JobStatus::Queued && j.attempts > 0)
            });
            jobs.iter().all(|j| j.status.is_terminal())
                && memory.rate_limit("slow.test").is_some_and(|l| l.satisfied)
        })
        .await
    );
    assert!(!went_back);
    assert!(clock.now() - throttled_at >= Duration::seconds(9));

    shutdown_tx.send(true).unwrap();
    scheduler.await.unwrap();
    processor.await.unwrap();

    let done = memory.get_job(&id).await.unwrap().unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.attempts, 2);
    assert_eq!(calls.lock().unwrap()[&id].len(), 2);
}

#[tokio::test]
async fn storage_errors_do_not_strand_jobs() {
    let memory = MemoryDatastore::new();
    let store = Recording::new(memory.clone());
    let clock = VirtualClock::new();
    let calls: Calls = Arc::default();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler = tokio::spawn(
        Scheduler::new(
            store.clone(),
            Arc::new(clock.clone()),
            Duration::seconds(1),
            None,
        )
        .run(shutdown_rx.clone()),
    );
    let processor = tokio::spawn(
        Processor::new(
            store.clone(),
            Arc::new(clock.clone()),
            stub("solo", &calls),
            settings(),
            None,
        )
        .run(shutdown_rx),
    );

    memory.fail_next("mark_job_as_running", 2);
    memory.fail_next("mark_job_as_complete", 2);
    for i in 0..5 {
        store
            .schedule(Job::with_id(
                JobId::from(format!("flaky-{i}")),
                JobDefinition::new(format!("https://target.test/{i}"), clock.now()),
                Vec::new(),
                clock.now(),
            ))
            .await
            .unwrap();
    }

    assert!(drive(&clock, 500, || all_terminal(&memory)).await);
    shutdown_tx.send(true).unwrap();
    scheduler.await.unwrap();
    processor.await.unwrap();

    let calls = calls.lock().unwrap();
    for job in memory.snapshot() {
        assert_eq!(job.status, JobStatus::Completed, "job {}", job.id);
        assert_eq!(job.attempts, 1);
        assert_eq!(calls[&job.id].len(), 1);
    }
    assert!(store.terminal_counts().values().all(|&n| n == 1));
}

#[tokio::test]
async fn long_outage_is_recovered_by_the_sweep() {
    let memory = MemoryDatastore::new();
    let store = Recording::new(memory.clone());
    let clock = VirtualClock::new();
    let calls: Calls = Arc::default();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler = tokio::spawn(
        Scheduler::new(
            store.clone(),
            Arc::new(clock.clone()),
            Duration::seconds(1),
            None,
        )
        .run(shutdown_rx.clone()),
    );
    let processor = tokio::spawn(
        Processor::new(
            store.clone(),
            Arc::new(clock.clone()),
            stub("solo", &calls),
            settings(),
            None,
        )
        .run(shutdown_rx),
    );

    // more failures than one task retries
    memory.fail_next("mark_job_as_complete", 6);
    let id = store
        .schedule(Job::with_id(
            JobId::from("outage"),
            JobDefinition::new("https://target.test/ok", clock.now()),
            Vec::new(),
            clock.now(),
        ))
        .await
        .unwrap();

    assert!(drive(&clock, 1_000, || all_terminal(&memory)).await);
    shutdown_tx.send(true).unwrap();
    scheduler.await.unwrap();
    processor.await.unwrap();

    let done = memory.get_job(&id).await.unwrap().unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.attempts, 2);
    assert_eq!(calls.lock().unwrap()[&id].len(), 2);
    assert_eq!(store.terminal_counts().get(&id), Some(&1));
}

#[tokio::test]
async fn two_workers_split_the_queue() {
    let memory = MemoryDatastore::new();
    let store = Recording::new(memory.clone());
    let clock = VirtualClock::new();
    let table = ShardTable::new(16, 10);
    let calls: Calls = Arc::default();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut handles = vec![tokio::spawn(
        Scheduler::new(
            store.clone(),
            Arc::new(clock.clone()),
            Duration::milliseconds(100),
            None,
        )
        .run(shutdown_rx.clone()),
    )];
    for (index, name) in [(0, "w0"), (1, "w1")] {
        let processor = Processor::new(
            store.clone(),
            Arc::new(clock.clone()),
            stub(name, &calls),
            settings(),
            table.filter_for(index, 2),
        );
        handles.push(tokio::spawn(processor.run(shutdown_rx.clone())));
    }

    for i in 0..40 {
        let def = JobDefinition::new(format!("https://target.test/{i}"), clock.now());
        store
            .schedule(Job::register(def, &table, clock.now()))
            .await
            .unwrap();
    }

    assert!(drive(&clock, 200, || all_terminal(&memory)).await);
    shutdown_tx.send(true).unwrap();
    for handle in handles {
        handle.await.unwrap();
    }

    let calls = calls.lock().unwrap();
    assert_eq!(calls.len(), 40);
    assert!(calls.values().all(|workers| workers.len() == 1));
    let by_w0 = calls.values().filter(|w| w[0] == "w0").count();
    assert!(by_w0 > 0 && by_w0 < 40, "w0 ran {by_w0} of 40");
    assert!(store.terminal_counts().values().all(|&n| n == 1));
}

#[tokio::test]
async fn cancelled_jobs_never_run() {
    let memory = MemoryDatastore::new();
    let store: Arc<dyn Datastore> = Arc::new(memory.clone());
    let clock = VirtualClock::new();
    let calls: Calls = Arc::default();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler = tokio::spawn(
        Scheduler::new(
            store.clone(),
            Arc::new(clock.clone()),
            Duration::seconds(1),
            None,
        )
        .run(shutdown_rx.clone()),
    );
    let processor = tokio::spawn(
        Processor::new(
            store.clone(),
            Arc::new(clock.clone()),
            stub("solo", &calls),
            settings(),
            None,
        )
        .run(shutdown_rx),
    );

    let later = clock.now() + Duration::minutes(5);
    let keep = store
        .schedule(Job::with_id(
            JobId::from("keep"),
            JobDefinition::new("https://t.test/a", later),
            Vec::new(),
            clock.now(),
        ))
        .await
        .unwrap();
    let drop_me = store
        .schedule(Job::with_id(
            JobId::from("drop"),
            JobDefinition::new("https://t.test/b", later),
            Vec::new(),
            clock.now(),
        ))
        .await
        .unwrap();
    assert!(store.cancel(&drop_me).await.unwrap());

    clock.tick_minutes(5).unwrap();
    assert!(drive(&clock, 1_000, || all_terminal(&memory)).await);
    shutdown_tx.send(true).unwrap();
    scheduler.await.unwrap();
    processor.await.unwrap();

    assert_eq!(
        memory.get_job(&keep).await.unwrap().unwrap().status,
        JobStatus::Completed
    );
    assert_eq!(
        memory.get_job(&drop_me).await.unwrap().unwrap().status,
        JobStatus::Cancelled
    );
    assert!(!calls.lock().unwrap().contains_key(&drop_me));
}
