use std::collections::HashMap;
use std::sync::Arc;

use chrono::Duration;
use tokio::sync::{mpsc, watch};
use tock_clock::{Clock, TimerHandle};
use tock_shard::ShardFilter;
use tracing::{debug, error, info, warn};

use crate::datastore::Datastore;
use crate::error::SchedulerError;
use crate::types::{Job, JobId};

/// Promotes due jobs from `registered` to `queued`.
///
/// Two paths feed `queue_jobs`: a timer per registered job armed at its
/// `scheduled_at`, and a periodic sweep that catches anything the timers
/// missed (jobs registered by another process, restarts). Both may hit the
/// same job; promotion is idempotent.
pub struct Scheduler {
    store: Arc<dyn Datastore>,
    clock: Arc<dyn Clock>,
    period: Duration,
    filter: ShardFilter,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn Datastore>,
        clock: Arc<dyn Clock>,
        period: Duration,
        filter: ShardFilter,
    ) -> Self {
        Self {
            store,
            clock,
            period,
            filter,
        }
    }

    /// Main loop. Runs until `shutdown` broadcasts `true` or the registered
    /// feed ends.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut registered = match self
            .store
            .wait_for_registered_jobs_by_registered_at(&self.filter)
            .await
        {
            Ok(sub) => sub,
            Err(e) => {
                error!("scheduler could not subscribe to registered jobs: {e}");
                return;
            }
        };

        // bounded(1): sweeps that pile up while one is running collapse into one
        let (sweep_tx, mut sweep_rx) = mpsc::channel::<()>(1);
        let interval = self.clock.set_interval(
            Box::new(move || {
                let _ = sweep_tx.try_send(());
            }),
            self.period,
        );
        let (due_tx, mut due_rx) = mpsc::unbounded_channel::<JobId>();
        let mut timers: HashMap<JobId, TimerHandle> = HashMap::new();

        info!(period_ms = self.period.num_milliseconds(), "scheduler started");
        self.sweep().await;

        loop {
            tokio::select! {
                batch = registered.recv() => {
                    let Some(jobs) = batch else {
                        warn!("registered-jobs feed ended");
                        break;
                    };
                    for job in jobs {
                        self.arm(&job, &due_tx, &mut timers);
                    }
                }
                Some(id) = due_rx.recv() => {
                    let mut ids = vec![id];
                    while let Ok(more) = due_rx.try_recv() {
                        ids.push(more);
                    }
                    for id in &ids {
                        timers.remove(id);
                    }
                    self.promote(&ids).await;
                }
                Some(()) = sweep_rx.recv() => self.sweep().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("scheduler shutting down");
                        break;
                    }
                }
            }
        }

        self.clock.clear_interval(interval);
        for handle in timers.into_values() {
            self.clock.clear_timeout(handle);
        }
        registered.cancel();
    }

    /// Fire `job.id` into `due` at its scheduled time. Already-due jobs fire
    /// immediately.
    fn arm(
        &self,
        job: &Job,
        due: &mpsc::UnboundedSender<JobId>,
        timers: &mut HashMap<JobId, TimerHandle>,
    ) {
        if timers.contains_key(&job.id) {
            return;
        }
        let delay = job.definition.scheduled_at - self.clock.now();
        let tx = due.clone();
        let id = job.id.clone();
        let handle = self.clock.set_timeout(
            Box::new(move || {
                let _ = tx.send(id.clone());
            }),
            delay,
        );
        if delay > Duration::zero() {
            debug!(job_id = %job.id, delay_ms = delay.num_milliseconds(), "timer armed");
            timers.insert(job.id.clone(), handle);
        }
    }

    /// Queue everything already due.
    async fn sweep(&self) {
        let now = self.clock.now();
        match self
            .store
            .get_registered_jobs_by_scheduled_at(now, &self.filter)
            .await
        {
            Ok(jobs) if jobs.is_empty() => {}
            Ok(jobs) => {
                let ids: Vec<JobId> = jobs.into_iter().map(|j| j.id).collect();
                self.promote(&ids).await;
            }
            Err(e) => log_store_error("due-job sweep", &e),
        }
    }

    async fn promote(&self, ids: &[JobId]) {
        match self.store.queue_jobs(ids).await {
            Ok(0) => debug!(count = ids.len(), "jobs already promoted"),
            Ok(n) => info!(count = n, "jobs queued"),
            Err(e) => log_store_error("queue_jobs", &e),
        }
    }
}

/// Transient storage failures are retried next period; anything else is a
/// real error.
pub(crate) fn log_store_error(op: &str, e: &SchedulerError) {
    if e.is_transient() {
        warn!(op, "storage error, will retry: {e}");
    } else {
        error!(op, "datastore call failed: {e}");
    }
}
