use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tock_shard::{filter_matches, Shard, ShardFilter};
use tracing::{info, instrument, warn};

use crate::datastore::{Datastore, Subscription};
use crate::db::{format_ts, init_db, parse_ts};
use crate::error::{Result, SchedulerError};
use crate::feed::{spawn_feed, FeedItem};
use crate::types::{ExecutionResult, Job, JobId, JobStatus, RateLimit, RunningStatus};

/// How often subscriptions re-query when no local write woke them.
///
/// Several workers may share one database file; their writes are only seen
/// by polling.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

const JOB_COLUMNS: &str = "id, definition, status, shards, registered_at, attempts, revision,
     rate_limit_keys, last_run_at, completed_at, result";

/// Datastore backed by a single SQLite connection.
#[derive(Clone)]
pub struct SqliteDatastore {
    inner: Arc<Inner>,
}

struct Inner {
    conn: Mutex<Connection>,
    changes: watch::Sender<u64>,
    shutdown: CancellationToken,
    closed: AtomicBool,
    poll: Option<Duration>,
}

impl SqliteDatastore {
    /// Open (or create) the database at `path`.
    pub fn open(path: &str) -> Result<Self> {
        Self::new(Connection::open(path)?, Some(DEFAULT_POLL_INTERVAL))
    }

    /// Wrap `conn`, creating the schema if needed. `poll = None` relies on
    /// local writes alone to wake subscriptions.
    pub fn new(conn: Connection, poll: Option<Duration>) -> Result<Self> {
        init_db(&conn)?;
        let (changes, _) = watch::channel(0);
        Ok(Self {
            inner: Arc::new(Inner {
                conn: Mutex::new(conn),
                changes,
                shutdown: CancellationToken::new(),
                closed: AtomicBool::new(false),
                poll,
            }),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(SchedulerError::Closed);
        }
        Ok(())
    }

    fn notify(&self) {
        self.inner.changes.send_modify(|v| *v += 1);
    }

    /// Load one job, apply `f`, and write it back if `f` changed it.
    ///
    /// The write is guarded by the revision that was read, so a concurrent
    /// writer on the same file wins and this call reports no change.
    fn update_job(&self, id: &JobId, f: impl FnOnce(&mut Job) -> Result<bool>) -> Result<bool> {
        self.ensure_open()?;
        let changed = {
            let mut conn = self.inner.conn.lock().unwrap();
            let tx = conn.transaction()?;
            let mut job = load_job(&tx, id)?
                .ok_or_else(|| SchedulerError::JobNotFound { id: id.to_string() })?;
            let read_revision = job.revision;
            if !f(&mut job)? {
                return Ok(false);
            }
            let stored = store_job(&tx, &job, read_revision)?;
            tx.commit()?;
            stored
        };
        if changed {
            self.notify();
        }
        Ok(changed)
    }

    fn feed<T, F>(&self, query: F) -> Result<Subscription<T>>
    where
        T: FeedItem + Send + 'static,
        F: Fn(&Connection) -> Result<Vec<T>> + Send + 'static,
    {
        self.ensure_open()?;
        let inner = self.inner.clone();
        Ok(spawn_feed(
            self.inner.changes.subscribe(),
            self.inner.shutdown.child_token(),
            self.inner.poll,
            move || {
                if inner.closed.load(Ordering::SeqCst) {
                    return Err(SchedulerError::Closed);
                }
                let conn = inner.conn.lock().unwrap();
                query(&conn)
            },
        ))
    }
}

// --- row mapping -----------------------------------------------------------

struct JobRow {
    id: String,
    definition: String,
    status: String,
    shards: String,
    registered_at: String,
    attempts: u32,
    revision: i64,
    rate_limit_keys: String,
    last_run_at: Option<String>,
    completed_at: Option<String>,
    result: Option<String>,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            definition: row.get(1)?,
            status: row.get(2)?,
            shards: row.get(3)?,
            registered_at: row.get(4)?,
            attempts: row.get(5)?,
            revision: row.get(6)?,
            rate_limit_keys: row.get(7)?,
            last_run_at: row.get(8)?,
            completed_at: row.get(9)?,
            result: row.get(10)?,
        })
    }

    fn decode(self) -> Result<Job> {
        let id = self.id;
        let bad = |reason: String| SchedulerError::Decode {
            id: id.clone(),
            reason,
        };
        let ts = |s: &str| parse_ts(s).map_err(|e| bad(format!("timestamp {s:?}: {e}")));
        let opt_ts = |s: Option<String>| s.as_deref().map(ts).transpose();

        Ok(Job {
            definition: serde_json::from_str(&self.definition)
                .map_err(|e| bad(format!("definition: {e}")))?,
            status: self.status.parse::<JobStatus>().map_err(bad)?,
            shards: serde_json::from_str(&self.shards).map_err(|e| bad(format!("shards: {e}")))?,
            registered_at: ts(&self.registered_at)?,
            attempts: self.attempts,
            rate_limit_keys: serde_json::from_str(&self.rate_limit_keys)
                .map_err(|e| bad(format!("rate_limit_keys: {e}")))?,
            last_run_at: opt_ts(self.last_run_at)?,
            completed_at: opt_ts(self.completed_at)?,
            result: self
                .result
                .map(|r| serde_json::from_str::<ExecutionResult>(&r))
                .transpose()
                .map_err(|e| bad(format!("result: {e}")))?,
            revision: self.revision.max(0) as u64,
            id: JobId::from(id),
        })
    }
}

fn load_job(conn: &Connection, id: &JobId) -> Result<Option<Job>> {
    let row = conn
        .prepare_cached(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"))?
        .query_row([id.as_str()], JobRow::from_row)
        .optional()?;
    row.map(JobRow::decode).transpose()
}

/// Write the mutable columns of `job`; `false` if the row moved past
/// `read_revision` in the meantime.
fn store_job(conn: &Connection, job: &Job, read_revision: u64) -> Result<bool> {
    let result = job.result.as_ref().map(serde_json::to_string).transpose()?;
    let n = conn.execute(
        "UPDATE jobs SET status = ?1, attempts = ?2, revision = ?3, rate_limit_keys = ?4,
                last_run_at = ?5, completed_at = ?6, result = ?7
         WHERE id = ?8 AND revision = ?9",
        params![
            job.status.as_str(),
            job.attempts,
            job.revision as i64,
            serde_json::to_string(&job.rate_limit_keys)?,
            job.last_run_at.map(format_ts),
            job.completed_at.map(format_ts),
            result,
            job.id.as_str(),
            read_revision as i64,
        ],
    )?;
    Ok(n == 1)
}

enum OrderBy {
    RegisteredAt,
    ScheduledAt,
}

/// Jobs in `status`, optionally due by `before`, visible through `filter`.
///
/// The shard filter becomes a single `IN (...)` over `job_shards`, bounded by
/// the caller's assignment size. Rows that fail to decode are logged and left
/// out.
fn select_jobs(
    conn: &Connection,
    status: JobStatus,
    before: Option<DateTime<Utc>>,
    filter: &ShardFilter,
    order: OrderBy,
) -> Result<Vec<Job>> {
    let mut sql = format!("SELECT {JOB_COLUMNS} FROM jobs j WHERE j.status = ?");
    let mut args = vec![status.as_str().to_string()];

    if let Some(before) = before {
        sql.push_str(" AND j.scheduled_at <= ?");
        args.push(format_ts(before));
    }
    if let Some(shards) = filter {
        if shards.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; shards.len()].join(", ");
        sql.push_str(&format!(
            " AND EXISTS (SELECT 1 FROM job_shards s WHERE s.job_id = j.id AND s.shard IN ({placeholders}))"
        ));
        args.extend(shards.iter().map(Shard::format));
    }
    sql.push_str(match order {
        OrderBy::RegisteredAt => " ORDER BY j.registered_at, j.id",
        OrderBy::ScheduledAt => " ORDER BY j.scheduled_at, j.id",
    });

    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt.query_map(params_from_iter(args.iter()), JobRow::from_row)?;
    let mut jobs = Vec::new();
    for row in rows {
        match row?.decode() {
            Ok(job) => jobs.push(job),
            Err(e) => warn!(error = %e, "skipping malformed job"),
        }
    }
    Ok(jobs)
}

fn load_rate_limit(conn: &Connection, key: &str) -> Result<Option<RateLimit>> {
    let row = conn
        .prepare_cached(
            "SELECT key, satisfied, reset_at, shards, revision FROM rate_limits WHERE key = ?1",
        )?
        .query_row([key], rate_limit_row)
        .optional()?;
    row.map(decode_rate_limit).transpose()
}

fn all_rate_limits(conn: &Connection) -> Result<Vec<RateLimit>> {
    let mut stmt = conn.prepare_cached(
        "SELECT key, satisfied, reset_at, shards, revision FROM rate_limits ORDER BY key",
    )?;
    let rows = stmt.query_map([], rate_limit_row)?;
    let mut limits = Vec::new();
    for row in rows {
        match decode_rate_limit(row?) {
            Ok(limit) => limits.push(limit),
            Err(e) => warn!(error = %e, "skipping malformed rate limit"),
        }
    }
    Ok(limits)
}

type RateLimitRow = (String, bool, String, String, i64);

fn rate_limit_row(row: &Row<'_>) -> rusqlite::Result<RateLimitRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn decode_rate_limit((key, satisfied, reset_at, shards, revision): RateLimitRow) -> Result<RateLimit> {
    let bad = |reason: String| SchedulerError::Decode {
        id: key.clone(),
        reason,
    };
    Ok(RateLimit {
        reset_at: parse_ts(&reset_at).map_err(|e| bad(format!("reset_at: {e}")))?,
        shards: serde_json::from_str(&shards).map_err(|e| bad(format!("shards: {e}")))?,
        satisfied,
        revision: revision.max(0) as u64,
        key,
    })
}

fn store_rate_limit(conn: &Connection, limit: &RateLimit) -> Result<()> {
    conn.execute(
        "INSERT INTO rate_limits (key, satisfied, reset_at, shards, revision)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT (key) DO UPDATE SET
             satisfied = excluded.satisfied,
             reset_at  = excluded.reset_at,
             shards    = excluded.shards,
             revision  = excluded.revision",
        params![
            limit.key,
            limit.satisfied,
            format_ts(limit.reset_at),
            serde_json::to_string(&limit.shards)?,
            limit.revision as i64,
        ],
    )?;
    Ok(())
}

#[async_trait]
impl Datastore for SqliteDatastore {
    #[instrument(skip(self, job), fields(job_id = %job.id))]
    async fn schedule(&self, job: Job) -> Result<JobId> {
        self.ensure_open()?;
        {
            let mut conn = self.inner.conn.lock().unwrap();
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO jobs
                 (id, definition, status, shards, scheduled_at, registered_at,
                  attempts, revision, rate_limit_keys)
                 VALUES (?1, ?2, 'registered', ?3, ?4, ?5, 0, 0, '[]')",
                params![
                    job.id.as_str(),
                    serde_json::to_string(&job.definition)?,
                    serde_json::to_string(&job.shards)?,
                    format_ts(job.definition.scheduled_at),
                    format_ts(job.registered_at),
                ],
            )?;
            for shard in &job.shards {
                tx.execute(
                    "INSERT OR IGNORE INTO job_shards (job_id, shard) VALUES (?1, ?2)",
                    params![job.id.as_str(), shard.format()],
                )?;
            }
            tx.commit()?;
        }
        self.notify();
        info!("job registered");
        Ok(job.id)
    }

    #[instrument(skip(self))]
    async fn get_job(&self, id: &JobId) -> Result<Option<Job>> {
        self.ensure_open()?;
        let conn = self.inner.conn.lock().unwrap();
        load_job(&conn, id)
    }

    #[instrument(skip(self))]
    async fn cancel(&self, id: &JobId) -> Result<bool> {
        let cancelled = self.update_job(id, |job| Ok(job.cancel()))?;
        if cancelled {
            info!("job cancelled");
        }
        Ok(cancelled)
    }

    #[instrument(skip(self, ids), fields(count = ids.len()))]
    async fn queue_jobs(&self, ids: &[JobId]) -> Result<usize> {
        self.ensure_open()?;
        let moved = {
            let mut conn = self.inner.conn.lock().unwrap();
            let tx = conn.transaction()?;
            let mut moved = 0;
            {
                let mut stmt = tx.prepare_cached(
                    "UPDATE jobs SET status = 'queued', revision = revision + 1
                     WHERE id = ?1 AND status IN ('registered')",
                )?;
                for id in ids {
                    moved += stmt.execute([id.as_str()])?;
                }
            }
            tx.commit()?;
            moved
        };
        if moved > 0 {
            self.notify();
        }
        Ok(moved)
    }

    #[instrument(skip(self))]
    async fn wait_for_registered_jobs_by_registered_at(
        &self,
        filter: &ShardFilter,
    ) -> Result<Subscription<Job>> {
        let filter = filter.clone();
        self.feed(move |conn| {
            select_jobs(conn, JobStatus::Registered, None, &filter, OrderBy::RegisteredAt)
        })
    }

    #[instrument(skip(self))]
    async fn get_registered_jobs_by_scheduled_at(
        &self,
        before: DateTime<Utc>,
        filter: &ShardFilter,
    ) -> Result<Vec<Job>> {
        self.ensure_open()?;
        let conn = self.inner.conn.lock().unwrap();
        select_jobs(
            &conn,
            JobStatus::Registered,
            Some(before),
            filter,
            OrderBy::ScheduledAt,
        )
    }

    #[instrument(skip(self))]
    async fn wait_for_next_jobs_in_queue(&self, filter: &ShardFilter) -> Result<Subscription<Job>> {
        let filter = filter.clone();
        self.feed(move |conn| {
            select_jobs(conn, JobStatus::Queued, None, &filter, OrderBy::ScheduledAt)
        })
    }

    #[instrument(skip(self, job, limits), fields(job_id = %job.id))]
    async fn mark_rate_limited(&self, job: &Job, limits: &[RateLimit]) -> Result<bool> {
        self.ensure_open()?;
        let deferred = {
            let mut conn = self.inner.conn.lock().unwrap();
            let tx = conn.transaction()?;
            let mut stored = load_job(&tx, &job.id)?
                .ok_or_else(|| SchedulerError::JobNotFound { id: job.id.to_string() })?;
            let read_revision = stored.revision;
            if !stored.defer(limits.iter().map(|l| l.key.clone())) {
                return Ok(false);
            }
            if !store_job(&tx, &stored, read_revision)? {
                return Ok(false);
            }
            for limit in limits {
                let current = load_rate_limit(&tx, &limit.key)?;
                let merged = RateLimit::merge(current.as_ref(), limit, &stored.shards);
                store_rate_limit(&tx, &merged)?;
            }
            tx.commit()?;
            true
        };
        self.notify();
        Ok(deferred)
    }

    #[instrument(skip(self, limit), fields(key = %limit.key))]
    async fn mark_rate_limit_satisfied(&self, limit: &RateLimit) -> Result<usize> {
        self.ensure_open()?;
        let released = {
            let mut conn = self.inner.conn.lock().unwrap();
            let tx = conn.transaction()?;
            let Some(mut stored) = load_rate_limit(&tx, &limit.key)? else {
                return Ok(0);
            };
            if !stored.satisfy(limit) {
                return Ok(0);
            }
            store_rate_limit(&tx, &stored)?;

            let mut released = 0;
            let held = select_jobs(&tx, JobStatus::RateLimited, None, &None, OrderBy::ScheduledAt)?;
            for mut job in held {
                let read_revision = job.revision;
                if job.release(&limit.key) && store_job(&tx, &job, read_revision)? {
                    released += 1;
                }
            }
            tx.commit()?;
            released
        };
        self.notify();
        Ok(released)
    }

    #[instrument(skip(self, limit), fields(key = %limit.key))]
    async fn record_rate_limit(&self, limit: &RateLimit) -> Result<RateLimit> {
        self.ensure_open()?;
        let merged = {
            let mut conn = self.inner.conn.lock().unwrap();
            let tx = conn.transaction()?;
            let current = load_rate_limit(&tx, &limit.key)?;
            let merged = RateLimit::merge(current.as_ref(), limit, &[]);
            store_rate_limit(&tx, &merged)?;
            tx.commit()?;
            merged
        };
        self.notify();
        Ok(merged)
    }

    #[instrument(skip(self))]
    async fn listen_to_rate_limits(&self, filter: &ShardFilter) -> Result<Subscription<RateLimit>> {
        let filter = filter.clone();
        self.feed(move |conn| {
            Ok(all_rate_limits(conn)?
                .into_iter()
                .filter(|l| filter_matches(&filter, &l.shards))
                .collect())
        })
    }

    #[instrument(skip(self))]
    async fn mark_job_as_running(&self, id: &JobId, status: RunningStatus) -> Result<bool> {
        self.update_job(id, |job| Ok(job.start_attempt(status)))
    }

    #[instrument(skip(self, result))]
    async fn mark_job_as_complete(
        &self,
        id: &JobId,
        result: ExecutionResult,
        status: JobStatus,
    ) -> Result<bool> {
        self.update_job(id, |job| job.complete(result, status))
    }

    #[instrument(skip(self))]
    async fn mark_as_dead(&self, id: &JobId) -> Result<bool> {
        self.update_job(id, |job| job.bury())
    }

    #[instrument(skip(self))]
    async fn get_stalled_jobs(
        &self,
        stale_before: DateTime<Utc>,
        filter: &ShardFilter,
    ) -> Result<Vec<Job>> {
        self.ensure_open()?;
        let conn = self.inner.conn.lock().unwrap();
        let mut jobs = Vec::new();
        for status in [JobStatus::Queued, JobStatus::Running, JobStatus::Failed] {
            jobs.extend(
                select_jobs(&conn, status, None, filter, OrderBy::ScheduledAt)?
                    .into_iter()
                    .filter(|j| j.is_stalled(stale_before)),
            );
        }
        jobs.sort_by(|a, b| {
            a.definition
                .scheduled_at
                .cmp(&b.definition.scheduled_at)
                .then(a.id.cmp(&b.id))
        });
        Ok(jobs)
    }

    async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.shutdown.cancel();
        info!("sqlite datastore closed");
    }
}
