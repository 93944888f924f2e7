//! Job state machine shared by every datastore adapter.
//!
//! Each `Job` method applies one transition in place and reports whether the
//! record changed. Repeating a transition that already happened is a no-op
//! (`false`), which is what makes redelivery safe. Every change bumps
//! `revision`.

use chrono::{DateTime, Utc};
use tock_shard::Shard;

use crate::error::{Result, SchedulerError};
use crate::types::{truncate_body, ExecutionResult, Job, JobStatus, RateLimit, RunningStatus};

/// Whether `from -> to` is an edge of the lifecycle.
pub fn can_transition(from: JobStatus, to: JobStatus) -> bool {
    use JobStatus::*;
    matches!(
        (from, to),
        (Registered, Queued)
            | (Registered, Cancelled)
            | (Queued, Running)
            | (Queued, RateLimited)
            | (Queued, Cancelled)
            | (RateLimited, Queued)
            | (RateLimited, Cancelled)
            | (Running, Completed)
            | (Running, Failed)
            | (Failed, Dead)
    )
}

impl Job {
    fn set_status(&mut self, status: JobStatus) {
        self.status = status;
        self.revision += 1;
    }

    /// `registered -> queued`.
    pub fn queue(&mut self) -> bool {
        if self.status != JobStatus::Registered {
            return false;
        }
        self.set_status(JobStatus::Queued);
        true
    }

    /// Withdraw a job that has not started. Benign on anything else.
    pub fn cancel(&mut self) -> bool {
        if !can_transition(self.status, JobStatus::Cancelled) {
            return false;
        }
        self.rate_limit_keys.clear();
        self.set_status(JobStatus::Cancelled);
        true
    }

    /// Record the start of an attempt.
    ///
    /// Attempt 1 claims a `queued` job, so two processors racing on the same
    /// delivery see exactly one `true`. Attempt `n > 1` claims a `running`
    /// job whose last recorded attempt is `n - 1`, so a resumed job also has
    /// a single owner per attempt.
    pub fn start_attempt(&mut self, running: RunningStatus) -> bool {
        let claimable = match running.attempt {
            0 | 1 => self.status == JobStatus::Queued,
            n => self.status == JobStatus::Running && self.attempts + 1 == n,
        };
        if !claimable {
            return false;
        }
        self.attempts += 1;
        self.last_run_at = Some(running.started_at);
        if self.status == JobStatus::Running {
            self.revision += 1;
        } else {
            self.set_status(JobStatus::Running);
        }
        true
    }

    /// Store the outcome of the last attempt. `status` must be `completed`
    /// or `failed`; only a `running` job changes.
    pub fn complete(&mut self, mut result: ExecutionResult, status: JobStatus) -> Result<bool> {
        if !matches!(status, JobStatus::Completed | JobStatus::Failed) {
            return Err(SchedulerError::InvalidTransition {
                id: self.id.to_string(),
                from: self.status,
                to: status,
            });
        }
        if self.status != JobStatus::Running {
            return Ok(false);
        }
        result.body = result.body.map(truncate_body);
        self.completed_at = Some(result.finished_at);
        self.result = Some(result);
        self.set_status(status);
        Ok(true)
    }

    /// `failed -> dead`. Repeating it is a no-op; calling it on a job that
    /// never failed is an error.
    pub fn bury(&mut self) -> Result<bool> {
        match self.status {
            JobStatus::Failed => {
                self.set_status(JobStatus::Dead);
                Ok(true)
            }
            JobStatus::Dead => Ok(false),
            other => Err(SchedulerError::InvalidTransition {
                id: self.id.to_string(),
                from: other,
                to: JobStatus::Dead,
            }),
        }
    }

    /// Whether a job has sat in a non-terminal working state since before
    /// `stale_before`. Failed jobs only wait for `mark_as_dead`.
    pub fn is_stalled(&self, stale_before: DateTime<Utc>) -> bool {
        match self.status {
            JobStatus::Queued => self.definition.scheduled_at <= stale_before,
            JobStatus::Running => self.last_run_at.is_some_and(|t| t <= stale_before),
            JobStatus::Failed => true,
            _ => false,
        }
    }

    /// Park a `queued` job until every key in `keys` is satisfied. A job
    /// that has started is never parked.
    pub fn defer(&mut self, keys: impl IntoIterator<Item = String>) -> bool {
        if !can_transition(self.status, JobStatus::RateLimited) {
            return false;
        }
        self.rate_limit_keys = keys.into_iter().collect();
        self.rate_limit_keys.sort();
        self.rate_limit_keys.dedup();
        self.set_status(JobStatus::RateLimited);
        true
    }

    /// Lift `key`. The job goes back to `queued` once no key holds it.
    pub fn release(&mut self, key: &str) -> bool {
        if self.status != JobStatus::RateLimited {
            return false;
        }
        let before = self.rate_limit_keys.len();
        self.rate_limit_keys.retain(|k| k != key);
        if self.rate_limit_keys.len() == before {
            return false;
        }
        if self.rate_limit_keys.is_empty() {
            self.set_status(JobStatus::Queued);
        } else {
            self.revision += 1;
        }
        true
    }
}

impl RateLimit {
    /// Fold a new block under the same key into the stored record.
    ///
    /// A still-blocked limit keeps the later `reset_at` and widens its shard
    /// set; a satisfied one is replaced. Either way `revision` moves forward.
    pub fn merge(stored: Option<&RateLimit>, incoming: &RateLimit, job_shards: &[Shard]) -> RateLimit {
        let mut shards: Vec<Shard> = incoming.shards.clone();
        shards.extend_from_slice(job_shards);
        let (reset_at, revision) = match stored {
            Some(s) if !s.satisfied => {
                shards.extend_from_slice(&s.shards);
                (s.reset_at.max(incoming.reset_at), s.revision + 1)
            }
            Some(s) => (incoming.reset_at, s.revision + 1),
            None => (incoming.reset_at, 1),
        };
        shards.sort();
        shards.dedup();
        RateLimit {
            key: incoming.key.clone(),
            satisfied: false,
            reset_at,
            shards,
            revision,
        }
    }

    /// Mark satisfied if `observed` is the current revision. A stale or
    /// already-satisfied limit is left alone.
    pub fn satisfy(&mut self, observed: &RateLimit) -> bool {
        if self.satisfied || self.revision != observed.revision {
            return false;
        }
        self.satisfied = true;
        self.revision += 1;
        true
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.satisfied && self.reset_at <= now
    }
}
