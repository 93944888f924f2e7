use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tock_shard::{Shard, ShardTable};
use uuid::Uuid;

/// Bodies stored on a job are cut to this many bytes.
pub const MAX_STORED_BODY_BYTES: usize = 4 * 1024;

/// Unique identifier for a job (UUIDv7, time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub String);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// The HTTP call a job performs. Immutable once registered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDefinition {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    /// Earliest instant the call may be made.
    pub scheduled_at: DateTime<Utc>,
    /// Throttling bucket; defaults to the target host when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit_key: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

impl JobDefinition {
    pub fn new(url: impl Into<String>, scheduled_at: DateTime<Utc>) -> Self {
        Self {
            url: url.into(),
            method: default_method(),
            headers: BTreeMap::new(),
            body: None,
            scheduled_at,
            rate_limit_key: None,
        }
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_rate_limit_key(mut self, key: impl Into<String>) -> Self {
        self.rate_limit_key = Some(key.into());
        self
    }

    /// Key the job is throttled under: the explicit key, else the URL host,
    /// else the raw URL.
    pub fn effective_rate_limit_key(&self) -> String {
        if let Some(ref key) = self.rate_limit_key {
            return key.clone();
        }
        reqwest::Url::parse(&self.url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| self.url.clone())
    }
}

/// Lifecycle state of a job.
///
/// ```text
/// registered ─▶ queued ─▶ running ─▶ completed
///     │           │ ▲        │
///     │           ▼ │        └─▶ failed ─▶ dead
///     │       rate_limited
///     └──────────┴──────────▶ cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Persisted, waiting for `scheduled_at`.
    Registered,
    /// Due; waiting for a processor.
    Queued,
    /// Claimed by a processor; the call is in flight or being retried.
    Running,
    /// Deferred until its rate limit is satisfied.
    RateLimited,
    /// Target answered successfully.
    Completed,
    /// Last attempt failed; about to be declared dead.
    Failed,
    /// Retries exhausted.
    Dead,
    /// Withdrawn before it ran.
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Dead | JobStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Registered => "registered",
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::RateLimited => "rate_limited",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Dead => "dead",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "registered" => Ok(JobStatus::Registered),
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "rate_limited" => Ok(JobStatus::RateLimited),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "dead" => Ok(JobStatus::Dead),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Passed to `mark_job_as_running`: which attempt of the current delivery is
/// starting, and when.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningStatus {
    /// 1 for the first attempt of a delivery. Attempt 1 claims a queued job;
    /// later attempts require the job to still be running.
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
}

/// What happened on the wire for one attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// `None` when no response arrived (connect error, timeout).
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    pub finished_at: DateTime<Utc>,
}

impl ExecutionResult {
    /// Result for a call that never produced a response.
    pub fn from_error(error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            status_code: None,
            body: None,
            error: Some(error.into()),
            duration_ms,
            finished_at: Utc::now(),
        }
    }
}

/// Cut `body` to [`MAX_STORED_BODY_BYTES`] on a char boundary.
pub fn truncate_body(mut body: String) -> String {
    if body.len() <= MAX_STORED_BODY_BYTES {
        return body;
    }
    let mut cut = MAX_STORED_BODY_BYTES;
    while !body.is_char_boundary(cut) {
        cut -= 1;
    }
    body.truncate(cut);
    body
}

/// A throttled target. Jobs deferred under `key` return to the queue once it
/// is marked satisfied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimit {
    pub key: String,
    pub satisfied: bool,
    /// When the limit may be lifted.
    pub reset_at: DateTime<Utc>,
    /// Union of the shard tags of every job deferred under this key; used to
    /// scope `listen_to_rate_limits`.
    #[serde(default)]
    pub shards: Vec<Shard>,
    /// Bumped on every change; subscriptions re-deliver on a new revision.
    #[serde(default)]
    pub revision: u64,
}

impl RateLimit {
    pub fn blocked(key: impl Into<String>, reset_at: DateTime<Utc>, shards: Vec<Shard>) -> Self {
        Self {
            key: key.into(),
            satisfied: false,
            reset_at,
            shards,
            revision: 0,
        }
    }
}

/// A persisted job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub definition: JobDefinition,
    pub status: JobStatus,
    /// Partition tags computed at registration; never rewritten.
    pub shards: Vec<Shard>,
    pub registered_at: DateTime<Utc>,
    /// Executions started across all deliveries.
    pub attempts: u32,
    /// Keys that deferred the job while it is `rate_limited`.
    #[serde(default)]
    pub rate_limit_keys: Vec<String>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<ExecutionResult>,
    /// Bumped on every status change.
    pub revision: u64,
}

impl Job {
    /// A new `registered` job tagged through `table`.
    pub fn register(definition: JobDefinition, table: &ShardTable, now: DateTime<Utc>) -> Self {
        let id = JobId::new();
        let shards = table.tags_for(id.as_str());
        Self::with_id(id, definition, shards, now)
    }

    pub fn with_id(
        id: JobId,
        definition: JobDefinition,
        shards: Vec<Shard>,
        registered_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            definition,
            status: JobStatus::Registered,
            shards,
            registered_at,
            attempts: 0,
            rate_limit_keys: Vec::new(),
            last_run_at: None,
            completed_at: None,
            result: None,
            revision: 0,
        }
    }
}
