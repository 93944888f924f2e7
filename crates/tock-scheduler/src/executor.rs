use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, Method, StatusCode};
use tracing::debug;

use crate::error::Result;
use crate::types::{truncate_body, ExecutionResult, Job};

/// How one attempt ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// 2xx response.
    Success(ExecutionResult),
    /// The target is throttling us; retry once the limit resets.
    RateLimited {
        key: String,
        retry_after: Option<Duration>,
        result: ExecutionResult,
    },
    /// Anything else: non-2xx, connect error, timeout, malformed request.
    Failure(ExecutionResult),
}

impl Outcome {
    pub fn result(&self) -> &ExecutionResult {
        match self {
            Outcome::Success(r) | Outcome::Failure(r) => r,
            Outcome::RateLimited { result, .. } => result,
        }
    }
}

/// Performs the call a job describes.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, job: &Job) -> Outcome;
}

/// [`Executor`] that makes real HTTP requests with `reqwest`.
pub struct HttpExecutor {
    client: Client,
    timeout: Duration,
}

impl HttpExecutor {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("tock/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client, timeout })
    }
}

#[async_trait]
impl Executor for HttpExecutor {
    async fn execute(&self, job: &Job) -> Outcome {
        let def = &job.definition;
        let started = Instant::now();
        let elapsed = |started: Instant| started.elapsed().as_millis() as u64;

        let method = match Method::from_bytes(def.method.to_uppercase().as_bytes()) {
            Ok(m) => m,
            Err(_) => {
                return Outcome::Failure(ExecutionResult::from_error(
                    format!("unsupported method: {}", def.method),
                    0,
                ))
            }
        };

        let mut request = self
            .client
            .request(method, &def.url)
            .timeout(self.timeout);
        for (name, value) in &def.headers {
            request = request.header(name, value);
        }
        if let Some(ref body) = def.body {
            request = request.body(body.clone());
        }

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => {
                debug!(job_id = %job.id, error = %e, "request failed");
                return Outcome::Failure(ExecutionResult::from_error(
                    format!("request failed: {e}"),
                    elapsed(started),
                ));
            }
        };

        let status = response.status();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        let body = response.text().await.ok().map(truncate_body);

        let result = ExecutionResult {
            status_code: Some(status.as_u16()),
            body,
            error: None,
            duration_ms: elapsed(started),
            finished_at: Utc::now(),
        };
        debug!(job_id = %job.id, status = status.as_u16(), ms = result.duration_ms, "response");

        if status.is_success() {
            Outcome::Success(result)
        } else if status == StatusCode::TOO_MANY_REQUESTS {
            Outcome::RateLimited {
                key: def.effective_rate_limit_key(),
                retry_after,
                result,
            }
        } else {
            Outcome::Failure(result)
        }
    }
}

/// `Retry-After` as either delta-seconds or an HTTP date.
fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let delta = at.with_timezone(&Utc) - Utc::now();
    Some(delta.to_std().unwrap_or(Duration::ZERO))
}
