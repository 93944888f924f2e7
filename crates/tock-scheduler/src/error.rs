use thiserror::Error;

use crate::types::JobStatus;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Any other backend failure. Loops treat it as transient.
    #[error("Storage error: {0}")]
    Storage(String),

    /// A persisted job could not be decoded; it is excluded from processing.
    #[error("Malformed job {id}: {reason}")]
    Decode { id: String, reason: String },

    /// No job with the given ID exists in the store.
    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    /// The requested status change is not an edge of the lifecycle.
    #[error("Invalid transition for job {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: JobStatus,
        to: JobStatus,
    },

    /// The datastore was closed; no further operations are accepted.
    #[error("Datastore is closed")]
    Closed,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The HTTP client could not be built.
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

impl SchedulerError {
    /// Storage-class failures are retried on the next period or delivery.
    pub fn is_transient(&self) -> bool {
        matches!(self, SchedulerError::Database(_) | SchedulerError::Storage(_))
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
