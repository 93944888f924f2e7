//! `tock-scheduler`: job lifecycle, storage contract and the two control loops.
//!
//! # Overview
//!
//! A job is registered through a [`Datastore`], promoted to `queued` by the
//! [`Scheduler`] once its `scheduled_at` passes on the [`Clock`](tock_clock::Clock),
//! and run by a [`Processor`] whose shard filter covers it.
//!
//! # Adapters
//!
//! | Adapter           | Backing                    | Subscriptions woken by             |
//! |-------------------|----------------------------|------------------------------------|
//! | `MemoryDatastore` | one mutex-guarded map      | local writes                       |
//! | `SqliteDatastore` | `jobs` / `job_shards` / `rate_limits` tables | local writes, plus polling |

pub mod datastore;
pub mod db;
pub mod engine;
pub mod error;
pub mod executor;
mod feed;
pub mod lifecycle;
pub mod memory;
pub mod processor;
pub mod sqlite;
pub mod types;

pub use datastore::{Datastore, Subscription};
pub use engine::Scheduler;
pub use error::{Result, SchedulerError};
pub use executor::{Executor, HttpExecutor, Outcome};
pub use lifecycle::can_transition;
pub use memory::MemoryDatastore;
pub use processor::{Processor, ProcessorSettings};
pub use sqlite::SqliteDatastore;
pub use types::{
    ExecutionResult, Job, JobDefinition, JobId, JobStatus, RateLimit, RunningStatus,
};
