use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;

use crate::error::Result;

/// Initialise the datastore schema in `conn`.
///
/// `jobs` keeps the full record (tags duplicated as JSON for decoding),
/// `job_shards` is the membership index used by shard-filtered queries, and
/// `rate_limits` holds one row per throttled key.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        PRAGMA foreign_keys = ON;

        CREATE TABLE IF NOT EXISTS jobs (
            id              TEXT    NOT NULL PRIMARY KEY,
            definition      TEXT    NOT NULL,   -- JSON-encoded JobDefinition
            status          TEXT    NOT NULL DEFAULT 'registered',
            shards          TEXT    NOT NULL DEFAULT '[]',
            scheduled_at    TEXT    NOT NULL,   -- RFC 3339, millisecond precision, UTC
            registered_at   TEXT    NOT NULL,
            attempts        INTEGER NOT NULL DEFAULT 0,
            revision        INTEGER NOT NULL DEFAULT 0,
            rate_limit_keys TEXT    NOT NULL DEFAULT '[]',
            last_run_at     TEXT,
            completed_at    TEXT,
            result          TEXT                -- JSON-encoded ExecutionResult or NULL
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_jobs_status_scheduled ON jobs (status, scheduled_at);
        CREATE INDEX IF NOT EXISTS idx_jobs_status_registered ON jobs (status, registered_at);

        CREATE TABLE IF NOT EXISTS job_shards (
            job_id  TEXT NOT NULL REFERENCES jobs (id) ON DELETE CASCADE,
            shard   TEXT NOT NULL,   -- '{node_count}-{node_id}'
            PRIMARY KEY (job_id, shard)
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_job_shards_shard ON job_shards (shard);

        CREATE TABLE IF NOT EXISTS rate_limits (
            key         TEXT    NOT NULL PRIMARY KEY,
            satisfied   INTEGER NOT NULL DEFAULT 0,
            reset_at    TEXT    NOT NULL,
            shards      TEXT    NOT NULL DEFAULT '[]',
            revision    INTEGER NOT NULL DEFAULT 0
        ) STRICT;
        ",
    )?;
    Ok(())
}

/// Fixed-width UTC timestamp; sorts lexicographically in time order.
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_ts(s: &str) -> std::result::Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc))
}
