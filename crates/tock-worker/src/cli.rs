//! Command-line surface of the worker binary.

use clap::{Parser, Subcommand};

/// Distributed HTTP job scheduler worker.
#[derive(Parser)]
#[command(name = "tock-worker")]
#[command(version)]
pub(crate) struct Cli {
    /// Configuration file (falls back to TOCK_CONFIG, then ~/.tock/tock.toml)
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run the scheduler and processor loops until Ctrl-C (default)
    Run,

    /// Register a job
    Schedule {
        /// Target URL
        #[arg(long)]
        url: String,

        /// HTTP method
        #[arg(long, default_value = "GET")]
        method: String,

        /// When to fire, RFC 3339 (defaults to now)
        #[arg(long)]
        at: Option<String>,

        /// Extra request header as `Name: value`; repeatable
        #[arg(long = "header")]
        headers: Vec<String>,

        /// Request body
        #[arg(long)]
        body: Option<String>,

        /// Throttling bucket (defaults to the URL host)
        #[arg(long)]
        rate_limit_key: Option<String>,
    },

    /// Print a job as JSON
    Status {
        /// Job id
        id: String,
    },

    /// Cancel a job that has not started
    Cancel {
        /// Job id
        id: String,
    },
}

/// Split `Name: value` into its parts.
pub(crate) fn parse_header(raw: &str) -> anyhow::Result<(String, String)> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| anyhow::anyhow!("header {raw:?} is not in `Name: value` form"))?;
    let name = name.trim();
    if name.is_empty() {
        anyhow::bail!("header {raw:?} has an empty name");
    }
    Ok((name.to_string(), value.trim().to_string()))
}
