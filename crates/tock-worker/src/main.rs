use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use clap::Parser;
use tock_clock::{Clock, SystemClock};
use tock_core::TockConfig;
use tock_scheduler::{
    Datastore, HttpExecutor, Job, JobDefinition, JobId, Processor, ProcessorSettings, Scheduler,
    SqliteDatastore,
};
use tock_shard::ShardTable;
use tracing::{error, info, warn};

mod cli;

use cli::{parse_header, Cli, Command};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tock_worker=info,tock_scheduler=info".into()),
        )
        .init();

    let cli = Cli::parse();

    // load config: explicit path > TOCK_CONFIG env > ~/.tock/tock.toml
    let config_path = cli.config.clone().or_else(|| std::env::var("TOCK_CONFIG").ok());
    let config = load_config(config_path.as_deref())?;

    let db_path = &config.database.path;
    config.ensure_data_dir()?;
    info!(path = %db_path, "opening SQLite database");
    let store = Arc::new(SqliteDatastore::open(db_path)?);

    let outcome = match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(&config, store.clone()).await,
        Command::Schedule {
            url,
            method,
            at,
            headers,
            body,
            rate_limit_key,
        } => {
            let scheduled_at = match at {
                Some(ref s) => DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc),
                None => Utc::now(),
            };
            let mut def = JobDefinition::new(url, scheduled_at).with_method(method);
            for raw in &headers {
                let (name, value) = parse_header(raw)?;
                def = def.with_header(name, value);
            }
            if let Some(body) = body {
                def = def.with_body(body);
            }
            if let Some(key) = rate_limit_key {
                def = def.with_rate_limit_key(key);
            }
            let table = ShardTable::new(config.ring.replicas, config.processor.max_query_size);
            let job = Job::register(def, &table, Utc::now());
            let id = store.schedule(job).await?;
            println!("{}", serde_json::json!({ "id": id, "status": "registered" }));
            Ok(())
        }
        Command::Status { id } => match store.get_job(&JobId::from(id.as_str())).await? {
            Some(job) => {
                println!("{}", serde_json::to_string_pretty(&job)?);
                Ok(())
            }
            None => Err(anyhow::anyhow!("no job with id {id}")),
        },
        Command::Cancel { id } => {
            let cancelled = store.cancel(&JobId::from(id.as_str())).await?;
            println!("{}", serde_json::json!({ "id": id, "cancelled": cancelled }));
            Ok(())
        }
    };

    store.close().await;
    outcome
}

/// Wire one scheduler and one processor for this worker's shard assignment
/// and run them until Ctrl-C.
async fn run(config: &TockConfig, store: Arc<SqliteDatastore>) -> anyhow::Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let table = ShardTable::new(config.ring.replicas, config.processor.max_query_size);
    let filter = table.filter_for(config.worker.index, config.worker.fleet_size);
    info!(
        index = config.worker.index,
        fleet_size = config.worker.fleet_size,
        shards = ?filter.as_ref().map(|f| f.iter().map(ToString::to_string).collect::<Vec<_>>()),
        "shard assignment"
    );

    let executor = Arc::new(HttpExecutor::new(std::time::Duration::from_millis(
        config.processor.request_timeout_ms,
    ))?);
    let scheduler = Scheduler::new(
        store.clone(),
        clock.clone(),
        Duration::milliseconds(config.scheduler.period_ms as i64),
        filter.clone(),
    );
    let processor = Processor::new(
        store,
        clock,
        executor,
        ProcessorSettings::from(&config.processor),
        filter,
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let scheduler = tokio::spawn(scheduler.run(shutdown_rx.clone()));
    let processor = tokio::spawn(processor.run(shutdown_rx));
    info!("tock worker running, Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    let _ = shutdown_tx.send(true);

    if let Err(e) = scheduler.await {
        warn!("scheduler task ended abnormally: {e}");
    }
    if let Err(e) = processor.await {
        warn!("processor task ended abnormally: {e}");
    }
    Ok(())
}

/// A missing file means defaults. A file that does not validate stops the
/// worker: running on defaults would make it claim every shard.
fn load_config(path: Option<&str>) -> anyhow::Result<TockConfig> {
    TockConfig::load(path).map_err(|e| {
        error!(code = e.code(), "invalid configuration: {e}");
        anyhow::anyhow!("invalid configuration: {e}")
    })
}
