//! OP Execution Service
//!
//! Command-line driver for the execution engine:
//! - `run`: submit synthetic work and print every record once it is terminal
//! - `inspect`: print one record from the SQLite store
//! - `metrics`: print the Prometheus exposition after a short run

use anyhow::{bail, Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use op_core::config::{LogFormat, StorageKind};
use op_core::Settings;
use op_execution_tracker::{
    ExecutionError, ExecutionManager, ExecutionRecord, ExecutionTelemetry, ExecutorConfig,
    ManagerConfig, RetentionSweeper, TimeoutMonitor, TokioWorkExecutor,
};
use op_state_store::{ExecutionStore, MemoryStore, SqliteStore, StatusCounts, StateStoreError};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Parser, Debug)]
#[command(name = "op-exec-service")]
#[command(about = "Submit, track and inspect asynchronous executions")]
struct Args {
    /// Settings file (TOML). Missing files fall back to defaults.
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Submit synthetic work and print each record when it finishes
    Run(RunArgs),
    /// Print a stored execution record
    Inspect {
        execution_id: String,
    },
    /// Print Prometheus metrics after a short synthetic run
    Metrics(RunArgs),
}

#[derive(ClapArgs, Debug, Clone)]
struct RunArgs {
    /// Number of executions to submit
    #[arg(long, default_value_t = 10)]
    jobs: u64,

    /// Simulated work time per execution
    #[arg(long, default_value_t = 50)]
    delay_ms: u64,

    /// Make every Kth execution fail (0 = never)
    #[arg(long, default_value_t = 0)]
    fail_every: u64,

    /// Cancel every Cth execution right after submitting it (0 = never)
    #[arg(long, default_value_t = 0)]
    cancel_every: u64,
}

#[derive(Serialize)]
struct RunSummary<'a> {
    service: &'a str,
    store_type: &'static str,
    counts: StatusCounts,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment from /etc/op-exec/environment (if exists)
    op_core::config::load_environment();

    let args = Args::parse();
    let settings = Settings::load(args.config.as_deref())
        .with_context(|| format!("loading settings from {:?}", args.config))?;

    init_tracing(settings.service.log_format)?;
    op_state_store::metrics::register_metrics();

    match args.command {
        Commands::Run(run) => {
            let (manager, background) = start_engine(&settings).await?;
            let records = drive(&manager, &run).await?;
            for record in &records {
                println!("{}", serde_json::to_string(record)?);
            }
            let summary = RunSummary {
                service: &settings.service.name,
                store_type: manager.store().store_type(),
                counts: manager.counts().await?,
            };
            info!(summary = %serde_json::to_string(&summary)?, "Run complete");
            stop_background(background);
        }
        Commands::Inspect { execution_id } => {
            if settings.storage.kind != StorageKind::Sqlite {
                bail!("inspect needs a persistent store; set storage.type = \"sqlite\"");
            }
            let store = SqliteStore::new(&settings.storage.sqlite_url).await?;
            match store.find_by_id(&execution_id).await {
                Ok(record) => println!("{}", serde_json::to_string_pretty(&record)?),
                Err(StateStoreError::NotFound(_)) => println!("not found"),
                Err(e) => return Err(e.into()),
            }
        }
        Commands::Metrics(run) => {
            let (manager, background) = start_engine(&settings).await?;
            drive(&manager, &run).await?;
            stop_background(background);
            print!("{}", manager.metrics().gather_text());
            print!("{}", op_state_store::metrics::gather_metrics());
        }
    }

    Ok(())
}

fn init_tracing(format: LogFormat) -> Result<()> {
    let filter = EnvFilter::from_default_env()
        .add_directive("op_exec_service=info".parse()?)
        .add_directive("op_execution_tracker=info".parse()?)
        .add_directive("op_state_store=info".parse()?)
        .add_directive("sqlx=warn".parse()?);

    // Records and metrics go to stdout; logs stay on stderr.
    match format {
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
    }
    Ok(())
}

async fn open_store(settings: &Settings) -> Result<Arc<dyn ExecutionStore>> {
    let store: Arc<dyn ExecutionStore> = match settings.storage.kind {
        StorageKind::Memory => Arc::new(MemoryStore::new()),
        StorageKind::Sqlite => Arc::new(
            SqliteStore::new(&settings.storage.sqlite_url)
                .await
                .with_context(|| format!("opening {}", settings.storage.sqlite_url))?,
        ),
    };
    info!(store_type = store.store_type(), "Execution store ready");
    Ok(store)
}

/// Build the manager and start the configured supervisors
async fn start_engine(settings: &Settings) -> Result<(ExecutionManager, Vec<JoinHandle<()>>)> {
    let store = open_store(settings).await?;
    let executor = Arc::new(TokioWorkExecutor::new(ExecutorConfig::from(&settings.executor)));
    let manager = ExecutionManager::new(store.clone(), executor)
        .with_telemetry(Arc::new(ExecutionTelemetry::new(&settings.service.name)))
        .with_config(ManagerConfig::from(&settings.failure));

    let mut background = Vec::new();
    if settings.timeout.enabled {
        background.push(
            TimeoutMonitor::from_settings(store.clone(), &settings.timeout)
                .with_metrics(manager.metrics().clone())
                .spawn(),
        );
    }
    if settings.cleanup.enabled {
        background.push(RetentionSweeper::from_settings(store, &settings.cleanup).spawn());
    }

    info!(service = %settings.service.name, "Execution engine started");
    Ok((manager, background))
}

fn stop_background(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        handle.abort();
    }
}

/// Submit `run.jobs` synthetic executions and wait for all of them
async fn drive(manager: &ExecutionManager, run: &RunArgs) -> Result<Vec<ExecutionRecord>> {
    let mut ids = Vec::with_capacity(run.jobs as usize);

    for job in 1..=run.jobs {
        let fail = run.fail_every > 0 && job % run.fail_every == 0;
        let delay = Duration::from_millis(run.delay_ms);
        let args = json!({ "job": job, "delay_ms": run.delay_ms });

        let submitted = manager
            .submit("SyntheticService", "square", &args, move || async move {
                tokio::time::sleep(delay).await;
                if fail {
                    bail!("synthetic failure on job {}", job);
                }
                Ok(json!({ "job": job, "squared": job * job }))
            })
            .await;

        let execution_id = match submitted {
            Ok(record) => record.execution_id,
            Err(ExecutionError::Rejected { execution_id, reason }) => {
                warn!(execution_id = %execution_id, reason = %reason, "Submission rejected");
                ids.push(execution_id);
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        if run.cancel_every > 0 && job % run.cancel_every == 0 {
            let cancelled = manager.cancel(&execution_id).await?;
            info!(execution_id = %execution_id, cancelled, "Cancel requested");
        }
        ids.push(execution_id);
    }

    let mut records = Vec::with_capacity(ids.len());
    for id in &ids {
        records.push(manager.wait_for_terminal(id, POLL_INTERVAL).await?);
    }
    Ok(records)
}
