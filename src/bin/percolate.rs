//! Main entry point for the percolate daemon.
//!
//! Runs the singleton scheduler loop and a worker pool against a
//! Postgres store, with configuration from environment variables.

use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

use percolate::observability::init_tracing;
use percolate::schedule::ScheduleJitter;
use percolate::worker::WorkerConfig;
use percolate::{
    AgentSchedule, Config, PostgresStore, RemoteAgent, SchedulerConfig, Store, TypeRegistry,
    WorkerPool,
};

#[derive(Parser)]
#[command(name = "percolate", version, about = "Agent scheduling and message propagation daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler and worker pool.
    Run {
        /// Run workers only; some other process drives the schedule.
        #[arg(long)]
        no_scheduler: bool,
        /// Run the scheduler only; some other process executes jobs.
        #[arg(long)]
        no_workers: bool,
    },
    /// List the named check schedules and their cron expressions.
    Schedules,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            no_scheduler,
            no_workers,
        } => run(no_scheduler, no_workers).await,
        Command::Schedules => {
            print_schedules();
            Ok(())
        }
    }
}

async fn run(no_scheduler: bool, no_workers: bool) -> Result<()> {
    let config = Config::from_env()?;
    info!("starting percolate");

    let store: Arc<dyn Store> = Arc::new(PostgresStore::connect(config.require_database_url()?).await?);
    info!("connected to database");

    let mut registry = TypeRegistry::new();
    RemoteAgent::register(&mut registry)?;
    let registry = Arc::new(registry);
    info!(types = ?registry.type_ids(), "registered agent types");

    let scheduler = if no_scheduler {
        None
    } else {
        Some(percolate::spawn_scheduler(
            SchedulerConfig::from_config(&config),
            store.clone(),
            registry.clone(),
        ))
    };

    let mut pools = Vec::new();
    if !no_workers {
        let pool_count = config.worker_count.max(1);
        // The concurrency budget is global; split it across the pools.
        let mut worker_config = WorkerConfig::from_config(&config);
        worker_config.max_concurrent = (config.max_concurrent_jobs / pool_count).max(1);
        for _ in 0..pool_count {
            pools.push(WorkerPool::start(
                worker_config.clone(),
                store.clone(),
                registry.clone(),
            ));
        }
        info!(pools = pools.len(), "worker pools started");
    }

    info!("percolate started, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    if let Some((handle, shutdown_tx)) = scheduler {
        let _ = shutdown_tx.send(true);
        handle.await??;
    }
    for pool in pools {
        pool.shutdown().await?;
    }

    info!("percolate stopped");
    Ok(())
}

fn print_schedules() {
    let jitter = ScheduleJitter::none();
    for schedule in AgentSchedule::all() {
        match schedule.cron_expression(jitter) {
            Some(expr) => println!("{:<10} {expr}", schedule.as_str()),
            None => println!("{:<10} (no scheduled checks)", schedule.as_str()),
        }
    }
}
