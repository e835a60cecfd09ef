//! rowshift Command-Line Client
//!
//! Inspect and operate batched background migrations and sync triggers on a
//! rowshift database, and run migration workers.

mod commands;
mod config;
mod formatter;

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rowshift_core::{Scheduler, TableStore, TransformationRegistry, WorkerPool, WorkerPoolConfig};

use config::{Args, Command};

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rowshift=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    if let Err(e) = run(args).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let (config, command) = args.into_config();

    tracing::debug!(
        data_path = %config.storage.path.display(),
        format = %config.format,
        "configuration loaded"
    );

    let store = TableStore::open(config.storage.clone())?;
    if store.was_recovered() {
        tracing::info!("opened existing database");
    }
    let scheduler = Arc::new(Scheduler::new(
        Arc::new(store),
        Arc::new(TransformationRegistry::with_builtins()),
        config.engine.clone(),
    )?);

    let pool_config = command.pool_config().unwrap_or_default();
    match command {
        Command::Work { finalize, .. } => run_workers(scheduler, pool_config, finalize).await,
        other => {
            let output = commands::execute(other, &scheduler, config.format)?;
            println!("{}", output);
            scheduler.store().flush()?;
            Ok(())
        }
    }
}

/// Run the worker pool until ctrl+c, or drive one migration to completion.
async fn run_workers(
    scheduler: Arc<Scheduler>,
    pool_config: WorkerPoolConfig,
    finalize: Option<u64>,
) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(id) = finalize {
        let finalizer = scheduler.clone();
        let def = tokio::task::spawn_blocking(move || finalizer.finalize(id)).await??;
        scheduler.store().flush()?;
        println!("migration {} {}", def.id, def.status);
        return Ok(());
    }

    let pool = WorkerPool::start(scheduler.clone(), pool_config);
    tracing::info!("workers running, press ctrl+c to stop");

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl+c");
    } else {
        tracing::info!("received shutdown signal");
    }

    tokio::task::spawn_blocking(move || pool.stop()).await?;
    scheduler.store().flush()?;
    tracing::info!("shutdown complete");
    Ok(())
}
