//! Capacity Engine - operator CLI

use std::sync::Arc;

use clap::Parser;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use capacity_engine::{
    config::{Args, Command},
    source::{CommitmentStore, FailoverStore, MemoryStore, SqliteStore},
    CapacityAlertEvaluator, Percent, TaggedCache, WorkloadService,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    // Logs go to stderr; stdout carries command output
    let log_level = args.log_level.clone();
    let json_layer = args
        .log_json
        .then(|| tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr));
    let text_layer =
        (!args.log_json).then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr));
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("capacity_engine={},info", log_level).into()),
        )
        .with(json_layer)
        .with(text_layer)
        .init();

    if let Err(e) = args.validate() {
        error!("{}", e);
        std::process::exit(1);
    }

    info!("Database: {}", args.db_path.display());
    match &args.fallback_path {
        Some(path) => info!("Fallback: {}", path.display()),
        None => info!("Fallback: in-memory"),
    }

    let fallback = Arc::new(match &args.fallback_path {
        Some(path) => MemoryStore::open(path)?,
        None => MemoryStore::new(),
    });

    match SqliteStore::open(&args.db_path) {
        Ok(sqlite) => {
            let store = Arc::new(FailoverStore::new(Arc::new(sqlite), fallback));
            run(store, &args).await
        }
        Err(e) => {
            warn!(error = %e, "SQLite store unavailable at startup, using fallback store only");
            run(fallback, &args).await
        }
    }
}

async fn run<S>(store: Arc<S>, args: &Args) -> anyhow::Result<()>
where
    S: CommitmentStore + 'static,
{
    let config = args.engine_config();
    let cache = Arc::new(TaggedCache::new());
    let service = WorkloadService::new(store, cache.clone(), &config);

    match &args.command {
        Command::Snapshot { worker } => {
            print_json(&service.live_workload(*worker).await?)?;
        }
        Command::Validate {
            worker,
            percent,
            exclude_project,
        } => {
            let proposed = Percent::from_f64(*percent)?;
            let decision = service
                .validator()
                .validate(*worker, proposed, *exclude_project)
                .await?;
            print_json(&decision)?;
        }
        Command::ValidateInitiative {
            worker,
            percent,
            exclude_initiative,
        } => {
            let proposed = Percent::from_f64(*percent)?;
            let decision = service
                .validator()
                .validate_initiative(*worker, proposed, *exclude_initiative)
                .await?;
            print_json(&decision)?;
        }
        Command::Fleet => {
            print_json(&service.fleet_overview().await?)?;
        }
        Command::Alerts { once: true } => {
            let evaluator =
                CapacityAlertEvaluator::new(service.aggregator().clone(), config.alert_interval);
            print_json(&evaluator.evaluate_once().await?)?;
        }
        Command::Alerts { once: false } => {
            let evaluator = Arc::new(CapacityAlertEvaluator::new(
                service.aggregator().clone(),
                config.alert_interval,
            ));
            let mut alerts = evaluator.subscribe();
            let sweeper = cache.start_sweeper(config.sweep_interval);
            evaluator.start().await?;

            loop {
                tokio::select! {
                    alert = alerts.recv() => match alert {
                        Ok(alert) => print_json(&alert)?,
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Alert output fell behind");
                        }
                        Err(RecvError::Closed) => break,
                    },
                    _ = tokio::signal::ctrl_c() => {
                        info!("Shutdown signal received");
                        break;
                    }
                }
            }

            evaluator.stop().await?;
            sweeper.shutdown().await;
        }
    }

    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
