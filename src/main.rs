use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use payslip_pipeline::config;
use payslip_pipeline::db;
use payslip_pipeline::inference::InferenceClient;
use payslip_pipeline::jobs;
use payslip_pipeline::storage::FsPreviewStore;
use payslip_pipeline::worker::{JobOutcome, Worker, WorkerSettings};

#[derive(Debug, Parser)]
#[command(author, version, about = "Payslip extraction worker")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let inference = InferenceClient::from_config(&cfg.inference)?;
    let worker = Worker::new(
        pool.clone(),
        Arc::new(FsPreviewStore::new(&cfg.storage.preview_root)),
        Arc::new(inference),
        WorkerSettings::from_config(&cfg),
    );

    let poll_sleep = cfg.poll_interval();
    let stale_after = cfg.stale_after();
    let handle = tokio::spawn(async move {
        loop {
            match jobs::fail_stale_running(&pool, stale_after).await {
                Ok(failed) if !failed.is_empty() => {
                    warn!(count = failed.len(), "failed stale running jobs")
                }
                Ok(_) => {}
                Err(err) => error!(?err, "stale job sweep failed"),
            }
            match worker.process_next_job().await {
                Ok(JobOutcome::Idle) => tokio::time::sleep(poll_sleep).await,
                Ok(outcome) => info!(?outcome, "job processed"),
                Err(err) => {
                    error!(?err, "worker error");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    });

    info!("worker started");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    handle.abort();
    Ok(())
}
