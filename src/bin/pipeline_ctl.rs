use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use payslip_pipeline::config::{self, Config};
use payslip_pipeline::db::{self, NewJob, Pool};
use payslip_pipeline::inference::InferenceClient;
use payslip_pipeline::model::Job;
use payslip_pipeline::review::{self, ReviewContext, ReviewFields};
use payslip_pipeline::storage::FsPreviewStore;
use payslip_pipeline::worker::{Worker, WorkerSettings};
use payslip_pipeline::{anomalies, conflicts, jobs};

#[derive(Debug, Parser)]
#[command(about = "Operate the payslip pipeline: queue jobs, review, resolve conflicts and manage anomalies.")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Queue an extraction job for an uploaded file
    Enqueue {
        #[arg(long)]
        user: String,
        #[arg(long)]
        file: String,
        #[arg(long)]
        pdf_password: Option<String>,
    },
    /// Run a single queued job (the oldest one unless --job is given)
    RunOnce {
        #[arg(long)]
        job: Option<String>,
    },
    /// Show a job and its review state
    Status { job: String },
    /// Poll a job until it is done or failed
    Wait {
        job: String,
        #[arg(long, default_value_t = 1000)]
        interval_ms: u64,
        #[arg(long, default_value_t = 120)]
        timeout_secs: u64,
    },
    /// Confirm or reject a job awaiting review
    Review {
        job: String,
        /// Corrected amounts as JSON, e.g. '{"gross": 3100, "net": 2450.5}'
        #[arg(long, conflicts_with = "reject")]
        fields: Option<String>,
        /// Reject the extraction with this reason
        #[arg(long)]
        reject: Option<String>,
    },
    /// List conflict groups for a user
    Conflicts { user: String },
    /// Keep one payslip of a conflict group and flag the rest
    Resolve {
        user: String,
        /// Payslip to keep
        selected: String,
    },
    /// Hide an anomaly permanently
    Mute { anomaly: String },
    /// Hide an anomaly for a number of pay periods
    Snooze {
        anomaly: String,
        #[arg(long, default_value_t = 1)]
        periods: u32,
    },
    /// List anomalies currently visible to a user
    Anomalies { user: String },
    /// Totals over payslips not flagged as conflicts
    Totals { user: String },
    /// Print a sample config.yaml
    ExampleConfig,
}

#[derive(Debug, Serialize)]
struct JobView {
    id: String,
    user_id: String,
    file_id: Option<String>,
    kind: &'static str,
    status: &'static str,
    error: Option<String>,
    meta: Value,
    updated_at: String,
}

impl JobView {
    fn from_job(job: &Job) -> Result<Self> {
        Ok(Self {
            id: job.id.clone(),
            user_id: job.user_id.clone(),
            file_id: job.file_id.clone(),
            kind: job.kind.as_str(),
            status: job.status.as_str(),
            error: job.error.clone(),
            meta: job.meta.to_value()?,
            updated_at: job.updated_at.to_rfc3339(),
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    if let Command::ExampleConfig = args.command {
        print!("{}", config::example());
        return Ok(());
    }
    let cfg = config::load(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    cfg.ensure_dirs()?;
    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;
    run(&cfg, &pool, args.command).await
}

fn print<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn load_job(pool: &Pool, job_id: &str) -> Result<Job> {
    db::fetch_job(pool, job_id)
        .await?
        .ok_or_else(|| anyhow!("job {} not found", job_id))
}

async fn run(cfg: &Config, pool: &Pool, command: Command) -> Result<()> {
    match command {
        Command::Enqueue {
            user,
            file,
            pdf_password,
        } => {
            let id = jobs::enqueue(pool, &NewJob::extract(&user, &file, pdf_password)).await?;
            print(&json!({ "job_id": id }))
        }
        Command::RunOnce { job } => {
            let worker = Worker::new(
                pool.clone(),
                Arc::new(FsPreviewStore::new(&cfg.storage.preview_root)),
                Arc::new(InferenceClient::from_config(&cfg.inference)?),
                WorkerSettings::from_config(cfg),
            );
            let outcome = match job {
                Some(id) => worker.run_job(&id).await?,
                None => worker.process_next_job().await?,
            };
            println!("{:?}", outcome);
            Ok(())
        }
        Command::Status { job } => {
            let job = load_job(pool, &job).await?;
            let context = ReviewContext::from_job(&job, cfg.review.confidence_threshold);
            let dismissible = context.is_dismissible();
            print(&json!({
                "job": JobView::from_job(&job)?,
                "review": context,
                "dismissible": dismissible,
            }))
        }
        Command::Wait {
            job,
            interval_ms,
            timeout_secs,
        } => {
            let job = jobs::wait_for_terminal(
                pool,
                &job,
                Duration::from_millis(interval_ms),
                Duration::from_secs(timeout_secs),
            )
            .await?;
            print(&JobView::from_job(&job)?)
        }
        Command::Review {
            job,
            fields,
            reject,
        } => {
            if let Some(reason) = reject {
                review::reject_review(pool, &job, &reason).await?;
            } else {
                let fields: ReviewFields = match fields {
                    Some(raw) => serde_json::from_str(&raw).context("invalid --fields JSON")?,
                    None => {
                        let current = load_job(pool, &job).await?;
                        ReviewContext::from_job(&current, cfg.review.confidence_threshold).fields
                    }
                };
                review::confirm_review(pool, &job, &fields).await?;
            }
            print(&JobView::from_job(&load_job(pool, &job).await?)?)
        }
        Command::Conflicts { user } => print(&conflicts::find_conflicts(pool, &user).await?),
        Command::Resolve { user, selected } => {
            let groups = conflicts::find_conflicts(pool, &user).await?;
            let group = groups
                .iter()
                .find(|g| g.members.iter().any(|p| p.id == selected))
                .ok_or_else(|| anyhow!("payslip {} is not in any conflict group", selected))?;
            let resolved =
                conflicts::resolve_conflict_group(pool, &selected, &group.member_ids()).await;
            // Partial failures leave a mixed group; show what actually landed.
            print(&conflicts::find_conflicts(pool, &user).await?)?;
            Ok(resolved?)
        }
        Command::Mute { anomaly } => {
            anomalies::mute(pool, &anomaly).await?;
            print(&json!({ "muted": anomaly }))
        }
        Command::Snooze { anomaly, periods } => {
            let until = anomalies::snooze(pool, &anomaly, periods, Utc::now()).await?;
            print(&json!({ "anomaly": anomaly, "snoozed_until": until }))
        }
        Command::Anomalies { user } => {
            print(&anomalies::list_visible(pool, &user, Utc::now()).await?)
        }
        Command::Totals { user } => print(&conflicts::aggregate_totals(pool, &user).await?),
        Command::ExampleConfig => {
            print!("{}", config::example());
            Ok(())
        }
    }
}
