//! Job lifecycle.
//!
//! ```text
//! queued -> running -> needs_review -> done | failed
//!                   \-> done | failed
//! ```
//!
//! Every status change goes through [`transition_tx`], which checks the edge
//! against [`allowed_transitions`] and then applies it as a conditional update on
//! the expected current status. The job row is the only synchronisation point
//! between workers, reviewers and pollers.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::{Sqlite, Transaction};
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::db::{self, NewJob, Pool};
use crate::meta::JobMeta;
use crate::model::{Job, JobStatus};

pub const STALE_JOB_ERROR: &str = "Job timed out while running";

#[derive(Debug, Error)]
pub enum TransitionError {
    #[error("illegal job transition {from} -> {to}")]
    Illegal { from: JobStatus, to: JobStatus },
    #[error("job {job_id} is {actual}, expected {expected}")]
    Stale {
        job_id: String,
        expected: JobStatus,
        actual: JobStatus,
    },
    #[error("job {0} not found")]
    NotFound(String),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

pub fn allowed_transitions(from: JobStatus) -> &'static [JobStatus] {
    match from {
        JobStatus::Queued => &[JobStatus::Running],
        JobStatus::Running => &[JobStatus::NeedsReview, JobStatus::Done, JobStatus::Failed],
        JobStatus::NeedsReview => &[JobStatus::Done, JobStatus::Failed],
        JobStatus::Done | JobStatus::Failed => &[],
    }
}

pub fn check_transition(from: JobStatus, to: JobStatus) -> Result<(), TransitionError> {
    if allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(TransitionError::Illegal { from, to })
    }
}

/// Outcome of trying to take a queued job.
#[derive(Debug)]
pub enum Claim {
    Claimed(Job),
    /// Someone else owns the job or it already finished; nothing to do.
    Skipped(JobStatus),
}

#[instrument(skip_all)]
pub async fn enqueue(pool: &Pool, job: &NewJob) -> anyhow::Result<String> {
    let id = db::insert_job(pool, job).await?;
    info!(job_id = %id, kind = job.kind.as_str(), user_id = %job.user_id, "job queued");
    Ok(id)
}

/// Move a job `queued -> running`. Only one caller can win; everyone else gets
/// `Skipped` with the status they observed.
///
/// The conditional update runs before any read so that concurrent claimers
/// never hold a read snapshot they then try to upgrade.
#[instrument(skip_all, fields(job_id = %job_id))]
pub async fn claim(pool: &Pool, job_id: &str) -> Result<Claim, TransitionError> {
    let won = db::compare_and_set_job_status(
        pool,
        job_id,
        JobStatus::Queued,
        JobStatus::Running,
        None,
        None,
    )
    .await?;
    let Some(job) = db::fetch_job(pool, job_id).await? else {
        return Err(TransitionError::NotFound(job_id.to_string()));
    };
    if !won {
        return Ok(Claim::Skipped(job.status));
    }
    info!(kind = job.kind.as_str(), "job claimed");
    Ok(Claim::Claimed(job))
}

/// Keep a claimed job from looking stale while it waits on slow collaborators.
/// Returns false when the job is no longer `running`.
pub async fn heartbeat(pool: &Pool, job_id: &str) -> anyhow::Result<bool> {
    db::touch_running_job(pool, job_id, Utc::now()).await
}

/// Apply `from -> to` inside `tx`. `meta` replaces the stored document when
/// given. `error` is written as-is, so passing `None` clears it.
pub async fn transition_tx(
    tx: &mut Transaction<'_, Sqlite>,
    job_id: &str,
    from: JobStatus,
    to: JobStatus,
    meta: Option<&JobMeta>,
    error: Option<&str>,
) -> Result<(), TransitionError> {
    check_transition(from, to)?;
    let encoded = meta
        .map(JobMeta::encode)
        .transpose()
        .map_err(|e| anyhow::Error::from(e).context("failed to encode job meta"))?;
    let updated = db::compare_and_set_job_status_tx(
        tx,
        job_id,
        from,
        to,
        encoded.as_deref(),
        error,
        Utc::now(),
    )
    .await?;
    if updated {
        return Ok(());
    }
    match db::fetch_job_tx(tx, job_id).await? {
        Some(job) => Err(TransitionError::Stale {
            job_id: job_id.to_string(),
            expected: from,
            actual: job.status,
        }),
        None => Err(TransitionError::NotFound(job_id.to_string())),
    }
}

#[instrument(skip_all, fields(job_id = %job_id, from = %from, to = %to))]
pub async fn transition(
    pool: &Pool,
    job_id: &str,
    from: JobStatus,
    to: JobStatus,
    meta: Option<&JobMeta>,
    error: Option<&str>,
) -> Result<(), TransitionError> {
    let mut tx = pool.begin().await.map_err(anyhow::Error::from)?;
    transition_tx(&mut tx, job_id, from, to, meta, error).await?;
    tx.commit().await.map_err(anyhow::Error::from)?;
    info!("job transitioned");
    Ok(())
}

/// Terminal failure with a message meant for the user.
pub async fn fail(
    pool: &Pool,
    job_id: &str,
    from: JobStatus,
    error: &str,
) -> Result<(), TransitionError> {
    warn!(job_id, %from, error, "job failed");
    transition(pool, job_id, from, JobStatus::Failed, None, Some(error)).await
}

/// Fail every `running` job that has not been touched for `older_than`.
/// Returns the ids that were failed; jobs that moved on in the meantime are
/// left alone.
#[instrument(skip_all)]
pub async fn fail_stale_running(pool: &Pool, older_than: Duration) -> anyhow::Result<Vec<String>> {
    let cutoff = stale_cutoff(Utc::now(), older_than)?;
    let mut failed = Vec::new();
    for id in db::stale_running_job_ids(pool, cutoff).await? {
        match fail(pool, &id, JobStatus::Running, STALE_JOB_ERROR).await {
            Ok(()) => failed.push(id),
            Err(TransitionError::Stale { .. }) => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(failed)
}

fn stale_cutoff(now: DateTime<Utc>, older_than: Duration) -> anyhow::Result<DateTime<Utc>> {
    let span = chrono::Duration::from_std(older_than)?;
    Ok(now - span)
}

/// Poll until the job reaches `done` or `failed`, giving up after `deadline`.
pub async fn wait_for_terminal(
    pool: &Pool,
    job_id: &str,
    interval: Duration,
    deadline: Duration,
) -> anyhow::Result<Job> {
    let poll = async {
        loop {
            match db::fetch_job(pool, job_id).await? {
                Some(job) if job.status.is_terminal() => return Ok::<_, anyhow::Error>(job),
                Some(_) => {}
                None => anyhow::bail!("job {} not found", job_id),
            }
            tokio::time::sleep(interval).await;
        }
    };
    match tokio::time::timeout(deadline, poll).await {
        Ok(res) => res,
        Err(_) => anyhow::bail!("job {} did not finish within {:?}", job_id, deadline),
    }
}
