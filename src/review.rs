//! Human correction of low-confidence extractions.
//!
//! Confirming a review rewrites the payslip amounts and finishes the job in one
//! transaction. The payslip update is idempotent, so a confirmation that fails
//! on the job transition can simply be retried.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, instrument};

use crate::db::{self, Pool};
use crate::jobs::{self, TransitionError};
use crate::meta::{ExtractMeta, JobMeta};
use crate::model::{Highlight, Job, JobStatus};

#[derive(Debug, Error)]
pub enum ReviewError {
    #[error("{0} must be a finite number")]
    InvalidField(&'static str),
    #[error("job {0} not found")]
    JobNotFound(String),
    #[error("job is {0}, not awaiting review")]
    NotAwaitingReview(JobStatus),
    #[error("job is missing file reference")]
    MissingFile,
    #[error("no payslip recorded for file {0}")]
    PayslipMissing(String),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Corrected amounts supplied by a reviewer. Absent values are stored as null.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReviewFields {
    #[serde(default)]
    pub gross: Option<f64>,
    #[serde(default)]
    pub net: Option<f64>,
    #[serde(default)]
    pub tax_income: Option<f64>,
    #[serde(default)]
    pub ni_prsi: Option<f64>,
    #[serde(default)]
    pub pension_employee: Option<f64>,
}

impl ReviewFields {
    pub fn validate(&self) -> Result<(), ReviewError> {
        let checks = [
            ("gross", self.gross),
            ("net", self.net),
            ("tax_income", self.tax_income),
            ("ni_prsi", self.ni_prsi),
            ("pension_employee", self.pension_employee),
        ];
        for (name, value) in checks {
            if value.is_some_and(|v| !v.is_finite()) {
                return Err(ReviewError::InvalidField(name));
            }
        }
        Ok(())
    }

    /// Write the corrections into `meta.fields`, keeping every other key.
    fn merge_into(&self, meta: &mut ExtractMeta) {
        let fields = meta.fields.get_or_insert_with(Default::default);
        fields.gross = self.gross;
        fields.net = self.net;
        fields.tax_income = self.tax_income;
        fields.ni_prsi = self.ni_prsi;
        fields.pension_employee = self.pension_employee;
        meta.review_required = Some(false);
    }
}

/// What a review surface needs to render a job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReviewContext {
    pub job_id: String,
    pub status: JobStatus,
    pub confidence: Option<f64>,
    pub review_required: bool,
    pub image_url: Option<String>,
    pub highlights: Vec<Highlight>,
    pub fields: ReviewFields,
}

impl ReviewContext {
    pub fn from_job(job: &Job, threshold: f64) -> Self {
        let meta = job.meta.as_extract().cloned().unwrap_or_default();
        let confidence = meta.confidence.filter(|c| c.is_finite());
        let review_required = meta
            .review_required
            .unwrap_or_else(|| confidence.map_or(true, |c| c < threshold));
        let fields = meta
            .fields
            .as_ref()
            .map(|f| ReviewFields {
                gross: f.gross,
                net: f.net,
                tax_income: f.tax_income,
                ni_prsi: f.ni_prsi,
                pension_employee: f.pension_employee,
            })
            .unwrap_or_default();
        Self {
            job_id: job.id.clone(),
            status: job.status,
            confidence,
            review_required,
            image_url: meta.image_url,
            highlights: meta.highlights.unwrap_or_default(),
            fields,
        }
    }

    /// Mandatory reviews cannot be closed without confirming.
    pub fn is_dismissible(&self) -> bool {
        !self.review_required
    }
}

#[instrument(skip_all, fields(job_id = %job_id))]
pub async fn confirm_review(
    pool: &Pool,
    job_id: &str,
    fields: &ReviewFields,
) -> Result<(), ReviewError> {
    fields.validate()?;

    let mut tx = pool.begin().await.map_err(anyhow::Error::from)?;
    let job = db::fetch_job_tx(&mut tx, job_id)
        .await?
        .ok_or_else(|| ReviewError::JobNotFound(job_id.to_string()))?;
    if job.status != JobStatus::NeedsReview {
        return Err(ReviewError::NotAwaitingReview(job.status));
    }
    let file_id = job.file_id.clone().ok_or(ReviewError::MissingFile)?;
    let payslip = db::fetch_payslip_by_file_tx(&mut tx, &file_id)
        .await?
        .ok_or_else(|| ReviewError::PayslipMissing(file_id.clone()))?;

    let mut meta = job.meta.into_extract();
    db::apply_review_tx(&mut tx, &payslip.id, fields, meta.confidence, chrono::Utc::now()).await?;

    fields.merge_into(&mut meta);
    jobs::transition_tx(
        &mut tx,
        job_id,
        JobStatus::NeedsReview,
        JobStatus::Done,
        Some(&JobMeta::Extract(meta)),
        None,
    )
    .await?;
    tx.commit().await.map_err(anyhow::Error::from)?;

    info!(payslip_id = %payslip.id, "review confirmed");
    Ok(())
}

/// Close a review without accepting the extraction.
#[instrument(skip_all, fields(job_id = %job_id))]
pub async fn reject_review(pool: &Pool, job_id: &str, reason: &str) -> Result<(), ReviewError> {
    let job = db::fetch_job(pool, job_id)
        .await?
        .ok_or_else(|| ReviewError::JobNotFound(job_id.to_string()))?;
    if job.status != JobStatus::NeedsReview {
        return Err(ReviewError::NotAwaitingReview(job.status));
    }
    jobs::fail(pool, job_id, JobStatus::NeedsReview, reason).await?;
    Ok(())
}
