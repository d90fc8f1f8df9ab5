//! Queue worker: claims queued jobs and drives them to a resting state.
//!
//! Extraction jobs fetch the rendered preview, ask the inference service to
//! read it, normalise the answer and persist payslip, job meta and follow-up
//! job in one transaction. Any failure before that commit leaves no payslip
//! write behind and turns the job `failed` with a readable cause.

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use serde_json::Value;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::anomalies::{self, HISTORY_DEPTH};
use crate::config::Config;
use crate::db::{self, NewJob, NewPayslip, Pool};
use crate::inference::{ExtractionPayload, InferenceError, InferenceService};
use crate::jobs::{self, Claim, TransitionError};
use crate::meta::{AnomalyJobMeta, ExtractMeta, ExtractedFields, JobMeta};
use crate::model::{Highlight, Job, JobKind, JobStatus, PeriodType};
use crate::normalize::{
    infer_period_type_from_dates, normalize_country, normalize_currency, normalize_date,
    normalize_period_type, parse_amount, sanitize_highlight,
};
use crate::storage::{preview_key, PreviewStore};

pub const UNHANDLED_KIND_ERROR: &str = "Job kind not handled by this worker";

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("Job is missing file reference")]
    MissingFile,
    #[error("Preview image not found")]
    PreviewUnavailable,
    #[error("Preview storage error: {0}")]
    Storage(String),
    #[error("{0} timed out")]
    Timeout(&'static str),
    #[error("{0}")]
    Inference(String),
    #[error("{0}")]
    MalformedResponse(String),
    #[error("Job is no longer running")]
    Abandoned,
    #[error("Payslip not found for anomaly detection")]
    PayslipMissing,
    #[error("Failed to save results: {0}")]
    Store(String),
}

impl From<InferenceError> for ExtractionError {
    fn from(err: InferenceError) -> Self {
        match err {
            InferenceError::MissingOutput | InferenceError::Malformed(_) => {
                ExtractionError::MalformedResponse(err.to_string())
            }
            InferenceError::Transport(_) | InferenceError::Status { .. } => {
                ExtractionError::Inference(err.to_string())
            }
        }
    }
}

impl From<anyhow::Error> for ExtractionError {
    fn from(err: anyhow::Error) -> Self {
        ExtractionError::Store(format!("{:#}", err))
    }
}

impl From<TransitionError> for ExtractionError {
    fn from(err: TransitionError) -> Self {
        ExtractionError::Store(err.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub confidence_threshold: f64,
    pub fetch_timeout: Duration,
    pub inference_timeout: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.9,
            fetch_timeout: Duration::from_secs(30),
            inference_timeout: Duration::from_secs(60),
        }
    }
}

impl WorkerSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            confidence_threshold: cfg.review.confidence_threshold,
            fetch_timeout: cfg.request_timeout(),
            inference_timeout: cfg.request_timeout(),
        }
    }
}

/// Where a job ended up after one worker pass.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// Nothing was queued.
    Idle,
    Skipped { job_id: String, status: JobStatus },
    NeedsReview { job_id: String, payslip_id: String },
    Done { job_id: String, payslip_id: Option<String> },
    Failed { job_id: String, error: String },
}

#[derive(Clone)]
pub struct Worker {
    pool: Pool,
    previews: Arc<dyn PreviewStore>,
    inference: Arc<dyn InferenceService>,
    settings: WorkerSettings,
}

impl Worker {
    pub fn new(
        pool: Pool,
        previews: Arc<dyn PreviewStore>,
        inference: Arc<dyn InferenceService>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            pool,
            previews,
            inference,
            settings,
        }
    }

    /// Take the oldest queued job, if any, and run it.
    #[instrument(skip_all)]
    pub async fn process_next_job(&self) -> anyhow::Result<JobOutcome> {
        match db::next_queued_job_id(&self.pool).await? {
            Some(job_id) => self.run_job(&job_id).await,
            None => Ok(JobOutcome::Idle),
        }
    }

    /// Run one job by id. Safe to call repeatedly: a job that is no longer
    /// queued is skipped.
    #[instrument(skip_all, fields(job_id = %job_id))]
    pub async fn run_job(&self, job_id: &str) -> anyhow::Result<JobOutcome> {
        let job = match jobs::claim(&self.pool, job_id).await? {
            Claim::Claimed(job) => job,
            Claim::Skipped(status) => {
                info!(%status, "job not queued; skipping");
                return Ok(JobOutcome::Skipped {
                    job_id: job_id.to_string(),
                    status,
                });
            }
        };

        let result = match job.kind {
            JobKind::Extract => self.extract(&job).await,
            JobKind::DetectAnomalies => self.detect(&job).await,
            _ => {
                return self.fail(&job, UNHANDLED_KIND_ERROR).await;
            }
        };
        match result {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                warn!(error = %err, kind = job.kind.as_str(), "job failed");
                self.fail(&job, &err.to_string()).await
            }
        }
    }

    async fn fail(&self, job: &Job, error: &str) -> anyhow::Result<JobOutcome> {
        match jobs::fail(&self.pool, &job.id, JobStatus::Running, error).await {
            Ok(()) => Ok(JobOutcome::Failed {
                job_id: job.id.clone(),
                error: error.to_string(),
            }),
            // The stale sweep or another owner already settled the job.
            Err(TransitionError::Stale { actual, .. }) => {
                warn!(status = %actual, "job settled elsewhere; dropping result");
                Ok(JobOutcome::Skipped {
                    job_id: job.id.clone(),
                    status: actual,
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn fetch_preview(&self, user_id: &str, file_id: &str) -> Result<Vec<u8>, ExtractionError> {
        tokio::time::timeout(
            self.settings.fetch_timeout,
            self.previews.fetch_preview(user_id, file_id),
        )
        .await
        .map_err(|_| ExtractionError::Timeout("Preview fetch"))?
        .map_err(|e| ExtractionError::Storage(format!("{:#}", e)))?
        .ok_or(ExtractionError::PreviewUnavailable)
    }

    async fn extract(&self, job: &Job) -> Result<JobOutcome, ExtractionError> {
        let file_id = job.file_id.as_deref().ok_or(ExtractionError::MissingFile)?;
        let image = self.fetch_preview(&job.user_id, file_id).await?;
        if !jobs::heartbeat(&self.pool, &job.id).await? {
            return Err(ExtractionError::Abandoned);
        }
        let payload = tokio::time::timeout(
            self.settings.inference_timeout,
            self.inference.extract(&image),
        )
        .await
        .map_err(|_| ExtractionError::Timeout("Inference request"))??;

        let extraction = normalize_payload(
            &job.user_id,
            file_id,
            &payload,
            self.settings.confidence_threshold,
        );
        let review_required = extraction.payslip.review_required;
        let target = if review_required {
            JobStatus::NeedsReview
        } else {
            JobStatus::Done
        };

        let mut meta = job.meta.clone().into_extract();
        extraction.merge_into(&mut meta, preview_key(&job.user_id, file_id));

        let mut tx = self.pool.begin().await.map_err(anyhow::Error::from)?;
        let payslip_id = db::upsert_payslip_tx(&mut tx, &extraction.payslip, chrono::Utc::now()).await?;
        jobs::transition_tx(
            &mut tx,
            &job.id,
            JobStatus::Running,
            target,
            Some(&JobMeta::Extract(meta)),
            None,
        )
        .await?;
        if !review_required {
            let follow_up = NewJob {
                user_id: job.user_id.clone(),
                file_id: Some(file_id.to_string()),
                kind: JobKind::DetectAnomalies,
                meta: JobMeta::DetectAnomalies(AnomalyJobMeta {
                    source_job_id: Some(job.id.clone()),
                    payslip_id: Some(payslip_id.clone()),
                    ..Default::default()
                }),
            };
            db::insert_job_tx(&mut tx, &follow_up, chrono::Utc::now()).await?;
        }
        tx.commit().await.map_err(anyhow::Error::from)?;

        info!(
            %payslip_id,
            confidence = ?extraction.confidence,
            review_required,
            "extraction stored"
        );
        Ok(if review_required {
            JobOutcome::NeedsReview {
                job_id: job.id.clone(),
                payslip_id,
            }
        } else {
            JobOutcome::Done {
                job_id: job.id.clone(),
                payslip_id: Some(payslip_id),
            }
        })
    }

    async fn detect(&self, job: &Job) -> Result<JobOutcome, ExtractionError> {
        let mut meta = job.meta.clone().into_anomaly_job();
        let payslip = match (&meta.payslip_id, &job.file_id) {
            (Some(id), _) => db::fetch_payslip(&self.pool, id).await?,
            (None, Some(file_id)) => db::fetch_payslip_by_file(&self.pool, file_id).await?,
            (None, None) => None,
        }
        .ok_or(ExtractionError::PayslipMissing)?;

        let history = db::payslip_history(
            &self.pool,
            &payslip.user_id,
            payslip.created_at,
            &payslip.id,
            HISTORY_DEPTH,
        )
        .await?;
        let findings = anomalies::detect_anomalies(&payslip, &history);

        meta.payslip_id = Some(payslip.id.clone());
        meta.count = Some(findings.len());
        let now = chrono::Utc::now();
        let mut tx = self.pool.begin().await.map_err(anyhow::Error::from)?;
        for finding in &findings {
            db::insert_anomaly_tx(&mut tx, &payslip.user_id, &payslip.id, finding, now).await?;
        }
        jobs::transition_tx(
            &mut tx,
            &job.id,
            JobStatus::Running,
            JobStatus::Done,
            Some(&JobMeta::DetectAnomalies(meta)),
            None,
        )
        .await?;
        tx.commit().await.map_err(anyhow::Error::from)?;
        info!(payslip_id = %payslip.id, count = findings.len(), "anomaly detection done");
        Ok(JobOutcome::Done {
            job_id: job.id.clone(),
            payslip_id: Some(payslip.id),
        })
    }
}

/// Canonical form of one extraction, ready to persist.
#[derive(Debug, Clone)]
pub struct NormalizedExtraction {
    pub payslip: NewPayslip,
    pub fields: ExtractedFields,
    pub highlights: Vec<Highlight>,
    pub confidence: Option<f64>,
    pub notes: Option<String>,
}

impl NormalizedExtraction {
    /// Record the extraction in the job's meta, keeping unrelated keys.
    pub fn merge_into(&self, meta: &mut ExtractMeta, image_url: String) {
        let date = |d: Option<NaiveDate>| d.map(|d| d.to_string());
        let mut fields = self.fields.clone();
        if let Some(previous) = meta.fields.take() {
            fields.extra = previous.extra;
        }
        meta.fields = Some(fields);
        meta.confidence = self.confidence;
        meta.review_required = Some(self.payslip.review_required);
        meta.image_url = Some(image_url);
        meta.highlights = Some(self.highlights.clone());
        meta.employer_name = self.payslip.employer_name.clone();
        meta.pay_date = date(self.payslip.pay_date);
        meta.period_start = date(self.payslip.period_start);
        meta.period_end = date(self.payslip.period_end);
        meta.period_type = self.payslip.period_type;
        meta.country = self.payslip.country;
        meta.notes = self.notes.clone();
    }
}

/// An explicit uncertainty flag or a confidence below `threshold` forces
/// review. A missing confidence always does.
pub fn review_required(flag: Option<bool>, confidence: Option<f64>, threshold: f64) -> bool {
    flag == Some(true) || confidence.map_or(true, |c| c < threshold)
}

pub fn normalize_payload(
    user_id: &str,
    file_id: &str,
    payload: &ExtractionPayload,
    threshold: f64,
) -> NormalizedExtraction {
    let amount = |key: &str| payload.field(key).and_then(parse_amount);
    let currency_raw = payload
        .field("currency")
        .filter(|v| !v.is_null())
        .or(payload.currency.as_ref())
        .unwrap_or(&Value::Null);
    let currency = normalize_currency(currency_raw);

    let fields = ExtractedFields {
        gross: amount("gross"),
        net: amount("net"),
        tax_income: amount("tax_income"),
        ni_prsi: amount("ni_prsi"),
        pension_employee: amount("pension_employee"),
        pension_employer: amount("pension_employer"),
        student_loan: amount("student_loan"),
        currency: Some(currency),
        extra: Default::default(),
    };

    let date = |raw: &Option<Value>| raw.as_ref().and_then(normalize_date);
    let pay_date = date(&payload.pay_date);
    let period_start = date(&payload.period_start);
    let period_end = date(&payload.period_end);
    let period_type = payload
        .period_type
        .as_ref()
        .and_then(normalize_period_type)
        .unwrap_or_else(|| match (period_start, period_end) {
            (Some(start), Some(end)) => infer_period_type_from_dates(start, end),
            _ => PeriodType::Other,
        });

    let highlights = payload
        .highlights
        .iter()
        .flatten()
        .filter_map(sanitize_highlight)
        .collect();

    let confidence = payload.confidence();
    let notes = ExtractionPayload::text(payload.notes.as_ref());
    let explainer_text =
        ExtractionPayload::text(payload.explainer_text.as_ref()).or_else(|| notes.clone());
    let ytd = payload
        .metadata_value("ytd")
        .filter(|v| !v.is_null())
        .cloned();

    let payslip = NewPayslip {
        user_id: user_id.to_string(),
        file_id: file_id.to_string(),
        employer_name: ExtractionPayload::text(payload.employer_name.as_ref()),
        pay_date,
        period_start,
        period_end,
        period_type: Some(period_type),
        country: payload.country.as_ref().and_then(normalize_country),
        currency,
        gross: fields.gross,
        net: fields.net,
        tax_income: fields.tax_income,
        ni_prsi: fields.ni_prsi,
        pension_employee: fields.pension_employee,
        pension_employer: fields.pension_employer,
        student_loan: fields.student_loan,
        ytd,
        confidence_overall: confidence,
        review_required: review_required(payload.review_flag(), confidence, threshold),
        explainer_text,
    };

    NormalizedExtraction {
        payslip,
        fields,
        highlights,
        confidence,
        notes,
    }
}
