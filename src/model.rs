use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::meta::JobMeta;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Extract,
    DetectAnomalies,
    HrPack,
    Dossier,
    DeleteAll,
    ExportAll,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Extract => "extract",
            JobKind::DetectAnomalies => "detect_anomalies",
            JobKind::HrPack => "hr_pack",
            JobKind::Dossier => "dossier",
            JobKind::DeleteAll => "delete_all",
            JobKind::ExportAll => "export_all",
        }
    }

    pub fn parse_kind(value: &str) -> Option<Self> {
        match value {
            "extract" => Some(JobKind::Extract),
            "detect_anomalies" => Some(JobKind::DetectAnomalies),
            "hr_pack" => Some(JobKind::HrPack),
            "dossier" => Some(JobKind::Dossier),
            "delete_all" => Some(JobKind::DeleteAll),
            "export_all" => Some(JobKind::ExportAll),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    NeedsReview,
    Done,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::NeedsReview => "needs_review",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse_status(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(JobStatus::Queued),
            "running" => Some(JobStatus::Running),
            "needs_review" => Some(JobStatus::NeedsReview),
            "done" => Some(JobStatus::Done),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    /// `done` and `failed` are final for a job id; retries create a new job.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Currency of a payslip. Anything unrecognised is recorded as GBP.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Currency {
    #[default]
    #[serde(rename = "GBP")]
    Gbp,
    #[serde(rename = "EUR")]
    Eur,
}

impl Currency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Currency::Gbp => "GBP",
            Currency::Eur => "EUR",
        }
    }

    pub fn parse_code(value: &str) -> Option<Self> {
        match value {
            "GBP" => Some(Currency::Gbp),
            "EUR" => Some(Currency::Eur),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Country {
    #[serde(rename = "UK")]
    Uk,
    #[serde(rename = "IE")]
    Ie,
}

impl Country {
    pub fn as_str(&self) -> &'static str {
        match self {
            Country::Uk => "UK",
            Country::Ie => "IE",
        }
    }

    pub fn parse_code(value: &str) -> Option<Self> {
        match value {
            "UK" => Some(Country::Uk),
            "IE" => Some(Country::Ie),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PeriodType {
    Monthly,
    Weekly,
    Fortnightly,
    Other,
}

impl PeriodType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeriodType::Monthly => "monthly",
            PeriodType::Weekly => "weekly",
            PeriodType::Fortnightly => "fortnightly",
            PeriodType::Other => "other",
        }
    }

    pub fn parse_type(value: &str) -> Option<Self> {
        match value {
            "monthly" => Some(PeriodType::Monthly),
            "weekly" => Some(PeriodType::Weekly),
            "fortnightly" => Some(PeriodType::Fortnightly),
            "other" => Some(PeriodType::Other),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warn,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warn => "warn",
            Severity::Error => "error",
        }
    }

    pub fn parse_severity(value: &str) -> Option<Self> {
        match value {
            "info" => Some(Severity::Info),
            "warn" => Some(Severity::Warn),
            "error" => Some(Severity::Error),
            _ => None,
        }
    }
}

/// Percentage box over the preview image marking where a field was read.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Highlight {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub label: String,
}

fn null_as_empty<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub user_id: String,
    pub file_id: Option<String>,
    pub kind: JobKind,
    pub status: JobStatus,
    pub meta: JobMeta,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Payslip {
    pub id: String,
    pub user_id: String,
    pub file_id: String,
    pub employer_name: Option<String>,
    pub pay_date: Option<NaiveDate>,
    pub period_start: Option<NaiveDate>,
    pub period_end: Option<NaiveDate>,
    pub period_type: Option<PeriodType>,
    pub country: Option<Country>,
    pub currency: Currency,
    pub gross: Option<f64>,
    pub net: Option<f64>,
    pub tax_income: Option<f64>,
    pub ni_prsi: Option<f64>,
    pub pension_employee: Option<f64>,
    pub pension_employer: Option<f64>,
    pub student_loan: Option<f64>,
    pub ytd: Option<Value>,
    pub confidence_overall: Option<f64>,
    pub review_required: bool,
    pub conflict: bool,
    pub explainer_text: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Anomaly {
    pub id: String,
    pub user_id: String,
    pub payslip_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub severity: Severity,
    pub message: String,
    pub muted: bool,
    pub snoozed_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}
