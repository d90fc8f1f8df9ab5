//! Insert and view models used by repositories.
//!
//! Keep these structs focused on the data written or returned by queries.
//! Business logic should live in higher layers.

use chrono::NaiveDate;
use serde::Serialize;
use serde_json::Value;

use crate::meta::{ExtractMeta, JobMeta};
use crate::model::{Country, Currency, JobKind, PeriodType, Severity};

/// A job as created by intake or by the worker's follow-up enqueue.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub user_id: String,
    pub file_id: Option<String>,
    pub kind: JobKind,
    pub meta: JobMeta,
}

impl NewJob {
    pub fn extract(user_id: &str, file_id: &str, pdf_password: Option<String>) -> Self {
        Self {
            user_id: user_id.to_string(),
            file_id: Some(file_id.to_string()),
            kind: JobKind::Extract,
            meta: JobMeta::Extract(ExtractMeta {
                pdf_password,
                ..Default::default()
            }),
        }
    }
}

/// Full set of columns written by an extraction upsert.
#[derive(Debug, Clone, Default)]
pub struct NewPayslip {
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
    pub explainer_text: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewAnomaly {
    pub kind: String,
    pub severity: Severity,
    pub message: String,
}

/// Sums over payslips that count towards totals (`conflict = false`).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PayslipTotals {
    pub payslips: i64,
    pub gross: f64,
    pub net: f64,
    pub tax_income: f64,
    pub ni_prsi: f64,
    pub pension_employee: f64,
    pub pension_employer: f64,
    pub student_loan: f64,
}
