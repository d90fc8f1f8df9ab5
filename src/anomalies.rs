//! Derived payslip warnings and their mute/snooze lifecycle.

use chrono::{DateTime, Duration, Months, NaiveTime, TimeZone, Utc};
use serde_json::Value;
use thiserror::Error;
use tracing::{info, instrument};

use crate::db::{self, NewAnomaly, Pool};
use crate::model::{Anomaly, Payslip, PeriodType, Severity};
use crate::normalize::parse_amount;

/// How many earlier payslips the detectors compare against.
pub const HISTORY_DEPTH: i64 = 5;

const NET_DROP_RATIO: f64 = 0.05;

#[derive(Debug, Error)]
pub enum AnomalyError {
    #[error("anomaly {0} not found")]
    NotFound(String),
    #[error("payslip {0} not found")]
    PayslipMissing(String),
    #[error("snooze must cover at least one period")]
    InvalidPeriods,
    #[error("snooze date is out of range")]
    OutOfRange,
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Shown unless muted or snoozed past `now`.
pub fn is_visible(anomaly: &Anomaly, now: DateTime<Utc>) -> bool {
    !anomaly.muted && anomaly.snoozed_until.map_or(true, |until| until <= now)
}

/// Maps low/medium/high onto the stored severities; unknown labels are info.
pub fn severity_from_label(label: &str) -> Severity {
    match label.trim().to_ascii_lowercase().as_str() {
        "high" | "error" => Severity::Error,
        "medium" | "warn" | "warning" => Severity::Warn,
        _ => Severity::Info,
    }
}

/// Advance the pay date (or `now` when unknown) by `periods` pay periods.
/// Months are calendar months clamped to the last day.
pub fn snooze_until(
    pay_date: Option<chrono::NaiveDate>,
    period_type: Option<PeriodType>,
    periods: u32,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, AnomalyError> {
    if periods == 0 {
        return Err(AnomalyError::InvalidPeriods);
    }
    let base = pay_date
        .map(|d| Utc.from_utc_datetime(&d.and_time(NaiveTime::MIN)))
        .unwrap_or(now);
    let until = match period_type {
        Some(PeriodType::Weekly) => base.checked_add_signed(Duration::days(7 * i64::from(periods))),
        Some(PeriodType::Fortnightly) => {
            base.checked_add_signed(Duration::days(14 * i64::from(periods)))
        }
        _ => base.checked_add_months(Months::new(periods)),
    };
    until.ok_or(AnomalyError::OutOfRange)
}

#[instrument(skip_all, fields(anomaly_id = %anomaly_id))]
pub async fn mute(pool: &Pool, anomaly_id: &str) -> Result<(), AnomalyError> {
    if !db::mute_anomaly(pool, anomaly_id).await? {
        return Err(AnomalyError::NotFound(anomaly_id.to_string()));
    }
    info!("anomaly muted");
    Ok(())
}

#[instrument(skip_all, fields(anomaly_id = %anomaly_id, periods = periods))]
pub async fn snooze(
    pool: &Pool,
    anomaly_id: &str,
    periods: u32,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, AnomalyError> {
    let anomaly = db::fetch_anomaly(pool, anomaly_id)
        .await?
        .ok_or_else(|| AnomalyError::NotFound(anomaly_id.to_string()))?;
    let payslip = db::fetch_payslip(pool, &anomaly.payslip_id)
        .await?
        .ok_or_else(|| AnomalyError::PayslipMissing(anomaly.payslip_id.clone()))?;
    let until = snooze_until(payslip.pay_date, payslip.period_type, periods, now)?;
    if !db::set_anomaly_snooze(pool, anomaly_id, until).await? {
        return Err(AnomalyError::NotFound(anomaly_id.to_string()));
    }
    info!(%until, "anomaly snoozed");
    Ok(until)
}

pub async fn list_visible(
    pool: &Pool,
    user_id: &str,
    now: DateTime<Utc>,
) -> anyhow::Result<Vec<Anomaly>> {
    db::list_visible_anomalies(pool, user_id, now).await
}

// ---------------------------------------------------------------------------
// detectors
// ---------------------------------------------------------------------------

/// Net pay fell by more than 5% against the same employer's previous payslip.
fn detect_net_drop(current: &Payslip, history: &[Payslip]) -> Option<NewAnomaly> {
    let peer = history
        .iter()
        .find(|p| p.employer_name.is_some() && p.employer_name == current.employer_name)?;
    let (previous, now) = (peer.net?, current.net?);
    if previous <= 0.0 {
        return None;
    }
    let drop = (previous - now) / previous;
    (drop > NET_DROP_RATIO).then(|| NewAnomaly {
        kind: "NET_DROP".into(),
        severity: severity_from_label("medium"),
        message: format!(
            "Net pay decreased by {:.1}% compared to previous period.",
            drop * 100.0
        ),
    })
}

fn detect_missing_pension(current: &Payslip, history: &[Payslip]) -> Option<NewAnomaly> {
    let contributing = history
        .iter()
        .filter(|p| p.pension_employee.is_some_and(|v| v > 0.0))
        .count();
    let current_pension = current.pension_employee.unwrap_or(0.0);
    (contributing >= 2 && current_pension == 0.0).then(|| NewAnomaly {
        kind: "MISSING_PENSION".into(),
        severity: severity_from_label("high"),
        message: "Employee pension contributions missing despite previous deductions.".into(),
    })
}

fn ytd_figures(payslip: &Payslip) -> Vec<(String, f64)> {
    match &payslip.ytd {
        Some(Value::Object(map)) => map
            .iter()
            .filter_map(|(k, v)| parse_amount(v).map(|n| (k.clone(), n)))
            .collect(),
        _ => Vec::new(),
    }
}

fn detect_ytd_regression(current: &Payslip, history: &[Payslip]) -> Option<NewAnomaly> {
    let figures = ytd_figures(current);
    for peer in history {
        let Some(Value::Object(previous)) = &peer.ytd else {
            continue;
        };
        for (key, value) in &figures {
            let Some(before) = previous.get(key).and_then(parse_amount) else {
                continue;
            };
            if *value < before {
                return Some(NewAnomaly {
                    kind: "YTD_REGRESSION".into(),
                    severity: severity_from_label("high"),
                    message: format!(
                        "Year-to-date {} decreased from {:.2} to {:.2}.",
                        key, before, value
                    ),
                });
            }
        }
    }
    None
}

/// Run every detector against `history` (earlier payslips, newest first).
pub fn detect_anomalies(current: &Payslip, history: &[Payslip]) -> Vec<NewAnomaly> {
    [
        detect_net_drop(current, history),
        detect_missing_pension(current, history),
        detect_ytd_regression(current, history),
    ]
    .into_iter()
    .flatten()
    .collect()
}
