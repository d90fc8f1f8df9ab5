use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, Transaction};
use sqlx::{Sqlite, SqlitePool};
use std::str::FromStr;
use tracing::instrument;
use uuid::Uuid;

use super::model::{NewAnomaly, NewJob, NewPayslip, PayslipTotals};
use crate::meta::JobMeta;
use crate::model::{
    Anomaly, Country, Currency, Job, JobKind, JobStatus, Payslip, PeriodType, Severity,
};
use crate::review::ReviewFields;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let url = resolve_sqlite_url(database_url);
    let options = SqliteConnectOptions::from_str(&url)
        .with_context(|| format!("invalid database url {}", url))?
        .create_if_missing(true)
        // Applied on every pooled connection.
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full);
    let pool = SqlitePoolOptions::new().connect_with(options).await?;
    Ok(pool)
}

/// Expand `~/` in a file-backed sqlite URL and create its parent directory.
/// In-memory URLs pass through.
fn resolve_sqlite_url(url: &str) -> String {
    let Some(rest) = url.strip_prefix("sqlite:") else {
        return url.to_string();
    };
    if rest.starts_with(":memory") {
        return url.to_string();
    }
    let rest = rest.strip_prefix("//").unwrap_or(rest);
    let (path, query) = rest.split_once('?').unwrap_or((rest, ""));
    if path.is_empty() {
        return url.to_string();
    }

    let path = match (path.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(tail), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), tail),
        _ => path.to_string(),
    };
    if let Some(dir) = std::path::Path::new(&path).parent().filter(|d| !d.as_os_str().is_empty()) {
        let _ = std::fs::create_dir_all(dir);
    }

    if query.is_empty() {
        format!("sqlite://{}", path)
    } else {
        format!("sqlite://{}?{}", path, query)
    }
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Fixed-width UTC timestamps so that SQL string comparison orders them.
pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .with_context(|| format!("invalid stored timestamp {}", raw))
}

// ---------------------------------------------------------------------------
// jobs
// ---------------------------------------------------------------------------

#[instrument(skip_all)]
pub async fn insert_job(pool: &Pool, job: &NewJob) -> Result<String> {
    let mut tx = pool.begin().await?;
    let id = insert_job_tx(&mut tx, job, Utc::now()).await?;
    tx.commit().await?;
    Ok(id)
}

pub async fn insert_job_tx(
    tx: &mut Transaction<'_, Sqlite>,
    job: &NewJob,
    now: DateTime<Utc>,
) -> Result<String> {
    let id = Uuid::new_v4().to_string();
    let meta = job.meta.encode().context("failed to encode job meta")?;
    let now = timestamp(now);
    sqlx::query(
        "INSERT INTO jobs (id, user_id, file_id, kind, status, meta, error, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, NULL, ?, ?)",
    )
    .bind(&id)
    .bind(&job.user_id)
    .bind(job.file_id.as_deref())
    .bind(job.kind.as_str())
    .bind(JobStatus::Queued.as_str())
    .bind(meta)
    .bind(&now)
    .bind(&now)
    .execute(&mut **tx)
    .await?;
    Ok(id)
}

fn job_from_row(row: &SqliteRow) -> Result<Job> {
    let id: String = row.try_get("id")?;
    let kind_str: String = row.try_get("kind")?;
    let kind = JobKind::parse_kind(&kind_str)
        .ok_or_else(|| anyhow!("job {} has unknown kind {}", id, kind_str))?;
    let status_str: String = row.try_get("status")?;
    let status = JobStatus::parse_status(&status_str)
        .ok_or_else(|| anyhow!("job {} has unknown status {}", id, status_str))?;
    let meta_raw: Option<String> = row.try_get("meta")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;
    Ok(Job {
        user_id: row.try_get("user_id")?,
        file_id: row.try_get("file_id")?,
        kind,
        status,
        meta: JobMeta::decode(kind, meta_raw.as_deref().unwrap_or("{}")),
        error: row.try_get("error")?,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
        id,
    })
}

const JOB_COLUMNS: &str =
    "id, user_id, file_id, kind, status, meta, error, created_at, updated_at";

#[instrument(skip_all)]
pub async fn fetch_job(pool: &Pool, job_id: &str) -> Result<Option<Job>> {
    let row = sqlx::query(&format!("SELECT {} FROM jobs WHERE id = ?", JOB_COLUMNS))
        .bind(job_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(job_from_row).transpose()
}

pub async fn fetch_job_tx(tx: &mut Transaction<'_, Sqlite>, job_id: &str) -> Result<Option<Job>> {
    let row = sqlx::query(&format!("SELECT {} FROM jobs WHERE id = ?", JOB_COLUMNS))
        .bind(job_id)
        .fetch_optional(&mut **tx)
        .await?;
    row.as_ref().map(job_from_row).transpose()
}

#[instrument(skip_all)]
pub async fn list_jobs(pool: &Pool, user_id: &str) -> Result<Vec<Job>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM jobs WHERE user_id = ? ORDER BY created_at DESC",
        JOB_COLUMNS
    ))
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(job_from_row).collect()
}

/// Oldest queued job, if any.
#[instrument(skip_all)]
pub async fn next_queued_job_id(pool: &Pool) -> Result<Option<String>> {
    let id = sqlx::query_scalar::<_, String>(
        "SELECT id FROM jobs WHERE status = ? ORDER BY created_at ASC, rowid ASC LIMIT 1",
    )
    .bind(JobStatus::Queued.as_str())
    .fetch_optional(pool)
    .await?;
    Ok(id)
}

/// Conditional status update: applies only while the row is still in `from`.
/// `meta` replaces the stored document when given; `error` is always written.
/// Returns whether a row was updated.
#[instrument(skip_all)]
pub async fn compare_and_set_job_status(
    pool: &Pool,
    job_id: &str,
    from: JobStatus,
    to: JobStatus,
    meta: Option<&str>,
    error: Option<&str>,
) -> Result<bool> {
    let mut tx = pool.begin().await?;
    let updated =
        compare_and_set_job_status_tx(&mut tx, job_id, from, to, meta, error, Utc::now()).await?;
    tx.commit().await?;
    Ok(updated)
}

pub async fn compare_and_set_job_status_tx(
    tx: &mut Transaction<'_, Sqlite>,
    job_id: &str,
    from: JobStatus,
    to: JobStatus,
    meta: Option<&str>,
    error: Option<&str>,
    now: DateTime<Utc>,
) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE jobs SET status = ?, meta = COALESCE(?, meta), error = ?, updated_at = ? \
         WHERE id = ? AND status = ?",
    )
    .bind(to.as_str())
    .bind(meta)
    .bind(error)
    .bind(timestamp(now))
    .bind(job_id)
    .bind(from.as_str())
    .execute(&mut **tx)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// Refresh `updated_at` of a job that is still `running`. Returns false once
/// the job has left `running`.
#[instrument(skip_all)]
pub async fn touch_running_job(pool: &Pool, job_id: &str, now: DateTime<Utc>) -> Result<bool> {
    let res = sqlx::query("UPDATE jobs SET updated_at = ? WHERE id = ? AND status = ?")
        .bind(timestamp(now))
        .bind(job_id)
        .bind(JobStatus::Running.as_str())
        .execute(pool)
        .await?;
    Ok(res.rows_affected() == 1)
}

#[instrument(skip_all)]
pub async fn stale_running_job_ids(pool: &Pool, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
    let ids = sqlx::query_scalar::<_, String>(
        "SELECT id FROM jobs WHERE status = ? AND updated_at < ? ORDER BY updated_at ASC",
    )
    .bind(JobStatus::Running.as_str())
    .bind(timestamp(cutoff))
    .fetch_all(pool)
    .await?;
    Ok(ids)
}

// ---------------------------------------------------------------------------
// payslips
// ---------------------------------------------------------------------------

const PAYSLIP_COLUMNS: &str = "id, user_id, file_id, employer_name, pay_date, period_start, \
     period_end, period_type, country, currency, gross, net, tax_income, ni_prsi, \
     pension_employee, pension_employer, student_loan, ytd, confidence_overall, \
     review_required, conflict, explainer_text, created_at, updated_at";

fn payslip_from_row(row: &SqliteRow) -> Result<Payslip> {
    let currency: Option<String> = row.try_get("currency")?;
    let period_type: Option<String> = row.try_get("period_type")?;
    let country: Option<String> = row.try_get("country")?;
    let ytd: Option<String> = row.try_get("ytd")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;
    Ok(Payslip {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        file_id: row.try_get("file_id")?,
        employer_name: row.try_get("employer_name")?,
        pay_date: row.try_get("pay_date")?,
        period_start: row.try_get("period_start")?,
        period_end: row.try_get("period_end")?,
        period_type: period_type.as_deref().and_then(PeriodType::parse_type),
        country: country.as_deref().and_then(Country::parse_code),
        currency: currency
            .as_deref()
            .and_then(Currency::parse_code)
            .unwrap_or_default(),
        gross: row.try_get("gross")?,
        net: row.try_get("net")?,
        tax_income: row.try_get("tax_income")?,
        ni_prsi: row.try_get("ni_prsi")?,
        pension_employee: row.try_get("pension_employee")?,
        pension_employer: row.try_get("pension_employer")?,
        student_loan: row.try_get("student_loan")?,
        ytd: ytd.as_deref().and_then(|s| serde_json::from_str(s).ok()),
        confidence_overall: row.try_get("confidence_overall")?,
        review_required: row.try_get("review_required")?,
        conflict: row.try_get("conflict")?,
        explainer_text: row.try_get("explainer_text")?,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

/// Insert or overwrite the payslip for `file_id`; the latest extraction wins and
/// the row re-enters totals (`conflict = false`). Returns the row id, which is
/// stable across overwrites.
#[instrument(skip_all)]
pub async fn upsert_payslip(pool: &Pool, payslip: &NewPayslip) -> Result<String> {
    let mut tx = pool.begin().await?;
    let id = upsert_payslip_tx(&mut tx, payslip, Utc::now()).await?;
    tx.commit().await?;
    Ok(id)
}

pub async fn upsert_payslip_tx(
    tx: &mut Transaction<'_, Sqlite>,
    p: &NewPayslip,
    now: DateTime<Utc>,
) -> Result<String> {
    let now = timestamp(now);
    let ytd = p
        .ytd
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .context("failed to encode ytd")?;
    let id: String = sqlx::query_scalar(
        "INSERT INTO payslips (id, user_id, file_id, employer_name, pay_date, period_start, \
             period_end, period_type, country, currency, gross, net, tax_income, ni_prsi, \
             pension_employee, pension_employer, student_loan, ytd, confidence_overall, \
             review_required, conflict, explainer_text, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?) \
         ON CONFLICT(file_id) DO UPDATE SET \
             user_id = excluded.user_id, \
             employer_name = excluded.employer_name, \
             pay_date = excluded.pay_date, \
             period_start = excluded.period_start, \
             period_end = excluded.period_end, \
             period_type = excluded.period_type, \
             country = excluded.country, \
             currency = excluded.currency, \
             gross = excluded.gross, \
             net = excluded.net, \
             tax_income = excluded.tax_income, \
             ni_prsi = excluded.ni_prsi, \
             pension_employee = excluded.pension_employee, \
             pension_employer = excluded.pension_employer, \
             student_loan = excluded.student_loan, \
             ytd = excluded.ytd, \
             confidence_overall = excluded.confidence_overall, \
             review_required = excluded.review_required, \
             conflict = 0, \
             explainer_text = excluded.explainer_text, \
             updated_at = excluded.updated_at \
         RETURNING id",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(&p.user_id)
    .bind(&p.file_id)
    .bind(p.employer_name.as_deref())
    .bind(p.pay_date)
    .bind(p.period_start)
    .bind(p.period_end)
    .bind(p.period_type.map(|t| t.as_str()))
    .bind(p.country.map(|c| c.as_str()))
    .bind(p.currency.as_str())
    .bind(p.gross)
    .bind(p.net)
    .bind(p.tax_income)
    .bind(p.ni_prsi)
    .bind(p.pension_employee)
    .bind(p.pension_employer)
    .bind(p.student_loan)
    .bind(ytd)
    .bind(p.confidence_overall)
    .bind(p.review_required)
    .bind(p.explainer_text.as_deref())
    .bind(&now)
    .bind(&now)
    .fetch_one(&mut **tx)
    .await?;
    Ok(id)
}

#[instrument(skip_all)]
pub async fn fetch_payslip(pool: &Pool, payslip_id: &str) -> Result<Option<Payslip>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM payslips WHERE id = ?",
        PAYSLIP_COLUMNS
    ))
    .bind(payslip_id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(payslip_from_row).transpose()
}

#[instrument(skip_all)]
pub async fn fetch_payslip_by_file(pool: &Pool, file_id: &str) -> Result<Option<Payslip>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM payslips WHERE file_id = ?",
        PAYSLIP_COLUMNS
    ))
    .bind(file_id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(payslip_from_row).transpose()
}

pub async fn fetch_payslip_by_file_tx(
    tx: &mut Transaction<'_, Sqlite>,
    file_id: &str,
) -> Result<Option<Payslip>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM payslips WHERE file_id = ?",
        PAYSLIP_COLUMNS
    ))
    .bind(file_id)
    .fetch_optional(&mut **tx)
    .await?;
    row.as_ref().map(payslip_from_row).transpose()
}

/// All payslips of a user, conflicted or not, newest pay date first.
#[instrument(skip_all)]
pub async fn list_payslips(pool: &Pool, user_id: &str) -> Result<Vec<Payslip>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM payslips WHERE user_id = ? ORDER BY pay_date DESC, created_at DESC",
        PAYSLIP_COLUMNS
    ))
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(payslip_from_row).collect()
}

/// Up to `limit` payslips of the same user created no later than `before`,
/// newest first, excluding `exclude_id`.
#[instrument(skip_all)]
pub async fn payslip_history(
    pool: &Pool,
    user_id: &str,
    before: DateTime<Utc>,
    exclude_id: &str,
    limit: i64,
) -> Result<Vec<Payslip>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM payslips WHERE user_id = ? AND id != ? AND created_at <= ? \
         ORDER BY created_at DESC, rowid DESC LIMIT ?",
        PAYSLIP_COLUMNS
    ))
    .bind(user_id)
    .bind(exclude_id)
    .bind(timestamp(before))
    .bind(limit)
    .fetch_all(pool)
    .await?;
    rows.iter().map(payslip_from_row).collect()
}

/// Overwrite the reviewed amounts. Absent values become NULL. Idempotent.
pub async fn apply_review_tx(
    tx: &mut Transaction<'_, Sqlite>,
    payslip_id: &str,
    fields: &ReviewFields,
    confidence: Option<f64>,
    now: DateTime<Utc>,
) -> Result<()> {
    let res = sqlx::query(
        "UPDATE payslips SET gross = ?, net = ?, tax_income = ?, ni_prsi = ?, \
             pension_employee = ?, review_required = 0, confidence_overall = ?, updated_at = ? \
         WHERE id = ?",
    )
    .bind(fields.gross)
    .bind(fields.net)
    .bind(fields.tax_income)
    .bind(fields.ni_prsi)
    .bind(fields.pension_employee)
    .bind(confidence)
    .bind(timestamp(now))
    .bind(payslip_id)
    .execute(&mut **tx)
    .await?;
    if res.rows_affected() == 0 {
        return Err(anyhow!("payslip {} not found", payslip_id));
    }
    Ok(())
}

#[instrument(skip_all)]
pub async fn set_payslip_conflict(pool: &Pool, payslip_id: &str, conflict: bool) -> Result<()> {
    let res = sqlx::query("UPDATE payslips SET conflict = ?, updated_at = ? WHERE id = ?")
        .bind(conflict)
        .bind(timestamp(Utc::now()))
        .bind(payslip_id)
        .execute(pool)
        .await
        .with_context(|| format!("failed to flag payslip {}", payslip_id))?;
    if res.rows_affected() == 0 {
        return Err(anyhow!("payslip {} not found", payslip_id));
    }
    Ok(())
}

#[instrument(skip_all)]
pub async fn sum_included_payslips(pool: &Pool, user_id: &str) -> Result<PayslipTotals> {
    let row = sqlx::query(
        "SELECT COUNT(*) AS payslips, TOTAL(gross) AS gross, TOTAL(net) AS net, \
             TOTAL(tax_income) AS tax_income, TOTAL(ni_prsi) AS ni_prsi, \
             TOTAL(pension_employee) AS pension_employee, \
             TOTAL(pension_employer) AS pension_employer, TOTAL(student_loan) AS student_loan \
         FROM payslips WHERE user_id = ? AND conflict = 0",
    )
    .bind(user_id)
    .fetch_one(pool)
    .await?;
    Ok(PayslipTotals {
        payslips: row.try_get("payslips")?,
        gross: row.try_get("gross")?,
        net: row.try_get("net")?,
        tax_income: row.try_get("tax_income")?,
        ni_prsi: row.try_get("ni_prsi")?,
        pension_employee: row.try_get("pension_employee")?,
        pension_employer: row.try_get("pension_employer")?,
        student_loan: row.try_get("student_loan")?,
    })
}

// ---------------------------------------------------------------------------
// anomalies
// ---------------------------------------------------------------------------

const ANOMALY_COLUMNS: &str =
    "id, user_id, payslip_id, type, severity, message, muted, snoozed_until, created_at";

fn anomaly_from_row(row: &SqliteRow) -> Result<Anomaly> {
    let id: String = row.try_get("id")?;
    let severity: String = row.try_get("severity")?;
    let snoozed_until: Option<String> = row.try_get("snoozed_until")?;
    let created_at: String = row.try_get("created_at")?;
    Ok(Anomaly {
        user_id: row.try_get("user_id")?,
        payslip_id: row.try_get("payslip_id")?,
        kind: row.try_get("type")?,
        severity: Severity::parse_severity(&severity)
            .ok_or_else(|| anyhow!("anomaly {} has unknown severity {}", id, severity))?,
        message: row.try_get("message")?,
        muted: row.try_get("muted")?,
        snoozed_until: snoozed_until.as_deref().map(parse_timestamp).transpose()?,
        created_at: parse_timestamp(&created_at)?,
        id,
    })
}

#[instrument(skip_all)]
pub async fn insert_anomaly(
    pool: &Pool,
    user_id: &str,
    payslip_id: &str,
    anomaly: &NewAnomaly,
) -> Result<String> {
    let mut tx = pool.begin().await?;
    let id = insert_anomaly_tx(&mut tx, user_id, payslip_id, anomaly, Utc::now()).await?;
    tx.commit().await?;
    Ok(id)
}

pub async fn insert_anomaly_tx(
    tx: &mut Transaction<'_, Sqlite>,
    user_id: &str,
    payslip_id: &str,
    anomaly: &NewAnomaly,
    now: DateTime<Utc>,
) -> Result<String> {
    let id = Uuid::new_v4().to_string();
    sqlx::query(
        "INSERT INTO anomalies (id, user_id, payslip_id, type, severity, message, muted, snoozed_until, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, 0, NULL, ?)",
    )
    .bind(&id)
    .bind(user_id)
    .bind(payslip_id)
    .bind(&anomaly.kind)
    .bind(anomaly.severity.as_str())
    .bind(&anomaly.message)
    .bind(timestamp(now))
    .execute(&mut **tx)
    .await?;
    Ok(id)
}

#[instrument(skip_all)]
pub async fn fetch_anomaly(pool: &Pool, anomaly_id: &str) -> Result<Option<Anomaly>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM anomalies WHERE id = ?",
        ANOMALY_COLUMNS
    ))
    .bind(anomaly_id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(anomaly_from_row).transpose()
}

/// Returns false when no such anomaly exists.
#[instrument(skip_all)]
pub async fn mute_anomaly(pool: &Pool, anomaly_id: &str) -> Result<bool> {
    let res = sqlx::query("UPDATE anomalies SET muted = 1 WHERE id = ?")
        .bind(anomaly_id)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() > 0)
}

#[instrument(skip_all)]
pub async fn set_anomaly_snooze(
    pool: &Pool,
    anomaly_id: &str,
    until: DateTime<Utc>,
) -> Result<bool> {
    let res = sqlx::query("UPDATE anomalies SET snoozed_until = ? WHERE id = ?")
        .bind(timestamp(until))
        .bind(anomaly_id)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() > 0)
}

/// Anomalies that are neither muted nor snoozed past `now`.
#[instrument(skip_all)]
pub async fn list_visible_anomalies(
    pool: &Pool,
    user_id: &str,
    now: DateTime<Utc>,
) -> Result<Vec<Anomaly>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM anomalies \
         WHERE user_id = ? AND muted = 0 AND (snoozed_until IS NULL OR snoozed_until <= ?) \
         ORDER BY created_at DESC",
        ANOMALY_COLUMNS
    ))
    .bind(user_id)
    .bind(timestamp(now))
    .fetch_all(pool)
    .await?;
    rows.iter().map(anomaly_from_row).collect()
}

#[instrument(skip_all)]
pub async fn list_anomalies_for_payslip(pool: &Pool, payslip_id: &str) -> Result<Vec<Anomaly>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM anomalies WHERE payslip_id = ? ORDER BY created_at ASC",
        ANOMALY_COLUMNS
    ))
    .bind(payslip_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(anomaly_from_row).collect()
}
