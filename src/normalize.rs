//! Canonicalisation of loosely typed extraction output.
//!
//! Everything here is total: malformed input degrades to `None`, `GBP` or
//! `PeriodType::Other` and never aborts the pipeline.

use chrono::{DateTime, NaiveDate};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::model::{Country, Currency, Highlight, PeriodType};

static NON_NUMERIC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^0-9.\-]").expect("valid amount pattern"));
static LEADING_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^-?(?:\d+(?:\.\d*)?|\.\d+)").expect("valid number pattern"));

/// Parse a monetary amount from a JSON number or a string such as `"£1,234.50"`.
/// Strings keep only digits, `.` and `-`, then the longest leading number is
/// read, so `"123.45-"` is 123.45 and `"1.2.3"` is 1.2.
pub fn parse_amount(raw: &Value) -> Option<f64> {
    match raw {
        Value::Number(n) => n.as_f64().filter(|v| v.is_finite()),
        Value::String(s) => parse_amount_str(s),
        _ => None,
    }
}

pub fn parse_amount_str(raw: &str) -> Option<f64> {
    let cleaned = NON_NUMERIC.replace_all(raw, "");
    let number = LEADING_NUMBER.find(&cleaned)?;
    number.as_str().parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Percentage in [0, 100], rounded to 4 decimals. Magnitudes up to 1 are taken
/// as fractions.
pub fn normalize_percent(raw: &Value) -> Option<f64> {
    let num = parse_amount(raw)?;
    let scaled = if num.abs() <= 1.0 { num * 100.0 } else { num };
    let bounded = scaled.clamp(0.0, 100.0);
    Some((bounded * 10_000.0).round() / 10_000.0)
}

/// Defaults to GBP for anything that is not clearly euro.
pub fn normalize_currency(raw: &Value) -> Currency {
    let Some(s) = raw.as_str() else {
        return Currency::Gbp;
    };
    match s.trim().to_uppercase().as_str() {
        "EUR" | "€" | "EURO" | "EUROS" => Currency::Eur,
        _ => Currency::Gbp,
    }
}

pub fn normalize_country(raw: &Value) -> Option<Country> {
    let s = raw.as_str()?;
    match s.trim().to_uppercase().as_str() {
        "UK" | "UNITED KINGDOM" | "GB" | "GBR" | "GREAT BRITAIN" => Some(Country::Uk),
        "IE" | "IRELAND" | "IRL" | "EIRE" => Some(Country::Ie),
        _ => None,
    }
}

pub fn normalize_period_type(raw: &Value) -> Option<PeriodType> {
    let s = raw.as_str()?;
    let normalized = s.trim().to_lowercase();
    match normalized.as_str() {
        "" => None,
        "month" | "monthly" => Some(PeriodType::Monthly),
        "week" | "weekly" => Some(PeriodType::Weekly),
        "fortnight" | "fortnightly" | "biweekly" | "bi-weekly" => Some(PeriodType::Fortnightly),
        _ => Some(PeriodType::Other),
    }
}

/// Accepts `YYYY-MM-DD`, RFC 3339 timestamps, and strings starting with an ISO date.
pub fn normalize_date(raw: &Value) -> Option<NaiveDate> {
    parse_date_str(raw.as_str()?)
}

pub fn parse_date_str(raw: &str) -> Option<NaiveDate> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(date);
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.date_naive());
    }
    s.get(..10)
        .and_then(|prefix| NaiveDate::parse_from_str(prefix, "%Y-%m-%d").ok())
}

/// Period type from the inclusive day span between two dates.
pub fn infer_period_type(start: Option<&str>, end: Option<&str>) -> PeriodType {
    let (Some(start), Some(end)) = (start.and_then(parse_date_str), end.and_then(parse_date_str))
    else {
        return PeriodType::Other;
    };
    infer_period_type_from_dates(start, end)
}

pub fn infer_period_type_from_dates(start: NaiveDate, end: NaiveDate) -> PeriodType {
    let days = (end - start).num_days() + 1;
    match days {
        27..=32 => PeriodType::Monthly,
        13..=16 => PeriodType::Fortnightly,
        6..=8 => PeriodType::Weekly,
        _ => PeriodType::Other,
    }
}

/// A highlight box with every coordinate normalised to a percentage. Boxes
/// with any unreadable coordinate are dropped.
pub fn sanitize_highlight(raw: &Value) -> Option<Highlight> {
    let obj = raw.as_object()?;
    let coord = |key: &str| obj.get(key).and_then(normalize_percent);
    Some(Highlight {
        x: coord("x")?,
        y: coord("y")?,
        w: coord("w")?,
        h: coord("h")?,
        label: obj
            .get("label")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    })
}
