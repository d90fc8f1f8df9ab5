//! Typed job metadata.
//!
//! The `jobs.meta` column is an open JSON document. It is decoded into the shape
//! that belongs to the job's kind; every shape keeps keys it does not know about
//! in a flattened map so a decode/encode cycle never loses data written by other
//! components.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::model::{Country, Currency, Highlight, JobKind, PeriodType};

/// Amounts recorded in `meta.fields` by the worker and amended by review.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExtractedFields {
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
    #[serde(default)]
    pub pension_employer: Option<f64>,
    #[serde(default)]
    pub student_loan: Option<f64>,
    #[serde(default)]
    pub currency: Option<Currency>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExtractMeta {
    #[serde(rename = "pdfPassword", default, skip_serializing_if = "Option::is_none")]
    pub pdf_password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<ExtractedFields>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(rename = "reviewRequired", default, skip_serializing_if = "Option::is_none")]
    pub review_required: Option<bool>,
    #[serde(rename = "imageUrl", default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub highlights: Option<Vec<Highlight>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub employer_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pay_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period_start: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period_end: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period_type: Option<PeriodType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<Country>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Metadata of a `detect_anomalies` job.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AnomalyJobMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payslip_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

const EXTRACT_KEYS: &[&str] = &[
    "pdfPassword",
    "fields",
    "confidence",
    "reviewRequired",
    "imageUrl",
    "highlights",
    "employer_name",
    "pay_date",
    "period_start",
    "period_end",
    "period_type",
    "country",
    "notes",
];

/// Written at intake; the worker never rewrites them.
const INTAKE_KEYS: &[&str] = &["pdfPassword"];

const ANOMALY_JOB_KEYS: &[&str] = &["source_job_id", "payslip_id", "count"];

// Typed fields serialize before the flattened map, so a stale copy of a typed
// key left in `extra` would shadow the fresh value.
fn without_keys(mut map: Map<String, Value>, keys: &[&str]) -> Map<String, Value> {
    for key in keys {
        map.remove(*key);
    }
    map
}

/// Decode extraction keys one at a time so a single mistyped value does not
/// take the rest down. A mistyped key the worker rewrites is dropped; a mistyped
/// intake key stays raw in `extra` so it is written back unchanged.
fn salvage_extract(map: Map<String, Value>) -> ExtractMeta {
    let mut typed = Map::new();
    let mut raw = Map::new();
    for (key, value) in map {
        if !EXTRACT_KEYS.contains(&key.as_str()) {
            raw.insert(key, value);
            continue;
        }
        let mut single = Map::new();
        single.insert(key.clone(), value.clone());
        if serde_json::from_value::<ExtractMeta>(Value::Object(single)).is_ok() {
            typed.insert(key, value);
        } else if INTAKE_KEYS.contains(&key.as_str()) {
            raw.insert(key, value);
        } else {
            warn!(key = %key, "dropping mistyped extraction meta value");
        }
    }
    let mut meta: ExtractMeta = serde_json::from_value(Value::Object(typed)).unwrap_or_default();
    meta.extra.extend(raw);
    meta
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobMeta {
    Extract(ExtractMeta),
    DetectAnomalies(AnomalyJobMeta),
    /// Kinds without a dedicated shape, and documents that failed to decode.
    Other(Map<String, Value>),
}

impl Default for JobMeta {
    fn default() -> Self {
        JobMeta::Other(Map::new())
    }
}

impl JobMeta {
    pub fn empty_for(kind: JobKind) -> Self {
        match kind {
            JobKind::Extract => JobMeta::Extract(ExtractMeta::default()),
            JobKind::DetectAnomalies => JobMeta::DetectAnomalies(AnomalyJobMeta::default()),
            _ => JobMeta::Other(Map::new()),
        }
    }

    /// Decode the stored document for `kind`. A document that does not fit the
    /// kind's shape is kept verbatim as `Other` rather than rejected.
    pub fn decode(kind: JobKind, raw: &str) -> Self {
        let value: Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(err) => {
                warn!(?err, kind = kind.as_str(), "job meta is not valid JSON");
                return JobMeta::empty_for(kind);
            }
        };
        Self::from_value(kind, value)
    }

    pub fn from_value(kind: JobKind, value: Value) -> Self {
        let map = match value {
            Value::Object(map) => map,
            Value::Null => return JobMeta::empty_for(kind),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                return JobMeta::Other(map);
            }
        };
        let typed = match kind {
            JobKind::Extract => {
                serde_json::from_value::<ExtractMeta>(Value::Object(map.clone())).map(JobMeta::Extract)
            }
            JobKind::DetectAnomalies => serde_json::from_value::<AnomalyJobMeta>(Value::Object(
                map.clone(),
            ))
            .map(JobMeta::DetectAnomalies),
            _ => return JobMeta::Other(map),
        };
        match typed {
            Ok(meta) => meta,
            Err(err) => {
                warn!(?err, kind = kind.as_str(), "job meta does not match its kind; keeping raw");
                JobMeta::Other(map)
            }
        }
    }

    pub fn to_value(&self) -> serde_json::Result<Value> {
        match self {
            JobMeta::Extract(m) => serde_json::to_value(m),
            JobMeta::DetectAnomalies(m) => serde_json::to_value(m),
            JobMeta::Other(map) => Ok(Value::Object(map.clone())),
        }
    }

    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.to_value()?)
    }

    pub fn as_extract(&self) -> Option<&ExtractMeta> {
        match self {
            JobMeta::Extract(m) => Some(m),
            _ => None,
        }
    }

    /// View any metadata as extraction metadata, carrying unrelated keys along.
    pub fn into_extract(self) -> ExtractMeta {
        match self {
            JobMeta::Extract(m) => m,
            JobMeta::DetectAnomalies(m) => ExtractMeta {
                extra: match serde_json::to_value(m) {
                    Ok(Value::Object(map)) => map,
                    _ => Map::new(),
                },
                ..Default::default()
            },
            JobMeta::Other(map) => serde_json::from_value(Value::Object(map.clone()))
                .unwrap_or_else(|_| salvage_extract(map)),
        }
    }

    pub fn into_anomaly_job(self) -> AnomalyJobMeta {
        match self {
            JobMeta::DetectAnomalies(m) => m,
            JobMeta::Extract(m) => AnomalyJobMeta {
                extra: match serde_json::to_value(m) {
                    Ok(Value::Object(map)) => map,
                    _ => Map::new(),
                },
                ..Default::default()
            },
            JobMeta::Other(map) => serde_json::from_value(Value::Object(map.clone()))
                .unwrap_or_else(|_| AnomalyJobMeta {
                    extra: without_keys(map, ANOMALY_JOB_KEYS),
                    ..Default::default()
                }),
        }
    }
}
