//! YAML settings for the worker daemon and the control CLI.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub app: App,
    pub storage: Storage,
    pub inference: InferenceConfig,
    #[serde(default)]
    pub review: Review,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    /// Holds `payslips.db` unless `DATABASE_URL` is set.
    pub data_dir: String,
    pub poll_interval_ms: u64,
    /// `running` jobs untouched for this long are failed.
    pub stale_job_seconds: u64,
}

/// Where rendered previews live.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Storage {
    pub preview_root: String,
}

/// Multimodal model endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InferenceConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub max_output_tokens: u32,
    pub request_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Review {
    /// Extractions below this confidence must be reviewed.
    pub confidence_threshold: f64,
}

impl Default for Review {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.9,
        }
    }
}

impl Config {
    /// Create the data and preview directories.
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        for dir in [&self.app.data_dir, &self.storage.preview_root] {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| format!("sqlite://{}/payslips.db", self.app.data_dir))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.app.poll_interval_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.app.stale_job_seconds)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.inference.request_timeout_seconds)
    }
}

pub fn load(path: &Path) -> Result<Config, ConfigError> {
    let raw = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&raw)?;
    validate(&cfg)?;
    Ok(cfg)
}

fn require(ok: bool, msg: &'static str) -> Result<(), ConfigError> {
    if ok {
        Ok(())
    } else {
        Err(ConfigError::Invalid(msg))
    }
}

fn validate(cfg: &Config) -> Result<(), ConfigError> {
    let filled = |s: &str| !s.trim().is_empty();

    require(filled(&cfg.app.data_dir), "app.data_dir is empty")?;
    require(cfg.app.poll_interval_ms > 0, "app.poll_interval_ms must be positive")?;
    require(filled(&cfg.storage.preview_root), "storage.preview_root is empty")?;

    let inference = &cfg.inference;
    require(filled(&inference.api_key), "inference.api_key is empty")?;
    require(
        reqwest::Url::parse(&inference.base_url).is_ok(),
        "inference.base_url is not an absolute URL",
    )?;
    require(filled(&inference.model), "inference.model is empty")?;
    require(
        inference.max_output_tokens > 0,
        "inference.max_output_tokens must be positive",
    )?;
    require(
        inference.request_timeout_seconds > 0,
        "inference.request_timeout_seconds must be positive",
    )?;
    // The preview fetch and the inference call are each bounded by the request
    // timeout; a live extraction must never look stale.
    require(
        cfg.app.stale_job_seconds > inference.request_timeout_seconds.saturating_mul(2),
        "app.stale_job_seconds must exceed twice inference.request_timeout_seconds",
    )?;

    let threshold = cfg.review.confidence_threshold;
    require(
        threshold > 0.0 && threshold <= 1.0,
        "review.confidence_threshold must be in (0, 1]",
    )
}

/// Sample file printed by `pipeline-ctl example-config`.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  poll_interval_ms: 500
  stale_job_seconds: 300

storage:
  preview_root: "./data/previews"

inference:
  api_key: "YOUR_OPENAI_API_KEY"
  base_url: "https://api.openai.com/"
  model: "gpt-4.1-mini"
  max_output_tokens: 800
  request_timeout_seconds: 60

review:
  confidence_threshold: 0.9
"#
}
