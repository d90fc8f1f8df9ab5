//! Client for the multimodal model that reads payslip images.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use reqwest::{Client, StatusCode, Url};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::config::InferenceConfig;

pub mod model;

pub use model::ExtractionPayload;
use model::ResponsesEnvelope;

pub const SCHEMA_NAME: &str = "payslip_extraction";

const SYSTEM_PROMPT: &str = "You are an assistant that extracts structured payroll information \
from payslip images. Return clean JSON following the provided schema. Ensure numeric values use \
standard decimals without currency symbols.";

const USER_PROMPT: &str = "Extract the gross pay, net pay, income tax, national insurance or \
PRSI, employee pension, employer pension, student loan, detected currency, employer name, pay \
date, pay period and any helpful notes. Give highlight boxes as percentages of the image. Flag \
review_required if you are uncertain.";

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("Inference request failed: {0}")]
    Transport(String),
    #[error("Inference service returned {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("Inference response did not include JSON output")]
    MissingOutput,
    #[error("Inference output is not a valid extraction: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait InferenceService: Send + Sync {
    async fn extract(&self, image_png: &[u8]) -> Result<ExtractionPayload, InferenceError>;
}

#[derive(Clone)]
pub struct InferenceClient {
    http: Client,
    endpoint: Url,
    api_key: String,
    model: String,
    max_output_tokens: u32,
}

impl fmt::Debug for InferenceClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InferenceClient")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

impl InferenceClient {
    pub fn from_config(cfg: &InferenceConfig) -> anyhow::Result<Self> {
        let base = Url::parse(&cfg.base_url)?;
        Self::new(
            cfg.api_key.clone(),
            base,
            cfg.model.clone(),
            cfg.max_output_tokens,
            Duration::from_secs(cfg.request_timeout_seconds),
        )
    }

    pub fn new(
        api_key: String,
        base_url: Url,
        model: String,
        max_output_tokens: u32,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("payslip-pipeline/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;
        let endpoint = base_url.join("v1/responses")?;
        Ok(Self {
            http,
            endpoint,
            api_key,
            model,
            max_output_tokens,
        })
    }

    pub fn build_request(&self, body: &Value) -> anyhow::Result<reqwest::Request> {
        Ok(self
            .http
            .post(self.endpoint.clone())
            .bearer_auth(&self.api_key)
            .json(body)
            .build()?)
    }
}

#[async_trait]
impl InferenceService for InferenceClient {
    #[instrument(skip_all, fields(model = %self.model, image_size = image_png.len()))]
    async fn extract(&self, image_png: &[u8]) -> Result<ExtractionPayload, InferenceError> {
        let body = build_extraction_request(&self.model, &image_data_url(image_png), self.max_output_tokens);
        let request = self
            .build_request(&body)
            .map_err(|e| InferenceError::Transport(e.to_string()))?;
        let res = self
            .http
            .execute(request)
            .await
            .map_err(|e| InferenceError::Transport(e.to_string()))?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            warn!(%status, "inference call rejected");
            return Err(InferenceError::Status { status, body });
        }
        let text = res
            .text()
            .await
            .map_err(|e| InferenceError::Transport(e.to_string()))?;
        let payload = parse_response_payload(&text)?;
        info!(confidence = ?payload.confidence(), "inference call complete");
        Ok(payload)
    }
}

pub fn image_data_url(png: &[u8]) -> String {
    format!(
        "data:image/png;base64,{}",
        base64::engine::general_purpose::STANDARD.encode(png)
    )
}

fn loose_number() -> Value {
    json!({ "type": ["number", "string", "null"] })
}

fn nullable_string() -> Value {
    json!({ "type": ["string", "null"] })
}

/// JSON schema the model is asked to follow.
pub fn extraction_schema() -> Value {
    json!({
        "type": "object",
        "additionalProperties": false,
        "properties": {
            "fields": {
                "type": "object",
                "additionalProperties": false,
                "properties": {
                    "gross": loose_number(),
                    "net": loose_number(),
                    "tax_income": loose_number(),
                    "ni_prsi": loose_number(),
                    "pension_employee": loose_number(),
                    "pension_employer": loose_number(),
                    "student_loan": loose_number(),
                    "currency": nullable_string(),
                },
                "required": [],
            },
            "highlights": {
                "type": "array",
                "items": {
                    "type": "object",
                    "additionalProperties": false,
                    "properties": {
                        "x": { "type": ["number", "string"] },
                        "y": { "type": ["number", "string"] },
                        "w": { "type": ["number", "string"] },
                        "h": { "type": ["number", "string"] },
                        "label": nullable_string(),
                    },
                    "required": ["x", "y", "w", "h"],
                },
            },
            "confidence": { "type": ["number", "null"] },
            "review_required": { "type": ["boolean", "null"] },
            "employer_name": nullable_string(),
            "pay_date": nullable_string(),
            "period_start": nullable_string(),
            "period_end": nullable_string(),
            "period_type": nullable_string(),
            "country": nullable_string(),
            "currency": nullable_string(),
            "notes": nullable_string(),
            "explainer_text": nullable_string(),
            "metadata": { "type": ["object", "null"] },
        },
    })
}

pub fn build_extraction_request(model: &str, image_url: &str, max_output_tokens: u32) -> Value {
    json!({
        "model": model,
        "input": [
            {
                "role": "system",
                "content": [{ "type": "input_text", "text": SYSTEM_PROMPT }],
            },
            {
                "role": "user",
                "content": [
                    { "type": "input_text", "text": USER_PROMPT },
                    { "type": "input_image", "image_url": image_url },
                ],
            },
        ],
        "text": {
            "format": {
                "type": "json_schema",
                "name": SCHEMA_NAME,
                "schema": extraction_schema(),
            },
        },
        "max_output_tokens": max_output_tokens,
    })
}

/// Pull the model's JSON document out of a `responses` body and decode it.
pub fn parse_response_payload(body: &str) -> Result<ExtractionPayload, InferenceError> {
    let envelope: ResponsesEnvelope =
        serde_json::from_str(body).map_err(|e| InferenceError::Malformed(e.to_string()))?;
    let text = envelope.into_text().ok_or(InferenceError::MissingOutput)?;
    let value: Value =
        serde_json::from_str(&text).map_err(|e| InferenceError::Malformed(e.to_string()))?;
    if !value.is_object() {
        return Err(InferenceError::Malformed("expected a JSON object".into()));
    }
    serde_json::from_value(value).map_err(|e| InferenceError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wrap(text: &str) -> String {
        json!({ "output": [{ "type": "message", "content": [{ "type": "output_text", "text": text }] }] })
            .to_string()
    }

    #[test]
    fn request_carries_image_and_schema() {
        let url = image_data_url(b"\x89PNG");
        assert!(url.starts_with("data:image/png;base64,"));
        let body = build_extraction_request("gpt-4.1-mini", &url, 800);
        assert_eq!(body["text"]["format"]["name"], SCHEMA_NAME);
        assert_eq!(body["input"][1]["content"][1]["image_url"], json!(url));
        assert_eq!(body["max_output_tokens"], 800);
        assert!(body["text"]["format"]["schema"]["properties"]["fields"]["properties"]
            .get("ni_prsi")
            .is_some());
    }

    #[test]
    fn parses_nested_output_text() {
        let payload =
            parse_response_payload(&wrap(r#"{"fields":{"gross":"2,500.00"},"confidence":0.93}"#))
                .unwrap();
        assert_eq!(payload.confidence(), Some(0.93));
        assert_eq!(payload.field("gross"), Some(&json!("2,500.00")));
    }

    #[test]
    fn confidence_falls_back_to_metadata() {
        let payload =
            parse_response_payload(&wrap(r#"{"metadata":{"confidence":0.7,"ytd":{"gross":9000}}}"#))
                .unwrap();
        assert_eq!(payload.confidence(), Some(0.7));
        let payload = parse_response_payload(&wrap(r#"{"confidence":"high"}"#)).unwrap();
        assert_eq!(payload.confidence(), None);
    }

    #[test]
    fn top_level_output_text_wins() {
        let body = json!({ "output_text": "{\"notes\":\"ok\"}", "output": [] }).to_string();
        let payload = parse_response_payload(&body).unwrap();
        assert_eq!(ExtractionPayload::text(payload.notes.as_ref()).as_deref(), Some("ok"));
    }

    #[test]
    fn rejects_missing_or_invalid_output() {
        assert!(matches!(
            parse_response_payload(r#"{"output":[]}"#),
            Err(InferenceError::MissingOutput)
        ));
        assert!(matches!(
            parse_response_payload(&wrap("not json")),
            Err(InferenceError::Malformed(_))
        ));
        assert!(matches!(
            parse_response_payload(&wrap("[1,2]")),
            Err(InferenceError::Malformed(_))
        ));
        assert!(matches!(
            parse_response_payload(&wrap(r#"{"fields":"gross=1"}"#)),
            Err(InferenceError::Malformed(_))
        ));
    }
}
