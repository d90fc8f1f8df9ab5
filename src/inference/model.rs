use serde::Deserialize;
use serde_json::{Map, Value};

/// Raw document returned by the model for one payslip image.
///
/// Values are kept loosely typed; the worker runs them through
/// [`crate::normalize`] before anything is stored.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct ExtractionPayload {
    #[serde(default)]
    pub fields: Option<Map<String, Value>>,
    #[serde(default)]
    pub highlights: Option<Vec<Value>>,
    #[serde(default)]
    pub confidence: Option<Value>,
    #[serde(default)]
    pub review_required: Option<Value>,
    #[serde(default)]
    pub currency: Option<Value>,
    #[serde(default)]
    pub employer_name: Option<Value>,
    #[serde(default)]
    pub pay_date: Option<Value>,
    #[serde(default)]
    pub period_start: Option<Value>,
    #[serde(default)]
    pub period_end: Option<Value>,
    #[serde(default)]
    pub period_type: Option<Value>,
    #[serde(default)]
    pub country: Option<Value>,
    #[serde(default)]
    pub notes: Option<Value>,
    #[serde(default)]
    pub explainer_text: Option<Value>,
    #[serde(default)]
    pub metadata: Option<Map<String, Value>>,
}

impl ExtractionPayload {
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.as_ref().and_then(|f| f.get(key))
    }

    /// `confidence`, falling back to `metadata.confidence`. Only finite numbers count.
    pub fn confidence(&self) -> Option<f64> {
        let finite = |v: &Value| v.as_f64().filter(|c| c.is_finite());
        self.confidence
            .as_ref()
            .and_then(finite)
            .or_else(|| self.metadata_value("confidence").and_then(finite))
    }

    pub fn review_flag(&self) -> Option<bool> {
        self.review_required.as_ref().and_then(Value::as_bool)
    }

    pub fn metadata_value(&self, key: &str) -> Option<&Value> {
        self.metadata.as_ref().and_then(|m| m.get(key))
    }

    pub fn text(value: Option<&Value>) -> Option<String> {
        value
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }
}

/// Envelope of a `responses` call. The model output sits in one of several
/// places depending on the API version.
#[derive(Debug, Default, Deserialize)]
pub struct ResponsesEnvelope {
    #[serde(default)]
    pub output_text: Option<String>,
    #[serde(default)]
    pub output: Vec<OutputItem>,
    #[serde(default)]
    pub content: Vec<ContentPart>,
    #[serde(default)]
    pub response: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct OutputItem {
    #[serde(default)]
    pub content: Vec<ContentPart>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ContentPart {
    #[serde(default)]
    pub text: Option<String>,
}

impl ResponsesEnvelope {
    pub fn into_text(self) -> Option<String> {
        if let Some(text) = self.output_text.filter(|t| !t.is_empty()) {
            return Some(text);
        }
        self.output
            .into_iter()
            .flat_map(|item| item.content)
            .chain(self.content)
            .find_map(|part| part.text)
            .or(self.response)
    }
}
