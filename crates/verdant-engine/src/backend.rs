use std::fmt;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Map, Value};
use verdant_contracts::errors::{classify_message, ErrorKind};

use crate::config::PipelineConfig;

const HARM_CATEGORIES: &[&str] = &[
    "HARM_CATEGORY_HARASSMENT",
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_SEXUALLY_EXPLICIT",
    "HARM_CATEGORY_DANGEROUS_CONTENT",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Model,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Model => "model",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ContentPart {
    Text(String),
    InlineImage { mime_type: String, data: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContentTurn {
    pub role: Role,
    pub parts: Vec<ContentPart>,
}

impl ContentTurn {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            parts: vec![ContentPart::Text(text.into())],
        }
    }

    pub fn model_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::Model,
            parts: vec![ContentPart::Text(text.into())],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationConfig {
    pub temperature: f64,
    pub top_k: u32,
    pub top_p: f64,
    pub max_output_tokens: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerateRequest {
    pub model: String,
    pub turns: Vec<ContentTurn>,
    pub generation: Option<GenerationConfig>,
}

/// One round trip to a text-generating model. Implementations return the
/// model's raw reply text; interpreting it is the caller's job.
pub trait GenerativeBackend: Send {
    fn name(&self) -> &str;
    fn generate(&self, request: &GenerateRequest) -> Result<String>;
}

pub struct GeminiBackend {
    api_base: String,
    api_key: String,
    http: HttpClient,
}

impl GeminiBackend {
    pub fn new(config: &PipelineConfig, api_key: impl Into<String>) -> Result<Self> {
        let http = HttpClient::builder()
            .timeout(Duration::from_secs_f64(config.request_timeout_s))
            .build()
            .context("failed building Gemini HTTP client")?;
        Ok(Self {
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            http,
        })
    }

    fn endpoint_for_model(&self, model: &str) -> String {
        let trimmed = model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:generateContent", self.api_base, model_path)
    }
}

impl GenerativeBackend for GeminiBackend {
    fn name(&self) -> &str {
        "gemini"
    }

    fn generate(&self, request: &GenerateRequest) -> Result<String> {
        let endpoint = self.endpoint_for_model(&request.model);
        let payload = build_payload(request);
        let response = self
            .http
            .post(&endpoint)
            .query(&[("key", self.api_key.as_str())])
            .json(&payload)
            .send()
            // The request URL carries the API key.
            .map_err(|err| anyhow::Error::new(err.without_url()))
            .with_context(|| format!("Gemini request failed ({})", request.model))?;
        let body = response_json_or_error(response)?;
        extract_reply_text(&body)
    }
}

pub fn build_payload(request: &GenerateRequest) -> Value {
    let contents: Vec<Value> = request
        .turns
        .iter()
        .map(|turn| {
            let parts: Vec<Value> = turn
                .parts
                .iter()
                .map(|part| match part {
                    ContentPart::Text(text) => json!({ "text": text }),
                    ContentPart::InlineImage { mime_type, data } => json!({
                        "inlineData": {
                            "mimeType": mime_type,
                            "data": data,
                        }
                    }),
                })
                .collect();
            json!({
                "role": turn.role.as_str(),
                "parts": parts,
            })
        })
        .collect();

    let mut payload = Map::new();
    payload.insert("contents".to_string(), Value::Array(contents));
    payload.insert(
        "safetySettings".to_string(),
        Value::Array(default_safety_settings()),
    );
    if let Some(generation) = request.generation {
        payload.insert(
            "generationConfig".to_string(),
            json!({
                "temperature": generation.temperature,
                "topK": generation.top_k,
                "topP": generation.top_p,
                "maxOutputTokens": generation.max_output_tokens,
            }),
        );
    }
    Value::Object(payload)
}

fn default_safety_settings() -> Vec<Value> {
    HARM_CATEGORIES
        .iter()
        .map(|category| {
            json!({
                "category": category,
                "threshold": "BLOCK_MEDIUM_AND_ABOVE",
            })
        })
        .collect()
}

/// Joins the text parts of the first candidate. A reply with no candidates
/// is an upstream failure (usually a blocked prompt).
pub fn extract_reply_text(payload: &Value) -> Result<String> {
    let Some(candidate) = payload
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|rows| rows.first())
    else {
        let reason = payload
            .pointer("/promptFeedback/blockReason")
            .and_then(Value::as_str)
            .unwrap_or("no candidates");
        bail!("Gemini returned no reply ({reason})");
    };
    let text = candidate
        .pointer("/content/parts")
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect::<Vec<&str>>()
                .join("")
        })
        .unwrap_or_default();
    Ok(text)
}

/// A non-success HTTP reply. The classification is taken from the status
/// code and the whole body; only the displayed detail is clipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamStatusError {
    pub code: u16,
    pub kind: ErrorKind,
    detail: String,
}

impl UpstreamStatusError {
    pub fn from_body(code: u16, body: &str) -> Self {
        let kind = if code == 429 {
            ErrorKind::Quota
        } else {
            classify_message(&format!("({code}) {body}"))
        };
        Self {
            code,
            kind,
            detail: truncate_text(body, 512),
        }
    }
}

impl fmt::Display for UpstreamStatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Gemini request failed ({}): {}", self.code, self.detail)
    }
}

impl std::error::Error for UpstreamStatusError {}

fn response_json_or_error(response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .context("Gemini response body read failed")?;
    if !status.is_success() {
        return Err(UpstreamStatusError::from_body(code, &body).into());
    }
    serde_json::from_str(&body).context("Gemini returned invalid JSON payload")
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{
        build_payload, extract_reply_text, truncate_text, ContentPart, ContentTurn,
        GeminiBackend, GenerateRequest, GenerationConfig,
    };
    use crate::config::PipelineConfig;

    #[test]
    fn payload_carries_turns_inline_images_and_safety_settings() {
        let request = GenerateRequest {
            model: "gemini-1.5-pro".to_string(),
            turns: vec![ContentTurn {
                role: super::Role::User,
                parts: vec![
                    ContentPart::Text("identify".to_string()),
                    ContentPart::InlineImage {
                        mime_type: "image/jpeg".to_string(),
                        data: "AAAA".to_string(),
                    },
                ],
            }],
            generation: None,
        };
        let payload = build_payload(&request);
        assert_eq!(payload["contents"][0]["role"], json!("user"));
        assert_eq!(payload["contents"][0]["parts"][0]["text"], json!("identify"));
        assert_eq!(
            payload["contents"][0]["parts"][1]["inlineData"]["mimeType"],
            json!("image/jpeg")
        );
        let safety = payload["safetySettings"].as_array().cloned().unwrap_or_default();
        assert_eq!(safety.len(), 4);
        assert!(safety
            .iter()
            .all(|row| row["threshold"] == json!("BLOCK_MEDIUM_AND_ABOVE")));
        assert!(payload.get("generationConfig").is_none());
    }

    #[test]
    fn payload_includes_generation_config_when_set() {
        let request = GenerateRequest {
            model: "gemini-1.5-pro".to_string(),
            turns: vec![
                ContentTurn::user_text("hi"),
                ContentTurn::model_text("hello"),
            ],
            generation: Some(GenerationConfig {
                temperature: 0.7,
                top_k: 40,
                top_p: 0.95,
                max_output_tokens: 1000,
            }),
        };
        let payload = build_payload(&request);
        assert_eq!(payload["contents"][1]["role"], json!("model"));
        assert_eq!(payload["generationConfig"]["topK"], json!(40));
        assert_eq!(payload["generationConfig"]["maxOutputTokens"], json!(1000));
    }

    #[test]
    fn reply_text_joins_first_candidate_parts() -> anyhow::Result<()> {
        let payload = json!({
            "candidates": [
                {"content": {"parts": [{"text": "{\"name\":"}, {"text": "\"Fern\"}"}]}},
                {"content": {"parts": [{"text": "ignored"}]}}
            ]
        });
        assert_eq!(extract_reply_text(&payload)?, "{\"name\":\"Fern\"}");
        Ok(())
    }

    #[test]
    fn blocked_prompt_is_an_error() {
        let payload = json!({"promptFeedback": {"blockReason": "SAFETY"}});
        let err = extract_reply_text(&payload).unwrap_err();
        assert!(err.to_string().contains("SAFETY"));
    }

    #[test]
    fn endpoint_accepts_bare_and_prefixed_model_names() -> anyhow::Result<()> {
        let config = PipelineConfig {
            api_base: "http://localhost:9/v1beta/".to_string(),
            ..PipelineConfig::default()
        };
        let backend = GeminiBackend::new(&config, "test-key")?;
        assert_eq!(
            backend.endpoint_for_model("gemini-1.5-flash"),
            "http://localhost:9/v1beta/models/gemini-1.5-flash:generateContent"
        );
        assert_eq!(
            backend.endpoint_for_model("models/gemini-1.5-flash"),
            "http://localhost:9/v1beta/models/gemini-1.5-flash:generateContent"
        );
        Ok(())
    }

    #[test]
    fn truncation_marks_clipped_text() {
        assert_eq!(truncate_text("abcdef", 3), "abc…");
        assert_eq!(truncate_text("abc", 3), "abc");
    }
}
