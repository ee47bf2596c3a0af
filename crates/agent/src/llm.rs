use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::header::RETRY_AFTER;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use thiserror::Error;

/// Raw image bytes attached to a chat message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageBlob {
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl ImageBlob {
    pub fn new(mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self { mime_type: mime_type.into(), data }
    }

    pub fn png(data: Vec<u8>) -> Self {
        Self::new("image/png", data)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PromptPart {
    Text(String),
    Image(ImageBlob),
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GenerationConfig {
    pub max_output_tokens: u32,
    pub temperature: f32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self { max_output_tokens: 512, temperature: 0.6 }
    }
}

/// Outbound call failures, as seen by the retry loop.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CompletionError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("completion service returned status {status}: {message}")]
    Service { status: u16, message: String },
    #[error("completion service quota exhausted (status {status})")]
    RateLimited { status: u16, retry_after: Option<Duration> },
    #[error("completion service returned no usable text")]
    EmptyResult,
    #[error("completion backend is not configured: {0}")]
    Configuration(String),
}

impl CompletionError {
    /// Stable label used in structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport",
            Self::Service { .. } => "service",
            Self::RateLimited { .. } => "rate_limited",
            Self::EmptyResult => "empty_result",
            Self::Configuration(_) => "configuration",
        }
    }

    /// Configuration errors are never retried.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Configuration(_))
    }
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// One generation call against a single model. The raw JSON body is
    /// returned untouched; text extraction happens in the caller.
    async fn invoke(
        &self,
        model: &str,
        parts: &[PromptPart],
        config: &GenerationConfig,
    ) -> Result<Value, CompletionError>;
}

const SAFETY_CATEGORIES: [&str; 4] = [
    "HARM_CATEGORY_HARASSMENT",
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_SEXUALLY_EXPLICIT",
    "HARM_CATEGORY_DANGEROUS_CONTENT",
];

const ERROR_BODY_PREVIEW_CHARS: usize = 200;

/// `generateContent` client for the Gemini REST API.
pub struct GeminiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: SecretString,
}

impl GeminiClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: SecretString,
        timeout: Duration,
    ) -> Result<Self, CompletionError> {
        if api_key.expose_secret().trim().is_empty() {
            return Err(CompletionError::Configuration("api key is empty".to_string()));
        }

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| CompletionError::Configuration(error.to_string()))?;

        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self { http, base_url, api_key })
    }

    pub fn endpoint(&self, model: &str) -> String {
        format!("{}/v1beta/models/{model}:generateContent", self.base_url)
    }
}

pub fn request_body(parts: &[PromptPart], config: &GenerationConfig) -> Value {
    let parts: Vec<Value> = parts
        .iter()
        .map(|part| match part {
            PromptPart::Text(text) => json!({ "text": text }),
            PromptPart::Image(image) => json!({
                "inline_data": {
                    "mime_type": image.mime_type,
                    "data": BASE64.encode(&image.data),
                }
            }),
        })
        .collect();

    let safety_settings: Vec<Value> = SAFETY_CATEGORIES
        .iter()
        .map(|category| json!({ "category": category, "threshold": "BLOCK_ONLY_HIGH" }))
        .collect();

    json!({
        "contents": [{ "role": "user", "parts": parts }],
        "generationConfig": {
            "maxOutputTokens": config.max_output_tokens,
            "temperature": config.temperature,
        },
        "safetySettings": safety_settings,
    })
}

fn classify_status(
    status: StatusCode,
    retry_after: Option<Duration>,
    body: &str,
) -> CompletionError {
    let message: String = body.chars().take(ERROR_BODY_PREVIEW_CHARS).collect();
    match status {
        StatusCode::TOO_MANY_REQUESTS => {
            CompletionError::RateLimited { status: status.as_u16(), retry_after }
        }
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => CompletionError::Configuration(
            format!("completion service rejected the api key (status {})", status.as_u16()),
        ),
        _ if body.contains("RESOURCE_EXHAUSTED") => {
            CompletionError::RateLimited { status: status.as_u16(), retry_after }
        }
        _ => CompletionError::Service { status: status.as_u16(), message },
    }
}

fn parse_retry_after(value: Option<&reqwest::header::HeaderValue>) -> Option<Duration> {
    value
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[async_trait]
impl LlmClient for GeminiClient {
    async fn invoke(
        &self,
        model: &str,
        parts: &[PromptPart],
        config: &GenerationConfig,
    ) -> Result<Value, CompletionError> {
        let response = self
            .http
            .post(self.endpoint(model))
            .header("x-goog-api-key", self.api_key.expose_secret())
            .json(&request_body(parts, config))
            .send()
            .await
            .map_err(|error| CompletionError::Transport(error.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers().get(RETRY_AFTER));
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, retry_after, &body));
        }

        response.json::<Value>().await.map_err(|error| CompletionError::Service {
            status: status.as_u16(),
            message: format!("response body is not JSON: {error}"),
        })
    }
}
