//! HTTP clients for the text-generation providers.
//!
//! Each provider takes an opaque prompt plus an output-size hint and returns
//! the text payload pulled out of its own response envelope. Nothing here
//! knows about cards.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::PipelineError;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const SYSTEM_PROMPT: &str = "You are an expert educator creating engaging knowledge cards.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    OpenAi,
    Gemini,
    Anthropic,
}

impl ProviderKind {
    fn default_base_url(self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "https://api.openai.com/v1",
            ProviderKind::Gemini => "https://generativelanguage.googleapis.com/v1beta",
            ProviderKind::Anthropic => "https://api.anthropic.com/v1",
        }
    }

    fn default_model(self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "gpt-4o-mini",
            ProviderKind::Gemini => "gemini-2.5-flash-lite",
            ProviderKind::Anthropic => "claude-3-5-haiku-latest",
        }
    }

    fn api_key_var(self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "OPENAI_API_KEY",
            ProviderKind::Gemini => "GEMINI_API_KEY",
            ProviderKind::Anthropic => "ANTHROPIC_API_KEY",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Gemini => "gemini",
            ProviderKind::Anthropic => "anthropic",
        })
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(ProviderKind::OpenAi),
            "gemini" | "google" => Ok(ProviderKind::Gemini),
            "anthropic" | "claude" => Ok(ProviderKind::Anthropic),
            other => Err(format!("unknown provider: {other}")),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub default_timeout: Duration,
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub max_error_body_bytes: usize,
}

impl ProviderConfig {
    pub fn from_env() -> Self {
        let kind = std::env::var("QUIP_PROVIDER")
            .ok()
            .and_then(|s| {
                s.parse::<ProviderKind>()
                    .inspect_err(|e| warn!(error = %e, "ignoring QUIP_PROVIDER"))
                    .ok()
            })
            .unwrap_or(ProviderKind::OpenAi);

        let base_url = std::env::var("QUIP_BASE_URL")
            .unwrap_or_else(|_| kind.default_base_url().to_string());

        let api_key = std::env::var("QUIP_API_KEY")
            .or_else(|_| std::env::var(kind.api_key_var()))
            .ok()
            .filter(|k| !k.trim().is_empty());

        let model =
            std::env::var("QUIP_MODEL").unwrap_or_else(|_| kind.default_model().to_string());

        let temperature = std::env::var("QUIP_TEMPERATURE")
            .ok()
            .and_then(|s| s.parse::<f32>().ok())
            .unwrap_or(0.8);

        let default_timeout = std::env::var("QUIP_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or_else(|| Duration::from_secs(60));

        let max_retries = std::env::var("QUIP_MAX_RETRIES")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(2);

        let initial_backoff = std::env::var("QUIP_RETRY_INITIAL_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or_else(|| Duration::from_millis(200));

        let max_backoff = std::env::var("QUIP_RETRY_MAX_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or_else(|| Duration::from_millis(5_000));

        Self {
            kind,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model,
            temperature,
            default_timeout,
            max_retries,
            initial_backoff,
            max_backoff,
            max_error_body_bytes: 8 * 1024,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("invalid response JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("upstream returned error: status={status} message={message}")]
    Upstream { status: StatusCode, message: String },

    #[error("upstream returned non-JSON error: status={status} body={body}")]
    UpstreamBody { status: StatusCode, body: String },

    #[error("response envelope carried no text")]
    MissingText,

    #[error("no API key configured for {0}")]
    MissingApiKey(ProviderKind),
}

impl From<ProviderError> for PipelineError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Request(e) => PipelineError::NetworkUnavailable(e.to_string()),
            ProviderError::Upstream { status, message } => PipelineError::Provider {
                status: status.as_u16(),
                body: message,
            },
            ProviderError::UpstreamBody { status, body } => PipelineError::Provider {
                status: status.as_u16(),
                body,
            },
            ProviderError::MissingApiKey(kind) => PipelineError::Provider {
                status: StatusCode::UNAUTHORIZED.as_u16(),
                body: format!("no API key configured for {kind}"),
            },
            e @ (ProviderError::InvalidJson(_) | ProviderError::MissingText) => {
                PipelineError::MalformedResponse(e.to_string())
            }
        }
    }
}

/// One prompt in, one text payload out.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, prompt: &str, max_output_tokens: u32) -> Result<String, ProviderError>;
}

#[derive(Clone)]
pub struct HttpProvider {
    config: ProviderConfig,
    http: reqwest::Client,
}

impl HttpProvider {
    pub fn new(config: ProviderConfig) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .user_agent("dailyquip/quip-core")
            .build()?;
        Ok(Self { config, http })
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    fn api_key(&self) -> Result<&str, ProviderError> {
        self.config
            .api_key
            .as_deref()
            .ok_or(ProviderError::MissingApiKey(self.config.kind))
    }

    async fn send_once(&self, prompt: &str, max_output_tokens: u32) -> Result<String, ProviderError> {
        let timeout = self.config.default_timeout;
        let key = self.api_key()?;
        match self.config.kind {
            ProviderKind::OpenAi => {
                let body = ChatCompletionRequest {
                    model: self.config.model.clone(),
                    messages: vec![
                        Message {
                            role: "system".to_string(),
                            content: SYSTEM_PROMPT.to_string(),
                        },
                        Message {
                            role: "user".to_string(),
                            content: prompt.to_string(),
                        },
                    ],
                    temperature: Some(self.config.temperature),
                    max_tokens: Some(max_output_tokens),
                };
                let resp = self
                    .http
                    .post(format!("{}/chat/completions", self.config.base_url))
                    .bearer_auth(key)
                    .timeout(timeout)
                    .json(&body)
                    .send()
                    .await?;
                let parsed: ChatCompletionResponse =
                    Self::parse_json_response(resp, self.config.max_error_body_bytes).await?;
                parsed
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|c| c.message.content)
                    .ok_or(ProviderError::MissingText)
            }
            ProviderKind::Gemini => {
                let body = GenerateContentRequest {
                    contents: vec![GeminiContent {
                        parts: vec![GeminiPart {
                            text: Some(prompt.to_string()),
                        }],
                    }],
                    generation_config: GenerationConfig {
                        temperature: self.config.temperature,
                        max_output_tokens,
                        response_mime_type: "application/json".to_string(),
                    },
                };
                let resp = self
                    .http
                    .post(format!(
                        "{}/models/{}:generateContent",
                        self.config.base_url, self.config.model
                    ))
                    .header("x-goog-api-key", key)
                    .timeout(timeout)
                    .json(&body)
                    .send()
                    .await?;
                let parsed: GenerateContentResponse =
                    Self::parse_json_response(resp, self.config.max_error_body_bytes).await?;
                parsed
                    .candidates
                    .into_iter()
                    .next()
                    .and_then(|c| c.content)
                    .and_then(|c| c.parts.into_iter().find_map(|p| p.text))
                    .ok_or(ProviderError::MissingText)
            }
            ProviderKind::Anthropic => {
                let body = MessagesRequest {
                    model: self.config.model.clone(),
                    max_tokens: max_output_tokens,
                    temperature: Some(self.config.temperature),
                    system: Some(SYSTEM_PROMPT.to_string()),
                    messages: vec![Message {
                        role: "user".to_string(),
                        content: prompt.to_string(),
                    }],
                };
                let resp = self
                    .http
                    .post(format!("{}/messages", self.config.base_url))
                    .header("x-api-key", key)
                    .header("anthropic-version", ANTHROPIC_VERSION)
                    .timeout(timeout)
                    .json(&body)
                    .send()
                    .await?;
                let parsed: MessagesResponse =
                    Self::parse_json_response(resp, self.config.max_error_body_bytes).await?;
                parsed
                    .content
                    .into_iter()
                    .find(|block| block.kind == "text")
                    .and_then(|block| block.text)
                    .ok_or(ProviderError::MissingText)
            }
        }
    }

    async fn parse_json_response<T: for<'de> Deserialize<'de>>(
        resp: reqwest::Response,
        max_error_body_bytes: usize,
    ) -> Result<T, ProviderError> {
        if resp.status().is_success() {
            let bytes = resp.bytes().await?;
            return Ok(serde_json::from_slice::<T>(&bytes)?);
        }
        Err(Self::to_upstream_error(resp, max_error_body_bytes).await)
    }

    async fn to_upstream_error(resp: reqwest::Response, max_error_body_bytes: usize) -> ProviderError {
        let status = resp.status();
        let body = read_limited_text(resp, max_error_body_bytes).await;
        // All three providers nest the message under `error.message`.
        if let Ok(parsed) = serde_json::from_str::<ErrorEnvelope>(&body) {
            if let Some(message) = parsed.error.message {
                return ProviderError::Upstream { status, message };
            }
        }
        ProviderError::UpstreamBody { status, body }
    }
}

#[async_trait]
impl CompletionProvider for HttpProvider {
    fn name(&self) -> &str {
        match self.config.kind {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Gemini => "gemini",
            ProviderKind::Anthropic => "anthropic",
        }
    }

    async fn complete(&self, prompt: &str, max_output_tokens: u32) -> Result<String, ProviderError> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.send_once(prompt, max_output_tokens).await {
                Ok(text) => return Ok(text),
                Err(e) => {
                    if attempt > self.config.max_retries || !should_retry(&e) {
                        return Err(e);
                    }
                    let delay = backoff_delay(
                        self.config.initial_backoff,
                        self.config.max_backoff,
                        attempt - 1,
                    );
                    warn!(
                        provider = self.name(),
                        attempt,
                        delay_ms = delay.as_millis(),
                        error = %e,
                        "generation request failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

fn should_retry(err: &ProviderError) -> bool {
    match err {
        // A body cut off mid-transfer is as transient as a dropped connection.
        ProviderError::Request(e) => {
            e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() || e.is_decode()
        }
        ProviderError::Upstream { status, .. } | ProviderError::UpstreamBody { status, .. } => {
            *status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
        }
        ProviderError::InvalidJson(_)
        | ProviderError::MissingText
        | ProviderError::MissingApiKey(_) => false,
    }
}

fn backoff_delay(initial: Duration, max: Duration, exponent: u32) -> Duration {
    let mult = 1u128.checked_shl(exponent).unwrap_or(u128::MAX);
    let base_ms = initial.as_millis().saturating_mul(mult);
    let capped_ms = std::cmp::min(base_ms, max.as_millis()) as u64;
    let jitter_cap = std::cmp::max(1, capped_ms / 4);
    let jitter_ms = rand::rng().random_range(0..=jitter_cap);
    Duration::from_millis(capped_ms.saturating_add(jitter_ms))
}

async fn read_limited_text(resp: reqwest::Response, max_bytes: usize) -> String {
    match resp.bytes().await {
        Ok(mut b) => {
            if b.len() > max_bytes {
                b.truncate(max_bytes);
            }
            String::from_utf8_lossy(&b).to_string()
        }
        Err(e) => {
            warn!(error = %e, "failed to read upstream error body");
            "<failed to read error body>".to_string()
        }
    }
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorObject,
}

#[derive(Debug, Deserialize)]
struct ErrorObject {
    message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatCompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChoice {
    message: ChatCompletionMessage,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionMessage {
    content: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<GeminiContent>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    max_output_tokens: u32,
    response_mime_type: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiPart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContent>,
}

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<Message>,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    text: Option<String>,
}
