//! Answer generator.
//!
//! [`AnswerGenerator`] sends an assembled [`Prompt`] to a
//! [`GenerationBackend`] under a [`RetryPolicy`]:
//!
//! - each attempt is bounded by `timeout`; a timed-out attempt counts as a
//!   transient failure;
//! - transient failures (timeouts, HTTP 429, 5xx, network errors) are retried
//!   up to `max_retries` times with exponential backoff;
//! - permanent failures (other 4xx, malformed responses) and empty answers
//!   are not retried.
//!
//! Every way of not getting an answer ends in
//! [`RagError::GenerationUnavailable`]; an empty string is never returned.
//!
//! # Backends
//!
//! | Provider | Backend | Endpoint |
//! |----------|---------|----------|
//! | `"gemini"` | [`GeminiBackend`] | `POST /v1beta/models/{model}:generateContent` |
//! | `"openai"` | [`OpenAIChatBackend`] | `POST /v1/chat/completions` |
//! | `"disabled"` | [`DisabledBackend`] | always unavailable |

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::config::GenerationConfig;
use crate::error::RagError;
use crate::models::Role;
use crate::prompt::Prompt;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// Worth retrying.
    #[error("{0}")]
    Transient(String),
    #[error("{0}")]
    Permanent(String),
}

#[async_trait]
pub trait GenerationBackend: Send + Sync {
    fn name(&self) -> &str;
    async fn complete(&self, prompt: &Prompt) -> Result<String, BackendError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Bound on a single attempt.
    pub timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &GenerationConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.backoff_base_ms),
            max_delay: Duration::from_millis(config.backoff_max_ms),
            timeout: config.timeout(),
        }
    }

    /// Delay before retry number `retry` (1-based): `base * 2^(retry-1)`,
    /// capped at `max_delay`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u32 << retry.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

pub struct AnswerGenerator {
    backend: Box<dyn GenerationBackend>,
    policy: RetryPolicy,
}

impl AnswerGenerator {
    pub fn new(backend: Box<dyn GenerationBackend>, policy: RetryPolicy) -> Self {
        Self { backend, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn generate(&self, prompt: &Prompt) -> Result<String, RagError> {
        let name = self.backend.name();
        let mut last_failure = String::new();

        for attempt in 0..=self.policy.max_retries {
            if attempt > 0 {
                tokio::time::sleep(self.policy.delay_for(attempt)).await;
            }

            match tokio::time::timeout(self.policy.timeout, self.backend.complete(prompt)).await {
                Ok(Ok(text)) if text.trim().is_empty() => {
                    return Err(RagError::GenerationUnavailable(format!(
                        "{} returned an empty response",
                        name
                    )));
                }
                Ok(Ok(text)) => {
                    if attempt > 0 {
                        tracing::info!(backend = name, attempt, "Generation succeeded after retry");
                    }
                    return Ok(text);
                }
                Ok(Err(BackendError::Permanent(reason))) => {
                    tracing::warn!(backend = name, error = %reason, "Generation failed");
                    return Err(RagError::GenerationUnavailable(reason));
                }
                Ok(Err(BackendError::Transient(reason))) => {
                    tracing::warn!(backend = name, attempt, error = %reason, "Generation attempt failed");
                    last_failure = reason;
                }
                Err(_) => {
                    tracing::warn!(
                        backend = name,
                        attempt,
                        timeout_ms = self.policy.timeout.as_millis() as u64,
                        "Generation attempt timed out"
                    );
                    last_failure = format!("timed out after {:?}", self.policy.timeout);
                }
            }
        }

        Err(RagError::GenerationUnavailable(format!(
            "{} failed after {} attempts: {}",
            name,
            self.policy.max_retries + 1,
            last_failure
        )))
    }
}

/// Classify an HTTP failure status.
fn status_error(label: &str, status: reqwest::StatusCode, body: &str) -> BackendError {
    let message = format!("{} API error {}: {}", label, status, body);
    if status.as_u16() == 429 || status.is_server_error() {
        BackendError::Transient(message)
    } else {
        BackendError::Permanent(message)
    }
}

async fn post_json(
    request: reqwest::RequestBuilder,
    label: &str,
) -> Result<serde_json::Value, BackendError> {
    let response = request
        .send()
        .await
        .map_err(|e| BackendError::Transient(format!("{} request failed: {}", label, e)))?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(status_error(label, status, &body));
    }
    response
        .json()
        .await
        .map_err(|e| BackendError::Permanent(format!("{} returned invalid JSON: {}", label, e)))
}

// ============ Gemini ============

pub struct GeminiBackend {
    model: String,
    url: String,
    api_key: String,
    temperature: f32,
    client: reqwest::Client,
}

impl GeminiBackend {
    pub const DEFAULT_MODEL: &'static str = "gemini-2.5-flash";

    pub fn new(config: &GenerationConfig, api_key: String) -> Result<Self> {
        if api_key.is_empty() {
            bail!(
                "Gemini generation requires an API key; set {}",
                config.api_key_env
            );
        }
        let client = reqwest::Client::builder().timeout(config.timeout()).build()?;
        Ok(Self {
            model: config
                .model
                .clone()
                .unwrap_or_else(|| Self::DEFAULT_MODEL.to_string()),
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "https://generativelanguage.googleapis.com".to_string()),
            api_key,
            temperature: config.temperature,
            client,
        })
    }

    fn request_body(&self, prompt: &Prompt) -> serde_json::Value {
        let contents: Vec<serde_json::Value> = gemini_turns(prompt)
            .into_iter()
            .map(|(role, text)| serde_json::json!({ "role": role, "parts": [{ "text": text }] }))
            .collect();

        serde_json::json!({
            "systemInstruction": { "parts": [{ "text": prompt.system }] },
            "contents": contents,
            "generationConfig": { "temperature": self.temperature },
        })
    }
}

/// History plus query as Gemini turns. Gemini wants the first turn from the
/// user and roles alternating, so leading model turns are dropped and
/// consecutive turns of one role are merged.
fn gemini_turns(prompt: &Prompt) -> Vec<(&'static str, String)> {
    let messages = prompt
        .history
        .iter()
        .map(|m| match m.role {
            Role::Assistant => ("model", m.content.as_str()),
            _ => ("user", m.content.as_str()),
        })
        .skip_while(|(role, _)| *role == "model")
        .chain(std::iter::once(("user", prompt.query.as_str())));

    let mut turns: Vec<(&'static str, String)> = Vec::new();
    for (role, text) in messages {
        match turns.last_mut() {
            Some((last, merged)) if *last == role => {
                merged.push_str("\n\n");
                merged.push_str(text);
            }
            _ => turns.push((role, text.to_string())),
        }
    }
    turns
}

/// Concatenate the text parts of the first candidate.
fn parse_gemini_response(json: &serde_json::Value) -> Result<String, BackendError> {
    let parts = json
        .pointer("/candidates/0/content/parts")
        .and_then(|p| p.as_array())
        .ok_or_else(|| {
            BackendError::Permanent("Invalid Gemini response: missing candidate parts".to_string())
        })?;
    Ok(parts
        .iter()
        .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
        .collect::<Vec<_>>()
        .join(""))
}

#[async_trait]
impl GenerationBackend for GeminiBackend {
    fn name(&self) -> &str {
        "Gemini"
    }

    async fn complete(&self, prompt: &Prompt) -> Result<String, BackendError> {
        let request = self
            .client
            .post(format!(
                "{}/v1beta/models/{}:generateContent",
                self.url.trim_end_matches('/'),
                self.model
            ))
            .header("x-goog-api-key", &self.api_key)
            .json(&self.request_body(prompt));
        let json = post_json(request, "Gemini").await?;
        parse_gemini_response(&json)
    }
}

// ============ OpenAI-compatible chat ============

pub struct OpenAIChatBackend {
    model: String,
    url: String,
    api_key: String,
    temperature: f32,
    client: reqwest::Client,
}

impl OpenAIChatBackend {
    pub fn new(config: &GenerationConfig, api_key: String) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("generation.model required for OpenAI provider"))?;
        let client = reqwest::Client::builder().timeout(config.timeout()).build()?;
        Ok(Self {
            model,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com".to_string()),
            api_key,
            temperature: config.temperature,
            client,
        })
    }

    fn request_body(&self, prompt: &Prompt) -> serde_json::Value {
        let mut messages = vec![serde_json::json!({ "role": "system", "content": prompt.system })];
        for m in &prompt.history {
            messages.push(serde_json::json!({ "role": m.role.as_str(), "content": m.content }));
        }
        messages.push(serde_json::json!({ "role": "user", "content": prompt.query }));
        serde_json::json!({
            "model": self.model,
            "messages": messages,
            "temperature": self.temperature,
        })
    }
}

#[async_trait]
impl GenerationBackend for OpenAIChatBackend {
    fn name(&self) -> &str {
        "OpenAI"
    }

    async fn complete(&self, prompt: &Prompt) -> Result<String, BackendError> {
        let mut request = self
            .client
            .post(format!(
                "{}/v1/chat/completions",
                self.url.trim_end_matches('/')
            ))
            .json(&self.request_body(prompt));
        // Local OpenAI-compatible servers often run without a key.
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }
        let json = post_json(request, "OpenAI").await?;
        json.pointer("/choices/0/message/content")
            .and_then(|c| c.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| {
                BackendError::Permanent("Invalid OpenAI response: missing message content".to_string())
            })
    }
}

// ============ Disabled ============

pub struct DisabledBackend;

#[async_trait]
impl GenerationBackend for DisabledBackend {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn complete(&self, _prompt: &Prompt) -> Result<String, BackendError> {
        Err(BackendError::Permanent(
            "generation is disabled in configuration".to_string(),
        ))
    }
}

/// Create the backend named by `config.provider`.
pub fn create_backend(
    config: &GenerationConfig,
    api_key: Option<String>,
) -> Result<Box<dyn GenerationBackend>> {
    match config.provider.as_str() {
        "gemini" => Ok(Box::new(GeminiBackend::new(
            config,
            api_key.unwrap_or_default(),
        )?)),
        "openai" => Ok(Box::new(OpenAIChatBackend::new(
            config,
            api_key.unwrap_or_default(),
        )?)),
        "disabled" => Ok(Box::new(DisabledBackend)),
        other => bail!("Unknown generation provider: {}", other),
    }
}
