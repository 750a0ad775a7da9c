//! Chat-completion driver: one JSON-mode call per prompt, retries
//! with capped exponential backoff and jitter, shared usage
//! accounting. Request and response bodies are async-openai types;
//! transport goes through reqwest so HTTP status codes stay visible
//! for retry classification.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_openai::types::{
    ChatCompletionRequestUserMessageArgs, ChatCompletionResponseFormat,
    ChatCompletionResponseFormatType, CreateChatCompletionRequestArgs,
    CreateChatCompletionResponse,
};
use async_trait::async_trait;
use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::AiConfig;

use super::error::{excerpt, AiError};

const MAX_BACKOFF_MS: u64 = 30_000;

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub prompt: String,
    pub model: String,
    pub max_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct ChatOutcome {
    pub content: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub model: String,
}

#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatOutcome, AiError>;
}

/// OpenAI-compatible chat-completions endpoint.
pub struct OpenAiBackend {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl OpenAiBackend {
    pub fn new(base_url: &str, api_key: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }
}

#[async_trait]
impl CompletionBackend for OpenAiBackend {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatOutcome, AiError> {
        let message = ChatCompletionRequestUserMessageArgs::default()
            .content(request.prompt.as_str())
            .build()
            .map_err(|e| AiError::Request(e.to_string()))?;
        let body = CreateChatCompletionRequestArgs::default()
            .model(&request.model)
            .max_tokens(request.max_tokens)
            .response_format(ChatCompletionResponseFormat {
                r#type: ChatCompletionResponseFormatType::JsonObject,
            })
            .messages(vec![message.into()])
            .build()
            .map_err(|e| AiError::Request(e.to_string()))?;

        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(AiError::status(status.as_u16(), &text));
        }

        let parsed: CreateChatCompletionResponse =
            serde_json::from_str(&text).map_err(|_| AiError::bad_response(&text))?;
        let content = parsed
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .unwrap_or_default();
        let (prompt_tokens, completion_tokens) = parsed
            .usage
            .map(|usage| (usage.prompt_tokens, usage.completion_tokens))
            .unwrap_or((0, 0));

        Ok(ChatOutcome {
            content,
            prompt_tokens,
            completion_tokens,
            model: parsed.model,
        })
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
}

impl RetryPolicy {
    pub fn from_config(config: &AiConfig, backoff_multiplier: f64) -> Self {
        Self {
            max_attempts: config.retry_attempts.max(1),
            base_delay_ms: config.retry_delay_ms,
            multiplier: backoff_multiplier,
        }
    }

    /// `base · multiplier^(attempt-1)`, capped at 30 s, plus uniform
    /// jitter in `[0, 0.1·delay]`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let raw = self.base_delay_ms as f64 * self.multiplier.powi(exponent);
        let capped = raw.min(MAX_BACKOFF_MS as f64);
        let jitter = rand::thread_rng().gen_range(0.0..=0.1) * capped;
        Duration::from_millis((capped + jitter).round() as u64)
    }
}

/// Running totals across a stage invocation. Clone-shared; safe for
/// concurrent batch dispatch.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct UsageTotals {
    pub requests: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

#[derive(Clone, Default)]
pub struct UsageTracker {
    totals: Arc<Mutex<UsageTotals>>,
}

impl UsageTracker {
    pub fn record(&self, prompt_tokens: u32, completion_tokens: u32) {
        let mut totals = self.totals.lock().unwrap();
        totals.requests += 1;
        totals.prompt_tokens += prompt_tokens as u64;
        totals.completion_tokens += completion_tokens as u64;
    }

    pub fn snapshot(&self) -> UsageTotals {
        *self.totals.lock().unwrap()
    }
}

/// A parsed JSON-mode completion plus its per-call usage.
#[derive(Debug, Clone)]
pub struct JsonOutcome {
    pub value: Value,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub model: String,
}

pub struct LlmDriver {
    backend: Arc<dyn CompletionBackend>,
    policy: RetryPolicy,
    model: String,
    max_tokens: u32,
}

impl LlmDriver {
    pub fn new(
        backend: Arc<dyn CompletionBackend>,
        policy: RetryPolicy,
        model: &str,
        max_tokens: u32,
    ) -> Self {
        Self {
            backend,
            policy,
            model: model.to_string(),
            max_tokens,
        }
    }

    /// Build the production driver; the caller has already validated
    /// that the API key is present.
    pub fn from_config(config: &AiConfig, backoff_multiplier: f64) -> anyhow::Result<Self> {
        let api_key = config
            .api_key
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("ai.apiKey must be set"))?;
        Ok(Self::new(
            Arc::new(OpenAiBackend::new(&config.base_url, api_key)),
            RetryPolicy::from_config(config, backoff_multiplier),
            &config.model,
            config.max_tokens,
        ))
    }

    /// One chat completion in JSON mode: call (with retries), account
    /// usage, parse the content.
    pub async fn process_json(
        &self,
        prompt: &str,
        usage: &UsageTracker,
    ) -> Result<JsonOutcome, AiError> {
        let request = ChatRequest {
            prompt: prompt.to_string(),
            model: self.model.clone(),
            max_tokens: self.max_tokens,
        };
        let outcome = self.call_with_retries(&request).await?;
        usage.record(outcome.prompt_tokens, outcome.completion_tokens);

        let value: Value = serde_json::from_str(&outcome.content)
            .map_err(|_| AiError::bad_response(&outcome.content))?;
        Ok(JsonOutcome {
            value,
            prompt_tokens: outcome.prompt_tokens,
            completion_tokens: outcome.completion_tokens,
            model: outcome.model,
        })
    }

    async fn call_with_retries(&self, request: &ChatRequest) -> Result<ChatOutcome, AiError> {
        let mut attempt = 1u32;
        loop {
            match self.backend.complete(request).await {
                Ok(outcome) => {
                    debug!(
                        attempt,
                        prompt_tokens = outcome.prompt_tokens,
                        completion_tokens = outcome.completion_tokens,
                        "llm call succeeded"
                    );
                    return Ok(outcome);
                }
                Err(error) if error.is_retryable() && attempt < self.policy.max_attempts => {
                    let delay = self.policy.backoff_delay(attempt);
                    warn!(attempt, %error, delay_ms = delay.as_millis() as u64, "llm call failed; retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }
}
