//! GLM API client (Cerebras)
//!
//! Fallback provider, OpenAI-compatible chat completions. GLM thinking
//! models sometimes put the whole answer in the `reasoning` field; when
//! `content` comes back empty the reasoning is used instead.

use serde::Deserialize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{EngineError, Result};
use crate::llm::client::{LlmClient, LlmUsage, UsageAccumulator, UsageCallback};
use async_trait::async_trait;

const API_URL: &str = "https://api.cerebras.ai/v1/chat/completions";
const DEFAULT_MODEL: &str = "zai-glm-4.7";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const MAX_RETRIES: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Client for GLM on the Cerebras API
pub struct GlmClient {
    api_key: String,
    model: String,
    api_url: String,
    http: reqwest::Client,
    usage: UsageAccumulator,
    on_usage: Option<UsageCallback>,
}

impl GlmClient {
    pub fn new(api_key: impl Into<String>, model: Option<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .pool_max_idle_per_host(5)
            .build()?;

        Ok(Self {
            api_key: api_key.into(),
            model: model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            api_url: API_URL.to_string(),
            http,
            usage: UsageAccumulator::default(),
            on_usage: None,
        })
    }

    /// Install a callback observing (input, output) tokens per call
    pub fn set_usage_callback(&mut self, callback: UsageCallback) {
        self.on_usage = Some(callback);
    }

    /// Override the API URL (tests)
    #[cfg(test)]
    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = url.into();
        self
    }

    /// Generate returning both content and reasoning (thinking models)
    pub async fn generate_with_reasoning(
        &self,
        prompt: &str,
        temperature: f64,
        max_tokens: u32,
    ) -> Result<(String, String)> {
        let mut last_error = EngineError::ProviderEmpty("no attempt made".into());

        for attempt in 1..=MAX_RETRIES {
            match self.request_once(prompt, temperature, max_tokens).await {
                Ok(reply) => {
                    if reply.content.trim().is_empty() {
                        return Err(EngineError::ProviderEmpty("GLM returned empty response".into()));
                    }
                    return Ok((reply.content, reply.reasoning));
                }
                Err(e) => {
                    warn!(attempt, max_retries = MAX_RETRIES, error = %e, "glm call failed");
                    if e.is_rate_limit() {
                        tokio::time::sleep(RETRY_DELAY * attempt * 2).await;
                    }
                    last_error = e;
                }
            }

            if attempt < MAX_RETRIES {
                tokio::time::sleep(RETRY_DELAY * 2u32.pow(attempt - 1)).await;
            }
        }

        Err(last_error)
    }

    async fn request_once(&self, prompt: &str, temperature: f64, max_tokens: u32) -> Result<GlmReply> {
        let started = Instant::now();
        let body = serde_json::json!({
            "model": self.model,
            "messages": [{"role": "user", "content": prompt}],
            "temperature": temperature,
            "max_tokens": max_tokens,
        });

        let response = self
            .http
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        if response.status().as_u16() == 429 {
            return Err(EngineError::ProviderRateLimited {
                retry_after: Duration::from_secs(60),
            });
        }
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            return Err(EngineError::ProviderConnectionFailed(format!("GLM HTTP {}: {}", status, text)));
        }

        let api: GlmResponse = response
            .json()
            .await
            .map_err(|e| EngineError::ProviderConnectionFailed(e.to_string()))?;

        let choice = api
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::ProviderEmpty("GLM returned no choices".into()))?;

        let mut content = choice.message.content.unwrap_or_default();
        let reasoning = choice.message.reasoning.unwrap_or_default();

        // Thinking models may answer entirely in the reasoning field
        if content.trim().is_empty() && !reasoning.is_empty() {
            debug!("glm content empty, using reasoning field");
            content = reasoning.clone();
        }

        let usage = api.usage.unwrap_or_default();
        let request_id = self.usage.record(usage.prompt_tokens, usage.completion_tokens);
        if let Some(cb) = &self.on_usage {
            cb(usage.prompt_tokens, usage.completion_tokens);
        }
        debug!(
            request_id,
            tokens_in = usage.prompt_tokens,
            tokens_out = usage.completion_tokens,
            latency_ms = started.elapsed().as_millis() as u64,
            "glm call complete"
        );

        Ok(GlmReply { content, reasoning })
    }
}

struct GlmReply {
    content: String,
    reasoning: String,
}

#[async_trait]
impl LlmClient for GlmClient {
    fn name(&self) -> &'static str {
        "glm"
    }

    fn model(&self) -> String {
        self.model.clone()
    }

    async fn generate(&self, prompt: &str, temperature: f64, json_mode: bool, max_tokens: u32) -> Result<String> {
        let prompt = if json_mode {
            format!("{}\n\nRespond with valid JSON only.", prompt)
        } else {
            prompt.to_string()
        };
        let max_tokens = if json_mode { max_tokens.min(1024) } else { max_tokens };

        let mut last_error = EngineError::ProviderEmpty("no attempt made".into());

        for attempt in 1..=MAX_RETRIES {
            match self.request_once(&prompt, temperature, max_tokens).await {
                Ok(reply) => {
                    if reply.content.trim().is_empty() {
                        last_error = EngineError::ProviderEmpty("GLM returned empty response".into());
                    } else {
                        return Ok(reply.content);
                    }
                }
                Err(e) => {
                    warn!(attempt, max_retries = MAX_RETRIES, error = %e, "glm call failed");
                    if e.is_rate_limit() {
                        tokio::time::sleep(RETRY_DELAY * attempt * 2).await;
                    }
                    last_error = e;
                }
            }

            if attempt < MAX_RETRIES {
                tokio::time::sleep(RETRY_DELAY * 2u32.pow(attempt - 1)).await;
            }
        }

        Err(last_error)
    }

    fn session_usage(&self) -> LlmUsage {
        self.usage.snapshot()
    }
}

// GLM API response types

#[derive(Debug, Deserialize)]
struct GlmResponse {
    #[serde(default)]
    choices: Vec<GlmChoice>,
    usage: Option<GlmUsage>,
}

#[derive(Debug, Deserialize)]
struct GlmChoice {
    message: GlmMessage,
}

#[derive(Debug, Deserialize)]
struct GlmMessage {
    content: Option<String>,
    reasoning: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct GlmUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_model() {
        let client = GlmClient::new("key", None).unwrap();
        assert_eq!(client.model, DEFAULT_MODEL);
    }

    #[test]
    fn test_custom_model() {
        let client = GlmClient::new("key", Some("zai-glm-5".to_string())).unwrap();
        assert_eq!(client.model, "zai-glm-5");
    }

    #[test]
    fn test_parse_response_with_reasoning() {
        let raw = r#"{
            "choices": [{"message": {"content": "", "reasoning": "the actual answer"}}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5}
        }"#;
        let parsed: GlmResponse = serde_json::from_str(raw).unwrap();
        let message = &parsed.choices[0].message;
        assert_eq!(message.content.as_deref(), Some(""));
        assert_eq!(message.reasoning.as_deref(), Some("the actual answer"));
    }

    #[test]
    fn test_parse_response_missing_usage() {
        let raw = r#"{"choices": [{"message": {"content": "hi"}}]}"#;
        let parsed: GlmResponse = serde_json::from_str(raw).unwrap();
        assert!(parsed.usage.is_none());
        assert_eq!(parsed.choices[0].message.content.as_deref(), Some("hi"));
    }
}
