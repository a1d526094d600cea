//! Gemini API client
//!
//! Primary provider. Talks to the `generateContent` REST endpoint with a
//! pooled HTTP client and retry/backoff.

use serde::Deserialize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{EngineError, Result};
use crate::llm::client::{LlmClient, LlmUsage, UsageAccumulator, UsageCallback};
use async_trait::async_trait;

const API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const MAX_RETRIES: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Models this client accepts. Anything else is rejected at construction.
pub const ALLOWED_MODELS: &[&str] = &["gemini-2.5-pro", "gemini-3-pro", "gemini-3-flash"];

/// Client for the Gemini API
pub struct GeminiClient {
    api_key: String,
    model: String,
    base_url: String,
    http: reqwest::Client,
    usage: UsageAccumulator,
    on_usage: Option<UsageCallback>,
}

impl std::fmt::Debug for GeminiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiClient")
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl GeminiClient {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Result<Self> {
        let model = model.into();
        if !ALLOWED_MODELS.contains(&model.as_str()) {
            return Err(EngineError::ConfigInvalid(format!(
                "Model {} not allowed. Use one of: {:?}",
                model, ALLOWED_MODELS
            )));
        }

        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            api_key: api_key.into(),
            model,
            base_url: API_BASE.to_string(),
            http,
            usage: UsageAccumulator::default(),
            on_usage: None,
        })
    }

    /// Install a callback observing (input, output) tokens per call
    pub fn set_usage_callback(&mut self, callback: UsageCallback) {
        self.on_usage = Some(callback);
    }

    /// Override the API base URL (tests)
    #[cfg(test)]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn request_once(&self, prompt: &str, temperature: f64, max_tokens: u32) -> Result<(String, u64, u64)> {
        let url = format!("{}/{}:generateContent?key={}", self.base_url, self.model, self.api_key);

        let body = serde_json::json!({
            "contents": [{"parts": [{"text": prompt}]}],
            "generationConfig": {
                "temperature": temperature,
                "topP": 0.95,
                "topK": 40,
                "maxOutputTokens": max_tokens,
            }
        });

        let response = self.http.post(&url).json(&body).send().await?;

        if response.status().as_u16() == 429 {
            return Err(EngineError::ProviderRateLimited {
                retry_after: Duration::from_secs(60),
            });
        }
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            return Err(EngineError::ProviderConnectionFailed(format!(
                "Gemini HTTP {}: {}",
                status, text
            )));
        }

        let api: GeminiResponse = response
            .json()
            .await
            .map_err(|e| EngineError::ProviderConnectionFailed(e.to_string()))?;

        let text = api
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content.parts.into_iter().next())
            .map(|p| p.text)
            .unwrap_or_default();

        if text.trim().is_empty() {
            return Err(EngineError::ProviderEmpty("Gemini returned empty response".into()));
        }

        let usage = api.usage_metadata.unwrap_or_default();
        Ok((text, usage.prompt_token_count, usage.candidates_token_count))
    }
}

#[async_trait]
impl LlmClient for GeminiClient {
    fn name(&self) -> &'static str {
        "gemini"
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
            let started = Instant::now();
            match self.request_once(&prompt, temperature, max_tokens).await {
                Ok((text, tokens_in, tokens_out)) => {
                    let request_id = self.usage.record(tokens_in, tokens_out);
                    if let Some(cb) = &self.on_usage {
                        cb(tokens_in, tokens_out);
                    }
                    debug!(
                        request_id,
                        tokens_in,
                        tokens_out,
                        latency_ms = started.elapsed().as_millis() as u64,
                        "gemini call complete"
                    );
                    return Ok(text);
                }
                Err(e) => {
                    warn!(attempt, max_retries = MAX_RETRIES, error = %e, "gemini call failed");
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

// Gemini API response types

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(rename = "usageMetadata")]
    usage_metadata: Option<GeminiUsage>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: GeminiContent,
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Deserialize)]
struct GeminiPart {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Default, Deserialize)]
struct GeminiUsage {
    #[serde(rename = "promptTokenCount", default)]
    prompt_token_count: u64,
    #[serde(rename = "candidatesTokenCount", default)]
    candidates_token_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allowed_model_accepted() {
        assert!(GeminiClient::new("key", "gemini-2.5-pro").is_ok());
        assert!(GeminiClient::new("key", "gemini-3-flash").is_ok());
    }

    #[test]
    fn test_unknown_model_rejected() {
        let err = GeminiClient::new("key", "gemini-1.0-ultra").unwrap_err();
        assert!(matches!(err, EngineError::ConfigInvalid(_)));
    }

    #[test]
    fn test_parse_response_shape() {
        let raw = r#"{
            "candidates": [{"content": {"parts": [{"text": "hello"}]}}],
            "usageMetadata": {"promptTokenCount": 12, "candidatesTokenCount": 3}
        }"#;
        let parsed: GeminiResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.candidates[0].content.parts[0].text, "hello");
        assert_eq!(parsed.usage_metadata.unwrap().prompt_token_count, 12);
    }

    #[test]
    fn test_parse_response_without_usage() {
        let raw = r#"{"candidates": []}"#;
        let parsed: GeminiResponse = serde_json::from_str(raw).unwrap();
        assert!(parsed.candidates.is_empty());
        assert!(parsed.usage_metadata.is_none());
    }
}
