//! Shared LLM client capability

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::Result;
use crate::llm::json::extract_json;

/// Callback invoked with (input_tokens, output_tokens) after each call
pub type UsageCallback = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Token usage accumulated over a client's lifetime
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LlmUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl LlmUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Thread-safe usage accumulator shared by the provider clients
#[derive(Default)]
pub struct UsageAccumulator {
    input_tokens: AtomicU64,
    output_tokens: AtomicU64,
    requests: AtomicU64,
}

impl UsageAccumulator {
    pub fn record(&self, input: u64, output: u64) -> u64 {
        self.input_tokens.fetch_add(input, Ordering::Relaxed);
        self.output_tokens.fetch_add(output, Ordering::Relaxed);
        self.requests.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn next_request_id(&self) -> u64 {
        self.requests.load(Ordering::Relaxed) + 1
    }

    pub fn snapshot(&self) -> LlmUsage {
        LlmUsage {
            input_tokens: self.input_tokens.load(Ordering::Relaxed),
            output_tokens: self.output_tokens.load(Ordering::Relaxed),
        }
    }
}

/// One completed generation with its accounting
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub content: String,
    pub provider: String,
    pub model: String,
    pub tokens_in: Option<u64>,
    pub tokens_out: Option<u64>,
    pub latency: Option<std::time::Duration>,
}

/// Capability shared by all LLM providers
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Short provider name used in stats and logs
    fn name(&self) -> &'static str;

    /// The model this client is configured for
    fn model(&self) -> String;

    /// Generate a text response.
    ///
    /// With `json_mode` the prompt gains a JSON-only instruction and the
    /// response token cap is lowered to 1024.
    async fn generate(&self, prompt: &str, temperature: f64, json_mode: bool, max_tokens: u32) -> Result<String>;

    /// Generate and parse a JSON response
    async fn generate_json(&self, prompt: &str, temperature: f64) -> Result<serde_json::Value> {
        let response = self.generate(prompt, temperature, true, 1024).await?;
        extract_json(&response)
    }

    /// Token usage accumulated this session
    fn session_usage(&self) -> LlmUsage;
}

#[cfg(test)]
pub mod mock {
    //! Scripted LLM client for tests

    use super::*;
    use crate::error::EngineError;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// One scripted outcome for a mock call
    pub enum MockResponse {
        Text(String),
        Error(fn() -> EngineError),
    }

    /// LLM client that replays scripted responses and records prompts
    pub struct MockLlmClient {
        name: &'static str,
        responses: Mutex<VecDeque<MockResponse>>,
        default_response: Option<String>,
        pub prompts: Mutex<Vec<String>>,
        calls: AtomicU64,
    }

    impl MockLlmClient {
        pub fn new(name: &'static str, responses: Vec<MockResponse>) -> Self {
            Self {
                name,
                responses: Mutex::new(responses.into()),
                default_response: None,
                prompts: Mutex::new(Vec::new()),
                calls: AtomicU64::new(0),
            }
        }

        /// A client that always answers with the same text
        pub fn always(name: &'static str, text: &str) -> Self {
            let mut client = Self::new(name, vec![]);
            client.default_response = Some(text.to_string());
            client
        }

        pub fn call_count(&self) -> u64 {
            self.calls.load(Ordering::Relaxed)
        }
    }

    #[async_trait]
    impl LlmClient for MockLlmClient {
        fn name(&self) -> &'static str {
            self.name
        }

        fn model(&self) -> String {
            "mock-model".to_string()
        }

        async fn generate(&self, prompt: &str, _temperature: f64, _json_mode: bool, _max_tokens: u32) -> Result<String> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            self.prompts.lock().unwrap().push(prompt.to_string());

            match self.responses.lock().unwrap().pop_front() {
                Some(MockResponse::Text(text)) => Ok(text),
                Some(MockResponse::Error(make)) => Err(make()),
                None => match &self.default_response {
                    Some(text) => Ok(text.clone()),
                    None => Err(EngineError::ProviderEmpty("mock exhausted".into())),
                },
            }
        }

        fn session_usage(&self) -> LlmUsage {
            LlmUsage::default()
        }
    }
}
