//! LLM provider routing
//!
//! Orders providers by the configured primary, enforces a token-bucket
//! rate limit, keeps a circuit breaker per provider, retries with
//! exponential backoff, and falls back before giving up.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::LlmConfig;
use crate::error::{EngineError, Result};
use crate::llm::client::LlmClient;
use crate::llm::{GeminiClient, GlmClient};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation
    Closed,
    /// Failing, reject requests
    Open,
    /// Testing whether the provider recovered
    HalfOpen,
}

struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    half_open_calls: u32,
}

/// Per-provider circuit breaker.
///
/// Prevents cascading failures by temporarily disabling a failing
/// provider. State transitions are atomic under the internal mutex.
pub struct CircuitBreaker {
    failure_threshold: u32,
    recovery_timeout: Duration,
    half_open_max_calls: u32,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, recovery_timeout: Duration, half_open_max_calls: u32) -> Self {
        Self {
            failure_threshold,
            recovery_timeout,
            half_open_max_calls,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
                half_open_calls: 0,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().unwrap().state
    }

    /// Check whether a request may go out, advancing open -> half-open
    /// once the recovery timeout has passed.
    pub fn can_execute(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if let Some(last) = inner.last_failure
                    && last.elapsed() >= self.recovery_timeout
                {
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_calls = 1;
                    info!("circuit breaker: OPEN -> HALF_OPEN");
                    return true;
                }
                false
            }
            CircuitState::HalfOpen => {
                if inner.half_open_calls < self.half_open_max_calls {
                    inner.half_open_calls += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == CircuitState::HalfOpen {
            inner.state = CircuitState::Closed;
            info!("circuit breaker: HALF_OPEN -> CLOSED (recovered)");
        }
        inner.failure_count = 0;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.failure_count += 1;
        inner.last_failure = Some(Instant::now());

        if inner.state == CircuitState::HalfOpen {
            inner.state = CircuitState::Open;
            warn!("circuit breaker: HALF_OPEN -> OPEN (still failing)");
        } else if inner.failure_count >= self.failure_threshold {
            inner.state = CircuitState::Open;
            warn!(failures = inner.failure_count, "circuit breaker: CLOSED -> OPEN");
        }
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.last_failure = None;
        inner.half_open_calls = 0;
    }
}

struct LimiterInner {
    tokens: f64,
    last_update: Instant,
}

/// Token bucket rate limiter, configured as requests per minute.
///
/// `acquire` holds the internal lock while waiting, so calls through the
/// router serialize on it.
pub struct RateLimiter {
    requests_per_minute: u32,
    inner: tokio::sync::Mutex<LimiterInner>,
}

impl RateLimiter {
    pub fn new(requests_per_minute: u32) -> Self {
        Self {
            requests_per_minute,
            inner: tokio::sync::Mutex::new(LimiterInner {
                tokens: requests_per_minute as f64,
                last_update: Instant::now(),
            }),
        }
    }

    /// Wait until a request may be made
    pub async fn acquire(&self) {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        let elapsed = now.duration_since(inner.last_update).as_secs_f64();
        let rpm = self.requests_per_minute as f64;

        inner.tokens = (inner.tokens + elapsed * (rpm / 60.0)).min(rpm);
        inner.last_update = now;

        if inner.tokens < 1.0 {
            let wait = (1.0 - inner.tokens) * (60.0 / rpm);
            debug!(wait_secs = wait, "rate limit: waiting");
            tokio::time::sleep(Duration::from_secs_f64(wait)).await;
            inner.tokens = 1.0;
            inner.last_update = Instant::now();
        }

        inner.tokens -= 1.0;
    }
}

/// Router configuration
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub primary: String,
    pub enable_fallback: bool,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub requests_per_minute: u32,
    pub circuit_failure_threshold: u32,
    pub circuit_recovery_timeout: Duration,
    pub half_open_max_calls: u32,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            primary: "gemini".to_string(),
            enable_fallback: true,
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            requests_per_minute: 60,
            circuit_failure_threshold: 5,
            circuit_recovery_timeout: Duration::from_secs(60),
            half_open_max_calls: 1,
        }
    }
}

impl From<&LlmConfig> for RouterConfig {
    fn from(config: &LlmConfig) -> Self {
        Self {
            primary: config.primary.clone(),
            enable_fallback: config.enable_fallback,
            max_retries: config.max_retries,
            retry_delay: Duration::from_secs_f64(config.retry_delay_secs),
            requests_per_minute: config.requests_per_minute,
            circuit_failure_threshold: config.circuit_failure_threshold,
            circuit_recovery_timeout: Duration::from_secs_f64(config.circuit_recovery_timeout_secs),
            half_open_max_calls: 1,
        }
    }
}

/// Per-provider health check result
#[derive(Debug, Clone)]
pub struct ProviderHealth {
    pub ok: bool,
    pub error: Option<String>,
}

struct ProviderSlot {
    name: String,
    client: Arc<dyn LlmClient>,
    breaker: CircuitBreaker,
}

/// Switchboard over the LLM providers.
///
/// Owns both clients; no other component holds one directly.
pub struct LlmRouter {
    config: RouterConfig,
    rate_limiter: RateLimiter,
    providers: Vec<ProviderSlot>,
    stats: Mutex<HashMap<String, u64>>,
    last_provider: Mutex<Option<String>>,
}

impl LlmRouter {
    /// Build the router and its provider clients from configuration.
    ///
    /// At least one provider key must resolve.
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let mut clients: Vec<Arc<dyn LlmClient>> = Vec::new();

        if let Some(key) = config.gemini_api_key() {
            clients.push(Arc::new(GeminiClient::new(key, config.gemini_model.clone())?));
        }
        if let Some(key) = config.glm_api_key() {
            clients.push(Arc::new(GlmClient::new(key, Some(config.glm_model.clone()))?));
        }

        if clients.is_empty() {
            return Err(EngineError::MissingConfig(format!(
                "No LLM provider keys found (checked {} and {})",
                config.gemini_api_key_env, config.glm_api_key_env
            )));
        }

        Ok(Self::with_clients(RouterConfig::from(config), clients))
    }

    /// Build the router over already-constructed clients
    pub fn with_clients(config: RouterConfig, clients: Vec<Arc<dyn LlmClient>>) -> Self {
        let mut stats = HashMap::new();
        stats.insert("fallbacks".to_string(), 0);
        stats.insert("circuit_breaks".to_string(), 0);

        let providers = clients
            .into_iter()
            .map(|client| {
                let name = client.name().to_string();
                stats.insert(format!("{}_calls", name), 0);
                stats.insert(format!("{}_errors", name), 0);
                ProviderSlot {
                    name,
                    client,
                    breaker: CircuitBreaker::new(
                        config.circuit_failure_threshold,
                        config.circuit_recovery_timeout,
                        config.half_open_max_calls,
                    ),
                }
            })
            .collect();

        Self {
            rate_limiter: RateLimiter::new(config.requests_per_minute),
            config,
            providers,
            stats: Mutex::new(stats),
            last_provider: Mutex::new(None),
        }
    }

    /// Which provider answered the last successful call
    pub fn last_provider(&self) -> Option<String> {
        self.last_provider.lock().unwrap().clone()
    }

    /// Usage counter snapshot
    pub fn get_stats(&self) -> HashMap<String, u64> {
        self.stats.lock().unwrap().clone()
    }

    /// Current circuit state for a provider
    pub fn circuit_state(&self, provider: &str) -> Option<CircuitState> {
        self.providers.iter().find(|p| p.name == provider).map(|p| p.breaker.state())
    }

    /// Generate a text response with retry, circuit breaking, and fallback
    pub async fn generate(&self, prompt: &str, temperature: f64, json_mode: bool) -> Result<String> {
        self.call_with_retry("generate", |client| {
            let prompt = prompt.to_string();
            async move { client.generate(&prompt, temperature, json_mode, 2048).await }
        })
        .await
    }

    /// Generate with full accounting: which provider answered, the model
    /// it ran, and the wall-clock latency of the whole routed call
    pub async fn generate_detailed(
        &self,
        prompt: &str,
        temperature: f64,
        json_mode: bool,
    ) -> Result<crate::llm::client::LlmResponse> {
        let started = Instant::now();
        let content = self.generate(prompt, temperature, json_mode).await?;

        let provider = self.last_provider().unwrap_or_default();
        let model = self
            .providers
            .iter()
            .find(|p| p.name == provider)
            .map(|p| p.client.model())
            .unwrap_or_default();

        Ok(crate::llm::client::LlmResponse {
            content,
            provider,
            model,
            tokens_in: None,
            tokens_out: None,
            latency: Some(started.elapsed()),
        })
    }

    /// Generate and parse a JSON response
    pub async fn generate_json(&self, prompt: &str, temperature: f64) -> Result<serde_json::Value> {
        self.call_with_retry("generate_json", |client| {
            let prompt = prompt.to_string();
            async move { client.generate_json(&prompt, temperature).await }
        })
        .await
    }

    /// Fan out a trivial call to every provider with a deadline
    pub async fn health_check(&self, timeout: Duration) -> HashMap<String, ProviderHealth> {
        let checks = self.providers.iter().map(|slot| {
            let client = slot.client.clone();
            let name = slot.name.clone();
            async move {
                let result = tokio::time::timeout(timeout, client.generate("Say 'ok'", 0.0, false, 64)).await;
                let health = match result {
                    Ok(Ok(response)) => ProviderHealth {
                        ok: !response.is_empty(),
                        error: None,
                    },
                    Ok(Err(e)) => ProviderHealth {
                        ok: false,
                        error: Some(e.to_string()),
                    },
                    Err(_) => ProviderHealth {
                        ok: false,
                        error: Some(format!("Timeout ({:?})", timeout)),
                    },
                };
                (name, health)
            }
        });

        futures::future::join_all(checks).await.into_iter().collect()
    }

    fn ordered_providers(&self) -> Vec<&ProviderSlot> {
        let mut order: Vec<&ProviderSlot> = Vec::with_capacity(self.providers.len());
        for slot in &self.providers {
            if slot.name == self.config.primary {
                order.insert(0, slot);
            } else {
                order.push(slot);
            }
        }
        if !self.config.enable_fallback {
            order.truncate(1);
        }
        order
    }

    fn bump(&self, key: &str) {
        *self.stats.lock().unwrap().entry(key.to_string()).or_insert(0) += 1;
    }

    async fn call_with_retry<T, F, Fut>(&self, method: &str, call: F) -> Result<T>
    where
        F: Fn(Arc<dyn LlmClient>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut last_error: Option<EngineError> = None;

        for slot in self.ordered_providers() {
            if !slot.breaker.can_execute() {
                debug!(provider = %slot.name, "circuit breaker open, skipping");
                self.bump("circuit_breaks");
                continue;
            }

            for attempt in 1..=self.config.max_retries {
                debug!(provider = %slot.name, method, attempt, max = self.config.max_retries, "trying provider");
                self.rate_limiter.acquire().await;

                match call(slot.client.clone()).await {
                    Ok(response) => {
                        slot.breaker.record_success();
                        *self.last_provider.lock().unwrap() = Some(slot.name.clone());
                        self.bump(&format!("{}_calls", slot.name));

                        if slot.name != self.config.primary && self.config.enable_fallback {
                            self.bump("fallbacks");
                            info!(provider = %slot.name, "used fallback provider");
                        }

                        return Ok(response);
                    }
                    Err(e) => {
                        self.bump(&format!("{}_errors", slot.name));
                        warn!(provider = %slot.name, method, attempt, error = %e, "provider call failed");
                        last_error = Some(e);

                        if attempt < self.config.max_retries {
                            tokio::time::sleep(self.config.retry_delay * 2u32.pow(attempt - 1)).await;
                        }
                    }
                }
            }

            slot.breaker.record_failure();
            warn!(provider = %slot.name, attempts = self.config.max_retries, "provider exhausted retries");
        }

        Err(EngineError::AllProvidersUnavailable {
            last_error: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no providers available".to_string()),
        })
    }
}
