//! LLM provider clients and routing
//!
//! Two concrete HTTP providers (Gemini and GLM on Cerebras) behind a
//! shared [`LlmClient`] capability, plus the [`LlmRouter`] that orders
//! them, rate limits, circuit breaks, and falls back.

pub mod client;
pub mod gemini;
pub mod glm;
pub mod json;
pub mod router;

pub use client::{LlmClient, LlmResponse, LlmUsage, UsageCallback};
pub use gemini::GeminiClient;
pub use glm::GlmClient;
pub use json::extract_json;
pub use router::{CircuitBreaker, CircuitState, LlmRouter, ProviderHealth, RateLimiter, RouterConfig};
