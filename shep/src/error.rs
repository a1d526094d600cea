//! Engine error taxonomy

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur anywhere in the supervision engine
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("Missing configuration: {0}")]
    MissingConfig(String),

    #[error("Failed to spawn session: {0}")]
    SessionSpawnFailed(String),

    #[error("Session died: {0}")]
    SessionDied(String),

    #[error("Failed to deliver input to session: {0}")]
    InputFailed(String),

    #[error("Provider connection failed: {0}")]
    ProviderConnectionFailed(String),

    #[error("Provider rate limited, retry after {retry_after:?}")]
    ProviderRateLimited { retry_after: Duration },

    #[error("Provider returned an empty response: {0}")]
    ProviderEmpty(String),

    #[error("All LLM providers failed. Last error: {last_error}")]
    AllProvidersUnavailable { last_error: String },

    #[error("Failed to parse JSON: {message}")]
    JsonParseFailed { message: String, raw: String },

    #[error("Task timed out after {0:?}")]
    TaskTimeout(Duration),

    #[error("Review loop cycle detected: {0}")]
    CycleDetected(String),

    #[error("Escalation required: {0}")]
    EscalationRequired(String),

    #[error("VCS conflict: {0}")]
    VcsConflict(String),

    #[error("VCS authentication failed: {0}")]
    VcsAuth(String),

    #[error("VCS error: {0}")]
    VcsOther(String),
}

impl EngineError {
    /// Check if this is a rate limit error
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, EngineError::ProviderRateLimited { .. })
    }

    /// Check if a provider call that failed with this error is worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::ProviderRateLimited { .. }
                | EngineError::ProviderConnectionFailed(_)
                | EngineError::ProviderEmpty(_)
                | EngineError::TaskTimeout(_)
        )
    }

    /// Get the retry delay if this is a rate limit error
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            EngineError::ProviderRateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }

    /// The raw text of a failed JSON parse, when preserved
    pub fn raw_text(&self) -> Option<&str> {
        match self {
            EngineError::JsonParseFailed { raw, .. } => Some(raw),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            EngineError::TaskTimeout(Duration::from_secs(120))
        } else {
            EngineError::ProviderConnectionFailed(err.to_string())
        }
    }
}

/// Engine-wide result alias
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_rate_limit() {
        let err = EngineError::ProviderRateLimited {
            retry_after: Duration::from_secs(60),
        };
        assert!(err.is_rate_limit());
        assert!(!EngineError::ProviderEmpty("x".into()).is_rate_limit());
    }

    #[test]
    fn test_is_retryable() {
        assert!(
            EngineError::ProviderRateLimited {
                retry_after: Duration::from_secs(1)
            }
            .is_retryable()
        );
        assert!(EngineError::ProviderConnectionFailed("reset".into()).is_retryable());
        assert!(EngineError::TaskTimeout(Duration::from_secs(30)).is_retryable());

        assert!(
            !EngineError::JsonParseFailed {
                message: "bad".into(),
                raw: "{".into()
            }
            .is_retryable()
        );
        assert!(!EngineError::SessionSpawnFailed("tmux".into()).is_retryable());
    }

    #[test]
    fn test_retry_after() {
        let err = EngineError::ProviderRateLimited {
            retry_after: Duration::from_secs(42),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(42)));
        assert_eq!(EngineError::VcsOther("x".into()).retry_after(), None);
    }

    #[test]
    fn test_json_parse_preserves_raw() {
        let err = EngineError::JsonParseFailed {
            message: "no json".into(),
            raw: "the model said nothing useful".into(),
        };
        assert_eq!(err.raw_text(), Some("the model said nothing useful"));
    }
}
