//! Shepherd configuration types and loading
//!
//! Configuration is resolved in three layers: a YAML config file
//! (explicit path, project-local `.shepherd.yml`, then the user config
//! dir), built-in defaults, and finally environment variable overrides.

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main shepherd configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// LLM provider and router configuration
    pub llm: LlmConfig,

    /// Worker session configuration
    pub worker: WorkerSettings,

    /// Watchdog configuration
    pub watchdog: WatchdogSettings,

    /// Analyzer configuration
    pub analyzer: AnalyzerSettings,

    /// Review loop configuration
    pub review: ReviewSettings,

    /// Storage paths
    pub storage: StorageConfig,
}

impl Config {
    /// Load configuration with fallback chain, then apply env overrides
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        let mut config = Self::load_file_layer(config_path)?;
        config.apply_env();
        Ok(config)
    }

    fn load_file_layer(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        let local_config = PathBuf::from(".shepherd.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("shepherd").join("shepherd.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Apply environment variable overrides on top of file/default values
    pub fn apply_env(&mut self) {
        env_string("GEMINI_API_KEY", &mut self.llm.gemini_api_key_value);
        env_string("CEREBRAS_API_KEY", &mut self.llm.glm_api_key_value);
        env_parse("SHEPHERD_LLM_MAX_RETRIES", &mut self.llm.max_retries);
        env_parse("SHEPHERD_LLM_RETRY_DELAY", &mut self.llm.retry_delay_secs);
        env_parse("SHEPHERD_LLM_RPM", &mut self.llm.requests_per_minute);

        env_path("SHEPHERD_PROJECT_PATH", &mut self.worker.project_path);
        env_parse("SHEPHERD_CHECK_INTERVAL", &mut self.worker.check_interval_secs);
        env_parse("SHEPHERD_IDLE_SESSION_TIMEOUT", &mut self.worker.idle_session_timeout_secs);
        if let Ok(mode) = std::env::var("SHEPHERD_DISPLAY_MODE") {
            self.worker.visible = mode.eq_ignore_ascii_case("visible");
        }

        env_parse("SHEPHERD_ESCALATE_AFTER", &mut self.watchdog.escalate_after);
        env_parse("SHEPHERD_WATCHDOG_INTERVAL", &mut self.watchdog.check_interval_secs);
        env_parse("SHEPHERD_WATCHDOG_TIMEOUT", &mut self.watchdog.stuck_threshold_secs);

        env_parse("SHEPHERD_ANALYZER_TRUNCATE", &mut self.analyzer.truncate_length);
        env_parse("SHEPHERD_ANALYZER_START_RATIO", &mut self.analyzer.truncate_start_ratio);
        env_parse("SHEPHERD_HISTORY_CAP", &mut self.analyzer.history_cap);

        env_path("SHEPHERD_LOG_DIR", &mut self.storage.log_dir);
        env_path("SHEPHERD_STATE_DIR", &mut self.storage.state_dir);
    }
}

fn env_string(name: &str, slot: &mut Option<String>) {
    if let Ok(value) = std::env::var(name)
        && !value.is_empty()
    {
        *slot = Some(value);
    }
}

fn env_path(name: &str, slot: &mut PathBuf) {
    if let Ok(value) = std::env::var(name)
        && !value.is_empty()
    {
        *slot = PathBuf::from(value);
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, slot: &mut T) {
    if let Ok(value) = std::env::var(name)
        && let Ok(parsed) = value.parse::<T>()
    {
        *slot = parsed;
    }
}

/// LLM provider and router configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Primary provider ("gemini" or "glm")
    pub primary: String,

    /// Gemini model identifier (must be on the allow-list)
    #[serde(rename = "gemini-model")]
    pub gemini_model: String,

    /// GLM model identifier
    #[serde(rename = "glm-model")]
    pub glm_model: String,

    /// Environment variable holding the Gemini API key
    #[serde(rename = "gemini-api-key-env")]
    pub gemini_api_key_env: String,

    /// Environment variable holding the GLM API key
    #[serde(rename = "glm-api-key-env")]
    pub glm_api_key_env: String,

    /// Resolved Gemini key (env override; never serialized)
    #[serde(skip)]
    pub gemini_api_key_value: Option<String>,

    /// Resolved GLM key (env override; never serialized)
    #[serde(skip)]
    pub glm_api_key_value: Option<String>,

    /// Enable fallback to the secondary provider
    #[serde(rename = "enable-fallback")]
    pub enable_fallback: bool,

    /// Retries per provider before falling over
    #[serde(rename = "max-retries")]
    pub max_retries: u32,

    /// Base retry delay in seconds (exponential backoff)
    #[serde(rename = "retry-delay-secs")]
    pub retry_delay_secs: f64,

    /// Token bucket rate limit
    #[serde(rename = "requests-per-minute")]
    pub requests_per_minute: u32,

    /// Circuit breaker failure threshold
    #[serde(rename = "circuit-failure-threshold")]
    pub circuit_failure_threshold: u32,

    /// Circuit breaker recovery timeout in seconds
    #[serde(rename = "circuit-recovery-timeout-secs")]
    pub circuit_recovery_timeout_secs: f64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            primary: "gemini".to_string(),
            gemini_model: "gemini-2.5-pro".to_string(),
            glm_model: "zai-glm-4.7".to_string(),
            gemini_api_key_env: "GEMINI_API_KEY".to_string(),
            glm_api_key_env: "CEREBRAS_API_KEY".to_string(),
            gemini_api_key_value: None,
            glm_api_key_value: None,
            enable_fallback: true,
            max_retries: 3,
            retry_delay_secs: 1.0,
            requests_per_minute: 60,
            circuit_failure_threshold: 5,
            circuit_recovery_timeout_secs: 60.0,
        }
    }
}

impl LlmConfig {
    /// Resolve the Gemini API key from override or environment
    pub fn gemini_api_key(&self) -> Option<String> {
        self.gemini_api_key_value
            .clone()
            .or_else(|| std::env::var(&self.gemini_api_key_env).ok())
            .filter(|k| !k.is_empty())
    }

    /// Resolve the GLM API key from override or environment
    pub fn glm_api_key(&self) -> Option<String> {
        self.glm_api_key_value
            .clone()
            .or_else(|| std::env::var(&self.glm_api_key_env).ok())
            .filter(|k| !k.is_empty())
    }
}

/// Worker session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Project working directory workers operate in
    #[serde(rename = "project-path")]
    pub project_path: PathBuf,

    /// Base log poll interval in seconds
    #[serde(rename = "check-interval-secs")]
    pub check_interval_secs: f64,

    /// Open native terminal windows instead of the multiplexer
    pub visible: bool,

    /// Maximum worker restarts per task
    #[serde(rename = "max-retries")]
    pub max_retries: u32,

    /// Seconds without output change before a session counts as stuck
    #[serde(rename = "stuck-timeout-secs")]
    pub stuck_timeout_secs: f64,

    /// Idle threshold for the stale-session sweep, in seconds
    #[serde(rename = "idle-session-timeout-secs")]
    pub idle_session_timeout_secs: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            project_path: PathBuf::from("."),
            check_interval_secs: 60.0,
            visible: false,
            max_retries: 3,
            stuck_timeout_secs: 300.0,
            idle_session_timeout_secs: 30 * 60,
        }
    }
}

/// Watchdog configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogSettings {
    /// Health check interval in seconds
    #[serde(rename = "check-interval-secs")]
    pub check_interval_secs: u64,

    /// Seconds without output before escalating
    #[serde(rename = "stuck-threshold-secs")]
    pub stuck_threshold_secs: u64,

    /// Enforcement attempts before escalating to a human
    #[serde(rename = "escalate-after")]
    pub escalate_after: u32,
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self {
            check_interval_secs: 300,
            stuck_threshold_secs: 3600,
            escalate_after: 5,
        }
    }
}

/// Analyzer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerSettings {
    /// Maximum worker output length submitted to the analyzer
    #[serde(rename = "truncate-length")]
    pub truncate_length: usize,

    /// Share of the truncated text taken from the start (rest from the end)
    #[serde(rename = "truncate-start-ratio")]
    pub truncate_start_ratio: f64,

    /// Conversation history cap for the legacy controller path
    #[serde(rename = "history-cap")]
    pub history_cap: usize,
}

impl Default for AnalyzerSettings {
    fn default() -> Self {
        Self {
            truncate_length: 3000,
            truncate_start_ratio: 0.4,
            history_cap: 100,
        }
    }
}

/// Review loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReviewSettings {
    /// Maximum executor/reviewer iterations
    #[serde(rename = "max-iterations")]
    pub max_iterations: u32,

    /// Worker completion timeout per invocation, in seconds
    #[serde(rename = "worker-timeout-secs")]
    pub worker_timeout_secs: u64,
}

impl Default for ReviewSettings {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            worker_timeout_secs: 1800,
        }
    }
}

/// Storage paths
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory for log files
    #[serde(rename = "log-dir")]
    pub log_dir: PathBuf,

    /// Directory for persisted engine state
    #[serde(rename = "state-dir")]
    pub state_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let base = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            log_dir: base.join("shepherd").join("logs"),
            state_dir: base.join("shepherd").join("state"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.llm.primary, "gemini");
        assert!(config.llm.enable_fallback);
        assert_eq!(config.llm.max_retries, 3);
        assert_eq!(config.analyzer.truncate_length, 3000);
        assert!((config.analyzer.truncate_start_ratio - 0.4).abs() < f64::EPSILON);
        assert_eq!(config.analyzer.history_cap, 100);
        assert_eq!(config.review.max_iterations, 10);
    }

    #[test]
    fn test_parse_yaml_config() {
        let yaml = r#"
llm:
  primary: glm
  requests-per-minute: 30
worker:
  check-interval-secs: 15.0
  visible: true
review:
  max-iterations: 4
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.llm.primary, "glm");
        assert_eq!(config.llm.requests_per_minute, 30);
        assert!((config.worker.check_interval_secs - 15.0).abs() < f64::EPSILON);
        assert!(config.worker.visible);
        assert_eq!(config.review.max_iterations, 4);
        // Unspecified sections keep defaults
        assert_eq!(config.watchdog.escalate_after, 5);
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        unsafe {
            std::env::set_var("SHEPHERD_ESCALATE_AFTER", "9");
            std::env::set_var("SHEPHERD_CHECK_INTERVAL", "7.5");
            std::env::set_var("SHEPHERD_DISPLAY_MODE", "visible");
        }

        let mut config = Config::default();
        config.apply_env();

        assert_eq!(config.watchdog.escalate_after, 9);
        assert!((config.worker.check_interval_secs - 7.5).abs() < f64::EPSILON);
        assert!(config.worker.visible);

        unsafe {
            std::env::remove_var("SHEPHERD_ESCALATE_AFTER");
            std::env::remove_var("SHEPHERD_CHECK_INTERVAL");
            std::env::remove_var("SHEPHERD_DISPLAY_MODE");
        }
    }

    #[test]
    #[serial]
    fn test_env_override_ignores_garbage() {
        unsafe {
            std::env::set_var("SHEPHERD_ESCALATE_AFTER", "not-a-number");
        }

        let mut config = Config::default();
        config.apply_env();
        assert_eq!(config.watchdog.escalate_after, 5);

        unsafe {
            std::env::remove_var("SHEPHERD_ESCALATE_AFTER");
        }
    }

    #[test]
    fn test_load_missing_file_fails() {
        let path = PathBuf::from("/nonexistent/shepherd.yml");
        assert!(Config::load(Some(&path)).is_err());
    }
}
