//! Console recovery and nudge logic
//!
//! Detects terminal/console crashes in the output tail and gently pushes
//! the CLI to continue instead of tearing the session down.

use async_trait::async_trait;
use regex::Regex;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

/// Minimal session surface the nudger needs
#[async_trait]
pub trait NudgeTarget: Send + Sync {
    async fn is_alive(&self) -> bool;
    async fn send_input(&self, text: &str) -> crate::error::Result<()>;
    async fn capture_output(&self) -> String;
}

/// Settings for the recovery flow
#[derive(Debug, Clone)]
pub struct ConsoleRecoveryConfig {
    pub max_attempts: u32,
    pub cooldown: Duration,
    pub continue_delay: Duration,
    pub initial_message: String,
    pub continue_message: String,
}

impl Default for ConsoleRecoveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            cooldown: Duration::from_secs(30),
            continue_delay: Duration::from_secs(60),
            initial_message: "О боже, ошибка! Не закрывай терминал. Давайте начнем всё сначала.".to_string(),
            continue_message: "Продолжай".to_string(),
        }
    }
}

const ERROR_PATTERNS: &[&str] = &[
    r"(terminal|console|tty).*(error|crash|died|closed|terminated)",
    r"session .* (terminated|closed|died|crashed)",
    r"tmux:.*(no server|server exited|not running)",
    r"connection (reset|refused|closed|lost|aborted)",
    r"socket hang up",
    r"broken pipe",
    r"unexpected (eof|error)",
    r"segmentation fault|core dumped|panic",
    r"process .* exited with code",
    r"exit code [1-9]",
    r"error:\s*403|error:\s*429|rate limit",
    r"internal error|fatal error",
    r"ошибка|краш|вылет(ел|ела|ело)|соединение.*(сброшено|разорвано)",
];

const ENTER_PROMPT_PATTERNS: &[&str] = &[
    r"press (enter|return|any key)",
    r"press any key to continue",
    r"нажмите (enter|return|любую клавишу)",
];

/// How many trailing non-empty lines detection looks at
const SCAN_LINES: usize = 50;

/// Detects console failures and nudges the session back to life
pub struct ConsoleRecovery {
    config: ConsoleRecoveryConfig,
    error_res: Vec<Regex>,
    enter_res: Vec<Regex>,
    attempts: u32,
    last_attempt: Option<Instant>,
}

impl ConsoleRecovery {
    pub fn new(config: ConsoleRecoveryConfig) -> Self {
        let compile = |patterns: &[&str]| {
            patterns
                .iter()
                .map(|p| Regex::new(&format!("(?i){}", p)).unwrap())
                .collect::<Vec<_>>()
        };

        Self {
            error_res: compile(ERROR_PATTERNS),
            enter_res: compile(ENTER_PROMPT_PATTERNS),
            config,
            attempts: 0,
            last_attempt: None,
        }
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
        self.last_attempt = None;
    }

    pub fn attempts_left(&self) -> u32 {
        self.config.max_attempts.saturating_sub(self.attempts)
    }

    /// Return a short reason if the output tail looks like a console crash
    pub fn detect_issue(&self, output: &str) -> Option<String> {
        if output.is_empty() {
            return None;
        }

        let lines: Vec<&str> = output.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
        let start = lines.len().saturating_sub(SCAN_LINES);

        for line in lines[start..].iter().rev() {
            for pattern in &self.error_res {
                if pattern.is_match(line) {
                    return Some(line.chars().take(160).collect());
                }
            }
        }
        None
    }

    fn needs_enter(&self, output: &str) -> bool {
        self.enter_res.iter().any(|re| re.is_match(output))
    }

    /// Try to recover the console by nudging it.
    ///
    /// Returns true iff the scrollback tail changed after the nudges.
    pub async fn attempt_recovery(&mut self, target: &dyn NudgeTarget, output: &str) -> bool {
        if self.attempts >= self.config.max_attempts {
            return false;
        }
        if let Some(last) = self.last_attempt
            && last.elapsed() < self.config.cooldown
        {
            return false;
        }

        self.attempts += 1;
        self.last_attempt = Some(Instant::now());

        if !target.is_alive().await {
            return false;
        }

        let before = tail_hash(output);

        // If it asks to press Enter, do that first
        if self.needs_enter(output)
            && let Err(e) = target.send_input("").await
        {
            warn!(error = %e, "recovery enter press failed");
            return false;
        }

        // Human-like push sequence
        let sequence = [
            (self.config.initial_message.clone(), Duration::from_secs(2)),
            (self.config.continue_message.clone(), self.config.continue_delay),
            (self.config.continue_message.clone(), Duration::from_secs(2)),
        ];
        for (message, delay) in sequence {
            if let Err(e) = target.send_input(&message).await {
                warn!(error = %e, "recovery nudge failed");
                return false;
            }
            tokio::time::sleep(delay).await;
        }

        let after = tail_hash(&target.capture_output().await);
        after != before
    }
}

impl Default for ConsoleRecovery {
    fn default() -> Self {
        Self::new(ConsoleRecoveryConfig::default())
    }
}

/// Hash of the last 1000 bytes, for change detection
fn tail_hash(output: &str) -> u64 {
    let bytes = output.as_bytes();
    let start = bytes.len().saturating_sub(1000);
    let mut hasher = DefaultHasher::new();
    bytes[start..].hash(&mut hasher);
    hasher.finish()
}
