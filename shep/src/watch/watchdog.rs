//! Session health watchdog
//!
//! Detects hangs (no output for too long), loops (identical output tails),
//! crashes (dead session), and hard errors in the output, and runs a
//! background monitoring loop with backoff on its own failures.

use regex::Regex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use async_trait::async_trait;

/// Session health states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Stuck,
    Looping,
    Crashed,
    Error,
}

/// What the watchdog wants done about it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogAction {
    None,
    Wait,
    Ping,
    Restart,
    NewChat,
    Escalate,
}

/// One health check result
#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub status: HealthStatus,
    pub action: WatchdogAction,
    pub reason: String,
    pub details: Option<String>,
}

/// Source of truth the watchdog polls
#[async_trait]
pub trait WatchSource: Send + Sync {
    async fn output(&self) -> eyre::Result<String>;
    async fn alive(&self) -> eyre::Result<bool>;
}

// Error patterns specific enough to avoid firing on routine tool noise
const ERROR_PATTERNS: &[&str] = &[
    r"(?m)^Traceback \(most recent call last\):",
    r"\bpanic:\s",
    r"(?m)^Unhandled\s+exception\s+in",
    r"(?m)^CRITICAL:\s",
    r"\bSegmentation fault\b",
    r"\bSIGKILL\b",
    r"\bSIGSEGV\b",
    r"(?m)^Out of memory\b",
    r"(?m)^MemoryError\b",
    r"(?m)^\s*Process\s+killed\s+by\s+signal",
];

// Lines that look like errors but are usually normal operation
const FALSE_POSITIVE_PATTERNS: &[&str] = &[
    r"fatal: not a git repository",
    r"fatal: ambiguous argument",
    r"error: pathspec",
    r"npm WARN",
    r"warning:",
    r"Error: ENOENT",
    r"killed\s+successfully",
    r"process\s+exited\s+with\s+code\s+0",
];

/// Watchdog configuration and state
pub struct Watchdog {
    check_interval: Duration,
    stuck_threshold: Duration,
    loop_threshold: usize,
    max_consecutive_errors: u32,
    error_res: Vec<Regex>,
    false_positive_res: Vec<Regex>,

    last_output: String,
    last_output_at: Instant,
    output_history: Vec<u64>,
    stuck_checks: u32,
    stop_requested: Arc<AtomicBool>,
}

impl Watchdog {
    pub fn new(check_interval: Duration, stuck_threshold: Duration) -> Self {
        let compile = |patterns: &[&str]| {
            patterns
                .iter()
                .map(|p| Regex::new(&format!("(?i){}", p)).unwrap())
                .collect::<Vec<_>>()
        };

        Self {
            check_interval,
            stuck_threshold,
            loop_threshold: 3,
            max_consecutive_errors: 3,
            error_res: compile(ERROR_PATTERNS),
            false_positive_res: compile(FALSE_POSITIVE_PATTERNS),
            last_output: String::new(),
            last_output_at: Instant::now(),
            output_history: Vec::new(),
            stuck_checks: 0,
            stop_requested: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag checked at every suspension point of the monitoring loop
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop_requested.clone()
    }

    /// Run one health check against the current output and liveness
    pub fn check_health(&mut self, current_output: &str, is_session_alive: bool) -> HealthCheck {
        if !is_session_alive {
            return HealthCheck {
                status: HealthStatus::Crashed,
                action: WatchdogAction::Restart,
                reason: "session is dead".to_string(),
                details: None,
            };
        }

        for pattern in &self.error_res {
            if pattern.is_match(current_output) {
                let false_positive = self.false_positive_res.iter().any(|fp| fp.is_match(current_output));
                if !false_positive {
                    return HealthCheck {
                        status: HealthStatus::Error,
                        action: WatchdogAction::NewChat,
                        reason: format!("Error detected: {}", pattern.as_str()),
                        details: Some(extract_error_context(current_output, pattern)),
                    };
                }
            }
        }

        self.update_loop_history(current_output);
        if self.is_looping() {
            return HealthCheck {
                status: HealthStatus::Looping,
                action: WatchdogAction::NewChat,
                reason: format!("Same output {}+ times", self.loop_threshold),
                details: None,
            };
        }

        if current_output != self.last_output {
            self.last_output = current_output.to_string();
            self.last_output_at = Instant::now();
            self.stuck_checks = 0;
        } else {
            self.stuck_checks += 1;
            let stuck_for = self.last_output_at.elapsed();

            if stuck_for >= self.stuck_threshold {
                return HealthCheck {
                    status: HealthStatus::Stuck,
                    action: WatchdogAction::Escalate,
                    reason: format!("No output for {} minutes", stuck_for.as_secs() / 60),
                    details: None,
                };
            }
            if self.stuck_checks >= 3 {
                return HealthCheck {
                    status: HealthStatus::Stuck,
                    action: WatchdogAction::Ping,
                    reason: format!("No output for {} checks", self.stuck_checks),
                    details: None,
                };
            }
        }

        HealthCheck {
            status: HealthStatus::Healthy,
            action: WatchdogAction::None,
            reason: "session is healthy".to_string(),
            details: None,
        }
    }

    fn update_loop_history(&mut self, current_output: &str) {
        let tail: String = {
            let chars: Vec<char> = current_output.chars().collect();
            let start = chars.len().saturating_sub(500);
            chars[start..].iter().collect()
        };

        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        std::hash::Hash::hash(&tail, &mut hasher);
        self.output_history.push(std::hash::Hasher::finish(&hasher));

        let cap = self.loop_threshold + 2;
        if self.output_history.len() > cap {
            let excess = self.output_history.len() - cap;
            self.output_history.drain(..excess);
        }
    }

    fn is_looping(&self) -> bool {
        if self.output_history.len() < self.loop_threshold {
            return false;
        }
        let last = &self.output_history[self.output_history.len() - self.loop_threshold..];
        last.iter().all(|h| *h == last[0])
    }

    pub fn reset(&mut self) {
        self.last_output.clear();
        self.last_output_at = Instant::now();
        self.output_history.clear();
        self.stuck_checks = 0;
    }

    /// Poll the source until stopped, reporting issues through `issues`.
    ///
    /// Consecutive self-errors back the poll interval off exponentially,
    /// capped at 10x the base interval.
    pub async fn run(mut self, source: Arc<dyn WatchSource>, issues: mpsc::Sender<HealthCheck>) {
        self.reset();
        let mut consecutive_errors = 0u32;
        let mut backoff = Duration::ZERO;

        loop {
            tokio::time::sleep(self.check_interval + backoff).await;
            if self.stop_requested.load(Ordering::Relaxed) {
                debug!("watchdog stop requested");
                break;
            }

            let poll = async {
                let output = source.output().await?;
                let alive = source.alive().await?;
                Ok::<_, eyre::Report>((output, alive))
            };

            match poll.await {
                Ok((output, alive)) => {
                    let check = self.check_health(&output, alive);
                    if check.action != WatchdogAction::None && issues.send(check).await.is_err() {
                        break;
                    }
                    consecutive_errors = 0;
                    backoff = Duration::ZERO;
                }
                Err(e) => {
                    consecutive_errors += 1;
                    warn!(
                        consecutive_errors,
                        max = self.max_consecutive_errors,
                        error = %e,
                        "watchdog check error"
                    );
                    if consecutive_errors >= self.max_consecutive_errors {
                        backoff = if backoff.is_zero() {
                            self.check_interval
                        } else {
                            (backoff * 2).min(self.check_interval * 10)
                        };
                        warn!(backoff_secs = backoff.as_secs(), "watchdog backoff increased");
                    }
                }
            }
        }
    }
}

fn extract_error_context(output: &str, pattern: &Regex) -> String {
    let lines: Vec<&str> = output.lines().collect();
    for (i, line) in lines.iter().enumerate() {
        if pattern.is_match(line) {
            let start = i.saturating_sub(3);
            let end = (i + 4).min(lines.len());
            return lines[start..end].join("\n");
        }
    }
    String::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn watchdog() -> Watchdog {
        Watchdog::new(Duration::from_secs(300), Duration::from_secs(3600))
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_session_is_crashed() {
        let mut dog = watchdog();
        let check = dog.check_health("anything", false);
        assert_eq!(check.status, HealthStatus::Crashed);
        assert_eq!(check.action, WatchdogAction::Restart);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_pattern_triggers_new_chat() {
        let mut dog = watchdog();
        let output = "running tests\nTraceback (most recent call last):\n  File \"x.py\"\nValueError: boom";
        let check = dog.check_health(output, true);
        assert_eq!(check.status, HealthStatus::Error);
        assert_eq!(check.action, WatchdogAction::NewChat);
        assert!(check.details.unwrap().contains("ValueError"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_false_positive_suppressed() {
        let mut dog = watchdog();
        // Segfault string present, but so is a known benign marker
        let output = "Segmentation fault\nprocess exited with code 0";
        let check = dog.check_health(output, true);
        assert_eq!(check.status, HealthStatus::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_detection() {
        let mut dog = watchdog();
        dog.check_health("same tail", true);
        dog.check_health("same tail", true);
        let check = dog.check_health("same tail", true);
        assert_eq!(check.status, HealthStatus::Looping);
        assert_eq!(check.action, WatchdogAction::NewChat);
    }

    #[tokio::test(start_paused = true)]
    async fn test_healthy_on_changing_output() {
        let mut dog = watchdog();
        assert_eq!(dog.check_health("step one", true).status, HealthStatus::Healthy);
        assert_eq!(dog.check_health("step two", true).status, HealthStatus::Healthy);
        assert_eq!(dog.check_health("step three", true).status, HealthStatus::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_escalates_after_threshold() {
        let mut dog = Watchdog::new(Duration::from_secs(60), Duration::from_secs(120));
        // Different outputs so loop detection stays quiet, then freeze
        dog.check_health("a", true);
        dog.check_health("b", true);

        tokio::time::sleep(Duration::from_secs(130)).await;
        let check = dog.check_health("b", true);
        assert_eq!(check.status, HealthStatus::Stuck);
        assert_eq!(check.action, WatchdogAction::Escalate);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_clears_history() {
        let mut dog = watchdog();
        dog.check_health("same", true);
        dog.check_health("same", true);
        dog.reset();
        let check = dog.check_health("same", true);
        assert_eq!(check.status, HealthStatus::Healthy);
    }
}
