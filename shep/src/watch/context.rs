//! Context budgeting for the log watcher
//!
//! Keeps a token-accounted sliding summary of prior checkpoints so the
//! analysis prompts never outgrow the model context. Compression keeps
//! the first checkpoint (the seed) and the most recent entries.

use chrono::{DateTime, Local};
use tracing::{debug, info, warn};

/// One classified observation kept in history
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub timestamp: DateTime<Local>,
    pub status: String,
    pub summary: String,
}

impl std::fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.status, self.summary)
    }
}

/// Token budget tracking
#[derive(Debug, Clone)]
pub struct ContextBudget {
    pub max_tokens: usize,
    pub used_tokens: usize,
    pub warn_ratio: f64,
}

impl Default for ContextBudget {
    fn default() -> Self {
        Self {
            max_tokens: 100_000,
            used_tokens: 0,
            warn_ratio: 0.75,
        }
    }
}

impl ContextBudget {
    pub fn usage_ratio(&self) -> f64 {
        self.used_tokens as f64 / self.max_tokens as f64
    }

    pub fn needs_compression(&self) -> bool {
        self.usage_ratio() >= self.warn_ratio
    }

    /// Conservative token estimate for mixed Cyrillic/Latin text
    pub fn estimate_tokens(text: &str) -> usize {
        text.chars().count() / 3
    }
}

/// Maximum log lines fed to one analysis
const MAX_LOG_LINES: usize = 50;
/// Maximum log characters fed to one analysis
const MAX_LOG_CHARS: usize = 4000;
/// History length that triggers compression
const MAX_HISTORY_ITEMS: usize = 5;
/// Entries surviving compression (seed plus the most recent)
const KEEP_COUNT: usize = 3;
/// Checkpoint summaries are clipped to this length
const SUMMARY_LEN: usize = 200;

/// Sliding checkpoint history with compression
pub struct ContextManager {
    pub budget: ContextBudget,
    history: Vec<Checkpoint>,
    compression_count: u32,
}

impl ContextManager {
    pub fn new(max_tokens: usize) -> Self {
        Self {
            budget: ContextBudget {
                max_tokens,
                ..Default::default()
            },
            history: Vec::new(),
            compression_count: 0,
        }
    }

    /// Take only the tail of a log, bounded by characters then lines
    pub fn tail_log(raw: &str, max_lines: Option<usize>, max_chars: Option<usize>) -> String {
        let max_lines = max_lines.unwrap_or(MAX_LOG_LINES);
        let max_chars = max_chars.unwrap_or(MAX_LOG_CHARS);

        if raw.is_empty() {
            return String::new();
        }

        let chars: Vec<char> = raw.chars().collect();
        let text: String = if chars.len() > max_chars {
            let tail: String = chars[chars.len() - max_chars..].iter().collect();
            // Drop the leading partial line
            match tail.find('\n') {
                Some(pos) => tail[pos + 1..].to_string(),
                None => tail,
            }
        } else {
            raw.to_string()
        };

        let lines: Vec<&str> = text.trim().lines().collect();
        if lines.len() > max_lines {
            lines[lines.len() - max_lines..].join("\n")
        } else {
            lines.join("\n")
        }
    }

    /// Append a checkpoint, compressing when the history or budget overflows
    pub fn add_checkpoint(&mut self, status: &str, summary: &str) {
        let summary: String = summary.chars().take(SUMMARY_LEN).collect();
        let checkpoint = Checkpoint {
            timestamp: Local::now(),
            status: status.to_string(),
            summary,
        };

        self.budget.used_tokens += ContextBudget::estimate_tokens(&checkpoint.to_string());
        self.history.push(checkpoint);

        if self.history.len() > MAX_HISTORY_ITEMS {
            self.compress();
        }

        if self.budget.needs_compression() {
            warn!(
                usage = format!("{:.0}%", self.budget.usage_ratio() * 100.0),
                "context budget high, compressing history"
            );
            self.compress();
        }
    }

    fn compress(&mut self) {
        if self.history.len() <= 2 {
            return;
        }

        let old_count = self.history.len();
        let seed = self.history[0].clone();
        let tail_start = self.history.len().saturating_sub(KEEP_COUNT - 1);
        let mut kept = vec![seed];
        kept.extend_from_slice(&self.history[tail_start..]);
        self.history = kept;

        self.budget.used_tokens = self
            .history
            .iter()
            .map(|c| ContextBudget::estimate_tokens(&c.to_string()))
            .sum();

        self.compression_count += 1;
        info!(
            from = old_count,
            to = self.history.len(),
            compression = self.compression_count,
            "compressed checkpoint history"
        );
    }

    /// Render the history for inclusion in an analysis prompt
    pub fn history_context(&self) -> String {
        if self.history.is_empty() {
            return "No previous checks.".to_string();
        }

        let mut lines = vec!["Previous checks:".to_string()];
        for checkpoint in &self.history {
            lines.push(format!("  [{}] {}", checkpoint.timestamp.format("%H:%M:%S"), checkpoint));
        }
        lines.join("\n")
    }

    pub fn history(&self) -> &[Checkpoint] {
        &self.history
    }

    /// Reset for a new task
    pub fn reset(&mut self) {
        self.history.clear();
        self.budget.used_tokens = 0;
        debug!(compressions = self.compression_count, "context reset");
    }

    /// Stats snapshot for status output
    pub fn stats(&self) -> ContextStats {
        ContextStats {
            history_size: self.history.len(),
            tokens_used: self.budget.used_tokens,
            tokens_max: self.budget.max_tokens,
            usage_percent: self.budget.usage_ratio() * 100.0,
            compressions: self.compression_count,
        }
    }
}

impl Default for ContextManager {
    fn default() -> Self {
        Self::new(100_000)
    }
}

/// Context usage snapshot
#[derive(Debug, Clone)]
pub struct ContextStats {
    pub history_size: usize,
    pub tokens_used: usize,
    pub tokens_max: usize,
    pub usage_percent: f64,
    pub compressions: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(ContextBudget::estimate_tokens(""), 0);
        assert_eq!(ContextBudget::estimate_tokens("abcdef"), 2);
        // Cyrillic counts characters, not bytes
        assert_eq!(ContextBudget::estimate_tokens("привет"), 2);
    }

    #[test]
    fn test_add_checkpoint_accumulates() {
        let mut manager = ContextManager::default();
        manager.add_checkpoint("working", "analyzing the module layout");
        assert_eq!(manager.history().len(), 1);
        assert!(manager.budget.used_tokens > 0);
    }

    #[test]
    fn test_compression_preserves_endpoints() {
        let mut manager = ContextManager::default();
        for i in 0..8 {
            manager.add_checkpoint("working", &format!("checkpoint number {}", i));
        }

        let history = manager.history();
        assert!(history.len() <= MAX_HISTORY_ITEMS);
        assert_eq!(history[0].summary, "checkpoint number 0");
        assert_eq!(history.last().unwrap().summary, "checkpoint number 7");
    }

    #[test]
    fn test_budget_overflow_triggers_compression() {
        let mut manager = ContextManager::new(60);
        manager.add_checkpoint("working", "first checkpoint with a reasonably long summary line");
        manager.add_checkpoint("working", "second checkpoint with a reasonably long summary line");
        manager.add_checkpoint("working", "third checkpoint with a reasonably long summary line");
        manager.add_checkpoint("working", "fourth checkpoint with a reasonably long summary line");

        assert!(manager.stats().compressions >= 1);
        assert!(manager.history()[0].summary.starts_with("first"));
        assert!(manager.history().last().unwrap().summary.starts_with("fourth"));
    }

    #[test]
    fn test_summary_clipped() {
        let mut manager = ContextManager::default();
        let long = "x".repeat(500);
        manager.add_checkpoint("working", &long);
        assert_eq!(manager.history()[0].summary.chars().count(), 200);
    }

    #[test]
    fn test_history_context_rendering() {
        let mut manager = ContextManager::default();
        assert_eq!(manager.history_context(), "No previous checks.");

        manager.add_checkpoint("working", "reading the config loader");
        let rendered = manager.history_context();
        assert!(rendered.starts_with("Previous checks:"));
        assert!(rendered.contains("[working] reading the config loader"));
    }

    #[test]
    fn test_reset_clears_state() {
        let mut manager = ContextManager::default();
        manager.add_checkpoint("working", "something");
        manager.reset();
        assert!(manager.history().is_empty());
        assert_eq!(manager.budget.used_tokens, 0);
    }

    #[test]
    fn test_tail_log_by_chars() {
        let raw = format!("{}\nlast line", "a".repeat(5000));
        let tail = ContextManager::tail_log(&raw, None, Some(100));
        assert_eq!(tail, "last line");
    }

    #[test]
    fn test_tail_log_by_lines() {
        let raw = (0..80).map(|i| format!("line {}", i)).collect::<Vec<_>>().join("\n");
        let tail = ContextManager::tail_log(&raw, Some(10), None);
        assert_eq!(tail.lines().count(), 10);
        assert!(tail.starts_with("line 70"));
    }

    #[test]
    fn test_tail_log_empty() {
        assert_eq!(ContextManager::tail_log("", None, None), "");
    }
}
