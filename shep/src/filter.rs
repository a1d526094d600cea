//! Terminal output sanitation and classification
//!
//! Two independent concerns: stripping terminal control sequences from
//! raw captures, and separating model prose from command/tool output
//! before anything is pattern-matched or submitted to an LLM.

use regex::Regex;
use std::sync::LazyLock;

static CSI_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\x1b\[[0-9;?]*[a-zA-Z]").unwrap());
static OSC_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)?").unwrap());
static MODE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\x1b[=>]").unwrap());
static CHARSET_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\x1b\([A-Z0-9]").unwrap());

/// Strip terminal escape sequences and control characters from text.
///
/// Removes CSI and OSC sequences (BEL or ST terminated), mode and charset
/// switches, and every C0 control except LF and HT. Idempotent: the output
/// contains no ESC bytes, so a second pass is a no-op.
pub fn sanitize(input: &str) -> String {
    let text = CSI_RE.replace_all(input, "");
    let text = OSC_RE.replace_all(&text, "");
    let text = MODE_RE.replace_all(&text, "");
    let text = CHARSET_RE.replace_all(&text, "");

    text.chars().filter(|&c| c == '\n' || c == '\t' || !c.is_control()).collect()
}

/// Sanitize a raw byte capture.
///
/// Invalid UTF-8 (including unpaired-surrogate byte sequences that tmux
/// captures sometimes contain) is replaced before escape stripping, so the
/// result is always safe to hand to a JSON encoder or an LLM call.
pub fn sanitize_bytes(bytes: &[u8]) -> String {
    sanitize(&String::from_utf8_lossy(bytes))
}

/// A classified view over a sanitized log
#[derive(Debug, Clone, Default)]
pub struct FilteredLog {
    /// Only the model's own messages and prose
    pub text: String,
    /// A completion marker appeared
    pub has_completion: bool,
    /// An error marker appeared
    pub has_error: bool,
    /// The model is asking a question
    pub has_question: bool,
    /// Length of the raw input
    pub raw_length: usize,
    /// Length after filtering
    pub filtered_length: usize,
}

/// How many trailing non-empty lines classification looks at
const TAIL_LINES: usize = 50;

/// Classifies CLI tool output, keeping only model speech and prose.
///
/// The pattern lists are fixed; they cover the CLIs shepherd drives plus
/// localized completion/error/question keywords.
pub struct LogFilter {
    model_res: Vec<Regex>,
    command_res: Vec<Regex>,
    completion_res: Vec<Regex>,
    error_res: Vec<Regex>,
    question_res: Vec<Regex>,
}

impl LogFilter {
    const MODEL_PATTERNS: &'static [&'static str] = &[
        r"^\[Claude\].*",
        r"^\[Model\].*",
        r"^Thinking:.*",
        r"^I('m| am| will| can|'ll).*",
        r"^Let me.*",
        r"^Now I.*",
        r"^First,.*",
        r"^Next,.*",
        r"^Finally,.*",
        r"^Looking at.*",
        r"^Analyzing.*",
        r"^The (error|issue|problem|solution).*",
        r"^This (is|looks|seems|appears).*",
        r"^I (see|found|notice|think|believe).*",
        r"^Based on.*",
        r"^According to.*",
        // Copilot markers
        r"^●.*",
        r"^✓.*",
        r"^✗.*",
        r"^→.*",
        // Codex markers
        r"^\[codex\].*",
        r"^Plan:.*",
        r"^Step \d+:.*",
        // Droid markers
        r"^\[droid\].*",
        r"^Assistant:.*",
    ];

    const COMMAND_PATTERNS: &'static [&'static str] = &[
        r"^\$\s+.*",
        r"^>\s+.*",
        r"^\+\s+.*",
        r"^npm\s+(WARN|ERR|info).*",
        r"^added \d+ packages.*",
        r"^up to date.*",
        r"^\d+ packages are looking.*",
        r"^Run `npm.*",
        r"^diff --git.*",
        r"^index [a-f0-9]+\.\.[a-f0-9]+.*",
        r"^@@.*@@.*",
        r"^[-+]{3}\s+[ab]/.*",
        r"^[+-]\s+.*",
        r"^\s*\d+\s+passing.*",
        r"^\s*\d+\s+failing.*",
        r"^PASS\s+.*",
        r"^FAIL\s+.*",
        r"^✔.*test.*",
        r"^✖.*test.*",
        r"^Compiling.*",
        r"^Building.*",
        r"^Bundling.*",
        r"^warning:.*",
        r"^error\[E\d+\]:.*",
        r"^  --> .*:\d+:\d+.*",
        r"^\s+\|.*",
        r"^node_modules/.*",
        r"^\s+at\s+.*\(.*:\d+:\d+\).*",
        r"^.*\.js:\d+$",
        r"^.*\.ts:\d+$",
        r"^.*\.py:\d+$",
    ];

    const COMPLETION_PATTERNS: &'static [&'static str] = &[
        r"task.*complet",
        r"done!",
        r"finished",
        r"successfully",
        r"all tests pass",
        r"build succeeded",
        r"готово",
        r"выполнено",
        r"завершено",
    ];

    const ERROR_PATTERNS: &'static [&'static str] = &[
        r"error:",
        r"failed",
        r"exception",
        r"cannot",
        r"unable to",
        r"not found",
        r"ошибка",
        r"не удалось",
    ];

    const QUESTION_PATTERNS: &'static [&'static str] = &[
        r"\?\s*$",
        r"should i",
        r"do you want",
        r"would you like",
        r"can you",
        r"please (confirm|specify|clarify)",
        r"хотите",
        r"нужно ли",
        r"подтвердите",
    ];

    pub fn new() -> Self {
        let compile = |patterns: &[&str]| {
            patterns
                .iter()
                .map(|p| Regex::new(&format!("(?i){}", p)).unwrap())
                .collect::<Vec<_>>()
        };

        Self {
            model_res: compile(Self::MODEL_PATTERNS),
            command_res: compile(Self::COMMAND_PATTERNS),
            completion_res: compile(Self::COMPLETION_PATTERNS),
            error_res: compile(Self::ERROR_PATTERNS),
            question_res: compile(Self::QUESTION_PATTERNS),
        }
    }

    /// Filter a raw log: sanitize, keep the tail, classify line by line
    pub fn filter(&self, raw_log: &str) -> FilteredLog {
        let clean = sanitize(raw_log);

        let non_empty: Vec<&str> = clean.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
        let tail_start = non_empty.len().saturating_sub(TAIL_LINES);

        let mut kept: Vec<&str> = Vec::new();
        for line in &non_empty[tail_start..] {
            if self.is_command_output(line) {
                continue;
            }
            if self.is_model_message(line) {
                kept.push(line);
                continue;
            }
            if line.chars().count() > 50 && looks_like_prose(line) {
                kept.push(line);
            }
        }

        let text = kept.join("\n");
        let lower = text.to_lowercase();

        FilteredLog {
            has_completion: self.completion_res.iter().any(|re| re.is_match(&lower)),
            has_error: self.error_res.iter().any(|re| re.is_match(&lower)),
            has_question: self.question_res.iter().any(|re| re.is_match(&lower)),
            raw_length: raw_log.len(),
            filtered_length: text.len(),
            text,
        }
    }

    fn is_command_output(&self, line: &str) -> bool {
        self.command_res.iter().any(|re| re.is_match(line))
    }

    fn is_model_message(&self, line: &str) -> bool {
        self.model_res.iter().any(|re| re.is_match(line))
    }
}

impl Default for LogFilter {
    fn default() -> Self {
        Self::new()
    }
}

/// Heuristic: does this line read as prose rather than code
fn looks_like_prose(line: &str) -> bool {
    // Deep indentation reads as code (callers trim, but keep the guard)
    if line.starts_with("    ") || line.starts_with("\t\t") {
        return false;
    }

    let total = line.chars().count();
    let special = line.chars().filter(|c| "{}[]();=<>|&".contains(*c)).count();
    if total > 0 && special * 5 > total {
        return false;
    }

    line.split_whitespace().count() >= 5
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_sanitize_strips_csi() {
        assert_eq!(sanitize("\x1b[31mred\x1b[0m text"), "red text");
    }

    #[test]
    fn test_sanitize_strips_osc() {
        assert_eq!(sanitize("\x1b]0;window title\x07hello"), "hello");
        assert_eq!(sanitize("\x1b]0;title\x1b\\hello"), "hello");
    }

    #[test]
    fn test_sanitize_strips_controls_keeps_lf_ht() {
        assert_eq!(sanitize("a\x00b\rc\nd\te\x7ff"), "abc\nd\tef");
    }

    #[test]
    fn test_sanitize_bytes_replaces_invalid_utf8() {
        // Unpaired surrogate encoded as WTF-8 bytes
        let bytes = b"ok \xed\xa0\x80 end";
        let out = sanitize_bytes(bytes);
        assert!(out.starts_with("ok "));
        assert!(out.ends_with(" end"));
        assert!(out.contains('\u{fffd}'));
    }

    #[test]
    fn test_sanitize_idempotent_on_nested_escapes() {
        let tricky = "\x1b\x1b[31mtext\x1b[";
        let once = sanitize(tricky);
        assert_eq!(sanitize(&once), once);
    }

    proptest! {
        #[test]
        fn prop_sanitize_idempotent(bytes in proptest::collection::vec(any::<u8>(), 0..512)) {
            let once = sanitize_bytes(&bytes);
            let twice = sanitize(&once);
            prop_assert_eq!(once, twice);
        }
    }

    #[test]
    fn test_filter_keeps_model_speech() {
        let filter = LogFilter::new();
        let log = "Let me look at the code\n$ npm install\nadded 50 packages in 2s";
        let result = filter.filter(log);
        assert!(result.text.contains("Let me look at the code"));
        assert!(!result.text.contains("npm install"));
    }

    #[test]
    fn test_filter_drops_diff_output() {
        let filter = LogFilter::new();
        let log = "I found the problem\ndiff --git a/x.rs b/x.rs\n@@ -1,3 +1,4 @@\n+ new line";
        let result = filter.filter(log);
        assert!(result.text.contains("I found the problem"));
        assert!(!result.text.contains("diff --git"));
        assert!(!result.text.contains("new line"));
    }

    #[test]
    fn test_filter_keeps_long_prose() {
        let filter = LogFilter::new();
        let prose = "the configuration file was missing a required field so validation kept failing on startup";
        let result = filter.filter(prose);
        assert_eq!(result.text, prose);
    }

    #[test]
    fn test_filter_drops_symbol_dense_lines() {
        let filter = LogFilter::new();
        let code = "fn main() { let x = vec![(1, 2), (3, 4)]; x.iter().map(|(a, b)| a + b).sum::<i32>(); }";
        let result = filter.filter(code);
        assert!(result.text.is_empty());
    }

    #[test]
    fn test_filter_detects_completion() {
        let filter = LogFilter::new();
        let result = filter.filter("✓ Task completed successfully");
        assert!(result.has_completion);
        assert!(!result.has_error);
    }

    #[test]
    fn test_filter_detects_localized_completion() {
        let filter = LogFilter::new();
        let result = filter.filter("● Готово, все изменения внесены");
        assert!(result.has_completion);
    }

    #[test]
    fn test_filter_detects_question() {
        let filter = LogFilter::new();
        let result = filter.filter("I see two options here. Would you like me to refactor the module first?");
        assert!(result.has_question);
    }

    #[test]
    fn test_filter_detects_can_you_question() {
        let filter = LogFilter::new();
        let log = "Can you confirm the target endpoint before the rollout starts\n\
                   I will hold off on the deployment until there is an answer here";
        let result = filter.filter(log);
        assert!(result.has_question);
    }

    #[test]
    fn test_filter_drops_npm_advice_lines() {
        let filter = LogFilter::new();
        let log = "Let me install the dependencies first\n\
                   3 packages are looking for funding\n\
                   Run `npm audit fix` to address them";
        let result = filter.filter(log);
        assert!(result.text.contains("install the dependencies"));
        assert!(!result.text.contains("looking for funding"));
        assert!(!result.text.contains("npm audit fix"));
    }

    #[test]
    fn test_filter_detects_error() {
        let filter = LogFilter::new();
        let result = filter.filter("✗ error: the build failed with three unresolved imports");
        assert!(result.has_error);
    }

    #[test]
    fn test_filter_lengths() {
        let filter = LogFilter::new();
        let log = "Let me check\n$ ls -la";
        let result = filter.filter(log);
        assert_eq!(result.raw_length, log.len());
        assert_eq!(result.filtered_length, "Let me check".len());
    }

    #[test]
    fn test_filter_only_considers_tail() {
        let filter = LogFilter::new();
        let mut log = String::from("Let me start at the very beginning\n");
        for i in 0..60 {
            log.push_str(&format!("Analyzing chunk number {} of the target module\n", i));
        }
        let result = filter.filter(&log);
        assert!(!result.text.contains("very beginning"));
        assert!(result.text.contains("chunk number 59"));
    }
}
