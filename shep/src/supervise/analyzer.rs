//! Worker response analysis
//!
//! Submits the worker's output (smart-truncated) together with the step
//! prompt and iteration counters, and gets back a structured verdict on
//! whether the step is done and what to do next.

use regex::Regex;
use std::sync::{Arc, LazyLock};

use crate::llm::LlmRouter;

static JSON_FENCE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)```json\s*(\{.*?\})\s*```").unwrap());

/// Actions the analyzer can request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisAction {
    /// Keep going; counts toward confirmations when nothing changed
    Continue,
    /// Substantial changes landed; commit and open a fresh worker session
    NewChat,
    /// Ask the worker to clarify what it did
    AskDroid,
    /// The step is not done; insist
    EnforceTask,
    /// Hand off to a human
    Escalate,
}

impl AnalysisAction {
    pub fn parse(s: &str) -> Self {
        match s {
            "CONTINUE" => AnalysisAction::Continue,
            "NEW_CHAT" => AnalysisAction::NewChat,
            "ASK_DROID" => AnalysisAction::AskDroid,
            "ENFORCE_TASK" => AnalysisAction::EnforceTask,
            "ESCALATE" => AnalysisAction::Escalate,
            _ => AnalysisAction::Continue,
        }
    }
}

/// Structured verdict over one worker response
#[derive(Debug, Clone)]
pub struct AnalysisResult {
    pub task_complete: bool,
    pub has_changes: bool,
    pub changes_substantial: bool,
    pub changes_description: String,
    pub issues: Vec<String>,
    pub action: AnalysisAction,
    pub message_to_droid: String,
    pub reason: String,
}

impl AnalysisResult {
    fn from_value(value: &serde_json::Value) -> Self {
        Self {
            task_complete: value["task_complete"].as_bool().unwrap_or(false),
            has_changes: value["has_changes"].as_bool().unwrap_or(false),
            changes_substantial: value["changes_substantial"].as_bool().unwrap_or(false),
            changes_description: value["changes_description"].as_str().unwrap_or("").to_string(),
            issues: value["issues"]
                .as_array()
                .map(|a| a.iter().filter_map(|v| v.as_str()).map(str::to_string).collect())
                .unwrap_or_default(),
            action: AnalysisAction::parse(value["action"].as_str().unwrap_or("CONTINUE")),
            message_to_droid: value["message_to_droid"].as_str().unwrap_or("").to_string(),
            reason: value["reason"].as_str().unwrap_or("").to_string(),
        }
    }
}

/// Keyword probe used before a full analysis is worth paying for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuickCheck {
    pub has_error: bool,
    pub seems_complete: bool,
    pub has_changes: bool,
}

const SYSTEM_PROMPT: &str = r#"You supervise an AI coder working through a step of a pipeline.

YOUR ROLE:
- Understand the worker's answers: did it change anything or not
- Decide whether the step's requirements are met
- Decide what happens next

CHANGE CLASSIFICATION:
1. Substantial (has_changes=true, changes_substantial=true):
   new code or files, changed logic, bug fixes, added/removed features
2. Cosmetic (has_changes=true, changes_substantial=false):
   typos, formatting, whitespace, comments only, renames
3. None (has_changes=false):
   "already correct", "no changes needed", the worker only verified

ACTION RULES:
1. task_complete=true + has_changes=false -> action="CONTINUE"
2. task_complete=true + changes_substantial=true -> action="NEW_CHAT"
3. task_complete=true + changes_substantial=false -> action="CONTINUE"
4. task_complete=false -> action="ENFORCE_TASK"
5. Unclear whether anything changed -> action="ASK_DROID"
6. failed_attempts at the limit -> action="ESCALATE""#;

/// Analyzer over one worker's responses
pub struct ResponseAnalyzer {
    router: Arc<LlmRouter>,
    truncate_length: usize,
    truncate_start_ratio: f64,
}

impl ResponseAnalyzer {
    pub fn new(router: Arc<LlmRouter>, truncate_length: usize, truncate_start_ratio: f64) -> Self {
        Self {
            router,
            truncate_length,
            truncate_start_ratio,
        }
    }

    /// Analyze one worker response in the context of its step
    #[allow(clippy::too_many_arguments)]
    pub async fn analyze(
        &self,
        worker_output: &str,
        step_prompt: &str,
        step_number: u32,
        step_name: &str,
        iteration: u32,
        confirmations: u32,
        failed_attempts: u32,
        completion_criteria: &[String],
    ) -> AnalysisResult {
        let criteria_text = if completion_criteria.is_empty() {
            "Not specified".to_string()
        } else {
            completion_criteria.iter().map(|c| format!("- {}", c)).collect::<Vec<_>>().join("\n")
        };

        let prompt = format!(
            r#"{system}

ITERATION CONTEXT:
- Step: {step_number} ({step_name})
- Iteration: {iteration}
- Consecutive confirmations (no changes): {confirmations}/2
- Consecutive failed attempts: {failed_attempts}

STEP REQUIREMENTS:
{step_prompt}

COMPLETION CRITERIA:
{criteria_text}

WORKER RESPONSE:
{output}

Analyze and respond with JSON:
```json
{{
  "task_complete": true,
  "has_changes": true,
  "changes_substantial": true,
  "changes_description": "what exactly changed, if anything",
  "issues": ["problem 1"],
  "action": "CONTINUE|ASK_DROID|ENFORCE_TASK|NEW_CHAT|ESCALATE",
  "message_to_droid": "what to tell the worker, if anything",
  "reason": "why this decision"
}}
```"#,
            system = SYSTEM_PROMPT,
            output = self.smart_truncate(worker_output, None),
        );

        match self.router.generate_json(&prompt, 0.3).await {
            Ok(value) => AnalysisResult::from_value(&value),
            Err(e) => AnalysisResult {
                task_complete: false,
                has_changes: false,
                changes_substantial: false,
                changes_description: String::new(),
                issues: vec![format!("Analysis error: {}", e)],
                action: AnalysisAction::AskDroid,
                message_to_droid: "Describe what you did and which changes you made.".to_string(),
                reason: format!("Failed to parse analysis: {}", e),
            },
        }
    }

    /// Truncate preserving the start and the end, and any ```json block
    pub fn smart_truncate(&self, text: &str, max_len: Option<usize>) -> String {
        let max_len = max_len.unwrap_or(self.truncate_length);
        let chars: Vec<char> = text.chars().collect();
        if chars.len() <= max_len {
            return text.to_string();
        }

        // A JSON block in the output is usually the payload; keep it whole
        if let Some(m) = JSON_FENCE_RE.find(text) {
            let block: Vec<char> = m.as_str().chars().collect();
            if block.len() < max_len / 2 {
                let remaining = max_len.saturating_sub(block.len()).saturating_sub(50);
                if remaining > 100 {
                    let start_len = (remaining as f64 * self.truncate_start_ratio) as usize;
                    let end_len = remaining - start_len;

                    let before: String = text[..m.start()].to_string();
                    let after: String = text[m.end()..].to_string();
                    let before_chars: Vec<char> = before.chars().collect();
                    let after_chars: Vec<char> = after.chars().collect();

                    let before = if before_chars.len() > start_len {
                        format!(
                            "{}\n... [truncated] ...\n",
                            before_chars[..start_len].iter().collect::<String>()
                        )
                    } else {
                        before
                    };
                    let after = if after_chars.len() > end_len {
                        format!(
                            "\n... [truncated] ...\n{}",
                            after_chars[after_chars.len() - end_len..].iter().collect::<String>()
                        )
                    } else {
                        after
                    };

                    return format!("{}{}{}", before, m.as_str(), after);
                }
            }
        }

        let start_len = (max_len as f64 * self.truncate_start_ratio) as usize;
        let end_len = max_len.saturating_sub(start_len).saturating_sub(50);

        format!(
            "{}\n\n... [truncated {} chars] ...\n\n{}",
            chars[..start_len].iter().collect::<String>(),
            chars.len() - max_len,
            chars[chars.len() - end_len..].iter().collect::<String>()
        )
    }

    /// Cheap keyword probe over a worker response
    pub fn quick_check(output: &str) -> QuickCheck {
        let lower = output.to_lowercase();

        const ERROR_WORDS: &[&str] = &["error", "exception", "failed", "не удалось", "ошибка"];
        const COMPLETE_WORDS: &[&str] =
            &["done", "complete", "готово", "finished", "всё работает", "no changes needed"];
        const CHANGE_WORDS: &[&str] = &[
            "changed", "modified", "added", "created", "updated", "изменил", "добавил", "исправил",
        ];

        QuickCheck {
            has_error: ERROR_WORDS.iter().any(|w| lower.contains(w)),
            seems_complete: COMPLETE_WORDS.iter().any(|w| lower.contains(w)),
            has_changes: CHANGE_WORDS.iter().any(|w| lower.contains(w)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::client::mock::{MockLlmClient, MockResponse};
    use crate::llm::router::RouterConfig;

    fn analyzer_with(responses: Vec<MockResponse>) -> ResponseAnalyzer {
        let client = Arc::new(MockLlmClient::new("gemini", responses));
        let router = Arc::new(LlmRouter::with_clients(
            RouterConfig {
                max_retries: 1,
                retry_delay: std::time::Duration::from_millis(1),
                ..Default::default()
            },
            vec![client],
        ));
        ResponseAnalyzer::new(router, 3000, 0.4)
    }

    #[tokio::test(start_paused = true)]
    async fn test_analyze_parses_verdict() {
        let analyzer = analyzer_with(vec![MockResponse::Text(
            r#"{"task_complete": true, "has_changes": true, "changes_substantial": true,
                "changes_description": "added endpoint", "issues": [],
                "action": "NEW_CHAT", "message_to_droid": "", "reason": "feature landed"}"#
                .into(),
        )]);

        let result = analyzer
            .analyze("I added the endpoint", "add endpoint", 1, "scaffold", 1, 0, 0, &[])
            .await;
        assert!(result.task_complete);
        assert_eq!(result.action, AnalysisAction::NewChat);
        assert_eq!(result.changes_description, "added endpoint");
    }

    #[tokio::test(start_paused = true)]
    async fn test_analyze_failure_falls_back_to_ask() {
        let analyzer = analyzer_with(vec![MockResponse::Error(|| {
            crate::error::EngineError::ProviderConnectionFailed("down".into())
        })]);

        let result = analyzer.analyze("output", "prompt", 1, "step", 1, 0, 0, &[]).await;
        assert_eq!(result.action, AnalysisAction::AskDroid);
        assert!(!result.message_to_droid.is_empty());
    }

    #[test]
    fn test_action_parse_unknown_is_continue() {
        assert_eq!(AnalysisAction::parse("DANCE"), AnalysisAction::Continue);
        assert_eq!(AnalysisAction::parse("ESCALATE"), AnalysisAction::Escalate);
    }

    #[test]
    fn test_smart_truncate_short_text_untouched() {
        let analyzer = analyzer_with(vec![]);
        assert_eq!(analyzer.smart_truncate("short", None), "short");
    }

    #[test]
    fn test_smart_truncate_keeps_both_ends() {
        let analyzer = analyzer_with(vec![]);
        let text = format!("START{}{}END", "a".repeat(5000), "b".repeat(10));
        let truncated = analyzer.smart_truncate(&text, Some(1000));

        assert!(truncated.starts_with("START"));
        assert!(truncated.ends_with("END"));
        assert!(truncated.contains("[truncated"));
        assert!(truncated.chars().count() < 1200);
    }

    #[test]
    fn test_smart_truncate_preserves_json_fence() {
        let analyzer = analyzer_with(vec![]);
        let json_block = "```json\n{\"task_complete\": true}\n```";
        let text = format!("{}{}{}", "x".repeat(3000), json_block, "y".repeat(3000));

        let truncated = analyzer.smart_truncate(&text, Some(1000));
        assert!(truncated.contains(json_block));
    }

    #[test]
    fn test_quick_check() {
        let check = ResponseAnalyzer::quick_check("Done! I updated three files");
        assert!(check.seems_complete);
        assert!(check.has_changes);
        assert!(!check.has_error);

        let check = ResponseAnalyzer::quick_check("error: build failed");
        assert!(check.has_error);
    }
}
