//! Log watcher: classifies worker state from filtered output
//!
//! Cheap checks run first (completion markers, questions, no-progress
//! hashing, short logs); only then is the reasoning model consulted. An
//! LLM failure degrades to `working` so supervision never aborts on it.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tracing::warn;

use crate::filter::LogFilter;
use crate::llm::LlmRouter;
use crate::watch::context::ContextManager;

/// Classified worker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchResult {
    Working,
    Completed,
    Stuck,
    Loop,
    NeedHuman,
    Error,
}

impl WatchResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            WatchResult::Working => "working",
            WatchResult::Completed => "completed",
            WatchResult::Stuck => "stuck",
            WatchResult::Loop => "loop",
            WatchResult::NeedHuman => "need_human",
            WatchResult::Error => "error",
        }
    }

    /// Unknown labels map to `working` rather than failing
    pub fn parse(s: &str) -> Self {
        match s {
            "completed" => WatchResult::Completed,
            "stuck" => WatchResult::Stuck,
            "loop" => WatchResult::Loop,
            "need_human" => WatchResult::NeedHuman,
            "error" => WatchResult::Error,
            _ => WatchResult::Working,
        }
    }
}

/// One verdict from the watcher
#[derive(Debug, Clone)]
pub struct WatcherAnalysis {
    pub result: WatchResult,
    pub summary: String,
    pub suggestion: Option<String>,
    pub should_restart: bool,
    pub restart_context: Option<String>,
}

impl WatcherAnalysis {
    fn simple(result: WatchResult, summary: &str, suggestion: Option<&str>) -> Self {
        Self {
            result,
            summary: summary.to_string(),
            suggestion: suggestion.map(str::to_string),
            should_restart: false,
            restart_context: None,
        }
    }
}

/// Consecutive identical observations before declaring `stuck`
const STUCK_SIGHTINGS: u32 = 3;
/// Filtered logs shorter than this count as "just started"
const MIN_LOG_LENGTH: usize = 100;
/// Log bytes submitted to the model
const MAX_LLM_LOG: usize = 4000;
/// Restart context size cap
const RESTART_CONTEXT_LEN: usize = 500;

const ANALYSIS_PROMPT: &str = r#"You are analyzing the work log of an AI coding assistant.
Determine the current execution status.

TASK: {task}

WORK LOG (model messages only, command output removed):
```
{log}
```

Elapsed: {elapsed} seconds

Respond with JSON in this exact shape:
{
    "status": "working|completed|stuck|loop|need_human|error",
    "summary": "what is happening, 1-2 sentences",
    "suggestion": "what to do next (null if working)",
    "should_restart": false,
    "context_for_restart": null
}

Statuses:
- working: the model is actively making progress
- completed: the task finished successfully
- stuck: no progress for over 2 minutes, repeating itself
- loop: the model repeats the same action over and over
- need_human: the model asks for help or a human decision is needed
- error: a critical error occurred

If should_restart is true, put a handover summary for the fresh session
into context_for_restart.

JSON ONLY, no commentary."#;

/// Watches worker logs and classifies execution state
pub struct LogWatcher {
    router: Arc<LlmRouter>,
    filter: LogFilter,
    context: ContextManager,
    last_hash: Option<u64>,
    sightings: u32,
}

impl LogWatcher {
    pub fn new(router: Arc<LlmRouter>) -> Self {
        Self {
            router,
            filter: LogFilter::new(),
            context: ContextManager::default(),
            last_hash: None,
            sightings: 0,
        }
    }

    /// Checkpoint history rendered for restart handover
    pub fn history_context(&self) -> String {
        self.context.history_context()
    }

    /// Analyze a raw log and classify the worker state
    pub async fn analyze(&mut self, raw_log: &str, task: &str, elapsed_seconds: f64) -> WatcherAnalysis {
        let analysis = self.classify(raw_log, task, elapsed_seconds).await;
        self.context.add_checkpoint(analysis.result.as_str(), &analysis.summary);
        analysis
    }

    async fn classify(&mut self, raw_log: &str, task: &str, elapsed_seconds: f64) -> WatcherAnalysis {
        let filtered = self.filter.filter(raw_log);

        // Fast paths, no LLM
        if filtered.has_completion && !filtered.has_error {
            return WatcherAnalysis::simple(WatchResult::Completed, "Task completed successfully", None);
        }

        if filtered.has_question {
            return WatcherAnalysis::simple(
                WatchResult::NeedHuman,
                "The model is asking a question",
                Some("Check the question and answer it"),
            );
        }

        let current_hash = hash_text(&filtered.text);
        if self.last_hash == Some(current_hash) {
            self.sightings += 1;
            if self.sightings >= STUCK_SIGHTINGS {
                return WatcherAnalysis {
                    result: WatchResult::Stuck,
                    summary: "No progress in the logs".to_string(),
                    suggestion: Some("Restart with carried-over context".to_string()),
                    should_restart: true,
                    restart_context: Some(extract_context(&filtered.text, RESTART_CONTEXT_LEN)),
                };
            }
        } else {
            self.sightings = 1;
            self.last_hash = Some(current_hash);
        }

        if filtered.filtered_length < MIN_LOG_LENGTH {
            return WatcherAnalysis::simple(WatchResult::Working, "The model has just started", None);
        }

        self.analyze_with_llm(&filtered.text, task, elapsed_seconds).await
    }

    async fn analyze_with_llm(&self, log: &str, task: &str, elapsed: f64) -> WatcherAnalysis {
        let log_tail = ContextManager::tail_log(log, None, Some(MAX_LLM_LOG));
        let prompt = ANALYSIS_PROMPT
            .replace("{task}", task)
            .replace("{log}", &log_tail)
            .replace("{elapsed}", &format!("{:.0}", elapsed));

        match self.router.generate_json(&prompt, 0.1).await {
            Ok(value) => {
                let result = WatchResult::parse(value["status"].as_str().unwrap_or("working"));
                WatcherAnalysis {
                    result,
                    summary: value["summary"].as_str().unwrap_or("Analysis unavailable").to_string(),
                    suggestion: value["suggestion"].as_str().map(str::to_string),
                    should_restart: value["should_restart"].as_bool().unwrap_or(false),
                    restart_context: value["context_for_restart"].as_str().map(str::to_string),
                }
            }
            Err(e) => {
                warn!(error = %e, "log analysis failed");
                WatcherAnalysis::simple(WatchResult::Working, "Analysis unavailable (LLM error)", None)
            }
        }
    }

    /// Reset the no-change tracking state and checkpoint history
    pub fn reset(&mut self) {
        self.last_hash = None;
        self.sightings = 0;
        self.context.reset();
    }
}

fn hash_text(text: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    hasher.finish()
}

/// Take whole trailing lines up to `max_length` characters
fn extract_context(log: &str, max_length: usize) -> String {
    let mut kept: Vec<&str> = Vec::new();
    let mut total = 0usize;

    for line in log.trim().lines().rev() {
        let len = line.chars().count();
        if total + len > max_length {
            break;
        }
        kept.push(line);
        total += len + 1;
    }

    kept.reverse();
    kept.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::client::mock::{MockLlmClient, MockResponse};
    use crate::llm::router::RouterConfig;

    fn router_with(responses: Vec<MockResponse>) -> Arc<LlmRouter> {
        let client = Arc::new(MockLlmClient::new("gemini", responses));
        Arc::new(LlmRouter::with_clients(
            RouterConfig {
                retry_delay: std::time::Duration::from_millis(1),
                max_retries: 1,
                ..Default::default()
            },
            vec![client],
        ))
    }

    fn long_prose(tag: &str) -> String {
        format!(
            "Let me keep working through the remaining modules of this task ({tag})\n\
             Looking at the parser there are several branches that still need coverage here\n\
             Analyzing the remaining failures one by one to figure out the underlying cause"
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_fast_path() {
        let mut watcher = LogWatcher::new(router_with(vec![]));
        let analysis = watcher.analyze("✓ Task completed without issues", "do a thing", 10.0).await;
        assert_eq!(analysis.result, WatchResult::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_question_fast_path() {
        let mut watcher = LogWatcher::new(router_with(vec![]));
        let analysis = watcher
            .analyze("I have two designs in mind. Would you like the simpler one?", "task", 10.0)
            .await;
        assert_eq!(analysis.result, WatchResult::NeedHuman);
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_log_is_working() {
        let mut watcher = LogWatcher::new(router_with(vec![]));
        let analysis = watcher.analyze("Let me begin", "task", 2.0).await;
        assert_eq!(analysis.result, WatchResult::Working);
        assert!(analysis.summary.contains("just started"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_after_three_identical_logs() {
        // S3: same filtered text three calls in a row
        let mut watcher = LogWatcher::new(router_with(vec![
            MockResponse::Text(r#"{"status": "working", "summary": "ok"}"#.into()),
            MockResponse::Text(r#"{"status": "working", "summary": "ok"}"#.into()),
        ]));
        let log = long_prose("same");

        let first = watcher.analyze(&log, "task", 60.0).await;
        assert_ne!(first.result, WatchResult::Stuck);
        let second = watcher.analyze(&log, "task", 120.0).await;
        assert_ne!(second.result, WatchResult::Stuck);

        let third = watcher.analyze(&log, "task", 180.0).await;
        assert_eq!(third.result, WatchResult::Stuck);
        assert!(third.should_restart);

        let context = third.restart_context.unwrap();
        assert!(context.chars().count() <= 500);
        assert!(context.contains("underlying cause"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_changing_log_resets_counter() {
        let mut watcher = LogWatcher::new(router_with(vec![
            MockResponse::Text(r#"{"status": "working", "summary": "a"}"#.into()),
            MockResponse::Text(r#"{"status": "working", "summary": "b"}"#.into()),
            MockResponse::Text(r#"{"status": "working", "summary": "c"}"#.into()),
            MockResponse::Text(r#"{"status": "working", "summary": "d"}"#.into()),
        ]));

        let log_a = long_prose("alpha");
        let log_b = long_prose("beta");
        assert_ne!(watcher.analyze(&log_a, "task", 1.0).await.result, WatchResult::Stuck);
        assert_ne!(watcher.analyze(&log_a, "task", 2.0).await.result, WatchResult::Stuck);
        assert_ne!(watcher.analyze(&log_b, "task", 3.0).await.result, WatchResult::Stuck);
        assert_ne!(watcher.analyze(&log_b, "task", 4.0).await.result, WatchResult::Stuck);
    }

    #[tokio::test(start_paused = true)]
    async fn test_llm_verdict_parsed() {
        let mut watcher = LogWatcher::new(router_with(vec![MockResponse::Text(
            r#"{"status": "loop", "summary": "repeating edits", "suggestion": "restart", "should_restart": true}"#
                .into(),
        )]));

        let analysis = watcher.analyze(&long_prose("x"), "task", 300.0).await;
        assert_eq!(analysis.result, WatchResult::Loop);
        assert_eq!(analysis.summary, "repeating edits");
        assert!(analysis.should_restart);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_status_maps_to_working() {
        let mut watcher = LogWatcher::new(router_with(vec![MockResponse::Text(
            r#"{"status": "daydreaming", "summary": "??"}"#.into(),
        )]));
        let analysis = watcher.analyze(&long_prose("y"), "task", 30.0).await;
        assert_eq!(analysis.result, WatchResult::Working);
    }

    #[tokio::test(start_paused = true)]
    async fn test_llm_failure_degrades_to_working() {
        let mut watcher = LogWatcher::new(router_with(vec![MockResponse::Error(|| {
            crate::error::EngineError::ProviderConnectionFailed("down".into())
        })]));
        let analysis = watcher.analyze(&long_prose("z"), "task", 30.0).await;
        assert_eq!(analysis.result, WatchResult::Working);
        assert!(analysis.summary.contains("Analysis unavailable"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_checkpoints_recorded_per_verdict() {
        let mut watcher = LogWatcher::new(router_with(vec![]));
        watcher.analyze("✓ Task completed without issues", "task", 10.0).await;

        let history = watcher.history_context();
        assert!(history.contains("[completed]"));
        assert!(history.contains("Task completed successfully"));

        watcher.reset();
        assert_eq!(watcher.history_context(), "No previous checks.");
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_clears_stuck_tracking() {
        let mut watcher = LogWatcher::new(router_with(vec![
            MockResponse::Text(r#"{"status": "working", "summary": "ok"}"#.into()),
            MockResponse::Text(r#"{"status": "working", "summary": "ok"}"#.into()),
            MockResponse::Text(r#"{"status": "working", "summary": "ok"}"#.into()),
        ]));
        let log = long_prose("reset");

        watcher.analyze(&log, "task", 1.0).await;
        watcher.analyze(&log, "task", 2.0).await;
        watcher.reset();
        let third = watcher.analyze(&log, "task", 3.0).await;
        assert_ne!(third.result, WatchResult::Stuck);
    }
}
