//! Task clarification
//!
//! Turns a free-form task into a complexity rating and acceptance
//! criteria. The clarifier never rewrites the task text; it may only
//! propose criteria, and the user gets to approve, reject, or replace
//! them.

use futures::future::BoxFuture;
use std::sync::Arc;
use tracing::{info, warn};

use crate::llm::LlmRouter;
use crate::worker::WorkerTier;

/// Task complexity, mapped one-to-one onto worker tiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskComplexity {
    Simple,
    Medium,
    Complex,
}

impl TaskComplexity {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskComplexity::Simple => "simple",
            TaskComplexity::Medium => "medium",
            TaskComplexity::Complex => "complex",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "simple" => Some(TaskComplexity::Simple),
            "medium" => Some(TaskComplexity::Medium),
            "complex" => Some(TaskComplexity::Complex),
            _ => None,
        }
    }

    pub fn tier(&self) -> WorkerTier {
        match self {
            TaskComplexity::Simple => WorkerTier::Simple,
            TaskComplexity::Medium => WorkerTier::Medium,
            TaskComplexity::Complex => WorkerTier::Complex,
        }
    }
}

/// A clarified task. Immutable after clarification.
#[derive(Debug, Clone)]
pub struct Task {
    pub original: String,
    /// Always equal to `original`; the clarifier adds criteria, never
    /// rephrases.
    pub clarified: String,
    pub complexity: TaskComplexity,
    pub criteria: Vec<String>,
    pub needs_final_review: bool,
}

impl Task {
    fn as_is(text: &str, complexity: TaskComplexity, needs_final_review: bool) -> Self {
        Self {
            original: text.to_string(),
            clarified: text.to_string(),
            complexity,
            criteria: Vec::new(),
            needs_final_review,
        }
    }

    /// Render the task with its criteria for handing to a worker
    pub fn with_criteria(&self) -> String {
        if self.criteria.is_empty() {
            return self.clarified.clone();
        }

        let criteria_text = self
            .criteria
            .iter()
            .enumerate()
            .map(|(i, c)| format!("  {}. {}", i + 1, c))
            .collect::<Vec<_>>()
            .join("\n");

        format!(
            "{}\n\nAcceptance criteria:\n{}\n\nComplete EVERY item. \
             After finishing, verify each criterion is met.",
            self.clarified, criteria_text
        )
    }
}

/// Callback used to ask the human a question and await the answer
pub type AskUser = Arc<dyn Fn(String) -> BoxFuture<'static, String> + Send + Sync>;

/// Directives that mean "do not ask anything, just run"
const NO_QUESTION_PHRASES: &[&str] = &[
    "не спрашивай",
    "без вопросов",
    "делай",
    "просто сделай",
    "не задавай",
    "don't ask",
    "just do",
    "no questions",
];

const CLARIFY_PROMPT: &str = r#"You are an assistant analyzing engineering task statements.

Working directory: {project_path}

Task from the user:
{task}

Your role is NOT to rephrase the task. Only:
1. Rate its complexity
2. Add crisp acceptance criteria

IMPORTANT:
- If the user wrote "don't ask", "just do it" or similar, ask NO questions
- Do NOT reformulate the task; the user already stated it
- Only ADD acceptance criteria for verifying completion

Respond in JSON:
{
    "complexity": "SIMPLE|MEDIUM|COMPLEX",
    "is_clear": true,
    "acceptance_criteria": ["criterion 1", "criterion 2"],
    "questions": [],
    "needs_final_review": true
}

Complexity:
- SIMPLE: one action (a typo, a trivial file)
- MEDIUM: a few steps (an endpoint, a test)
- COMPLEX: many changes (a new feature, a large refactor)"#;

/// Clarifies tasks through the router, optionally consulting the human
pub struct TaskClarifier {
    router: Arc<LlmRouter>,
    project_path: String,
    ask_user: Option<AskUser>,
}

impl TaskClarifier {
    pub fn new(router: Arc<LlmRouter>, project_path: impl Into<String>, ask_user: Option<AskUser>) -> Self {
        Self {
            router,
            project_path: project_path.into(),
            ask_user,
        }
    }

    /// Clarify a task: rate complexity and propose acceptance criteria.
    ///
    /// The returned task always carries the original text unchanged.
    pub async fn clarify(&self, task: &str) -> Task {
        let task = task.trim();
        info!(task = %task.chars().take(50).collect::<String>(), "clarifying task");

        let task_lower = task.to_lowercase();
        if NO_QUESTION_PHRASES.iter().any(|p| task_lower.contains(p)) {
            info!("user requested no questions, sending task as is");
            return Task::as_is(task, TaskComplexity::Complex, true);
        }

        let prompt = CLARIFY_PROMPT
            .replace("{project_path}", &self.project_path)
            .replace("{task}", task);

        let result = match self.router.generate_json(&prompt, 0.3).await {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "clarification failed, sending task as is");
                return Task::as_is(task, TaskComplexity::Medium, false);
            }
        };

        let mut criteria: Vec<String> = result["acceptance_criteria"]
            .as_array()
            .map(|items| items.iter().filter_map(|v| v.as_str()).map(str::to_string).collect())
            .unwrap_or_default();

        if !criteria.is_empty() && self.ask_user.is_some() {
            criteria = self.confirm_criteria(criteria).await;
        }

        let complexity = result["complexity"]
            .as_str()
            .and_then(TaskComplexity::parse)
            .unwrap_or(TaskComplexity::Medium);

        let task = Task {
            original: task.to_string(),
            clarified: task.to_string(),
            complexity,
            criteria,
            needs_final_review: result["needs_final_review"].as_bool().unwrap_or(false),
        };

        info!(
            complexity = task.complexity.as_str(),
            criteria = task.criteria.len(),
            "clarification done"
        );
        task
    }

    /// Ask the user to approve, reject, or replace proposed criteria
    async fn confirm_criteria(&self, criteria: Vec<String>) -> Vec<String> {
        let Some(ask) = &self.ask_user else {
            return criteria;
        };

        let listing = criteria
            .iter()
            .enumerate()
            .map(|(i, c)| format!("  {}. {}", i + 1, c))
            .collect::<Vec<_>>()
            .join("\n");

        let answer = ask(format!(
            "Proposed acceptance criteria:\n{}\n\nApprove? (yes/no/your own)",
            listing
        ))
        .await;

        let normalized = answer.trim().to_lowercase();
        if ["нет", "no", "n", "без критериев"].contains(&normalized.as_str()) {
            info!("user rejected criteria");
            return Vec::new();
        }
        if ["да", "yes", "y", "ок", "ok", ""].contains(&normalized.as_str()) {
            return criteria;
        }

        // Anything else is the user's own list, one per line
        info!("user provided custom criteria");
        answer
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Tier heuristic without any LLM call
    pub fn quick_assess(task: &str) -> TaskComplexity {
        let task_lower = task.to_lowercase();

        const SIMPLE_KEYWORDS: &[&str] = &[
            "echo", "ls", "cat", "pwd", "опечатк", "typo", "fix typo", "readme", "comment", "print", "log",
            "покажи", "выведи",
        ];
        if SIMPLE_KEYWORDS.iter().any(|k| task_lower.contains(k)) {
            return TaskComplexity::Simple;
        }

        const COMPLEX_KEYWORDS: &[&str] = &[
            "баг", "bug", "утечк", "leak", "архитектур", "рефактор", "мигр", "планир", "design", "разработа",
            "implement", "oauth", "auth", "database", "api", "интеграц",
        ];
        if COMPLEX_KEYWORDS.iter().any(|k| task_lower.contains(k)) {
            return TaskComplexity::Complex;
        }

        match task.chars().count() {
            0..30 => TaskComplexity::Simple,
            30..=200 => TaskComplexity::Medium,
            _ => TaskComplexity::Complex,
        }
    }
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
                max_retries: 1,
                retry_delay: std::time::Duration::from_millis(1),
                ..Default::default()
            },
            vec![client],
        ))
    }

    fn answering(answer: &'static str) -> AskUser {
        Arc::new(move |_q| Box::pin(async move { answer.to_string() }))
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_questions_directive_skips_llm() {
        let router = router_with(vec![]);
        let clarifier = TaskClarifier::new(router, ".", None);

        let task = clarifier.clarify("поправь сборку, не спрашивай").await;
        assert_eq!(task.complexity, TaskComplexity::Complex);
        assert!(task.criteria.is_empty());
        assert!(task.needs_final_review);
        assert_eq!(task.clarified, task.original);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clarify_parses_llm_result() {
        let router = router_with(vec![MockResponse::Text(
            r#"{"complexity": "COMPLEX", "is_clear": true,
                "acceptance_criteria": ["compiles", "tests pass"],
                "questions": [], "needs_final_review": true}"#
                .into(),
        )]);
        let clarifier = TaskClarifier::new(router, "/work", None);

        let task = clarifier.clarify("add oauth login flow").await;
        assert_eq!(task.complexity, TaskComplexity::Complex);
        assert_eq!(task.criteria, vec!["compiles", "tests pass"]);
        assert!(task.needs_final_review);
    }

    #[tokio::test(start_paused = true)]
    async fn test_criteria_rejected_by_user() {
        // S5: user answers "нет", criteria emptied, task text untouched
        let router = router_with(vec![MockResponse::Text(
            r#"{"complexity": "MEDIUM", "is_clear": true,
                "acceptance_criteria": ["compiles", "tests pass"],
                "questions": [], "needs_final_review": false}"#
                .into(),
        )]);
        let clarifier = TaskClarifier::new(router, ".", Some(answering("нет")));

        let task = clarifier.clarify("update the parser").await;
        assert!(task.criteria.is_empty());
        assert_eq!(task.clarified, task.original);
        assert_eq!(task.clarified, "update the parser");
    }

    #[tokio::test(start_paused = true)]
    async fn test_criteria_approved_by_empty_answer() {
        let router = router_with(vec![MockResponse::Text(
            r#"{"complexity": "MEDIUM", "acceptance_criteria": ["builds cleanly"],
                "questions": [], "needs_final_review": false}"#
                .into(),
        )]);
        let clarifier = TaskClarifier::new(router, ".", Some(answering("")));

        let task = clarifier.clarify("update the parser").await;
        assert_eq!(task.criteria, vec!["builds cleanly"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_criteria_replaced_by_user() {
        let router = router_with(vec![MockResponse::Text(
            r#"{"complexity": "MEDIUM", "acceptance_criteria": ["builds cleanly"],
                "questions": [], "needs_final_review": false}"#
                .into(),
        )]);
        let clarifier = TaskClarifier::new(router, ".", Some(answering("lints pass\nno panics")));

        let task = clarifier.clarify("update the parser").await;
        assert_eq!(task.criteria, vec!["lints pass", "no panics"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_llm_failure_falls_back_to_medium() {
        let router = router_with(vec![MockResponse::Error(|| {
            crate::error::EngineError::ProviderConnectionFailed("down".into())
        })]);
        let clarifier = TaskClarifier::new(router, ".", None);

        let task = clarifier.clarify("do something useful with the cache").await;
        assert_eq!(task.complexity, TaskComplexity::Medium);
        assert!(task.criteria.is_empty());
        assert_eq!(task.clarified, task.original);
    }

    #[test]
    fn test_quick_assess_simple() {
        assert_eq!(TaskClarifier::quick_assess("fix typo in readme"), TaskComplexity::Simple);
        assert_eq!(TaskClarifier::quick_assess("покажи логи"), TaskComplexity::Simple);
    }

    #[test]
    fn test_quick_assess_complex() {
        assert_eq!(
            TaskClarifier::quick_assess("refactor the database layer behind a new api"),
            TaskComplexity::Complex
        );
    }

    #[test]
    fn test_quick_assess_by_length() {
        assert_eq!(TaskClarifier::quick_assess("tweak padding"), TaskComplexity::Simple);
        assert_eq!(
            TaskClarifier::quick_assess("change the settings panel so that the interval control validates its input"),
            TaskComplexity::Medium
        );
    }

    #[test]
    fn test_with_criteria_rendering() {
        let task = Task {
            original: "build it".into(),
            clarified: "build it".into(),
            complexity: TaskComplexity::Medium,
            criteria: vec!["compiles".into(), "tests pass".into()],
            needs_final_review: false,
        };
        let rendered = task.with_criteria();
        assert!(rendered.contains("1. compiles"));
        assert!(rendered.contains("2. tests pass"));

        let bare = Task::as_is("build it", TaskComplexity::Simple, false);
        assert_eq!(bare.with_criteria(), "build it");
    }
}
