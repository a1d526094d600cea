//! Iterative execute/review loop
//!
//! Alternates an executor worker and a reviewer worker until the
//! reviewer finds nothing (and nothing changed), the decision model says
//! stop, a cycle is detected, or the iteration budget runs out.

pub mod findings;
pub mod runner;

pub use findings::{CycleReport, Finding, Severity, detect_cycle, parse_findings};
pub use runner::{ManagedRunner, WorkerRunner};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{info, warn};

use crate::clarify::{Task, TaskClarifier};
use crate::llm::LlmRouter;
use crate::worker::WorkerTier;

/// Decision over a review's findings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopDecision {
    Fix,
    Skip,
    Done,
}

impl LoopDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoopDecision::Fix => "fix",
            LoopDecision::Skip => "skip",
            LoopDecision::Done => "done",
        }
    }
}

/// What to do when a worker invocation fails
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SituationAction {
    Retry,
    Wait { seconds: u64 },
    Continue,
    SwitchModel,
    Abort,
    AskUser { message: String },
}

/// One executor+review round
#[derive(Debug, Clone)]
pub struct LoopIteration {
    pub n: u32,
    pub executor_name: Option<String>,
    pub reviewer_name: String,
    pub findings: Vec<Finding>,
    pub had_vcs_changes: bool,
    pub decision: Option<LoopDecision>,
    pub fix_instructions: Option<String>,
}

/// Final outcome of a review loop
#[derive(Debug, Clone)]
pub struct ReviewLoopResult {
    pub success: bool,
    pub iterations: u32,
    pub total_findings: usize,
    /// CRITICAL/HIGH findings a fix iteration was dispatched for
    /// (attempted, not verified)
    pub fixed_findings: usize,
    /// Previously reported findings that disappeared from the next review
    pub confirmed_fixed: usize,
    pub remaining_findings: Vec<Finding>,
    pub history: Vec<LoopIteration>,
    pub cycle_detected: bool,
    pub cycle_reason: String,
}

/// Review loop configuration
#[derive(Debug, Clone)]
pub struct ReviewLoopConfig {
    pub max_iterations: u32,
    pub skip_first_execution: bool,
    /// Decide by severity thresholds instead of asking the model
    pub simple_mode: bool,
    pub executor_tier: WorkerTier,
    pub reviewer_tier: WorkerTier,
    pub worker_timeout: Duration,
}

impl Default for ReviewLoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            skip_first_execution: false,
            simple_mode: false,
            executor_tier: WorkerTier::Medium,
            reviewer_tier: WorkerTier::Complex,
            worker_timeout: Duration::from_secs(1800),
        }
    }
}

/// Retries per worker invocation
const MAX_WORKER_RETRIES: u32 = 3;

const REVIEW_TASK: &str = r#"Perform a METICULOUS code review:

Task context: {context}

Acceptance criteria:
{criteria}

Check:
1. The code for bugs, errors, vulnerabilities
2. Conformance with EVERY acceptance criterion above
3. Run the project if needed
4. Verify visually that everything works
5. Consider quality, architecture, test coverage, usability,
   and whether the requirements are actually met

IMPORTANT:
- Be thorough but do NOT invent problems to have something to report
- Skip minor style and formatting nits
- Only REAL problems that need fixing
- You only FIND issues, you do NOT fix them; the executor will

Report findings as:
- CRITICAL/HIGH/MEDIUM/LOW: description. file:line

If there are no problems, write "No problems found"."#;

const ANALYZE_FINDINGS_PROMPT: &str = r#"You are analyzing code review results.

TASK under review: {task}

FINDINGS from the reviewer:
{findings}

Iteration: {iteration} of {max_iterations}

Decide what to do:
- CRITICAL/HIGH problems usually MUST be fixed
- MEDIUM problems are worth fixing if it will not take long
- LOW problems are your call; fix if trivial, skip otherwise

If findings are empty or only minor remarks, finishing is fine.
If few iterations remain, focus only on the critical.

Respond with JSON:
{
    "decision": "fix" | "skip" | "done",
    "reason": "why",
    "critical_issues": ["critical problems, if any"],
    "fix_instructions": "concrete fix instructions (if decision=fix)"
}

JSON ONLY, no commentary."#;

const SITUATION_PROMPT: &str = r#"You are a supervision assistant. Analyze the situation and decide.

TASK: {task}

CURRENT SITUATION:
{situation}

LAST OUTPUT (tail):
{output}

Possible actions:
- retry: try again (transient errors like 403, 429, timeout)
- wait: wait N seconds and retry (rate limit)
- continue: everything is fine, keep going
- switch_model: try another model (this one cannot cope)
- abort: stop (the error is fatal and unfixable)
- ask_user: ask the user what to do

Respond with JSON:
{
    "action": "retry" | "wait" | "continue" | "switch_model" | "abort" | "ask_user",
    "reason": "short explanation",
    "wait_seconds": 30,
    "message": "message for the user if action=ask_user"
}

JSON ONLY."#;

/// Status line callback for the CLI surface
pub type StatusFn = Arc<dyn Fn(String) + Send + Sync>;

/// Controller for the iterative execute/review protocol
pub struct ReviewLoopManager {
    router: Arc<LlmRouter>,
    runner: Arc<dyn WorkerRunner>,
    config: ReviewLoopConfig,
    on_status: Option<StatusFn>,
    history: Vec<LoopIteration>,
    stop_requested: Arc<AtomicBool>,
}

impl ReviewLoopManager {
    pub fn new(
        router: Arc<LlmRouter>,
        runner: Arc<dyn WorkerRunner>,
        config: ReviewLoopConfig,
        on_status: Option<StatusFn>,
    ) -> Self {
        Self {
            router,
            runner,
            config,
            on_status,
            history: Vec::new(),
            stop_requested: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Cooperative cancellation flag; checked between worker phases
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop_requested.clone()
    }

    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::Relaxed);
    }

    fn report(&self, message: impl Into<String>) {
        let message = message.into();
        info!(target: "review_loop", "{}", message);
        if let Some(cb) = &self.on_status {
            cb(message);
        }
    }

    fn stopped(&self) -> bool {
        self.stop_requested.load(Ordering::Relaxed)
    }

    /// Run the loop to completion.
    ///
    /// `clarifier` is consulted once up front unless simple mode is on.
    pub async fn run_loop(&mut self, task: &str, clarifier: Option<&TaskClarifier>) -> ReviewLoopResult {
        let max_iter = self.config.max_iterations;
        let mut total_findings = 0usize;
        let mut fixed_findings = 0usize;
        let mut confirmed_fixed = 0usize;

        self.report(format!("Starting review loop (max {} iterations)", max_iter));

        let clarified: Option<Task> = match clarifier {
            Some(clarifier) if !self.config.simple_mode => Some(clarifier.clarify(task).await),
            _ => None,
        };

        let mut current_task = match &clarified {
            Some(t) => {
                self.report(format!("Complexity: {}", t.complexity.as_str()));
                self.report(format!("Acceptance criteria: {} items", t.criteria.len()));
                t.with_criteria()
            }
            None => task.to_string(),
        };

        for i in 0..max_iter {
            if self.stopped() {
                self.report("Stopped by user");
                break;
            }
            let iteration_num = i + 1;

            // Cycle check before launching the next iteration
            let finding_sets: Vec<Vec<Finding>> = self.history.iter().map(|it| it.findings.clone()).collect();
            if let Some(cycle) = detect_cycle(&finding_sets) {
                self.report(format!("Cycle detected: {}", cycle.reason));
                for issue in cycle.repeating.iter().take(5) {
                    let short: String = issue.chars().take(100).collect();
                    self.report(format!("  unresolved: {}", short));
                }
                return self.result(false, iteration_num - 1, total_findings, fixed_findings, confirmed_fixed, true, cycle.reason);
            }

            self.report(format!("=== Iteration {}/{} ===", iteration_num, max_iter));

            let history_context = self.history_context(3);
            let task_with_context = if history_context.is_empty() {
                current_task.clone()
            } else {
                format!("{}\n\nPrevious iterations:\n{}", current_task, history_context)
            };

            // 1. Executor
            let skip_execution = self.config.skip_first_execution && iteration_num == 1;
            let executor_name = if skip_execution {
                self.report("Review-first mode: skipping execution, going straight to review");
                None
            } else {
                let tier = self.config.executor_tier;
                self.report(format!("Running {} executor...", tier));
                self.run_worker_with_retry(tier, &task_with_context, task).await;
                Some(tier.to_string())
            };

            if self.stopped() {
                break;
            }

            // 2. Working-tree inspection after execution
            let had_changes = self.runner.has_vcs_changes().await;
            if had_changes {
                self.report("Changes detected in repository");
            }

            // 3. Reviewer
            let reviewer_tier = self.config.reviewer_tier;
            self.report(format!("Running {} review...", reviewer_tier));
            let criteria_text = match &clarified {
                Some(t) if !t.criteria.is_empty() => {
                    t.criteria.iter().map(|c| format!("- {}", c)).collect::<Vec<_>>().join("\n")
                }
                _ => "No explicit criteria".to_string(),
            };
            let mut review_task = REVIEW_TASK.replace("{context}", task).replace("{criteria}", &criteria_text);
            if !history_context.is_empty() {
                review_task.push_str(&format!(
                    "\n\nPrevious iterations (avoid repeating the same fixes):\n{}",
                    history_context
                ));
            }
            let review_output = self.run_worker_with_retry(reviewer_tier, &review_task, task).await;

            if self.stopped() {
                break;
            }

            // 4. Findings
            let findings = parse_findings(&review_output);
            total_findings += findings.len();
            self.report(format!(
                "Found {} issues{}",
                findings.len(),
                if had_changes { ", had changes" } else { ", no changes" }
            ));
            for finding in findings.iter().take(5) {
                self.report(format!("  {}", finding));
            }
            if findings.len() > 5 {
                self.report(format!("  ... and {} more", findings.len() - 5));
            }

            // Confirmed fixes: previous findings that no longer show up
            if let Some(previous) = self.history.last() {
                let current_keys: std::collections::HashSet<String> = findings.iter().map(Finding::key).collect();
                confirmed_fixed += previous.findings.iter().filter(|f| !current_keys.contains(&f.key())).count();
            }

            // 5. Decision
            let (decision, fix_instructions) = self
                .analyze_findings(task, &findings, iteration_num, max_iter, had_changes)
                .await;
            self.report(format!(
                "{} decision: {}",
                if self.config.simple_mode { "Severity" } else { "Router" },
                decision.as_str()
            ));

            self.history.push(LoopIteration {
                n: iteration_num,
                executor_name,
                reviewer_name: reviewer_tier.to_string(),
                findings: findings.clone(),
                had_vcs_changes: had_changes,
                decision: Some(decision),
                fix_instructions: fix_instructions.clone(),
            });

            match decision {
                LoopDecision::Done => {
                    self.report("Review complete, no more fixes needed");
                    return self.result(true, iteration_num, total_findings, fixed_findings, confirmed_fixed, false, String::new());
                }
                LoopDecision::Skip => {
                    self.report("Skipping remaining issues");
                    return self.result(true, iteration_num, total_findings, fixed_findings, confirmed_fixed, false, String::new());
                }
                LoopDecision::Fix => {
                    fixed_findings += findings
                        .iter()
                        .filter(|f| matches!(f.severity, Severity::Critical | Severity::High))
                        .count();
                    current_task = prepare_fix_task(task, &findings, fix_instructions.as_deref());
                    self.report("Preparing fixes for the next iteration...");
                }
            }
        }

        self.report(format!("Reached max iterations ({})", max_iter));
        self.result(false, max_iter, total_findings, fixed_findings, confirmed_fixed, false, String::new())
    }

    #[allow(clippy::too_many_arguments)]
    fn result(
        &self,
        success: bool,
        iterations: u32,
        total_findings: usize,
        fixed_findings: usize,
        confirmed_fixed: usize,
        cycle_detected: bool,
        cycle_reason: String,
    ) -> ReviewLoopResult {
        ReviewLoopResult {
            success,
            iterations,
            total_findings,
            fixed_findings,
            confirmed_fixed,
            remaining_findings: self.history.last().map(|it| it.findings.clone()).unwrap_or_default(),
            history: self.history.clone(),
            cycle_detected,
            cycle_reason,
        }
    }

    /// Context digest of the last `last_n` iterations
    fn history_context(&self, last_n: usize) -> String {
        if self.history.is_empty() {
            return String::new();
        }

        let start = self.history.len().saturating_sub(last_n);
        self.history[start..]
            .iter()
            .map(|it| {
                let findings_str = it
                    .findings
                    .iter()
                    .take(5)
                    .map(|f| format!("{}: {}", f.severity.as_str(), f.description.chars().take(50).collect::<String>()))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!(
                    "Iteration {}: {} issues ({}), decision: {}",
                    it.n,
                    it.findings.len(),
                    findings_str,
                    it.decision.map(|d| d.as_str()).unwrap_or("unknown")
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Run one worker invocation with bounded retries and situation
    /// analysis between failed attempts. Returns the final output.
    async fn run_worker_with_retry(&self, tier: WorkerTier, task: &str, original_task: &str) -> String {
        let mut output = String::new();

        for attempt in 0..MAX_WORKER_RETRIES {
            match self.runner.run_worker(tier, task, self.config.worker_timeout).await {
                Ok((true, out)) => return out,
                Ok((false, out)) => {
                    output = out;
                    let situation = format!(
                        "Worker {} returned a failure on attempt {}/{}",
                        tier,
                        attempt + 1,
                        MAX_WORKER_RETRIES
                    );
                    let action = self.analyze_situation(original_task, &situation, &output).await;

                    match action {
                        SituationAction::Retry => {
                            if attempt + 1 >= MAX_WORKER_RETRIES {
                                self.report(format!("{} failed after {} retry attempts", tier, MAX_WORKER_RETRIES));
                                return output;
                            }
                            self.report(format!("{}: retrying ({}/{})...", tier, attempt + 1, MAX_WORKER_RETRIES));
                            tokio::time::sleep(Duration::from_secs(5)).await;
                        }
                        SituationAction::Wait { seconds } => {
                            if attempt + 1 >= MAX_WORKER_RETRIES {
                                self.report(format!("{} failed after {} wait attempts", tier, MAX_WORKER_RETRIES));
                                return output;
                            }
                            self.report(format!("{}: waiting {}s before retry...", tier, seconds));
                            tokio::time::sleep(Duration::from_secs(seconds)).await;
                        }
                        SituationAction::Abort => {
                            self.report(format!("{}: aborting", tier));
                            return output;
                        }
                        SituationAction::AskUser { message } => {
                            self.report(format!("{}: {}", tier, message));
                            return output;
                        }
                        SituationAction::SwitchModel | SituationAction::Continue => {
                            if attempt + 1 >= MAX_WORKER_RETRIES {
                                self.report(format!("{} failed after {} attempts", tier, MAX_WORKER_RETRIES));
                                return output;
                            }
                            tokio::time::sleep(Duration::from_secs(10)).await;
                        }
                    }
                }
                Err(e) => {
                    warn!(tier = %tier, attempt, error = %e, "worker invocation error");
                    if attempt + 1 >= MAX_WORKER_RETRIES {
                        return output;
                    }
                    tokio::time::sleep(Duration::from_secs(10)).await;
                }
            }
        }

        output
    }

    /// Decide how to react to a failed worker invocation
    async fn analyze_situation(&self, task: &str, situation: &str, output: &str) -> SituationAction {
        if self.config.simple_mode {
            let lower = output.to_lowercase();
            if lower.contains("error: 403") || lower.contains("error: 429") {
                return SituationAction::Wait { seconds: 30 };
            }
            if lower.contains("timeout") || lower.contains("connection") {
                return SituationAction::Retry;
            }
            return SituationAction::Continue;
        }

        let task_head: String = task.chars().take(500).collect();
        let output_chars: Vec<char> = output.chars().collect();
        let output_tail: String = output_chars[output_chars.len().saturating_sub(2000)..].iter().collect();

        let prompt = SITUATION_PROMPT
            .replace("{task}", &task_head)
            .replace("{situation}", situation)
            .replace("{output}", &output_tail);

        match self.router.generate_json(&prompt, 0.2).await {
            Ok(value) => {
                let action = value["action"].as_str().unwrap_or("continue");
                let reason = value["reason"].as_str().unwrap_or("");
                self.report(format!("Router decision: {} - {}", action, reason));

                match action {
                    "retry" => SituationAction::Retry,
                    "wait" => SituationAction::Wait {
                        seconds: value["wait_seconds"].as_u64().unwrap_or(30),
                    },
                    "switch_model" => SituationAction::SwitchModel,
                    "abort" => SituationAction::Abort,
                    "ask_user" => SituationAction::AskUser {
                        message: value["message"].as_str().unwrap_or("What should be done next?").to_string(),
                    },
                    _ => SituationAction::Continue,
                }
            }
            Err(e) => {
                warn!(error = %e, "situation analysis failed");
                SituationAction::Continue
            }
        }
    }

    /// Decide what to do with a review's findings
    async fn analyze_findings(
        &self,
        task: &str,
        findings: &[Finding],
        iteration: u32,
        max_iterations: u32,
        had_changes: bool,
    ) -> (LoopDecision, Option<String>) {
        // Changes without findings still need a verification pass
        if findings.is_empty() {
            if had_changes {
                info!("no findings but changes detected, continue reviewing");
                return (LoopDecision::Fix, Some("Changes detected, verify they work correctly".to_string()));
            }
            return (LoopDecision::Done, None);
        }

        if self.config.simple_mode {
            let count = |s: Severity| findings.iter().filter(|f| f.severity == s).count();
            let critical = count(Severity::Critical);
            let high = count(Severity::High);
            let medium = count(Severity::Medium);

            return if critical > 0 {
                (LoopDecision::Fix, Some(format!("Fix {} CRITICAL issues", critical)))
            } else if high > 0 {
                (LoopDecision::Fix, Some(format!("Fix {} HIGH severity issues", high)))
            } else if medium > 0 && iteration < max_iterations.saturating_sub(2) {
                (LoopDecision::Fix, Some(format!("Fix {} MEDIUM severity issues", medium)))
            } else {
                (LoopDecision::Done, None)
            };
        }

        let findings_text = findings.iter().map(|f| f.to_string()).collect::<Vec<_>>().join("\n");
        let prompt = ANALYZE_FINDINGS_PROMPT
            .replace("{task}", task)
            .replace("{findings}", &findings_text)
            .replace("{iteration}", &iteration.to_string())
            .replace("{max_iterations}", &max_iterations.to_string());

        match self.router.generate_json(&prompt, 0.3).await {
            Ok(value) => {
                let decision = match value["decision"].as_str().unwrap_or("done") {
                    "fix" => LoopDecision::Fix,
                    "skip" => LoopDecision::Skip,
                    _ => LoopDecision::Done,
                };
                if let Some(reason) = value["reason"].as_str() {
                    info!(reason, "findings decision reason");
                }
                (decision, value["fix_instructions"].as_str().map(str::to_string))
            }
            Err(e) => {
                warn!(error = %e, "failed to analyze findings");
                let has_critical = findings
                    .iter()
                    .any(|f| matches!(f.severity, Severity::Critical | Severity::High));
                if has_critical {
                    (LoopDecision::Fix, Some("Fix critical and high severity issues".to_string()))
                } else {
                    (LoopDecision::Done, None)
                }
            }
        }
    }
}

/// Rewrite the next executor task around the actionable findings
pub fn prepare_fix_task(original_task: &str, findings: &[Finding], fix_instructions: Option<&str>) -> String {
    let findings_text = findings
        .iter()
        .filter(|f| f.severity.actionable())
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("\n");

    let instructions = match fix_instructions {
        Some(text) if !text.is_empty() => format!("Instructions: {}\n\n", text),
        _ => String::new(),
    };

    format!(
        "FIX THE PROBLEMS FOUND:\n\n\
         Original task: {}\n\n\
         Code review found these problems:\n{}\n\n\
         {}Fix these problems. The code will be reviewed again afterwards.",
        original_task, findings_text, instructions
    )
}
