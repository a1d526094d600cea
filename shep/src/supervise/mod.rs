//! Single-shot supervision: analyzer verdicts turned into decisions
//!
//! The supervisor owns the per-step counters (confirmations, failed
//! attempts) and turns each analyzer verdict into one concrete decision
//! with bounded retries before escalating.

pub mod analyzer;
pub mod enforcer;

pub use analyzer::{AnalysisAction, AnalysisResult, QuickCheck, ResponseAnalyzer};
pub use enforcer::{EnforcementResult, TaskEnforcer};

use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::llm::LlmRouter;
use crate::watch::watchdog::{HealthCheck, WatchdogAction};

/// What the supervisor wants done this iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorAction {
    Continue,
    NewChat,
    SendMessage,
    Restart,
    Ping,
    Wait,
    Escalate,
}

/// One supervisor decision
#[derive(Debug, Clone)]
pub struct SupervisorDecision {
    pub action: SupervisorAction,
    pub message: Option<String>,
    pub reason: String,
    pub analysis: Option<AnalysisResult>,
}

/// Coordinates analyzer, enforcer, and health handling for one run
pub struct Supervisor {
    router: Arc<LlmRouter>,
    analyzer: ResponseAnalyzer,
    enforcer: TaskEnforcer,
    confirmations: u32,
    failed_attempts: u32,
}

impl Supervisor {
    pub fn new(router: Arc<LlmRouter>, escalate_after: u32, truncate_length: usize, truncate_start_ratio: f64) -> Self {
        Self {
            analyzer: ResponseAnalyzer::new(router.clone(), truncate_length, truncate_start_ratio),
            enforcer: TaskEnforcer::new(escalate_after, Some(router.clone())),
            router,
            confirmations: 0,
            failed_attempts: 0,
        }
    }

    pub fn confirmations(&self) -> u32 {
        self.confirmations
    }

    pub fn failed_attempts(&self) -> u32 {
        self.failed_attempts
    }

    /// Analyze one worker response and decide what happens next
    #[allow(clippy::too_many_arguments)]
    pub async fn analyze_response(
        &mut self,
        worker_output: &str,
        step_prompt: &str,
        step_number: u32,
        step_name: &str,
        iteration: u32,
        completion_criteria: &[String],
    ) -> SupervisorDecision {
        let analysis = self
            .analyzer
            .analyze(
                worker_output,
                step_prompt,
                step_number,
                step_name,
                iteration,
                self.confirmations,
                self.failed_attempts,
                completion_criteria,
            )
            .await;

        info!(
            action = ?analysis.action,
            task_complete = analysis.task_complete,
            has_changes = analysis.has_changes,
            substantial = analysis.changes_substantial,
            "analysis verdict"
        );

        self.make_decision(analysis, step_prompt, worker_output).await
    }

    async fn make_decision(
        &mut self,
        analysis: AnalysisResult,
        step_prompt: &str,
        worker_output: &str,
    ) -> SupervisorDecision {
        match analysis.action {
            AnalysisAction::Escalate => SupervisorDecision {
                action: SupervisorAction::Escalate,
                message: None,
                reason: analysis.reason.clone(),
                analysis: Some(analysis),
            },

            AnalysisAction::EnforceTask => {
                self.failed_attempts += 1;

                let enforcement = self
                    .enforcer
                    .enforce_with_llm(&analysis.issues, step_prompt, worker_output, &analysis.issues)
                    .await;

                if enforcement.should_escalate {
                    return SupervisorDecision {
                        action: SupervisorAction::Escalate,
                        message: None,
                        reason: "Max enforcement attempts reached".to_string(),
                        analysis: Some(analysis),
                    };
                }

                SupervisorDecision {
                    action: SupervisorAction::SendMessage,
                    message: Some(enforcement.message),
                    reason: format!("Task not complete, attempt {}", enforcement.attempt),
                    analysis: Some(analysis),
                }
            }

            AnalysisAction::AskDroid => {
                let message = if analysis.message_to_droid.is_empty() {
                    "Describe what you did and which changes you made.".to_string()
                } else {
                    analysis.message_to_droid.clone()
                };

                SupervisorDecision {
                    action: SupervisorAction::SendMessage,
                    message: Some(message),
                    reason: "Need clarification".to_string(),
                    analysis: Some(analysis),
                }
            }

            AnalysisAction::NewChat => {
                self.confirmations = 0;
                self.failed_attempts = 0;
                self.enforcer.reset();

                SupervisorDecision {
                    action: SupervisorAction::NewChat,
                    message: None,
                    reason: format!("Substantial changes: {}", analysis.changes_description),
                    analysis: Some(analysis),
                }
            }

            AnalysisAction::Continue => {
                // No changes, or only cosmetic ones, count toward done
                if !analysis.has_changes || !analysis.changes_substantial {
                    self.confirmations += 1;
                }
                self.failed_attempts = 0;
                self.enforcer.reset();

                SupervisorDecision {
                    action: SupervisorAction::Continue,
                    message: None,
                    reason: format!("Confirmations: {}/2", self.confirmations),
                    analysis: Some(analysis),
                }
            }
        }
    }

    /// Map a watchdog health issue to a supervisor decision
    pub fn handle_health_issue(&self, health: &HealthCheck) -> SupervisorDecision {
        let action = match health.action {
            WatchdogAction::Escalate => SupervisorAction::Escalate,
            WatchdogAction::Restart => SupervisorAction::Restart,
            WatchdogAction::NewChat => SupervisorAction::NewChat,
            WatchdogAction::Ping => SupervisorAction::Ping,
            WatchdogAction::Wait | WatchdogAction::None => SupervisorAction::Wait,
        };

        SupervisorDecision {
            action,
            message: None,
            reason: health.reason.clone(),
            analysis: None,
        }
    }

    /// Reset all per-step state
    pub fn reset_state(&mut self) {
        self.confirmations = 0;
        self.failed_attempts = 0;
        self.enforcer.reset();
    }

    /// Counter snapshot, merged with router stats
    pub fn get_stats(&self) -> HashMap<String, u64> {
        let mut stats = self.router.get_stats();
        stats.insert("confirmations".to_string(), self.confirmations as u64);
        stats.insert("failed_attempts".to_string(), self.failed_attempts as u64);
        stats.insert("enforcer_attempts".to_string(), self.enforcer.attempts() as u64);
        stats
    }
}
