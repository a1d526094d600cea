//! Task enforcement
//!
//! When the worker has not finished a step, the enforcer produces
//! increasingly terse nagging messages. After the attempt limit it
//! demands escalation instead.

use std::sync::Arc;
use tracing::info;

use crate::llm::LlmRouter;

/// Result of one enforcement round
#[derive(Debug, Clone)]
pub struct EnforcementResult {
    pub should_enforce: bool,
    pub message: String,
    pub attempt: u32,
    pub should_escalate: bool,
}

const ENFORCEMENT_TEMPLATES: &[&str] = &[
    "The task requires: {missing}. Finish it.",
    "You have not finished: {missing}. Complete it and show the result.",
    "The task is not done. Remaining: {missing}. Finish.",
    "Show exactly what you changed. If nothing, say so directly.",
    "Run it and show it working. Results are needed, not promises.",
];

/// Message length cap for LLM-generated enforcement text
const MAX_MESSAGE_LEN: usize = 300;

/// Insists that a step gets finished
pub struct TaskEnforcer {
    max_attempts: u32,
    current_attempt: u32,
    router: Option<Arc<LlmRouter>>,
}

impl TaskEnforcer {
    pub fn new(max_attempts: u32, router: Option<Arc<LlmRouter>>) -> Self {
        Self {
            max_attempts,
            current_attempt: 0,
            router,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.current_attempt
    }

    pub fn reset(&mut self) {
        self.current_attempt = 0;
    }

    /// Produce a templated enforcement message, or demand escalation
    pub fn enforce(&mut self, missing_items: &[String]) -> EnforcementResult {
        self.current_attempt += 1;

        if self.current_attempt >= self.max_attempts {
            return EnforcementResult {
                should_enforce: false,
                message: String::new(),
                attempt: self.current_attempt,
                should_escalate: true,
            };
        }

        let template_idx = ((self.current_attempt - 1) as usize).min(ENFORCEMENT_TEMPLATES.len() - 1);
        let missing = if missing_items.is_empty() {
            "finish the task".to_string()
        } else {
            missing_items.join(", ")
        };

        EnforcementResult {
            should_enforce: true,
            message: ENFORCEMENT_TEMPLATES[template_idx].replace("{missing}", &missing),
            attempt: self.current_attempt,
            should_escalate: false,
        }
    }

    /// Produce an LLM-written enforcement message with template fallback
    pub async fn enforce_with_llm(
        &mut self,
        missing_items: &[String],
        step_prompt: &str,
        worker_response: &str,
        issues: &[String],
    ) -> EnforcementResult {
        let Some(router) = self.router.clone() else {
            return self.enforce(missing_items);
        };

        self.current_attempt += 1;

        if self.current_attempt >= self.max_attempts {
            return EnforcementResult {
                should_enforce: false,
                message: String::new(),
                attempt: self.current_attempt,
                should_escalate: true,
            };
        }

        let list = |items: &[String]| {
            if items.is_empty() {
                "None listed".to_string()
            } else {
                items.iter().map(|i| format!("- {}", i)).collect::<Vec<_>>().join("\n")
            }
        };

        let step_head: String = step_prompt.chars().take(1000).collect();
        let response_chars: Vec<char> = worker_response.chars().collect();
        let response_tail: String = response_chars[response_chars.len().saturating_sub(500)..].iter().collect();

        let prompt = format!(
            "You supervise an AI coder. It has not finished its task.\n\n\
             STEP REQUIREMENTS:\n{}\n\n\
             NOT DONE:\n{}\n\n\
             ISSUES:\n{}\n\n\
             WORKER RESPONSE (tail):\n{}\n\n\
             ATTEMPT: {}/{}\n\n\
             Write a SHORT (1-2 sentences) message pushing the worker to finish. \
             Be specific. Do not repeat the whole task; name what is missing.",
            step_head,
            list(missing_items),
            list(issues),
            response_tail,
            self.current_attempt,
            self.max_attempts,
        );

        match router.generate(&prompt, 0.5, false).await {
            Ok(message) => {
                let mut message = message.trim().to_string();
                if message.chars().count() > MAX_MESSAGE_LEN {
                    message = format!("{}...", message.chars().take(MAX_MESSAGE_LEN).collect::<String>());
                }
                info!(attempt = self.current_attempt, "enforcement message generated");
                EnforcementResult {
                    should_enforce: true,
                    message,
                    attempt: self.current_attempt,
                    should_escalate: false,
                }
            }
            Err(_) => {
                // Undo the double count and fall back to a template
                self.current_attempt -= 1;
                self.enforce(missing_items)
            }
        }
    }
}
