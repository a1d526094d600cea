//! Crash recovery
//!
//! Decides at startup whether a previous run can resume, stashes
//! uncommitted changes under a supervisor-namespaced label, and applies
//! the recovery stash on resume, aborting cleanly on conflicts.

use std::sync::Arc;
use tracing::{error, info, warn};

use super::persistence::{EngineState, IterationLog, StatePersistence};
use crate::error::EngineError;
use crate::vcs::Vcs;

/// Stash label prefix; only stashes carrying it are ever touched
pub const STASH_PREFIX: &str = "shepherd_recovery";

/// Startup recovery assessment
#[derive(Debug, Clone)]
pub struct RecoveryInfo {
    pub can_resume: bool,
    pub state: Option<EngineState>,
    pub has_stash: bool,
    pub stash_ref: Option<String>,
    pub has_uncommitted: bool,
    pub message: String,
}

/// Coordinates persisted state and the VCS stash across restarts
pub struct RecoveryManager {
    vcs: Arc<dyn Vcs>,
    persistence: StatePersistence,
}

impl RecoveryManager {
    pub fn new(vcs: Arc<dyn Vcs>, persistence: StatePersistence) -> Self {
        Self { vcs, persistence }
    }

    pub fn persistence(&mut self) -> &mut StatePersistence {
        &mut self.persistence
    }

    /// Assess whether the previous run should resume
    pub async fn check_recovery_needed(&mut self) -> RecoveryInfo {
        let Some(state) = self.persistence.load() else {
            return RecoveryInfo {
                can_resume: false,
                state: None,
                has_stash: false,
                stash_ref: None,
                has_uncommitted: false,
                message: "No previous run found".to_string(),
            };
        };

        if state.status == "COMPLETED" {
            return RecoveryInfo {
                can_resume: false,
                state: Some(state),
                has_stash: false,
                stash_ref: None,
                has_uncommitted: false,
                message: "Previous run completed successfully".to_string(),
            };
        }

        let has_uncommitted = self.vcs.has_changes().await.unwrap_or(false);
        let stash_ref = self.vcs.stash_find(STASH_PREFIX).await.unwrap_or(None);

        let mut message = format!(
            "Can resume from step {}, iteration {}",
            state.current_step, state.current_iteration
        );
        if has_uncommitted {
            message.push_str(" (has uncommitted changes)");
        }
        if let Some(stash) = &stash_ref {
            message.push_str(&format!(" (has stash: {})", stash));
        }

        RecoveryInfo {
            can_resume: true,
            has_stash: stash_ref.is_some(),
            stash_ref,
            has_uncommitted,
            state: Some(state),
            message,
        }
    }

    /// Prepare the working tree for resuming.
    ///
    /// Uncommitted changes are stashed under the recovery label; an
    /// existing recovery stash is applied (when requested). A conflict
    /// aborts cleanly with the stash left intact.
    pub async fn prepare_recovery(&mut self, apply_stash: bool) -> (bool, String) {
        let info = self.check_recovery_needed().await;

        if !info.can_resume {
            return (false, info.message);
        }

        if info.has_uncommitted
            && let Some(state) = &info.state
        {
            let label = format!(
                "{}_step_{}_iter_{}",
                STASH_PREFIX, state.current_step, state.current_iteration
            );
            match self.vcs.stash_push(&label).await {
                Ok(true) => {
                    let _ = self.persistence.update(|s| {
                        s.has_uncommitted_changes = false;
                        s.recovery_stash = Some(label.clone());
                    });
                }
                Ok(false) => warn!("stash push did nothing"),
                Err(e) => warn!(error = %e, "stash push failed"),
            }
        }

        if apply_stash
            && let Ok(Some(stash_ref)) = self.vcs.stash_find(STASH_PREFIX).await
        {
            return match self.pop_stash(&stash_ref).await {
                Ok(message) => {
                    let _ = self.persistence.update(|s| s.recovery_stash = None);
                    (true, message)
                }
                Err(e) => (false, e.to_string()),
            };
        }

        (true, "Ready to resume".to_string())
    }

    /// Apply a recovery stash and drop it on success. A dirty working
    /// tree is parked in a temp stash first and restored on failure.
    async fn pop_stash(&mut self, stash_ref: &str) -> crate::error::Result<String> {
        let mut temp_stash_created = false;

        if self.vcs.has_changes().await.unwrap_or(false) {
            warn!("working tree dirty before recovery, parking changes");
            temp_stash_created = self.vcs.stash_push("temp_before_recovery").await.unwrap_or(false);
            if !temp_stash_created {
                return Err(EngineError::VcsOther(
                    "failed to stash current changes before recovery".to_string(),
                ));
            }
        }

        match self.vcs.stash_apply(stash_ref).await {
            Ok(()) => {
                if let Err(e) = self.vcs.stash_drop(stash_ref).await {
                    warn!(stash = stash_ref, error = %e, "failed to drop applied stash");
                }
                Ok(format!("Successfully applied stash: {}", stash_ref))
            }
            Err(EngineError::VcsConflict(details)) => {
                // Abort: revert partial application, keep the stash
                error!(stash = stash_ref, "stash apply conflict, aborting");
                let _ = self.vcs.checkout_all().await;
                if temp_stash_created {
                    let _ = self.vcs.stash_pop().await;
                }
                Err(EngineError::VcsConflict(format!(
                    "Stash apply failed due to conflicts. Manual resolution required. Stash preserved: {} ({})",
                    stash_ref, details
                )))
            }
            Err(e) => {
                if temp_stash_created {
                    let _ = self.vcs.stash_pop().await;
                }
                Err(e)
            }
        }
    }

    /// Persist position before a worker operation that may crash us
    pub async fn save_for_recovery(&mut self, step_id: u32, iteration: u32) {
        let has_uncommitted = self.vcs.has_changes().await.unwrap_or(false);
        let result = self.persistence.update(|s| {
            s.current_step = step_id;
            s.current_iteration = iteration;
            s.has_uncommitted_changes = has_uncommitted;
        });
        if let Err(e) = result {
            warn!(error = %e, "failed to persist recovery point");
        }
    }

    /// Record a finished iteration
    pub fn mark_iteration_complete(
        &mut self,
        step_id: u32,
        iteration: u32,
        action: &str,
        has_changes: bool,
        confirmations: u32,
        commit_hash: Option<String>,
    ) {
        let entry = IterationLog {
            step_id,
            iteration,
            timestamp: chrono::Local::now().to_rfc3339(),
            action: action.to_string(),
            has_changes,
            confirmations,
            commit_hash,
            notes: String::new(),
        };
        if let Err(e) = self.persistence.log_iteration(entry) {
            warn!(error = %e, "failed to log iteration");
        }

        let result = self.persistence.update(|s| {
            s.current_step = step_id;
            s.current_iteration = iteration;
            s.confirmations = confirmations;
            s.has_uncommitted_changes = false;
        });
        if let Err(e) = result {
            warn!(error = %e, "failed to persist iteration completion");
        }
    }

    /// Advance to the next step
    pub fn mark_step_complete(&mut self, step_id: u32) {
        let result = self.persistence.update(|s| {
            s.current_step = step_id + 1;
            s.current_iteration = 0;
            s.confirmations = 0;
        });
        if let Err(e) = result {
            warn!(error = %e, "failed to persist step completion");
        }
    }

    pub fn mark_pipeline_complete(&mut self) {
        if let Err(e) = self.persistence.update(|s| s.status = "COMPLETED".to_string()) {
            warn!(error = %e, "failed to persist completion");
        }
        info!("pipeline marked complete");
    }

    pub fn mark_pipeline_failed(&mut self, reason: &str) {
        if let Err(e) = self.persistence.update(|s| s.status = "FAILED".to_string()) {
            warn!(error = %e, "failed to persist failure");
        }
        if !reason.is_empty() {
            let (step, iteration) = self
                .persistence
                .get_state()
                .map(|s| (s.current_step, s.current_iteration))
                .unwrap_or((0, 0));
            let _ = self.persistence.log_iteration(IterationLog {
                step_id: step,
                iteration,
                timestamp: chrono::Local::now().to_rfc3339(),
                action: "FAILED".to_string(),
                has_changes: false,
                confirmations: 0,
                commit_hash: None,
                notes: reason.to_string(),
            });
        }
    }

    /// Drop the recovery stash without applying it
    pub async fn discard_stash(&mut self) -> bool {
        match self.vcs.stash_find(STASH_PREFIX).await {
            Ok(Some(stash_ref)) => self.vcs.stash_drop(&stash_ref).await.is_ok(),
            _ => true,
        }
    }
}
