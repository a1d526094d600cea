//! Worker manager: tier selection and session lifecycle
//!
//! Holds at most one live session at a time. Process-wide cleanup (the
//! stale-session sweep and the one-time copilot state wipe) runs through
//! an explicit idempotent initializer invoked from the CLI surface.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell};
use tracing::{info, warn};

use super::session::Session;
use super::{SessionConfig, TierPolicy, WorkerStatus, WorkerTier, tmux};
use crate::error::Result;
use crate::watch::log_watcher::LogWatcher;

static PROCESS_INIT: OnceCell<()> = OnceCell::const_new();

/// Run the once-per-process initializers: sweep orphaned multiplexer
/// sessions in the shepherd namespace and wipe stale copilot CLI state.
/// Safe to call repeatedly; only the first call does work.
pub async fn process_start_init(idle_session_timeout: Duration) {
    PROCESS_INIT
        .get_or_init(|| async move {
            let killed = tmux::cleanup_stale_sessions(Some(idle_session_timeout.as_secs())).await;
            if !killed.is_empty() {
                info!(count = killed.len(), "cleaned up stale shepherd sessions");
            }
            wipe_copilot_state().await;
        })
        .await;
}

/// Clear copilot's session-state and command history so every run starts
/// from a clean slate.
async fn wipe_copilot_state() {
    let Some(home) = dirs::home_dir() else { return };
    let copilot_dir = home.join(".copilot");
    if !copilot_dir.exists() {
        return;
    }

    let session_state = copilot_dir.join("session-state");
    if session_state.exists() {
        match tokio::fs::remove_dir_all(&session_state).await {
            Ok(()) => {
                let _ = tokio::fs::create_dir(&session_state).await;
                info!("cleared copilot session-state");
            }
            Err(e) => warn!(error = %e, "failed to clear copilot session-state"),
        }
    }

    let history_file = copilot_dir.join("command-history-state.json");
    if history_file.exists()
        && let Err(e) = tokio::fs::write(&history_file, "{}").await
    {
        warn!(error = %e, "failed to clear copilot command history");
    }
}

/// Status snapshot for the CLI surface
#[derive(Debug, Clone)]
pub struct ManagerStatus {
    pub status: WorkerStatus,
    pub worker: Option<String>,
    pub task: Option<String>,
    pub elapsed: Duration,
    pub session_id: Option<String>,
}

/// Manages the single live worker session
pub struct WorkerManager {
    policy: TierPolicy,
    config: SessionConfig,
    watcher: Option<Arc<Mutex<LogWatcher>>>,
    current: Option<Session>,
}

impl WorkerManager {
    pub fn new(config: SessionConfig, watcher: Option<Arc<Mutex<LogWatcher>>>) -> Self {
        Self {
            policy: TierPolicy::default(),
            config,
            watcher,
            current: None,
        }
    }

    /// Replace the default tier policy
    pub fn with_policy(mut self, policy: TierPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn is_running(&self) -> bool {
        self.current.as_ref().is_some_and(|s| s.status() == WorkerStatus::Running)
    }

    pub fn current_session(&self) -> Option<&Session> {
        self.current.as_ref()
    }

    /// Start a task on the given tier, stopping any previous session first
    pub async fn start_task(&mut self, task: &str, tier: WorkerTier, context: Option<&str>) -> Result<()> {
        if let Some(mut old) = self.current.take() {
            old.stop().await;
        }

        let spec = self.policy.spec(tier).clone();
        let mut session = Session::new(tier, spec, self.config.clone());
        session.start(task, context).await?;

        info!(tier = %tier, session_id = session.id(), "task started");
        self.current = Some(session);
        Ok(())
    }

    /// Deliver a message to the live session (answering a CLI question)
    pub async fn send_message(&self, message: &str) -> Result<()> {
        match &self.current {
            Some(session) => session.send_input(message).await,
            None => Ok(()),
        }
    }

    /// Current sanitized scrollback, or empty without a session
    pub async fn get_output(&self) -> String {
        match &self.current {
            Some(session) => session.capture_output().await,
            None => String::new(),
        }
    }

    /// Wait for the live session to finish. `(success, scrollback)`.
    pub async fn wait_for_completion(&mut self, timeout: Duration) -> (bool, String) {
        let Some(session) = self.current.as_mut() else {
            return (false, String::new());
        };
        session.wait_for_completion(timeout, self.watcher.as_deref()).await
    }

    /// Stop and drop the live session. Idempotent.
    pub async fn stop(&mut self) {
        if let Some(mut session) = self.current.take() {
            session.stop().await;
        }
    }

    pub fn get_status(&self) -> ManagerStatus {
        match &self.current {
            Some(session) => ManagerStatus {
                status: session.status(),
                worker: Some(session.tier().to_string()),
                task: session.current_task().map(str::to_string),
                elapsed: session.elapsed(),
                session_id: Some(session.id().to_string()),
            },
            None => ManagerStatus {
                status: WorkerStatus::Idle,
                worker: None,
                task: None,
                elapsed: Duration::ZERO,
                session_id: None,
            },
        }
    }

    /// Attach the controlling terminal to the live session
    pub fn attach_terminal(&self) -> Result<()> {
        if let Some(session) = &self.current {
            session
                .attach()
                .map_err(|e| crate::error::EngineError::SessionDied(e.to_string()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_idle_manager_status() {
        let manager = WorkerManager::new(SessionConfig::default(), None);
        let status = manager.get_status();
        assert_eq!(status.status, WorkerStatus::Idle);
        assert!(status.worker.is_none());
        assert!(status.session_id.is_none());
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn test_idle_manager_output_empty() {
        let manager = WorkerManager::new(SessionConfig::default(), None);
        assert_eq!(manager.get_output().await, "");
    }

    #[tokio::test]
    async fn test_idle_wait_returns_immediately() {
        let mut manager = WorkerManager::new(SessionConfig::default(), None);
        let (success, output) = manager.wait_for_completion(Duration::from_secs(1)).await;
        assert!(!success);
        assert!(output.is_empty());
    }

    #[tokio::test]
    async fn test_send_message_without_session_is_noop() {
        let manager = WorkerManager::new(SessionConfig::default(), None);
        assert!(manager.send_message("hello").await.is_ok());
    }

    #[tokio::test]
    async fn test_stop_idempotent() {
        let mut manager = WorkerManager::new(SessionConfig::default(), None);
        manager.stop().await;
        manager.stop().await;
        assert!(manager.current_session().is_none());
    }
}
