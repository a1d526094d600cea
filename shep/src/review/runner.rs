//! Worker invocation seam for the review loop
//!
//! The loop controller talks to workers through [`WorkerRunner`];
//! [`ManagedRunner`] is the production implementation that spins up a
//! fresh session per invocation and inspects the working tree through
//! the VCS seam.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::Result;
use crate::vcs::Vcs;
use crate::watch::log_watcher::LogWatcher;
use crate::worker::{SessionConfig, WorkerManager, WorkerTier};

/// One worker invocation: run a task on a tier, report (success, output)
#[async_trait]
pub trait WorkerRunner: Send + Sync {
    async fn run_worker(&self, tier: WorkerTier, task: &str, timeout: Duration) -> Result<(bool, String)>;

    /// Any uncommitted changes in the project working tree
    async fn has_vcs_changes(&self) -> bool;
}

/// Production runner: a fresh session per invocation, torn down after
pub struct ManagedRunner {
    session_config: SessionConfig,
    watcher: Option<Arc<Mutex<LogWatcher>>>,
    vcs: Arc<dyn Vcs>,
}

impl ManagedRunner {
    pub fn new(session_config: SessionConfig, watcher: Option<Arc<Mutex<LogWatcher>>>, vcs: Arc<dyn Vcs>) -> Self {
        Self {
            session_config,
            watcher,
            vcs,
        }
    }
}

#[async_trait]
impl WorkerRunner for ManagedRunner {
    async fn run_worker(&self, tier: WorkerTier, task: &str, timeout: Duration) -> Result<(bool, String)> {
        let mut manager = WorkerManager::new(self.session_config.clone(), self.watcher.clone());

        manager.start_task(task, tier, None).await?;
        let (success, output) = manager.wait_for_completion(timeout).await;
        manager.stop().await;

        Ok((success, output))
    }

    async fn has_vcs_changes(&self) -> bool {
        match self.vcs.has_changes().await {
            Ok(dirty) => dirty,
            Err(e) => {
                warn!(error = %e, "failed to check working tree");
                false
            }
        }
    }
}
