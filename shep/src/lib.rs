//! Shepherd - supervision engine for interactive AI coding CLIs
//!
//! Shepherd drives opaque coding CLIs (droid, copilot, codex) to
//! completion on a task: it clarifies the task, launches the right
//! worker tier in a controlled session, watches its console output,
//! nudges it when it stalls, and closes the loop with a review pass or
//! escalates to a human.
//!
//! # Modules
//!
//! - [`worker`] - session adapters over tmux / native terminal windows
//! - [`filter`] - output sanitation and model-prose extraction
//! - [`watch`] - log watcher, context budget, recovery nudges, watchdog
//! - [`llm`] - provider clients and the rate-limited, circuit-broken router
//! - [`clarify`] - task clarification and complexity assessment
//! - [`supervise`] - single-shot analyzer/enforcer supervision
//! - [`review`] - the iterative execute/review loop
//! - [`state`] - persisted engine state and crash recovery
//! - [`vcs`] - the abstract VCS seam

pub mod clarify;
pub mod cli;
pub mod config;
pub mod error;
pub mod filter;
pub mod llm;
pub mod review;
pub mod state;
pub mod supervise;
pub mod vcs;
pub mod watch;
pub mod worker;

// Re-export commonly used types
pub use clarify::{Task, TaskClarifier, TaskComplexity};
pub use config::Config;
pub use error::{EngineError, Result};
pub use filter::{FilteredLog, LogFilter, sanitize, sanitize_bytes};
pub use llm::{GeminiClient, GlmClient, LlmClient, LlmRouter};
pub use review::{Finding, LoopDecision, ReviewLoopConfig, ReviewLoopManager, ReviewLoopResult, Severity};
pub use state::{EngineState, RecoveryManager, StatePersistence};
pub use supervise::{AnalysisAction, ResponseAnalyzer, Supervisor, SupervisorAction, TaskEnforcer};
pub use vcs::{GitVcs, Vcs};
pub use watch::{ConsoleRecovery, ContextManager, LogWatcher, WatchResult, Watchdog};
pub use worker::{Session, SessionConfig, TierPolicy, WorkerManager, WorkerStatus, WorkerTier};
