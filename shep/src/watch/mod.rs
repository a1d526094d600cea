//! Log observation: classification, context budgeting, recovery nudges,
//! and the session health watchdog.

pub mod context;
pub mod log_watcher;
pub mod recovery;
pub mod watchdog;

pub use context::{Checkpoint, ContextBudget, ContextManager};
pub use log_watcher::{LogWatcher, WatchResult, WatcherAnalysis};
pub use recovery::{ConsoleRecovery, ConsoleRecoveryConfig, NudgeTarget};
pub use watchdog::{HealthCheck, HealthStatus, WatchSource, Watchdog, WatchdogAction};
