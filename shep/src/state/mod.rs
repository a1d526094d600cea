//! Engine state persistence and crash recovery

pub mod persistence;
pub mod recovery;

pub use persistence::{EngineState, IterationLog, StatePersistence};
pub use recovery::{RecoveryInfo, RecoveryManager};
