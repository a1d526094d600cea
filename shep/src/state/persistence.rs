//! Engine state persistence
//!
//! The state file is written atomically: serialize to a temp file,
//! fsync, rotate the old file into a bounded backup ring, rename into
//! place. An exclusive file lock guards against concurrent supervisor
//! instances. A partially written temp file is never read back.

use chrono::Local;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::{EngineError, Result};

const STATE_FILE: &str = "pipeline_state.json";
const BACKUP_DIR: &str = "state_backups";
const LOCK_FILE: &str = ".state.lock";
const MAX_BACKUPS: usize = 10;

/// One iteration log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationLog {
    pub step_id: u32,
    pub iteration: u32,
    pub timestamp: String,
    pub action: String,
    pub has_changes: bool,
    pub confirmations: u32,
    #[serde(default)]
    pub commit_hash: Option<String>,
    #[serde(default)]
    pub notes: String,
}

/// Persisted engine state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineState {
    pub run_id: String,
    pub project_path: String,
    pub started_at: String,

    pub current_step: u32,
    pub current_iteration: u32,
    pub confirmations: u32,
    pub status: String,

    /// Acceptance criteria echoed for resumed runs
    #[serde(default)]
    pub criteria_echo: Vec<String>,

    #[serde(default)]
    pub iterations: Vec<IterationLog>,
    #[serde(default)]
    pub commits: Vec<String>,

    #[serde(default)]
    pub has_uncommitted_changes: bool,
    #[serde(default)]
    pub recovery_stash: Option<String>,

    #[serde(default)]
    pub updated_at: String,
}

impl EngineState {
    fn new(project_path: &str, criteria: Vec<String>) -> Self {
        let now = Local::now();
        Self {
            run_id: now.format("%Y%m%d_%H%M%S").to_string(),
            project_path: project_path.to_string(),
            started_at: now.to_rfc3339(),
            current_step: 1,
            current_iteration: 0,
            confirmations: 0,
            status: "RUNNING".to_string(),
            criteria_echo: criteria,
            iterations: Vec::new(),
            commits: Vec::new(),
            has_uncommitted_changes: false,
            recovery_stash: None,
            updated_at: now.to_rfc3339(),
        }
    }
}

/// Manages the on-disk engine state
pub struct StatePersistence {
    state_dir: PathBuf,
    state: Option<EngineState>,
}

impl StatePersistence {
    pub fn new(state_dir: impl Into<PathBuf>) -> Result<Self> {
        let state_dir = state_dir.into();
        fs::create_dir_all(state_dir.join(BACKUP_DIR))
            .map_err(|e| EngineError::ConfigInvalid(format!("cannot create state dir: {}", e)))?;

        Ok(Self { state_dir, state: None })
    }

    pub fn state_file(&self) -> PathBuf {
        self.state_dir.join(STATE_FILE)
    }

    fn backup_dir(&self) -> PathBuf {
        self.state_dir.join(BACKUP_DIR)
    }

    pub fn get_state(&self) -> Option<&EngineState> {
        self.state.as_ref()
    }

    /// Start a fresh run and persist it
    pub fn create_new_run(&mut self, project_path: &str, criteria: Vec<String>) -> &EngineState {
        self.state = Some(EngineState::new(project_path, criteria));
        if let Err(e) = self.save() {
            warn!(error = %e, "failed to persist fresh state");
        }
        self.state.as_ref().unwrap()
    }

    /// Load persisted state, falling back to the newest backup when the
    /// main file is corrupt. A leftover `.tmp` file is ignored.
    pub fn load(&mut self) -> Option<EngineState> {
        let path = self.state_file();
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(&path).ok().and_then(|text| serde_json::from_str(&text).ok()) {
            Some(state) => {
                self.state = Some(state);
                self.state.clone()
            }
            None => {
                warn!("failed to load state file, trying backup");
                self.load_from_backup()
            }
        }
    }

    fn load_from_backup(&mut self) -> Option<EngineState> {
        let mut backups = self.list_backups();
        backups.sort();

        let newest = backups.last()?;
        match fs::read_to_string(newest).ok().and_then(|text| serde_json::from_str(&text).ok()) {
            Some(state) => {
                info!(backup = %newest.display(), "loaded state from backup");
                self.state = Some(state);
                self.state.clone()
            }
            None => {
                warn!("failed to load state from backup");
                None
            }
        }
    }

    fn list_backups(&self) -> Vec<PathBuf> {
        fs::read_dir(self.backup_dir())
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .map(|e| e.path())
                    .filter(|p| {
                        p.file_name()
                            .and_then(|n| n.to_str())
                            .is_some_and(|n| n.starts_with("state_") && n.ends_with(".json"))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Persist the current state atomically under the file lock.
    ///
    /// I/O failures leave the in-memory state intact; callers log and
    /// continue.
    pub fn save(&mut self) -> Result<()> {
        let Some(state) = self.state.as_mut() else {
            return Ok(());
        };
        state.updated_at = Local::now().to_rfc3339();
        let serialized = serde_json::to_string_pretty(state).map_err(|e| EngineError::JsonParseFailed {
            message: e.to_string(),
            raw: String::new(),
        })?;

        let lock_file = File::create(self.state_dir.join(LOCK_FILE))
            .map_err(|e| EngineError::ConfigInvalid(format!("cannot create lock file: {}", e)))?;
        lock_file
            .lock_exclusive()
            .map_err(|e| EngineError::ConfigInvalid(format!("cannot acquire state lock: {}", e)))?;

        let result = self.write_locked(&serialized);

        let _ = fs2::FileExt::unlock(&lock_file);
        result
    }

    fn write_locked(&self, serialized: &str) -> Result<()> {
        let state_file = self.state_file();
        let tmp_file = self.state_dir.join(format!("{}.tmp", STATE_FILE));

        let io_err = |e: std::io::Error| EngineError::ConfigInvalid(format!("state write failed: {}", e));

        let mut file = File::create(&tmp_file).map_err(io_err)?;
        file.write_all(serialized.as_bytes()).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        drop(file);

        // Rotate the current file into the backup ring before replacing
        if state_file.exists() {
            self.create_backup(&state_file);
        }

        fs::rename(&tmp_file, &state_file).map_err(|e| {
            let _ = fs::remove_file(&tmp_file);
            io_err(e)
        })?;

        Ok(())
    }

    fn create_backup(&self, state_file: &Path) {
        let timestamp = Local::now().format("%Y%m%d_%H%M%S");
        let backup_file = self.backup_dir().join(format!("state_{}.json", timestamp));

        if let Err(e) = fs::copy(state_file, &backup_file) {
            warn!(error = %e, "failed to create state backup");
            return;
        }

        let mut backups = self.list_backups();
        backups.sort();
        let excess = backups.len().saturating_sub(MAX_BACKUPS);
        for old in backups.into_iter().take(excess) {
            let _ = fs::remove_file(old);
        }
    }

    /// Mutate the state in place and persist
    pub fn update<F: FnOnce(&mut EngineState)>(&mut self, mutate: F) -> Result<()> {
        let Some(state) = self.state.as_mut() else {
            return Err(EngineError::ConfigInvalid("no state loaded".to_string()));
        };
        mutate(state);
        self.save()
    }

    /// Append an iteration record, tracking any commit it produced
    pub fn log_iteration(&mut self, entry: IterationLog) -> Result<()> {
        let commit = entry.commit_hash.clone();
        self.update(|state| {
            state.iterations.push(entry);
            if let Some(hash) = commit {
                state.commits.push(hash);
            }
        })
    }

    /// Whether a run is active on disk
    pub fn has_active_run(&mut self) -> bool {
        self.load().is_some_and(|s| s.status == "RUNNING")
    }

    /// Archive and remove the current state
    pub fn clear(&mut self) {
        let state_file = self.state_file();
        if state_file.exists() {
            self.create_backup(&state_file);
            let _ = fs::remove_file(&state_file);
        }
        self.state = None;
    }
}
