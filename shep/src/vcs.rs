//! Abstract VCS interface
//!
//! Git plumbing sits behind this trait so the engine never shells out
//! directly. Operations are best-effort; conflicts and auth failures
//! surface as typed errors, everything else as `VcsOther`.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Output;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{EngineError, Result};

/// Version control operations the engine relies on
#[async_trait]
pub trait Vcs: Send + Sync {
    /// Any uncommitted changes in the working tree
    async fn has_changes(&self) -> Result<bool>;

    /// `status --porcelain` output
    async fn status_short(&self) -> Result<String>;

    /// Stage everything and commit; returns the new HEAD sha, or None
    /// when there was nothing to commit
    async fn commit_all(&self, message: &str) -> Result<Option<String>>;

    /// Stash the working tree under a label
    async fn stash_push(&self, label: &str) -> Result<bool>;

    /// Find a stash ref whose message contains `label`
    async fn stash_find(&self, label: &str) -> Result<Option<String>>;

    /// Apply a stash by ref, keeping it on the stack
    async fn stash_apply(&self, stash_ref: &str) -> Result<()>;

    /// Drop a stash by ref
    async fn stash_drop(&self, stash_ref: &str) -> Result<()>;

    /// Pop the newest stash
    async fn stash_pop(&self) -> Result<()>;

    /// Discard unstaged changes in tracked files
    async fn checkout_all(&self) -> Result<()>;

    /// Current HEAD sha
    async fn head_sha(&self) -> Result<String>;
}

/// Git implementation shelling out to the `git` binary
pub struct GitVcs {
    repo_path: PathBuf,
}

impl GitVcs {
    pub fn new(repo_path: impl Into<PathBuf>) -> Self {
        Self {
            repo_path: repo_path.into(),
        }
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    async fn git(&self, args: &[&str]) -> Result<Output> {
        debug!(?args, "running git");
        Command::new("git")
            .args(args)
            .current_dir(&self.repo_path)
            .output()
            .await
            .map_err(|e| EngineError::VcsOther(format!("failed to run git: {}", e)))
    }

    fn classify_failure(output: &Output) -> EngineError {
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let combined = format!(
            "{}{}",
            stderr.to_lowercase(),
            String::from_utf8_lossy(&output.stdout).to_lowercase()
        );

        if combined.contains("conflict") {
            EngineError::VcsConflict(stderr)
        } else if combined.contains("authentication") || combined.contains("permission denied") {
            EngineError::VcsAuth(stderr)
        } else {
            EngineError::VcsOther(stderr)
        }
    }
}

#[async_trait]
impl Vcs for GitVcs {
    async fn has_changes(&self) -> Result<bool> {
        Ok(!self.status_short().await?.trim().is_empty())
    }

    async fn status_short(&self) -> Result<String> {
        let output = self.git(&["status", "--porcelain"]).await?;
        if !output.status.success() {
            return Err(Self::classify_failure(&output));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn commit_all(&self, message: &str) -> Result<Option<String>> {
        if !self.has_changes().await? {
            return Ok(None);
        }

        let add = self.git(&["add", "-A"]).await?;
        if !add.status.success() {
            return Err(Self::classify_failure(&add));
        }

        let commit = self.git(&["commit", "-m", message]).await?;
        if !commit.status.success() {
            return Err(Self::classify_failure(&commit));
        }

        Ok(Some(self.head_sha().await?))
    }

    async fn stash_push(&self, label: &str) -> Result<bool> {
        let output = self.git(&["stash", "push", "-m", label]).await?;
        if !output.status.success() {
            warn!(label, "stash push failed");
            return Ok(false);
        }
        Ok(true)
    }

    async fn stash_find(&self, label: &str) -> Result<Option<String>> {
        let output = self.git(&["stash", "list"]).await?;
        if !output.status.success() {
            return Err(Self::classify_failure(&output));
        }

        let listing = String::from_utf8_lossy(&output.stdout);
        for line in listing.lines() {
            if line.contains(label)
                && let Some(stash_ref) = line.split(':').next()
            {
                return Ok(Some(stash_ref.trim().to_string()));
            }
        }
        Ok(None)
    }

    async fn stash_apply(&self, stash_ref: &str) -> Result<()> {
        let output = self.git(&["stash", "apply", stash_ref]).await?;
        if !output.status.success() {
            return Err(Self::classify_failure(&output));
        }
        Ok(())
    }

    async fn stash_drop(&self, stash_ref: &str) -> Result<()> {
        let output = self.git(&["stash", "drop", stash_ref]).await?;
        if !output.status.success() {
            return Err(Self::classify_failure(&output));
        }
        Ok(())
    }

    async fn stash_pop(&self) -> Result<()> {
        let output = self.git(&["stash", "pop"]).await?;
        if !output.status.success() {
            return Err(Self::classify_failure(&output));
        }
        Ok(())
    }

    async fn checkout_all(&self) -> Result<()> {
        let output = self.git(&["checkout", "--", "."]).await?;
        if !output.status.success() {
            return Err(Self::classify_failure(&output));
        }
        Ok(())
    }

    async fn head_sha(&self) -> Result<String> {
        let output = self.git(&["rev-parse", "HEAD"]).await?;
        if !output.status.success() {
            return Err(Self::classify_failure(&output));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[cfg(test)]
pub mod fake {
    //! In-memory VCS for tests

    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeState {
        pub dirty: bool,
        pub stashes: Vec<String>,
        pub commits: Vec<String>,
        pub apply_conflicts: bool,
    }

    /// Scriptable in-memory VCS
    #[derive(Default)]
    pub struct FakeVcs {
        pub state: Mutex<FakeState>,
    }

    impl FakeVcs {
        pub fn dirty() -> Self {
            let fake = Self::default();
            fake.state.lock().unwrap().dirty = true;
            fake
        }

        pub fn set_dirty(&self, dirty: bool) {
            self.state.lock().unwrap().dirty = dirty;
        }
    }

    #[async_trait]
    impl Vcs for FakeVcs {
        async fn has_changes(&self) -> Result<bool> {
            Ok(self.state.lock().unwrap().dirty)
        }

        async fn status_short(&self) -> Result<String> {
            let state = self.state.lock().unwrap();
            Ok(if state.dirty { " M src/lib.rs\n".to_string() } else { String::new() })
        }

        async fn commit_all(&self, message: &str) -> Result<Option<String>> {
            let mut state = self.state.lock().unwrap();
            if !state.dirty {
                return Ok(None);
            }
            state.dirty = false;
            state.commits.push(message.to_string());
            Ok(Some(format!("sha{:04}", state.commits.len())))
        }

        async fn stash_push(&self, label: &str) -> Result<bool> {
            let mut state = self.state.lock().unwrap();
            if !state.dirty {
                return Ok(false);
            }
            state.dirty = false;
            state.stashes.push(label.to_string());
            Ok(true)
        }

        async fn stash_find(&self, label: &str) -> Result<Option<String>> {
            let state = self.state.lock().unwrap();
            Ok(state
                .stashes
                .iter()
                .position(|s| s.contains(label))
                .map(|i| format!("stash@{{{}}}", state.stashes.len() - 1 - i)))
        }

        async fn stash_apply(&self, _stash_ref: &str) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            if state.apply_conflicts {
                return Err(EngineError::VcsConflict("merge conflict in src/lib.rs".into()));
            }
            state.dirty = true;
            Ok(())
        }

        async fn stash_drop(&self, _stash_ref: &str) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            state.stashes.pop();
            Ok(())
        }

        async fn stash_pop(&self) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            if state.apply_conflicts {
                return Err(EngineError::VcsConflict("merge conflict in src/lib.rs".into()));
            }
            if state.stashes.pop().is_some() {
                state.dirty = true;
            }
            Ok(())
        }

        async fn checkout_all(&self) -> Result<()> {
            self.state.lock().unwrap().dirty = false;
            Ok(())
        }

        async fn head_sha(&self) -> Result<String> {
            Ok("deadbeef".to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeVcs;
    use super::*;

    #[tokio::test]
    async fn test_fake_commit_flow() {
        let vcs = FakeVcs::dirty();
        assert!(vcs.has_changes().await.unwrap());

        let sha = vcs.commit_all("checkpoint").await.unwrap();
        assert!(sha.is_some());
        assert!(!vcs.has_changes().await.unwrap());

        // Nothing left to commit
        assert!(vcs.commit_all("again").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fake_stash_roundtrip() {
        let vcs = FakeVcs::dirty();
        assert!(vcs.stash_push("shepherd_recovery_step_2").await.unwrap());
        assert!(!vcs.has_changes().await.unwrap());

        let stash_ref = vcs.stash_find("shepherd_recovery").await.unwrap().unwrap();
        vcs.stash_apply(&stash_ref).await.unwrap();
        assert!(vcs.has_changes().await.unwrap());
    }

    #[tokio::test]
    async fn test_fake_conflict() {
        let vcs = FakeVcs::dirty();
        vcs.stash_push("label").await.unwrap();
        vcs.state.lock().unwrap().apply_conflicts = true;

        let err = vcs.stash_apply("stash@{0}").await.unwrap_err();
        assert!(matches!(err, EngineError::VcsConflict(_)));
    }

    // Exercising GitVcs against a real repository
    #[tokio::test]
    async fn test_git_vcs_in_temp_repo() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path();

        let run = |args: Vec<&str>| {
            std::process::Command::new("git")
                .args(&args)
                .current_dir(path)
                .output()
                .expect("git available")
        };
        run(vec!["init", "-q"]);
        run(vec!["config", "user.email", "test@example.com"]);
        run(vec!["config", "user.name", "Test"]);
        std::fs::write(path.join("a.txt"), "one\n").unwrap();
        run(vec!["add", "-A"]);
        run(vec!["commit", "-q", "-m", "init"]);

        let vcs = GitVcs::new(path);
        assert!(!vcs.has_changes().await.unwrap());

        std::fs::write(path.join("a.txt"), "two\n").unwrap();
        assert!(vcs.has_changes().await.unwrap());

        let sha = vcs.commit_all("edit").await.unwrap().unwrap();
        assert_eq!(sha.len(), 40);
        assert_eq!(vcs.head_sha().await.unwrap(), sha);
    }

    #[tokio::test]
    async fn test_git_vcs_stash_in_temp_repo() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path();

        let run = |args: Vec<&str>| {
            std::process::Command::new("git")
                .args(&args)
                .current_dir(path)
                .output()
                .expect("git available")
        };
        run(vec!["init", "-q"]);
        run(vec!["config", "user.email", "test@example.com"]);
        run(vec!["config", "user.name", "Test"]);
        std::fs::write(path.join("a.txt"), "one\n").unwrap();
        run(vec!["add", "-A"]);
        run(vec!["commit", "-q", "-m", "init"]);

        let vcs = GitVcs::new(path);
        std::fs::write(path.join("a.txt"), "dirty\n").unwrap();

        assert!(vcs.stash_push("shepherd_recovery_step_1_iter_2").await.unwrap());
        assert!(!vcs.has_changes().await.unwrap());

        let stash_ref = vcs.stash_find("shepherd_recovery").await.unwrap().unwrap();
        vcs.stash_apply(&stash_ref).await.unwrap();
        assert!(vcs.has_changes().await.unwrap());
        vcs.stash_drop(&stash_ref).await.unwrap();
        assert!(vcs.stash_find("shepherd_recovery").await.unwrap().is_none());
    }
}
