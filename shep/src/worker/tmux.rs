//! Tmux backend for background worker sessions
//!
//! Thin wrappers over the tmux CLI plus the stale-session sweep that
//! runs once per process start.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::SESSION_NAMESPACE;
use crate::error::{EngineError, Result};

/// Spawn a detached tmux session running `command` in `cwd`
pub async fn spawn_session(session_id: &str, cwd: &Path, command: &str) -> Result<()> {
    let full = format!("cd {} && {}", shell_quote(&cwd.display().to_string()), command);

    let output = Command::new("tmux")
        .args(["new-session", "-d", "-s", session_id, "bash", "-c", &full])
        .output()
        .await
        .map_err(|e| EngineError::SessionSpawnFailed(e.to_string()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(EngineError::SessionSpawnFailed(stderr.to_string()));
    }

    debug!(session_id, "tmux session spawned");
    Ok(())
}

/// Send literal text followed by Enter to a session
pub async fn send_keys(session_id: &str, text: &str) -> Result<()> {
    // -l = literal mode, -- guards text starting with a dash
    let literal = Command::new("tmux")
        .args(["send-keys", "-t", session_id, "-l", "--", text])
        .output()
        .await
        .map_err(|e| EngineError::InputFailed(e.to_string()))?;

    if !literal.status.success() {
        return Err(EngineError::InputFailed(format!("send-keys to {} failed", session_id)));
    }

    let enter = Command::new("tmux")
        .args(["send-keys", "-t", session_id, "Enter"])
        .output()
        .await
        .map_err(|e| EngineError::InputFailed(e.to_string()))?;

    if !enter.status.success() {
        return Err(EngineError::InputFailed(format!("Enter to {} failed", session_id)));
    }

    Ok(())
}

/// Capture the session scrollback (last 1000 lines)
pub async fn capture_pane(session_id: &str) -> Result<Vec<u8>> {
    let output = Command::new("tmux")
        .args(["capture-pane", "-t", session_id, "-p", "-S", "-1000"])
        .output()
        .await
        .map_err(|e| EngineError::SessionDied(e.to_string()))?;

    if !output.status.success() {
        return Err(EngineError::SessionDied(format!("capture-pane on {} failed", session_id)));
    }

    Ok(output.stdout)
}

/// Check whether the session exists
pub async fn has_session(session_id: &str) -> bool {
    Command::new("tmux")
        .args(["has-session", "-t", session_id])
        .output()
        .await
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Kill the session. Already-dead sessions are fine.
pub async fn kill_session(session_id: &str) {
    let result = Command::new("tmux").args(["kill-session", "-t", session_id]).output().await;

    if let Err(e) = result {
        warn!(session_id, error = %e, "error killing tmux session");
    }
}

/// Attach the current terminal to the session (blocking)
pub fn attach(session_id: &str) -> std::io::Result<std::process::ExitStatus> {
    std::process::Command::new("tmux").args(["attach-session", "-t", session_id]).status()
}

/// Names of live sessions in the shepherd namespace
pub async fn list_shepherd_sessions() -> Vec<String> {
    let output = Command::new("tmux")
        .args(["list-sessions", "-F", "#{session_name}"])
        .output()
        .await;

    match output {
        Ok(out) if out.status.success() => String::from_utf8_lossy(&out.stdout)
            .lines()
            .filter(|name| name.starts_with(&format!("{}-", SESSION_NAMESPACE)))
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

/// Age threshold for the stale sweep
const MAX_AGE_SECS: u64 = 6 * 3600;
/// Idle threshold for the stale sweep (overridable)
const MIN_IDLE_SECS: u64 = 30 * 60;

/// Kill orphaned shepherd sessions left over from previous runs.
///
/// A session is stale when it carries the shepherd namespace prefix, has
/// no attached client, and is either older than six hours or idle past
/// the threshold. Returns the killed session names.
pub async fn cleanup_stale_sessions(min_idle_secs: Option<u64>) -> Vec<String> {
    let listing = Command::new("tmux")
        .args([
            "list-sessions",
            "-F",
            "#{session_name}\t#{session_attached}\t#{session_created}\t#{session_activity}",
        ])
        .output()
        .await;

    let listing = match listing {
        Ok(out) if out.status.success() => String::from_utf8_lossy(&out.stdout).to_string(),
        // tmux missing or no server running
        _ => return Vec::new(),
    };

    let now = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);

    let candidates = stale_candidates(&listing, now, MAX_AGE_SECS, min_idle_secs.unwrap_or(MIN_IDLE_SECS));

    let mut killed = Vec::new();
    for name in candidates {
        kill_session(&name).await;
        info!(session = %name, "killed stale tmux session");
        killed.push(name);
    }
    killed
}

/// Pure selection of stale sessions from a `list-sessions` dump
fn stale_candidates(listing: &str, now: u64, max_age: u64, min_idle: u64) -> Vec<String> {
    let mut stale = Vec::new();

    for line in listing.lines() {
        let parts: Vec<&str> = line.split('\t').collect();
        let Some(name) = parts.first() else { continue };
        if !name.starts_with(&format!("{}-", SESSION_NAMESPACE)) {
            continue;
        }

        let attached: u64 = parts.get(1).and_then(|s| s.parse().ok()).unwrap_or(0);
        let created: u64 = parts.get(2).and_then(|s| s.parse().ok()).unwrap_or(now);
        let activity: u64 = parts.get(3).and_then(|s| s.parse().ok()).unwrap_or(created);

        if attached > 0 {
            continue;
        }

        let age = now.saturating_sub(created);
        let idle = now.saturating_sub(activity);
        if age < max_age && idle < min_idle {
            continue;
        }

        stale.push(name.to_string());
    }

    stale
}

fn shell_quote(s: &str) -> String {
    if s.chars().all(|c| c.is_ascii_alphanumeric() || "/._-".contains(c)) {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: u64 = 3600;

    fn listing_line(name: &str, attached: u64, created: u64, activity: u64) -> String {
        format!("{}\t{}\t{}\t{}", name, attached, created, activity)
    }

    #[test]
    fn test_stale_old_unattached_session() {
        let now = 100 * HOUR;
        let listing = listing_line("shepherd-copilot-ab12cd34", 0, now - 7 * HOUR, now - 7 * HOUR);
        let stale = stale_candidates(&listing, now, 6 * HOUR, 30 * 60);
        assert_eq!(stale, vec!["shepherd-copilot-ab12cd34"]);
    }

    #[test]
    fn test_stale_idle_session() {
        let now = 100 * HOUR;
        // Recent but idle past the threshold
        let listing = listing_line("shepherd-codex-00ff00ff", 0, now - HOUR, now - 45 * 60);
        let stale = stale_candidates(&listing, now, 6 * HOUR, 30 * 60);
        assert_eq!(stale.len(), 1);
    }

    #[test]
    fn test_attached_session_spared() {
        let now = 100 * HOUR;
        let listing = listing_line("shepherd-copilot-ab12cd34", 1, now - 10 * HOUR, now - 10 * HOUR);
        assert!(stale_candidates(&listing, now, 6 * HOUR, 30 * 60).is_empty());
    }

    #[test]
    fn test_foreign_session_spared() {
        let now = 100 * HOUR;
        let listing = listing_line("main", 0, now - 100 * HOUR, now - 100 * HOUR);
        assert!(stale_candidates(&listing, now, 6 * HOUR, 30 * 60).is_empty());
    }

    #[test]
    fn test_fresh_active_session_spared() {
        let now = 100 * HOUR;
        let listing = listing_line("shepherd-droid-12345678", 0, now - HOUR, now - 60);
        assert!(stale_candidates(&listing, now, 6 * HOUR, 30 * 60).is_empty());
    }

    #[test]
    fn test_unparseable_fields_spared() {
        let now = 100 * HOUR;
        let listing = "shepherd-droid-12345678\tgarbage\tgarbage\tgarbage";
        // Unparseable attached defaults to 0, created defaults to now: fresh
        assert!(stale_candidates(listing, now, 6 * HOUR, 30 * 60).is_empty());
    }

    #[test]
    fn test_multiple_sessions_mixed() {
        let now = 100 * HOUR;
        let listing = [
            listing_line("shepherd-copilot-11111111", 0, now - 8 * HOUR, now - 8 * HOUR),
            listing_line("shepherd-copilot-22222222", 0, now - 60, now - 30),
            listing_line("work", 0, now - 20 * HOUR, now - 20 * HOUR),
        ]
        .join("\n");
        let stale = stale_candidates(&listing, now, 6 * HOUR, 30 * 60);
        assert_eq!(stale, vec!["shepherd-copilot-11111111"]);
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/home/user/project"), "/home/user/project");
        assert_eq!(shell_quote("/home/my project"), "'/home/my project'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
