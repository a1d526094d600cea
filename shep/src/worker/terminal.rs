//! Native terminal backend for visible worker sessions
//!
//! The CLI runs inside a newly opened OS terminal window with its TTY
//! recorded by `script(1)`; scrollback is the typescript log. Input is
//! injected through OS automation aimed at the stored window id, never
//! at "front window", so unrelated user windows are never touched.

use std::path::PathBuf;
use tokio::process::Command;
use tracing::{info, warn};

use super::SESSION_NAMESPACE;
use crate::error::{EngineError, Result};

/// One visible terminal window owned by a session
pub struct NativeTerminal {
    session_id: String,
    project_path: PathBuf,
    window_id: Option<String>,
    log_file: PathBuf,
    task_file: PathBuf,
    script_file: PathBuf,
}

impl NativeTerminal {
    pub fn new(session_id: &str, project_path: PathBuf) -> Self {
        let tmp = std::env::temp_dir();
        Self {
            log_file: tmp.join(format!("{}.log", session_id)),
            task_file: tmp.join(format!("{}-task-{}.txt", SESSION_NAMESPACE, session_id)),
            script_file: tmp.join(format!("{}-run-{}.sh", SESSION_NAMESPACE, session_id)),
            session_id: session_id.to_string(),
            project_path,
            window_id: None,
        }
    }

    pub fn log_file(&self) -> &PathBuf {
        &self.log_file
    }

    pub fn window_id(&self) -> Option<&str> {
        self.window_id.as_deref()
    }

    /// Write the task and runner script, then open the terminal window
    pub async fn open(&mut self, command_line: &str, task: &str) -> Result<()> {
        tokio::fs::write(&self.task_file, task)
            .await
            .map_err(|e| EngineError::SessionSpawnFailed(format!("task file: {}", e)))?;

        let cmd_with_task = format!(r#"{} "$(cat {})""#, command_line, self.task_file.display());
        let script_content = format!(
            "#!/bin/bash\ncd {}\nscript -q {} {}\n",
            self.project_path.display(),
            self.log_file.display(),
            cmd_with_task
        );
        tokio::fs::write(&self.script_file, script_content)
            .await
            .map_err(|e| EngineError::SessionSpawnFailed(format!("runner script: {}", e)))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&self.script_file, std::fs::Permissions::from_mode(0o755))
                .await
                .map_err(|e| EngineError::SessionSpawnFailed(format!("chmod: {}", e)))?;
        }

        if cfg!(target_os = "macos") {
            self.open_macos().await
        } else {
            self.open_linux().await
        }
    }

    async fn open_macos(&mut self) -> Result<()> {
        let applescript = format!(
            r#"
            tell application "Terminal"
                do script "{}"
                delay 0.3
                set windowId to id of front window
                tell front window
                    set zoomed to false
                    set bounds to {{100, 100, 1000, 700}}
                end tell
                return windowId
            end tell
            "#,
            self.script_file.display()
        );

        let output = Command::new("osascript")
            .args(["-e", &applescript])
            .output()
            .await
            .map_err(|e| EngineError::SessionSpawnFailed(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EngineError::SessionSpawnFailed(format!("osascript: {}", stderr)));
        }

        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if !id.is_empty() {
            info!(session_id = %self.session_id, window_id = %id, "native terminal opened");
            self.window_id = Some(id);
        } else {
            warn!(session_id = %self.session_id, "native terminal opened without a window id");
        }

        Ok(())
    }

    async fn open_linux(&mut self) -> Result<()> {
        let script = self.script_file.display().to_string();
        let attempts: [(&str, Vec<String>); 3] = [
            ("gnome-terminal", vec!["--".into(), "bash".into(), script.clone()]),
            ("xterm", vec!["-e".into(), format!("bash {}", script)]),
            ("konsole", vec!["-e".into(), format!("bash {}", script)]),
        ];

        for (program, args) in attempts {
            match Command::new(program).args(&args).spawn() {
                Ok(child) => {
                    // The window stands in for an id on Linux; track the
                    // launcher pid so liveness and close stay targeted.
                    let pid = child.id().map(|p| p.to_string());
                    info!(session_id = %self.session_id, terminal = program, pid = ?pid, "native terminal opened");
                    self.window_id = pid;
                    return Ok(());
                }
                Err(_) => continue,
            }
        }

        Err(EngineError::SessionSpawnFailed("no terminal emulator found".to_string()))
    }

    /// Read the typescript log. Missing or unreadable logs yield empty.
    pub async fn read_log(&self) -> Vec<u8> {
        tokio::fs::read(&self.log_file).await.unwrap_or_default()
    }

    /// True iff the recording process behind this session still runs.
    /// Without a stored window id the session counts as dead.
    pub async fn is_alive(&self) -> bool {
        if self.window_id.is_none() {
            return false;
        }

        Command::new("pgrep")
            .args(["-f", &self.session_id])
            .output()
            .await
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    /// Deliver text + Enter through OS automation, targeting the stored
    /// window id only.
    pub async fn send_text(&self, text: &str) -> Result<()> {
        let Some(window_id) = &self.window_id else {
            return Err(EngineError::InputFailed("no window id stored for visible session".to_string()));
        };

        if !cfg!(target_os = "macos") {
            return Err(EngineError::InputFailed("visible-mode input requires macOS automation".to_string()));
        }

        let payload = serde_json::to_string(text).unwrap_or_else(|_| "\"\"".to_string());
        let applescript = format!(
            r#"
            tell application "Terminal"
                activate
                try
                    set front window to (first window whose id is {window_id})
                end try
            end tell
            tell application "System Events"
                if {payload} is not "" then
                    keystroke {payload}
                end if
                key code 36
            end tell
            "#
        );

        let output = Command::new("osascript")
            .args(["-e", &applescript])
            .output()
            .await
            .map_err(|e| EngineError::InputFailed(e.to_string()))?;

        if !output.status.success() {
            return Err(EngineError::InputFailed(
                String::from_utf8_lossy(&output.stderr).to_string(),
            ));
        }
        Ok(())
    }

    /// Kill the recorder, close the window by id, unlink temp files
    pub async fn close(&mut self) {
        // Kill the script(1) recorder first so the log is flushed
        if let Ok(found) = Command::new("pgrep").args(["-f", &self.session_id]).output().await
            && found.status.success()
        {
            for pid in String::from_utf8_lossy(&found.stdout).split_whitespace() {
                if pid.chars().all(|c| c.is_ascii_digit()) {
                    let _ = Command::new("kill").args(["-9", pid]).output().await;
                }
            }
        }

        tokio::time::sleep(std::time::Duration::from_millis(300)).await;

        match &self.window_id {
            Some(id) if cfg!(target_os = "macos") => {
                let applescript = format!(
                    r#"
                    tell application "Terminal"
                        try
                            close (first window whose id is {id}) saving no
                        end try
                    end tell
                    "#
                );
                let result = Command::new("osascript").args(["-e", &applescript]).output().await;
                match result {
                    Ok(_) => info!(window_id = %id, "closed terminal window"),
                    Err(e) => warn!(window_id = %id, error = %e, "failed to close terminal window"),
                }
            }
            Some(_) => {}
            None => {
                warn!(session_id = %self.session_id, "no window id stored, cannot close terminal safely");
            }
        }

        for path in [&self.task_file, &self.script_file, &self.log_file] {
            let _ = tokio::fs::remove_file(path).await;
        }
        self.window_id = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temp_file_naming() {
        let terminal = NativeTerminal::new("shepherd-copilot-ab12cd34", PathBuf::from("/work"));
        let task = terminal.task_file.file_name().unwrap().to_string_lossy().to_string();
        let script = terminal.script_file.file_name().unwrap().to_string_lossy().to_string();
        let log = terminal.log_file.file_name().unwrap().to_string_lossy().to_string();

        assert_eq!(task, "shepherd-task-shepherd-copilot-ab12cd34.txt");
        assert_eq!(script, "shepherd-run-shepherd-copilot-ab12cd34.sh");
        assert_eq!(log, "shepherd-copilot-ab12cd34.log");
    }

    #[tokio::test]
    async fn test_dead_without_window_id() {
        let terminal = NativeTerminal::new("shepherd-droid-00000000", PathBuf::from("/work"));
        assert!(!terminal.is_alive().await);
    }

    #[tokio::test]
    async fn test_send_text_requires_window_id() {
        let terminal = NativeTerminal::new("shepherd-droid-00000000", PathBuf::from("/work"));
        let err = terminal.send_text("hello").await.unwrap_err();
        assert!(matches!(err, EngineError::InputFailed(_)));
    }

    #[tokio::test]
    async fn test_read_log_missing_is_empty() {
        let terminal = NativeTerminal::new("shepherd-droid-11111111", PathBuf::from("/work"));
        assert!(terminal.read_log().await.is_empty());
    }
}
