//! One controlled spawn of an external worker CLI
//!
//! A session owns its scrollback, temp files, and (in visible mode) a
//! terminal window; destruction releases all three. Exactly one session
//! per instance.

use regex::Regex;
use std::collections::VecDeque;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::LazyLock;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::terminal::NativeTerminal;
use super::{SessionConfig, WorkerSpec, WorkerStatus, WorkerTier, WorkerUsage, new_session_id, tmux};
use crate::error::{EngineError, Result};
use crate::filter::sanitize_bytes;
use crate::watch::log_watcher::{LogWatcher, WatchResult};

/// Fixed completion-oracle poll interval
const POLL_INTERVAL: Duration = Duration::from_secs(30);
/// Input injection deadline
const INPUT_TIMEOUT: Duration = Duration::from_secs(5);
/// Scrollback tail inspected for completion markers
const MARKER_WINDOW: usize = 2000;
/// Scrollback tail inspected for progress signs
const PROGRESS_WINDOW: usize = 3000;
/// Identical tail hashes before the stuck detector fires
const STUCK_TICKS: usize = 3;

static PROGRESS_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"Updated:.*total.*completed",
        r"Created|Writing|Editing|Adding",
        r"✓|completed|success",
        r"\.tsx|\.ts|\.html|\.js|\.py",
    ]
    .iter()
    .map(|p| Regex::new(&format!("(?i){}", p)).unwrap())
    .collect()
});

enum Backend {
    Tmux,
    Native(NativeTerminal),
}

/// A live worker session
pub struct Session {
    id: String,
    tier: WorkerTier,
    spec: WorkerSpec,
    config: SessionConfig,
    backend: Backend,
    status: WorkerStatus,
    started_at: Option<Instant>,
    current_task: Option<String>,
    last_output: String,
    usage: Option<WorkerUsage>,
    restart_context: Option<String>,
}

impl Session {
    pub fn new(tier: WorkerTier, spec: WorkerSpec, config: SessionConfig) -> Self {
        let id = new_session_id(spec.name);
        let backend = if config.visible {
            Backend::Native(NativeTerminal::new(&id, config.project_path.clone()))
        } else {
            Backend::Tmux
        };

        Self {
            id,
            tier,
            spec,
            config,
            backend,
            status: WorkerStatus::Idle,
            started_at: None,
            current_task: None,
            last_output: String::new(),
            usage: None,
            restart_context: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tier(&self) -> WorkerTier {
        self.tier
    }

    pub fn status(&self) -> WorkerStatus {
        self.status
    }

    pub fn current_task(&self) -> Option<&str> {
        self.current_task.as_deref()
    }

    pub fn usage(&self) -> Option<&WorkerUsage> {
        self.usage.as_ref()
    }

    /// Handover context captured when the watcher asked for a restart
    pub fn restart_context(&self) -> Option<&str> {
        self.restart_context.as_deref()
    }

    /// A detached probe over the multiplexer backend, usable while the
    /// session itself is mutably borrowed. Visible sessions have none.
    pub fn probe(&self) -> Option<SessionProbe> {
        match self.backend {
            Backend::Tmux => Some(SessionProbe {
                session_id: self.id.clone(),
            }),
            Backend::Native(_) => None,
        }
    }

    /// Effective poll interval for monitor loops outside the oracle
    pub fn effective_interval(&self) -> Duration {
        self.config.check_interval.mul_f64(self.spec.interval_multiplier)
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.map(|t| t.elapsed()).unwrap_or_default()
    }

    /// Spawn the CLI and inject the task as the first input line.
    ///
    /// After a successful return the session is alive; otherwise the
    /// spawn failed and nothing is left behind.
    pub async fn start(&mut self, task: &str, context: Option<&str>) -> Result<()> {
        let formatted = self.spec.format_task(task, context);
        self.current_task = Some(task.to_string());
        self.status = WorkerStatus::Running;
        self.started_at = Some(Instant::now());
        self.restart_context = None;
        info!(session_id = %self.id, worker = self.spec.name, "starting session");

        match &mut self.backend {
            Backend::Tmux => {
                tmux::spawn_session(&self.id, &self.config.project_path, &self.spec.command_line()).await?;
                tokio::time::sleep(self.spec.startup_delay).await;
                tmux::send_keys(&self.id, &formatted).await?;
            }
            Backend::Native(terminal) => {
                let command_line = self.spec.command_line();
                terminal.open(&command_line, &formatted).await?;
                tokio::time::sleep(Duration::from_secs(3)).await;
            }
        }

        if !self.is_alive().await {
            self.status = WorkerStatus::Error;
            return Err(EngineError::SessionSpawnFailed(format!(
                "session {} died immediately after spawn",
                self.id
            )));
        }

        info!(session_id = %self.id, "task sent to CLI");
        Ok(())
    }

    /// Deliver `text` + Enter. Bounded; failures are reported but do not
    /// kill the session.
    pub async fn send_input(&self, text: &str) -> Result<()> {
        let deliver = async {
            match &self.backend {
                Backend::Tmux => tmux::send_keys(&self.id, text).await,
                Backend::Native(terminal) => terminal.send_text(text).await,
            }
        };

        match tokio::time::timeout(INPUT_TIMEOUT, deliver).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::InputFailed(format!("input to {} timed out", self.id))),
        }
    }

    /// Current scrollback, sanitized. Unreadable backing stores yield the
    /// empty string (and a log line), never an error.
    pub async fn capture_output(&self) -> String {
        let bytes = match &self.backend {
            Backend::Tmux => match tmux::capture_pane(&self.id).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(session_id = %self.id, error = %e, "capture failed");
                    return String::new();
                }
            },
            Backend::Native(terminal) => terminal.read_log().await,
        };

        sanitize_bytes(&bytes)
    }

    /// True iff the session process/window is still present
    pub async fn is_alive(&self) -> bool {
        match &self.backend {
            Backend::Tmux => tmux::has_session(&self.id).await,
            Backend::Native(terminal) => terminal.is_alive().await,
        }
    }

    /// Poll the completion oracle until a verdict or the timeout.
    ///
    /// Returns `(success, full_scrollback)`.
    pub async fn wait_for_completion(
        &mut self,
        timeout: Duration,
        watcher: Option<&tokio::sync::Mutex<LogWatcher>>,
    ) -> (bool, String) {
        let deadline = Instant::now() + timeout;
        let mut tail_hashes: VecDeque<u64> = VecDeque::new();
        let mut output = String::new();
        let mut ticks: u32 = 0;

        loop {
            if Instant::now() >= deadline {
                warn!(session_id = %self.id, "timeout waiting for completion");
                self.status = WorkerStatus::Timeout;
                return (false, output);
            }
            tokio::time::sleep(POLL_INTERVAL).await;

            output = self.capture_output().await;
            let tail = tail_chars(&output, MARKER_WINDOW);

            // 1. Static completion markers
            if let Some(marker) = self.spec.completion_markers.iter().find(|m| tail.contains(*m)) {
                info!(session_id = %self.id, marker = %marker, "completion marker matched");
                self.status = WorkerStatus::Completed;
                self.usage = WorkerUsage::parse(&output);
                return (true, output);
            }

            // 2. Stuck: stable tail across three ticks, no progress signs
            tail_hashes.push_back(hash_str(&tail));
            if tail_hashes.len() > STUCK_TICKS {
                tail_hashes.pop_front();
            }
            if stuck_detected(&tail_hashes, &output) {
                warn!(session_id = %self.id, "stuck: output unchanged with no progress signs");
                self.status = WorkerStatus::Stuck;
                return (false, output);
            }

            // 3. Liveness
            if !self.is_alive().await {
                self.usage = WorkerUsage::parse(&output);
                return if self.usage.is_some() || WorkerUsage::trailer_present(&output) {
                    info!(session_id = %self.id, "session closed with usage trailer, treating as completed");
                    self.status = WorkerStatus::Completed;
                    (true, output)
                } else {
                    warn!(session_id = %self.id, "session died without completing");
                    self.status = WorkerStatus::Error;
                    (false, output)
                };
            }

            // 4. Log watcher verdict
            if let Some(watcher) = watcher
                && output.len() > 100
            {
                let task = self.current_task.clone().unwrap_or_default();
                let elapsed = self.elapsed().as_secs_f64();
                let analysis = watcher.lock().await.analyze(&output, &task, elapsed).await;

                match analysis.result {
                    WatchResult::Completed => {
                        info!(session_id = %self.id, summary = %analysis.summary, "watcher verdict: completed");
                        self.status = WorkerStatus::Completed;
                        self.usage = WorkerUsage::parse(&output);
                        return (true, output);
                    }
                    WatchResult::Error => {
                        warn!(session_id = %self.id, summary = %analysis.summary, "watcher verdict: error");
                        self.status = WorkerStatus::Error;
                        return (false, output);
                    }
                    WatchResult::Stuck if analysis.should_restart => {
                        // Cache the handover for the caller; the restart
                        // decision is theirs. Only the tail-hash detector,
                        // liveness, or the timeout end this wait.
                        warn!(session_id = %self.id, summary = %analysis.summary, "watcher verdict: stuck, restart advised");
                        self.status = WorkerStatus::Stuck;
                        self.restart_context = analysis.restart_context.clone();
                    }
                    _ => {
                        debug!(session_id = %self.id, status = analysis.result.as_str(), "watcher verdict");
                    }
                }
            }

            // 5. Periodic status and continue
            ticks += 1;
            if ticks % 4 == 0 {
                let line = status_line(&output).unwrap_or_else(|| format!("{} is working...", self.spec.name));
                info!(
                    session_id = %self.id,
                    elapsed_secs = self.elapsed().as_secs(),
                    "{}",
                    line
                );
            } else {
                debug!(
                    session_id = %self.id,
                    elapsed_secs = self.elapsed().as_secs(),
                    output_len = output.len(),
                    "still waiting for completion"
                );
            }
            self.last_output = output.clone();
        }
    }

    /// Tear the session down: terminate the process, close the window by
    /// id only, unlink temp files. Idempotent.
    pub async fn stop(&mut self) {
        info!(session_id = %self.id, "stopping session");

        match &mut self.backend {
            Backend::Tmux => tmux::kill_session(&self.id).await,
            Backend::Native(terminal) => terminal.close().await,
        }

        self.status = WorkerStatus::Idle;
        self.current_task = None;
    }

    /// Attach the current terminal to the multiplexer session
    pub fn attach(&self) -> std::io::Result<std::process::ExitStatus> {
        tmux::attach(&self.id)
    }
}

/// Read-only view over a tmux session by id
pub struct SessionProbe {
    session_id: String,
}

#[async_trait::async_trait]
impl crate::watch::watchdog::WatchSource for SessionProbe {
    async fn output(&self) -> eyre::Result<String> {
        let bytes = tmux::capture_pane(&self.session_id).await.map_err(|e| eyre::eyre!("{}", e))?;
        Ok(sanitize_bytes(&bytes))
    }

    async fn alive(&self) -> eyre::Result<bool> {
        Ok(tmux::has_session(&self.session_id).await)
    }
}

#[async_trait::async_trait]
impl crate::watch::recovery::NudgeTarget for Session {
    async fn is_alive(&self) -> bool {
        Session::is_alive(self).await
    }

    async fn send_input(&self, text: &str) -> Result<()> {
        Session::send_input(self, text).await
    }

    async fn capture_output(&self) -> String {
        Session::capture_output(self).await
    }
}

fn hash_str(s: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    s.hash(&mut hasher);
    hasher.finish()
}

fn tail_chars(text: &str, max: usize) -> String {
    let chars: Vec<char> = text.chars().collect();
    let start = chars.len().saturating_sub(max);
    chars[start..].iter().collect()
}

/// Pick the most recent meaningful line for a status report, skipping
/// TUI chrome and box drawing.
fn status_line(output: &str) -> Option<String> {
    const ACTION_WORDS: &[&str] = &[
        "Read", "Search", "Exploring", "Writing", "Creating", "Analyzing", "Checking", "Updated:",
    ];
    const JUNK: &[&str] = &["? for help", "shift+tab", "ctrl+", "Tip:", "/model"];

    for line in output.lines().rev().take(20) {
        let line = line.trim();
        if line.chars().count() < 20 {
            continue;
        }
        if JUNK.iter().any(|j| line.contains(j)) {
            continue;
        }
        if line.chars().all(|c| "╭╮╰╯│─ ".contains(c)) {
            continue;
        }
        if ACTION_WORDS.iter().any(|w| line.contains(w)) {
            return Some(line.chars().take(70).collect());
        }
    }
    None
}

/// Stuck iff the tail hash held steady for the last three ticks and the
/// recent window shows no progress pattern.
fn stuck_detected(tail_hashes: &VecDeque<u64>, output: &str) -> bool {
    if tail_hashes.len() < STUCK_TICKS {
        return false;
    }
    let first = tail_hashes[0];
    if !tail_hashes.iter().all(|h| *h == first) {
        return false;
    }

    let window = tail_chars(output, PROGRESS_WINDOW);
    !PROGRESS_RES.iter().any(|re| re.is_match(&window))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::TierPolicy;

    fn make_session(visible: bool) -> Session {
        let policy = TierPolicy::default();
        Session::new(
            WorkerTier::Medium,
            policy.spec(WorkerTier::Medium).clone(),
            SessionConfig {
                visible,
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_session_id_namespaced() {
        let session = make_session(false);
        assert!(session.id().starts_with("shepherd-copilot-"));
        assert_eq!(session.status(), WorkerStatus::Idle);
    }

    #[test]
    fn test_effective_interval_uses_multiplier() {
        let policy = TierPolicy::default();
        let session = Session::new(
            WorkerTier::Complex,
            policy.spec(WorkerTier::Complex).clone(),
            SessionConfig {
                check_interval: Duration::from_secs(60),
                ..Default::default()
            },
        );
        assert_eq!(session.effective_interval(), Duration::from_secs(120));
    }

    #[test]
    fn test_stuck_detection_needs_three_identical() {
        let mut hashes = VecDeque::new();
        hashes.push_back(1);
        hashes.push_back(1);
        assert!(!stuck_detected(&hashes, "plain output"));

        hashes.push_back(1);
        assert!(stuck_detected(&hashes, "plain output"));
    }

    #[test]
    fn test_stuck_suppressed_by_progress_pattern() {
        let mut hashes = VecDeque::new();
        for _ in 0..3 {
            hashes.push_back(7);
        }
        assert!(!stuck_detected(&hashes, "still busy\nWriting src/main.rs"));
        assert!(!stuck_detected(&hashes, "Updated: 3 total, 2 completed"));
        assert!(stuck_detected(&hashes, "nothing happening at all"));
    }

    #[test]
    fn test_stuck_not_triggered_on_changing_hashes() {
        let mut hashes = VecDeque::new();
        hashes.push_back(1);
        hashes.push_back(2);
        hashes.push_back(1);
        assert!(!stuck_detected(&hashes, "no progress words"));
    }

    #[test]
    fn test_status_line_picks_action() {
        let output = "╭──────────────╮\n\
                      Writing src/components/Panel.tsx with the new layout\n\
                      ? for help · shift+tab to cycle\n";
        let line = status_line(output).unwrap();
        assert!(line.contains("Writing src/components/Panel.tsx"));
    }

    #[test]
    fn test_status_line_none_on_chrome_only() {
        assert!(status_line("╭──────────────╮\n? for help\n").is_none());
    }

    #[test]
    fn test_tail_chars() {
        assert_eq!(tail_chars("hello world", 5), "world");
        assert_eq!(tail_chars("short", 100), "short");
    }
}
