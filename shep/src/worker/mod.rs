//! Worker sessions: driving external interactive CLIs
//!
//! A worker is an opaque coding CLI (droid, copilot, codex) run in a
//! controlled session. Tiers select the command line, completion markers,
//! and polling cadence; the session code itself is tier-agnostic.

pub mod manager;
pub mod session;
pub mod terminal;
pub mod tmux;

pub use manager::WorkerManager;
pub use session::{Session, SessionProbe};

use regex::Regex;
use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;

/// Session namespace prefix; the stale-session sweep only touches
/// multiplexer sessions carrying it.
pub const SESSION_NAMESPACE: &str = "shepherd";

/// Worker capability tiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerTier {
    Simple,
    Medium,
    Complex,
}

impl WorkerTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerTier::Simple => "simple",
            WorkerTier::Medium => "medium",
            WorkerTier::Complex => "complex",
        }
    }
}

impl std::fmt::Display for WorkerTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current status of a worker session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Idle,
    Running,
    Completed,
    Stuck,
    Loop,
    Error,
    NeedHuman,
    Timeout,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Idle => "idle",
            WorkerStatus::Running => "running",
            WorkerStatus::Completed => "completed",
            WorkerStatus::Stuck => "stuck",
            WorkerStatus::Loop => "loop",
            WorkerStatus::Error => "error",
            WorkerStatus::NeedHuman => "need_human",
            WorkerStatus::Timeout => "timeout",
        }
    }
}

/// Everything a tier decides about how its CLI is driven
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    /// Short worker name, used in session ids and logs
    pub name: &'static str,
    /// Program to run
    pub program: &'static str,
    /// Fixed flag set
    pub args: &'static [&'static str],
    /// Static completion markers matched against the scrollback tail
    pub completion_markers: &'static [&'static str],
    /// Poll interval multiplier (slow CLIs get checked less often)
    pub interval_multiplier: f64,
    /// Delay between spawn and first input injection
    pub startup_delay: Duration,
}

impl WorkerSpec {
    /// The full command line, shell-quoted
    pub fn command_line(&self) -> String {
        let mut parts = vec![self.program.to_string()];
        parts.extend(self.args.iter().map(|a| a.to_string()));
        parts.join(" ")
    }

    /// Format a task for this worker, flattening newlines so the whole
    /// task lands in one TUI prompt, and appending carried-over context.
    pub fn format_task(&self, task: &str, context: Option<&str>) -> String {
        let body = match self.name {
            "codex" => format!(
                "COMPLEX TASK (requires deep analysis):\n\n{}\n\n\
                 Instructions:\n\
                 1. Analyze the problem thoroughly\n\
                 2. Study the related code\n\
                 3. Propose and implement a solution\n\
                 4. Verify the solution works",
                task
            ),
            _ => task.to_string(),
        };

        let full = match context {
            Some(ctx) if !ctx.is_empty() => format!("{}\n\nContext from previous work:\n{}", body, ctx),
            _ => body,
        };

        full.replace('\n', " ")
    }
}

/// Injected tier policy: which CLI serves which tier
#[derive(Debug, Clone)]
pub struct TierPolicy {
    simple: WorkerSpec,
    medium: WorkerSpec,
    complex: WorkerSpec,
}

impl TierPolicy {
    pub fn spec(&self, tier: WorkerTier) -> &WorkerSpec {
        match tier {
            WorkerTier::Simple => &self.simple,
            WorkerTier::Medium => &self.medium,
            WorkerTier::Complex => &self.complex,
        }
    }
}

impl Default for TierPolicy {
    fn default() -> Self {
        Self {
            simple: WorkerSpec {
                name: "droid",
                program: "droid",
                args: &["--model", "sonnet"],
                completion_markers: &["Task completed", "All done", "Готово"],
                interval_multiplier: 1.0,
                startup_delay: Duration::from_secs(2),
            },
            medium: WorkerSpec {
                name: "copilot",
                program: "copilot",
                args: &["--allow-all", "--model", "claude-sonnet-4"],
                completion_markers: &[
                    "Task completed",
                    "All done",
                    "Successfully",
                    "Готово",
                    "Total usage est:",
                    "API time spent:",
                    "Premium request",
                ],
                interval_multiplier: 1.0,
                startup_delay: Duration::from_secs(1),
            },
            complex: WorkerSpec {
                name: "codex",
                program: "codex",
                args: &["--dangerously-bypass-approvals-and-sandbox"],
                completion_markers: &["Total usage est:", "Total session time:", "Task completed", "Готово"],
                interval_multiplier: 2.0,
                startup_delay: Duration::from_secs(2),
            },
        }
    }
}

/// Session-level configuration handed to each spawn
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Project directory the CLI works in
    pub project_path: PathBuf,
    /// Base log poll interval
    pub check_interval: Duration,
    /// Open a native terminal window instead of the multiplexer
    pub visible: bool,
    /// Seconds of unchanged output before a session counts as stuck
    pub stuck_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            project_path: PathBuf::from("."),
            check_interval: Duration::from_secs(60),
            visible: false,
            stuck_timeout: Duration::from_secs(300),
        }
    }
}

static TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\w[\w\-.]+)\s+([\d.]+)k\s+in,\s+([\d.]+)\s+out,\s+([\d.]+)k\s+cached").unwrap());
static API_TIME_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"API time spent:\s+(\d+)s").unwrap());
static TOTAL_TIME_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"Total session time:\s+(\d+)s").unwrap());
static PREMIUM_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+)\s+Premium request").unwrap());

/// Usage statistics parsed from a worker's closing trailer
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkerUsage {
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cached_tokens: u64,
    pub api_time_seconds: f64,
    pub total_time_seconds: f64,
    pub premium_requests: u32,
}

impl WorkerUsage {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    /// Parse the usage trailer some CLIs print on exit.
    ///
    /// Example:
    /// ```text
    /// Total usage est:        1 Premium request
    /// API time spent:         6s
    /// Total session time:     9s
    /// Breakdown by AI model:
    ///  claude-sonnet-4         31.9k in, 302 out, 26.0k cached
    /// ```
    pub fn parse(output: &str) -> Option<Self> {
        let mut usage = Self::default();

        if let Some(caps) = TOKEN_RE.captures(output) {
            usage.model = caps[1].to_string();
            usage.input_tokens = (caps[2].parse::<f64>().unwrap_or(0.0) * 1000.0) as u64;
            usage.output_tokens = caps[3].parse::<f64>().unwrap_or(0.0) as u64;
            usage.cached_tokens = (caps[4].parse::<f64>().unwrap_or(0.0) * 1000.0) as u64;
        }
        if let Some(caps) = API_TIME_RE.captures(output) {
            usage.api_time_seconds = caps[1].parse().unwrap_or(0.0);
        }
        if let Some(caps) = TOTAL_TIME_RE.captures(output) {
            usage.total_time_seconds = caps[1].parse().unwrap_or(0.0);
        }
        if let Some(caps) = PREMIUM_RE.captures(output) {
            usage.premium_requests = caps[1].parse().unwrap_or(0);
        }

        if usage.input_tokens == 0 && usage.output_tokens == 0 {
            return None;
        }
        Some(usage)
    }

    /// True if output contains any usage trailer line at all
    pub fn trailer_present(output: &str) -> bool {
        output.contains("Total usage est:") || output.contains("Total session time:") || TOKEN_RE.is_match(output)
    }
}

/// Generate a namespaced session id: `shepherd-{worker}-{8-hex}`
pub fn new_session_id(worker_name: &str) -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}", SESSION_NAMESPACE, worker_name, &hex[..8])
}
