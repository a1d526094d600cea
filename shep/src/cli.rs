//! CLI command definitions

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::worker::WorkerTier;

/// Shepherd - supervision engine for interactive AI coding CLIs
#[derive(Parser)]
#[command(name = "shep", about = "Drives AI coding CLIs to completion on a task", version)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(short = 'l', long = "log-level", global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a task once
    Run {
        /// The task to run; read from stdin when omitted
        task: Option<String>,

        #[command(flatten)]
        tier: TierArgs,

        /// Base poll interval in seconds (shorthand: --N)
        #[arg(long)]
        interval: Option<f64>,

        /// Open native terminal windows instead of the multiplexer
        #[arg(long)]
        visible: bool,

        /// Alternate executor and reviewer workers
        #[arg(long)]
        review_loop: bool,

        /// Maximum review-loop iterations
        #[arg(long)]
        max_iterations: Option<u32>,

        /// Use the medium-tier worker as the reviewer
        #[arg(long)]
        reviewer_mode: bool,

        /// Skip the first execution, go straight to review
        #[arg(long)]
        skip_first_execution: bool,
    },

    /// Show engine and session status
    Status,

    /// Attach the terminal to the live worker session
    Attach,
}

/// Mutually exclusive worker selection
#[derive(Debug, Args)]
#[group(multiple = false)]
pub struct TierArgs {
    /// Use the simple-tier worker
    #[arg(long)]
    pub simple: bool,

    /// Use the medium-tier worker
    #[arg(long)]
    pub medium: bool,

    /// Use the complex-tier worker
    #[arg(long)]
    pub complex: bool,

    /// Pick the tier automatically (default)
    #[arg(long)]
    pub auto: bool,
}

impl TierArgs {
    /// The explicitly selected tier, or None for automatic selection
    pub fn selection(&self) -> Option<WorkerTier> {
        if self.simple {
            Some(WorkerTier::Simple)
        } else if self.medium {
            Some(WorkerTier::Medium)
        } else if self.complex {
            Some(WorkerTier::Complex)
        } else {
            None
        }
    }
}

/// Expand the `--N` interval shorthand into `--interval N`
pub fn normalize_args<I: IntoIterator<Item = String>>(args: I) -> Vec<String> {
    let mut normalized = Vec::new();
    for arg in args {
        if let Some(digits) = arg.strip_prefix("--")
            && !digits.is_empty()
            && digits.chars().all(|c| c.is_ascii_digit())
        {
            normalized.push("--interval".to_string());
            normalized.push(digits.to_string());
        } else {
            normalized.push(arg);
        }
    }
    normalized
}
