//! Shepherd CLI entry point

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::Parser;
use colored::Colorize;
use eyre::{Context, Result, eyre};
use tokio::sync::Mutex;
use tracing::{info, warn};

use shepherd::clarify::{AskUser, Task, TaskClarifier};
use shepherd::cli::{Cli, Command, normalize_args};
use shepherd::config::Config;
use shepherd::llm::LlmRouter;
use shepherd::review::{ManagedRunner, ReviewLoopConfig, ReviewLoopManager};
use shepherd::state::{RecoveryManager, StatePersistence};
use shepherd::supervise::{Supervisor, SupervisorAction};
use shepherd::vcs::{GitVcs, Vcs};
use shepherd::watch::{ConsoleRecovery, LogWatcher};
use shepherd::worker::{SessionConfig, WorkerManager, WorkerTier, manager::process_start_init, tmux};

/// Exit code for SIGINT, per shell convention
const SIGINT_EXIT: i32 = 130;
/// Iteration budget for single-shot supervision
const MAX_SUPERVISION_ITERATIONS: u32 = 20;

fn setup_logging(cli_log_level: Option<&str>, config: &Config) -> Result<()> {
    std::fs::create_dir_all(&config.storage.log_dir).context("Failed to create log directory")?;

    let level = match cli_log_level.map(str::to_uppercase).as_deref() {
        Some("TRACE") => tracing::Level::TRACE,
        Some("DEBUG") => tracing::Level::DEBUG,
        Some("WARN") | Some("WARNING") => tracing::Level::WARN,
        Some("ERROR") => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    };

    let log_file =
        std::fs::File::create(config.storage.log_dir.join("shepherd.log")).context("Failed to create log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_from(normalize_args(std::env::args()));

    let mut config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    setup_logging(cli.log_level.as_deref(), &config)?;

    match cli.command {
        Some(Command::Run {
            task,
            tier,
            interval,
            visible,
            review_loop,
            max_iterations,
            reviewer_mode,
            skip_first_execution,
        }) => {
            if let Some(interval) = interval {
                config.worker.check_interval_secs = interval;
            }
            if visible {
                config.worker.visible = true;
            }
            if let Some(max) = max_iterations {
                config.review.max_iterations = max;
            }

            let task_text = match task {
                Some(text) => text,
                None => read_task_from_stdin()?,
            };

            cmd_run(
                &config,
                &task_text,
                tier.selection(),
                review_loop,
                reviewer_mode,
                skip_first_execution,
            )
            .await
        }
        Some(Command::Status) => cmd_status(&config).await,
        Some(Command::Attach) => cmd_attach().await,
        None => {
            println!("No command given. Try: shep run \"your task\"");
            Ok(())
        }
    }
}

fn read_task_from_stdin() -> Result<String> {
    use std::io::Read;
    let mut task = String::new();
    std::io::stdin().read_to_string(&mut task).context("Failed to read task from stdin")?;
    let task = task.trim().to_string();
    if task.is_empty() {
        return Err(eyre!("Empty task"));
    }
    Ok(task)
}

/// Interactive question callback backed by stdin
fn stdin_ask_user() -> AskUser {
    Arc::new(|question| {
        Box::pin(async move {
            println!("\n{}", question);
            tokio::task::spawn_blocking(|| {
                let mut line = String::new();
                std::io::stdin().read_line(&mut line).ok();
                line.trim().to_string()
            })
            .await
            .unwrap_or_default()
        })
    })
}

async fn cmd_run(
    config: &Config,
    task_text: &str,
    tier_flag: Option<WorkerTier>,
    review_loop: bool,
    reviewer_mode: bool,
    skip_first_execution: bool,
) -> Result<()> {
    // Once-per-process cleanup before any session exists
    process_start_init(Duration::from_secs(config.worker.idle_session_timeout_secs)).await;

    let router = Arc::new(LlmRouter::from_config(&config.llm)?);
    let session_config = SessionConfig {
        project_path: config.worker.project_path.clone(),
        check_interval: Duration::from_secs_f64(config.worker.check_interval_secs),
        visible: config.worker.visible,
        stuck_timeout: Duration::from_secs_f64(config.worker.stuck_timeout_secs),
    };
    let vcs: Arc<dyn Vcs> = Arc::new(GitVcs::new(&config.worker.project_path));

    // Resume a crashed run if one is on disk
    let persistence = StatePersistence::new(&config.storage.state_dir)?;
    let mut recovery = RecoveryManager::new(vcs.clone(), persistence);
    let recovery_info = recovery.check_recovery_needed().await;
    if recovery_info.can_resume {
        println!("{} {}", "Resuming:".yellow(), recovery_info.message);
        let (ok, message) = recovery.prepare_recovery(true).await;
        if !ok {
            println!("{} {}", "Recovery failed:".red(), message);
            std::process::exit(1);
        }
    } else {
        recovery
            .persistence()
            .create_new_run(&config.worker.project_path.display().to_string(), vec![]);
    }

    let clarifier = TaskClarifier::new(
        router.clone(),
        config.worker.project_path.display().to_string(),
        Some(stdin_ask_user()),
    );

    // One SIGINT asks for a graceful stop; a second forces exit
    let interrupted = Arc::new(AtomicBool::new(false));

    let success = if review_loop {
        // The loop controller clarifies the task itself
        run_review_loop(
            config,
            router,
            session_config,
            vcs,
            task_text,
            &clarifier,
            reviewer_mode,
            skip_first_execution,
            interrupted.clone(),
        )
        .await?
    } else {
        let task = clarifier.clarify(task_text).await;
        let tier = tier_flag.unwrap_or_else(|| task.complexity.tier());
        println!(
            "{} complexity={} tier={} criteria={}",
            "Task:".green(),
            task.complexity.as_str(),
            tier,
            task.criteria.len()
        );
        let criteria = task.criteria.clone();
        let _ = recovery.persistence().update(|s| s.criteria_echo = criteria);

        run_single_shot(config, router, session_config, vcs, &task, tier, interrupted.clone()).await?
    };

    if success {
        recovery.mark_pipeline_complete();
        println!("{}", "Task completed".green().bold());
    } else {
        recovery.mark_pipeline_failed("run did not complete successfully");
        println!("{}", "Task failed".red().bold());
    }

    if interrupted.load(Ordering::Relaxed) {
        std::process::exit(SIGINT_EXIT);
    }
    if !success {
        std::process::exit(1);
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn run_review_loop(
    config: &Config,
    router: Arc<LlmRouter>,
    session_config: SessionConfig,
    vcs: Arc<dyn Vcs>,
    task_text: &str,
    clarifier: &TaskClarifier,
    reviewer_mode: bool,
    skip_first_execution: bool,
    interrupted: Arc<AtomicBool>,
) -> Result<bool> {
    let watcher = Arc::new(Mutex::new(LogWatcher::new(router.clone())));
    let runner = Arc::new(ManagedRunner::new(session_config, Some(watcher), vcs));

    let loop_config = ReviewLoopConfig {
        max_iterations: config.review.max_iterations,
        skip_first_execution,
        simple_mode: false,
        executor_tier: WorkerTier::Medium,
        reviewer_tier: if reviewer_mode { WorkerTier::Medium } else { WorkerTier::Complex },
        worker_timeout: Duration::from_secs(config.review.worker_timeout_secs),
    };

    let on_status: shepherd::review::StatusFn = Arc::new(|line| println!("{} {}", "[loop]".cyan(), line));
    let mut manager = ReviewLoopManager::new(router.clone(), runner, loop_config, Some(on_status));

    let stop_flag = manager.stop_flag();
    let signal_interrupted = interrupted.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_interrupted.store(true, Ordering::Relaxed);
            stop_flag.store(true, Ordering::Relaxed);
            eprintln!("Interrupt received, finishing the current step... (press again to force quit)");
            if tokio::signal::ctrl_c().await.is_ok() {
                std::process::exit(SIGINT_EXIT);
            }
        }
    });

    let result = manager.run_loop(task_text, Some(clarifier)).await;

    println!(
        "Review loop done: success={} iterations={} findings={} fixed={} confirmed_fixed={}",
        result.success, result.iterations, result.total_findings, result.fixed_findings, result.confirmed_fixed
    );
    if result.cycle_detected {
        println!("{} {}", "Cycle detected:".yellow(), result.cycle_reason);
    }

    Ok(result.success)
}

/// A running watchdog task and its control handles
struct WatchdogTask {
    handle: tokio::task::JoinHandle<()>,
    stop: Arc<AtomicBool>,
    issues: tokio::sync::mpsc::Receiver<shepherd::watch::HealthCheck>,
}

impl WatchdogTask {
    /// Spawn a watchdog over the manager's live session, when probeable
    fn spawn(config: &Config, manager: &WorkerManager) -> Option<Self> {
        let probe = manager.current_session()?.probe()?;
        let watchdog = shepherd::watch::Watchdog::new(
            Duration::from_secs(config.watchdog.check_interval_secs),
            Duration::from_secs(config.watchdog.stuck_threshold_secs),
        );
        let stop = watchdog.stop_flag();
        let (tx, rx) = tokio::sync::mpsc::channel(8);
        let handle = tokio::spawn(watchdog.run(Arc::new(probe), tx));
        Some(Self {
            handle,
            stop,
            issues: rx,
        })
    }

    fn shutdown(&self) {
        self.stop.store(true, Ordering::Relaxed);
        self.handle.abort();
    }
}

async fn run_single_shot(
    config: &Config,
    router: Arc<LlmRouter>,
    session_config: SessionConfig,
    vcs: Arc<dyn Vcs>,
    task: &Task,
    tier: WorkerTier,
    interrupted: Arc<AtomicBool>,
) -> Result<bool> {
    let watcher = Arc::new(Mutex::new(LogWatcher::new(router.clone())));
    let mut manager = WorkerManager::new(session_config, Some(watcher.clone()));
    let mut supervisor = Supervisor::new(
        router.clone(),
        config.watchdog.escalate_after,
        config.analyzer.truncate_length,
        config.analyzer.truncate_start_ratio,
    );
    let mut console_recovery = ConsoleRecovery::default();

    let signal_interrupted = interrupted.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_interrupted.store(true, Ordering::Relaxed);
            eprintln!("Interrupt received, stopping after this poll... (press again to force quit)");
            if tokio::signal::ctrl_c().await.is_ok() {
                std::process::exit(SIGINT_EXIT);
            }
        }
    });

    let task_text = task.with_criteria();
    let timeout = Duration::from_secs(config.review.worker_timeout_secs);
    manager.start_task(&task_text, tier, None).await?;
    let mut watchdog = WatchdogTask::spawn(config, &manager);
    let mut restarts: u32 = 0;

    for iteration in 1..=MAX_SUPERVISION_ITERATIONS {
        if interrupted.load(Ordering::Relaxed) {
            if let Some(dog) = &watchdog {
                dog.shutdown();
            }
            manager.stop().await;
            return Ok(false);
        }

        // Wait for the oracle while the watchdog may interject
        let (success, output) = tokio::select! {
            result = manager.wait_for_completion(timeout) => result,
            Some(issue) = recv_issue(&mut watchdog) => {
                let decision = supervisor.handle_health_issue(&issue);
                println!("{} {:?}: {}", "[watchdog]".cyan(), decision.action, decision.reason);
                match decision.action {
                    SupervisorAction::Restart | SupervisorAction::NewChat => {
                        if let Some(dog) = &watchdog { dog.shutdown(); }
                        manager.start_task(&task_text, tier, None).await?;
                        watchdog = WatchdogTask::spawn(config, &manager);
                    }
                    SupervisorAction::Ping => {
                        let _ = manager.send_message("").await;
                    }
                    SupervisorAction::Escalate => {
                        println!("{} {}", "Escalation required:".red().bold(), decision.reason);
                        if let Some(dog) = &watchdog { dog.shutdown(); }
                        manager.stop().await;
                        return Ok(false);
                    }
                    _ => {}
                }
                continue;
            }
        };

        if !success {
            // The watcher may have asked for a restart with context
            let restart_context = manager
                .current_session()
                .filter(|s| s.status() == shepherd::worker::WorkerStatus::Stuck)
                .and_then(|s| s.restart_context())
                .map(str::to_string);
            if let Some(context) = restart_context
                && restarts < config.worker.max_retries
            {
                restarts += 1;
                println!("{} restart {}/{}", "Stuck, restarting with context:".yellow(), restarts, config.worker.max_retries);
                if let Some(dog) = &watchdog {
                    dog.shutdown();
                }
                // Hand over what the watcher saw along with the log tail
                let context = format!("{}\n\n{}", context, watcher.lock().await.history_context());
                manager.start_task(&task_text, tier, Some(&context)).await?;
                watchdog = WatchdogTask::spawn(config, &manager);
                continue;
            }

            // A dead or stalled console may just need a nudge
            if let Some(reason) = console_recovery.detect_issue(&output) {
                warn!(reason = %reason, "console issue detected, attempting recovery");
                println!("{} {}", "Console issue:".yellow(), reason);
                if let Some(session) = manager.current_session()
                    && console_recovery.attempt_recovery(session, &output).await
                {
                    println!("{}", "Recovery nudge worked, continuing".green());
                    continue;
                }
            }
            if let Some(dog) = &watchdog {
                dog.shutdown();
            }
            manager.stop().await;
            return Ok(false);
        }

        let decision = supervisor
            .analyze_response(&output, &task_text, 1, "run", iteration, &task.criteria)
            .await;
        println!("{} {:?}: {}", "[supervisor]".cyan(), decision.action, decision.reason);

        match decision.action {
            SupervisorAction::Continue => {
                if supervisor.confirmations() >= 2 {
                    if let Some(dog) = &watchdog {
                        dog.shutdown();
                    }
                    manager.stop().await;
                    return Ok(true);
                }
                let _ = manager.send_message("Continue").await;
            }
            SupervisorAction::NewChat => {
                let commit = vcs
                    .commit_all(&format!("shepherd checkpoint: iteration {}", iteration))
                    .await
                    .unwrap_or(None);
                if let Some(sha) = &commit {
                    info!(sha = %sha, "committed before fresh session");
                }
                let context = decision
                    .analysis
                    .as_ref()
                    .map(|a| a.changes_description.clone())
                    .filter(|d| !d.is_empty());
                if let Some(dog) = &watchdog {
                    dog.shutdown();
                }
                manager.start_task(&task_text, tier, context.as_deref()).await?;
                watchdog = WatchdogTask::spawn(config, &manager);
            }
            SupervisorAction::SendMessage => {
                if let Some(message) = &decision.message {
                    let _ = manager.send_message(message).await;
                }
            }
            SupervisorAction::Restart => {
                if let Some(dog) = &watchdog {
                    dog.shutdown();
                }
                manager.start_task(&task_text, tier, None).await?;
                watchdog = WatchdogTask::spawn(config, &manager);
            }
            SupervisorAction::Ping => {
                let _ = manager.send_message("").await;
            }
            SupervisorAction::Wait => {}
            SupervisorAction::Escalate => {
                println!("{} {}", "Escalation required:".red().bold(), decision.reason);
                if let Some(dog) = &watchdog {
                    dog.shutdown();
                }
                manager.stop().await;
                return Ok(false);
            }
        }
    }

    warn!("supervision iteration budget exhausted");
    if let Some(dog) = &watchdog {
        dog.shutdown();
    }
    manager.stop().await;
    Ok(false)
}

/// Receive the next watchdog issue, pending forever without a watchdog
async fn recv_issue(watchdog: &mut Option<WatchdogTask>) -> Option<shepherd::watch::HealthCheck> {
    match watchdog {
        Some(dog) => dog.issues.recv().await,
        None => std::future::pending().await,
    }
}

async fn cmd_status(config: &Config) -> Result<()> {
    println!("Shepherd Status");
    println!("---------------");

    let mut persistence = StatePersistence::new(&config.storage.state_dir)?;
    match persistence.load() {
        Some(state) => {
            println!("Run:        {}", state.run_id);
            println!("Status:     {}", state.status);
            println!("Step:       {}", state.current_step);
            println!("Iteration:  {}", state.current_iteration);
            println!("Commits:    {}", state.commits.len());
            println!("Updated:    {}", state.updated_at);
        }
        None => println!("No persisted run"),
    }

    let sessions = tmux::list_shepherd_sessions().await;
    if sessions.is_empty() {
        println!("Sessions:   none");
    } else {
        println!("Sessions:");
        for name in sessions {
            println!("  {}", name);
        }
    }

    Ok(())
}

async fn cmd_attach() -> Result<()> {
    let sessions = tmux::list_shepherd_sessions().await;
    match sessions.first() {
        Some(name) => {
            println!("Attaching to {} (detach with C-b d)", name);
            tmux::attach(name).context("Failed to attach")?;
            Ok(())
        }
        None => {
            println!("No live shepherd session to attach to");
            Ok(())
        }
    }
}
