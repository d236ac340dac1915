//! Foreman - supervisory task controller for a coding agent
//!
//! Drives the `claude` CLI through a task backlog under a token budget, and
//! holds risky actions for human approval.

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use colored::Colorize;
use foreman::config::{ConfigLocations, ForemanConfig};
use foreman::controller::{
    Controller, ControllerDependencies, ControllerEvent, ControllerHandle, ControllerState,
    StatePersistence,
};
use foreman::operations::{
    BroadcastNotifier, ClaudeCliExecutor, CommandAlertService, JsonFileTaskStore, JsonlSessionLog,
    NoopAlertService,
};
use foreman::retry::RetryScheduler;
use foreman::task::{readiness::done_ids, select_next, Readiness, Task};
use foreman::testing::AlertService;
use foreman::ForemanError;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;

#[derive(Parser)]
#[command(name = "foreman")]
#[command(version)]
#[command(about = "Supervise a coding agent through a task backlog", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Project directory (defaults to current directory)
    #[arg(short, long, global = true, default_value = ".")]
    project: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the controller until interrupted
    Run {
        /// Read operator commands (approve, reject, pause, ...) from stdin
        #[arg(short, long)]
        interactive: bool,
    },

    /// Inspect the task backlog
    Tasks {
        #[command(subcommand)]
        action: TasksAction,
    },

    /// Show how a response would be classified
    Classify {
        /// Agent response text
        text: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show or validate configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum TasksAction {
    /// List every task with its readiness
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the task that would be picked next
    Next {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Move tasks between blocked and todo according to their dependencies
    Sweep,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate configuration
    Validate,

    /// Show configuration file paths
    Paths,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_json);

    if let Err(e) = run_cli(cli).await {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        let foreman_error = e.downcast_ref::<ForemanError>();
        if foreman_error.is_some_and(ForemanError::requires_human) {
            eprintln!(
                "{} fix the configuration or environment, then run foreman again",
                "Hint:".yellow().bold()
            );
        }
        std::process::exit(foreman_error.map_or(1, ForemanError::exit_code));
    }
}

fn init_tracing(verbose: bool, json: bool) {
    let filter = if verbose {
        "foreman=debug,info"
    } else {
        "foreman=info,warn"
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run_cli(cli: Cli) -> anyhow::Result<()> {
    let project_path = cli.project.canonicalize().unwrap_or(cli.project.clone());
    if !project_path.exists() {
        anyhow::bail!("Project directory does not exist: {}", project_path.display());
    }

    match cli.command {
        Commands::Run { interactive } => run_controller(&project_path, interactive).await,
        Commands::Tasks { action } => tasks_command(&project_path, action).await,
        Commands::Classify { text, json } => {
            classify_command(&project_path, &text, json)?;
            Ok(())
        }
        Commands::Config { action } => config_command(&project_path, action),
    }
}

fn load_config(project_path: &Path) -> anyhow::Result<ForemanConfig> {
    let loaded = ForemanConfig::load(project_path)?;
    tracing::debug!("Configuration from {}", loaded.source);
    loaded.config.validate()?;
    Ok(loaded.config)
}

// ============================================================================
// run
// ============================================================================

async fn run_controller(project_path: &Path, interactive: bool) -> anyhow::Result<()> {
    let config = load_config(project_path)?;

    let executor = ClaudeCliExecutor::new(project_path)
        .with_command(config.agent.command.clone())
        .with_model(config.agent.model.clone())
        .with_skip_permissions(config.agent.skip_permissions);
    let agent_path = executor.ensure_available()?;
    tracing::info!("Using agent at {}", agent_path.display());

    let alerts: Arc<dyn AlertService> = match &config.alerts.command {
        Some(command) => Arc::new(CommandAlertService::new(command.clone())),
        None => Arc::new(NoopAlertService),
    };
    let notifier = BroadcastNotifier::new(256).with_tracing();
    let mut events = notifier.subscribe();

    let deps = ControllerDependencies {
        store: Arc::new(JsonFileTaskStore::new(config.tasks_path(project_path))),
        executor: Arc::new(executor),
        notifier: Arc::new(notifier),
        alerts,
        session_log: Arc::new(JsonlSessionLog::new(ForemanConfig::sessions_dir(project_path))),
    };

    let controller = Controller::new(config.controller_settings(), deps, Utc::now())
        .with_classifier(config.classifier()?)
        .with_persistence(StatePersistence::new(ForemanConfig::foreman_dir(project_path)));
    let handle = ControllerHandle::spawn(controller);

    let state = handle.activate().await?;
    println!(
        "{} Controller {} on {}",
        "Foreman:".cyan().bold(),
        state.status.to_string().green(),
        config.tasks_path(project_path).display()
    );

    let mut sweep = tokio::time::interval(config.approval_sweep_interval());
    sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut stdin = interactive.then(|| BufReader::new(tokio::io::stdin()).lines());
    if interactive {
        print_help();
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("\n{} Interrupted, shutting down", "Foreman:".cyan().bold());
                break;
            }
            _ = sweep.tick() => {
                let report = handle.process_approval_timeouts().await?;
                for id in &report.expired {
                    println!("{} Approval {} expired", "Warning:".yellow(), id);
                }
                for id in &report.auto_approved {
                    println!("{} Approval {} auto-approved", "OK".green(), id);
                }
            }
            event = events.recv() => match event {
                Ok(event) => print_event(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!("Event printer skipped {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            line = next_line(&mut stdin) => {
                match line {
                    Some(line) => {
                        if !operator_command(&handle, line.trim()).await {
                            break;
                        }
                    }
                    None => stdin = None,
                }
            }
        }
    }

    let state = handle.shutdown().await?;
    print_state(&state);
    Ok(())
}

async fn next_line(
    stdin: &mut Option<tokio::io::Lines<BufReader<tokio::io::Stdin>>>,
) -> Option<String> {
    match stdin {
        Some(lines) => lines.next_line().await.ok().flatten(),
        None => std::future::pending().await,
    }
}

fn print_help() {
    println!(
        "   Commands: {}",
        "approve <id> | reject <id> [reason] | pause | resume | status | approvals | cancel | quit"
            .dimmed()
    );
}

/// Apply one operator command. Returns `false` to stop.
async fn operator_command(handle: &ControllerHandle, line: &str) -> bool {
    let mut parts = line.splitn(3, ' ');
    let verb = parts.next().unwrap_or_default();
    let arg = parts.next();
    let rest = parts.next().map(str::to_string);

    let result: foreman::Result<()> = match (verb, arg) {
        ("", _) => Ok(()),
        ("quit" | "exit", _) => return false,
        ("approve", Some(id)) => handle.approve(id).await.map(|r| {
            println!("{} Approved {} ({})", "OK".green(), r.id, r.task_id);
        }),
        ("reject", Some(id)) => handle.reject(id, rest).await.map(|r| {
            println!("{} Rejected {} ({})", "OK".green(), r.id, r.task_id);
        }),
        ("pause", _) => handle.pause().await.map(|s| print_state(&s)),
        ("resume", _) => handle.resume().await.map(|s| print_state(&s)),
        ("status", _) => handle.state().await.map(|s| print_state(&s)),
        ("cancel", _) => handle.cancel_session().await.map(|id| {
            println!("{} Cancelled session {}", "OK".green(), id);
        }),
        ("approvals", _) => handle.pending_approvals().await.map(|pending| {
            if pending.is_empty() {
                println!("   No pending approvals");
            }
            for request in pending {
                println!(
                    "   {} {} {} - {}",
                    request.id.bold(),
                    request.action_type.to_string().yellow(),
                    request.task_id,
                    request.description
                );
            }
        }),
        _ => {
            print_help();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("{} {}", "Error:".red(), e);
        if matches!(e, ForemanError::ControllerUnavailable) {
            return false;
        }
    }
    true
}

fn print_event(event: &ControllerEvent) {
    match event {
        ControllerEvent::ApprovalRequested(request) => {
            println!(
                "{} {} needs approval: {}\n   approve {}",
                "Approval:".yellow().bold(),
                request.task_id,
                request.description,
                request.id
            );
        }
        ControllerEvent::TaskStarted { task_id, title, .. } => {
            println!("{} {} {}", "Task:".cyan(), task_id.bold(), title);
        }
        ControllerEvent::TaskCompleted { task_id, action, .. } => {
            println!("{} {} done ({})", "OK".green(), task_id, action);
        }
        ControllerEvent::TaskFailed {
            task_id,
            error,
            permanent,
            ..
        } => {
            let label = if *permanent { "Failed:" } else { "Retry:" };
            println!("{} {} {}", label.red(), task_id, error);
        }
        ControllerEvent::Status { status, reason, .. } => {
            println!("{} {} ({})", "Status:".cyan(), status, reason);
        }
        _ => {}
    }
}

fn print_state(state: &ControllerState) {
    println!("\n{} Controller State", "Foreman:".cyan().bold());
    println!("{}", "─".repeat(40));
    println!("   Status: {}", state.status);
    if let Some(task) = &state.current_task_id {
        println!("   Current task: {}", task);
    }
    println!(
        "   Processed: {}  Errors: {}  Approved: {}  Rejected: {}",
        state.processed_count, state.error_count, state.approved_count, state.rejected_count
    );
    println!(
        "   Tokens this hour: {} / {} ({})",
        state.token_usage.total(),
        state.usage_limit_config.max_tokens_per_hour,
        state.usage_limit_status
    );
    println!("   Pending approvals: {}", state.pending_approvals);
    if let Some(message) = &state.status_message {
        println!("   {}", message.dimmed());
    }
}

// ============================================================================
// tasks
// ============================================================================

async fn tasks_command(project_path: &Path, action: TasksAction) -> anyhow::Result<()> {
    let config = load_config(project_path)?;
    let store = JsonFileTaskStore::new(config.tasks_path(project_path));

    match action {
        TasksAction::List { json } => {
            let tasks = store.load()?;
            let now = Utc::now();
            let done = done_ids(&tasks);
            let rows: Vec<(&Task, Readiness)> = tasks
                .iter()
                .map(|t| (t, Readiness::of(t, &done, now)))
                .collect();

            if json {
                let value: Vec<serde_json::Value> = rows
                    .iter()
                    .map(|(task, readiness)| {
                        serde_json::json!({ "task": task, "readiness": readiness })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&value)?);
            } else if rows.is_empty() {
                println!("No tasks in {}", store.path().display());
            } else {
                println!("\n{} Tasks", "Foreman:".cyan().bold());
                println!("{}", "─".repeat(60));
                for (task, readiness) in rows {
                    let marker = if readiness.is_ready() {
                        readiness.to_string().green()
                    } else {
                        readiness.to_string().dimmed()
                    };
                    println!(
                        "   {:<12} {:<6} {:<40} {}",
                        task.id.bold(),
                        task.priority,
                        task.title,
                        marker
                    );
                }
            }
        }

        TasksAction::Next { json } => {
            let tasks = store.load()?;
            let next = select_next(&tasks, Utc::now());
            if json {
                println!("{}", serde_json::to_string_pretty(&next)?);
            } else {
                match next {
                    Some(task) => println!(
                        "{} {} {} ({})",
                        "Next:".cyan().bold(),
                        task.id.bold(),
                        task.title,
                        task.priority
                    ),
                    None => println!(
                        "{}",
                        foreman::task::summarize(&tasks, Utc::now()).idle_message()
                    ),
                }
            }
        }

        TasksAction::Sweep => {
            let changes = RetryScheduler::new(config.retry)
                .sweep_dependencies(&store)
                .await?;
            if changes.is_empty() {
                println!("{} No dependency changes", "OK".green());
            }
            for (id, status) in changes {
                println!("   {} -> {}", id.bold(), status);
            }
        }
    }
    Ok(())
}

// ============================================================================
// classify / config
// ============================================================================

fn classify_command(project_path: &Path, text: &str, json: bool) -> anyhow::Result<()> {
    let classification = load_config(project_path)?.classifier()?.classify_text(text);
    if json {
        println!("{}", serde_json::to_string_pretty(&classification)?);
    } else {
        let verdict = if classification.requires_approval {
            "requires approval".yellow().bold()
        } else {
            "auto".green()
        };
        println!("{} {}", classification.kind.to_string().bold(), verdict);
        println!("   {}", classification.description);
    }
    Ok(())
}

fn config_command(project_path: &Path, action: ConfigAction) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show { json } => {
            let loaded = ForemanConfig::load(project_path)?;
            let config = loaded.config;
            if json {
                println!("{}", serde_json::to_string_pretty(&config)?);
            } else {
                println!("\n{} Configuration", "Config:".cyan().bold());
                println!("{}", "─".repeat(40));
                println!("   Source: {}", loaded.source);
                println!("   Tasks file: {}", config.tasks_file.display());
                println!("   Tick interval: {}s", config.tick_interval_secs);
                println!("   Execution timeout: {}s", config.execution_timeout_secs);
                println!("   Approval expiry: {} min", config.approval_expiry_minutes);
                println!(
                    "   Token budget: {}/h, {}/day",
                    config.usage_limits.max_tokens_per_hour, config.usage_limits.max_tokens_per_day
                );
                println!(
                    "   Thresholds: warn {:.0}%, pause {:.0}%",
                    config.usage_limits.warning_threshold * 100.0,
                    config.usage_limits.pause_threshold * 100.0
                );
                println!(
                    "   Auto-approval: {}",
                    if config.auto_approval.enabled {
                        "enabled"
                    } else {
                        "disabled"
                    }
                );
                println!("   Agent: {}", config.agent.command);
            }
        }

        ConfigAction::Validate => {
            let loaded = ForemanConfig::load(project_path)
                .context("Configuration could not be loaded")?;
            let problems = loaded.config.problems();
            if problems.is_empty() {
                println!("{} {} is valid", "OK".green(), loaded.source);
            } else {
                for problem in &problems {
                    eprintln!("{} {}", "Error:".red(), problem);
                }
                return Err(ForemanError::invalid_config(
                    "config",
                    format!("{} problem(s) found", problems.len()),
                )
                .into());
            }
        }

        ConfigAction::Paths => {
            let locations = ConfigLocations::for_project(project_path);
            println!("\n{} Configuration Paths", "Config:".cyan().bold());
            println!("{}", "─".repeat(40));
            println!("   Project: {}", locations.project.display());
            match &locations.user {
                Some(path) => println!("   User: {}", path.display()),
                None => println!("   User: (no config directory)"),
            }
            println!(
                "   State: {}",
                StatePersistence::new(ForemanConfig::foreman_dir(project_path))
                    .state_file_path()
                    .display()
            );
            println!(
                "   Sessions: {}",
                ForemanConfig::sessions_dir(project_path).display()
            );
        }
    }
    Ok(())
}
