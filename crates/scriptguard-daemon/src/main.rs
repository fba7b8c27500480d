use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use scriptguard_core::{
    Clock, ExecutionId, FixedOffsetClock, ScriptGuardConfig, SharedClock, Task, TaskId,
};
use scriptguard_store::{LogFilter, SqliteStore, Store};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod app;
mod cleanup;
mod error;
mod notifier;
mod settings;

use app::App;
use cleanup::RetentionCleaner;
use error::AppError;
use notifier::WebhookKind;

/// ScriptGuard: run scripts on cron schedules, bounded and recorded.
#[derive(Parser)]
#[command(name = "scriptguard", version, about)]
struct Cli {
    /// Path to the TOML config file. Falls back to $SCRIPTGUARD_CONFIG,
    /// then ~/.scriptguard/scriptguard.toml.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler until Ctrl-C.
    Serve,

    /// Manage tasks.
    #[command(subcommand)]
    Task(TaskCommand),

    /// Run a task now and print the execution as JSON.
    Run { task_id: String },

    /// Show recent executions, newest first.
    Executions {
        #[arg(long)]
        task: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Show the log of one execution, or every entry of one task
    /// (including skipped firings).
    Logs {
        #[arg(required_unless_present = "task", conflicts_with = "task")]
        execution_id: Option<String>,
        #[arg(long)]
        task: Option<String>,
        #[arg(long, default_value_t = 500)]
        limit: usize,
    },

    /// Read or change runtime settings.
    #[command(subcommand)]
    Config(ConfigCommand),

    /// Send a test message to a notification webhook.
    NotifyTest {
        #[arg(value_enum)]
        target: WebhookKind,
        /// Use this URL instead of the configured one.
        #[arg(long)]
        webhook: Option<String>,
    },

    /// Purge history older than the retention period, then VACUUM.
    Cleanup,
}

#[derive(Subcommand)]
enum TaskCommand {
    List,
    Add(AddTask),
    Remove { id: String },
    Enable { id: String },
    Disable { id: String },
}

#[derive(Args)]
struct AddTask {
    #[arg(long)]
    name: String,
    #[arg(long)]
    script: String,
    /// Interpreter environment name.
    #[arg(long)]
    env: String,
    /// Six-field cron expression (sec min hour dom month dow). Repeatable.
    #[arg(long = "cron", required = true)]
    crons: Vec<String>,
    #[arg(long)]
    disabled: bool,
    #[arg(long)]
    no_notify: bool,
}

#[derive(Subcommand)]
enum ConfigCommand {
    Set { key: String, value: String },
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(
                "scriptguard=info,scriptguard_daemon=info,scriptguard_scheduler=info,\
                 scriptguard_runner=info,scriptguard_store=info",
            )
        }))
        .init();

    let cli = Cli::parse();

    // explicit path > SCRIPTGUARD_CONFIG env > ~/.scriptguard/scriptguard.toml
    let config_path = cli
        .config
        .map(|p| p.to_string_lossy().into_owned())
        .or_else(|| std::env::var("SCRIPTGUARD_CONFIG").ok());
    let config = ScriptGuardConfig::load(config_path.as_deref())?;

    let clock: SharedClock = Arc::new(FixedOffsetClock::from_offset_str(
        &config.scheduler.utc_offset,
    )?);
    info!(path = %config.database.path, "opening SQLite database");
    let store: Arc<dyn Store> = Arc::new(
        SqliteStore::open(&config.database.path, clock.clone())
            .with_context(|| format!("opening {}", config.database.path))?,
    );

    let app = Arc::new(App::new(config, store, clock)?);
    app.reload_runtime_config()?;

    match cli.command {
        Command::Serve => serve(app).await,
        Command::Task(cmd) => task_command(&app, cmd),
        Command::Run { task_id } => run_now(&app, task_id).await,
        Command::Executions { task, limit } => {
            let task = task.map(TaskId::from);
            let executions = app.list_executions(task.as_ref(), limit)?;
            println!("{}", serde_json::to_string_pretty(&executions)?);
            Ok(())
        }
        Command::Logs {
            execution_id,
            task,
            limit,
        } => {
            let execution_id = execution_id.map(ExecutionId::from);
            let task = task.map(TaskId::from);
            let filter = match (&execution_id, &task) {
                (Some(id), _) => LogFilter::Execution(id),
                (None, Some(id)) => LogFilter::Task(id),
                (None, None) => LogFilter::All,
            };
            for entry in app.list_logs(filter, limit)? {
                println!(
                    "{} [{}] {} {}",
                    scriptguard_core::format_timestamp(&entry.timestamp),
                    entry.level,
                    entry
                        .execution_id
                        .as_ref()
                        .map(|id| id.as_str())
                        .unwrap_or("-"),
                    entry.content
                );
            }
            Ok(())
        }
        Command::Config(ConfigCommand::Set { key, value }) => {
            app.update_config(&key, &value)?;
            println!("{key} = {}", value.trim());
            Ok(())
        }
        Command::Config(ConfigCommand::List) => {
            for (key, value) in app.all_config()? {
                println!("{key} = {value}");
            }
            Ok(())
        }
        Command::NotifyTest { target, webhook } => {
            app.notifier()
                .send_test(target, webhook.as_deref())
                .await?;
            println!("test notification sent");
            Ok(())
        }
        Command::Cleanup => {
            let cleaner = RetentionCleaner::new(
                app.store().clone(),
                app.clock().clone(),
                &app.config.logs.cleanup_cron,
            )?;
            let report = cleaner.run_once()?;
            app.store().vacuum()?;
            println!(
                "purged {} log entries and {} executions",
                report.logs, report.executions
            );
            Ok(())
        }
    }
}

async fn serve(app: Arc<App>) -> anyhow::Result<()> {
    app.load_tasks()?;

    let mut live = app.live().subscribe();
    tokio::spawn(async move {
        loop {
            match live.recv().await {
                Ok(msg) => debug!(
                    task_id = %msg.task_id,
                    execution_id = msg.execution_id.as_ref().map(|id| id.as_str()).unwrap_or("-"),
                    level = %msg.level,
                    "{}",
                    msg.content
                ),
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "live log subscriber lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let cleaner = RetentionCleaner::new(
        app.store().clone(),
        app.clock().clone(),
        &app.config.logs.cleanup_cron,
    )?;
    let cleanup = tokio::spawn(cleaner.run(shutdown_rx));

    info!(
        tasks = app.scheduler().scheduled_tasks().len(),
        capacity = app.gate().capacity(),
        timeout_secs = app.supervisor().timeout_secs(),
        "ScriptGuard running; press Ctrl-C to stop"
    );
    tokio::signal::ctrl_c().await?;
    info!("received Ctrl-C, shutting down");

    let _ = shutdown_tx.send(true);
    app.shutdown().await;
    let _ = cleanup.await;
    info!("shutdown complete");
    Ok(())
}

fn task_command(app: &App, cmd: TaskCommand) -> anyhow::Result<()> {
    match cmd {
        TaskCommand::List => {
            for task in app.list_tasks()? {
                println!(
                    "{}  {:<8} {:<24} {} [{}] env={}",
                    task.id,
                    if task.enabled { "enabled" } else { "disabled" },
                    task.name,
                    task.script_path,
                    task.cron_exprs.join(" | "),
                    task.env
                );
            }
        }
        TaskCommand::Add(add) => {
            let mut task = Task::new(add.name, add.script, add.env, add.crons, app.clock().now());
            task.enabled = !add.disabled;
            task.notify_on_failure = !add.no_notify;
            let task = app.create_task(task)?;
            println!("{}", task.id);
        }
        TaskCommand::Remove { id } => app.delete_task(&TaskId::from(id))?,
        TaskCommand::Enable { id } => {
            app.set_enabled(&TaskId::from(id), true)?;
        }
        TaskCommand::Disable { id } => {
            app.set_enabled(&TaskId::from(id), false)?;
        }
    }
    Ok(())
}

async fn run_now(app: &App, task_id: String) -> anyhow::Result<()> {
    match app.run_now(&TaskId::from(task_id)).await {
        Ok(execution) => {
            println!("{}", serde_json::to_string_pretty(&execution)?);
            Ok(())
        }
        Err(AppError::Dispatch(e)) => {
            // A finished run is printed even when it failed.
            if let Some(execution) = e.execution() {
                println!("{}", serde_json::to_string_pretty(execution)?);
            }
            Err(e.into())
        }
        Err(e) => Err(e.into()),
    }
}
