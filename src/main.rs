//! devlaunch: starts and supervises local development servers.
//!
//! This is the entry point of the application. It parses command-line arguments,
//! loads configuration, and runs the event loop that prints supervisor events
//! until every launched server has stopped.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use chrono::{Local, Utc};
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use devlaunch::command_guard;
use devlaunch::config::{self, Config, SupervisorPolicy};
use devlaunch::events::Event;
use devlaunch::history::{self, HistoryEntry, HistoryStore};
use devlaunch::launch::{load_launch_config, LaunchConfig};
use devlaunch::output::StreamKind;
use devlaunch::path_guard;
use devlaunch::process::Status;
use devlaunch::supervisor::Supervisor;
use devlaunch::validation::ValidationResult;

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "devlaunch",
    version,
    about = "Start and supervise local development servers",
    styles = help_styles()
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Path to devlaunch.toml configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Ignore any devlaunch.toml in the current directory.
    #[arg(long, global = true)]
    no_config: bool,
    /// Enable debug logging.
    #[arg(short, long, global = true)]
    verbose: bool,
    /// Timeout for one dependency install attempt (seconds).
    #[arg(long, global = true)]
    install_timeout_secs: Option<u64>,
    /// Maximum number of dependency install attempts.
    #[arg(long, global = true)]
    install_attempts: Option<u32>,
    /// Silence window before a live server counts as running (seconds).
    #[arg(long, global = true)]
    startup_timeout_secs: Option<u64>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start the dev server of one or more projects.
    Run {
        /// Project directories.
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        /// Command to run instead of the detected one.
        #[arg(long)]
        command: Option<String>,
        /// Do not record the projects in history.
        #[arg(long)]
        no_history: bool,
    },
    /// Validate a project and its launch configuration without starting it.
    Check {
        path: PathBuf,
    },
    /// Inspect or edit the recently launched projects.
    History {
        #[command(subcommand)]
        action: HistoryAction,
    },
}

#[derive(Debug, Subcommand)]
enum HistoryAction {
    /// List recent projects, newest first.
    List,
    /// Remove one project by id.
    Remove { id: String },
    /// Remove every project.
    Clear,
}

/// Runtime configuration derived from CLI arguments and the config file.
#[derive(Debug, Clone)]
struct RunSettings {
    policy: SupervisorPolicy,
    history_path: Option<PathBuf>,
    max_history_entries: usize,
}

impl RunSettings {
    fn from_cli(cli: &Cli, config: &Config) -> Self {
        let layered = Config {
            install_timeout_secs: cli.install_timeout_secs.or(config.install_timeout_secs),
            install_attempts: cli.install_attempts.or(config.install_attempts),
            startup_timeout_secs: cli.startup_timeout_secs.or(config.startup_timeout_secs),
            ..config.clone()
        };
        Self {
            policy: layered.policy(),
            history_path: config
                .history_file
                .clone()
                .or_else(history::default_history_path),
            max_history_entries: config.max_history_entries(),
        }
    }

    fn history(&self) -> Result<HistoryStore> {
        let path = self
            .history_path
            .clone()
            .ok_or_else(|| anyhow!("cannot determine a location for the history file"))?;
        Ok(HistoryStore::new(path, self.max_history_entries))
    }
}

// A project resolved from the command line, ready to start.
struct Project {
    key: String,
    name: String,
    path: PathBuf,
    launch: LaunchConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let config = load_config(&cli)?;
    let settings = RunSettings::from_cli(&cli, &config);

    match cli.command {
        Commands::Run {
            paths,
            command,
            no_history,
        } => run(&paths, command.as_deref(), no_history, &settings).await,
        Commands::Check { path } => check(&path),
        Commands::History { action } => history_command(action, &settings),
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "devlaunch=debug" } else { "devlaunch=info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .init();
}

fn load_config(cli: &Cli) -> Result<Config> {
    if cli.no_config {
        return Ok(Config::default());
    }
    match cli.config.clone().or_else(config::default_config_path) {
        Some(path) => config::load_config(&path),
        None => Ok(Config::default()),
    }
}

async fn run(
    paths: &[PathBuf],
    command: Option<&str>,
    no_history: bool,
    settings: &RunSettings,
) -> Result<()> {
    let history = if no_history {
        None
    } else {
        match settings.history() {
            Ok(store) => Some(store),
            Err(err) => {
                warn!(error = %err, "history disabled");
                None
            }
        }
    };

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let supervisor = Supervisor::new(settings.policy, event_tx);
    let mut names: HashMap<String, String> = HashMap::new();
    let mut pending: HashSet<String> = HashSet::new();

    for path in paths {
        let project = resolve_project(path, command)?;
        names.insert(project.key.clone(), project.name.clone());
        if let Some(store) = &history {
            let entry = HistoryEntry {
                id: project.key.clone(),
                name: project.name.clone(),
                path: project.path.to_string_lossy().to_string(),
                last_launched_at: Utc::now(),
                config: project.launch.clone(),
            };
            if let Err(err) = store.upsert(entry) {
                warn!(error = %err, "failed to update project history");
            }
        }

        let raw_path = project.path.to_string_lossy();
        match supervisor.start(&project.key, &raw_path, &project.launch).await {
            Ok(record) => {
                debug!(project = %project.name, pid = record.pid, "launched");
                tool_message(
                    &project.name,
                    &format!("starting: {}", project.launch.command),
                );
                pending.insert(project.key);
            }
            Err(err) => tool_message(&project.name, &format!("failed to start: {}", err)),
        }
    }
    if pending.is_empty() {
        bail!("no project could be started");
    }

    let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
    spawn_signal_listener(shutdown_tx);
    let mut shutting_down = false;
    let mut failed = false;

    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => {
                let name = names
                    .get(event.project_key())
                    .map(String::as_str)
                    .unwrap_or("project");
                print_event(name, &event);
                match &event {
                    Event::StatusChanged { project_key, status } if status.is_terminal() => {
                        if *status == Status::Error {
                            failed = true;
                        }
                        pending.remove(project_key);
                    }
                    Event::Exited { code, .. } if !shutting_down && code.unwrap_or(1) != 0 => {
                        failed = true;
                    }
                    _ => {}
                }
                if pending.is_empty() {
                    break;
                }
            }
            Some(signal) = shutdown_rx.recv(), if !shutting_down => {
                shutting_down = true;
                eprintln!("{}", format_tool_message(&format!("received {}, stopping all servers", signal)));
                supervisor.stop_all().await;
            }
            else => break,
        }
    }

    if failed && !shutting_down {
        bail!("one or more servers failed");
    }
    Ok(())
}

fn resolve_project(path: &Path, command: Option<&str>) -> Result<Project> {
    let path = path_guard::sanitize(&path.to_string_lossy())
        .with_context(|| format!("invalid project path {}", path.display()))?;
    let dir = path.to_string_lossy().to_string();

    let mut launch = match load_launch_config(&path) {
        Ok(launch) => launch,
        Err(err) if command.is_some() => {
            debug!(path = %dir, error = %err, "no launch config, using --command");
            LaunchConfig::new("", dir.clone())
        }
        Err(err) => return Err(err),
    };
    if let Some(command) = command {
        launch.command = command.to_string();
    }

    let name = display_name(&launch, &path);
    Ok(Project {
        key: history::project_key(&path),
        name,
        path,
        launch,
    })
}

fn display_name(launch: &LaunchConfig, path: &Path) -> String {
    launch
        .display_name
        .clone()
        .filter(|name| !name.trim().is_empty())
        .or_else(|| path.file_name().map(|n| n.to_string_lossy().to_string()))
        .unwrap_or_else(|| "project".to_string())
}

fn check(path: &Path) -> Result<()> {
    let raw = path.to_string_lossy();
    let mut result = path_guard::validate_project_path(&raw);
    if result.valid {
        match load_launch_config(path) {
            Ok(launch) => merge(&mut result, command_guard::validate(&launch)),
            Err(err) => result.push("config", format!("{:#}", err)),
        }
    }
    println!("{}", serde_json::to_string_pretty(&result)?);
    if !result.valid {
        bail!("{}", result);
    }
    Ok(())
}

fn merge(into: &mut ValidationResult, other: ValidationResult) {
    for error in other.errors {
        into.push(&error.field, error.message);
    }
}

fn history_command(action: HistoryAction, settings: &RunSettings) -> Result<()> {
    let store = settings.history()?;
    match action {
        HistoryAction::List => {
            let entries = store.load();
            if entries.is_empty() {
                println!("no recent projects");
            }
            for entry in entries {
                let when = entry.last_launched_at.with_timezone(&Local);
                println!(
                    "{}  {}  {}  {}",
                    when.format("%Y-%m-%d %H:%M"),
                    entry.name,
                    entry.path,
                    entry.id
                );
            }
        }
        HistoryAction::Remove { id } => {
            if !store.remove(&id)? {
                bail!("no history entry with id {}", id);
            }
        }
        HistoryAction::Clear => store.clear()?,
    }
    Ok(())
}

fn spawn_signal_listener(tx: mpsc::Sender<&'static str>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(_) => return,
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    let _ = tx.send("SIGINT").await;
                }
                _ = sigterm.recv() => {
                    let _ = tx.send("SIGTERM").await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            let _ = tx.send("Ctrl-C").await;
        }
    });
}

fn print_event(name: &str, event: &Event) {
    match event {
        Event::Output { line, stream, .. } => match stream {
            StreamKind::Stdout => println!("[{}] {}", name, line),
            StreamKind::Stderr => eprintln!("[{}] {}", name, line),
            StreamKind::System => tool_message(name, line),
        },
        Event::StatusChanged { status, .. } => tool_message(name, &status.to_string()),
        Event::Error { message, .. } => tool_message(name, &format!("error: {}", message)),
        Event::Exited { code, .. } => {
            let line = match code {
                Some(0) => "process ended successfully".to_string(),
                Some(code) => format!("process ended with code {}", code),
                None => "process ended".to_string(),
            };
            tool_message(name, &line);
        }
    }
}

fn tool_message(name: &str, text: &str) {
    println!("[{}] {}", name, format_tool_message(text));
}

fn format_tool_message(text: &str) -> String {
    format!("◆ devlaunch: {}", text)
}

fn help_styles() -> Styles {
    Styles::styled()
        .header(
            Style::new()
                .fg_color(Some(AnsiColor::Cyan.into()))
                .effects(Effects::BOLD),
        )
        .usage(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .literal(Style::new().fg_color(Some(AnsiColor::Yellow.into())))
        .placeholder(Style::new().fg_color(Some(AnsiColor::Magenta.into())))
}
