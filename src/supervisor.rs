//! Dev server lifecycle supervision.
//!
//! The `Supervisor` owns one child process per project key and drives it through
//! `Starting -> Running -> Stopped` (or `Error`). All bookkeeping lives in a single
//! lock-guarded registry. Background tasks (output readers, the exit monitor, the
//! startup timer and the stop watcher) only touch it through `Supervisor` methods.
//!
//! Every `start` gets a new generation number. Tasks belonging to an older
//! generation of the same key never mutate the newer record.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::join_all;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::command_guard;
use crate::config::SupervisorPolicy;
use crate::events::Event;
use crate::installer::{DependencyInstaller, InstallError};
use crate::launch::LaunchConfig;
use crate::output::{decode_line, drain, read_raw_line, StreamKind};
use crate::path_guard;
use crate::process::{command_for, force_kill, ProcessRecord, Status};
use crate::validation::FieldError;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("invalid project path: {0}")]
    InvalidPath(String),
    #[error("invalid launch configuration: {}", format_fields(.0))]
    InvalidConfig(Vec<FieldError>),
    #[error("{0}")]
    DependencyInstallFailed(#[from] InstallError),
    #[error("failed to spawn {program}: {source}")]
    SpawnError {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("superseded by a newer start of {0}")]
    Superseded(String),
    #[error("server is not running: {0}")]
    NotRunning(String),
    #[error("server is still running: {0}")]
    StillRunning(String),
}

fn format_fields(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(|e| format!("{}: {}", e.field, e.message))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Supervises dev server processes keyed by project.
///
/// Cloning is cheap; clones share the same registry and event channel.
#[derive(Clone)]
pub struct Supervisor {
    shared: Arc<Shared>,
    policy: SupervisorPolicy,
    installer: DependencyInstaller,
}

struct Shared {
    registry: Mutex<Registry>,
    event_tx: mpsc::UnboundedSender<Event>,
}

#[derive(Default)]
struct Registry {
    records: HashMap<String, Tracked>,
    handles: HashMap<String, Handle>,
    next_generation: u64,
}

struct Tracked {
    generation: u64,
    record: ProcessRecord,
}

// A live OS process. Removed once the exit monitor observes the exit, or by the
// stop watcher when the exit is never reported. Kills go through `kill_tx` to
// the monitor, which owns the unreaped child.
struct Handle {
    generation: u64,
    pid: u32,
    kill_tx: mpsc::UnboundedSender<()>,
    exit_rx: watch::Receiver<bool>,
}

impl Registry {
    fn is_current(&self, key: &str, generation: u64) -> bool {
        self.records
            .get(key)
            .map(|t| t.generation == generation)
            .unwrap_or(false)
    }

    fn has_handle(&self, key: &str, generation: u64) -> bool {
        self.handles
            .get(key)
            .map(|h| h.generation == generation)
            .unwrap_or(false)
    }
}

impl Supervisor {
    /// Creates a supervisor that reports through `event_tx`.
    pub fn new(policy: SupervisorPolicy, event_tx: mpsc::UnboundedSender<Event>) -> Self {
        let installer = DependencyInstaller::new(&policy, event_tx.clone());
        Self {
            shared: Arc::new(Shared {
                registry: Mutex::new(Registry::default()),
                event_tx,
            }),
            policy,
            installer,
        }
    }

    /// Starts the dev server for `project_key`.
    ///
    /// Inputs are validated before anything is touched. Returns as soon as the
    /// child is spawned, with the record in `Starting`; later transitions arrive
    /// as `StatusChanged` events.
    pub async fn start(
        &self,
        project_key: &str,
        project_path: &str,
        config: &LaunchConfig,
    ) -> Result<ProcessRecord, SupervisorError> {
        info!(project = project_key, path = project_path, "starting server");
        let project_dir = path_guard::check_project_path(project_path)
            .map_err(|e| SupervisorError::InvalidPath(e.to_string()))?;
        let validation = command_guard::validate(config);
        if !validation.valid {
            return Err(SupervisorError::InvalidConfig(validation.errors));
        }
        let argv = split_command(&config.command)?;
        let work_dir = path_guard::sanitize(&config.working_directory)
            .map_err(|e| SupervisorError::InvalidPath(e.to_string()))?;

        let generation = self.begin(project_key);

        if let Err(err) = self
            .installer
            .ensure_installed(project_key, &project_dir, &config.environment)
            .await
        {
            error!(project = project_key, error = %err, "dependency install failed");
            self.fail(project_key, generation, err.to_string());
            return Err(err.into());
        }

        let (program, args) = argv
            .split_first()
            .ok_or_else(|| invalid_command("command is empty"))?;
        let mut command = command_for(program, args);
        command.current_dir(&work_dir).envs(&config.environment);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(source) => {
                error!(project = project_key, %program, error = %source, "spawn failed");
                self.fail(project_key, generation, source.to_string());
                return Err(SupervisorError::SpawnError {
                    program: program.clone(),
                    source,
                });
            }
        };
        let pid = child.id().unwrap_or(0);
        debug!(project = project_key, pid, "process spawned");

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (kill_tx, kill_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(false);

        let record = {
            let mut registry = self.registry();
            if !registry.is_current(project_key, generation) {
                // The child is still owned here, so its pid cannot have been reused.
                if pid != 0 {
                    let _ = force_kill(pid);
                }
                return Err(SupervisorError::Superseded(project_key.to_string()));
            }
            registry.handles.insert(
                project_key.to_string(),
                Handle {
                    generation,
                    pid,
                    kill_tx,
                    exit_rx,
                },
            );
            let Some(tracked) = registry.records.get_mut(project_key) else {
                return Err(SupervisorError::Superseded(project_key.to_string()));
            };
            tracked.record.pid = pid;
            tracked.record.clone()
        };

        let mut readers: Vec<JoinHandle<()>> = Vec::new();
        if let Some(stdout) = stdout {
            readers.push(tokio::spawn(self.clone().read_output(
                project_key.to_string(),
                generation,
                StreamKind::Stdout,
                stdout,
            )));
        }
        if let Some(stderr) = stderr {
            readers.push(tokio::spawn(self.clone().read_output(
                project_key.to_string(),
                generation,
                StreamKind::Stderr,
                stderr,
            )));
        }
        tokio::spawn(self.clone().monitor(
            project_key.to_string(),
            generation,
            child,
            readers,
            kill_rx,
            exit_tx,
        ));
        tokio::spawn(self.clone().startup_timer(project_key.to_string(), generation));

        Ok(record)
    }

    /// Requests a forceful kill of the process tree and returns without waiting
    /// for the exit.
    ///
    /// A background watcher removes the handle once the exit is observed, or
    /// after the stop ceiling at the latest.
    pub async fn stop(&self, project_key: &str) -> Result<(), SupervisorError> {
        let (pid, generation, mut exit_rx) = {
            let registry = self.registry();
            let handle = registry
                .handles
                .get(project_key)
                .ok_or_else(|| SupervisorError::NotRunning(project_key.to_string()))?;
            let _ = handle.kill_tx.send(());
            (handle.pid, handle.generation, handle.exit_rx.clone())
        };
        info!(project = project_key, pid, "stopping server");

        let supervisor = self.clone();
        let key = project_key.to_string();
        let ceiling = self.policy.stop_ceiling;
        tokio::spawn(async move {
            let exited = tokio::time::timeout(ceiling, exit_rx.wait_for(|exited| *exited)).await;
            if exited.is_err() {
                warn!(project = %key, "process still present after stop ceiling, cleaning up");
                supervisor.finish(&key, generation, None);
            }
        });
        Ok(())
    }

    /// Stops every tracked key concurrently. Individual failures are logged.
    pub async fn stop_all(&self) {
        let keys = self.running_keys();
        let stops = keys.iter().map(|key| async move {
            if let Err(err) = self.stop(key).await {
                warn!(project = %key, error = %err, "failed to stop server");
            }
        });
        join_all(stops).await;
    }

    /// Current status of `project_key`; `Idle` when untracked.
    pub fn get_status(&self, project_key: &str) -> Status {
        self.registry()
            .records
            .get(project_key)
            .map(|t| t.record.status)
            .unwrap_or(Status::Idle)
    }

    /// Snapshot of the record for `project_key`.
    pub fn record(&self, project_key: &str) -> Option<ProcessRecord> {
        self.registry()
            .records
            .get(project_key)
            .map(|t| t.record.clone())
    }

    /// Keys that currently hold a live process handle.
    pub fn running_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.registry().handles.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Drops the record for a key removed from history.
    pub fn forget(&self, project_key: &str) -> Result<(), SupervisorError> {
        let mut registry = self.registry();
        if registry.handles.contains_key(project_key) {
            return Err(SupervisorError::StillRunning(project_key.to_string()));
        }
        registry.records.remove(project_key);
        Ok(())
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.shared
            .registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: Event) {
        let _ = self.shared.event_tx.send(event);
    }

    // Force-clears any previous state for the key and records a fresh `Starting`
    // attempt. Returns the new generation.
    fn begin(&self, key: &str) -> u64 {
        let mut registry = self.registry();
        if let Some(old) = registry.handles.remove(key) {
            warn!(project = key, pid = old.pid, "replacing active process");
            let _ = old.kill_tx.send(());
        }
        registry.next_generation += 1;
        let generation = registry.next_generation;
        registry.records.insert(
            key.to_string(),
            Tracked {
                generation,
                record: ProcessRecord::starting(key),
            },
        );
        self.emit(Event::StatusChanged {
            project_key: key.to_string(),
            status: Status::Starting,
        });
        generation
    }

    // Moves the record to `status`, emitting the change while still holding the
    // lock so per-key events stay ordered.
    fn transition(&self, registry: &mut Registry, key: &str, generation: u64, status: Status) -> bool {
        let Some(tracked) = registry.records.get_mut(key) else {
            return false;
        };
        if tracked.generation != generation || tracked.record.status == status {
            return false;
        }
        debug!(project = key, from = %tracked.record.status, to = %status, "status change");
        tracked.record.status = status;
        self.emit(Event::StatusChanged {
            project_key: key.to_string(),
            status,
        });
        true
    }

    fn fail(&self, key: &str, generation: u64, message: String) {
        let mut registry = self.registry();
        if self.transition(&mut registry, key, generation, Status::Error) {
            self.emit(Event::Error {
                project_key: key.to_string(),
                message,
            });
        }
    }

    // Clears the handle and marks the record stopped, once per generation.
    fn finish(&self, key: &str, generation: u64, code: Option<i32>) {
        let mut registry = self.registry();
        if registry.has_handle(key, generation) {
            registry.handles.remove(key);
        }
        if self.transition(&mut registry, key, generation, Status::Stopped) {
            self.emit(Event::Exited {
                project_key: key.to_string(),
                code,
            });
        }
    }

    // Promotes a still-starting record once its process has written anything.
    fn output_started(&self, key: &str, generation: u64) {
        let mut registry = self.registry();
        let starting = registry
            .records
            .get(key)
            .map(|t| t.record.status == Status::Starting)
            .unwrap_or(false);
        if starting {
            debug!(project = key, "first output received");
            self.transition(&mut registry, key, generation, Status::Running);
        }
    }

    async fn read_output<R>(self, key: String, generation: u64, stream: StreamKind, reader: R)
    where
        R: AsyncRead + Unpin,
    {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        let mut seen_output = false;
        loop {
            if !seen_output {
                match reader.fill_buf().await {
                    Ok(bytes) if !bytes.is_empty() => {}
                    _ => return,
                }
                seen_output = true;
                self.output_started(&key, generation);
            }
            if !read_raw_line(&mut reader, &mut buf).await {
                return;
            }
            let line = decode_line(&buf);
            let registry = self.registry();
            // Nothing is reported for a replaced or finished record.
            let accepting = registry
                .records
                .get(&key)
                .map(|t| t.generation == generation && !t.record.status.is_terminal())
                .unwrap_or(false);
            if !accepting {
                return;
            }
            self.emit(Event::Output {
                project_key: key.clone(),
                line,
                stream,
            });
        }
    }

    // Owns the child until it exits. Kill requests arrive on `kill_rx`; the
    // output readers are drained before the record is marked stopped.
    async fn monitor(
        self,
        key: String,
        generation: u64,
        mut child: Child,
        readers: Vec<JoinHandle<()>>,
        mut kill_rx: mpsc::UnboundedReceiver<()>,
        exit_tx: watch::Sender<bool>,
    ) {
        let status = loop {
            tokio::select! {
                status = child.wait() => break status,
                Some(()) = kill_rx.recv() => {
                    if let Some(pid) = child.id() {
                        if let Err(err) = force_kill(pid) {
                            warn!(project = %key, pid, error = %err, "kill failed, falling back to handle kill");
                            let _ = child.start_kill();
                        }
                    }
                }
            }
        };
        let code = match status {
            Ok(status) => status.code(),
            Err(err) => {
                warn!(project = %key, error = %err, "failed waiting for process");
                None
            }
        };
        info!(project = %key, ?code, "process exited");
        drain(readers).await;
        self.finish(&key, generation, code);
        let _ = exit_tx.send(true);
    }

    // After the silence window a still-starting process is promoted to `Running`
    // if alive, or marked `Error` if it is gone.
    async fn startup_timer(self, key: String, generation: u64) {
        tokio::time::sleep(self.policy.startup_timeout).await;
        let mut registry = self.registry();
        let starting = registry
            .records
            .get(&key)
            .map(|t| t.generation == generation && t.record.status == Status::Starting)
            .unwrap_or(false);
        if !starting {
            return;
        }
        if registry.has_handle(&key, generation) {
            debug!(project = %key, "no output within startup window, process alive");
            self.transition(&mut registry, &key, generation, Status::Running);
        } else {
            warn!(project = %key, "process gone before startup window elapsed");
            if self.transition(&mut registry, &key, generation, Status::Error) {
                self.emit(Event::Error {
                    project_key: key.clone(),
                    message: "process failed to start".to_string(),
                });
            }
        }
    }
}

fn invalid_command(message: &str) -> SupervisorError {
    SupervisorError::InvalidConfig(vec![FieldError {
        field: "command".to_string(),
        message: message.to_string(),
    }])
}

// Sanitizes the command and splits it into an argument vector.
fn split_command(command: &str) -> Result<Vec<String>, SupervisorError> {
    let sanitized =
        command_guard::sanitize_command(command).map_err(|e| invalid_command(&e.to_string()))?;
    if command_guard::is_dangerous(&sanitized) {
        return Err(invalid_command(
            "command contains a potentially dangerous operation",
        ));
    }
    let argv = shell_words::split(&sanitized)
        .map_err(|e| invalid_command(&format!("cannot parse command: {}", e)))?;
    if argv.is_empty() {
        return Err(invalid_command("command is empty"));
    }
    Ok(argv)
}
