//! Dependency bootstrap for projects without an installed dependency cache.
//!
//! Install output is relayed as ordinary output events for the project key.
//! Each attempt has a hard timeout; failed attempts are retried with a linear
//! backoff before the whole install is reported as failed.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::SupervisorPolicy;
use crate::events::Event;
use crate::output::{drain, forward_lines, notice, StreamKind};
use crate::package_manager::{self, ResolveError};
use crate::path_guard::MANIFEST_FILE;
use crate::process::{command_for, force_kill};

/// Installed-packages directory whose presence skips installation.
pub const DEPENDENCY_DIR: &str = "node_modules";

/// Why a single install attempt failed.
#[derive(Debug, Error)]
pub enum AttemptError {
    #[error("install timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("failed to spawn installer: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("installer exited with code {}", .0.map(|c| c.to_string()).unwrap_or_else(|| "none".into()))]
    Exit(Option<i32>),
    #[error("failed waiting for installer: {0}")]
    Wait(#[source] std::io::Error),
}

#[derive(Debug, Error)]
pub enum InstallError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error("dependency install failed after {attempts} attempt(s): {last_error}")]
    Failed {
        attempts: u32,
        #[source]
        last_error: AttemptError,
    },
}

/// Runs the project's package manager when dependencies are missing.
#[derive(Debug, Clone)]
pub struct DependencyInstaller {
    timeout: Duration,
    attempts: u32,
    backoff: Duration,
    event_tx: mpsc::UnboundedSender<Event>,
}

impl DependencyInstaller {
    pub fn new(policy: &SupervisorPolicy, event_tx: mpsc::UnboundedSender<Event>) -> Self {
        Self {
            timeout: policy.install_timeout,
            attempts: policy.install_attempts.max(1),
            backoff: policy.install_backoff,
            event_tx,
        }
    }

    /// Installs dependencies unless there is no manifest or the dependency
    /// directory already exists.
    ///
    /// `environment` is layered over the parent environment, as for the server.
    pub async fn ensure_installed(
        &self,
        project_key: &str,
        project_dir: &Path,
        environment: &BTreeMap<String, String>,
    ) -> Result<(), InstallError> {
        if !project_dir.join(MANIFEST_FILE).is_file() {
            return Ok(());
        }
        if project_dir.join(DEPENDENCY_DIR).is_dir() {
            return Ok(());
        }

        let manager = package_manager::detect(&project_dir.to_string_lossy());
        let command_line = package_manager::build_install_command(manager.as_str())?;
        info!(project = project_key, %manager, "installing missing dependencies");
        notice(
            &self.event_tx,
            project_key,
            format!(
                "{} not found, installing dependencies with {}...",
                DEPENDENCY_DIR, manager
            ),
        );
        notice(&self.event_tx, project_key, format!("running: {}", command_line));

        let argv: Vec<String> = command_line.split_whitespace().map(String::from).collect();
        self.run_with_retry(project_key, project_dir, environment, &argv)
            .await?;
        notice(
            &self.event_tx,
            project_key,
            "dependencies installed, starting project...",
        );
        Ok(())
    }

    // Retries `argv` up to `attempts` times, sleeping `backoff * attempt` between tries.
    pub(crate) async fn run_with_retry(
        &self,
        project_key: &str,
        dir: &Path,
        environment: &BTreeMap<String, String>,
        argv: &[String],
    ) -> Result<(), InstallError> {
        let mut attempt = 1;
        loop {
            let err = match self.run_once(project_key, dir, environment, argv).await {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };
            notice(&self.event_tx, project_key, format!("install failed: {}", err));
            if attempt >= self.attempts {
                return Err(InstallError::Failed {
                    attempts: attempt,
                    last_error: err,
                });
            }
            warn!(
                project = project_key,
                attempt,
                max = self.attempts,
                error = %err,
                "dependency install attempt failed, retrying"
            );
            tokio::time::sleep(self.backoff * attempt).await;
            attempt += 1;
        }
    }

    async fn run_once(
        &self,
        project_key: &str,
        dir: &Path,
        environment: &BTreeMap<String, String>,
        argv: &[String],
    ) -> Result<(), AttemptError> {
        let Some((program, args)) = argv.split_first() else {
            return Err(AttemptError::Exit(None));
        };
        let mut command = command_for(program, args);
        command.current_dir(dir).envs(environment);
        let mut child = command.spawn().map_err(AttemptError::Spawn)?;

        let mut readers: Vec<JoinHandle<()>> = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            let tx = self.event_tx.clone();
            readers.push(tokio::spawn(forward_lines(
                project_key.to_string(),
                StreamKind::Stdout,
                stdout,
                tx,
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            let tx = self.event_tx.clone();
            readers.push(tokio::spawn(forward_lines(
                project_key.to_string(),
                StreamKind::Stderr,
                stderr,
                tx,
            )));
        }

        let result = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(Ok(status)) if status.success() => Ok(()),
            Ok(Ok(status)) => Err(AttemptError::Exit(status.code())),
            Ok(Err(err)) => Err(AttemptError::Wait(err)),
            Err(_) => {
                if let Some(pid) = child.id() {
                    let _ = force_kill(pid);
                }
                let _ = child.kill().await;
                Err(AttemptError::Timeout(self.timeout))
            }
        };
        drain(readers).await;
        result
    }
}
