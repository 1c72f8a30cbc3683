//! Data structures for tracking supervised process state.
//!
//! This module defines the lifecycle status of a project (`Status`) and the
//! record the supervisor keeps per project key (`ProcessRecord`), plus the
//! platform-specific pieces of building and killing child processes.

use std::fmt;
use std::process::Stdio;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::process::Command;

/// The current lifecycle status of a project's dev server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Not tracked (initial state).
    Idle,
    /// Spawn requested, no output seen yet.
    Starting,
    /// Producing output, or still alive after the startup window.
    Running,
    /// Process has exited or was stopped.
    Stopped,
    /// Process failed to start.
    Error,
}

impl Status {
    /// Whether a new `start` may reuse this key without tearing anything down.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Idle | Status::Stopped | Status::Error)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Status::Idle => "idle",
            Status::Starting => "starting",
            Status::Running => "running",
            Status::Stopped => "stopped",
            Status::Error => "error",
        };
        f.write_str(label)
    }
}

/// Supervisor-owned record of the latest launch attempt for a project key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessRecord {
    pub project_key: String,
    /// OS process id; `0` until the child is spawned.
    pub pid: u32,
    pub status: Status,
    pub started_at: DateTime<Utc>,
}

impl ProcessRecord {
    /// Creates a `Starting` record for a fresh launch attempt.
    pub fn starting(project_key: &str) -> Self {
        Self {
            project_key: project_key.to_string(),
            pid: 0,
            status: Status::Starting,
            started_at: Utc::now(),
        }
    }
}

/// Builds a command for an already-split argument vector, with stdin closed and
/// stdout/stderr piped.
///
/// No shell is involved on Unix, and the child leads its own process group so
/// `force_kill` reaches everything it starts. On Windows the program goes through
/// `cmd /C` so `.cmd` shims such as `npm.cmd` resolve.
pub(crate) fn command_for(program: &str, args: &[String]) -> Command {
    #[cfg(windows)]
    let mut command = {
        use windows_sys::Win32::System::Threading::CREATE_NEW_PROCESS_GROUP;
        let mut command = Command::new("cmd");
        command.arg("/C").arg(program).args(args);
        command.creation_flags(CREATE_NEW_PROCESS_GROUP);
        command
    };
    #[cfg(not(windows))]
    let mut command = {
        let mut command = Command::new(program);
        command.args(args);
        command
    };
    #[cfg(unix)]
    unsafe {
        command.pre_exec(|| {
            let _ = libc::setpgid(0, 0);
            Ok(())
        });
    }
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    command
}

/// Forcefully terminates `pid` and its descendants without waiting for them to
/// exit.
///
/// Windows only offers cooperative console signals, so the whole tree is killed
/// with `taskkill /T /F`. On Unix `SIGKILL` goes to the process group led by
/// `pid`, then to `pid` itself.
///
/// Callers must still own the unreaped child, otherwise `pid` may name an
/// unrelated process.
#[cfg(windows)]
pub(crate) fn force_kill(pid: u32) -> std::io::Result<()> {
    std::process::Command::new("taskkill")
        .args(["/pid", &pid.to_string(), "/T", "/F"])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map(|_| ())
}

#[cfg(unix)]
pub(crate) fn force_kill(pid: u32) -> std::io::Result<()> {
    let pid = pid as libc::pid_t;
    let group = unsafe { libc::kill(-pid, libc::SIGKILL) };
    let single = unsafe { libc::kill(pid, libc::SIGKILL) };
    if group == 0 || single == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(all(not(unix), not(windows)))]
pub(crate) fn force_kill(_pid: u32) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "no kill strategy for this platform",
    ))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Status::Running).unwrap(), "\"running\"");
        assert_eq!(Status::Error.to_string(), "error");
    }

    #[test]
    fn terminal_states() {
        assert!(Status::Idle.is_terminal());
        assert!(Status::Stopped.is_terminal());
        assert!(Status::Error.is_terminal());
        assert!(!Status::Starting.is_terminal());
        assert!(!Status::Running.is_terminal());
    }

    #[test]
    fn record_uses_camel_case() {
        let record = ProcessRecord::starting("p1");
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["projectKey"], "p1");
        assert_eq!(json["status"], "starting");
        assert!(json.get("startedAt").is_some());
    }

    // Running and not a zombie.
    #[cfg(target_os = "linux")]
    pub(crate) fn alive(pid: u32) -> bool {
        std::fs::read_to_string(format!("/proc/{pid}/stat"))
            .ok()
            .and_then(|stat| {
                stat.rsplit_once(')')
                    .map(|(_, rest)| !rest.trim_start().starts_with('Z'))
            })
            .unwrap_or(false)
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn force_kill_reaches_the_whole_group() {
        use tokio::io::{AsyncBufReadExt, BufReader};

        let mut child = command_for(
            "sh",
            &["-c".to_string(), "sleep 30 & echo $!; wait".to_string()],
        )
        .spawn()
        .unwrap();
        let pid = child.id().unwrap();
        let pgid = unsafe { libc::getpgid(pid as libc::pid_t) };
        assert_eq!(pgid, pid as libc::pid_t);

        let mut lines = BufReader::new(child.stdout.take().unwrap()).lines();
        let background: u32 = lines.next_line().await.unwrap().unwrap().parse().unwrap();
        assert!(alive(background));

        force_kill(pid).unwrap();
        let status = child.wait().await.unwrap();
        assert!(!status.success());
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert!(!alive(background), "background sleep survived");
    }
}
