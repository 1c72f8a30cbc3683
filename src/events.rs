//! Event definitions emitted by the supervisor.
//!
//! Events for one project key are sent in the order the OS delivered them;
//! nothing is guaranteed across keys.

use serde::Serialize;

use crate::output::StreamKind;
use crate::process::Status;

/// A notification about a supervised project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Event {
    /// A line of output with ANSI codes stripped.
    #[serde(rename_all = "camelCase")]
    Output {
        project_key: String,
        line: String,
        stream: StreamKind,
    },
    /// The project's status changed.
    #[serde(rename_all = "camelCase")]
    StatusChanged { project_key: String, status: Status },
    /// A process error, with a human-readable message.
    #[serde(rename_all = "camelCase")]
    Error { project_key: String, message: String },
    /// The process exited with an optional exit code (None usually implies signal termination).
    #[serde(rename_all = "camelCase")]
    Exited {
        project_key: String,
        code: Option<i32>,
    },
}

impl Event {
    /// The project key this event belongs to.
    pub fn project_key(&self) -> &str {
        match self {
            Event::Output { project_key, .. }
            | Event::StatusChanged { project_key, .. }
            | Event::Error { project_key, .. }
            | Event::Exited { project_key, .. } => project_key,
        }
    }
}
