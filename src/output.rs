//! Output handling for supervised processes.
//!
//! Child output is read as raw bytes split on `\n`, stripped of ANSI escape codes
//! and decoded lossily, then forwarded as `Event::Output`. A line that is not
//! valid UTF-8 never ends the stream.

use std::time::Duration;

use serde::Serialize;
use strip_ansi_escapes::strip;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::events::Event;

/// How long to wait for output readers once their process has exited.
pub(crate) const READER_DRAIN: Duration = Duration::from_secs(2);

/// Indicates the source stream of a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    /// Standard Output.
    Stdout,
    /// Standard Error.
    Stderr,
    /// Notices written by the supervisor itself.
    System,
}

/// Turns one raw line into display text: drops the line terminator, strips ANSI
/// codes and replaces invalid UTF-8.
pub fn decode_line(bytes: &[u8]) -> String {
    let mut end = bytes.len();
    while end > 0 && matches!(bytes[end - 1], b'\n' | b'\r') {
        end -= 1;
    }
    let stripped = strip(&bytes[..end]);
    String::from_utf8_lossy(&stripped).into_owned()
}

/// Reads the next raw line into `buf`. Returns `false` at EOF or on a read error.
pub(crate) async fn read_raw_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> bool
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    matches!(reader.read_until(b'\n', buf).await, Ok(n) if n > 0)
}

/// Sends a supervisor-authored line for `project_key`.
pub fn notice(tx: &mpsc::UnboundedSender<Event>, project_key: &str, line: impl Into<String>) {
    let _ = tx.send(Event::Output {
        project_key: project_key.to_string(),
        line: line.into(),
        stream: StreamKind::System,
    });
}

/// Forwards every line of `reader` as output for `project_key` until EOF.
pub async fn forward_lines<R>(
    project_key: String,
    stream: StreamKind,
    reader: R,
    tx: mpsc::UnboundedSender<Event>,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    while read_raw_line(&mut reader, &mut buf).await {
        let _ = tx.send(Event::Output {
            project_key: project_key.clone(),
            line: decode_line(&buf),
            stream,
        });
    }
}

// Lets readers flush what a process wrote, without hanging on pipes inherited
// by stray grandchildren.
pub(crate) async fn drain(readers: Vec<JoinHandle<()>>) {
    for mut reader in readers {
        if tokio::time::timeout(READER_DRAIN, &mut reader).await.is_err() {
            reader.abort();
        }
    }
}
