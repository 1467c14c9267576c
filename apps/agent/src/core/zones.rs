use std::process::Stdio;

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::{debug, warn};

/// One line of zoneevent output: a zone lifecycle transition.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ZoneEvent {
    pub zonename: String,
    pub newstate: String,
}

impl ZoneEvent {
    /// The agent only reacts to the transitions that bracket a zone's
    /// networking lifetime.
    pub fn interesting(&self) -> bool {
        matches!(self.newstate.as_str(), "uninitialized" | "running")
    }
}

pub fn parse_line(line: &str) -> Option<ZoneEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str(line) {
        Ok(ev) => Some(ev),
        Err(err) => {
            debug!(%line, error = %err, "unparseable zoneevent line");
            None
        }
    }
}

/// A running zoneevent subprocess plus the stream of its parsed events.
/// Dropping the stream does not kill the child; call `stop`.
pub struct ZoneEventStream {
    child: Child,
    pub events: UnboundedReceiver<ZoneEvent>,
}

impl ZoneEventStream {
    pub fn spawn(path: &str) -> std::io::Result<Self> {
        let mut child = Command::new(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        let stdout = child.stdout.take().expect("stdout was piped");
        let (tx, events) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if let Some(ev) = parse_line(&line) {
                            if tx.send(ev).is_err() {
                                break;
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        warn!(error = %err, "zoneevent stream read failed");
                        break;
                    }
                }
            }
        });

        Ok(Self { child, events })
    }

    /// Signals the subprocess to terminate. A replacement stream spawns a
    /// fresh child.
    pub fn stop(&mut self) {
        if let Err(err) = self.child.start_kill() {
            debug!(error = %err, "zoneevent child already gone");
        }
    }
}
