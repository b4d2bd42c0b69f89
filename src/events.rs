// Structured supervisor events and the reporter seam that receives them

use crate::process::launcher::OutputReader;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Lifecycle events emitted by the supervisor
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SupervisorEvent {
    Started {
        name: String,
        pid: u32,
    },
    Terminated {
        name: String,
        exit_code: Option<i32>,
        signal: Option<i32>,
    },
    RestartScheduled {
        name: String,
        attempt: u32,
        delay: Duration,
    },
    RestartExhausted {
        name: String,
    },
    StopTimedOut {
        name: String,
    },
}

impl SupervisorEvent {
    pub fn name(&self) -> &str {
        match self {
            SupervisorEvent::Started { name, .. }
            | SupervisorEvent::Terminated { name, .. }
            | SupervisorEvent::RestartScheduled { name, .. }
            | SupervisorEvent::RestartExhausted { name }
            | SupervisorEvent::StopTimedOut { name } => name,
        }
    }
}

impl std::fmt::Display for SupervisorEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupervisorEvent::Started { name, pid } => write!(f, "{} started (pid {})", name, pid),
            SupervisorEvent::Terminated {
                name,
                exit_code,
                signal,
            } => match (exit_code, signal) {
                (Some(code), _) => write!(f, "{} exited with code {}", name, code),
                (None, Some(signal)) => write!(f, "{} killed by signal {}", name, signal),
                (None, None) => write!(f, "{} terminated", name),
            },
            SupervisorEvent::RestartScheduled {
                name,
                attempt,
                delay,
            } => write!(f, "{} restart #{} in {:?}", name, attempt, delay),
            SupervisorEvent::RestartExhausted { name } => {
                write!(f, "{} exhausted its restart budget", name)
            }
            SupervisorEvent::StopTimedOut { name } => {
                write!(f, "{} ignored the stop request and was killed", name)
            }
        }
    }
}

/// Which pipe a forwarded output line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl std::fmt::Display for OutputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputStream::Stdout => write!(f, "stdout"),
            OutputStream::Stderr => write!(f, "stderr"),
        }
    }
}

/// Receives supervisor events and child output; formatting and persistence
/// are the reporter's business.
pub trait Reporter: Send + Sync {
    fn report(&self, event: &SupervisorEvent);

    fn output(&self, name: &str, stream: OutputStream, line: &str) {
        debug!(target: "warden::output", process = name, %stream, "{}", line);
    }
}

/// Reporter that writes every event through `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn report(&self, event: &SupervisorEvent) {
        match event {
            SupervisorEvent::Started { name, pid } => {
                info!(process = %name, pid, "Process started");
            }
            SupervisorEvent::Terminated {
                name,
                exit_code,
                signal,
            } => {
                info!(process = %name, ?exit_code, ?signal, "Process terminated");
            }
            SupervisorEvent::RestartScheduled {
                name,
                attempt,
                delay,
            } => {
                warn!(process = %name, attempt, ?delay, "Restart scheduled");
            }
            SupervisorEvent::RestartExhausted { name } => {
                error!(process = %name, "Restart budget exhausted, giving up");
            }
            SupervisorEvent::StopTimedOut { name } => {
                warn!(process = %name, "Stop timed out, process was force killed");
            }
        }
    }

    fn output(&self, name: &str, stream: OutputStream, line: &str) {
        info!(target: "warden::output", process = name, %stream, "{}", line);
    }
}

/// Reporter that forwards events into an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelReporter {
    events: mpsc::UnboundedSender<SupervisorEvent>,
}

impl ChannelReporter {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SupervisorEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (Self { events }, rx)
    }
}

impl Reporter for ChannelReporter {
    fn report(&self, event: &SupervisorEvent) {
        // A dropped receiver just means nobody is listening anymore
        let _ = self.events.send(event.clone());
    }
}

/// Drain one output pipe line by line into the reporter
///
/// The task ends when the pipe reaches EOF, which happens once every holder
/// of the write end (normally just the child) has exited.
pub(crate) fn forward_output(
    name: String,
    stream: OutputStream,
    reader: OutputReader,
    reporter: Arc<dyn Reporter>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => reporter.output(&name, stream, &line),
                Ok(None) => break,
                Err(e) => {
                    debug!(process = %name, %stream, "Output stream closed: {}", e);
                    break;
                }
            }
        }
    })
}
