use crate::config::ProcessSpec;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};

/// Lifecycle state of a supervised process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessState {
    Pending,
    Running,
    Completed,
    Failed,
    Stopping,
    Stopped,
}

impl ProcessState {
    /// `Completed`, `Stopped` and `Failed` never change without outside help
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProcessState::Completed | ProcessState::Stopped | ProcessState::Failed
        )
    }

    /// States in which an OS process is attached to the record
    pub fn is_live(self) -> bool {
        matches!(self, ProcessState::Running | ProcessState::Stopping)
    }
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessState::Pending => write!(f, "pending"),
            ProcessState::Running => write!(f, "running"),
            ProcessState::Completed => write!(f, "completed"),
            ProcessState::Failed => write!(f, "failed"),
            ProcessState::Stopping => write!(f, "stopping"),
            ProcessState::Stopped => write!(f, "stopped"),
        }
    }
}

/// How an OS process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExitInfo {
    /// Exit code, absent when the process died from a signal
    pub code: Option<i32>,
    /// Terminating signal number (unix only)
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn from_code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn from_signal(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    /// Exit status could not be collected
    pub fn unknown() -> Self {
        Self::default()
    }

    /// Only a clean exit with code 0 counts as success
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<std::process::ExitStatus> for ExitInfo {
    fn from(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            Self {
                code: status.code(),
                signal: status.signal(),
            }
        }
        #[cfg(not(unix))]
        {
            Self {
                code: status.code(),
                signal: None,
            }
        }
    }
}

impl std::fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(signal)) => write!(f, "signal {}", signal),
            (None, None) => write!(f, "unknown status"),
        }
    }
}

/// Point-in-time resource usage of one process
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    /// CPU usage in percent of one core
    pub cpu_usage: f32,
    /// Resident memory in bytes
    pub memory_bytes: u64,
    pub sampled_at: SystemTime,
}

impl ResourceSnapshot {
    /// True for the zero value returned when no data was available
    pub fn is_empty(&self) -> bool {
        self.sampled_at == SystemTime::UNIX_EPOCH
    }
}

impl Default for ResourceSnapshot {
    fn default() -> Self {
        Self {
            cpu_usage: 0.0,
            memory_bytes: 0,
            sampled_at: SystemTime::UNIX_EPOCH,
        }
    }
}

/// Supervisor-owned state of one managed process across restarts
///
/// Callers only ever receive clones of this struct.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub spec: ProcessSpec,
    pub state: ProcessState,
    pub pid: Option<u32>,
    pub started_at: Option<SystemTime>,
    pub exit_code: Option<i32>,
    pub exit_signal: Option<i32>,
    pub restart_count: u32,
    pub last_resource_snapshot: Option<ResourceSnapshot>,
    /// A delayed relaunch is scheduled for this record
    pub restart_pending: bool,
    /// An explicit stop was requested; no automatic restart may follow
    pub stop_requested: bool,
    /// The last instance survived SIGKILL and may still be alive
    pub force_kill_failed: bool,
}

impl ProcessRecord {
    pub fn new(spec: ProcessSpec) -> Self {
        Self {
            spec,
            state: ProcessState::Pending,
            pid: None,
            started_at: None,
            exit_code: None,
            exit_signal: None,
            restart_count: 0,
            last_resource_snapshot: None,
            restart_pending: false,
            stop_requested: false,
            force_kill_failed: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Registered but never launched, and no relaunch is queued
    pub fn is_idle(&self) -> bool {
        self.state == ProcessState::Pending && !self.restart_pending
    }

    pub fn uptime(&self) -> Option<Duration> {
        if !self.state.is_live() {
            return None;
        }
        self.started_at.map(|started| {
            SystemTime::now()
                .duration_since(started)
                .unwrap_or(Duration::from_secs(0))
        })
    }

    pub(crate) fn mark_running(&mut self, pid: u32) {
        self.state = ProcessState::Running;
        self.pid = Some(pid);
        self.started_at = Some(SystemTime::now());
        self.exit_code = None;
        self.exit_signal = None;
        self.last_resource_snapshot = None;
        self.restart_pending = false;
    }

    pub(crate) fn mark_stopping(&mut self) {
        self.state = ProcessState::Stopping;
        self.stop_requested = true;
    }

    pub(crate) fn mark_exited(&mut self, exit: ExitInfo) {
        self.state = if exit.success() {
            ProcessState::Completed
        } else {
            ProcessState::Failed
        };
        self.pid = None;
        self.exit_code = exit.code;
        self.exit_signal = exit.signal;
    }

    pub(crate) fn mark_launch_failed(&mut self) {
        self.state = ProcessState::Failed;
        self.pid = None;
        self.exit_code = None;
        self.exit_signal = None;
        self.restart_pending = false;
    }

    pub(crate) fn mark_stopped(&mut self, exit: Option<ExitInfo>) {
        self.state = ProcessState::Stopped;
        self.pid = None;
        self.restart_pending = false;
        self.stop_requested = true;
        if let Some(exit) = exit {
            self.exit_code = exit.code;
            self.exit_signal = exit.signal;
        }
    }

    /// The stop sequence itself failed; the instance is dropped (and killed
    /// on drop) but the record is not flagged as leaked
    pub(crate) fn mark_stop_failed(&mut self) {
        self.state = ProcessState::Failed;
        self.pid = None;
        self.restart_pending = false;
        self.stop_requested = true;
    }

    pub(crate) fn mark_force_kill_failed(&mut self) {
        self.mark_stop_failed();
        self.force_kill_failed = true;
    }

    pub(crate) fn schedule_restart(&mut self) {
        self.restart_count += 1;
        self.state = ProcessState::Pending;
        self.restart_pending = true;
    }

    pub(crate) fn record_snapshot(&mut self, snapshot: ResourceSnapshot) {
        if !snapshot.is_empty() {
            self.last_resource_snapshot = Some(snapshot);
        }
    }
}
