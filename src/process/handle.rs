use crate::config::ProcessSpec;
use crate::error::{Result, WardenError};
use crate::process::launcher::{ChildProcess, OutputReader, ProcessLauncher};
use crate::process::resources::ResourceSampler;
use crate::process::types::{ExitInfo, ResourceSnapshot};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How long to wait for confirmation after SIGKILL
pub const FORCE_KILL_GRACE: Duration = Duration::from_secs(2);

/// Granularity of exit polling while waiting on a deadline
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Result of a non-blocking liveness check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStatus {
    /// No process has been started, or its exit was already collected
    Idle,
    Running,
    Exited(ExitInfo),
}

/// Result of a successful stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopOutcome {
    /// Exit status of the stopped instance, `None` if nothing was running
    pub exit: Option<ExitInfo>,
    /// SIGKILL was needed because the grace period expired
    pub forced: bool,
}

/// Owns exactly one OS process instance
///
/// The child is dropped (releasing its pipes) as soon as its exit has been
/// observed, whether through `poll` or `stop`.
pub struct ProcessHandle {
    name: String,
    child: Option<Box<dyn ChildProcess>>,
    pid: Option<u32>,
    stdout: Option<OutputReader>,
    stderr: Option<OutputReader>,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("name", &self.name)
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

impl ProcessHandle {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            child: None,
            pid: None,
            stdout: None,
            stderr: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_attached(&self) -> bool {
        self.child.is_some()
    }

    /// Spawn the process described by `spec`
    ///
    /// Launch failures are returned as-is; retrying is left to the caller.
    pub fn start(&mut self, launcher: &dyn ProcessLauncher, spec: &ProcessSpec) -> Result<u32> {
        if self.is_attached() {
            return Err(WardenError::InvalidState(
                self.name.clone(),
                "handle already owns a live process".to_string(),
            ));
        }

        let mut child = launcher.launch(spec)?;
        let pid = child.id().ok_or_else(|| {
            WardenError::Launch(self.name.clone(), "no PID for spawned process".to_string())
        })?;

        self.stdout = child.take_stdout();
        self.stderr = child.take_stderr();
        self.child = Some(child);
        self.pid = Some(pid);

        debug!(process = %self.name, pid, "Process launched");

        Ok(pid)
    }

    /// Hand the captured output pipes to a consumer
    pub fn take_output(&mut self) -> (Option<OutputReader>, Option<OutputReader>) {
        (self.stdout.take(), self.stderr.take())
    }

    /// Non-blocking liveness check
    pub fn poll(&mut self) -> PollStatus {
        let Some(child) = self.child.as_mut() else {
            return PollStatus::Idle;
        };

        match child.try_wait() {
            Ok(Some(exit)) => {
                self.release();
                PollStatus::Exited(exit)
            }
            Ok(None) => PollStatus::Running,
            Err(e) => {
                warn!(process = %self.name, "Failed to query process status: {}", e);
                let exit = ExitInfo::unknown();
                self.release();
                PollStatus::Exited(exit)
            }
        }
    }

    /// Terminate gracefully, escalating to SIGKILL after `timeout`
    pub async fn stop(&mut self, timeout: Duration) -> Result<StopOutcome> {
        let name = self.name.clone();
        let Some(child) = self.child.as_mut() else {
            return Ok(StopOutcome {
                exit: None,
                forced: false,
            });
        };

        if let Some(exit) = try_reap(&name, &mut **child)? {
            self.release();
            return Ok(StopOutcome {
                exit: Some(exit),
                forced: false,
            });
        }

        info!(process = %name, pid = ?self.pid, "Sending graceful termination request");
        if let Err(e) = child.terminate() {
            warn!(process = %name, "Failed to send termination request: {}", e);
        }

        if let Some(exit) = wait_for_exit(&name, &mut **child, timeout).await? {
            info!(process = %name, "Process exited gracefully with {}", exit);
            self.release();
            return Ok(StopOutcome {
                exit: Some(exit),
                forced: false,
            });
        }

        warn!(
            process = %name,
            "Process did not exit within {:?}, sending SIGKILL",
            timeout
        );
        if let Err(e) = child.kill() {
            warn!(process = %name, "Failed to send SIGKILL: {}", e);
        }

        match wait_for_exit(&name, &mut **child, FORCE_KILL_GRACE).await? {
            Some(exit) => {
                self.release();
                Ok(StopOutcome {
                    exit: Some(exit),
                    forced: true,
                })
            }
            None => {
                // Dropping the child detaches it; the PID is reported as leaked
                self.release();
                Err(WardenError::ForceKill(name))
            }
        }
    }

    /// Best-effort CPU and memory sample for the attached process
    pub fn resource_snapshot(&self, sampler: &mut ResourceSampler) -> ResourceSnapshot {
        match self.pid {
            Some(pid) if self.is_attached() => sampler.sample(pid),
            _ => ResourceSnapshot::default(),
        }
    }

    fn release(&mut self) {
        self.child = None;
        self.pid = None;
        self.stdout = None;
        self.stderr = None;
    }
}

fn try_reap(name: &str, child: &mut dyn ChildProcess) -> Result<Option<ExitInfo>> {
    child
        .try_wait()
        .map_err(|e| WardenError::StopError(name.to_string(), format!("Wait failed: {}", e)))
}

/// Poll for exit until `timeout` elapses; `None` means still running
async fn wait_for_exit(
    name: &str,
    child: &mut dyn ChildProcess,
    timeout: Duration,
) -> Result<Option<ExitInfo>> {
    // `None` when the timeout is too large to represent: wait indefinitely
    let deadline = Instant::now().checked_add(timeout);

    loop {
        if let Some(exit) = try_reap(name, child)? {
            return Ok(Some(exit));
        }

        let pause = match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return Ok(None);
                }
                EXIT_POLL_INTERVAL.min(deadline - now)
            }
            None => EXIT_POLL_INTERVAL,
        };

        tokio::time::sleep(pause).await;
    }
}
