// Signal routing - turns SIGINT/SIGTERM into one orderly supervisor shutdown

use crate::error::{Result, WardenError};
use crate::process::handle::FORCE_KILL_GRACE;
use crate::process::{ProcessErrors, ProcessState, Supervisor};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Extra time granted to `stop_all` beyond the stop and kill grace periods
const SHUTDOWN_SLACK: Duration = Duration::from_secs(1);

/// Exit status of a child that was killed with SIGKILL
const SIGKILL: i32 = 9;

/// Termination requests the router reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
}

impl ShutdownSignal {
    pub fn number(self) -> i32 {
        match self {
            ShutdownSignal::Interrupt => 2,
            ShutdownSignal::Terminate => 15,
        }
    }
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownSignal::Interrupt => write!(f, "SIGINT"),
            ShutdownSignal::Terminate => write!(f, "SIGTERM"),
        }
    }
}

/// What happened during a shutdown
#[derive(Debug)]
pub struct ShutdownReport {
    /// Signal that triggered the shutdown, `None` when every process finished on its own
    pub signal: Option<ShutdownSignal>,
    pub errors: ProcessErrors,
    /// Names of processes that ignored SIGTERM and had to be killed
    pub forced: Vec<String>,
    /// `stop_all` did not return within its deadline
    pub timed_out: bool,
    /// Bound that was applied to `stop_all`
    pub deadline: Duration,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty() && self.forced.is_empty() && !self.timed_out
    }

    /// 0 for a clean shutdown, `128 + signal` otherwise
    pub fn exit_code(&self) -> i32 {
        if self.is_clean() {
            return 0;
        }
        match self.signal {
            Some(signal) => 128 + signal.number(),
            None => 1,
        }
    }
}

/// Routes external termination signals to `Supervisor::stop_all`
///
/// Only the first request triggers a shutdown. Later ones are logged and
/// dropped while the first is still stopping processes.
#[derive(Debug)]
pub struct SignalRouter {
    supervisor: Arc<Supervisor>,
    fired: AtomicBool,
    stop_timeout: Duration,
}

impl SignalRouter {
    /// `stop_timeout` caps the SIGTERM grace period of every process
    pub fn new(supervisor: Arc<Supervisor>, stop_timeout: Duration) -> Self {
        Self {
            supervisor,
            fired: AtomicBool::new(false),
            stop_timeout,
        }
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Upper bound on one complete `stop_all` when the longest grace
    /// period among live processes is `longest_grace`
    pub fn deadline(&self, longest_grace: Duration) -> Duration {
        longest_grace
            .min(self.stop_timeout)
            .saturating_add(FORCE_KILL_GRACE)
            .saturating_add(SHUTDOWN_SLACK)
    }

    /// Wait for SIGINT or SIGTERM, then shut the supervisor down
    pub async fn run(&self) -> Result<ShutdownReport> {
        self.run_until(std::future::pending::<()>()).await
    }

    /// Like `run`, but also shuts down cleanly once `done` resolves
    pub async fn run_until<F>(&self, done: F) -> Result<ShutdownReport>
    where
        F: Future<Output = ()>,
    {
        let mut listener = SignalListener::new()?;

        let signal = tokio::select! {
            signal = listener.recv() => {
                info!("Received {}, shutting down", signal);
                Some(signal)
            }
            _ = done => {
                info!("All processes finished, shutting down");
                None
            }
        };

        let shutdown = self.shutdown(signal);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                report = &mut shutdown => {
                    return report.ok_or(WardenError::ShuttingDown);
                }
                repeat = listener.recv() => {
                    warn!("Received {} while already shutting down, ignoring", repeat);
                }
            }
        }
    }

    /// Stop everything once; returns `None` if a shutdown already ran
    pub async fn shutdown(&self, signal: Option<ShutdownSignal>) -> Option<ShutdownReport> {
        if self.fired.swap(true, Ordering::SeqCst) {
            warn!("Shutdown already in progress");
            return None;
        }

        let longest_grace = self
            .supervisor
            .longest_stop_timeout()
            .await
            .unwrap_or(Duration::ZERO);
        let deadline = self.deadline(longest_grace);
        let (errors, timed_out) =
            match tokio::time::timeout(deadline, self.supervisor.stop_all(self.stop_timeout)).await
            {
                Ok(errors) => (errors, false),
                Err(_) => {
                    error!("Shutdown did not finish within {:?}", deadline);
                    (Vec::new(), true)
                }
            };

        for (name, e) in &errors {
            error!(process = %name, "Failed to stop during shutdown: {}", e);
        }

        let forced = self
            .supervisor
            .status()
            .await
            .into_iter()
            .filter(|record| {
                record.force_kill_failed
                    || (record.state == ProcessState::Stopped && record.exit_signal == Some(SIGKILL))
            })
            .map(|record| record.spec.name)
            .collect();

        let report = ShutdownReport {
            signal,
            errors,
            forced,
            timed_out,
            deadline,
        };

        if report.is_clean() {
            info!("Shutdown complete");
        } else {
            warn!("Shutdown finished with exit code {}", report.exit_code());
        }

        Some(report)
    }
}

struct SignalListener {
    #[cfg(unix)]
    interrupt: tokio::signal::unix::Signal,
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
}

impl SignalListener {
    #[cfg(unix)]
    fn new() -> Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        let interrupt = signal(SignalKind::interrupt())
            .map_err(|e| WardenError::SignalError(format!("Failed to install SIGINT handler: {}", e)))?;
        let terminate = signal(SignalKind::terminate())
            .map_err(|e| WardenError::SignalError(format!("Failed to install SIGTERM handler: {}", e)))?;

        Ok(Self {
            interrupt,
            terminate,
        })
    }

    #[cfg(not(unix))]
    fn new() -> Result<Self> {
        Ok(Self {})
    }

    #[cfg(unix)]
    async fn recv(&mut self) -> ShutdownSignal {
        tokio::select! {
            _ = self.interrupt.recv() => ShutdownSignal::Interrupt,
            _ = self.terminate.recv() => ShutdownSignal::Terminate,
        }
    }

    #[cfg(not(unix))]
    async fn recv(&mut self) -> ShutdownSignal {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
        ShutdownSignal::Interrupt
    }
}
