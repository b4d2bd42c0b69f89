use crate::config::{ProcessSpec, SupervisorSettings};
use crate::error::{Result, WardenError};
use crate::events::{forward_output, OutputStream, Reporter, SupervisorEvent, TracingReporter};
use crate::process::handle::ProcessHandle;
use crate::process::launcher::{OsLauncher, ProcessLauncher};
use crate::process::monitor::Monitor;
use crate::process::restart::{RestartDecision, RestartPolicy};
use crate::process::types::{ProcessRecord, ProcessState};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Per-record failures collected by the bulk operations
pub type ProcessErrors = Vec<(String, WardenError)>;

/// Registry slot: the record plus the handle of its current instance
pub(crate) struct Entry {
    pub(crate) record: ProcessRecord,
    pub(crate) handle: Option<Arc<Mutex<ProcessHandle>>>,
}

/// State shared between the supervisor, the monitor task and restart tasks
pub(crate) struct Shared {
    pub(crate) registry: RwLock<HashMap<String, Entry>>,
    pub(crate) launcher: Arc<dyn ProcessLauncher>,
    pub(crate) reporter: Arc<dyn Reporter>,
    pub(crate) policy: RestartPolicy,
    pub(crate) settings: SupervisorSettings,
    /// Raised once by `stop_all`; freezes restart scheduling
    pub(crate) shutdown: watch::Sender<bool>,
    /// Bumped on every state change so waiters can re-check
    pub(crate) changes: watch::Sender<u64>,
    /// Set if the monitor task died before shutdown
    pub(crate) monitor_failed: AtomicBool,
}

impl Shared {
    pub(crate) fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub(crate) fn is_monitor_failed(&self) -> bool {
        self.monitor_failed.load(Ordering::SeqCst)
    }

    pub(crate) fn emit(&self, event: SupervisorEvent) {
        self.reporter.report(&event);
    }

    pub(crate) fn notify_changed(&self) {
        self.changes.send_modify(|generation| *generation = generation.wrapping_add(1));
    }

    /// Launch a fresh instance into `entry` and wire its output to the reporter
    fn launch_into(&self, entry: &mut Entry) -> Result<u32> {
        let name = entry.record.spec.name.clone();
        let mut handle = ProcessHandle::new(name.clone());
        let pid = handle.start(self.launcher.as_ref(), &entry.record.spec)?;

        let (stdout, stderr) = handle.take_output();
        if let Some(stdout) = stdout {
            forward_output(
                name.clone(),
                OutputStream::Stdout,
                stdout,
                Arc::clone(&self.reporter),
            );
        }
        if let Some(stderr) = stderr {
            forward_output(
                name.clone(),
                OutputStream::Stderr,
                stderr,
                Arc::clone(&self.reporter),
            );
        }

        entry.record.mark_running(pid);
        entry.handle = Some(Arc::new(Mutex::new(handle)));
        self.emit(SupervisorEvent::Started { name, pid });

        Ok(pid)
    }

    /// Apply the restart policy to a record that just failed
    ///
    /// Returns the delay of an approved relaunch; the caller schedules it once
    /// the registry lock is released.
    pub(crate) fn after_failure(&self, entry: &mut Entry) -> Option<Duration> {
        let name = entry.record.spec.name.clone();

        match self.policy.should_restart(&entry.record) {
            RestartDecision::Restart { attempt, delay } => {
                entry.record.schedule_restart();
                self.emit(SupervisorEvent::RestartScheduled {
                    name,
                    attempt,
                    delay,
                });
                Some(delay)
            }
            RestartDecision::Exhausted => {
                self.emit(SupervisorEvent::RestartExhausted { name });
                None
            }
            RestartDecision::NotEligible => None,
        }
    }

    /// Relaunch `name` after `delay` unless shutdown starts first
    pub(crate) fn schedule_restart(self: &Arc<Self>, name: String, delay: Duration) {
        let shared = Arc::clone(self);

        tokio::spawn(async move {
            let mut shutdown = shared.shutdown.subscribe();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = async { let _ = shutdown.wait_for(|stopping| *stopping).await; } => {
                    debug!(process = %name, "Shutdown started, dropping scheduled restart");
                    return;
                }
            }

            shared.relaunch(&name).await;
        });
    }

    async fn relaunch(self: &Arc<Self>, name: &str) {
        let retry = {
            let mut registry = self.registry.write().await;

            // Checked under the registry lock so stop_all's sweep sees either
            // a running instance or a still-pending record
            if self.is_shutting_down() {
                return;
            }

            let Some(entry) = registry.get_mut(name) else {
                debug!(process = %name, "Record removed before its restart");
                return;
            };

            if entry.record.state != ProcessState::Pending
                || !entry.record.restart_pending
                || entry.record.stop_requested
            {
                return;
            }

            let retry = match self.launch_into(entry) {
                Ok(pid) => {
                    info!(
                        process = %name,
                        pid,
                        restart = entry.record.restart_count,
                        "Process relaunched"
                    );
                    None
                }
                Err(e) => {
                    error!(process = %name, "Relaunch failed: {}", e);
                    entry.record.mark_launch_failed();
                    self.after_failure(entry)
                }
            };

            self.notify_changed();
            retry
        };

        if let Some(delay) = retry {
            self.schedule_restart(name.to_string(), delay);
        }
    }

    /// Stop one instance and settle its record
    async fn finish_stop(
        &self,
        name: &str,
        handle: Arc<Mutex<ProcessHandle>>,
        timeout: Duration,
    ) -> Result<()> {
        let outcome = {
            let mut guard = handle.lock().await;
            guard.stop(timeout).await
        };

        let mut registry = self.registry.write().await;
        let Some(entry) = registry.get_mut(name) else {
            return outcome.map(|_| ());
        };

        // A concurrent stop of the same instance already settled the record
        let current = entry
            .handle
            .as_ref()
            .is_some_and(|h| Arc::ptr_eq(h, &handle));
        if !current {
            return outcome.map(|_| ());
        }
        entry.handle = None;

        let result = match outcome {
            Ok(outcome) => {
                if outcome.forced {
                    self.emit(SupervisorEvent::StopTimedOut {
                        name: name.to_string(),
                    });
                }
                if let Some(exit) = outcome.exit {
                    self.emit(SupervisorEvent::Terminated {
                        name: name.to_string(),
                        exit_code: exit.code,
                        signal: exit.signal,
                    });
                }
                entry.record.mark_stopped(outcome.exit);
                info!(process = %name, "Process stopped");
                Ok(())
            }
            Err(e @ WardenError::ForceKill(_)) => {
                self.emit(SupervisorEvent::StopTimedOut {
                    name: name.to_string(),
                });
                entry.record.mark_force_kill_failed();
                error!(process = %name, "Process survived SIGKILL, treating its PID as leaked");
                Err(e)
            }
            Err(e) => {
                entry.record.mark_stop_failed();
                error!(process = %name, "Failed to stop process: {}", e);
                Err(e)
            }
        };

        drop(registry);
        self.notify_changed();
        result
    }

    /// Every record is settled: terminal, or idle without a queued restart
    async fn all_settled(&self) -> bool {
        let registry = self.registry.read().await;
        registry
            .values()
            .all(|entry| entry.record.state.is_terminal() || entry.record.is_idle())
    }
}

/// Registry of named processes with background monitoring and restarts
///
/// All methods take `&self` and may be called concurrently; share the
/// supervisor behind an `Arc` when several tasks need it.
pub struct Supervisor {
    shared: Arc<Shared>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl Supervisor {
    /// Create a supervisor that launches real OS processes and reports
    /// through `tracing`. Must be called inside a tokio runtime.
    pub fn new(settings: SupervisorSettings) -> Result<Self> {
        Self::with_collaborators(settings, Arc::new(OsLauncher), Arc::new(TracingReporter))
    }

    pub fn with_collaborators(
        settings: SupervisorSettings,
        launcher: Arc<dyn ProcessLauncher>,
        reporter: Arc<dyn Reporter>,
    ) -> Result<Self> {
        settings.validate()?;

        let (shutdown, _) = watch::channel(false);
        let (changes, _) = watch::channel(0);

        let shared = Arc::new(Shared {
            registry: RwLock::new(HashMap::new()),
            launcher,
            reporter,
            policy: RestartPolicy::new(settings.max_backoff()),
            settings,
            shutdown,
            changes,
            monitor_failed: AtomicBool::new(false),
        });

        let monitor = Monitor::new(Arc::clone(&shared));
        let monitor_task = tokio::spawn(monitor.run());

        Ok(Self {
            shared,
            monitor: Mutex::new(Some(monitor_task)),
        })
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.shared.settings
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.is_shutting_down()
    }

    /// False once the monitor task has died; exits are no longer observed
    pub fn is_monitoring(&self) -> bool {
        !self.shared.is_monitor_failed() && !self.shared.is_shutting_down()
    }

    /// Register a spec; the record starts out `Pending`
    pub async fn add(&self, spec: ProcessSpec) -> Result<()> {
        spec.validate()?;

        let mut registry = self.shared.registry.write().await;
        if registry.contains_key(&spec.name) {
            return Err(WardenError::DuplicateName(spec.name));
        }

        debug!(process = %spec.name, "Process registered");
        registry.insert(
            spec.name.clone(),
            Entry {
                record: ProcessRecord::new(spec),
                handle: None,
            },
        );
        drop(registry);

        self.shared.notify_changed();
        Ok(())
    }

    /// Register several specs, collecting failures instead of stopping at the first
    pub async fn add_all(&self, specs: impl IntoIterator<Item = ProcessSpec>) -> ProcessErrors {
        let mut errors = Vec::new();
        for spec in specs {
            let name = spec.name.clone();
            if let Err(e) = self.add(spec).await {
                errors.push((name, e));
            }
        }
        errors
    }

    /// Launch a registered, idle record
    pub async fn start(&self, name: &str) -> Result<u32> {
        let mut registry = self.shared.registry.write().await;

        if self.shared.is_shutting_down() {
            return Err(WardenError::ShuttingDown);
        }
        if self.shared.is_monitor_failed() {
            return Err(WardenError::MonitorDown);
        }

        let entry = registry
            .get_mut(name)
            .ok_or_else(|| WardenError::NotFound(name.to_string()))?;

        if !entry.record.is_idle() {
            return Err(WardenError::InvalidState(
                name.to_string(),
                entry.record.state.to_string(),
            ));
        }

        let result = self.shared.launch_into(entry);
        if let Err(ref e) = result {
            warn!(process = %name, "Failed to start process: {}", e);
            entry.record.mark_launch_failed();
        }
        drop(registry);

        self.shared.notify_changed();
        result
    }

    /// Start every idle record, collecting per-name failures
    pub async fn start_all(&self) -> ProcessErrors {
        let names: Vec<String> = {
            let registry = self.shared.registry.read().await;
            let mut names: Vec<String> = registry
                .values()
                .filter(|entry| entry.record.is_idle())
                .map(|entry| entry.record.spec.name.clone())
                .collect();
            names.sort();
            names
        };

        let mut errors = Vec::new();
        for name in names {
            if let Err(e) = self.start(&name).await {
                errors.push((name, e));
            }
        }
        errors
    }

    /// Stop one record; it ends `Stopped` and is never restarted afterwards
    ///
    /// Stopping an already terminal record is a no-op.
    pub async fn stop(&self, name: &str, timeout: Duration) -> Result<()> {
        let handle = {
            let mut registry = self.shared.registry.write().await;
            let entry = registry
                .get_mut(name)
                .ok_or_else(|| WardenError::NotFound(name.to_string()))?;

            match entry.record.state {
                ProcessState::Completed | ProcessState::Stopped | ProcessState::Failed => {
                    return Ok(());
                }
                ProcessState::Pending => {
                    // Cancels a queued restart; the restart task re-checks the record
                    entry.record.mark_stopped(None);
                    drop(registry);
                    self.shared.notify_changed();
                    return Ok(());
                }
                ProcessState::Running | ProcessState::Stopping => {
                    entry.record.mark_stopping();
                    entry.handle.clone()
                }
            }
        };

        self.shared.notify_changed();

        match handle {
            Some(handle) => self.shared.finish_stop(name, handle, timeout).await,
            None => Ok(()),
        }
    }

    /// Shut everything down
    ///
    /// Restart scheduling is frozen and the monitor is halted before any
    /// process is stopped; live records are then stopped concurrently.
    /// Each process gets its own `stop_timeout`, capped at `timeout`.
    pub async fn stop_all(&self, timeout: Duration) -> ProcessErrors {
        self.shared.shutdown.send_replace(true);

        if let Some(monitor) = self.monitor.lock().await.take() {
            if let Err(e) = monitor.await {
                error!("Monitor task ended abnormally: {}", e);
            }
        }

        let targets: Vec<(String, Arc<Mutex<ProcessHandle>>, Duration)> = {
            let mut registry = self.shared.registry.write().await;
            let mut targets = Vec::new();

            for (name, entry) in registry.iter_mut() {
                match entry.record.state {
                    ProcessState::Pending if entry.record.restart_pending => {
                        entry.record.mark_stopped(None);
                    }
                    ProcessState::Running | ProcessState::Stopping => {
                        entry.record.mark_stopping();
                        if let Some(handle) = entry.handle.clone() {
                            let grace = entry.record.spec.stop_timeout_duration().min(timeout);
                            targets.push((name.clone(), handle, grace));
                        }
                    }
                    _ => {}
                }
            }

            targets
        };

        self.shared.notify_changed();
        info!("Stopping {} processes", targets.len());

        let tasks: Vec<(String, JoinHandle<Result<()>>)> = targets
            .into_iter()
            .map(|(name, handle, grace)| {
                let shared = Arc::clone(&self.shared);
                let task_name = name.clone();
                let task = tokio::spawn(async move {
                    shared.finish_stop(&task_name, handle, grace).await
                });
                (name, task)
            })
            .collect();

        let mut errors = Vec::new();
        for (name, task) in tasks {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    if e.is_leak() {
                        error!(process = %name, "Process may still be running: {}", e);
                    } else {
                        error!(process = %name, "Failed to stop process: {}", e);
                    }
                    errors.push((name, e));
                }
                Err(e) => {
                    error!(process = %name, "Stop task failed: {}", e);
                    errors.push((name, WardenError::Internal(e.to_string())));
                }
            }
        }

        errors.sort_by(|a, b| a.0.cmp(&b.0));
        errors
    }

    /// Copies of every record, sorted by name
    pub async fn status(&self) -> Vec<ProcessRecord> {
        let registry = self.shared.registry.read().await;
        let mut records: Vec<ProcessRecord> =
            registry.values().map(|entry| entry.record.clone()).collect();
        records.sort_by(|a, b| a.spec.name.cmp(&b.spec.name));
        records
    }

    /// Longest `stop_timeout` among records with a live process
    pub async fn longest_stop_timeout(&self) -> Option<Duration> {
        let registry = self.shared.registry.read().await;
        registry
            .values()
            .filter(|entry| entry.record.state.is_live())
            .map(|entry| entry.record.spec.stop_timeout_duration())
            .max()
    }

    pub async fn get(&self, name: &str) -> Option<ProcessRecord> {
        let registry = self.shared.registry.read().await;
        registry.get(name).map(|entry| entry.record.clone())
    }

    /// Unregister a record that has no live process
    pub async fn remove(&self, name: &str) -> Result<ProcessRecord> {
        let mut registry = self.shared.registry.write().await;
        let entry = registry
            .get(name)
            .ok_or_else(|| WardenError::NotFound(name.to_string()))?;

        if entry.record.state.is_live() {
            return Err(WardenError::InvalidState(
                name.to_string(),
                format!("{} (stop it before removing)", entry.record.state),
            ));
        }

        let removed = registry
            .remove(name)
            .map(|entry| entry.record)
            .ok_or_else(|| WardenError::NotFound(name.to_string()))?;
        drop(registry);

        self.shared.notify_changed();
        Ok(removed)
    }

    /// Block until every started record is terminal or `timeout` elapses
    ///
    /// Records with a queued restart count as unfinished; idle records that
    /// were never started are ignored. Returns `false` on timeout, or as soon
    /// as the monitor is found dead with records still unsettled.
    pub async fn wait_for_completion(&self, timeout: Duration) -> bool {
        let mut changes = self.shared.changes.subscribe();

        let wait = async {
            loop {
                if self.shared.all_settled().await {
                    return true;
                }
                if self.shared.is_monitor_failed() {
                    warn!("Process monitor is not running, giving up on completion");
                    return false;
                }
                if changes.changed().await.is_err() {
                    return false;
                }
            }
        };

        tokio::time::timeout(timeout, wait).await.unwrap_or(false)
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        // Halts the monitor and any queued restarts; live children are
        // killed when their handles drop.
        self.shared.shutdown.send_replace(true);
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("settings", &self.shared.settings)
            .field("shutting_down", &self.is_shutting_down())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests;
