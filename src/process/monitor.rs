use crate::events::SupervisorEvent;
use crate::process::handle::PollStatus;
use crate::process::resources::ResourceSampler;
use crate::process::supervisor::Shared;
use crate::process::types::ProcessState;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

/// Background loop that observes every running process
///
/// Each tick polls the handles of `Running` records without blocking,
/// settles the ones that exited and hands failures to the restart policy.
/// Approved restarts are scheduled as separate delayed tasks so a long
/// backoff never delays observation of other records.
pub(crate) struct Monitor {
    shared: Arc<Shared>,
    sampler: Option<ResourceSampler>,
    interval: Duration,
}

impl Monitor {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        let sampler = shared
            .settings
            .sample_resources
            .then(ResourceSampler::new);
        let interval = shared.settings.poll_interval();

        Self {
            shared,
            sampler,
            interval,
        }
    }

    /// Run until the supervisor raises its shutdown flag
    pub(crate) async fn run(mut self) {
        info!("Starting process monitor (poll interval: {:?})", self.interval);

        let _exit = MonitorExit {
            shared: Arc::clone(&self.shared),
        };

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown = self.shared.shutdown.subscribe();

        loop {
            tokio::select! {
                biased;
                _ = async { let _ = shutdown.wait_for(|stopping| *stopping).await; } => break,
                _ = ticker.tick() => self.tick().await,
            }
        }

        info!("Process monitor stopped");
    }

    /// One observation pass over the registry
    pub(crate) async fn tick(&mut self) {
        let mut restarts = Vec::new();
        let mut changed = false;

        {
            let mut registry = self.shared.registry.write().await;

            for (name, entry) in registry.iter_mut() {
                if entry.record.state != ProcessState::Running {
                    continue;
                }
                let Some(handle) = entry.handle.clone() else {
                    continue;
                };
                // A stop in progress owns the handle
                let Ok(mut guard) = handle.try_lock() else {
                    continue;
                };

                match guard.poll() {
                    PollStatus::Running => {
                        if let Some(ref mut sampler) = self.sampler {
                            let snapshot = guard.resource_snapshot(sampler);
                            entry.record.record_snapshot(snapshot);
                        }
                    }
                    PollStatus::Exited(exit) => {
                        drop(guard);
                        entry.handle = None;
                        entry.record.mark_exited(exit);
                        changed = true;

                        debug!(process = %name, "Process exited with {}", exit);
                        self.shared.emit(SupervisorEvent::Terminated {
                            name: name.clone(),
                            exit_code: exit.code,
                            signal: exit.signal,
                        });

                        if let Some(delay) = self.shared.after_failure(entry) {
                            restarts.push((name.clone(), delay));
                        }
                    }
                    PollStatus::Idle => {}
                }
            }
        }

        if changed {
            self.shared.notify_changed();
        }

        for (name, delay) in restarts {
            self.shared.schedule_restart(name, delay);
        }
    }
}

/// Flags the supervisor when the monitor task unwinds
struct MonitorExit {
    shared: Arc<Shared>,
}

impl Drop for MonitorExit {
    fn drop(&mut self) {
        if std::thread::panicking() {
            error!("Process monitor crashed; process exits are no longer observed");
            self.shared.monitor_failed.store(true, Ordering::SeqCst);
            self.shared.notify_changed();
        }
    }
}
