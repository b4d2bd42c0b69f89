use crate::process::types::ResourceSnapshot;
use std::time::SystemTime;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

/// Best-effort CPU and memory sampling for supervised PIDs
pub struct ResourceSampler {
    /// System information collector
    system: System,
}

impl ResourceSampler {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }

    /// Sample one process
    ///
    /// A PID that vanished between the liveness poll and this lookup yields
    /// the zero-value snapshot instead of an error.
    pub fn sample(&mut self, pid: u32) -> ResourceSnapshot {
        let sys_pid = Pid::from_u32(pid);

        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[sys_pid]),
            true,
            ProcessRefreshKind::everything(),
        );

        match self.system.process(sys_pid) {
            Some(process) => ResourceSnapshot {
                cpu_usage: process.cpu_usage(),
                memory_bytes: process.memory(),
                sampled_at: SystemTime::now(),
            },
            None => ResourceSnapshot::default(),
        }
    }
}

impl Default for ResourceSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ResourceSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceSampler").finish_non_exhaustive()
    }
}
