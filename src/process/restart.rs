use crate::process::types::{ProcessRecord, ProcessState};
use std::time::Duration;

/// Outcome of consulting the restart policy for one record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Relaunch after `delay`; `attempt` is the restart count once scheduled
    Restart { attempt: u32, delay: Duration },
    /// The restart budget is used up; the record stays `Failed`
    Exhausted,
    /// Restarting does not apply (clean exit, restarts disabled, explicit stop)
    NotEligible,
}

/// Decides whether and when a failed process is relaunched
///
/// The policy is a pure function of the record it is given.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    /// Upper bound for any computed backoff delay
    pub max_backoff: Duration,
}

impl RestartPolicy {
    pub fn new(max_backoff: Duration) -> Self {
        Self { max_backoff }
    }

    pub fn should_restart(&self, record: &ProcessRecord) -> RestartDecision {
        let spec = &record.spec;

        if !spec.restart_on_failure {
            return RestartDecision::NotEligible;
        }

        if record.state != ProcessState::Failed
            || record.stop_requested
            || record.force_kill_failed
        {
            return RestartDecision::NotEligible;
        }

        if record.restart_count >= spec.max_restarts {
            return RestartDecision::Exhausted;
        }

        RestartDecision::Restart {
            attempt: record.restart_count + 1,
            delay: backoff_delay(
                spec.restart_backoff_base(),
                record.restart_count,
                self.max_backoff,
            ),
        }
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

/// Exponential backoff: `base * 2^restart_count`, capped at `max`
pub fn backoff_delay(base: Duration, restart_count: u32, max: Duration) -> Duration {
    base.saturating_mul(2_u32.saturating_pow(restart_count))
        .min(max)
}
