use super::*;
use crate::events::ChannelReporter;
use crate::process::handle::tests::StubbornLauncher;
use crate::process::launcher::ChildProcess;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc::UnboundedReceiver;

fn fast_settings() -> SupervisorSettings {
    SupervisorSettings {
        poll_interval_ms: 20,
        max_backoff_secs: 60,
        shutdown_timeout_secs: 5,
        sample_resources: true,
    }
}

fn supervisor_with_events() -> (Supervisor, UnboundedReceiver<SupervisorEvent>) {
    let (reporter, rx) = ChannelReporter::new();
    let supervisor =
        Supervisor::with_collaborators(fast_settings(), Arc::new(OsLauncher), Arc::new(reporter))
            .unwrap();
    (supervisor, rx)
}

fn drain(rx: &mut UnboundedReceiver<SupervisorEvent>) -> Vec<SupervisorEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn sleeper(name: &str) -> ProcessSpec {
    ProcessSpec::new(name, "/bin/sleep")
        .arg("30")
        .stop_timeout(Duration::from_secs(2))
}

/// Launches the real command once, then fails every relaunch
struct FlakyLauncher {
    launches: AtomicUsize,
}

impl ProcessLauncher for FlakyLauncher {
    fn launch(&self, spec: &ProcessSpec) -> Result<Box<dyn ChildProcess>> {
        if self.launches.fetch_add(1, Ordering::SeqCst) == 0 {
            OsLauncher.launch(spec)
        } else {
            Err(WardenError::Launch(
                spec.name.clone(),
                "executable not found".to_string(),
            ))
        }
    }
}

#[tokio::test]
async fn test_add_and_status() {
    let (supervisor, _rx) = supervisor_with_events();

    supervisor.add(sleeper("b")).await.unwrap();
    supervisor.add(sleeper("a")).await.unwrap();

    let status = supervisor.status().await;
    assert_eq!(status.len(), 2);
    assert_eq!(status[0].name(), "a");
    assert_eq!(status[1].name(), "b");
    assert!(status.iter().all(|r| r.state == ProcessState::Pending && r.pid.is_none()));
}

#[tokio::test]
async fn test_add_duplicate_name() {
    let (supervisor, _rx) = supervisor_with_events();

    supervisor.add(sleeper("dup")).await.unwrap();
    let result = supervisor.add(sleeper("dup")).await;

    assert!(matches!(result, Err(WardenError::DuplicateName(ref n)) if n == "dup"));
    assert_eq!(supervisor.status().await.len(), 1);
}

#[tokio::test]
async fn test_add_invalid_spec() {
    let (supervisor, _rx) = supervisor_with_events();

    let result = supervisor.add(ProcessSpec::new("", "/bin/true")).await;
    assert!(matches!(result, Err(WardenError::MissingConfigField(_))));
}

#[tokio::test]
async fn test_add_all_collects_errors() {
    let (supervisor, _rx) = supervisor_with_events();

    let errors = supervisor
        .add_all(vec![sleeper("one"), sleeper("two"), sleeper("one")])
        .await;

    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].0, "one");
    assert_eq!(supervisor.status().await.len(), 2);
}

#[tokio::test]
async fn test_start_unknown_name() {
    let (supervisor, _rx) = supervisor_with_events();

    let result = supervisor.start("ghost").await;
    assert!(matches!(result, Err(WardenError::NotFound(_))));
}

#[tokio::test]
async fn test_start_and_stop() {
    let (supervisor, mut rx) = supervisor_with_events();
    supervisor.add(sleeper("svc")).await.unwrap();

    let pid = supervisor.start("svc").await.unwrap();
    let record = supervisor.get("svc").await.unwrap();
    assert_eq!(record.state, ProcessState::Running);
    assert_eq!(record.pid, Some(pid));
    assert!(record.started_at.is_some());

    let second = supervisor.start("svc").await;
    assert!(matches!(second, Err(WardenError::InvalidState(_, _))));

    supervisor.stop("svc", Duration::from_secs(2)).await.unwrap();
    let record = supervisor.get("svc").await.unwrap();
    assert_eq!(record.state, ProcessState::Stopped);
    assert!(record.pid.is_none());
    assert_eq!(record.restart_count, 0);

    let events = drain(&mut rx);
    assert_eq!(events[0], SupervisorEvent::Started { name: "svc".to_string(), pid });
    assert!(events
        .iter()
        .any(|e| matches!(e, SupervisorEvent::Terminated { name, .. } if name == "svc")));
    assert!(!events
        .iter()
        .any(|e| matches!(e, SupervisorEvent::RestartScheduled { .. })));
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let (supervisor, mut rx) = supervisor_with_events();
    supervisor.add(sleeper("svc")).await.unwrap();
    supervisor.start("svc").await.unwrap();

    supervisor.stop("svc", Duration::from_secs(2)).await.unwrap();
    let first = supervisor.get("svc").await.unwrap();
    drain(&mut rx);

    supervisor.stop("svc", Duration::from_secs(2)).await.unwrap();
    let second = supervisor.get("svc").await.unwrap();

    assert_eq!(first, second);
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn test_stop_idle_record() {
    let (supervisor, _rx) = supervisor_with_events();
    supervisor.add(sleeper("idle")).await.unwrap();

    supervisor.stop("idle", Duration::from_secs(1)).await.unwrap();

    let record = supervisor.get("idle").await.unwrap();
    assert_eq!(record.state, ProcessState::Stopped);
    assert!(matches!(
        supervisor.start("idle").await,
        Err(WardenError::InvalidState(_, _))
    ));
}

#[tokio::test]
async fn test_stop_unknown_name() {
    let (supervisor, _rx) = supervisor_with_events();
    let result = supervisor.stop("ghost", Duration::from_secs(1)).await;
    assert!(matches!(result, Err(WardenError::NotFound(_))));
}

#[tokio::test]
async fn test_concurrent_stops_of_same_record() {
    let (supervisor, _rx) = supervisor_with_events();
    let supervisor = Arc::new(supervisor);
    supervisor.add(sleeper("svc")).await.unwrap();
    supervisor.start("svc").await.unwrap();

    let a = {
        let supervisor = Arc::clone(&supervisor);
        tokio::spawn(async move { supervisor.stop("svc", Duration::from_secs(2)).await })
    };
    let b = {
        let supervisor = Arc::clone(&supervisor);
        tokio::spawn(async move { supervisor.stop("svc", Duration::from_secs(2)).await })
    };

    assert!(a.await.unwrap().is_ok());
    assert!(b.await.unwrap().is_ok());
    assert_eq!(
        supervisor.get("svc").await.unwrap().state,
        ProcessState::Stopped
    );
}

#[tokio::test]
async fn test_start_missing_executable() {
    let (supervisor, _rx) = supervisor_with_events();
    supervisor
        .add(ProcessSpec::new("missing", "/nonexistent/binary"))
        .await
        .unwrap();

    let result = supervisor.start("missing").await;
    assert!(matches!(result, Err(WardenError::Launch(_, _))));

    let record = supervisor.get("missing").await.unwrap();
    assert_eq!(record.state, ProcessState::Failed);
    assert!(record.pid.is_none());
}

#[tokio::test]
async fn test_start_all_is_best_effort() {
    let (supervisor, _rx) = supervisor_with_events();
    supervisor.add(sleeper("good")).await.unwrap();
    supervisor
        .add(ProcessSpec::new("bad", "/nonexistent/binary"))
        .await
        .unwrap();

    let errors = supervisor.start_all().await;

    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].0, "bad");
    assert_eq!(
        supervisor.get("good").await.unwrap().state,
        ProcessState::Running
    );

    assert!(supervisor.stop_all(Duration::from_secs(2)).await.is_empty());
}

#[tokio::test]
async fn test_remove() {
    let (supervisor, _rx) = supervisor_with_events();
    supervisor.add(sleeper("svc")).await.unwrap();
    supervisor.start("svc").await.unwrap();

    assert!(matches!(
        supervisor.remove("svc").await,
        Err(WardenError::InvalidState(_, _))
    ));

    supervisor.stop("svc", Duration::from_secs(2)).await.unwrap();
    let removed = supervisor.remove("svc").await.unwrap();
    assert_eq!(removed.state, ProcessState::Stopped);
    assert!(supervisor.get("svc").await.is_none());
    assert!(matches!(
        supervisor.remove("svc").await,
        Err(WardenError::NotFound(_))
    ));

    // The name is free again
    supervisor.add(sleeper("svc")).await.unwrap();
}

#[tokio::test]
async fn test_status_returns_copies() {
    let (supervisor, _rx) = supervisor_with_events();
    supervisor.add(sleeper("svc")).await.unwrap();

    let mut snapshot = supervisor.status().await;
    snapshot[0].state = ProcessState::Completed;
    snapshot[0].restart_count = 99;

    let record = supervisor.get("svc").await.unwrap();
    assert_eq!(record.state, ProcessState::Pending);
    assert_eq!(record.restart_count, 0);
}

#[tokio::test]
async fn test_wait_for_completion_empty_registry() {
    let (supervisor, _rx) = supervisor_with_events();
    assert!(supervisor.wait_for_completion(Duration::from_millis(100)).await);
}

#[tokio::test]
async fn test_wait_for_completion_times_out() {
    let (supervisor, _rx) = supervisor_with_events();
    supervisor.add(sleeper("svc")).await.unwrap();
    supervisor.start("svc").await.unwrap();

    let started = std::time::Instant::now();
    assert!(!supervisor.wait_for_completion(Duration::from_millis(300)).await);
    assert!(started.elapsed() < Duration::from_secs(2));

    supervisor.stop_all(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn test_monitor_records_resource_snapshot() {
    let (supervisor, _rx) = supervisor_with_events();
    supervisor.add(sleeper("svc")).await.unwrap();
    supervisor.start("svc").await.unwrap();

    let mut snapshot = None;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        snapshot = supervisor.get("svc").await.unwrap().last_resource_snapshot;
        if snapshot.is_some() {
            break;
        }
    }

    let snapshot = snapshot.expect("monitor never sampled the process");
    assert!(snapshot.memory_bytes > 0);

    supervisor.stop_all(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn test_relaunch_failure_counts_against_budget() {
    let (reporter, mut rx) = ChannelReporter::new();
    let launcher = Arc::new(FlakyLauncher {
        launches: AtomicUsize::new(0),
    });
    let supervisor =
        Supervisor::with_collaborators(fast_settings(), launcher.clone(), Arc::new(reporter))
            .unwrap();

    supervisor
        .add(
            ProcessSpec::new("flaky", "false")
                .max_restarts(2)
                .restart_backoff(Duration::from_millis(10)),
        )
        .await
        .unwrap();
    supervisor.start("flaky").await.unwrap();

    assert!(supervisor.wait_for_completion(Duration::from_secs(5)).await);

    let record = supervisor.get("flaky").await.unwrap();
    assert_eq!(record.state, ProcessState::Failed);
    assert_eq!(record.restart_count, 2);
    assert_eq!(launcher.launches.load(Ordering::SeqCst), 3);

    let events = drain(&mut rx);
    let scheduled = events
        .iter()
        .filter(|e| matches!(e, SupervisorEvent::RestartScheduled { .. }))
        .count();
    assert_eq!(scheduled, 2);
    assert!(events.contains(&SupervisorEvent::RestartExhausted {
        name: "flaky".to_string()
    }));
}

#[tokio::test]
async fn test_stop_all_freezes_pending_restart() {
    let (supervisor, mut rx) = supervisor_with_events();
    supervisor
        .add(
            ProcessSpec::new("crashy", "false")
                .max_restarts(5)
                .restart_backoff(Duration::from_millis(500)),
        )
        .await
        .unwrap();
    supervisor.start("crashy").await.unwrap();

    let mut pending = false;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        if supervisor.get("crashy").await.unwrap().restart_pending {
            pending = true;
            break;
        }
    }
    assert!(pending, "restart was never scheduled");

    let errors = supervisor.stop_all(Duration::from_secs(1)).await;
    assert!(errors.is_empty());

    // Outlive the backoff: the queued relaunch must not fire
    tokio::time::sleep(Duration::from_millis(800)).await;

    let record = supervisor.get("crashy").await.unwrap();
    assert_eq!(record.state, ProcessState::Stopped);
    assert_eq!(record.restart_count, 1);
    assert!(!record.restart_pending);

    let started = drain(&mut rx)
        .into_iter()
        .filter(|e| matches!(e, SupervisorEvent::Started { .. }))
        .count();
    assert_eq!(started, 1);

    assert!(matches!(
        supervisor.start("crashy").await,
        Err(WardenError::ShuttingDown)
    ));
}

#[tokio::test]
async fn test_force_kill_failure_is_flagged() {
    let (reporter, mut rx) = ChannelReporter::new();
    let kills = Arc::new(AtomicUsize::new(0));
    let launcher = Arc::new(StubbornLauncher {
        kills: Arc::clone(&kills),
    });
    let mut settings = fast_settings();
    settings.sample_resources = false;
    let supervisor =
        Supervisor::with_collaborators(settings, launcher, Arc::new(reporter)).unwrap();

    supervisor
        .add(ProcessSpec::new("immortal", "/bin/true").max_restarts(5))
        .await
        .unwrap();
    supervisor.start("immortal").await.unwrap();

    let errors = supervisor.stop_all(Duration::from_millis(100)).await;

    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].0, "immortal");
    assert!(errors[0].1.is_leak());
    assert_eq!(kills.load(Ordering::SeqCst), 1);

    let record = supervisor.get("immortal").await.unwrap();
    assert_eq!(record.state, ProcessState::Failed);
    assert!(record.force_kill_failed);
    assert!(record.pid.is_none());
    assert_eq!(record.restart_count, 0);

    assert!(drain(&mut rx).contains(&SupervisorEvent::StopTimedOut {
        name: "immortal".to_string()
    }));
}

/// A child whose status can no longer be read once it was asked to stop
#[derive(Debug)]
struct UnreadableChild {
    terminated: bool,
}

impl ChildProcess for UnreadableChild {
    fn id(&self) -> Option<u32> {
        Some(999_998)
    }

    fn try_wait(&mut self) -> std::io::Result<Option<crate::process::ExitInfo>> {
        if self.terminated {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "status unavailable"))
        } else {
            Ok(None)
        }
    }

    fn terminate(&mut self) -> std::io::Result<()> {
        self.terminated = true;
        Ok(())
    }

    fn kill(&mut self) -> std::io::Result<()> {
        Ok(())
    }

    fn take_stdout(&mut self) -> Option<crate::process::OutputReader> {
        None
    }

    fn take_stderr(&mut self) -> Option<crate::process::OutputReader> {
        None
    }
}

struct UnreadableLauncher;

impl ProcessLauncher for UnreadableLauncher {
    fn launch(&self, _spec: &ProcessSpec) -> Result<Box<dyn ChildProcess>> {
        Ok(Box::new(UnreadableChild { terminated: false }))
    }
}

/// Reporter that panics when told `quick` exited
struct ExitPanicReporter;

impl Reporter for ExitPanicReporter {
    fn report(&self, event: &SupervisorEvent) {
        if let SupervisorEvent::Terminated { name, .. } = event {
            if name == "quick" {
                panic!("reporter cannot handle exit of {}", name);
            }
        }
    }
}

#[tokio::test]
async fn test_invalid_settings_are_rejected() {
    let mut settings = fast_settings();
    settings.poll_interval_ms = 0;

    let result =
        Supervisor::with_collaborators(settings, Arc::new(OsLauncher), Arc::new(TracingReporter));
    assert!(matches!(result, Err(WardenError::ConfigValidationError(_))));
}

#[tokio::test]
async fn test_stop_all_with_unbounded_timeouts() {
    let (supervisor, _rx) = supervisor_with_events();
    let mut spec = ProcessSpec::new("patient", "/bin/sleep").arg("30");
    spec.stop_timeout_ms = u64::MAX;
    supervisor.add(spec).await.unwrap();
    supervisor.start("patient").await.unwrap();

    let errors = supervisor.stop_all(Duration::MAX).await;

    assert!(errors.is_empty(), "{:?}", errors);
    let record = supervisor.get("patient").await.unwrap();
    assert_eq!(record.state, ProcessState::Stopped);
    assert_eq!(record.exit_signal, Some(15));
}

#[tokio::test]
async fn test_stop_all_uses_each_stop_timeout() {
    let (supervisor, _rx) = supervisor_with_events();
    supervisor
        .add(
            ProcessSpec::new("stubborn", "/bin/sh")
                .args(["-c", "trap '' TERM; exec sleep 30"])
                .stop_timeout(Duration::from_millis(200)),
        )
        .await
        .unwrap();
    supervisor.add(sleeper("polite")).await.unwrap();
    assert!(supervisor.start_all().await.is_empty());
    assert_eq!(
        supervisor.longest_stop_timeout().await,
        Some(Duration::from_secs(2))
    );
    tokio::time::sleep(Duration::from_millis(300)).await;

    let started = std::time::Instant::now();
    let errors = supervisor.stop_all(Duration::from_secs(10)).await;
    let elapsed = started.elapsed();

    assert!(errors.is_empty());
    assert!(elapsed < Duration::from_millis(1500), "took {:?}", elapsed);

    let stubborn = supervisor.get("stubborn").await.unwrap();
    assert_eq!(stubborn.state, ProcessState::Stopped);
    assert_eq!(stubborn.exit_signal, Some(9));
    assert_eq!(
        supervisor.get("polite").await.unwrap().exit_signal,
        Some(15)
    );
    assert_eq!(supervisor.longest_stop_timeout().await, None);
}

#[tokio::test]
async fn test_monitor_crash_is_surfaced() {
    let supervisor = Supervisor::with_collaborators(
        fast_settings(),
        Arc::new(OsLauncher),
        Arc::new(ExitPanicReporter),
    )
    .unwrap();
    supervisor.add(ProcessSpec::new("quick", "true")).await.unwrap();
    supervisor.add(sleeper("steady")).await.unwrap();
    supervisor.add(sleeper("later")).await.unwrap();
    supervisor.start("quick").await.unwrap();
    supervisor.start("steady").await.unwrap();
    assert!(supervisor.is_monitoring());

    let started = std::time::Instant::now();
    assert!(!supervisor.wait_for_completion(Duration::from_secs(10)).await);
    assert!(started.elapsed() < Duration::from_secs(5));

    assert!(!supervisor.is_monitoring());
    assert!(matches!(
        supervisor.start("later").await,
        Err(WardenError::MonitorDown)
    ));

    assert!(supervisor.stop_all(Duration::from_secs(2)).await.is_empty());
    assert_eq!(
        supervisor.get("steady").await.unwrap().state,
        ProcessState::Stopped
    );
}

#[tokio::test]
async fn test_stop_error_is_not_reported_as_leak() {
    let mut settings = fast_settings();
    settings.sample_resources = false;
    let supervisor = Supervisor::with_collaborators(
        settings,
        Arc::new(UnreadableLauncher),
        Arc::new(TracingReporter),
    )
    .unwrap();
    supervisor
        .add(ProcessSpec::new("opaque", "/bin/true").max_restarts(5))
        .await
        .unwrap();
    supervisor.start("opaque").await.unwrap();

    let result = supervisor.stop("opaque", Duration::from_secs(1)).await;

    let error = result.unwrap_err();
    assert!(matches!(error, WardenError::StopError(ref name, _) if name == "opaque"));
    assert!(!error.is_leak());

    let record = supervisor.get("opaque").await.unwrap();
    assert_eq!(record.state, ProcessState::Failed);
    assert!(!record.force_kill_failed);
    assert!(record.stop_requested);
    assert!(record.pid.is_none());
    assert_eq!(record.restart_count, 0);
}
