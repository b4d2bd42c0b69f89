use crate::config::ProcessSpec;
use crate::error::{Result, WardenError};
use crate::process::types::ExitInfo;
use std::io;
use std::process::Stdio;
use tokio::io::AsyncRead;
use tokio::process::{Child, Command};

/// Readable end of a child's stdout or stderr pipe
pub type OutputReader = Box<dyn AsyncRead + Send + Unpin>;

/// A live OS process as seen by the supervisor
///
/// Every method is non-blocking; waiting with a deadline is built on top of
/// `try_wait` by the caller.
pub trait ChildProcess: Send + std::fmt::Debug {
    /// OS process id, `None` once the process has been reaped
    fn id(&self) -> Option<u32>;

    /// Reap the process if it has exited
    fn try_wait(&mut self) -> io::Result<Option<ExitInfo>>;

    /// Ask the process to exit (SIGTERM on unix)
    fn terminate(&mut self) -> io::Result<()>;

    /// Kill the process unconditionally (SIGKILL on unix)
    fn kill(&mut self) -> io::Result<()>;

    fn take_stdout(&mut self) -> Option<OutputReader>;

    fn take_stderr(&mut self) -> Option<OutputReader>;
}

/// Spawns processes described by a [`ProcessSpec`]
pub trait ProcessLauncher: Send + Sync {
    fn launch(&self, spec: &ProcessSpec) -> Result<Box<dyn ChildProcess>>;
}

/// Launcher backed by `tokio::process`
#[derive(Debug, Clone, Copy, Default)]
pub struct OsLauncher;

impl ProcessLauncher for OsLauncher {
    /// Spawn the process with its arguments, working directory and
    /// environment overlay; stdout and stderr are captured as pipes.
    fn launch(&self, spec: &ProcessSpec) -> Result<Box<dyn ChildProcess>> {
        let mut command = Command::new(&spec.command);

        if !spec.args.is_empty() {
            command.args(&spec.args);
        }

        if let Some(ref dir) = spec.working_directory {
            command.current_dir(dir);
        }

        for (key, value) in &spec.env {
            command.env(key, value);
        }

        command.stdin(Stdio::null());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.kill_on_drop(true);

        let child = command.spawn().map_err(|e| {
            let reason = match e.kind() {
                io::ErrorKind::NotFound => format!("executable not found: {}", spec.command.display()),
                io::ErrorKind::PermissionDenied => {
                    format!("permission denied: {}", spec.command.display())
                }
                _ => e.to_string(),
            };
            WardenError::Launch(spec.name.clone(), reason)
        })?;

        if child.id().is_none() {
            return Err(WardenError::Launch(
                spec.name.clone(),
                "process exited before its PID could be read".to_string(),
            ));
        }

        Ok(Box::new(OsChild { child }))
    }
}

#[derive(Debug)]
struct OsChild {
    child: Child,
}

impl ChildProcess for OsChild {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn try_wait(&mut self) -> io::Result<Option<ExitInfo>> {
        Ok(self.child.try_wait()?.map(ExitInfo::from))
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> io::Result<()> {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.child.id() else {
            return Ok(());
        };

        match signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }

    fn kill(&mut self) -> io::Result<()> {
        match self.child.start_kill() {
            // Already reaped
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(()),
            other => other,
        }
    }

    fn take_stdout(&mut self) -> Option<OutputReader> {
        self.child
            .stdout
            .take()
            .map(|stdout| Box::new(stdout) as OutputReader)
    }

    fn take_stderr(&mut self) -> Option<OutputReader> {
        self.child
            .stderr
            .take()
            .map(|stderr| Box::new(stderr) as OutputReader)
    }
}
