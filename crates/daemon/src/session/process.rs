//! Process launching.
//!
//! A session's command runs as `<shell> -c <command>` in its own process group
//! with stdin on a pipe and stdout/stderr merged into a second pipe. The
//! initial terminal geometry is exported through `COLUMNS`/`LINES` so
//! interactive programs lay themselves out correctly from the first frame.

use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::{pipe2, Pid};
use thiserror::Error;
use tokio::net::unix::pipe;
use tokio::process::{Child, ChildStdin, Command};

/// Default shell used to interpret session commands.
pub const DEFAULT_SHELL: &str = "/bin/sh";

/// Default value exported as `TERM`.
pub const DEFAULT_TERM: &str = "xterm-256color";

/// Errors that prevent a process from being launched.
///
/// Launch failures are final: the caller reports them and never respawns.
#[derive(Error, Debug)]
pub enum LaunchError {
    /// The requested working directory does not exist.
    #[error("working directory does not exist: {}", .0.display())]
    WorkingDirMissing(PathBuf),

    /// The shell executable could not be found.
    #[error("executable not found: {0}")]
    ExecutableNotFound(String),

    /// The shell executable could not be executed.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Any other spawn failure.
    #[error("failed to spawn process: {0}")]
    Spawn(String),
}

/// What to launch and where.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub command: String,
    pub working_dir: PathBuf,
    pub cols: u16,
    pub rows: u16,
}

/// Spawns session processes.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    shell: String,
    term: String,
}

/// A freshly launched process and its I/O endpoints.
pub struct LaunchedProcess {
    /// Handle used to wait for and terminate the process.
    pub child: ChildProcess,
    /// Write end of the process's stdin.
    pub stdin: ChildStdin,
    /// Read end of the merged stdout/stderr pipe.
    pub output: pipe::Receiver,
}

impl ProcessLauncher {
    pub fn new(shell: impl Into<String>, term: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
            term: term.into(),
        }
    }

    pub fn shell(&self) -> &str {
        &self.shell
    }

    /// Launches `spec.command` through the shell.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn launch(&self, spec: &LaunchSpec) -> Result<LaunchedProcess, LaunchError> {
        if !spec.working_dir.is_dir() {
            return Err(LaunchError::WorkingDirMissing(spec.working_dir.clone()));
        }

        let (read_fd, write_fd) =
            pipe2(OFlag::O_CLOEXEC).map_err(|e| LaunchError::Spawn(e.to_string()))?;
        let stderr_fd: OwnedFd = write_fd
            .try_clone()
            .map_err(|e| LaunchError::Spawn(e.to_string()))?;

        let mut command = Command::new(&self.shell);
        command
            .arg("-c")
            .arg(&spec.command)
            .current_dir(&spec.working_dir)
            .env("COLUMNS", spec.cols.to_string())
            .env("LINES", spec.rows.to_string())
            .env("TERM", &self.term)
            .stdin(Stdio::piped())
            .stdout(Stdio::from(write_fd))
            .stderr(Stdio::from(stderr_fd))
            .process_group(0)
            .kill_on_drop(true);

        let spawned = command.spawn();
        // The command still owns our copies of the pipe's write end; the
        // reader only sees EOF once they are closed.
        drop(command);

        let mut child = spawned.map_err(|e| self.classify_spawn_error(e))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| LaunchError::Spawn("stdin was not captured".to_string()))?;
        let pid = child
            .id()
            .ok_or_else(|| LaunchError::Spawn("process exited before it was tracked".to_string()))?;
        let output =
            pipe::Receiver::from_owned_fd(read_fd).map_err(|e| LaunchError::Spawn(e.to_string()))?;

        tracing::debug!(
            pid = pid,
            shell = %self.shell,
            command = %spec.command,
            cols = spec.cols,
            rows = spec.rows,
            "Launched process"
        );

        Ok(LaunchedProcess {
            child: ChildProcess {
                child,
                group: ProcessGroup::new(pid),
            },
            stdin,
            output,
        })
    }

    fn classify_spawn_error(&self, err: io::Error) -> LaunchError {
        match err.kind() {
            io::ErrorKind::NotFound => LaunchError::ExecutableNotFound(self.shell.clone()),
            io::ErrorKind::PermissionDenied => LaunchError::PermissionDenied(self.shell.clone()),
            _ => LaunchError::Spawn(err.to_string()),
        }
    }
}

impl Default for ProcessLauncher {
    fn default() -> Self {
        Self::new(DEFAULT_SHELL, DEFAULT_TERM)
    }
}

/// The process group a session's process leads.
///
/// The leader's pid doubles as the group id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessGroup {
    leader: Pid,
}

impl ProcessGroup {
    pub fn new(leader: u32) -> Self {
        Self {
            leader: Pid::from_raw(leader as i32),
        }
    }

    /// Pid of the group leader.
    pub fn id(&self) -> u32 {
        self.leader.as_raw() as u32
    }

    /// Delivers `signal` to every process in the group.
    ///
    /// Falls back to signalling the leader alone if the group is gone.
    pub fn signal(&self, signal: Signal) -> nix::Result<()> {
        match killpg(self.leader, signal) {
            Err(Errno::ESRCH) | Err(Errno::EPERM) => kill(self.leader, signal),
            other => other,
        }
    }

    /// Tells the group its terminal geometry changed.
    pub fn notify_resize(&self) -> nix::Result<()> {
        self.signal(Signal::SIGWINCH)
    }
}

/// Owned handle to a launched child process.
#[derive(Debug)]
pub struct ChildProcess {
    child: Child,
    group: ProcessGroup,
}

impl ChildProcess {
    pub fn group(&self) -> ProcessGroup {
        self.group
    }

    /// Reaps the process if it has exited, without blocking.
    pub fn try_wait(&mut self) -> io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    /// Waits for the process to exit.
    pub async fn wait(&mut self) -> io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// Sends SIGTERM to the group, waits up to `grace`, then SIGKILLs it.
    pub async fn terminate(&mut self, grace: Duration) -> io::Result<ExitStatus> {
        if let Some(status) = self.child.try_wait()? {
            return Ok(status);
        }

        if let Err(e) = self.group.signal(Signal::SIGTERM) {
            tracing::debug!(pid = self.group.id(), error = %e, "SIGTERM delivery failed");
        }

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => status,
            Err(_) => {
                tracing::warn!(
                    pid = self.group.id(),
                    grace_ms = grace.as_millis() as u64,
                    "Process ignored SIGTERM, sending SIGKILL"
                );
                if let Err(e) = self.group.signal(Signal::SIGKILL) {
                    tracing::debug!(pid = self.group.id(), error = %e, "SIGKILL delivery failed");
                    self.child.start_kill()?;
                }
                self.child.wait().await
            }
        }
    }
}

/// Shell-style exit code: the process's own code, or 128 + signal number.
pub fn exit_code(status: &ExitStatus) -> Option<i32> {
    status.code().or_else(|| status.signal().map(|s| 128 + s))
}
