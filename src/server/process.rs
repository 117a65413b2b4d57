// src/server/process.rs
use crate::config::ServerSettings;
use crate::error::{Error, Result};
use async_process::{Child, ChildStderr, ChildStdout, Command, Stdio};
use std::io;
use std::path::Path;
use std::process::ExitStatus;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Exit code reported when the OS gives none (killed by a signal, or the wait failed).
pub const UNKNOWN_EXIT_CODE: i32 = -1;

/// Control handle for a spawned server process.
///
/// The child itself is owned by a background task that waits for it to exit
/// and carries out shutdown requests, so asking for a shutdown never blocks.
pub struct ProcessHandle {
    pid: u32,
    command_line: String,
    shutdown_tx: mpsc::UnboundedSender<()>,
    shutdown_requested: AtomicBool,
    exited: Arc<AtomicBool>,
}

impl ProcessHandle {
    /// OS process id
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Command line the process was started with
    pub fn command_line(&self) -> &str {
        &self.command_line
    }

    /// Whether the process has been reaped
    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    /// Schedule interrupt, bounded wait, then kill.
    ///
    /// Returns `false` without doing anything if the process already exited or a
    /// shutdown was requested before.
    pub fn request_shutdown(&self) -> bool {
        if self.has_exited() || self.shutdown_requested.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.shutdown_tx.send(()).is_ok()
    }
}

/// A freshly spawned server: its handle, its output pipes and its exit code.
pub(crate) struct LaunchedProcess {
    pub(crate) handle: ProcessHandle,
    pub(crate) stdout: ChildStdout,
    pub(crate) stderr: ChildStderr,
    /// Resolves with the exit code once the process has been reaped
    pub(crate) exit: JoinHandle<i32>,
}

/// Spawn the server described by `settings`.
///
/// Must be called from within a Tokio runtime.
pub(crate) fn launch(settings: &ServerSettings, coverage_dir: Option<&Path>) -> Result<LaunchedProcess> {
    let command_line = settings.command_line(coverage_dir);
    let runtime = Handle::try_current().map_err(|_| {
        Error::Spawn(format!("{}: must be started from within a Tokio runtime", command_line))
    })?;

    let mut command = std::process::Command::new(&settings.interpreter);
    command.args(settings.command_args(coverage_dir));

    if let Some(dir) = settings.working_dir() {
        command.current_dir(dir);
    }

    // Set environment variables
    if !settings.pass_parent_env {
        command.env_clear();
    }
    command.envs(&settings.env);

    // Own process group, so shutdown also reaches the browsers the server starts
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    // Configure stdio
    let mut command = Command::from(command);
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command
        .spawn()
        .map_err(|e| Error::Spawn(format!("{}: {}", command_line, e)))?;

    let pid = child.id();
    let stdout = child.stdout.take().ok_or_else(|| {
        Error::Spawn(format!("{}: failed to get stdout pipe from child process", command_line))
    })?;
    let stderr = child.stderr.take().ok_or_else(|| {
        Error::Spawn(format!("{}: failed to get stderr pipe from child process", command_line))
    })?;

    tracing::info!(pid, command = %command_line, "Server process started");

    let (shutdown_tx, shutdown_rx) = mpsc::unbounded_channel();
    let exited = Arc::new(AtomicBool::new(false));
    let exit = runtime.spawn(supervise(
        child,
        pid,
        shutdown_rx,
        settings.shutdown_timeout(),
        Arc::clone(&exited),
    ));

    Ok(LaunchedProcess {
        handle: ProcessHandle {
            pid,
            command_line,
            shutdown_tx,
            shutdown_requested: AtomicBool::new(false),
            exited,
        },
        stdout,
        stderr,
        exit,
    })
}

/// Wait for the child to exit, carrying out at most one shutdown request meanwhile.
async fn supervise(
    mut child: Child,
    pid: u32,
    mut shutdown_rx: mpsc::UnboundedReceiver<()>,
    grace: Duration,
    exited: Arc<AtomicBool>,
) -> i32 {
    let status = tokio::select! {
        status = child.status() => status,
        Some(()) = shutdown_rx.recv() => {
            tracing::info!(pid, grace_ms = grace.as_millis() as u64, "Shutting down server process");
            terminate(&mut child, pid, grace).await
        }
    };
    exited.store(true, Ordering::SeqCst);

    match status {
        Ok(status) => status.code().unwrap_or(UNKNOWN_EXIT_CODE),
        Err(e) => {
            tracing::error!(pid, error = %e, "Failed to wait for server process");
            UNKNOWN_EXIT_CODE
        }
    }
}

/// Interrupt the server's process group, give the server `grace` to exit, then
/// kill whatever is left of the group.
#[cfg(unix)]
async fn terminate(child: &mut Child, pid: u32, grace: Duration) -> io::Result<ExitStatus> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let group = Pid::from_raw(pid as i32);
    let status = match killpg(group, Signal::SIGINT) {
        Ok(()) => match tokio::time::timeout(grace, child.status()).await {
            Ok(status) => Some(status),
            Err(_) => {
                tracing::warn!(pid, "Server ignored interrupt; killing");
                None
            }
        },
        // Already gone, just reap it
        Err(Errno::ESRCH) => Some(child.status().await),
        Err(e) => {
            tracing::warn!(pid, error = %e, "Failed to interrupt server; killing");
            None
        }
    };

    // Background helpers ignore the interrupt and would keep the pipes open
    match killpg(group, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => tracing::debug!(pid, error = %e, "Failed to kill server process group"),
    }

    match status {
        Some(status) => status,
        None => {
            // May race with a natural exit; reaping below reports it either way
            if let Err(e) = child.kill() {
                tracing::debug!(pid, error = %e, "Kill failed");
            }
            child.status().await
        }
    }
}

/// No interrupt to send here; kill right away.
#[cfg(not(unix))]
async fn terminate(child: &mut Child, pid: u32, _grace: Duration) -> io::Result<ExitStatus> {
    tracing::debug!(pid, "Killing server process");
    child.kill()?;
    child.status().await
}
