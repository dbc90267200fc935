//! Launching and signalling the external ssh process.
//!
//! The supervisor only talks to `ProcessLauncher` / `TransportProcess`, so it
//! can be driven by a fake in tests instead of a real ssh binary.

use futures::StreamExt;
use smol::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use smol::process::{Child, ChildStderr, ChildStdout, Command, ExitStatus, Stdio};
use smol::Task;
use std::future::Future;
use std::path::Path;
use std::time::Duration;

/// Output captured from a transport process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
}

impl CapturedOutput {
    /// The most useful text for an error message: stderr, else stdout
    pub fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim().to_string()
        } else {
            stderr.to_string()
        }
    }
}

/// A running transport process.
pub trait TransportProcess: Send {
    /// OS process id, if known
    fn id(&self) -> Option<u32>;

    /// Non-blocking exit check
    fn try_wait(&mut self) -> std::io::Result<Option<ExitStatus>>;

    /// Wait for the process to exit
    fn wait(&mut self) -> impl Future<Output = std::io::Result<ExitStatus>> + Send + '_;

    /// Captured stdout/stderr. Only complete once the process has exited;
    /// gives up after `timeout`.
    fn collect_output(
        &mut self,
        timeout: Duration,
    ) -> impl Future<Output = CapturedOutput> + Send + '_;

    /// Ask the process to stop (SIGTERM on Unix). Never force-kills.
    fn terminate(&mut self) -> std::io::Result<()>;
}

/// Spawns transport processes.
pub trait ProcessLauncher: Send + Sync {
    type Process: TransportProcess;

    fn spawn(&self, program: &Path, args: &[String]) -> std::io::Result<Self::Process>;
}

/// Launches real processes through `smol::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLauncher;

impl ProcessLauncher for SystemLauncher {
    type Process = SystemProcess;

    fn spawn(&self, program: &Path, args: &[String]) -> std::io::Result<SystemProcess> {
        let mut cmd = Command::new(program);
        cmd.args(args);

        // No stdin for the tunnel, capture stdout/stderr for diagnostics
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        // Shutdown is a graceful signal, never a kill
        cmd.kill_on_drop(false);

        tracing::debug!("Spawning {} {}", program.display(), args.join(" "));

        let mut child = cmd.spawn()?;
        let stdout = child.stdout.take().map(drain_stdout);
        let stderr = child.stderr.take().map(drain_stderr);

        Ok(SystemProcess {
            child,
            stdout,
            stderr,
        })
    }
}

/// A process started by `SystemLauncher`
pub struct SystemProcess {
    child: Child,
    stdout: Option<Task<String>>,
    stderr: Option<Task<String>>,
}

impl TransportProcess for SystemProcess {
    fn id(&self) -> Option<u32> {
        Some(self.child.id())
    }

    fn try_wait(&mut self) -> std::io::Result<Option<ExitStatus>> {
        self.child.try_status()
    }

    fn wait(&mut self) -> impl Future<Output = std::io::Result<ExitStatus>> + Send + '_ {
        self.child.status()
    }

    fn collect_output(
        &mut self,
        timeout: Duration,
    ) -> impl Future<Output = CapturedOutput> + Send + '_ {
        async move {
            let (stdout, stderr) = futures::future::join(
                join_with_timeout(self.stdout.take(), timeout),
                join_with_timeout(self.stderr.take(), timeout),
            )
            .await;
            CapturedOutput { stdout, stderr }
        }
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> std::io::Result<()> {
        if self.child.try_status()?.is_some() {
            return Ok(());
        }
        let pid = self.child.id() as libc::pid_t;
        let result = unsafe { libc::kill(pid, libc::SIGTERM) };
        if result == -1 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> std::io::Result<()> {
        if self.child.try_status()?.is_some() {
            return Ok(());
        }
        self.child.kill()
    }
}

async fn join_with_timeout(task: Option<Task<String>>, timeout: Duration) -> String {
    match task {
        Some(task) => {
            smol::future::or(task, async {
                smol::Timer::after(timeout).await;
                String::new()
            })
            .await
        }
        None => String::new(),
    }
}

fn drain_stdout(mut stdout: ChildStdout) -> Task<String> {
    smol::spawn(async move {
        let mut captured = String::new();
        if let Err(e) = stdout.read_to_string(&mut captured).await {
            tracing::debug!("SSH stdout read error: {}", e);
        }
        captured
    })
}

/// Read stderr line by line, logging as we go and keeping a copy
fn drain_stderr(stderr: ChildStderr) -> Task<String> {
    smol::spawn(async move {
        let mut captured = String::new();
        let mut lines = BufReader::new(stderr).lines();
        while let Some(result) = lines.next().await {
            match result {
                Ok(line) => {
                    log_stderr_line(&line);
                    captured.push_str(&line);
                    captured.push('\n');
                }
                Err(e) => {
                    tracing::debug!("SSH stderr read error: {}", e);
                    break;
                }
            }
        }
        captured
    })
}

fn log_stderr_line(line: &str) {
    if is_auth_rejection(line) {
        tracing::error!("SSH authentication failed: {}", line);
    } else if line.contains("Connection refused")
        || line.contains("Connection timed out")
        || line.contains("Could not resolve hostname")
    {
        tracing::error!("SSH connection error: {}", line);
    } else {
        tracing::debug!("SSH stderr: {}", line);
    }
}

/// True if ssh output says the server rejected our credentials
pub fn is_auth_rejection(output: &str) -> bool {
    let output = output.to_lowercase();
    [
        "permission denied",
        "authentication failed",
        "too many authentication failures",
        "no supported authentication",
    ]
    .iter()
    .any(|pattern| output.contains(pattern))
}
