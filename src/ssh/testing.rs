//! In-process stand-in for ssh.
//!
//! `FakeBehavior::Forward` binds a real loopback listener on the port named in
//! the `-L` argument, so the readiness probe and connect checks behave as they
//! would with a live tunnel.

use super::process::{CapturedOutput, ProcessLauncher, TransportProcess};
use smol::process::ExitStatus;
use std::future::Future;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone)]
pub enum FakeBehavior {
    /// Bind the forwarded port and run until terminated
    Forward,
    /// Run until terminated without ever binding the port
    Silent,
    /// Exit with 255 before the settle delay is over
    ExitEarly { stderr: String },
    /// Exit with `code`, as a one-shot command would
    ExitWith { code: i32, stderr: String },
}

#[derive(Debug, Default)]
struct FakeState {
    spawned: usize,
    running: usize,
    args: Vec<Vec<String>>,
    key_existed: Vec<bool>,
}

#[derive(Clone)]
pub struct FakeLauncher {
    behavior: FakeBehavior,
    state: Arc<Mutex<FakeState>>,
}

impl FakeLauncher {
    pub fn new(behavior: FakeBehavior) -> Self {
        Self {
            behavior,
            state: Arc::new(Mutex::new(FakeState::default())),
        }
    }

    pub fn spawned(&self) -> usize {
        self.state.lock().unwrap().spawned
    }

    /// Processes spawned and not yet terminated
    pub fn running(&self) -> usize {
        self.state.lock().unwrap().running
    }

    pub fn last_args(&self) -> Option<Vec<String>> {
        self.state.lock().unwrap().args.last().cloned()
    }

    /// Whether the `-i` file existed when each process was spawned
    pub fn key_existed(&self) -> Vec<bool> {
        self.state.lock().unwrap().key_existed.clone()
    }
}

impl ProcessLauncher for FakeLauncher {
    type Process = FakeProcess;

    fn spawn(&self, _program: &Path, args: &[String]) -> std::io::Result<FakeProcess> {
        let behavior = self.behavior.clone();
        let key_exists = arg_after(args, "-i")
            .map(|path| PathBuf::from(path).exists())
            .unwrap_or(false);

        let mut state = self.state.lock().unwrap();
        state.spawned += 1;
        state.args.push(args.to_vec());
        state.key_existed.push(key_exists);

        let mut process = FakeProcess {
            listener: None,
            exit: None,
            stderr: String::new(),
            counted: false,
            state: self.state.clone(),
        };

        match behavior {
            FakeBehavior::Forward => {
                let port = arg_after(args, "-L")
                    .and_then(|spec| spec.split(':').next())
                    .and_then(|port| port.parse::<u16>().ok())
                    .unwrap_or(0);
                match TcpListener::bind(("127.0.0.1", port)) {
                    Ok(listener) => process.listener = Some(listener),
                    Err(e) => {
                        process.stderr = format!("bind [127.0.0.1]:{}: {}", port, e);
                    }
                }
                process.counted = true;
                state.running += 1;
            }
            FakeBehavior::Silent => {
                process.counted = true;
                state.running += 1;
            }
            FakeBehavior::ExitEarly { stderr } => {
                process.exit = Some(exit_status(255));
                process.stderr = stderr;
            }
            FakeBehavior::ExitWith { code, stderr } => {
                process.exit = Some(exit_status(code));
                process.stderr = stderr;
            }
        }

        Ok(process)
    }
}

pub struct FakeProcess {
    listener: Option<TcpListener>,
    exit: Option<ExitStatus>,
    stderr: String,
    counted: bool,
    state: Arc<Mutex<FakeState>>,
}

impl TransportProcess for FakeProcess {
    fn id(&self) -> Option<u32> {
        None
    }

    fn try_wait(&mut self) -> std::io::Result<Option<ExitStatus>> {
        Ok(self.exit)
    }

    fn wait(&mut self) -> impl Future<Output = std::io::Result<ExitStatus>> + Send + '_ {
        async move {
            match self.exit {
                Some(status) => Ok(status),
                None => futures::future::pending().await,
            }
        }
    }

    fn collect_output(
        &mut self,
        _timeout: Duration,
    ) -> impl Future<Output = CapturedOutput> + Send + '_ {
        async move {
            CapturedOutput {
                stdout: String::new(),
                stderr: self.stderr.clone(),
            }
        }
    }

    fn terminate(&mut self) -> std::io::Result<()> {
        if self.exit.is_none() {
            self.listener = None;
            self.exit = Some(exit_status(143));
            if self.counted {
                self.counted = false;
                self.state.lock().unwrap().running -= 1;
            }
        }
        Ok(())
    }
}

fn arg_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|pos| args.get(pos + 1))
        .map(String::as_str)
}

#[cfg(unix)]
fn exit_status(code: i32) -> ExitStatus {
    use std::os::unix::process::ExitStatusExt;
    ExitStatus::from_raw(code << 8)
}

#[cfg(windows)]
fn exit_status(code: i32) -> ExitStatus {
    use std::os::windows::process::ExitStatusExt;
    ExitStatus::from_raw(code as u32)
}
