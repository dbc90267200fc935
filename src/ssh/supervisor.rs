//! Supervising the ssh process that carries the tunnel.
//!
//! ssh is launched with a fixed, minimal flag set: no remote command, a single
//! `-L` forward, the identity file, no known-hosts checks, and keep-alives so
//! a dead connection is noticed. Readiness is decided by the controller.

use super::error::TunnelError;
use super::process::{ProcessLauncher, SystemLauncher, TransportProcess, is_auth_rejection};
use super::settings::{SERVER_ALIVE_COUNT_MAX, SERVER_ALIVE_INTERVAL, TunnelSettings};
use super::types::TunnelConfig;
use std::path::Path;
use std::time::Duration;

const TEST_CONNECT_TIMEOUT_SECS: u64 = 10;

pub struct TransportSupervisor<L: ProcessLauncher = SystemLauncher> {
    launcher: L,
    settings: TunnelSettings,
}

impl<L: ProcessLauncher> TransportSupervisor<L> {
    pub fn new(launcher: L, settings: TunnelSettings) -> Self {
        Self { launcher, settings }
    }

    /// Arguments for the tunnel process, in the order ssh receives them
    pub fn tunnel_args(config: &TunnelConfig, local_port: u16, key_path: &Path) -> Vec<String> {
        let mut args = vec!["-N".to_string()];
        args.extend(["-L".to_string(), config.forward_spec(local_port)]);
        args.extend(["-p".to_string(), config.ssh_port.to_string()]);
        args.extend(["-i".to_string(), key_path.display().to_string()]);
        args.extend(host_key_and_keep_alive_options());
        args.push(config.ssh_destination());
        args
    }

    /// Arguments for a one-shot `exit 0` login used to test credentials
    pub fn test_args(config: &TunnelConfig, key_path: &Path) -> Vec<String> {
        let mut args = Vec::new();
        args.extend(["-o".to_string(), "BatchMode=yes".to_string()]);
        args.extend([
            "-o".to_string(),
            format!("ConnectTimeout={}", TEST_CONNECT_TIMEOUT_SECS),
        ]);
        args.extend(["-p".to_string(), config.ssh_port.to_string()]);
        args.extend(["-i".to_string(), key_path.display().to_string()]);
        args.extend(host_key_and_keep_alive_options());
        args.push(config.ssh_destination());
        args.extend(["exit".to_string(), "0".to_string()]);
        args
    }

    /// Start ssh and give it the settle delay to either fail or come up.
    ///
    /// The process goes into `slot` before the settle wait, so it stays with
    /// the caller even if this future is dropped or returns an error.
    /// Terminating it on failure is the caller's job.
    pub async fn launch<'a>(
        &self,
        config: &TunnelConfig,
        local_port: u16,
        key_path: &Path,
        slot: &'a mut Option<L::Process>,
    ) -> Result<&'a mut L::Process, TunnelError> {
        let process = slot.insert(self.spawn_tunnel(config, local_port, key_path)?);
        self.await_settled(config, process).await?;
        Ok(process)
    }

    fn spawn_tunnel(
        &self,
        config: &TunnelConfig,
        local_port: u16,
        key_path: &Path,
    ) -> Result<L::Process, TunnelError> {
        let args = Self::tunnel_args(config, local_port, key_path);

        tracing::info!(
            "Starting SSH tunnel: ssh -L {} -N {}",
            config.forward_spec(local_port),
            config.ssh_destination()
        );

        self.launcher
            .spawn(&self.settings.ssh_program, &args)
            .map_err(|e| {
                TunnelError::ConnectionFailed(format!(
                    "Failed to spawn {}: {}",
                    self.settings.ssh_program.display(),
                    e
                ))
            })
    }

    async fn await_settled(
        &self,
        config: &TunnelConfig,
        process: &mut L::Process,
    ) -> Result<(), TunnelError> {
        smol::Timer::after(self.settings.settle_delay()).await;

        match process.try_wait() {
            Ok(None) => Ok(()),
            Ok(Some(status)) => {
                let output = process.collect_output(self.settings.output_drain()).await;
                let detail = match output.diagnostic() {
                    d if d.is_empty() => format!("ssh exited immediately with {}", status),
                    d => d,
                };
                tracing::warn!(
                    "SSH process for {} exited during startup ({}): {}",
                    config.ssh_destination(),
                    status,
                    detail
                );
                Err(classify_failure(detail))
            }
            Err(e) => Err(TunnelError::ConnectionFailed(format!(
                "Failed to check ssh process status: {}",
                e
            ))),
        }
    }

    /// Send the stop signal and wait the grace period. Best effort.
    pub async fn terminate(&self, process: &mut L::Process) {
        if !signal_terminate(process) {
            return;
        }

        smol::Timer::after(self.settings.terminate_grace()).await;

        match process.try_wait() {
            Ok(Some(status)) => tracing::debug!("SSH process exited with {}", status),
            Ok(None) => tracing::warn!(
                "SSH process {:?} still running after {:?}, leaving it to exit on its own",
                process.id(),
                self.settings.terminate_grace()
            ),
            Err(e) => tracing::warn!("Failed to check ssh process status: {}", e),
        }
    }

    /// Synchronous terminate without the grace wait, for drop paths
    pub fn terminate_now(process: &mut L::Process) {
        signal_terminate(process);
    }

    /// Test SSH login without starting a tunnel.
    ///
    /// Runs `ssh ... user@host exit 0` in batch mode so no prompts appear.
    pub async fn test_connection(
        &self,
        config: &TunnelConfig,
        key_path: &Path,
    ) -> Result<(), TunnelError> {
        let args = Self::test_args(config, key_path);
        tracing::debug!("Testing SSH connection to {}", config.ssh_destination());

        let mut process = self
            .launcher
            .spawn(&self.settings.ssh_program, &args)
            .map_err(|e| {
                TunnelError::ConnectionFailed(format!("Failed to execute ssh test command: {}", e))
            })?;

        // ConnectTimeout bounds the handshake; leave some room for auth
        let limit = Duration::from_secs(TEST_CONNECT_TIMEOUT_SECS + 5);
        let status = smol::future::or(async { Some(process.wait().await) }, async {
            smol::Timer::after(limit).await;
            None
        })
        .await;

        match status {
            Some(Ok(status)) if status.success() => Ok(()),
            Some(Ok(status)) => {
                let output = process.collect_output(self.settings.output_drain()).await;
                let detail = format!(
                    "SSH connection test failed (exit {}): {}",
                    status,
                    output.diagnostic()
                );
                Err(classify_failure(detail))
            }
            Some(Err(e)) => Err(TunnelError::ConnectionFailed(format!(
                "Failed to wait for ssh test command: {}",
                e
            ))),
            None => {
                self.terminate(&mut process).await;
                Err(TunnelError::ConnectionFailed(format!(
                    "SSH connection test timed out after {:?}",
                    limit
                )))
            }
        }
    }
}

fn host_key_and_keep_alive_options() -> Vec<String> {
    [
        "StrictHostKeyChecking=no".to_string(),
        "UserKnownHostsFile=/dev/null".to_string(),
        format!("ServerAliveInterval={}", SERVER_ALIVE_INTERVAL),
        format!("ServerAliveCountMax={}", SERVER_ALIVE_COUNT_MAX),
    ]
    .into_iter()
    .flat_map(|option| ["-o".to_string(), option])
    .collect()
}

/// Returns false if there was nothing left to signal
fn signal_terminate<P: TransportProcess>(process: &mut P) -> bool {
    if let Ok(Some(status)) = process.try_wait() {
        tracing::debug!("SSH process already exited with {}", status);
        return false;
    }
    match process.terminate() {
        Ok(()) => {
            tracing::debug!("Sent SIGTERM to ssh process {:?}", process.id());
            true
        }
        Err(e) => {
            tracing::warn!("Failed to signal ssh process {:?}: {}", process.id(), e);
            false
        }
    }
}

fn classify_failure(detail: String) -> TunnelError {
    if is_auth_rejection(&detail) {
        TunnelError::AuthenticationFailed(detail)
    } else {
        TunnelError::ConnectionFailed(detail)
    }
}
