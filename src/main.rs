//! Open one SSH tunnel from a saved profile and hold it until Enter is pressed.
//!
//! Usage:
//!   pgui-tunnel <profile.json>          establish the tunnel and keep it open
//!   pgui-tunnel --test <profile.json>   only check that ssh can log in

use anyhow::{Context, Result};
use pgui_tunnel::ssh::{TunnelConfig, TunnelController, TunnelError, TunnelSettings};
use std::path::Path;
use std::time::Duration;

const LIVENESS_INTERVAL: Duration = Duration::from_secs(5);

fn main() -> Result<()> {
    pgui_tunnel::logging::init()?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (test_only, profile) = match args.as_slice() {
        [flag, path] if flag == "--test" => (true, path),
        [path] => (false, path),
        _ => anyhow::bail!("usage: pgui-tunnel [--test] <profile.json>"),
    };

    smol::block_on(async {
        let config = load_profile(Path::new(profile)).await?;
        let settings = TunnelSettings::load().await?;
        let mut tunnel = TunnelController::new(settings);

        if test_only {
            tunnel.test_connection(&config).await.map_err(describe)?;
            println!("SSH login to {} succeeded", config.ssh_destination());
            return Ok(());
        }

        let local_port = tunnel.establish(&config).await.map_err(describe)?;
        println!(
            "Tunnel listening on 127.0.0.1:{} -> {}:{}",
            local_port, config.remote_host, config.remote_port
        );
        println!("Press Enter to close");

        let outcome = smol::future::or(wait_for_enter(), watch(&mut tunnel)).await;
        tunnel.close().await;
        outcome
    })
}

async fn load_profile(path: &Path) -> Result<TunnelConfig> {
    let raw = async_fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read profile {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Invalid profile {}", path.display()))
}

async fn wait_for_enter() -> Result<()> {
    smol::unblock(|| {
        let mut line = String::new();
        std::io::stdin().read_line(&mut line).map(|_| ())
    })
    .await
    .context("Failed to read stdin")
}

/// Returns only when the tunnel dies
async fn watch(tunnel: &mut TunnelController) -> Result<()> {
    loop {
        smol::Timer::after(LIVENESS_INTERVAL).await;
        tunnel.check_alive().await.map_err(describe)?;
    }
}

fn describe(error: TunnelError) -> anyhow::Error {
    let hint = match &error {
        TunnelError::ConnectionFailed(_) => "Could not reach the SSH server",
        TunnelError::AuthenticationFailed(_) => "The SSH server rejected the key",
        TunnelError::PortForwardingFailed(_) => "Local port forwarding did not come up",
        TunnelError::TunnelNotEstablished => "The tunnel is not open",
        TunnelError::InvalidKeyPath { .. } => "Check the private key path",
    };
    anyhow::Error::new(error).context(hint)
}
