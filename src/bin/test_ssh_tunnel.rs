//! SSH Tunnel Test Binary
//!
//! Exercises the tunnel lifecycle against a real SSH bastion and PostgreSQL.
//!
//! Prerequisites:
//!   docker compose -f docker-compose.ssh-test.yml up -d
//!   the bastion's testuser must accept the key in PGUI_TEST_SSH_KEY
//!   (default: ~/.ssh/pgui_test_ed25519)
//!
//! Run with:
//!   cargo run --features harness --bin test_ssh_tunnel

use anyhow::{Context, Result};
use pgui_tunnel::ssh::{
    TunnelConfig, TunnelController, TunnelError, TunnelManager, TunnelPhase, TunnelSettings,
    is_listening,
};
use std::time::{Duration, Instant};

// Test configuration
const SSH_HOST: &str = "127.0.0.1";
const SSH_PORT: u16 = 2222;
const SSH_USER: &str = "testuser";
const DEFAULT_KEY: &str = "~/.ssh/pgui_test_ed25519";

const PG_REMOTE_HOST: &str = "postgres";
const PG_REMOTE_PORT: u16 = 5432;
const PG_USER: &str = "pguser";
const PG_PASS: &str = "pgpass";
const PG_DB: &str = "testdb";

fn main() -> Result<()> {
    pgui_tunnel::logging::init_with("test_ssh_tunnel=debug,pgui_tunnel=debug,warn")?;

    println!("╔════════════════════════════════════════════╗");
    println!("║   SSH Tunnel Lifecycle Test Suite          ║");
    println!("╚════════════════════════════════════════════╝\n");

    smol::block_on(async {
        println!("━━━ Test 1: SSH Login Test ━━━");
        test_ssh_login().await?;

        println!("\n━━━ Test 2: Full Tunnel with sqlx ━━━");
        test_tunnel_with_sqlx().await?;

        println!("\n━━━ Test 3: Unreachable Bastion ━━━");
        test_unreachable_bastion().await?;

        println!("\n━━━ Test 4: Missing Key ━━━");
        test_missing_key().await?;

        println!("\n━━━ Test 5: Sequential Cycles ━━━");
        test_sequential_cycles().await?;

        println!("\n━━━ Test 6: Manager Lifecycle ━━━");
        test_manager_lifecycle().await?;

        println!("\n╔════════════════════════════════════════════╗");
        println!("║       All tests passed! ✓                  ║");
        println!("╚════════════════════════════════════════════╝");

        Ok(())
    })
}

fn key_path() -> String {
    std::env::var("PGUI_TEST_SSH_KEY").unwrap_or_else(|_| DEFAULT_KEY.to_string())
}

fn test_config() -> TunnelConfig {
    TunnelConfig::with_key_path(
        SSH_HOST,
        SSH_PORT,
        SSH_USER,
        key_path(),
        PG_REMOTE_HOST,
        PG_REMOTE_PORT,
    )
}

fn staged_keys() -> Result<usize> {
    let count = std::fs::read_dir(std::env::temp_dir())?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().starts_with("pgui-key-"))
        .count();
    Ok(count)
}

async fn test_ssh_login() -> Result<()> {
    let tunnel = TunnelController::new(TunnelSettings::default());
    tunnel.test_connection(&test_config()).await?;

    println!("  ✓ Connected to SSH server at {}:{}", SSH_HOST, SSH_PORT);
    println!("  ✓ Authenticated as user '{}'", SSH_USER);
    Ok(())
}

async fn test_tunnel_with_sqlx() -> Result<()> {
    use sqlx::Row;
    use sqlx::postgres::PgPoolOptions;

    let mut tunnel = TunnelController::new(TunnelSettings::default());
    let mut events = tunnel.subscribe();

    let local_port = tunnel.establish(&test_config()).await?;
    println!("  → Tunnel listening on {}", tunnel.connect_addr()?);

    let connection_string = format!(
        "postgres://{}:{}@127.0.0.1:{}/{}",
        PG_USER, PG_PASS, local_port, PG_DB
    );

    let pool = PgPoolOptions::new()
        .max_connections(2)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&connection_string)
        .await?;
    println!("  ✓ sqlx connected through tunnel!");

    let row: (i32,) = sqlx::query_as("SELECT 1 + 1").fetch_one(&pool).await?;
    println!("  ✓ SELECT 1 + 1 = {}", row.0);

    let row = sqlx::query("SELECT version()").fetch_one(&pool).await?;
    let version: String = row.get(0);
    println!(
        "  ✓ PostgreSQL version: {}",
        version.split(',').next().unwrap_or(&version)
    );

    pool.close().await;
    println!("  → Pool closed");

    tunnel.close().await;
    anyhow::ensure!(tunnel.local_port() == 0, "local port should reset on close");
    anyhow::ensure!(
        !is_listening(local_port, Duration::from_secs(1)).await,
        "port {} still accepting after close",
        local_port
    );
    println!("  ✓ Tunnel closed cleanly, port {} released", local_port);

    let mut phases = Vec::new();
    while let Ok(event) = events.try_recv() {
        phases.push(event.phase);
    }
    anyhow::ensure!(
        phases.first() == Some(&TunnelPhase::Allocating)
            && phases.last() == Some(&TunnelPhase::Closed),
        "unexpected phase sequence: {:?}",
        phases
    );
    println!("  ✓ Phases: {:?}", phases);

    Ok(())
}

async fn test_unreachable_bastion() -> Result<()> {
    let mut tunnel = TunnelController::new(TunnelSettings::default());
    let config = TunnelConfig {
        ssh_port: 1,
        ..test_config()
    };

    let started = Instant::now();
    match tunnel.establish(&config).await {
        Err(TunnelError::ConnectionFailed(detail)) => {
            println!("  ✓ ConnectionFailed after {:?}: {}", started.elapsed(), detail)
        }
        other => anyhow::bail!("expected ConnectionFailed, got {:?}", other),
    }
    anyhow::ensure!(tunnel.local_port() == 0, "handle should be empty");
    Ok(())
}

async fn test_missing_key() -> Result<()> {
    let mut tunnel = TunnelController::new(TunnelSettings::default());
    let config = TunnelConfig::with_key_path(
        SSH_HOST,
        SSH_PORT,
        SSH_USER,
        "/definitely/not/here/id_ed25519",
        PG_REMOTE_HOST,
        PG_REMOTE_PORT,
    );

    match tunnel.establish(&config).await {
        Err(TunnelError::InvalidKeyPath { path, .. }) => {
            println!("  ✓ InvalidKeyPath for {}", path)
        }
        other => anyhow::bail!("expected InvalidKeyPath, got {:?}", other),
    }
    Ok(())
}

async fn test_sequential_cycles() -> Result<()> {
    let before = staged_keys()?;
    let mut tunnel = TunnelController::new(TunnelSettings::default());

    let first = tunnel.establish(&test_config()).await?;
    tunnel.close().await;
    let second = tunnel.establish(&test_config()).await?;
    tunnel.close().await;

    anyhow::ensure!(first != second, "both cycles used port {}", first);
    println!("  ✓ Ports {} then {}", first, second);

    let after = staged_keys().context("Failed to scan temp dir")?;
    anyhow::ensure!(after <= before, "staged keys left behind");
    println!("  ✓ No staged keys left behind");
    Ok(())
}

async fn test_manager_lifecycle() -> Result<()> {
    let mut manager = TunnelManager::new(TunnelSettings::default());

    let (id, local_port) = manager.open(&test_config()).await?;
    println!("  ✓ Tunnel {} open on port {}", id, local_port);
    anyhow::ensure!(manager.active_tunnels().await == vec![id]);

    let shared = manager.get(id).context("tunnel not registered")?;
    shared.lock().await.check_alive().await?;
    println!("  ✓ Tunnel {} is alive", id);

    manager.shutdown().await;
    anyhow::ensure!(manager.active_tunnels().await.is_empty());
    println!("  ✓ Manager shut down all tunnels");
    Ok(())
}
