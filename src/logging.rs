//! Log setup for the binaries. The library itself only emits `tracing` events.

use tracing_subscriber::EnvFilter;

const DEFAULT_DIRECTIVES: &str = "pgui_tunnel=info,warn";

/// Install a fmt subscriber filtered by `RUST_LOG`, or by `default` if unset
pub fn init_with(default: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(default))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install log subscriber: {}", e))
}

pub fn init() -> anyhow::Result<()> {
    init_with(DEFAULT_DIRECTIVES)
}
