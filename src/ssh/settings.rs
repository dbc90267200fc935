//! Process-wide tunnel settings.
//!
//! Settings live next to the rest of the app data in `~/.pgui/tunnel.json`.
//! Every field has a default, so a missing or partial file is fine.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const SETTINGS_FILE: &str = "tunnel.json";

/// Keep-alive interval passed to ssh, in seconds
pub const SERVER_ALIVE_INTERVAL: u32 = 60;
/// Missed keep-alives before ssh drops the connection
pub const SERVER_ALIVE_COUNT_MAX: u32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TunnelSettings {
    /// The ssh binary to launch
    pub ssh_program: PathBuf,
    /// How long to let ssh fail fast or settle after spawn
    pub settle_delay_ms: u64,
    /// Grace period after SIGTERM before the process is considered released
    pub terminate_grace_ms: u64,
    /// Upper bound for the readiness connect attempt
    pub probe_timeout_ms: u64,
    /// Upper bound for draining captured output of an exited process
    pub output_drain_ms: u64,
    /// Keys under this directory are already permissioned and used in place
    pub key_storage_dir: Option<PathBuf>,
    /// Where staged key copies go; the system temp dir when unset
    pub temp_dir: Option<PathBuf>,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            ssh_program: PathBuf::from("ssh"),
            settle_delay_ms: 2000,
            terminate_grace_ms: 500,
            probe_timeout_ms: 1000,
            output_drain_ms: 500,
            key_storage_dir: app_dir().map(|dir| dir.join("keys")),
            temp_dir: None,
        }
    }
}

impl TunnelSettings {
    /// Load settings from `~/.pgui/tunnel.json`, falling back to defaults
    pub async fn load() -> Result<Self> {
        match app_dir() {
            Some(dir) => Self::load_or_default(&dir.join(SETTINGS_FILE)).await,
            None => Ok(Self::default()),
        }
    }

    /// Load settings from an explicit JSON file
    pub async fn load_from(path: &Path) -> Result<Self> {
        let raw = async_fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read tunnel settings {}", path.display()))?;
        Self::parse(&raw, path)
    }

    async fn load_or_default(path: &Path) -> Result<Self> {
        match async_fs::read_to_string(path).await {
            Ok(raw) => Self::parse(&raw, path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e)
                .with_context(|| format!("Failed to read tunnel settings {}", path.display())),
        }
    }

    fn parse(raw: &str, path: &Path) -> Result<Self> {
        let settings = serde_json::from_str(raw)
            .with_context(|| format!("Invalid tunnel settings in {}", path.display()))?;
        tracing::debug!("Loaded tunnel settings from {}", path.display());
        Ok(settings)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn output_drain(&self) -> Duration {
        Duration::from_millis(self.output_drain_ms)
    }

    /// Directory for staged key copies
    pub fn staging_dir(&self) -> PathBuf {
        self.temp_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

fn app_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".pgui"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = TunnelSettings::default();
        assert_eq!(settings.ssh_program, PathBuf::from("ssh"));
        assert_eq!(settings.settle_delay(), Duration::from_secs(2));
        assert_eq!(settings.terminate_grace(), Duration::from_millis(500));
        assert_eq!(settings.staging_dir(), std::env::temp_dir());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tunnel.json");
        std::fs::write(&path, r#"{ "ssh_program": "/opt/bin/ssh", "settle_delay_ms": 250 }"#)
            .unwrap();

        let settings = smol::block_on(TunnelSettings::load_from(&path)).unwrap();
        assert_eq!(settings.ssh_program, PathBuf::from("/opt/bin/ssh"));
        assert_eq!(settings.settle_delay(), Duration::from_millis(250));
        assert_eq!(settings.terminate_grace_ms, 500);
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tunnel.json");
        std::fs::write(&path, "not json").unwrap();

        let err = smol::block_on(TunnelSettings::load_from(&path)).unwrap_err();
        assert!(err.to_string().contains("Invalid tunnel settings"));
    }

    #[test]
    fn test_missing_file() {
        smol::block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("tunnel.json");

            let settings = TunnelSettings::load_or_default(&path).await.unwrap();
            assert_eq!(settings.settle_delay_ms, 2000);

            let err = TunnelSettings::load_from(&path).await.unwrap_err();
            assert!(err.to_string().contains("Failed to read tunnel settings"));
        });
    }
}
