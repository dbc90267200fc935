//! SSH tunnel configuration and lifecycle types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a tunnel controller
pub type TunnelId = Uuid;

/// Where the private key for the SSH hop comes from
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum KeyReference {
    /// Filesystem path, `~` is expanded
    Path(String),
    /// Security-scoped bookmark bytes, resolved through a `BookmarkResolver`
    Bookmark(Vec<u8>),
}

/// Configuration for one SSH tunnel using the system ssh binary.
///
/// Immutable for the duration of a single `establish()` call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TunnelConfig {
    /// SSH server hostname
    pub ssh_host: String,
    /// SSH server port (default: 22)
    pub ssh_port: u16,
    /// SSH username
    pub ssh_user: String,
    /// Private key used for the SSH hop
    pub key: KeyReference,
    /// Remote host to tunnel to (as seen from SSH server)
    pub remote_host: String,
    /// Remote port to tunnel to
    pub remote_port: u16,
}

impl TunnelConfig {
    /// Create a tunnel configuration authenticating with a key file on disk
    pub fn with_key_path(
        ssh_host: impl Into<String>,
        ssh_port: u16,
        ssh_user: impl Into<String>,
        private_key_path: impl Into<String>,
        remote_host: impl Into<String>,
        remote_port: u16,
    ) -> Self {
        Self {
            ssh_host: ssh_host.into(),
            ssh_port,
            ssh_user: ssh_user.into(),
            key: KeyReference::Path(private_key_path.into()),
            remote_host: remote_host.into(),
            remote_port,
        }
    }

    /// Create a tunnel configuration authenticating with a bookmarked key
    pub fn with_bookmark(
        ssh_host: impl Into<String>,
        ssh_port: u16,
        ssh_user: impl Into<String>,
        bookmark: Vec<u8>,
        remote_host: impl Into<String>,
        remote_port: u16,
    ) -> Self {
        Self {
            ssh_host: ssh_host.into(),
            ssh_port,
            ssh_user: ssh_user.into(),
            key: KeyReference::Bookmark(bookmark),
            remote_host: remote_host.into(),
            remote_port,
        }
    }

    /// Build the SSH destination (user@host)
    pub fn ssh_destination(&self) -> String {
        if self.ssh_user.is_empty() {
            self.ssh_host.clone()
        } else {
            format!("{}@{}", self.ssh_user, self.ssh_host)
        }
    }

    /// Build the `-L` forward spec: local_port:remote_host:remote_port
    pub fn forward_spec(&self, local_port: u16) -> String {
        format!("{}:{}:{}", local_port, self.remote_host, self.remote_port)
    }
}

/// Tunnel lifecycle phases, in the order `establish()` walks through them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TunnelPhase {
    /// Nothing has been attempted yet
    Idle,
    Allocating,
    ResolvingKey,
    Launching,
    Probing,
    /// Tunnel is up and forwarding on `local_port`
    Established { local_port: u16 },
    Closing,
    /// Torn down, either by `close()` or after a failed establish
    Closed,
}

impl TunnelPhase {
    /// Returns true if the tunnel is usable for connections
    pub fn is_established(&self) -> bool {
        matches!(self, TunnelPhase::Established { .. })
    }

    /// Returns true for the idle-equivalent phases
    pub fn is_inactive(&self) -> bool {
        matches!(self, TunnelPhase::Idle | TunnelPhase::Closed)
    }
}

/// A phase transition, broadcast to subscribers for UI feedback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelEvent {
    pub id: TunnelId,
    pub phase: TunnelPhase,
    pub at: DateTime<Utc>,
}

impl TunnelEvent {
    pub fn new(id: TunnelId, phase: TunnelPhase) -> Self {
        Self {
            id,
            phase,
            at: Utc::now(),
        }
    }
}
