//! SSH tunneling for database connections behind a bastion.
//!
//! This module provides:
//! - `TunnelController` - establishes and tears down one tunnel
//! - `TunnelManager` - keeps several tunnels open at once
//! - `TransportSupervisor` - launches and stops the system ssh binary
//! - `KeyMaterialResolver` - stages private keys where ssh can read them

mod bookmark;
mod controller;
mod error;
mod key_material;
mod port;
mod process;
mod reconnect;
mod service;
mod settings;
mod supervisor;
#[cfg(test)]
mod testing;
mod types;

pub use bookmark::{BookmarkResolver, FileBookmarkResolver, ResolvedBookmark, ScopeAccess};
pub use controller::TunnelController;
pub use error::TunnelError;
pub use key_material::{KeyMaterialHandle, KeyMaterialResolver, STAGED_KEY_MODE, expand_tilde};
pub use port::{LOOPBACK, allocate_port, allocate_port_excluding, is_listening};
pub use process::{CapturedOutput, ProcessLauncher, SystemLauncher, SystemProcess, TransportProcess};
pub use reconnect::{ExponentialBackoff, ReconnectConfig};
pub use service::{SharedTunnel, TunnelManager};
pub use settings::{SERVER_ALIVE_COUNT_MAX, SERVER_ALIVE_INTERVAL, TunnelSettings};
pub use supervisor::TransportSupervisor;
pub use types::{KeyReference, TunnelConfig, TunnelEvent, TunnelId, TunnelPhase};
