//! SSH tunnels that let pgui reach databases behind a bastion host.
//!
//! The tunnel is carried by the system `ssh` binary. See [`ssh::TunnelController`]
//! for the lifecycle and [`ssh::TunnelManager`] for keeping several open.

pub mod logging;
pub mod ssh;
