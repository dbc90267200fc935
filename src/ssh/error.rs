//! Tunnel error kinds surfaced to callers of `establish()`.

use thiserror::Error;

/// Errors that can occur while establishing or using a tunnel.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TunnelError {
    /// The ssh process failed to start or exited early.
    #[error("SSH connection failed: {0}")]
    ConnectionFailed(String),

    /// The SSH server rejected the credentials.
    #[error("SSH authentication failed: {0}")]
    AuthenticationFailed(String),

    /// No local port could be allocated, or the forward never started listening.
    #[error("SSH port forwarding failed: {0}")]
    PortForwardingFailed(String),

    /// The operation needs an established tunnel.
    #[error("SSH tunnel is not established")]
    TunnelNotEstablished,

    /// The private key could not be resolved, read or staged.
    #[error("invalid SSH key path {path}: {reason}")]
    InvalidKeyPath { path: String, reason: String },
}

impl TunnelError {
    pub(crate) fn invalid_key(path: impl Into<String>, reason: impl ToString) -> Self {
        TunnelError::InvalidKeyPath {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Determine if retrying `establish()` could help.
    ///
    /// Port forwarding failures are usually a lost race for the local port.
    /// Connection failures are retriable only when the transport reported a
    /// network condition; authentication and key errors never are.
    pub fn is_retriable(&self) -> bool {
        match self {
            TunnelError::PortForwardingFailed(_) => true,
            TunnelError::ConnectionFailed(detail) => {
                let detail = detail.to_lowercase();
                [
                    "connection refused",
                    "connection timed out",
                    "connection reset",
                    "network is unreachable",
                    "network unreachable",
                    "no route to host",
                    "address already in use",
                    "temporary failure",
                    "try again",
                ]
                .iter()
                .any(|pattern| detail.contains(pattern))
            }
            TunnelError::AuthenticationFailed(_)
            | TunnelError::TunnelNotEstablished
            | TunnelError::InvalidKeyPath { .. } => false,
        }
    }
}
