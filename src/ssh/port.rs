//! Local port allocation and the readiness probe for forwarded ports.

use super::error::TunnelError;
use futures::FutureExt;
use smol::net::{TcpListener, TcpStream};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

/// The forwarded port is always bound on loopback
pub const LOOPBACK: Ipv4Addr = Ipv4Addr::LOCALHOST;

const MAX_ALLOCATION_ATTEMPTS: usize = 8;

/// Find an available port on loopback.
///
/// The listener is dropped before returning so ssh can bind the port. Nothing
/// reserves it in between, so another process may grab it first.
pub async fn allocate_port() -> Result<u16, TunnelError> {
    allocate_port_excluding(&[]).await
}

/// Like `allocate_port`, but never returns one of `excluded`.
///
/// Hits on an excluded port keep their listener bound until a usable port is
/// found, which forces the OS to hand out a different one next time.
pub async fn allocate_port_excluding(excluded: &[u16]) -> Result<u16, TunnelError> {
    let mut held = Vec::new();

    for _ in 0..MAX_ALLOCATION_ATTEMPTS {
        let listener = TcpListener::bind(SocketAddr::from((LOOPBACK, 0)))
            .await
            .map_err(|e| {
                TunnelError::PortForwardingFailed(format!("Failed to bind local port: {}", e))
            })?;
        let port = listener
            .local_addr()
            .map_err(|e| {
                TunnelError::PortForwardingFailed(format!("Failed to read local port: {}", e))
            })?
            .port();

        if excluded.contains(&port) {
            tracing::trace!("Allocator returned excluded port {}, retrying", port);
            held.push(listener);
            continue;
        }

        drop(listener);
        tracing::debug!("Allocated local port {}", port);
        return Ok(port);
    }

    Err(TunnelError::PortForwardingFailed(format!(
        "No usable local port after {} attempts",
        MAX_ALLOCATION_ATTEMPTS
    )))
}

/// Check whether something accepts connections on loopback at `port`.
///
/// One attempt, no retries. Any error counts as not listening.
pub async fn is_listening(port: u16, timeout: Duration) -> bool {
    if port == 0 {
        return false;
    }

    let connect = TcpStream::connect(SocketAddr::from((LOOPBACK, port)));
    let timer = smol::Timer::after(timeout);

    futures::select! {
        result = Box::pin(connect).fuse() => match result {
            Ok(_) => true,
            Err(e) => {
                tracing::trace!("Port {} not listening: {}", port, e);
                false
            }
        },
        _ = Box::pin(timer).fuse() => {
            tracing::debug!("Readiness probe on port {} timed out after {:?}", port, timeout);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_port_is_nonzero_and_free() {
        smol::block_on(async {
            let port = allocate_port().await.unwrap();
            assert!(port >= 1024);

            // Released again, so we can bind it ourselves
            let listener = TcpListener::bind((LOOPBACK, port)).await;
            assert!(listener.is_ok());
        });
    }

    #[test]
    fn test_allocate_port_excluding() {
        smol::block_on(async {
            let first = allocate_port().await.unwrap();
            for _ in 0..5 {
                let next = allocate_port_excluding(&[first]).await.unwrap();
                assert_ne!(next, first);
            }
        });
    }

    #[test]
    fn test_is_listening() {
        smol::block_on(async {
            let listener = TcpListener::bind((LOOPBACK, 0)).await.unwrap();
            let port = listener.local_addr().unwrap().port();
            assert!(is_listening(port, Duration::from_secs(1)).await);

            drop(listener);
            assert!(!is_listening(port, Duration::from_secs(1)).await);
        });
    }

    #[test]
    fn test_port_zero_is_never_listening() {
        smol::block_on(async {
            assert!(!is_listening(0, Duration::from_secs(1)).await);
        });
    }
}
