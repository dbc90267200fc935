//! Tunnel lifecycle: establish, supervise, close.
//!
//! `establish()` walks Allocating -> ResolvingKey -> Launching -> Probing ->
//! Established. Whatever was built before a failing step is torn down again
//! before the error is returned, so a failed establish leaves nothing behind.
//! `close()` is idempotent and best effort: every cleanup step runs even if an
//! earlier one fails.
//!
//! Both take `&mut self`, so one controller never has two calls in flight.
//! Share a controller between tasks through `TunnelManager`, which wraps each
//! one in a mutex.
//!
//! Every resource lands in the controller's handle the moment it exists. If an
//! `establish()` future is dropped halfway, the next `establish()`, `close()` or
//! the controller's `Drop` still finds the ssh process and the key.

use super::bookmark::BookmarkResolver;
use super::error::TunnelError;
use super::key_material::{KeyMaterialHandle, KeyMaterialResolver};
use super::port::{self, LOOPBACK};
use super::process::{ProcessLauncher, SystemLauncher, TransportProcess};
use super::reconnect::{ExponentialBackoff, ReconnectConfig};
use super::settings::TunnelSettings;
use super::supervisor::TransportSupervisor;
use super::types::{TunnelConfig, TunnelEvent, TunnelId, TunnelPhase};
use async_broadcast::{InactiveReceiver, Receiver, Sender};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use uuid::Uuid;

/// Phase events kept per subscriber before the oldest are dropped
const EVENT_BUFFER: usize = 256;

/// Broadcast channel for phase events.
///
/// Every subscriber sees every event sent after it subscribed. A subscriber
/// that falls more than `EVENT_BUFFER` events behind loses the oldest ones.
/// Events sent while nobody listens are discarded.
pub(crate) fn event_channel() -> (Sender<TunnelEvent>, InactiveReceiver<TunnelEvent>) {
    let (mut events_tx, events_rx) = async_broadcast::broadcast(EVENT_BUFFER);
    events_tx.set_overflow(true);
    (events_tx, events_rx.deactivate())
}

/// Everything one tunnel owns, including a half-built one.
///
/// `local_port` is nonzero exactly when the tunnel is established.
struct TunnelHandle<P> {
    local_port: u16,
    process: Option<P>,
    key: Option<KeyMaterialHandle>,
}

impl<P> Default for TunnelHandle<P> {
    fn default() -> Self {
        Self {
            local_port: 0,
            process: None,
            key: None,
        }
    }
}

impl<P> TunnelHandle<P> {
    fn is_empty(&self) -> bool {
        self.process.is_none() && self.key.is_none()
    }
}

pub struct TunnelController<L: ProcessLauncher = SystemLauncher> {
    id: TunnelId,
    settings: TunnelSettings,
    supervisor: TransportSupervisor<L>,
    keys: KeyMaterialResolver,
    handle: TunnelHandle<L::Process>,
    phase: TunnelPhase,
    last_port: u16,
    events_tx: Sender<TunnelEvent>,
    events_rx: InactiveReceiver<TunnelEvent>,
}

impl TunnelController<SystemLauncher> {
    /// Controller that launches the system ssh binary
    pub fn new(settings: TunnelSettings) -> Self {
        Self::with_launcher(SystemLauncher, settings)
    }
}

impl<L: ProcessLauncher> TunnelController<L> {
    pub fn with_launcher(launcher: L, settings: TunnelSettings) -> Self {
        let (events_tx, events_rx) = event_channel();
        Self {
            id: Uuid::new_v4(),
            supervisor: TransportSupervisor::new(launcher, settings.clone()),
            keys: KeyMaterialResolver::new(&settings),
            settings,
            handle: TunnelHandle::default(),
            phase: TunnelPhase::Idle,
            last_port: 0,
            events_tx,
            events_rx,
        }
    }

    /// Resolve bookmarked keys with a platform-specific resolver
    pub fn with_bookmark_resolver(mut self, resolver: Arc<dyn BookmarkResolver>) -> Self {
        self.keys = self.keys.clone().with_bookmark_resolver(resolver);
        self
    }

    /// Publish phase changes on a channel shared with other controllers
    pub fn with_event_channel(
        mut self,
        events_tx: Sender<TunnelEvent>,
        events_rx: InactiveReceiver<TunnelEvent>,
    ) -> Self {
        self.events_tx = events_tx;
        self.events_rx = events_rx;
        self
    }

    pub fn id(&self) -> TunnelId {
        self.id
    }

    pub fn phase(&self) -> TunnelPhase {
        self.phase
    }

    /// Subscribe to phase changes from now on
    pub fn subscribe(&self) -> Receiver<TunnelEvent> {
        self.events_rx.activate_cloned()
    }

    /// The forwarded local port, or 0 when no tunnel is up
    pub fn local_port(&self) -> u16 {
        self.handle.local_port
    }

    pub fn is_established(&self) -> bool {
        self.phase.is_established()
    }

    /// Address the database client should connect to instead of the remote host
    pub fn connect_addr(&self) -> Result<SocketAddr, TunnelError> {
        if !self.is_established() {
            return Err(TunnelError::TunnelNotEstablished);
        }
        Ok(SocketAddr::from((LOOPBACK, self.handle.local_port)))
    }

    /// Bring the tunnel up and return the local port to connect to.
    ///
    /// An already established tunnel is closed first.
    pub async fn establish(&mut self, config: &TunnelConfig) -> Result<u16, TunnelError> {
        if !self.handle.is_empty() {
            tracing::info!(
                "Tunnel {} still open on port {}, closing it first",
                self.id,
                self.handle.local_port
            );
            self.close().await;
        }

        match self.build(config).await {
            Ok(local_port) => {
                self.handle.local_port = local_port;
                self.last_port = local_port;
                self.set_phase(TunnelPhase::Established { local_port });
                tracing::info!(
                    "SSH tunnel {} established: 127.0.0.1:{} -> {}:{} via {}",
                    self.id,
                    local_port,
                    config.remote_host,
                    config.remote_port,
                    config.ssh_destination()
                );
                Ok(local_port)
            }
            Err(e) => {
                tracing::warn!("SSH tunnel {} failed to establish: {}", self.id, e);
                let partial = std::mem::take(&mut self.handle);
                self.teardown(partial).await;
                self.set_phase(TunnelPhase::Closed);
                Err(e)
            }
        }
    }

    /// Build the tunnel into `self.handle` and return its port
    async fn build(&mut self, config: &TunnelConfig) -> Result<u16, TunnelError> {
        self.set_phase(TunnelPhase::Allocating);
        let local_port = port::allocate_port_excluding(&[self.last_port]).await?;

        self.set_phase(TunnelPhase::ResolvingKey);
        let key = self.keys.resolve(&config.key).await?;
        let key_path = key.path().to_path_buf();
        self.handle.key = Some(key);

        self.set_phase(TunnelPhase::Launching);
        self.supervisor
            .launch(config, local_port, &key_path, &mut self.handle.process)
            .await?;

        self.set_phase(TunnelPhase::Probing);
        if !port::is_listening(local_port, self.settings.probe_timeout()).await {
            return Err(TunnelError::PortForwardingFailed(format!(
                "SSH tunnel failed to establish - local port {} not listening",
                local_port
            )));
        }

        Ok(local_port)
    }

    /// `establish()` with exponential backoff on retriable errors.
    pub async fn establish_with_retry(
        &mut self,
        config: &TunnelConfig,
        reconnect: ReconnectConfig,
    ) -> Result<u16, TunnelError> {
        let mut backoff = ExponentialBackoff::new(reconnect);

        loop {
            match self.establish(config).await {
                Ok(local_port) => {
                    if backoff.retries() > 0 {
                        tracing::info!(
                            "SSH tunnel {} established after {} retries",
                            self.id,
                            backoff.retries()
                        );
                    }
                    return Ok(local_port);
                }
                Err(e) if e.is_retriable() => match backoff.next_delay() {
                    Some(delay) => {
                        tracing::info!(
                            "SSH tunnel {} retry {} scheduled in {:?}: {}",
                            self.id,
                            backoff.retries(),
                            delay,
                            e
                        );
                        smol::Timer::after(delay).await;
                    }
                    None => {
                        tracing::error!(
                            "SSH tunnel {} failed after {} retries: {}",
                            self.id,
                            backoff.retries(),
                            e
                        );
                        return Err(e);
                    }
                },
                Err(e) => return Err(e),
            }
        }
    }

    /// Tear the tunnel down. A no-op when nothing is established.
    pub async fn close(&mut self) {
        if self.handle.is_empty() {
            return;
        }

        self.set_phase(TunnelPhase::Closing);
        let handle = std::mem::take(&mut self.handle);
        let local_port = handle.local_port;
        self.teardown(handle).await;
        self.set_phase(TunnelPhase::Closed);

        tracing::info!("SSH tunnel {} on port {} closed", self.id, local_port);
    }

    async fn teardown(&self, mut handle: TunnelHandle<L::Process>) {
        if let Some(mut process) = handle.process.take() {
            self.supervisor.terminate(&mut process).await;
        }
        if let Some(key) = handle.key.take() {
            key.release();
        }
    }

    /// Check that the ssh process is still running.
    ///
    /// A dead tunnel is closed and reported as `ConnectionFailed` with
    /// whatever ssh printed before exiting.
    pub async fn check_alive(&mut self) -> Result<(), TunnelError> {
        if !self.is_established() {
            return Err(TunnelError::TunnelNotEstablished);
        }
        let drain = self.settings.output_drain();
        let process = self
            .handle
            .process
            .as_mut()
            .ok_or(TunnelError::TunnelNotEstablished)?;

        let detail = match process.try_wait() {
            Ok(None) => return Ok(()),
            Ok(Some(status)) => {
                let output = process.collect_output(drain).await;
                match output.diagnostic() {
                    d if d.is_empty() => format!("ssh exited with {}", status),
                    d => d,
                }
            }
            Err(e) => format!("Failed to check ssh process status: {}", e),
        };

        tracing::warn!("SSH tunnel {} is down: {}", self.id, detail);
        self.close().await;
        Err(TunnelError::ConnectionFailed(detail))
    }

    /// Check that ssh can log in with this configuration, without forwarding
    pub async fn test_connection(&self, config: &TunnelConfig) -> Result<(), TunnelError> {
        let key = self.keys.resolve(&config.key).await?;
        let result = self.supervisor.test_connection(config, key.path()).await;
        key.release();
        result
    }

    /// Run `body` against an established tunnel, closing it afterwards on
    /// every path.
    pub async fn scoped<T, F, Fut>(
        &mut self,
        config: &TunnelConfig,
        body: F,
    ) -> Result<T, TunnelError>
    where
        F: FnOnce(u16) -> Fut,
        Fut: Future<Output = T>,
    {
        let local_port = self.establish(config).await?;
        let result = body(local_port).await;
        self.close().await;
        Ok(result)
    }

    fn set_phase(&mut self, phase: TunnelPhase) {
        self.phase = phase;
        tracing::debug!("SSH tunnel {} -> {:?}", self.id, phase);
        // Inactive means nobody is subscribed; overflow evicts instead of failing
        if let Err(e) = self.events_tx.try_broadcast(TunnelEvent::new(self.id, phase)) {
            tracing::trace!("Phase event for tunnel {} not delivered: {}", self.id, e);
        }
    }
}

impl<L: ProcessLauncher> Drop for TunnelController<L> {
    fn drop(&mut self) {
        if self.handle.is_empty() {
            return;
        }

        tracing::warn!(
            "SSH tunnel {} dropped without close(), tearing down",
            self.id
        );
        if let Some(mut process) = self.handle.process.take() {
            TransportSupervisor::<L>::terminate_now(&mut process);
        }
        if let Some(key) = self.handle.key.take() {
            key.release();
        }
        self.handle.local_port = 0;
    }
}
