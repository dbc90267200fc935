//! Managing several tunnels at once.
//!
//! This module provides:
//! - `TunnelManager` - owns one controller per open tunnel
//! - `SharedTunnel` - a controller behind a mutex, so several tasks can use
//!   the same tunnel while calls on it stay serialized
//! - One event stream covering every managed tunnel

use super::bookmark::BookmarkResolver;
use super::controller::{TunnelController, event_channel};
use super::error::TunnelError;
use super::process::{ProcessLauncher, SystemLauncher};
use super::settings::TunnelSettings;
use super::types::{TunnelConfig, TunnelEvent, TunnelId};
use async_broadcast::{InactiveReceiver, Receiver, Sender};
use async_lock::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// A controller shared between tasks
pub type SharedTunnel<L> = Arc<Mutex<TunnelController<L>>>;

pub struct TunnelManager<L: ProcessLauncher + Clone = SystemLauncher> {
    launcher: L,
    settings: TunnelSettings,
    bookmarks: Option<Arc<dyn BookmarkResolver>>,
    tunnels: HashMap<TunnelId, SharedTunnel<L>>,
    /// Phase changes of all tunnels, broadcast to every subscriber
    events_tx: Sender<TunnelEvent>,
    events_rx: InactiveReceiver<TunnelEvent>,
}

impl TunnelManager<SystemLauncher> {
    pub fn new(settings: TunnelSettings) -> Self {
        Self::with_launcher(SystemLauncher, settings)
    }
}

impl<L: ProcessLauncher + Clone> TunnelManager<L> {
    pub fn with_launcher(launcher: L, settings: TunnelSettings) -> Self {
        let (events_tx, events_rx) = event_channel();
        Self {
            launcher,
            settings,
            bookmarks: None,
            tunnels: HashMap::new(),
            events_tx,
            events_rx,
        }
    }

    /// Resolve bookmarked keys of every tunnel with this resolver
    pub fn with_bookmark_resolver(mut self, resolver: Arc<dyn BookmarkResolver>) -> Self {
        self.bookmarks = Some(resolver);
        self
    }

    /// Subscribe to phase changes of all managed tunnels
    pub fn subscribe(&self) -> Receiver<TunnelEvent> {
        self.events_rx.activate_cloned()
    }

    /// Establish a new tunnel and start managing it.
    ///
    /// On failure nothing is registered and nothing is left running.
    pub async fn open(&mut self, config: &TunnelConfig) -> Result<(TunnelId, u16), TunnelError> {
        let mut controller =
            TunnelController::with_launcher(self.launcher.clone(), self.settings.clone())
                .with_event_channel(self.events_tx.clone(), self.events_rx.clone());
        if let Some(resolver) = &self.bookmarks {
            controller = controller.with_bookmark_resolver(resolver.clone());
        }

        let id = controller.id();
        let local_port = controller.establish(config).await?;
        self.tunnels.insert(id, Arc::new(Mutex::new(controller)));
        tracing::debug!("Registered tunnel {} on port {}", id, local_port);

        Ok((id, local_port))
    }

    /// The shared controller for a tunnel
    pub fn get(&self, id: TunnelId) -> Option<SharedTunnel<L>> {
        self.tunnels.get(&id).cloned()
    }

    /// Local port for a tunnel (for the database connection)
    pub async fn local_port(&self, id: TunnelId) -> Option<u16> {
        match self.tunnels.get(&id) {
            Some(tunnel) => Some(tunnel.lock().await.local_port()),
            None => None,
        }
    }

    /// IDs of tunnels that are currently established
    pub async fn active_tunnels(&self) -> Vec<TunnelId> {
        let mut active = Vec::new();
        for (id, tunnel) in &self.tunnels {
            if tunnel.lock().await.is_established() {
                active.push(*id);
            }
        }
        active
    }

    /// Close a specific tunnel and stop managing it.
    ///
    /// Returns false if the id is unknown.
    pub async fn close(&mut self, id: TunnelId) -> bool {
        match self.tunnels.remove(&id) {
            Some(tunnel) => {
                tunnel.lock().await.close().await;
                tracing::debug!("Removed tunnel {} from manager", id);
                true
            }
            None => false,
        }
    }

    /// Close all tunnels (called on app shutdown)
    pub async fn shutdown(&mut self) {
        let ids: Vec<_> = self.tunnels.keys().cloned().collect();
        for id in ids {
            self.close(id).await;
        }
        tracing::info!("All SSH tunnels shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::testing::{FakeBehavior, FakeLauncher};
    use crate::ssh::types::{KeyReference, TunnelPhase};

    fn setup() -> (tempfile::TempDir, TunnelSettings, TunnelConfig) {
        let dir = tempfile::tempdir().unwrap();
        let staging = dir.path().join("tmp");
        std::fs::create_dir_all(&staging).unwrap();
        let key = dir.path().join("id_ed25519");
        std::fs::write(&key, b"key").unwrap();

        let settings = TunnelSettings {
            settle_delay_ms: 20,
            terminate_grace_ms: 5,
            probe_timeout_ms: 500,
            key_storage_dir: None,
            temp_dir: Some(staging),
            ..TunnelSettings::default()
        };
        let config = TunnelConfig::with_key_path(
            "bastion",
            22,
            "deploy",
            key.display().to_string(),
            "db.internal",
            5432,
        );
        (dir, settings, config)
    }

    #[test]
    fn test_open_and_close_tunnels() {
        smol::block_on(async {
            let (_dir, settings, config) = setup();
            let launcher = FakeLauncher::new(FakeBehavior::Forward);
            let mut manager = TunnelManager::with_launcher(launcher.clone(), settings);

            let (a, port_a) = manager.open(&config).await.unwrap();
            let (b, port_b) = manager.open(&config).await.unwrap();
            assert_ne!(a, b);
            assert_ne!(port_a, port_b);
            assert_eq!(manager.local_port(a).await, Some(port_a));
            assert_eq!(launcher.running(), 2);

            let mut active = manager.active_tunnels().await;
            active.sort();
            let mut expected = vec![a, b];
            expected.sort();
            assert_eq!(active, expected);

            assert!(manager.close(a).await);
            assert!(!manager.close(a).await);
            assert_eq!(manager.local_port(a).await, None);
            assert_eq!(launcher.running(), 1);

            manager.shutdown().await;
            assert_eq!(launcher.running(), 0);
            assert!(manager.active_tunnels().await.is_empty());
        });
    }

    #[test]
    fn test_failed_open_registers_nothing() {
        smol::block_on(async {
            let (_dir, settings, config) = setup();
            let launcher = FakeLauncher::new(FakeBehavior::Forward);
            let mut manager = TunnelManager::with_launcher(launcher.clone(), settings);
            let mut events = manager.subscribe();

            let config = TunnelConfig {
                key: KeyReference::Path("/no/such/key".into()),
                ..config
            };
            let err = manager.open(&config).await.unwrap_err();
            assert!(matches!(err, TunnelError::InvalidKeyPath { .. }));
            assert!(manager.active_tunnels().await.is_empty());

            let mut last = None;
            while let Ok(event) = events.try_recv() {
                last = Some(event.phase);
            }
            assert_eq!(last, Some(TunnelPhase::Closed));
        });
    }

    #[test]
    fn test_shared_tunnel_serializes_callers() {
        smol::block_on(async {
            let (_dir, settings, config) = setup();
            let launcher = FakeLauncher::new(FakeBehavior::Forward);
            let mut manager = TunnelManager::with_launcher(launcher.clone(), settings);

            let (id, _) = manager.open(&config).await.unwrap();
            let shared = manager.get(id).unwrap();

            let checker = {
                let shared = shared.clone();
                smol::spawn(async move { shared.lock().await.check_alive().await })
            };
            assert_eq!(checker.await, Ok(()));

            shared.lock().await.close().await;
            assert!(manager.active_tunnels().await.is_empty());
            assert_eq!(launcher.running(), 0);
        });
    }

    #[test]
    fn test_subscribers_see_events_of_every_tunnel() {
        smol::block_on(async {
            let (_dir, settings, config) = setup();
            let launcher = FakeLauncher::new(FakeBehavior::Forward);
            let mut manager = TunnelManager::with_launcher(launcher, settings);
            let mut ui = manager.subscribe();
            let mut logger = manager.subscribe();

            let (a, port_a) = manager.open(&config).await.unwrap();
            let (b, port_b) = manager.open(&config).await.unwrap();

            for events in [&mut ui, &mut logger] {
                let mut established = Vec::new();
                while let Ok(event) = events.try_recv() {
                    if let TunnelPhase::Established { local_port } = event.phase {
                        established.push((event.id, local_port));
                    }
                }
                assert_eq!(established, vec![(a, port_a), (b, port_b)]);
            }

            manager.shutdown().await;
        });
    }
}
