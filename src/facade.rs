//! Facade: the single entry point an embedder constructs, wiring the
//! identity store, discovery engine, protocol server, protocol client and
//! transfer state machine together. Implements the embedder operations
//! (`create/destroy/start/stop/set_device_name/initiate_transfer/
//! respond_to_transfer/cancel_transfer/get_trusted_devices/
//! remove_trusted_device`).

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::config::WarpDeckConfig;
use crate::discovery::DiscoveryEngine;
use crate::error::{Result, WarpDeckError};
use crate::events::{EventDispatcher, WarpDeckEventHandler};
use crate::identity::IdentityStore;
use crate::model::{DeviceInfo, PeerRecord, TrustedPeerRecord, TxRequest};
use crate::protocol_client::ProtocolClient;
use crate::server::ProtocolServer;
use crate::transfer::TransferManager;

/// The running daemon. Cheap to clone (it is handed out as `Arc<WarpDeck>`);
/// every method takes `&self` and is safe to call from multiple tasks.
pub struct WarpDeck {
    identity: Arc<IdentityStore>,
    discovery: Arc<DiscoveryEngine>,
    transfer_manager: Arc<TransferManager>,
    protocol_client: Arc<ProtocolClient>,
    server: tokio::sync::Mutex<Option<ProtocolServer>>,
    bound_port: RwLock<Option<u16>>,
    // Kept alive for as long as `WarpDeck` is; dropping it would end the
    // embedder callback dispatch task.
    _dispatcher: EventDispatcher,
    events: tokio::sync::mpsc::UnboundedSender<crate::events::WarpDeckEvent>,
    device_name: RwLock<String>,
    platform: String,
    download_dir: RwLock<PathBuf>,
    desired_port: u16,
    auto_accept_trusted: RwLock<bool>,
}

impl WarpDeck {
    /// `create(config, handler)` — loads or generates identity, prepares the
    /// download directory, and spins up the event dispatcher. Does not bind
    /// a port or announce on the network; call `start()` for that.
    pub fn create(config: WarpDeckConfig, handler: Arc<dyn WarpDeckEventHandler>) -> Result<Arc<Self>> {
        let identity = IdentityStore::initialize(&config.config_dir)?;
        std::fs::create_dir_all(&config.download_dir)?;

        let dispatcher = EventDispatcher::spawn(handler);
        let events = dispatcher.sender();

        let discovery = Arc::new(DiscoveryEngine::new(identity.device_id().to_string())?);
        let transfer_manager = TransferManager::new(events.clone());
        let protocol_client = Arc::new(ProtocolClient::new(identity.clone()));

        info!(device_id = identity.device_id(), "warpdeck core created");

        Ok(Arc::new(Self {
            identity,
            discovery,
            transfer_manager,
            protocol_client,
            server: tokio::sync::Mutex::new(None),
            bound_port: RwLock::new(None),
            _dispatcher: dispatcher,
            events,
            device_name: RwLock::new(config.device_name),
            platform: config.platform,
            download_dir: RwLock::new(config.download_dir),
            desired_port: config.desired_port,
            auto_accept_trusted: RwLock::new(config.auto_accept_trusted),
        }))
    }

    /// `destroy()` — releases the `Arc`. The protocol server and discovery
    /// engine both stop themselves in `Drop` once every handle to them is
    /// gone, so there is nothing else for this to do explicitly.
    pub fn destroy(self: Arc<Self>) {
        drop(self);
    }

    pub fn device_id(&self) -> &str {
        self.identity.device_id()
    }

    pub fn fingerprint(&self) -> String {
        self.identity.fingerprint()
    }

    pub fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            id: self.identity.device_id().to_string(),
            name: self.device_name.read().clone(),
            platform: self.platform.clone(),
            protocol_version: crate::config::PROTOCOL_VERSION.to_string(),
        }
    }

    /// `start()` — binds the protocol server (scanning `[54321, 65535)` if
    /// `desired_port == 0`) and begins mDNS advertisement/browsing. Calling
    /// this twice without an intervening `stop()` is an error.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut server_guard = self.server.lock().await;
        if server_guard.is_some() {
            return Err(WarpDeckError::AlreadyRunning);
        }

        let device_info = self.device_info();
        let download_dir = self.download_dir.read().clone();
        let auto_accept_trusted = *self.auto_accept_trusted.read();

        let server = ProtocolServer::start(
            self.desired_port,
            self.identity.clone(),
            self.discovery.clone(),
            self.transfer_manager.clone(),
            device_info,
            download_dir,
            auto_accept_trusted,
        )
        .await?;

        let port = server.port();
        *server_guard = Some(server);
        *self.bound_port.write() = Some(port);
        drop(server_guard);

        let device_name = self.device_name.read().clone();
        self.discovery.start(
            &device_name,
            &self.platform,
            port,
            &self.identity.fingerprint(),
            self.events.clone(),
        )?;

        info!(port, "warpdeck started");
        Ok(())
    }

    /// `stop()` — unregisters from mDNS, stops browsing, and shuts down the
    /// protocol server's accept loop. In-flight connections are allowed to
    /// finish.
    pub async fn stop(&self) -> Result<()> {
        self.discovery.stop()?;
        let mut server_guard = self.server.lock().await;
        if let Some(server) = server_guard.take() {
            server.shutdown();
        }
        *self.bound_port.write() = None;
        info!("warpdeck stopped");
        Ok(())
    }

    /// `set_device_name(name)` — updates the advertised TXT `name=` by
    /// re-publishing the mDNS record, if already started; always updates the
    /// name reported by `/api/v1/info` and future announcements.
    pub fn set_device_name(&self, name: &str) -> Result<()> {
        *self.device_name.write() = name.to_string();
        if let Some(port) = *self.bound_port.read() {
            self.discovery
                .rename(name, &self.platform, port, &self.identity.fingerprint())?;
        }
        Ok(())
    }

    pub fn set_download_dir(&self, path: PathBuf) -> Result<()> {
        std::fs::create_dir_all(&path)?;
        *self.download_dir.write() = path;
        Ok(())
    }

    pub fn download_dir(&self) -> PathBuf {
        self.download_dir.read().clone()
    }

    pub fn set_auto_accept_trusted(&self, enabled: bool) {
        *self.auto_accept_trusted.write() = enabled;
    }

    /// A snapshot of currently-visible LAN peers, for embedders that want to
    /// poll rather than rely solely on `on_peer_discovered`/`on_peer_lost`.
    pub fn list_peers(&self) -> Vec<PeerRecord> {
        self.discovery.list_peers()
    }

    pub fn get_trusted_devices(&self) -> Vec<TrustedPeerRecord> {
        self.identity.list_trusted()
    }

    pub fn remove_trusted_device(&self, device_id: &str) -> Result<()> {
        self.identity.remove_trusted(device_id)
    }

    /// Pairing: records `(device_id, fingerprint, name)` in the trust store
    /// after an out-of-band user confirmation. The only way anything ever
    /// becomes trusted.
    pub fn add_trusted_device(&self, device_id: &str, fingerprint: &str, name: &str) -> Result<()> {
        self.identity.add_trusted(device_id, fingerprint, name)
    }

    /// `initiate_transfer(peer_device_id, file_paths)` — sender side. Looks
    /// up the peer's current address from discovery, hashes and registers
    /// the session, then drives `request_transfer`/`upload_file` against the
    /// peer in a background task. Returns `None` if every file was missing.
    pub fn initiate_transfer(
        self: &Arc<Self>,
        peer_device_id: &str,
        file_paths: &[PathBuf],
    ) -> Result<Option<String>> {
        let peer = self
            .discovery
            .list_peers()
            .into_iter()
            .find(|p| p.device_id == peer_device_id)
            .ok_or_else(|| WarpDeckError::Protocol(format!("unknown peer: {peer_device_id}")))?;

        let Some(transfer_id) =
            self.transfer_manager
                .initiate_transfer(peer_device_id, &peer.name, file_paths)?
        else {
            return Ok(None);
        };

        // Matches TransferManager::initiate_transfer's own existence filter
        // so the upload loop's file index lines up with `session.files`.
        let existing_paths: Vec<PathBuf> = file_paths.iter().filter(|p| p.exists()).cloned().collect();

        let this = self.clone();
        let transfer_id_for_task = transfer_id.clone();
        tokio::spawn(async move {
            this.drive_sending_transfer(transfer_id_for_task, peer, existing_paths)
                .await;
        });

        Ok(Some(transfer_id))
    }

    async fn drive_sending_transfer(&self, transfer_id: String, peer: PeerRecord, file_paths: Vec<PathBuf>) {
        let Some(files) = self.transfer_manager.file_paths_for_sending(&transfer_id) else {
            return;
        };

        let response = self
            .protocol_client
            .request_transfer(&peer.host_address, peer.port, &peer.fingerprint, &TxRequest { files })
            .await;

        if !response.success {
            if response.status_code == 403 {
                self.transfer_manager.mark_sending_declined(&transfer_id);
            } else {
                self.transfer_manager.mark_sending_failed(
                    &transfer_id,
                    response.error_message.as_deref().unwrap_or("transfer request failed"),
                );
            }
            return;
        }
        self.transfer_manager.mark_sending_approved(&transfer_id);

        for (index, path) in file_paths.iter().enumerate() {
            let bytes = match std::fs::read(path) {
                Ok(b) => b,
                Err(e) => {
                    self.transfer_manager.mark_sending_failed(&transfer_id, &e.to_string());
                    return;
                }
            };

            let upload = self
                .protocol_client
                .upload_file(&peer.host_address, peer.port, &peer.fingerprint, &transfer_id, index, bytes)
                .await;

            if !upload.success {
                self.transfer_manager.mark_sending_failed(
                    &transfer_id,
                    upload.error_message.as_deref().unwrap_or("upload failed"),
                );
                return;
            }
            self.transfer_manager.mark_sending_progress(&transfer_id, index);
        }

        self.transfer_manager.mark_sending_completed(&transfer_id);
    }

    /// `respond_to_transfer(id, accept)` — receiver side, delegates straight
    /// to the transfer state machine.
    pub fn respond_to_transfer(&self, transfer_id: &str, accept: bool) -> Result<()> {
        self.transfer_manager.respond_to_transfer(transfer_id, accept)
    }

    pub fn cancel_transfer(&self, transfer_id: &str) {
        self.transfer_manager.cancel_transfer(transfer_id);
    }

    pub fn get_transfer(&self, transfer_id: &str) -> Option<crate::model::TransferSession> {
        self.transfer_manager.get_transfer(transfer_id)
    }

    pub fn active_transfers(&self) -> Vec<crate::model::TransferSession> {
        self.transfer_manager.active_transfers()
    }
}

impl Drop for WarpDeck {
    fn drop(&mut self) {
        if self.bound_port.read().is_some() {
            warn!("WarpDeck dropped without stop(); discovery and server will shut down in their own Drop impls");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::WarpDeckEvent;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        errors: AtomicUsize,
    }
    impl WarpDeckEventHandler for CountingHandler {
        fn on_error(&self, _message: String) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn test_config(dir: &tempfile::TempDir) -> WarpDeckConfig {
        WarpDeckConfig {
            config_dir: dir.path().join("config"),
            download_dir: dir.path().join("downloads"),
            device_name: "Test Device".to_string(),
            platform: "linux".to_string(),
            desired_port: 0,
            auto_accept_trusted: false,
        }
    }

    #[test]
    fn create_loads_identity_and_prepares_download_dir() {
        let dir = tempfile::tempdir().unwrap();
        let handler = Arc::new(CountingHandler {
            errors: AtomicUsize::new(0),
        });
        let warpdeck = WarpDeck::create(test_config(&dir), handler).unwrap();

        assert!(!warpdeck.device_id().is_empty());
        assert!(dir.path().join("downloads").exists());
        assert_eq!(warpdeck.device_info().name, "Test Device");
    }

    #[test]
    fn initiate_transfer_rejects_unknown_peer() {
        let dir = tempfile::tempdir().unwrap();
        let handler = Arc::new(CountingHandler {
            errors: AtomicUsize::new(0),
        });
        let warpdeck = WarpDeck::create(test_config(&dir), handler).unwrap();

        let result = warpdeck.initiate_transfer("no-such-peer", &[PathBuf::from("/tmp/does-not-matter")]);
        assert!(result.is_err());
    }

    #[test]
    fn set_device_name_updates_device_info_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let handler = Arc::new(CountingHandler {
            errors: AtomicUsize::new(0),
        });
        let warpdeck = WarpDeck::create(test_config(&dir), handler).unwrap();

        warpdeck.set_device_name("Renamed Device").unwrap();
        assert_eq!(warpdeck.device_info().name, "Renamed Device");
    }

    #[test]
    fn fresh_install_has_no_trusted_devices() {
        let dir = tempfile::tempdir().unwrap();
        let handler = Arc::new(CountingHandler {
            errors: AtomicUsize::new(0),
        });
        let warpdeck = WarpDeck::create(test_config(&dir), handler).unwrap();
        assert!(warpdeck.get_trusted_devices().is_empty());
    }
}
