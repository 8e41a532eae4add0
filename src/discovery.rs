//! Discovery Engine: mDNS/DNS-SD registration and browsing for
//! `_warpdeck._tcp`. Peers are tracked in a single map keyed by device id,
//! populated on resolve and purged on goodbye, with a background thread
//! supervising the mDNS backend and reconnecting on failure.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mdns_sd::{IfKind, ServiceDaemon, ServiceEvent, ServiceInfo};
use parking_lot::RwLock;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, trace, warn};

use crate::config::{
    RECONNECT_INITIAL_BACKOFF_SECS, RECONNECT_MAX_ATTEMPTS, RECONNECT_MAX_BACKOFF_SECS,
    SERVICE_TYPE,
};
use crate::error::{Result, WarpDeckError};
use crate::events::WarpDeckEvent;
use crate::model::PeerRecord;

const BROWSE_RECV_TIMEOUT: Duration = Duration::from_millis(200);

/// Interface name fragments that almost always belong to virtual adapters
/// (VPNs, container bridges, hypervisor NICs) rather than real LAN links.
/// Disabling them keeps mDNS traffic off links peers are never reachable on.
const VIRTUAL_INTERFACE_PATTERNS: &[&str] = &[
    "vmnet", "vmware", "virtualbox", "vboxnet", "hyper-v", "wsl", "docker", "br-", "veth",
    "virbr", "lxcbr", "lxdbr", "podman", "cni", "flannel", "calico", "weave", "bluetooth",
    "tap", "tun", "utun", "pptp", "ipsec", "wireguard", "wg", "nordlynx", "proton", "mullvad",
];

pub struct DiscoveryEngine {
    daemon: ServiceDaemon,
    local_device_id: String,
    running: Arc<AtomicBool>,
    peers: Arc<RwLock<HashMap<String, PeerRecord>>>,
    fullname: RwLock<Option<String>>,
}

impl DiscoveryEngine {
    pub fn new(local_device_id: impl Into<String>) -> Result<Self> {
        let daemon = ServiceDaemon::new()?;
        disable_virtual_interfaces(&daemon);

        Ok(Self {
            daemon,
            local_device_id: local_device_id.into(),
            running: Arc::new(AtomicBool::new(false)),
            peers: Arc::new(RwLock::new(HashMap::new())),
            fullname: RwLock::new(None),
        })
    }

    /// `start(name, id, platform, port, fingerprint)` — idempotent,
    /// publishes the advertised record and begins browsing for siblings.
    /// Resolved peers and backend failures are published onto `events`.
    pub fn start(
        &self,
        name: &str,
        platform: &str,
        port: u16,
        fingerprint: &str,
        events: UnboundedSender<WarpDeckEvent>,
    ) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.announce(name, platform, port, fingerprint)?;

        let receiver = self.daemon.browse(SERVICE_TYPE)?;
        let running = self.running.clone();
        let peers = self.peers.clone();
        let local_id = self.local_device_id.clone();
        let daemon = self.daemon.clone();

        std::thread::Builder::new()
            .name("warpdeck-discovery-browse".into())
            .spawn(move || run_browse_thread(daemon, receiver, running, peers, local_id, events))
            .map_err(|e| WarpDeckError::Discovery(e.to_string()))?;

        Ok(())
    }

    /// `stop()` — unregisters the record, stops browsing, purges cached
    /// peers, and releases the mDNS backend.
    pub fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(fullname) = self.fullname.write().take() {
            let _ = self.daemon.unregister(&fullname);
        }
        let _ = self.daemon.stop_browse(SERVICE_TYPE);
        self.peers.write().clear();
        let _ = self.daemon.shutdown();
        Ok(())
    }

    /// `rename(new_name)` — updates the advertised instance name and TXT
    /// `name=` by re-publishing the record.
    pub fn rename(
        &self,
        new_name: &str,
        platform: &str,
        port: u16,
        fingerprint: &str,
    ) -> Result<()> {
        if let Some(fullname) = self.fullname.write().take() {
            let _ = self.daemon.unregister(&fullname);
        }
        self.announce(new_name, platform, port, fingerprint)
    }

    /// `list_peers()` — a thread-safe snapshot copy of currently-visible peers.
    pub fn list_peers(&self) -> Vec<PeerRecord> {
        self.peers.read().values().cloned().collect()
    }

    fn announce(&self, name: &str, platform: &str, port: u16, fingerprint: &str) -> Result<()> {
        let mut properties = HashMap::new();
        properties.insert("v".to_string(), "1.0".to_string());
        properties.insert("id".to_string(), self.local_device_id.clone());
        properties.insert("name".to_string(), name.to_string());
        properties.insert("platform".to_string(), platform.to_string());
        properties.insert("port".to_string(), port.to_string());
        properties.insert("fp".to_string(), fingerprint.to_string());

        let host_ipv4 = local_ipv4().unwrap_or_else(|| "0.0.0.0".to_string());
        let hostname = format!("{}.local.", self.local_device_id);

        let service_info = ServiceInfo::new(
            SERVICE_TYPE,
            name,
            &hostname,
            host_ipv4.as_str(),
            port,
            properties,
        )
        .map_err(|e| WarpDeckError::Discovery(e.to_string()))?
        .enable_addr_auto();

        let fullname = service_info.get_fullname().to_string();
        self.daemon.register(service_info)?;
        *self.fullname.write() = Some(fullname);
        info!(name, port, "discovery announced");
        Ok(())
    }
}

impl Drop for DiscoveryEngine {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn disable_virtual_interfaces(daemon: &ServiceDaemon) {
    for pattern in VIRTUAL_INTERFACE_PATTERNS {
        if let Err(e) = daemon.disable_interface(IfKind::Name((*pattern).to_string())) {
            trace!("could not disable interface pattern {pattern}: {e}");
        }
    }
}

fn handle_event(
    event: ServiceEvent,
    local_device_id: &str,
    peers: &Arc<RwLock<HashMap<String, PeerRecord>>>,
    events: &UnboundedSender<WarpDeckEvent>,
) {
    match event {
        ServiceEvent::ServiceResolved(info) => {
            handle_resolved(&info, local_device_id, peers, events);
        }
        ServiceEvent::ServiceRemoved(_ty, fullname) => {
            handle_removed(&fullname, peers, events);
        }
        _ => {}
    }
}

fn handle_resolved(
    info: &ServiceInfo,
    local_device_id: &str,
    peers: &Arc<RwLock<HashMap<String, PeerRecord>>>,
    events: &UnboundedSender<WarpDeckEvent>,
) {
    let props = info.get_properties();

    let Some(device_id) = non_empty(props.get_property_val_str("id")) else {
        debug!("dropping peer record: missing/empty id");
        return;
    };
    let Some(name) = non_empty(props.get_property_val_str("name")) else {
        debug!("dropping peer record {device_id}: missing/empty name");
        return;
    };
    let Some(platform) = non_empty(props.get_property_val_str("platform")) else {
        debug!("dropping peer record {device_id}: missing/empty platform");
        return;
    };
    let Some(fingerprint) = non_empty(props.get_property_val_str("fp")) else {
        debug!("dropping peer record {device_id}: missing/empty fp");
        return;
    };
    let Some(port_str) = non_empty(props.get_property_val_str("port")) else {
        debug!("dropping peer record {device_id}: missing/empty port");
        return;
    };
    let Ok(port) = port_str.parse::<u32>() else {
        debug!("dropping peer record {device_id}: port not numeric");
        return;
    };
    if port < 1 || port > 65535 {
        debug!("dropping peer record {device_id}: port out of range");
        return;
    }

    if device_id == local_device_id {
        trace!("self-filtered own advertisement");
        return;
    }

    let host_address = info
        .get_addresses()
        .iter()
        .next()
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| info.get_hostname().to_string());

    let record = PeerRecord {
        device_id: device_id.to_string(),
        name: name.to_string(),
        platform: platform.to_string(),
        host_address,
        port: port as u16,
        fingerprint: fingerprint.to_string(),
    };

    let is_new_or_changed = upsert_peer(peers, record.clone());

    if is_new_or_changed {
        let _ = events.send(WarpDeckEvent::PeerDiscovered(record));
    }
}

/// Inserts or updates `record` in `peers`. Returns `false` (and leaves the
/// map untouched) when an entry already exists for this device with the same
/// fingerprint, so repeated mDNS re-resolution of an unchanged peer does not
/// re-fire `PeerDiscovered`.
fn upsert_peer(peers: &Arc<RwLock<HashMap<String, PeerRecord>>>, record: PeerRecord) -> bool {
    let mut peers = peers.write();
    match peers.get(&record.device_id) {
        Some(existing) if existing.fingerprint == record.fingerprint => false,
        _ => {
            peers.insert(record.device_id.clone(), record);
            true
        }
    }
}

fn handle_removed(
    fullname: &str,
    peers: &Arc<RwLock<HashMap<String, PeerRecord>>>,
    events: &UnboundedSender<WarpDeckEvent>,
) {
    let instance = fullname.split('.').next().unwrap_or(fullname);
    let removed_id = {
        let mut peers = peers.write();
        let found = peers
            .values()
            .find(|p| p.name == instance)
            .map(|p| p.device_id.clone());
        if let Some(id) = &found {
            peers.remove(id);
        }
        found
    };
    if let Some(device_id) = removed_id {
        let _ = events.send(WarpDeckEvent::PeerLost(device_id));
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|s| !s.is_empty())
}

fn local_ipv4() -> Option<String> {
    use std::net::UdpSocket;
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    socket.local_addr().ok().map(|a| a.ip().to_string())
}

/// Drains the browse channel until it closes (either because `stop()` asked
/// us to, or because the mDNS backend died), then hands off to the
/// reconnection supervisor. Returns once `stop()` has been called or
/// reconnection has been exhausted.
fn run_browse_thread(
    daemon: ServiceDaemon,
    mut receiver: mdns_sd::Receiver<ServiceEvent>,
    running: Arc<AtomicBool>,
    peers: Arc<RwLock<HashMap<String, PeerRecord>>>,
    local_id: String,
    events: UnboundedSender<WarpDeckEvent>,
) {
    loop {
        while running.load(Ordering::SeqCst) {
            match receiver.recv_timeout(BROWSE_RECV_TIMEOUT) {
                Ok(event) => handle_event(event, &local_id, &peers, &events),
                Err(mdns_sd::RecvTimeoutError::Timeout) => continue,
                Err(_) => break,
            }
        }

        if !running.load(Ordering::SeqCst) {
            return;
        }

        match reconnect_browse(&daemon, &running, &events) {
            Some(new_receiver) => receiver = new_receiver,
            None => return,
        }
    }
}

/// Exponential-backoff reconnection: starts at 1 s, doubles each attempt,
/// caps at 30 s, gives up after 10 attempts and raises `on_error`.
fn reconnect_browse(
    daemon: &ServiceDaemon,
    running: &Arc<AtomicBool>,
    events: &UnboundedSender<WarpDeckEvent>,
) -> Option<mdns_sd::Receiver<ServiceEvent>> {
    let mut backoff = RECONNECT_INITIAL_BACKOFF_SECS;
    for attempt in 1..=RECONNECT_MAX_ATTEMPTS {
        if !running.load(Ordering::SeqCst) {
            return None;
        }
        std::thread::sleep(Duration::from_secs(backoff));
        match daemon.browse(SERVICE_TYPE) {
            Ok(receiver) => {
                info!("discovery backend reconnected on attempt {attempt}");
                return Some(receiver);
            }
            Err(e) => {
                warn!("discovery reconnect attempt {attempt} failed: {e}");
                backoff = (backoff * 2).min(RECONNECT_MAX_BACKOFF_SECS);
            }
        }
    }
    error!("discovery reconnection exhausted after {RECONNECT_MAX_ATTEMPTS} attempts");
    let _ = events.send(WarpDeckEvent::Error(
        "discovery backend unavailable after exhausting reconnection attempts".to_string(),
    ));
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_empty_filters_blank_strings() {
        assert_eq!(non_empty(Some("")), None);
        assert_eq!(non_empty(Some("x")), Some("x"));
        assert_eq!(non_empty(None), None);
    }

    #[test]
    fn virtual_interface_patterns_cover_common_vpn_and_container_names() {
        assert!(VIRTUAL_INTERFACE_PATTERNS.contains(&"docker"));
        assert!(VIRTUAL_INTERFACE_PATTERNS.contains(&"wireguard"));
        assert!(VIRTUAL_INTERFACE_PATTERNS.contains(&"utun"));
    }

    fn sample_peer(fingerprint: &str) -> PeerRecord {
        PeerRecord {
            device_id: "peer-1".to_string(),
            name: "Peer One".to_string(),
            platform: "linux".to_string(),
            host_address: "192.168.1.5".to_string(),
            port: 54321,
            fingerprint: fingerprint.to_string(),
        }
    }

    #[test]
    fn upsert_peer_reports_new_entry() {
        let peers = Arc::new(RwLock::new(HashMap::new()));
        assert!(upsert_peer(&peers, sample_peer("aaaa")));
        assert_eq!(peers.read().len(), 1);
    }

    #[test]
    fn upsert_peer_is_a_noop_for_unchanged_resolve() {
        let peers = Arc::new(RwLock::new(HashMap::new()));
        assert!(upsert_peer(&peers, sample_peer("aaaa")));
        assert!(!upsert_peer(&peers, sample_peer("aaaa")));
        assert_eq!(peers.read().len(), 1);
    }

    #[test]
    fn upsert_peer_reports_change_on_fingerprint_rotation() {
        let peers = Arc::new(RwLock::new(HashMap::new()));
        assert!(upsert_peer(&peers, sample_peer("aaaa")));
        assert!(upsert_peer(&peers, sample_peer("bbbb")));
        assert_eq!(peers.read().get("peer-1").unwrap().fingerprint, "bbbb");
    }
}
