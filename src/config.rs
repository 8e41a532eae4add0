//! Daemon-wide configuration: directories, device identity defaults and
//! policy switches.

use std::path::PathBuf;

/// Configuration supplied at daemon construction. Everything here has a
/// sensible platform default; callers (the CLI front-end, out of scope here)
/// are expected to override `device_name` and `download_dir` at minimum.
#[derive(Debug, Clone)]
pub struct WarpDeckConfig {
    /// Directory holding `cert.pem`, `key.pem` and `trust_store.json`.
    pub config_dir: PathBuf,
    /// Directory new incoming files are written to.
    pub download_dir: PathBuf,
    /// Human-readable device name, advertised in mDNS TXT `name=`.
    pub device_name: String,
    /// Platform tag, advertised in mDNS TXT `platform=` (e.g. `macos`,
    /// `linux`, `steamdeck`).
    pub platform: String,
    /// Port the protocol server should bind. `0` selects a free port in
    /// `[54321, 65535)`.
    pub desired_port: u16,
    /// When `true`, an incoming transfer request from an already-trusted
    /// peer is accepted automatically instead of raising
    /// `on_incoming_transfer_request`. Default is conservative (`false`).
    pub auto_accept_trusted: bool,
}

pub const PROTOCOL_VERSION: &str = "1.0";
pub const SERVICE_TYPE: &str = "_warpdeck._tcp.local.";
pub const PORT_SCAN_START: u16 = 54321;
pub const PORT_SCAN_END: u16 = 65535;
pub const APPROVAL_EXPIRY_SECS: u64 = 30 * 60;
pub const RECONNECT_INITIAL_BACKOFF_SECS: u64 = 1;
pub const RECONNECT_MAX_BACKOFF_SECS: u64 = 30;
pub const RECONNECT_MAX_ATTEMPTS: u32 = 10;

impl WarpDeckConfig {
    /// Builds a config with platform defaults for directories, and a
    /// hostname-derived device name.
    pub fn with_defaults(device_name: impl Into<String>) -> Self {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("warpdeck");
        let download_dir = dirs::download_dir().unwrap_or_else(|| PathBuf::from("."));

        Self {
            config_dir,
            download_dir,
            device_name: device_name.into(),
            platform: default_platform_tag().to_string(),
            desired_port: 0,
            auto_accept_trusted: false,
        }
    }
}

fn default_platform_tag() -> &'static str {
    if cfg!(target_os = "macos") {
        "macos"
    } else if cfg!(target_os = "windows") {
        "windows"
    } else if cfg!(target_os = "linux") {
        "linux"
    } else {
        "unknown"
    }
}
