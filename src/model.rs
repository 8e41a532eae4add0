//! Wire and domain types shared across the identity, discovery, protocol and
//! transfer subsystems.

use serde::{Deserialize, Serialize};

/// The local node's identity as reported to peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: String,
    pub name: String,
    pub platform: String,
    pub protocol_version: String,
}

/// A currently-visible LAN peer, inserted on mDNS resolve and removed on
/// mDNS goodbye.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerRecord {
    pub device_id: String,
    pub name: String,
    pub platform: String,
    pub host_address: String,
    pub port: u16,
    pub fingerprint: String,
}

/// A peer the local trust store has paired with.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrustedPeerRecord {
    pub device_id: String,
    pub fingerprint: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferDirection {
    Sending,
    Receiving,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferStatus {
    PendingApproval,
    Approved,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TransferStatus {
    /// Terminal statuses are sticky: once reached, no further transition is
    /// permitted.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferStatus::Completed | TransferStatus::Failed | TransferStatus::Cancelled
        )
    }
}

/// One file within a transfer session. `hash` is the hex-encoded SHA-256 of
/// the file contents; it is omitted from the wire form (not `null`) when
/// absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMetadata {
    pub name: String,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub hash: Option<String>,
}

/// One active or terminated transfer, owned exclusively by the transfer
/// state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSession {
    pub transfer_id: String,
    pub peer_device_id: String,
    pub peer_name: String,
    pub direction: TransferDirection,
    pub status: TransferStatus,
    pub files: Vec<FileMetadata>,
    pub total_bytes: u64,
    pub transferred_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub destination_folder: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

impl TransferSession {
    /// `file_index` is defined by position in `files`; the upload URL
    /// addresses a file by this index.
    pub fn file(&self, index: usize) -> Option<&FileMetadata> {
        self.files.get(index)
    }
}

/// Sender's transfer proposal, `POST /api/v1/transfer/request`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxRequest {
    pub files: Vec<FileMetadata>,
}

/// Server's accept response for a transfer proposal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxResponse {
    pub transfer_id: String,
    pub status: String,
    pub expires_at: String,
}

/// The error envelope every non-2xx HTTP response carries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error_code: String,
    pub message: String,
}

/// `GET /health` response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub timestamp: String,
    pub port: u16,
}

/// Result of one client-side protocol call: status code, raw body, a success
/// flag, and an optional error message extracted from the error envelope.
#[derive(Debug, Clone)]
pub struct ClientResponse {
    pub status_code: u16,
    pub body: Vec<u8>,
    pub success: bool,
    pub error_message: Option<String>,
}

impl ClientResponse {
    pub fn transport_failure(message: impl Into<String>) -> Self {
        Self {
            status_code: 0,
            body: Vec::new(),
            success: false,
            error_message: Some(message.into()),
        }
    }
}

/// An RFC 3339 / ISO-8601 UTC timestamp with a literal `Z` suffix.
pub fn now_iso8601() -> String {
    format_offset(time::OffsetDateTime::now_utc())
}

pub fn expiry_iso8601(seconds_from_now: u64) -> String {
    let expiry =
        time::OffsetDateTime::now_utc() + time::Duration::seconds(seconds_from_now as i64);
    format_offset(expiry)
}

fn format_offset(dt: time::OffsetDateTime) -> String {
    dt.format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_has_z_suffix_and_is_plausible() {
        let ts = now_iso8601();
        assert!(ts.ends_with('Z'));
        assert_eq!(ts.len(), 20);
        assert!(ts.starts_with("20"));
    }

    #[test]
    fn expiry_is_after_now() {
        let now = now_iso8601();
        let expiry = expiry_iso8601(1800);
        assert!(expiry > now);
    }

    #[test]
    fn terminal_statuses_are_sticky() {
        assert!(TransferStatus::Completed.is_terminal());
        assert!(TransferStatus::Failed.is_terminal());
        assert!(TransferStatus::Cancelled.is_terminal());
        assert!(!TransferStatus::PendingApproval.is_terminal());
        assert!(!TransferStatus::Approved.is_terminal());
        assert!(!TransferStatus::InProgress.is_terminal());
    }
}
