//! Transfer State Machine: per-session lifecycle covering approval,
//! temporary buffering, atomic finalisation, cancellation and cleanup for
//! both sender and receiver roles.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc::UnboundedSender, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, WarpDeckError};
use crate::events::WarpDeckEvent;
use crate::model::{FileMetadata, TransferDirection, TransferSession, TransferStatus, TxRequest};

const TEMP_SUBDIR: &str = ".warpdeck_temp";

struct SessionEntry {
    session: TransferSession,
    /// One temp-file path per `files[]` entry, populated on approval.
    temp_paths: Vec<Option<PathBuf>>,
    /// Set while a RECEIVING session awaits an embedder decision; fired by
    /// `respond_to_transfer` to release the HTTP handler blocked on the
    /// paired receiver.
    approval_tx: Option<oneshot::Sender<bool>>,
}

/// Owns every `TransferSession` and the per-session temp-file paths behind
/// one mutex.
pub struct TransferManager {
    sessions: Mutex<HashMap<String, SessionEntry>>,
    events: UnboundedSender<WarpDeckEvent>,
}

impl TransferManager {
    pub fn new(events: UnboundedSender<WarpDeckEvent>) -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            events,
        })
    }

    /// `initiate_transfer(peer_device_id, file_paths)` — sender side. Skips
    /// files that do not exist; if none remain, returns `None` without
    /// creating a session or firing any callback.
    pub fn initiate_transfer(
        &self,
        peer_device_id: &str,
        peer_name: &str,
        file_paths: &[PathBuf],
    ) -> Result<Option<String>> {
        let mut files = Vec::new();
        let mut total_bytes = 0u64;

        for path in file_paths {
            if !path.exists() {
                debug!("skipping missing file for transfer: {}", path.display());
                continue;
            }
            let metadata = std::fs::metadata(path)?;
            let size = metadata.len();
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "file".to_string());
            let hash = sha256_hex_of_file(path)?;

            total_bytes += size;
            files.push(FileMetadata {
                name,
                size,
                hash: Some(hash),
            });
        }

        if files.is_empty() {
            return Ok(None);
        }

        let transfer_id = Uuid::new_v4().to_string();
        let session = TransferSession {
            transfer_id: transfer_id.clone(),
            peer_device_id: peer_device_id.to_string(),
            peer_name: peer_name.to_string(),
            direction: TransferDirection::Sending,
            status: TransferStatus::PendingApproval,
            files,
            total_bytes,
            transferred_bytes: 0,
            destination_folder: None,
            error: None,
        };

        self.sessions.lock().insert(
            transfer_id.clone(),
            SessionEntry {
                session,
                temp_paths: Vec::new(),
                approval_tx: None,
            },
        );

        Ok(Some(transfer_id))
    }

    /// `handle_incoming_request` — receiver side. Inserts the session
    /// outside any embedder notification, then returns a paired
    /// `oneshot::Receiver` the caller (the protocol server) awaits,
    /// bounded by the 30-minute expiry, to learn the accept/reject decision.
    pub fn handle_incoming_request(
        &self,
        peer_device_id: &str,
        peer_name: &str,
        request: TxRequest,
        destination_folder: PathBuf,
    ) -> (String, oneshot::Receiver<bool>) {
        let transfer_id = Uuid::new_v4().to_string();
        let total_bytes = request.files.iter().map(|f| f.size).sum();

        let session = TransferSession {
            transfer_id: transfer_id.clone(),
            peer_device_id: peer_device_id.to_string(),
            peer_name: peer_name.to_string(),
            direction: TransferDirection::Receiving,
            status: TransferStatus::PendingApproval,
            files: request.files.clone(),
            total_bytes,
            transferred_bytes: 0,
            destination_folder: Some(destination_folder.to_string_lossy().to_string()),
            error: None,
        };

        let (tx, rx) = oneshot::channel();
        {
            let mut sessions = self.sessions.lock();
            sessions.insert(
                transfer_id.clone(),
                SessionEntry {
                    session,
                    temp_paths: vec![None; request.files.len()],
                    approval_tx: Some(tx),
                },
            );
        }

        let _ = self.events.send(WarpDeckEvent::IncomingTransferRequest {
            transfer_id: transfer_id.clone(),
            peer_name: peer_name.to_string(),
            files: request.files,
        });

        (transfer_id, rx)
    }

    /// `respond_to_transfer(id, accept)` — only meaningful in
    /// `PENDING_APPROVAL`; a call in any other state is silently ignored.
    pub fn respond_to_transfer(&self, transfer_id: &str, accept: bool) -> Result<()> {
        let mut sessions = self.sessions.lock();
        let Some(entry) = sessions.get_mut(transfer_id) else {
            return Ok(());
        };
        if entry.session.status != TransferStatus::PendingApproval {
            return Ok(());
        }

        if accept {
            let destination_folder = entry
                .session
                .destination_folder
                .clone()
                .ok_or_else(|| WarpDeckError::Protocol("missing destination folder".to_string()))?;
            for index in 0..entry.session.files.len() {
                let path = create_temporary_file(&destination_folder, transfer_id, index)?;
                entry.temp_paths[index] = Some(path);
            }
            entry.session.status = TransferStatus::Approved;
            if let Some(tx) = entry.approval_tx.take() {
                let _ = tx.send(true);
            }
        } else {
            entry.session.status = TransferStatus::Cancelled;
            entry.session.error = Some("Transfer declined".to_string());
            if let Some(tx) = entry.approval_tx.take() {
                let _ = tx.send(false);
            }
            cleanup_locked(&mut sessions, transfer_id);
            let _ = self.events.send(WarpDeckEvent::TransferCompleted {
                transfer_id: transfer_id.to_string(),
                success: false,
                error_message: Some("Transfer declined".to_string()),
            });
        }

        Ok(())
    }

    /// Called when the approval wait in the protocol server times out
    /// (30 minutes with no embedder decision). Treated the same as an
    /// explicit decline so the HTTP response is decisive either way.
    pub fn expire_transfer(&self, transfer_id: &str) {
        let mut sessions = self.sessions.lock();
        let Some(entry) = sessions.get_mut(transfer_id) else {
            return;
        };
        if entry.session.status != TransferStatus::PendingApproval {
            return;
        }
        entry.session.status = TransferStatus::Cancelled;
        entry.session.error = Some("Approval expired".to_string());
        cleanup_locked(&mut sessions, transfer_id);
        let _ = self.events.send(WarpDeckEvent::TransferCompleted {
            transfer_id: transfer_id.to_string(),
            success: false,
            error_message: Some("Approval expired".to_string()),
        });
    }

    /// Appends `data` to the temp file for `(transfer_id, file_index)`,
    /// advances progress, and finalises the file (and, if all files are
    /// now present, the whole session) when enough bytes have arrived.
    pub fn handle_file_upload(&self, transfer_id: &str, file_index: usize, data: &[u8]) -> Result<()> {
        let mut sessions = self.sessions.lock();
        let Some(entry) = sessions.get_mut(transfer_id) else {
            return Err(WarpDeckError::TransferNotFound(transfer_id.to_string()));
        };

        if entry.session.direction != TransferDirection::Receiving
            || !matches!(
                entry.session.status,
                TransferStatus::Approved | TransferStatus::InProgress
            )
        {
            return Err(WarpDeckError::Protocol(
                "transfer not in a state that accepts uploads".to_string(),
            ));
        }
        let Some(expected_size) = entry.session.files.get(file_index).map(|f| f.size) else {
            return Err(WarpDeckError::Protocol("file index out of range".to_string()));
        };
        let Some(temp_path) = entry.temp_paths.get(file_index).cloned().flatten() else {
            return Err(WarpDeckError::Protocol("no temp file for index".to_string()));
        };

        if let Err(e) = append_to_file(&temp_path, data) {
            entry.session.status = TransferStatus::Failed;
            entry.session.error = Some(e.to_string());
            cleanup_locked(&mut sessions, transfer_id);
            let _ = self.events.send(WarpDeckEvent::TransferCompleted {
                transfer_id: transfer_id.to_string(),
                success: false,
                error_message: Some(e.to_string()),
            });
            return Err(e);
        }

        entry.session.status = TransferStatus::InProgress;
        entry.session.transferred_bytes += data.len() as u64;
        let percent = if entry.session.total_bytes > 0 {
            100.0 * entry.session.transferred_bytes as f64 / entry.session.total_bytes as f64
        } else {
            0.0
        };
        let _ = self.events.send(WarpDeckEvent::TransferProgressUpdate {
            transfer_id: transfer_id.to_string(),
            percent: percent as f32,
            bytes_transferred: entry.session.transferred_bytes,
        });

        let current_size = std::fs::metadata(&temp_path).map(|m| m.len()).unwrap_or(0);
        if current_size < expected_size {
            return Ok(());
        }

        let destination_folder = entry
            .session
            .destination_folder
            .clone()
            .unwrap_or_default();
        let file_name = entry.session.files[file_index].name.clone();

        match finalize_received_file(&destination_folder, &temp_path, &file_name) {
            Ok(()) => {
                entry.temp_paths[file_index] = None;
            }
            Err(e) => {
                entry.session.status = TransferStatus::Failed;
                entry.session.error = Some(e.to_string());
                cleanup_locked(&mut sessions, transfer_id);
                let _ = self.events.send(WarpDeckEvent::TransferCompleted {
                    transfer_id: transfer_id.to_string(),
                    success: false,
                    error_message: Some(e.to_string()),
                });
                return Err(e);
            }
        }

        let all_present = entry
            .session
            .files
            .iter()
            .all(|f| Path::new(&destination_folder).join(sanitize_filename(&f.name)).exists());

        if all_present {
            entry.session.status = TransferStatus::Completed;
            cleanup_locked(&mut sessions, transfer_id);
            let _ = self.events.send(WarpDeckEvent::TransferCompleted {
                transfer_id: transfer_id.to_string(),
                success: true,
                error_message: None,
            });
        }

        Ok(())
    }

    /// `cancel_transfer(id)` — a no-op in terminal states.
    pub fn cancel_transfer(&self, transfer_id: &str) {
        let mut sessions = self.sessions.lock();
        let Some(entry) = sessions.get_mut(transfer_id) else {
            return;
        };
        if entry.session.status.is_terminal() {
            return;
        }
        entry.session.status = TransferStatus::Cancelled;
        entry.session.error = Some("Transfer cancelled".to_string());
        cleanup_locked(&mut sessions, transfer_id);
        let _ = self.events.send(WarpDeckEvent::TransferCompleted {
            transfer_id: transfer_id.to_string(),
            success: false,
            error_message: Some("Transfer cancelled".to_string()),
        });
    }

    pub fn get_transfer(&self, transfer_id: &str) -> Option<TransferSession> {
        self.sessions
            .lock()
            .get(transfer_id)
            .map(|e| e.session.clone())
    }

    pub fn active_transfers(&self) -> Vec<TransferSession> {
        self.sessions
            .lock()
            .values()
            .map(|e| e.session.clone())
            .collect()
    }

    /// Sender-side transition: `request_transfer` returned `202`. No temp
    /// files are involved on this side, so this is kept separate from
    /// `respond_to_transfer`, which provisions temp files on accept.
    pub fn mark_sending_approved(&self, transfer_id: &str) {
        let mut sessions = self.sessions.lock();
        if let Some(entry) = sessions.get_mut(transfer_id) {
            if entry.session.status == TransferStatus::PendingApproval {
                entry.session.status = TransferStatus::Approved;
            }
        }
    }

    /// Sender-side transition: `request_transfer` returned `403`.
    pub fn mark_sending_declined(&self, transfer_id: &str) {
        let mut sessions = self.sessions.lock();
        if sessions.get(transfer_id).is_some() {
            sessions.get_mut(transfer_id).unwrap().session.status = TransferStatus::Cancelled;
            cleanup_locked(&mut sessions, transfer_id);
        }
        let _ = self.events.send(WarpDeckEvent::TransferCompleted {
            transfer_id: transfer_id.to_string(),
            success: false,
            error_message: Some("Transfer declined".to_string()),
        });
    }

    /// Sender-side progress after one file finishes uploading.
    pub fn mark_sending_progress(&self, transfer_id: &str, file_index: usize) {
        let mut sessions = self.sessions.lock();
        let Some(entry) = sessions.get_mut(transfer_id) else {
            return;
        };
        entry.session.status = TransferStatus::InProgress;
        if let Some(size) = entry.session.files.get(file_index).map(|f| f.size) {
            entry.session.transferred_bytes += size;
        }
        let percent = if entry.session.total_bytes > 0 {
            100.0 * entry.session.transferred_bytes as f64 / entry.session.total_bytes as f64
        } else {
            0.0
        };
        let _ = self.events.send(WarpDeckEvent::TransferProgressUpdate {
            transfer_id: transfer_id.to_string(),
            percent: percent as f32,
            bytes_transferred: entry.session.transferred_bytes,
        });
    }

    /// Sender-side completion once every file has uploaded successfully.
    pub fn mark_sending_completed(&self, transfer_id: &str) {
        let mut sessions = self.sessions.lock();
        if let Some(entry) = sessions.get_mut(transfer_id) {
            entry.session.status = TransferStatus::Completed;
        }
        cleanup_locked(&mut sessions, transfer_id);
        let _ = self.events.send(WarpDeckEvent::TransferCompleted {
            transfer_id: transfer_id.to_string(),
            success: true,
            error_message: None,
        });
    }

    /// Sender-side failure: transport error during `request_transfer` or
    /// any `upload_file` call.
    pub fn mark_sending_failed(&self, transfer_id: &str, message: &str) {
        let mut sessions = self.sessions.lock();
        if let Some(entry) = sessions.get_mut(transfer_id) {
            entry.session.status = TransferStatus::Failed;
            entry.session.error = Some(message.to_string());
        }
        cleanup_locked(&mut sessions, transfer_id);
        let _ = self.events.send(WarpDeckEvent::TransferCompleted {
            transfer_id: transfer_id.to_string(),
            success: false,
            error_message: Some(message.to_string()),
        });
    }

    /// Copy of a session's file list and destination, used by the sender
    /// loop without holding the lock across network I/O.
    pub fn file_paths_for_sending(&self, transfer_id: &str) -> Option<Vec<FileMetadata>> {
        self.sessions
            .lock()
            .get(transfer_id)
            .map(|e| e.session.files.clone())
    }
}

/// Removes every temp file referenced by the session and erases it from the
/// active map. Idempotent; swallows I/O errors since cleanup is best-effort.
fn cleanup_locked(sessions: &mut HashMap<String, SessionEntry>, transfer_id: &str) {
    if let Some(entry) = sessions.remove(transfer_id) {
        for path in entry.temp_paths.into_iter().flatten() {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!("cleanup: failed to remove temp file {}: {e}", path.display());
            }
        }
    }
}

fn create_temporary_file(destination_folder: &str, transfer_id: &str, file_index: usize) -> Result<PathBuf> {
    let temp_dir = Path::new(destination_folder).join(TEMP_SUBDIR);
    std::fs::create_dir_all(&temp_dir)?;
    let path = temp_dir.join(format!("{transfer_id}_{file_index}.tmp"));
    std::fs::File::create(&path)?;
    Ok(path)
}

fn append_to_file(path: &Path, data: &[u8]) -> Result<()> {
    let mut file = std::fs::OpenOptions::new().append(true).open(path)?;
    file.write_all(data)?;
    Ok(())
}

/// Ensures the destination directory exists, then atomically renames the
/// temp file onto `destination_folder/sanitize(file_name)`. Rejecting `..`
/// and absolute-path components guards against a peer-supplied name
/// escaping the destination folder.
fn finalize_received_file(destination_folder: &str, temp_path: &Path, file_name: &str) -> Result<()> {
    let dest_dir = Path::new(destination_folder);
    std::fs::create_dir_all(dest_dir)?;
    let final_path = dest_dir.join(sanitize_filename(file_name));
    std::fs::rename(temp_path, &final_path)?;
    info!("finalized received file: {}", final_path.display());
    Ok(())
}

fn sanitize_filename(name: &str) -> String {
    Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty() && *n != "." && *n != "..")
        .unwrap_or("unnamed")
        .to_string()
}

fn sha256_hex_of_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::unbounded_channel;

    fn manager() -> (Arc<TransferManager>, tokio::sync::mpsc::UnboundedReceiver<WarpDeckEvent>) {
        let (tx, rx) = unbounded_channel();
        (TransferManager::new(tx), rx)
    }

    #[test]
    fn initiate_transfer_skips_missing_files_and_returns_none_if_all_missing() {
        let (mgr, _rx) = manager();
        let result = mgr
            .initiate_transfer("peer-1", "Peer One", &[PathBuf::from("/no/such/file")])
            .unwrap();
        assert!(result.is_none());
        assert!(mgr.active_transfers().is_empty());
    }

    #[test]
    fn initiate_transfer_hashes_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("report.pdf");
        std::fs::write(&file_path, b"hello world").unwrap();

        let (mgr, _rx) = manager();
        let id = mgr
            .initiate_transfer("peer-1", "Peer One", &[file_path])
            .unwrap()
            .expect("transfer should be created");

        let session = mgr.get_transfer(&id).unwrap();
        assert_eq!(session.status, TransferStatus::PendingApproval);
        assert_eq!(session.files[0].size, 11);
        assert!(session.files[0].hash.is_some());
    }

    #[test]
    fn respond_to_transfer_ignored_outside_pending_approval() {
        let dir = tempfile::tempdir().unwrap();
        let (mgr, _rx) = manager();
        let request = TxRequest {
            files: vec![FileMetadata {
                name: "a.txt".to_string(),
                size: 1,
                hash: None,
            }],
        };
        let (id, _rx_approval) =
            mgr.handle_incoming_request("peer-1", "Peer One", request, dir.path().to_path_buf());

        mgr.respond_to_transfer(&id, true).unwrap();
        assert_eq!(mgr.get_transfer(&id).unwrap().status, TransferStatus::Approved);

        // A second, contradictory call in a non-PENDING_APPROVAL state is ignored.
        mgr.respond_to_transfer(&id, false).unwrap();
        assert_eq!(mgr.get_transfer(&id).unwrap().status, TransferStatus::Approved);
    }

    #[test]
    fn declining_sets_cancelled_with_declined_message() {
        let dir = tempfile::tempdir().unwrap();
        let (mgr, _rx) = manager();
        let request = TxRequest {
            files: vec![FileMetadata {
                name: "a.txt".to_string(),
                size: 1,
                hash: None,
            }],
        };
        let (id, rx_approval) =
            mgr.handle_incoming_request("peer-1", "Peer One", request, dir.path().to_path_buf());

        mgr.respond_to_transfer(&id, false).unwrap();
        assert!(mgr.get_transfer(&id).is_none(), "terminal session is cleaned up");
        assert_eq!(rx_approval.blocking_recv(), Ok(false));
    }

    #[test]
    fn zero_byte_file_completes_with_single_progress_event() {
        let dir = tempfile::tempdir().unwrap();
        let (mgr, mut rx) = manager();
        let request = TxRequest {
            files: vec![FileMetadata {
                name: "empty.bin".to_string(),
                size: 0,
                hash: None,
            }],
        };
        let (id, _rx_approval) =
            mgr.handle_incoming_request("peer-1", "Peer One", request, dir.path().to_path_buf());
        mgr.respond_to_transfer(&id, true).unwrap();
        mgr.handle_file_upload(&id, 0, &[]).unwrap();

        assert!(dir.path().join("empty.bin").exists());

        let mut saw_progress = false;
        let mut saw_completed = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                WarpDeckEvent::TransferProgressUpdate { percent, .. } => {
                    assert_eq!(percent, 0.0);
                    saw_progress = true;
                }
                WarpDeckEvent::TransferCompleted { success, .. } => {
                    assert!(success);
                    saw_completed = true;
                }
                _ => {}
            }
        }
        assert!(saw_progress && saw_completed);
    }

    #[test]
    fn path_traversal_in_file_name_is_sanitized() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("/etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("report.pdf"), "report.pdf");
    }

    #[test]
    fn cancel_transfer_is_noop_in_terminal_state() {
        let dir = tempfile::tempdir().unwrap();
        let (mgr, _rx) = manager();
        let file_path = dir.path().join("f.bin");
        std::fs::write(&file_path, b"x").unwrap();
        let id = mgr
            .initiate_transfer("peer-1", "Peer One", &[file_path])
            .unwrap()
            .unwrap();

        mgr.cancel_transfer(&id);
        assert!(mgr.get_transfer(&id).is_none());
        // Cancelling an already-cleaned-up id is a no-op, not an error.
        mgr.cancel_transfer(&id);
    }
}
