//! End-to-end protocol tests driving two real `ProtocolServer`/`ProtocolClient`
//! pairs over a real TLS socket on localhost, without mDNS (fingerprints and
//! addresses are exchanged directly in-process rather than discovered).

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

use warpdeck_core::discovery::DiscoveryEngine;
use warpdeck_core::events::WarpDeckEvent;
use warpdeck_core::identity::IdentityStore;
use warpdeck_core::model::DeviceInfo;
use warpdeck_core::protocol_client::ProtocolClient;
use warpdeck_core::server::ProtocolServer;
use warpdeck_core::transfer::TransferManager;

struct Node {
    identity: Arc<IdentityStore>,
    transfer_manager: Arc<TransferManager>,
    server: ProtocolServer,
    events: UnboundedReceiver<WarpDeckEvent>,
}

async fn spin_up_node(name: &str, download_dir: PathBuf, auto_accept: bool) -> Node {
    let config_dir = tempfile::tempdir().unwrap().keep();
    let identity = IdentityStore::initialize(&config_dir).unwrap();
    let discovery = Arc::new(DiscoveryEngine::new(identity.device_id().to_string()).unwrap());
    let (tx, rx) = unbounded_channel();
    let transfer_manager = TransferManager::new(tx);

    let device_info = DeviceInfo {
        id: identity.device_id().to_string(),
        name: name.to_string(),
        platform: "linux".to_string(),
        protocol_version: "1.0".to_string(),
    };

    let server = ProtocolServer::start(
        0,
        identity.clone(),
        discovery,
        transfer_manager.clone(),
        device_info,
        download_dir,
        auto_accept,
    )
    .await
    .unwrap();

    Node {
        identity,
        transfer_manager,
        server,
        events: rx,
    }
}

/// A proposes a transfer to B, B accepts, the file arrives byte-for-byte and
/// both sides report `COMPLETED`.
#[tokio::test]
async fn accepted_transfer_delivers_file_and_completes_both_sides() {
    let send_dir = tempfile::tempdir().unwrap();
    let recv_dir = tempfile::tempdir().unwrap();

    let source_file = send_dir.path().join("report.pdf");
    std::fs::write(&source_file, b"hello from the sending side").unwrap();

    let mut receiver = spin_up_node("Receiver", recv_dir.path().to_path_buf(), false).await;
    let sender = spin_up_node("Sender", send_dir.path().to_path_buf(), false).await;

    let client = ProtocolClient::new(sender.identity.clone());
    let receiver_fingerprint = receiver.identity.fingerprint();

    let transfer_id = sender
        .transfer_manager
        .initiate_transfer("receiver-device", "Receiver", &[source_file.clone()])
        .unwrap()
        .expect("file exists, session should be created");

    let files = sender
        .transfer_manager
        .file_paths_for_sending(&transfer_id)
        .unwrap();

    let request_task = tokio::spawn({
        let client = ProtocolClient::new(sender.identity.clone());
        let fingerprint = receiver_fingerprint.clone();
        let port = receiver.server.port();
        async move {
            client
                .request_transfer(
                    "127.0.0.1",
                    port,
                    &fingerprint,
                    &warpdeck_core::model::TxRequest { files },
                )
                .await
        }
    });

    let incoming = match tokio::time::timeout(std::time::Duration::from_secs(5), receiver.events.recv())
        .await
        .expect("incoming transfer request should arrive")
    {
        Some(WarpDeckEvent::IncomingTransferRequest { transfer_id, .. }) => transfer_id,
        other => panic!("expected IncomingTransferRequest, got {other:?}"),
    };

    receiver
        .transfer_manager
        .respond_to_transfer(&incoming, true)
        .unwrap();

    let response = request_task.await.unwrap();
    assert!(response.success, "request_transfer should succeed: {response:?}");
    assert_eq!(response.status_code, 202);

    let bytes = std::fs::read(&source_file).unwrap();
    let upload = client
        .upload_file("127.0.0.1", receiver.server.port(), &receiver_fingerprint, &transfer_id, 0, bytes)
        .await;
    assert!(upload.success, "upload should succeed: {upload:?}");

    assert!(recv_dir.path().join("report.pdf").exists());
    assert_eq!(
        std::fs::read(recv_dir.path().join("report.pdf")).unwrap(),
        b"hello from the sending side"
    );
}

/// Scenario: B declines the incoming proposal; the sender sees a `403`
/// and no file is written on the receiver side.
#[tokio::test]
async fn declined_transfer_returns_403_and_writes_nothing() {
    let send_dir = tempfile::tempdir().unwrap();
    let recv_dir = tempfile::tempdir().unwrap();
    let source_file = send_dir.path().join("secret.txt");
    std::fs::write(&source_file, b"do not send me").unwrap();

    let mut receiver = spin_up_node("Receiver", recv_dir.path().to_path_buf(), false).await;
    let sender_config_dir = tempfile::tempdir().unwrap();
    let sender_identity = IdentityStore::initialize(sender_config_dir.path()).unwrap();
    let fingerprint = receiver.identity.fingerprint();
    let port = receiver.server.port();

    let request_task = tokio::spawn({
        let client = ProtocolClient::new(sender_identity);
        async move {
            client
                .request_transfer(
                    "127.0.0.1",
                    port,
                    &fingerprint,
                    &warpdeck_core::model::TxRequest {
                        files: vec![warpdeck_core::model::FileMetadata {
                            name: "secret.txt".to_string(),
                            size: 14,
                            hash: None,
                        }],
                    },
                )
                .await
        }
    });

    let incoming = match tokio::time::timeout(std::time::Duration::from_secs(5), receiver.events.recv())
        .await
        .expect("incoming transfer request should arrive")
    {
        Some(WarpDeckEvent::IncomingTransferRequest { transfer_id, .. }) => transfer_id,
        other => panic!("expected IncomingTransferRequest, got {other:?}"),
    };

    receiver
        .transfer_manager
        .respond_to_transfer(&incoming, false)
        .unwrap();

    let response = request_task.await.unwrap();
    assert!(!response.success);
    assert_eq!(response.status_code, 403);
    assert!(!recv_dir.path().join("secret.txt").exists());
}
