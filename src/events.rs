//! Event Surface: the six embedder-facing callbacks, dispatched through a
//! single channel owned by the facade rather than by cyclic back-references
//! between the discovery engine, protocol server and transfer state machine.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::error;

use crate::model::PeerRecord;

/// One occurrence of any of the six embedder callbacks, carried over the
/// event channel from whichever subsystem produced it.
#[derive(Debug, Clone)]
pub enum WarpDeckEvent {
    PeerDiscovered(PeerRecord),
    PeerLost(String),
    IncomingTransferRequest {
        transfer_id: String,
        peer_name: String,
        files: Vec<crate::model::FileMetadata>,
    },
    TransferProgressUpdate {
        transfer_id: String,
        percent: f32,
        bytes_transferred: u64,
    },
    TransferCompleted {
        transfer_id: String,
        success: bool,
        error_message: Option<String>,
    },
    Error(String),
}

/// The embedder implements this trait to receive the six callbacks. Methods
/// return `()`; a panicking implementation is caught and discarded by the
/// dispatcher so a misbehaving embedder can never crash the core.
pub trait WarpDeckEventHandler: Send + Sync {
    fn on_peer_discovered(&self, peer: PeerRecord) {
        let _ = peer;
    }
    fn on_peer_lost(&self, device_id: String) {
        let _ = device_id;
    }
    fn on_incoming_transfer_request(
        &self,
        transfer_id: String,
        peer_name: String,
        files: Vec<crate::model::FileMetadata>,
    ) {
        let _ = (transfer_id, peer_name, files);
    }
    fn on_transfer_progress_update(&self, transfer_id: String, percent: f32, bytes_transferred: u64) {
        let _ = (transfer_id, percent, bytes_transferred);
    }
    fn on_transfer_completed(
        &self,
        transfer_id: String,
        success: bool,
        error_message: Option<String>,
    ) {
        let _ = (transfer_id, success, error_message);
    }
    fn on_error(&self, message: String) {
        let _ = message;
    }
}

/// Owns the event channel and the background dispatch task. Every
/// subsystem is given a clone of the `sender()`; only the dispatcher ever
/// drains the receiver and invokes the embedder's handler.
pub struct EventDispatcher {
    sender: UnboundedSender<WarpDeckEvent>,
}

impl EventDispatcher {
    /// Spawns the dispatch task on the current tokio runtime and returns a
    /// handle whose `sender()` subsystems publish events onto.
    pub fn spawn(handler: Arc<dyn WarpDeckEventHandler>) -> Self {
        let (sender, receiver) = unbounded_channel();
        tokio::spawn(dispatch_loop(receiver, handler));
        Self { sender }
    }

    pub fn sender(&self) -> UnboundedSender<WarpDeckEvent> {
        self.sender.clone()
    }
}

async fn dispatch_loop(
    mut receiver: UnboundedReceiver<WarpDeckEvent>,
    handler: Arc<dyn WarpDeckEventHandler>,
) {
    while let Some(event) = receiver.recv().await {
        dispatch_one(&handler, event);
    }
}

fn dispatch_one(handler: &Arc<dyn WarpDeckEventHandler>, event: WarpDeckEvent) {
    let result = std::panic::catch_unwind(AssertUnwindSafe(|| match event {
        WarpDeckEvent::PeerDiscovered(peer) => handler.on_peer_discovered(peer),
        WarpDeckEvent::PeerLost(device_id) => handler.on_peer_lost(device_id),
        WarpDeckEvent::IncomingTransferRequest {
            transfer_id,
            peer_name,
            files,
        } => handler.on_incoming_transfer_request(transfer_id, peer_name, files),
        WarpDeckEvent::TransferProgressUpdate {
            transfer_id,
            percent,
            bytes_transferred,
        } => handler.on_transfer_progress_update(transfer_id, percent, bytes_transferred),
        WarpDeckEvent::TransferCompleted {
            transfer_id,
            success,
            error_message,
        } => handler.on_transfer_completed(transfer_id, success, error_message),
        WarpDeckEvent::Error(message) => handler.on_error(message),
    }));

    if let Err(panic) = result {
        error!("embedder event handler panicked, dropping: {panic:?}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct PanickingHandler;
    impl WarpDeckEventHandler for PanickingHandler {
        fn on_error(&self, _message: String) {
            panic!("embedder handler exploded");
        }
    }

    struct CountingHandler {
        count: AtomicUsize,
    }
    impl WarpDeckEventHandler for CountingHandler {
        fn on_peer_lost(&self, _device_id: String) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn panicking_handler_does_not_stop_dispatch() {
        let handler: Arc<dyn WarpDeckEventHandler> = Arc::new(PanickingHandler);
        dispatch_one(&handler, WarpDeckEvent::Error("boom".to_string()));
    }

    #[tokio::test]
    async fn dispatcher_delivers_events_in_order() {
        let counting = Arc::new(CountingHandler {
            count: AtomicUsize::new(0),
        });
        let handler: Arc<dyn WarpDeckEventHandler> = counting.clone();
        let dispatcher = EventDispatcher::spawn(handler);
        let sender = dispatcher.sender();
        sender.send(WarpDeckEvent::PeerLost("a".to_string())).unwrap();
        sender.send(WarpDeckEvent::PeerLost("b".to_string())).unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(counting.count.load(Ordering::SeqCst), 2);
    }
}
