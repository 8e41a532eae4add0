pub mod config;
pub mod discovery;
pub mod error;
pub mod events;
pub mod facade;
pub mod identity;
pub mod logging;
pub mod model;
pub mod protocol_client;
pub mod server;
pub mod tls;
pub mod transfer;

pub use config::WarpDeckConfig;
pub use error::{Result, WarpDeckError};
pub use events::{WarpDeckEvent, WarpDeckEventHandler};
pub use facade::WarpDeck;
pub use logging::init_tracing;
pub use model::{
    ClientResponse, DeviceInfo, ErrorEnvelope, FileMetadata, HealthResponse, PeerRecord,
    TransferDirection, TransferSession, TransferStatus, TrustedPeerRecord, TxRequest, TxResponse,
};
