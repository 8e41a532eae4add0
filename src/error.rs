use thiserror::Error;

/// Errors surfaced by the daemon. Variants map onto the seven error kinds in
/// the error-handling design: configuration, identity, discovery, network,
/// protocol, trust, and local I/O.
#[derive(Error, Debug)]
pub enum WarpDeckError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("identity error: {0}")]
    Identity(String),

    #[error("discovery error: {0}")]
    Discovery(String),

    #[error("mDNS error: {0}")]
    Mdns(#[from] mdns_sd::Error),

    #[error("network error: {0}")]
    Network(String),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("certificate generation error: {0}")]
    CertGen(#[from] rcgen::Error),

    #[error("RSA key error: {0}")]
    RsaKey(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("fingerprint mismatch: expected {expected}, got {actual}")]
    FingerprintMismatch { expected: String, actual: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("invalid http message: {0}")]
    HttpInvalid(#[from] hyper::http::Error),

    #[error("not initialized")]
    NotInitialized,

    #[error("already running")]
    AlreadyRunning,

    #[error("no ports available in scan range")]
    NoPortAvailable,

    #[error("transfer not found: {0}")]
    TransferNotFound(String),
}

pub type Result<T> = std::result::Result<T, WarpDeckError>;

/// The wire-level error codes used in the HTTP error envelope (`SCREAMING_SNAKE`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolErrorCode {
    InvalidRequest,
    UserDeclined,
    UploadFailed,
    NotFound,
    ServerError,
}

impl ProtocolErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ProtocolErrorCode::InvalidRequest => "INVALID_REQUEST",
            ProtocolErrorCode::UserDeclined => "USER_DECLINED",
            ProtocolErrorCode::UploadFailed => "UPLOAD_FAILED",
            ProtocolErrorCode::NotFound => "NOT_FOUND",
            ProtocolErrorCode::ServerError => "SERVER_ERROR",
        }
    }

    pub fn status_code(self) -> u16 {
        match self {
            ProtocolErrorCode::InvalidRequest => 400,
            ProtocolErrorCode::UserDeclined => 403,
            ProtocolErrorCode::UploadFailed => 500,
            ProtocolErrorCode::NotFound => 404,
            ProtocolErrorCode::ServerError => 500,
        }
    }
}
