//! Protocol Server: the HTTP-over-TLS surface peers dial into. Accepts any
//! client certificate at the TLS layer and defers the trust decision to the
//! application layer via `TransferManager::handle_incoming_request`, which
//! holds the HTTP response open until the embedder accepts or declines.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use rustls::pki_types::CertificateDer;
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{DigitallySignedStruct, DistinguishedName, SignatureScheme};
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::config::{APPROVAL_EXPIRY_SECS, PORT_SCAN_END, PORT_SCAN_START};
use crate::discovery::DiscoveryEngine;
use crate::error::{ProtocolErrorCode, Result, WarpDeckError};
use crate::identity::{fingerprint_of_der, IdentityStore};
use crate::model::{self, DeviceInfo, ErrorEnvelope, HealthResponse, TxRequest, TxResponse};
use crate::tls::{ensure_crypto_provider, load_private_key_pem};
use crate::transfer::TransferManager;

type BoxBody = Full<Bytes>;

/// Owns the bound listener and the background accept loop. Dropping or
/// calling `shutdown()` stops accepting new connections; connections already
/// in flight are allowed to finish.
pub struct ProtocolServer {
    port: u16,
    shutdown: Arc<Notify>,
}

#[derive(Clone)]
struct ServerState {
    identity: Arc<IdentityStore>,
    discovery: Arc<DiscoveryEngine>,
    transfer_manager: Arc<TransferManager>,
    device_info: DeviceInfo,
    download_dir: PathBuf,
    port: u16,
    auto_accept_trusted: bool,
}

impl ProtocolServer {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn shutdown(&self) {
        self.shutdown.notify_waiters();
    }

    /// Binds the listener (scanning `[54321, 65535)` when `desired_port == 0`,
    /// otherwise the exact port), builds the mandatory-client-auth TLS
    /// configuration, and spawns the accept loop.
    pub async fn start(
        desired_port: u16,
        identity: Arc<IdentityStore>,
        discovery: Arc<DiscoveryEngine>,
        transfer_manager: Arc<TransferManager>,
        device_info: DeviceInfo,
        download_dir: PathBuf,
        auto_accept_trusted: bool,
    ) -> Result<Self> {
        ensure_crypto_provider();
        let (listener, port) = bind_listener(desired_port).await?;
        let tls_config = build_server_tls_config(&identity)?;
        let acceptor = TlsAcceptor::from(Arc::new(tls_config));
        let shutdown = Arc::new(Notify::new());

        let state = ServerState {
            identity,
            discovery,
            transfer_manager,
            device_info,
            download_dir,
            port,
            auto_accept_trusted,
        };

        let accept_shutdown = shutdown.clone();
        tokio::spawn(async move {
            accept_loop(listener, acceptor, state, accept_shutdown).await;
        });

        info!(port, "protocol server listening");
        Ok(Self { port, shutdown })
    }
}

impl Drop for ProtocolServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn bind_listener(desired_port: u16) -> Result<(TcpListener, u16)> {
    if desired_port != 0 {
        let listener = TcpListener::bind(("0.0.0.0", desired_port))
            .await
            .map_err(|e| WarpDeckError::Network(format!("bind {desired_port} failed: {e}")))?;
        return Ok((listener, desired_port));
    }

    for port in PORT_SCAN_START..PORT_SCAN_END {
        if let Ok(listener) = TcpListener::bind(("0.0.0.0", port)).await {
            return Ok((listener, port));
        }
    }

    Err(WarpDeckError::NoPortAvailable)
}

fn build_server_tls_config(identity: &Arc<IdentityStore>) -> Result<rustls::ServerConfig> {
    let cert = identity.cert_der();
    let key_pem = identity.key_pem();
    let key = load_private_key_pem(&key_pem)?;

    let verifier = Arc::new(AlwaysAcceptClientVerifier);
    let config = rustls::ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(vec![cert], key)?;

    Ok(config)
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    state: ServerState,
    shutdown: Arc<Notify>,
) {
    loop {
        tokio::select! {
            _ = shutdown.notified() => {
                debug!("protocol server accept loop shutting down");
                return;
            }
            accepted = listener.accept() => {
                let (tcp_stream, peer_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("accept failed: {e}");
                        continue;
                    }
                };
                let acceptor = acceptor.clone();
                let state = state.clone();
                tokio::spawn(async move {
                    serve_connection(tcp_stream, peer_addr, acceptor, state).await;
                });
            }
        }
    }
}

async fn serve_connection(
    tcp_stream: tokio::net::TcpStream,
    peer_addr: SocketAddr,
    acceptor: TlsAcceptor,
    state: ServerState,
) {
    let tls_stream = match acceptor.accept(tcp_stream).await {
        Ok(stream) => stream,
        Err(e) => {
            debug!("TLS handshake with {peer_addr} failed: {e}");
            return;
        }
    };

    let fingerprint = tls_stream
        .get_ref()
        .1
        .peer_certificates()
        .and_then(|certs| certs.first())
        .map(fingerprint_of_der)
        .unwrap_or_default();

    let service = hyper::service::service_fn(move |req: Request<Incoming>| {
        let state = state.clone();
        let fingerprint = fingerprint.clone();
        async move { Ok::<_, std::convert::Infallible>(route(req, state, fingerprint).await) }
    });

    if let Err(e) = hyper::server::conn::http1::Builder::new()
        .serve_connection(TokioIo::new(tls_stream), service)
        .await
    {
        debug!("connection with {peer_addr} ended: {e}");
    }
}

async fn route(req: Request<Incoming>, state: ServerState, fingerprint: String) -> Response<BoxBody> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    match (method, path.as_str()) {
        (hyper::Method::GET, "/api/v1/info") => info_response(&state),
        (hyper::Method::GET, "/health") => health_response(&state),
        (hyper::Method::POST, "/api/v1/transfer/request") => {
            transfer_request_response(req, state, fingerprint).await
        }
        (hyper::Method::POST, path) if path.starts_with("/api/v1/transfer/") => {
            upload_response(req, state, path).await
        }
        _ => error_response(ProtocolErrorCode::NotFound, "no such route"),
    }
}

fn info_response(state: &ServerState) -> Response<BoxBody> {
    json_response(StatusCode::OK, &state.device_info)
}

fn health_response(state: &ServerState) -> Response<BoxBody> {
    let body = HealthResponse {
        status: "healthy".to_string(),
        service: "warpdeck".to_string(),
        timestamp: model::now_iso8601(),
        port: state.port,
    };
    json_response(StatusCode::OK, &body)
}

async fn transfer_request_response(
    req: Request<Incoming>,
    state: ServerState,
    fingerprint: String,
) -> Response<BoxBody> {
    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            return error_response(ProtocolErrorCode::InvalidRequest, &format!("body read failed: {e}"))
        }
    };

    let request: TxRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            return error_response(ProtocolErrorCode::InvalidRequest, &format!("invalid JSON: {e}"))
        }
    };

    let peer = state
        .discovery
        .list_peers()
        .into_iter()
        .find(|p| p.fingerprint == fingerprint);
    let peer_device_id = peer
        .as_ref()
        .map(|p| p.device_id.clone())
        .unwrap_or_else(|| fingerprint.clone());
    let peer_name = peer
        .map(|p| p.name)
        .unwrap_or_else(|| "Unknown Device".to_string());

    let (transfer_id, approval_rx) = state.transfer_manager.handle_incoming_request(
        &peer_device_id,
        &peer_name,
        request,
        state.download_dir.clone(),
    );

    if state.auto_accept_trusted && state.identity.is_trusted(&peer_device_id, &fingerprint) {
        if let Err(e) = state.transfer_manager.respond_to_transfer(&transfer_id, true) {
            return error_response(ProtocolErrorCode::ServerError, &e.to_string());
        }
    }

    let wait = tokio::time::timeout(
        std::time::Duration::from_secs(APPROVAL_EXPIRY_SECS),
        approval_rx,
    )
    .await;

    match wait {
        Ok(Ok(true)) => {
            let body = TxResponse {
                transfer_id,
                status: "ready_to_receive".to_string(),
                expires_at: model::expiry_iso8601(APPROVAL_EXPIRY_SECS),
            };
            json_response(StatusCode::ACCEPTED, &body)
        }
        Ok(Ok(false)) => error_response(ProtocolErrorCode::UserDeclined, "transfer declined"),
        Ok(Err(_)) => error_response(ProtocolErrorCode::ServerError, "approval channel closed"),
        Err(_) => {
            state.transfer_manager.expire_transfer(&transfer_id);
            error_response(ProtocolErrorCode::UserDeclined, "approval expired")
        }
    }
}

async fn upload_response(req: Request<Incoming>, state: ServerState, path: &str) -> Response<BoxBody> {
    let Some((transfer_id, index)) = parse_upload_path(path) else {
        return error_response(ProtocolErrorCode::InvalidRequest, "malformed upload path");
    };

    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            return error_response(ProtocolErrorCode::UploadFailed, &format!("body read failed: {e}"))
        }
    };

    match state
        .transfer_manager
        .handle_file_upload(&transfer_id, index, &body)
    {
        Ok(()) => Response::builder()
            .status(StatusCode::OK)
            .body(Full::new(Bytes::new()))
            .expect("valid empty 200 response"),
        Err(e) => error_response(ProtocolErrorCode::UploadFailed, &e.to_string()),
    }
}

/// Parses `/api/v1/transfer/{id}/{index}`.
fn parse_upload_path(path: &str) -> Option<(String, usize)> {
    let rest = path.strip_prefix("/api/v1/transfer/")?;
    let mut parts = rest.split('/');
    let id = parts.next()?.to_string();
    let index = parts.next()?.parse::<usize>().ok()?;
    if parts.next().is_some() || id.is_empty() {
        return None;
    }
    Some((id, index))
}

fn json_response<T: serde::Serialize>(status: StatusCode, body: &T) -> Response<BoxBody> {
    let bytes = serde_json::to_vec(body).unwrap_or_default();
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(bytes)))
        .expect("valid JSON response")
}

fn error_response(code: ProtocolErrorCode, message: &str) -> Response<BoxBody> {
    error!(error_code = code.as_str(), message, "protocol server error response");
    let envelope = ErrorEnvelope {
        error_code: code.as_str().to_string(),
        message: message.to_string(),
    };
    let status = StatusCode::from_u16(code.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    json_response(status, &envelope)
}

/// Accepts any client certificate at the TLS layer; the trust decision is
/// made at the application layer by `ServerState::auto_accept_trusted` and
/// the embedder's `respond_to_transfer` call.
#[derive(Debug)]
struct AlwaysAcceptClientVerifier;

impl ClientCertVerifier for AlwaysAcceptClientVerifier {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_upload_path() {
        assert_eq!(
            parse_upload_path("/api/v1/transfer/abc-123/2"),
            Some(("abc-123".to_string(), 2))
        );
    }

    #[test]
    fn rejects_malformed_upload_paths() {
        assert_eq!(parse_upload_path("/api/v1/transfer/abc-123"), None);
        assert_eq!(parse_upload_path("/api/v1/transfer/abc-123/x"), None);
        assert_eq!(parse_upload_path("/api/v1/transfer//2"), None);
        assert_eq!(parse_upload_path("/api/v1/transfer/abc/2/extra"), None);
    }
}
