//! Protocol Client: the HTTP-over-TLS calls the sender side makes against a
//! peer's Protocol Server. Each call pins the server certificate to a single
//! expected fingerprint and fails closed before any request body is sent.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::Request;
use hyper_util::rt::TokioIo;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::error::WarpDeckError;
use crate::identity::{fingerprint_of_der, IdentityStore};
use crate::model::{ClientResponse, TxRequest};
use crate::tls::{ensure_crypto_provider, load_private_key_pem};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// One client-side call against `(host, port, expected_fingerprint)`.
/// Stateless: each call opens a fresh TLS connection.
pub struct ProtocolClient {
    identity: Arc<IdentityStore>,
}

impl ProtocolClient {
    pub fn new(identity: Arc<IdentityStore>) -> Self {
        ensure_crypto_provider();
        Self { identity }
    }

    pub async fn get_device_info(
        &self,
        host: &str,
        port: u16,
        expected_fingerprint: &str,
    ) -> ClientResponse {
        self.call(host, port, expected_fingerprint, |sender| async move {
            let req = Request::builder()
                .method("GET")
                .uri("/api/v1/info")
                .body(Full::new(Bytes::new()))
                .map_err(WarpDeckError::HttpInvalid)?;
            send(sender, req).await
        })
        .await
    }

    pub async fn request_transfer(
        &self,
        host: &str,
        port: u16,
        expected_fingerprint: &str,
        request: &TxRequest,
    ) -> ClientResponse {
        let body = match serde_json::to_vec(request) {
            Ok(b) => b,
            Err(e) => return ClientResponse::transport_failure(e.to_string()),
        };
        self.call(host, port, expected_fingerprint, |sender| async move {
            let req = Request::builder()
                .method("POST")
                .uri("/api/v1/transfer/request")
                .header("content-type", "application/json")
                .body(Full::new(Bytes::from(body)))
                .map_err(WarpDeckError::HttpInvalid)?;
            send(sender, req).await
        })
        .await
    }

    pub async fn upload_file(
        &self,
        host: &str,
        port: u16,
        expected_fingerprint: &str,
        transfer_id: &str,
        index: usize,
        bytes: Vec<u8>,
    ) -> ClientResponse {
        let path = format!("/api/v1/transfer/{transfer_id}/{index}");
        self.call(host, port, expected_fingerprint, |sender| async move {
            let req = Request::builder()
                .method("POST")
                .uri(path)
                .header("content-type", "application/octet-stream")
                .body(Full::new(Bytes::from(bytes)))
                .map_err(WarpDeckError::HttpInvalid)?;
            send(sender, req).await
        })
        .await
    }

    /// Shared connect-handshake-request pipeline: builds a pinned-fingerprint
    /// TLS connection, drives one HTTP/1.1 request through it, and maps every
    /// failure mode onto a `ClientResponse`.
    async fn call<F, Fut>(&self, host: &str, port: u16, expected_fingerprint: &str, make_request: F) -> ClientResponse
    where
        F: FnOnce(hyper::client::conn::http1::SendRequest<Full<Bytes>>) -> Fut,
        Fut: std::future::Future<Output = crate::error::Result<ClientResponse>>,
    {
        let connect = async {
            let tcp = TcpStream::connect((host, port))
                .await
                .map_err(|e| WarpDeckError::Network(format!("connect to {host}:{port} failed: {e}")))?;
            tcp.set_nodelay(true).ok();

            let tls_config = build_client_tls_config(&self.identity, expected_fingerprint)?;
            let connector = TlsConnector::from(Arc::new(tls_config));
            let server_name = ServerName::try_from(host.to_string())
                .map_err(|_| WarpDeckError::Network(format!("invalid server name: {host}")))?;

            let tls_stream = connector
                .connect(server_name, tcp)
                .await
                .map_err(|e| WarpDeckError::Network(format!("TLS handshake failed: {e}")))?;

            let (sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(tls_stream))
                .await
                .map_err(WarpDeckError::Http)?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    debug!("client connection closed: {e}");
                }
            });

            Ok::<_, WarpDeckError>(sender)
        };

        let sender = match tokio::time::timeout(CONNECT_TIMEOUT, connect).await {
            Ok(Ok(sender)) => sender,
            Ok(Err(e)) => return ClientResponse::transport_failure(e.to_string()),
            Err(_) => return ClientResponse::transport_failure("connect timed out"),
        };

        match tokio::time::timeout(REQUEST_TIMEOUT, make_request(sender)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => ClientResponse::transport_failure(e.to_string()),
            Err(_) => ClientResponse::transport_failure("request timed out"),
        }
    }
}

async fn send(
    mut sender: hyper::client::conn::http1::SendRequest<Full<Bytes>>,
    req: Request<Full<Bytes>>,
) -> crate::error::Result<ClientResponse> {
    let response = sender.send_request(req).await.map_err(WarpDeckError::Http)?;
    let status_code = response.status().as_u16();
    let body = response
        .into_body()
        .collect()
        .await
        .map_err(WarpDeckError::Http)?
        .to_bytes()
        .to_vec();
    let success = (200..300).contains(&status_code);
    let error_message = if success {
        None
    } else {
        serde_json::from_slice::<crate::model::ErrorEnvelope>(&body)
            .ok()
            .map(|e| e.message)
    };
    Ok(ClientResponse {
        status_code,
        body,
        success,
        error_message,
    })
}

fn build_client_tls_config(
    identity: &Arc<IdentityStore>,
    expected_fingerprint: &str,
) -> crate::error::Result<rustls::ClientConfig> {
    let cert = identity.cert_der();
    let key = load_private_key_pem(&identity.key_pem())?;

    let verifier = Arc::new(PinnedFingerprintVerifier {
        expected_fingerprint: expected_fingerprint.to_string(),
    });

    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_client_auth_cert(vec![cert], key)?;

    Ok(config)
}

/// Pins the server certificate to a single expected fingerprint, computed
/// the same SHA-256-over-DER way as the identity store. Any mismatch fails
/// the handshake before any request body is sent.
#[derive(Debug)]
struct PinnedFingerprintVerifier {
    expected_fingerprint: String,
}

impl ServerCertVerifier for PinnedFingerprintVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let actual = fingerprint_of_der(end_entity);
        if actual == self.expected_fingerprint {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::General(format!(
                "fingerprint mismatch: expected {}, got {actual}",
                self.expected_fingerprint
            )))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
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
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
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
    fn mismatched_fingerprint_is_rejected_before_any_request() {
        let verifier = PinnedFingerprintVerifier {
            expected_fingerprint: "aaaa".to_string(),
        };
        let fake_der = CertificateDer::from(vec![1, 2, 3, 4]);
        let result = verifier.verify_server_cert(
            &fake_der,
            &[],
            &ServerName::try_from("example.invalid").unwrap(),
            &[],
            UnixTime::now(),
        );
        assert!(result.is_err());
    }
}
