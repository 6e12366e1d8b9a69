//! TLS connector for gateway connections

use crate::config::TlsOptions;
use crate::error::TunnelError;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

/// TLS stream to a gateway
pub type GatewayStream = TlsStream<TcpStream>;

/// Opens TLS connections to gateway addresses with a chosen SNI
///
/// The SNI is independent of the dialed address: the control channel and its
/// sessions dial a resolved gateway IP while the SNI carries the routing key.
#[derive(Clone)]
pub struct GatewayConnector {
    connector: TlsConnector,
    port: u16,
}

impl GatewayConnector {
    pub fn new(options: &TlsOptions, port: u16) -> Result<Self, TunnelError> {
        ensure_crypto_provider();

        let config = if options.verify_server_certificate {
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

            for der in &options.extra_root_certificates {
                roots
                    .add(CertificateDer::from(der.clone()))
                    .map_err(|e| TunnelError::Tls(format!("invalid root certificate: {}", e)))?;
            }

            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        } else {
            warn!("Gateway certificate verification is disabled");
            rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(SkipVerification::new())
                .with_no_client_auth()
        };

        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
            port,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Dial `host` on the gateway port and complete a TLS handshake
    /// presenting `server_name` as SNI
    pub async fn connect(
        &self,
        host: &str,
        server_name: &str,
    ) -> Result<GatewayStream, TunnelError> {
        let sni = ServerName::try_from(server_name.to_string())
            .map_err(|_| TunnelError::InvalidServerName(server_name.to_string()))?;

        let tcp = TcpStream::connect((host, self.port))
            .await
            .map_err(|source| TunnelError::Connect {
                host: host.to_string(),
                source,
            })?;
        let _ = tcp.set_nodelay(true);

        debug!(host, port = self.port, sni = server_name, "TCP connected, starting TLS");

        self.connector
            .connect(sni, tcp)
            .await
            .map_err(|e| TunnelError::Tls(format!("handshake with {} failed: {}", host, e)))
    }
}

static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        // Err means another provider is already installed
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Accepts any certificate chain but still checks handshake signatures
#[derive(Debug)]
struct SkipVerification {
    provider: CryptoProvider,
}

impl SkipVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            provider: rustls::crypto::ring::default_provider(),
        })
    }
}

impl ServerCertVerifier for SkipVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
