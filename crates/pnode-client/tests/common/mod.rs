//! In-process TLS gateway for integration tests

#![allow(dead_code)]

use pnode_client::TunnelConfigBuilder;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

pub const ACCEPT_TIMEOUT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("pnode_client=debug")
        .with_test_writer()
        .try_init();
}

/// A gateway accepting agent connections on one address
pub struct TestGateway {
    listener: TcpListener,
    acceptor: TlsAcceptor,
}

/// An accepted agent connection and the SNI it presented
pub struct Accepted {
    pub stream: TlsStream<TcpStream>,
    pub server_name: String,
}

impl TestGateway {
    pub async fn bind(ip: &str) -> Self {
        Self::bind_at(format!("{}:0", ip).parse().unwrap()).await
    }

    pub async fn bind_at(addr: SocketAddr) -> Self {
        let _ = rustls::crypto::ring::default_provider().install_default();

        let certified = rcgen::generate_simple_self_signed(vec!["*.localhost".into()]).unwrap();
        let cert = CertificateDer::from(certified.cert.der().to_vec());
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
            certified.key_pair.serialize_der(),
        ));

        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert], key)
            .unwrap();

        Self {
            listener: TcpListener::bind(addr).await.unwrap(),
            acceptor: TlsAcceptor::from(Arc::new(config)),
        }
    }

    pub fn port(&self) -> u16 {
        self.listener.local_addr().unwrap().port()
    }

    pub async fn accept(&self) -> Accepted {
        tokio::time::timeout(ACCEPT_TIMEOUT, self.try_accept())
            .await
            .expect("no agent connection within timeout")
    }

    async fn try_accept(&self) -> Accepted {
        let (tcp, _) = self.listener.accept().await.unwrap();
        let stream = self.acceptor.accept(tcp).await.unwrap();
        let server_name = stream
            .get_ref()
            .1
            .server_name()
            .unwrap_or_default()
            .to_string();

        Accepted {
            stream,
            server_name,
        }
    }

    /// True if an agent connects within `within`
    pub async fn connects_within(&self, within: Duration) -> bool {
        tokio::time::timeout(within, self.listener.accept())
            .await
            .is_ok()
    }
}

impl Accepted {
    pub async fn read_frame(&mut self, len: usize) -> Vec<u8> {
        let mut frame = vec![0u8; len];
        tokio::time::timeout(ACCEPT_TIMEOUT, self.stream.read_exact(&mut frame))
            .await
            .expect("frame not received within timeout")
            .unwrap();
        frame
    }

    pub async fn push(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
        self.stream.flush().await.unwrap();
    }

    /// Wait until the agent closes its side
    pub async fn expect_closed(&mut self) {
        let mut buf = [0u8; 64];
        let result = tokio::time::timeout(ACCEPT_TIMEOUT, self.stream.read(&mut buf))
            .await
            .expect("agent did not close the connection");
        // close_notify reads as EOF; an abrupt close as an error
        if let Ok(n) = result {
            assert_eq!(n, 0, "unexpected data from agent");
        }
    }
}

/// Config for a gateway on loopback with certificate checks off
pub fn loopback_config(gateway_port: u16, local_port: u16) -> TunnelConfigBuilder {
    pnode_client::TunnelConfig::builder()
        .domain("localhost")
        .gateway_port(gateway_port)
        .local_host("127.0.0.1")
        .local_port(local_port)
        .verify_server_certificate(false)
}

/// Echo server standing in for the local service
pub async fn spawn_echo_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });

    port
}

pub fn random_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
